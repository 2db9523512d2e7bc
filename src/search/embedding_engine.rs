use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use model2vec_rs::model::StaticModel;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::api_connection::endpoints::{EmbeddingInputItem, EmbeddingRequest, Provider};
use crate::api_connection::JsonClient;
use crate::config::{EmbeddingBackend, EmbeddingSettings};
use crate::error::{Result, SearchError};
use crate::models::QueryInput;

/// Turns text (and, for some backends, images) into fixed-length vectors.
///
/// Every vector a provider returns has exactly [`dimension`](Self::dimension)
/// components; anything else is reported as `DimensionMismatch`.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync + fmt::Debug {
    fn model_name(&self) -> &str;

    fn dimension(&self) -> usize;

    /// One call to the underlying capability, outputs in input order.
    async fn embed(&self, inputs: &[QueryInput]) -> Result<Vec<Vec<f32>>>;

    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let inputs: Vec<QueryInput> = texts.iter().cloned().map(QueryInput::Text).collect();
        self.embed(&inputs).await
    }

    async fn embed_one(&self, input: &QueryInput) -> Result<Vec<f32>> {
        let mut vectors = self.embed(std::slice::from_ref(input)).await?;
        let vector = vectors
            .pop()
            .ok_or_else(|| SearchError::Remote("embedding provider returned no vector".into()))?;
        ensure_output_dimension(self.dimension(), &vector)?;
        Ok(vector)
    }
}

/// Rejects a provider answer whose shape breaks the contract.
pub fn validate_batch(dimension: usize, input_count: usize, vectors: &[Vec<f32>]) -> Result<()> {
    if vectors.len() != input_count {
        return Err(SearchError::Remote(format!(
            "embedding provider returned {} vectors for {} inputs",
            vectors.len(),
            input_count
        )));
    }
    for vector in vectors {
        ensure_output_dimension(dimension, vector)?;
    }
    Ok(())
}

fn ensure_output_dimension(dimension: usize, vector: &[f32]) -> Result<()> {
    if vector.len() != dimension {
        return Err(SearchError::DimensionMismatch {
            expected: dimension,
            actual: vector.len(),
        });
    }
    if vector.iter().any(|v| !v.is_finite()) {
        return Err(SearchError::Remote("embedding contains NaN or Infinity".into()));
    }
    Ok(())
}

/// In-process model2vec static embeddings. Text only.
pub struct StaticModelEmbedder {
    model: Arc<StaticModel>,
    model_id: String,
    dimension: usize,
}

impl fmt::Debug for StaticModelEmbedder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticModelEmbedder")
            .field("model_id", &self.model_id)
            .field("dimension", &self.dimension)
            .finish()
    }
}

impl StaticModelEmbedder {
    /// Loads (downloading on first use) the model and checks its output size
    /// against the configured dimension.
    pub fn new(model_id: &str, expected_dimension: usize) -> Result<Self> {
        info!(model = model_id, "loading static embedding model");
        let model = StaticModel::from_pretrained(model_id, None, None, None)
            .map_err(|e| SearchError::Config(format!("Failed to load model '{}': {}", model_id, e)))?;

        let probe = model.encode(&["dimension probe".to_string()]);
        let dimension = probe.first().map(Vec::len).unwrap_or(0);
        if dimension != expected_dimension {
            return Err(SearchError::Config(format!(
                "model '{}' produces {}-dimensional vectors but {} are configured",
                model_id, dimension, expected_dimension
            )));
        }
        Ok(Self {
            model: Arc::new(model),
            model_id: model_id.to_string(),
            dimension,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for StaticModelEmbedder {
    fn model_name(&self) -> &str {
        &self.model_id
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, inputs: &[QueryInput]) -> Result<Vec<Vec<f32>>> {
        let texts = inputs
            .iter()
            .map(|input| match input {
                QueryInput::Text(text) => Ok(text.clone()),
                QueryInput::Image { .. } => Err(SearchError::UnsupportedInput(format!(
                    "model '{}' cannot embed images",
                    self.model_id
                ))),
            })
            .collect::<Result<Vec<String>>>()?;
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        // Encoding is CPU-bound; keep it off the async workers.
        let model = Arc::clone(&self.model);
        let expected = texts.len();
        let vectors = tokio::task::spawn_blocking(move || model.encode(&texts))
            .await
            .map_err(|e| SearchError::Remote(format!("embedding task failed: {}", e)))?;
        validate_batch(self.dimension, expected, &vectors)?;
        Ok(vectors)
    }
}

/// Remote embedding endpoint (OpenAI dialect, images as data URLs).
#[derive(Debug)]
pub struct HttpEmbedder {
    provider: Provider,
    client: JsonClient,
    dimension: usize,
}

impl HttpEmbedder {
    pub fn new(provider: Provider, dimension: usize) -> Result<Self> {
        let client = provider.connect()?;
        info!(model = provider.model(), dimension, "HTTP embedding provider ready");
        Ok(Self {
            provider,
            client,
            dimension,
        })
    }

    fn to_wire(input: &QueryInput) -> EmbeddingInputItem {
        match input {
            QueryInput::Text(text) => EmbeddingInputItem::Text(text.clone()),
            QueryInput::Image { bytes, format } => EmbeddingInputItem::Image {
                image: image_data_url(bytes, format),
            },
        }
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbedder {
    fn model_name(&self) -> &str {
        self.provider.model()
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, inputs: &[QueryInput]) -> Result<Vec<Vec<f32>>> {
        if inputs.is_empty() {
            return Ok(Vec::new());
        }
        let request = EmbeddingRequest {
            model: self.provider.model().to_string(),
            input: inputs.iter().map(Self::to_wire).collect(),
            dimensions: Some(self.dimension),
            encoding_format: Some("float".to_string()),
        };
        debug!(count = inputs.len(), "requesting embeddings");
        let response = Provider::call_embeddings(&self.client, &request).await?;
        let vectors = response.into_ordered_vectors();
        validate_batch(self.dimension, inputs.len(), &vectors)?;
        Ok(vectors)
    }
}

pub fn image_data_url(bytes: &[u8], format: &str) -> String {
    let format = match format.trim().to_lowercase().as_str() {
        "jpg" | "" => "jpeg".to_string(),
        other => other.to_string(),
    };
    format!(
        "data:image/{};base64,{}",
        format,
        general_purpose::STANDARD.encode(bytes)
    )
}

pub fn build_embedder(settings: &EmbeddingSettings) -> Result<Arc<dyn EmbeddingProvider>> {
    match settings.backend {
        EmbeddingBackend::StaticModel => Ok(Arc::new(StaticModelEmbedder::new(
            &settings.model,
            settings.dimension,
        )?)),
        EmbeddingBackend::Http => {
            let provider = Provider::openai_compatible(
                &settings.endpoint,
                &settings.api_key_env,
                &settings.model,
                settings.timeout_secs,
            );
            Ok(Arc::new(HttpEmbedder::new(provider, settings.dimension)?))
        }
    }
}

/// How bulk embedding is paced and retried.
#[derive(Debug, Clone)]
pub struct BatchPolicy {
    pub batch_size: usize,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub request_interval: Duration,
}

impl BatchPolicy {
    pub fn from_settings(settings: &EmbeddingSettings) -> Self {
        Self {
            batch_size: settings.batch_size.max(1),
            max_retries: settings.max_retries,
            retry_delay: Duration::from_millis(settings.retry_delay_ms),
            request_interval: Duration::from_millis(settings.request_interval_ms),
        }
    }
}

impl Default for BatchPolicy {
    fn default() -> Self {
        Self::from_settings(&EmbeddingSettings::default())
    }
}

/// Embeds one batch, retrying transient failures with a fixed delay.
/// Fatal and non-transient errors are returned on first sight.
pub async fn embed_with_retry(
    provider: &dyn EmbeddingProvider,
    inputs: &[QueryInput],
    policy: &BatchPolicy,
) -> Result<Vec<Vec<f32>>> {
    let mut attempt = 0;
    loop {
        match provider.embed(inputs).await {
            Ok(vectors) => {
                validate_batch(provider.dimension(), inputs.len(), &vectors)?;
                return Ok(vectors);
            }
            Err(e) if e.is_transient() && attempt < policy.max_retries => {
                attempt += 1;
                warn!(
                    error = %e,
                    attempt,
                    max_retries = policy.max_retries,
                    "transient embedding failure, backing off"
                );
                tokio::time::sleep(policy.retry_delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}
