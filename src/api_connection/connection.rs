use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::env;
use std::error::Error;
use std::fmt;
use std::time::Duration;
use tracing::debug;

use super::endpoints::{EmbeddingRequest, EmbeddingResponse, Provider};

#[derive(Debug)]
pub enum ApiConnectionError {
    MissingApiKey(String),
    NetworkError(reqwest::Error),
    SerializationError(serde_json::Error),
    ApiError {
        status: reqwest::StatusCode,
        error_body: String,
    },
    /// HTTP 200 carrying an application-level failure code.
    ServiceError {
        code: i64,
        message: String,
    },
}

impl fmt::Display for ApiConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApiConnectionError::MissingApiKey(key_name) => {
                write!(f, "API key not found in environment: {}", key_name)
            }
            ApiConnectionError::NetworkError(err) => write!(f, "Network error: {}", err),
            ApiConnectionError::SerializationError(err) => {
                write!(f, "Serialization error: {}", err)
            }
            ApiConnectionError::ApiError { status, error_body } => {
                write!(f, "API error {}: {}", status, error_body)
            }
            ApiConnectionError::ServiceError { code, message } => {
                write!(f, "Service error {}: {}", code, message)
            }
        }
    }
}

impl Error for ApiConnectionError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ApiConnectionError::NetworkError(err) => Some(err),
            ApiConnectionError::SerializationError(err) => Some(err),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for ApiConnectionError {
    fn from(err: reqwest::Error) -> Self {
        ApiConnectionError::NetworkError(err)
    }
}

impl From<serde_json::Error> for ApiConnectionError {
    fn from(err: serde_json::Error) -> Self {
        ApiConnectionError::SerializationError(err)
    }
}

/// Reads a secret from the environment (after `.env` has been loaded).
pub fn api_key_from_env(env_var_name: &str) -> Result<String, ApiConnectionError> {
    dotenv::dotenv().ok();
    env::var(env_var_name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| ApiConnectionError::MissingApiKey(env_var_name.to_string()))
}

/// JSON-over-HTTP client with a bounded per-request timeout.
#[derive(Debug, Clone)]
pub struct JsonClient {
    client: Client,
    base_url: String,
    bearer_token: Option<String>,
}

impl JsonClient {
    pub fn new(
        base_url: &str,
        bearer_token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, ApiConnectionError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            bearer_token,
        })
    }

    pub fn url(&self, path: &str) -> String {
        if path.is_empty() {
            self.base_url.clone()
        } else {
            format!("{}/{}", self.base_url, path.trim_start_matches('/'))
        }
    }

    pub async fn post<Req, Resp>(&self, path: &str, body: &Req) -> Result<Resp, ApiConnectionError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let url = self.url(path);
        debug!(%url, "POST");
        let mut request = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .json(body);
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        if response.status().is_success() {
            let text = response.text().await?;
            Ok(serde_json::from_str(&text)?)
        } else {
            let status = response.status();
            let error_body = response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read error body".to_string());
            Err(ApiConnectionError::ApiError { status, error_body })
        }
    }
}

impl Provider {
    pub fn openai_compatible(endpoint: &str, api_key_env: &str, model: &str, timeout_secs: u64) -> Self {
        Self::OpenAiCompatible {
            endpoint: endpoint.to_string(),
            api_key_env: api_key_env.to_string(),
            model: model.to_string(),
            timeout_secs,
        }
    }

    pub fn model(&self) -> &str {
        match self {
            Provider::OpenAiCompatible { model, .. } => model,
        }
    }

    /// Builds the HTTP client. Fails immediately when the key is absent.
    pub fn connect(&self) -> Result<JsonClient, ApiConnectionError> {
        match self {
            Provider::OpenAiCompatible {
                endpoint,
                api_key_env,
                timeout_secs,
                ..
            } => {
                let api_key = api_key_from_env(api_key_env)?;
                JsonClient::new(endpoint, Some(api_key), Duration::from_secs(*timeout_secs))
            }
        }
    }

    pub async fn call_embeddings(
        client: &JsonClient,
        request: &EmbeddingRequest,
    ) -> Result<EmbeddingResponse, ApiConnectionError> {
        let response: EmbeddingResponse = client.post("", request).await?;
        if let Some(usage) = &response.usage {
            debug!(total_tokens = usage.total_tokens, "embedding request usage");
        }
        Ok(response)
    }
}
