use serde::{Deserialize, Serialize};

pub const DEFAULT_EMBEDDING_ENDPOINT: &str = "https://api.openai.com/v1/embeddings";

/// An embedding service reachable over HTTP.
#[derive(Clone, Debug, Serialize)]
pub enum Provider {
    /// Any endpoint speaking the OpenAI `/embeddings` dialect. Multimodal
    /// gateways accept `{"image": <data url>}` items in the same `input` array.
    OpenAiCompatible {
        endpoint: String,
        /// Name of the environment variable holding the key, not the key itself.
        api_key_env: String,
        model: String,
        timeout_secs: u64,
    },
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(untagged)]
pub enum EmbeddingInputItem {
    Text(String),
    Image { image: String },
}

#[derive(Debug, Serialize, Clone)]
pub struct EmbeddingRequest {
    pub model: String,
    pub input: Vec<EmbeddingInputItem>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dimensions: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encoding_format: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingData {
    pub embedding: Vec<f32>,
    pub index: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingUsage {
    pub prompt_tokens: Option<u32>,
    pub total_tokens: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingResponse {
    pub data: Vec<EmbeddingData>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub usage: Option<EmbeddingUsage>,
}

impl EmbeddingResponse {
    /// Vectors in request order; the service may answer out of order.
    pub fn into_ordered_vectors(self) -> Vec<Vec<f32>> {
        let mut data = self.data;
        data.sort_by_key(|d| d.index);
        data.into_iter().map(|d| d.embedding).collect()
    }
}
