//! Error taxonomy for the search core.

use thiserror::Error;

use crate::api_connection::connection::ApiConnectionError;

#[derive(Error, Debug)]
pub enum SearchError {
    /// Missing or invalid settings. Never retried.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Credentials rejected by the embedding endpoint or the vector store. Never retried.
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Timeouts, throttling and 5xx responses.
    #[error("Transient failure: {0}")]
    Transient(String),

    /// The remote service answered with an error that retrying will not fix.
    #[error("Remote service error: {0}")]
    Remote(String),

    #[error("Embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// A vector with zero or non-finite length; it has no direction to compare.
    #[error("Degenerate embedding: {0}")]
    DegenerateEmbedding(String),

    /// Persisted vector/metadata pair is unreadable or inconsistent.
    #[error("Corrupt index: {0}")]
    CorruptIndex(String),

    #[error("Unsupported input: {0}")]
    UnsupportedInput(String),

    #[error("Nutrition lookup failed: {0}")]
    Lookup(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SearchError {
    /// Worth another attempt after a backoff delay.
    pub fn is_transient(&self) -> bool {
        matches!(self, SearchError::Transient(_))
    }

    /// Aborts a bulk build immediately instead of skipping the batch.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SearchError::Config(_) | SearchError::Auth(_) | SearchError::DimensionMismatch { .. }
        )
    }
}

impl From<ApiConnectionError> for SearchError {
    fn from(err: ApiConnectionError) -> Self {
        match err {
            ApiConnectionError::MissingApiKey(name) => {
                SearchError::Config(format!("API key not found in environment: {}", name))
            }
            ApiConnectionError::NetworkError(e) => {
                if e.is_timeout() || e.is_connect() || e.is_request() {
                    SearchError::Transient(e.to_string())
                } else {
                    SearchError::Remote(e.to_string())
                }
            }
            ApiConnectionError::SerializationError(e) => SearchError::Serialization(e),
            ApiConnectionError::ApiError { status, error_body } => {
                let message = format!("{}: {}", status, error_body);
                if status == reqwest::StatusCode::UNAUTHORIZED
                    || status == reqwest::StatusCode::FORBIDDEN
                {
                    SearchError::Auth(message)
                } else if status == reqwest::StatusCode::TOO_MANY_REQUESTS
                    || status == reqwest::StatusCode::REQUEST_TIMEOUT
                    || status.is_server_error()
                {
                    SearchError::Transient(message)
                } else {
                    SearchError::Remote(message)
                }
            }
            // 1800: request not authenticated against the vector store.
            ApiConnectionError::ServiceError { code: 1800, message } => SearchError::Auth(message),
            ApiConnectionError::ServiceError { code, message } => {
                SearchError::Remote(format!("code {}: {}", code, message))
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, SearchError>;
