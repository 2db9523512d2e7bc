//! Settings for the search core.
//!
//! Resolution order: built-in defaults, then an optional JSON file, then
//! `NUTRI_*` environment variables (a `.env` file is honoured).

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Result, SearchError};

const ENV_PREFIX: &str = "NUTRI_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexBackend {
    Local,
    Remote,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingBackend {
    /// In-process model2vec static model.
    StaticModel,
    Http,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexSettings {
    pub backend: IndexBackend,
    pub vectors_path: PathBuf,
    pub metadata_path: PathBuf,
    /// Imported nutrition details, joined to hits at search time.
    pub catalog_path: PathBuf,
}

impl Default for IndexSettings {
    fn default() -> Self {
        Self {
            backend: IndexBackend::Local,
            vectors_path: PathBuf::from("food_index.vec"),
            metadata_path: PathBuf::from("food_index.meta.json"),
            catalog_path: PathBuf::from("food_catalog.json"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingSettings {
    pub backend: EmbeddingBackend,
    pub model: String,
    pub endpoint: String,
    pub api_key_env: String,
    pub dimension: usize,
    /// Inputs per embedding call; kept small for rate-limited endpoints.
    pub batch_size: usize,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    /// Pause between successive batches during a build.
    pub request_interval_ms: u64,
    pub timeout_secs: u64,
}

impl Default for EmbeddingSettings {
    fn default() -> Self {
        Self {
            backend: EmbeddingBackend::StaticModel,
            model: "minishlab/potion-base-32M".to_string(),
            endpoint: crate::api_connection::endpoints::DEFAULT_EMBEDDING_ENDPOINT.to_string(),
            api_key_env: "EMBEDDING_API_KEY".to_string(),
            dimension: 512,
            batch_size: 6,
            max_retries: 3,
            retry_delay_ms: 2000,
            request_interval_ms: 500,
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteSettings {
    pub endpoint: String,
    pub token_env: String,
    /// Alias the engine queries through.
    pub collection: String,
    pub timeout_secs: u64,
}

impl Default for RemoteSettings {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:19530".to_string(),
            token_env: "MILVUS_TOKEN".to_string(),
            collection: "usda_foods".to_string(),
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchSettings {
    pub limit: usize,
    pub threshold: f32,
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self { limit: 10, threshold: 0.3 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub index: IndexSettings,
    pub embedding: EmbeddingSettings,
    pub remote: RemoteSettings,
    pub search: SearchSettings,
    pub logging: LoggingSettings,
}

impl Settings {
    pub fn load(config_file: Option<&Path>) -> Result<Self> {
        dotenv::dotenv().ok();
        let mut settings = match config_file {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        settings.apply_env(|key| std::env::var(key).ok())?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            SearchError::Config(format!("Failed to read config file {:?}: {}", path, e))
        })?;
        serde_json::from_str(&contents)
            .map_err(|e| SearchError::Config(format!("Invalid config file {:?}: {}", path, e)))
    }

    /// Overrides fields from `NUTRI_<SECTION>_<FIELD>` variables.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name));

        if let Some(v) = get("INDEX_BACKEND") {
            self.index.backend = parse_enum("INDEX_BACKEND", &v)?;
        }
        if let Some(v) = get("INDEX_VECTORS_PATH") {
            self.index.vectors_path = PathBuf::from(v);
        }
        if let Some(v) = get("INDEX_METADATA_PATH") {
            self.index.metadata_path = PathBuf::from(v);
        }
        if let Some(v) = get("INDEX_CATALOG_PATH") {
            self.index.catalog_path = PathBuf::from(v);
        }

        if let Some(v) = get("EMBEDDING_BACKEND") {
            self.embedding.backend = parse_enum("EMBEDDING_BACKEND", &v)?;
        }
        if let Some(v) = get("EMBEDDING_MODEL") {
            self.embedding.model = v;
        }
        if let Some(v) = get("EMBEDDING_ENDPOINT") {
            self.embedding.endpoint = v;
        }
        if let Some(v) = get("EMBEDDING_API_KEY_ENV") {
            self.embedding.api_key_env = v;
        }
        if let Some(v) = get("EMBEDDING_DIMENSION") {
            self.embedding.dimension = parse_num("EMBEDDING_DIMENSION", &v)?;
        }
        if let Some(v) = get("EMBEDDING_BATCH_SIZE") {
            self.embedding.batch_size = parse_num("EMBEDDING_BATCH_SIZE", &v)?;
        }
        if let Some(v) = get("EMBEDDING_MAX_RETRIES") {
            self.embedding.max_retries = parse_num("EMBEDDING_MAX_RETRIES", &v)?;
        }
        if let Some(v) = get("EMBEDDING_RETRY_DELAY_MS") {
            self.embedding.retry_delay_ms = parse_num("EMBEDDING_RETRY_DELAY_MS", &v)?;
        }
        if let Some(v) = get("EMBEDDING_REQUEST_INTERVAL_MS") {
            self.embedding.request_interval_ms = parse_num("EMBEDDING_REQUEST_INTERVAL_MS", &v)?;
        }
        if let Some(v) = get("EMBEDDING_TIMEOUT_SECS") {
            self.embedding.timeout_secs = parse_num("EMBEDDING_TIMEOUT_SECS", &v)?;
        }

        if let Some(v) = get("REMOTE_ENDPOINT") {
            self.remote.endpoint = v;
        }
        if let Some(v) = get("REMOTE_TOKEN_ENV") {
            self.remote.token_env = v;
        }
        if let Some(v) = get("REMOTE_COLLECTION") {
            self.remote.collection = v;
        }
        if let Some(v) = get("REMOTE_TIMEOUT_SECS") {
            self.remote.timeout_secs = parse_num("REMOTE_TIMEOUT_SECS", &v)?;
        }

        if let Some(v) = get("SEARCH_LIMIT") {
            self.search.limit = parse_num("SEARCH_LIMIT", &v)?;
        }
        if let Some(v) = get("SEARCH_THRESHOLD") {
            self.search.threshold = parse_num("SEARCH_THRESHOLD", &v)?;
        }

        if let Some(v) = get("LOG_LEVEL") {
            self.logging.level = v;
        }
        if let Some(v) = get("LOG_FORMAT") {
            self.logging.format = parse_enum("LOG_FORMAT", &v)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if !(1..=100).contains(&self.search.limit) {
            return Err(SearchError::Config(format!(
                "search.limit must be between 1 and 100, got {}",
                self.search.limit
            )));
        }
        if !(0.0..=1.0).contains(&self.search.threshold) {
            return Err(SearchError::Config(format!(
                "search.threshold must be between 0 and 1, got {}",
                self.search.threshold
            )));
        }
        if self.embedding.dimension == 0 {
            return Err(SearchError::Config("embedding.dimension must be positive".into()));
        }
        if self.embedding.batch_size == 0 {
            return Err(SearchError::Config("embedding.batch_size must be positive".into()));
        }
        if self.remote.collection.trim().is_empty() {
            return Err(SearchError::Config("remote.collection must not be empty".into()));
        }
        Ok(())
    }

    /// Both local artifacts are on disk. Says nothing about their consistency.
    pub fn index_exists(&self) -> bool {
        self.index.vectors_path.exists() && self.index.metadata_path.exists()
    }
}

fn parse_num<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value.trim().parse::<T>().map_err(|_| {
        SearchError::Config(format!("{}{} has an invalid value: '{}'", ENV_PREFIX, name, value))
    })
}

fn parse_enum<T: serde::de::DeserializeOwned>(name: &str, value: &str) -> Result<T> {
    serde_json::from_value(serde_json::Value::String(value.trim().to_lowercase())).map_err(|_| {
        SearchError::Config(format!("{}{} has an invalid value: '{}'", ENV_PREFIX, name, value))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.search.limit, 10);
        assert_eq!(settings.embedding.batch_size, 6);
        assert_eq!(settings.index.backend, IndexBackend::Local);
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<String, String> = [
            ("NUTRI_INDEX_BACKEND", "Remote"),
            ("NUTRI_SEARCH_THRESHOLD", "0.55"),
            ("NUTRI_EMBEDDING_BACKEND", "http"),
            ("NUTRI_EMBEDDING_DIMENSION", "1024"),
            ("NUTRI_LOG_FORMAT", "json"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let mut settings = Settings::default();
        settings.apply_env(|k| vars.get(k).cloned()).unwrap();
        assert_eq!(settings.index.backend, IndexBackend::Remote);
        assert_eq!(settings.embedding.backend, EmbeddingBackend::Http);
        assert_eq!(settings.embedding.dimension, 1024);
        assert!((settings.search.threshold - 0.55).abs() < 1e-6);
        assert_eq!(settings.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_invalid_env_value_rejected() {
        let mut settings = Settings::default();
        let result = settings.apply_env(|k| (k == "NUTRI_SEARCH_LIMIT").then(|| "many".to_string()));
        assert!(matches!(result, Err(SearchError::Config(_))));
    }

    #[test]
    fn test_validate_ranges() {
        let mut settings = Settings::default();
        settings.search.threshold = 1.5;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.search.limit = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_partial_json_file_keeps_defaults() -> anyhow::Result<()> {
        let mut file = NamedTempFile::new()?;
        writeln!(file, r#"{{"search": {{"threshold": 0.4}}, "index": {{"vectors_path": "/tmp/x.vec"}}}}"#)?;
        file.flush()?;

        let settings = Settings::from_file(file.path())?;
        assert!((settings.search.threshold - 0.4).abs() < 1e-6);
        assert_eq!(settings.search.limit, 10);
        assert_eq!(settings.index.vectors_path, PathBuf::from("/tmp/x.vec"));
        assert_eq!(settings.index.metadata_path, PathBuf::from("food_index.meta.json"));
        Ok(())
    }
}
