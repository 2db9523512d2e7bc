#![allow(dead_code)]

use async_trait::async_trait;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nutri_search::config::SearchSettings;
use nutri_search::error::{Result, SearchError};
use nutri_search::models::{NutritionDetail, NutritionRecord, QueryInput};
use nutri_search::nutrition_lookup::NutritionCatalog;
use nutri_search::search::{BatchPolicy, EmbeddingProvider, LocalIndexStore, QueryEngine};

pub const DIMENSION: usize = 256;

/// Deterministic bag-of-words embedder: each lowercase token bumps one
/// FNV-1a bucket. Identical text always gives identical vectors.
#[derive(Debug, Default)]
pub struct HashingEmbedder {
    pub calls: AtomicUsize,
    pub embedded: AtomicUsize,
}

impl HashingEmbedder {
    pub fn vector(text: &str) -> Vec<f32> {
        let mut v = vec![0.0; DIMENSION];
        for token in text
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            v[fnv1a(token) as usize % DIMENSION] += 1.0;
        }
        v
    }
}

fn fnv1a(token: &str) -> u64 {
    token.bytes().fold(0xcbf29ce484222325, |hash, b| {
        (hash ^ b as u64).wrapping_mul(0x100000001b3)
    })
}

#[async_trait]
impl EmbeddingProvider for HashingEmbedder {
    fn model_name(&self) -> &str {
        "fnv-buckets"
    }

    fn dimension(&self) -> usize {
        DIMENSION
    }

    async fn embed(&self, inputs: &[QueryInput]) -> Result<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.embedded.fetch_add(inputs.len(), Ordering::SeqCst);
        inputs
            .iter()
            .map(|input| match input {
                QueryInput::Text(text) => Ok(Self::vector(text)),
                QueryInput::Image { .. } => Err(SearchError::UnsupportedInput("text only".into())),
            })
            .collect()
    }
}

pub fn fast_policy() -> BatchPolicy {
    BatchPolicy {
        batch_size: 3,
        max_retries: 1,
        retry_delay: Duration::from_millis(1),
        request_interval: Duration::ZERO,
    }
}

pub fn record(id: i64, description: &str, kcal: Option<f32>) -> NutritionDetail {
    let mut record = NutritionRecord::new(id, description);
    record.calories_per_100g = kcal;
    NutritionDetail::new(record)
}

pub fn sample_foods() -> Vec<NutritionDetail> {
    vec![
        record(1, "tomato, raw", Some(18.0)),
        record(2, "beef, ground", Some(254.0)),
        record(3, "milk, whole", Some(61.0)),
        record(4, "rice, white, cooked", Some(130.0)),
        record(5, "apple, raw, with skin", Some(52.0)),
        record(6, "egg, whole, boiled", Some(155.0)),
        record(7, "tomato sauce, canned", Some(24.0)),
    ]
}

pub struct Fixture {
    pub embedder: Arc<HashingEmbedder>,
    pub store: Arc<LocalIndexStore>,
    pub catalog: Arc<NutritionCatalog>,
}

impl Fixture {
    pub fn new(dir: &Path, foods: Vec<NutritionDetail>) -> Self {
        Self {
            embedder: Arc::new(HashingEmbedder::default()),
            store: Arc::new(LocalIndexStore::new(
                DIMENSION,
                dir.join("foods.vec"),
                dir.join("foods.meta.json"),
            )),
            catalog: Arc::new(NutritionCatalog::from_details(foods)),
        }
    }

    pub fn engine(&self) -> QueryEngine {
        QueryEngine::new(
            self.embedder.clone(),
            self.store.clone(),
            self.catalog.clone(),
            self.catalog.clone(),
            fast_policy(),
            SearchSettings::default(),
        )
    }
}
