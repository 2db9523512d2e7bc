//! The search surface: embed, retrieve, filter, then join with nutrition detail.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use crate::config::SearchSettings;
use crate::error::{Result, SearchError};
use crate::models::{DetailedSearchResult, FoodId, QueryInput, SearchResult};
use crate::nutrition_lookup::{NutritionLookup, RecordSource};
use crate::search::embedding_engine::{BatchPolicy, EmbeddingProvider};
use crate::search::index_builder::{BuildReport, IndexBuilder};
use crate::search::vector_index::{ensure_dimension, IndexStore, VectorIndex};

/// Shared service object; wrap in an `Arc` and call from any number of tasks.
///
/// Searches clone the current index handle and release the lock before any
/// network wait. Builds populate a separate instance and swap it in whole, so
/// a concurrent search sees either the old or the new index.
pub struct QueryEngine {
    embedder: Arc<dyn EmbeddingProvider>,
    builder: IndexBuilder,
    lookup: Arc<dyn NutritionLookup>,
    source: Arc<dyn RecordSource>,
    defaults: SearchSettings,
    current: RwLock<Option<Arc<dyn VectorIndex>>>,
    build_lock: Mutex<()>,
    builds: AtomicUsize,
}

impl QueryEngine {
    pub fn new(
        embedder: Arc<dyn EmbeddingProvider>,
        store: Arc<dyn IndexStore>,
        lookup: Arc<dyn NutritionLookup>,
        source: Arc<dyn RecordSource>,
        policy: BatchPolicy,
        defaults: SearchSettings,
    ) -> Self {
        Self {
            builder: IndexBuilder::new(embedder.clone(), store, policy),
            embedder,
            lookup,
            source,
            defaults,
            current: RwLock::new(None),
            build_lock: Mutex::new(()),
            builds: AtomicUsize::new(0),
        }
    }

    /// Loads the persisted index, or builds one if none is valid.
    /// Cheap once an index is in place.
    pub async fn ensure_ready(&self) -> Result<()> {
        if self.current.read().await.is_some() {
            return Ok(());
        }
        let _guard = self.build_lock.lock().await;
        if self.current.read().await.is_some() {
            return Ok(());
        }
        let records = self.source.records().await?;
        let (index, report) = self.builder.build(&records, false).await?;
        self.install(index, &report).await;
        Ok(())
    }

    /// Replaces the served index with one built from scratch.
    pub async fn rebuild(&self) -> Result<BuildReport> {
        let _guard = self.build_lock.lock().await;
        let records = self.source.records().await?;
        let (index, report) = self.builder.build(&records, true).await?;
        self.install(index, &report).await;
        Ok(report)
    }

    async fn install(&self, index: Box<dyn VectorIndex>, report: &BuildReport) {
        if report.rebuilt {
            self.builds.fetch_add(1, Ordering::SeqCst);
        }
        let index: Arc<dyn VectorIndex> = Arc::from(index);
        info!(backend = index.backend_name(), count = index.count(), "index installed");
        *self.current.write().await = Some(index);
    }

    async fn index(&self) -> Result<Arc<dyn VectorIndex>> {
        self.ensure_ready().await?;
        self.current
            .read()
            .await
            .clone()
            .ok_or_else(|| SearchError::CorruptIndex("no index available after build".into()))
    }

    /// Ranked hits above `threshold`, at most `limit`, with calories joined in.
    /// Ids the lookup no longer knows are kept without calories.
    pub async fn search(
        &self,
        query: impl Into<QueryInput>,
        limit: usize,
        threshold: f32,
    ) -> Result<Vec<SearchResult>> {
        let hits = self.nearest(query.into(), limit, threshold).await?;
        if hits.is_empty() {
            return Ok(hits);
        }
        let details = self.lookup.get_many(&ids_of(&hits)).await?;
        Ok(hits
            .into_iter()
            .map(|mut hit| {
                hit.calories_per_100g = details.get(&hit.id).and_then(|d| d.record.calories_per_100g);
                hit
            })
            .collect())
    }

    /// Like [`search`](Self::search) with macros and portions merged in.
    /// Hits without a nutrition record are dropped.
    pub async fn search_with_detail(
        &self,
        query: impl Into<QueryInput>,
        limit: usize,
        threshold: f32,
    ) -> Result<Vec<DetailedSearchResult>> {
        let hits = self.nearest(query.into(), limit, threshold).await?;
        if hits.is_empty() {
            return Ok(Vec::new());
        }
        let details = self.lookup.get_many(&ids_of(&hits)).await?;
        Ok(hits
            .into_iter()
            .filter_map(|hit| {
                let detail = details.get(&hit.id)?;
                Some(DetailedSearchResult::merge(hit, detail))
            })
            .collect())
    }

    /// Search with the configured limit and threshold.
    pub async fn search_default(&self, query: impl Into<QueryInput>) -> Result<Vec<SearchResult>> {
        self.search(query, self.defaults.limit, self.defaults.threshold)
            .await
    }

    pub fn defaults(&self) -> &SearchSettings {
        &self.defaults
    }

    /// Rows in the served index, 0 when nothing is loaded yet.
    pub async fn count(&self) -> usize {
        self.current
            .read()
            .await
            .as_ref()
            .map(|index| index.count())
            .unwrap_or(0)
    }

    pub async fn backend_name(&self) -> Option<&'static str> {
        self.current.read().await.as_ref().map(|index| index.backend_name())
    }

    /// Builds performed by this engine, reused indexes excluded.
    pub fn build_count(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }

    async fn nearest(&self, query: QueryInput, limit: usize, threshold: f32) -> Result<Vec<SearchResult>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let index = self.index().await?;
        let count = index.count();
        if count == 0 {
            return Ok(Vec::new());
        }

        let vector = self.embedder.embed_one(&query).await?;
        ensure_dimension(index.dimension(), vector.len())?;

        let k = limit.saturating_mul(2).min(count);
        let candidates = index.search(&vector, k).await?;
        debug!(k, candidates = candidates.len(), threshold, "nearest neighbours fetched");

        Ok(candidates
            .into_iter()
            .filter(|c| c.similarity > threshold)
            .take(limit)
            .map(|c| SearchResult {
                id: c.entry.id,
                description: c.entry.description,
                category: c.entry.category,
                similarity: c.similarity,
                calories_per_100g: None,
            })
            .collect())
    }
}

fn ids_of(hits: &[SearchResult]) -> Vec<FoodId> {
    let mut seen = HashSet::with_capacity(hits.len());
    hits.iter()
        .map(|hit| hit.id)
        .filter(|id| seen.insert(*id))
        .collect()
}
