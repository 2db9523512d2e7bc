//! Bulk population of a vector index from nutrition records.

use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{Result, SearchError};
use crate::models::{NutritionRecord, QueryInput};
use crate::search::embedding_engine::{embed_with_retry, BatchPolicy, EmbeddingProvider};
use crate::search::vector_index::{has_direction, IndexStore, VectorIndex};

/// Summary of one build call.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BuildReport {
    /// Records that reached the embedding stage.
    pub processed: usize,
    /// Rows present in the index after the build.
    pub indexed: usize,
    /// Records dropped for lack of a description or of a usable embedding.
    pub skipped_records: usize,
    /// Batches abandoned after their retries ran out.
    pub skipped_batches: usize,
    /// False when an existing index was reused as-is.
    pub rebuilt: bool,
}

pub struct IndexBuilder {
    embedder: Arc<dyn EmbeddingProvider>,
    store: Arc<dyn IndexStore>,
    policy: BatchPolicy,
}

impl IndexBuilder {
    pub fn new(embedder: Arc<dyn EmbeddingProvider>, store: Arc<dyn IndexStore>, policy: BatchPolicy) -> Self {
        Self {
            embedder,
            store,
            policy,
        }
    }

    /// Returns a populated, persisted index.
    ///
    /// Without `force_rebuild` an existing valid index is returned untouched.
    /// Otherwise a fresh index is filled from `records` and made durable; the
    /// previously served index stays intact until `persist` succeeds.
    pub async fn build(
        &self,
        records: &[NutritionRecord],
        force_rebuild: bool,
    ) -> Result<(Box<dyn VectorIndex>, BuildReport)> {
        if !force_rebuild {
            if let Some(existing) = self.store.open().await? {
                info!(
                    backend = self.store.backend_name(),
                    count = existing.count(),
                    "index already built, skipping"
                );
                let report = BuildReport {
                    indexed: existing.count(),
                    ..BuildReport::default()
                };
                return Ok((existing, report));
            }
        }
        self.rebuild(records).await
    }

    async fn rebuild(&self, records: &[NutritionRecord]) -> Result<(Box<dyn VectorIndex>, BuildReport)> {
        let expected = self.embedder.dimension();
        let mut index = self.store.create_empty().await?;
        match self.fill(index.as_mut(), records, expected).await {
            Ok(report) => Ok((index, report)),
            Err(e) => {
                if let Err(cleanup) = index.discard().await {
                    warn!(error = %cleanup, "failed to discard abandoned index");
                }
                Err(e)
            }
        }
    }

    async fn fill(
        &self,
        index: &mut dyn VectorIndex,
        records: &[NutritionRecord],
        expected: usize,
    ) -> Result<BuildReport> {
        if index.dimension() != expected {
            return Err(SearchError::DimensionMismatch {
                expected: index.dimension(),
                actual: expected,
            });
        }

        let usable: Vec<&NutritionRecord> = records
            .iter()
            .filter(|r| !r.description.trim().is_empty())
            .collect();
        let mut report = BuildReport {
            skipped_records: records.len() - usable.len(),
            rebuilt: true,
            ..BuildReport::default()
        };
        if report.skipped_records > 0 {
            warn!(count = report.skipped_records, "records without a description were skipped");
        }

        let started = Instant::now();
        let total = usable.len();
        let batch_size = self.policy.batch_size.max(1);
        let batch_count = total.div_ceil(batch_size);
        info!(
            backend = index.backend_name(),
            model = self.embedder.model_name(),
            records = total,
            batches = batch_count,
            "building index"
        );

        for (batch_no, chunk) in usable.chunks(batch_size).enumerate() {
            if batch_no > 0 && !self.policy.request_interval.is_zero() {
                tokio::time::sleep(self.policy.request_interval).await;
            }
            let batch: Vec<NutritionRecord> = chunk.iter().map(|r| (*r).clone()).collect();
            report.processed += batch.len();

            match self.index_batch(index, &batch).await {
                Ok((added, degenerate)) => {
                    report.skipped_records += degenerate;
                    debug!(batch = batch_no + 1, added, "batch indexed");
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    report.skipped_batches += 1;
                    let first = batch.first().map(|r| r.id);
                    warn!(
                        batch = batch_no + 1,
                        first_id = ?first,
                        size = batch.len(),
                        error = %e,
                        "batch failed, skipping"
                    );
                }
            }

            if (batch_no + 1) % 50 == 0 || batch_no + 1 == batch_count {
                info!(
                    processed = report.processed,
                    total,
                    indexed = index.count(),
                    "indexing progress"
                );
            }
        }

        index.persist().await?;
        report.indexed = index.count();
        info!(
            indexed = report.indexed,
            skipped_records = report.skipped_records,
            skipped_batches = report.skipped_batches,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "index build complete"
        );
        Ok(report)
    }

    /// Embeds and stores one batch. Returns rows added and records dropped
    /// because their embedding had no direction.
    async fn index_batch(&self, index: &mut dyn VectorIndex, batch: &[NutritionRecord]) -> Result<(usize, usize)> {
        let inputs: Vec<QueryInput> = batch.iter().map(|r| QueryInput::Text(r.search_text())).collect();
        let embedded = embed_with_retry(self.embedder.as_ref(), &inputs, &self.policy).await?;

        let mut vectors = Vec::with_capacity(embedded.len());
        let mut kept = Vec::with_capacity(batch.len());
        for (vector, record) in embedded.into_iter().zip(batch) {
            if has_direction(&vector) {
                vectors.push(vector);
                kept.push(record.clone());
            } else {
                warn!(id = record.id, description = %record.description, "zero-norm embedding, record skipped");
            }
        }
        let degenerate = batch.len() - kept.len();
        if kept.is_empty() {
            return Ok((0, degenerate));
        }

        let mut attempt = 0;
        loop {
            match index.add(vectors.clone(), &kept).await {
                Ok(added) => return Ok((added, degenerate)),
                Err(e) if e.is_transient() && attempt < self.policy.max_retries => {
                    attempt += 1;
                    warn!(error = %e, attempt, "transient insert failure, backing off");
                    tokio::time::sleep(self.policy.retry_delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
