//! Backend-agnostic nearest-neighbour interface.
//!
//! Every backend scores with cosine similarity on unit-length vectors,
//! clamped to [-1, 1], so callers can compare scores across backends.

use async_trait::async_trait;
use std::fmt::Debug;

use crate::error::{Result, SearchError};
use crate::models::{IndexEntry, NutritionRecord};

type Float = f32;

/// One neighbour returned by a backend.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredEntry {
    /// Insertion position for the local index, result rank for remote ones.
    pub position: usize,
    pub entry: IndexEntry,
    pub similarity: Float,
}

#[async_trait]
pub trait VectorIndex: Send + Sync + Debug {
    fn backend_name(&self) -> &'static str;

    fn dimension(&self) -> usize;

    /// Number of vectors currently indexed.
    fn count(&self) -> usize;

    /// Appends vectors and the records they were computed from, in parallel
    /// order. Vectors are normalised on the way in. Returns rows added.
    async fn add(&mut self, vectors: Vec<Vec<Float>>, records: &[NutritionRecord]) -> Result<usize>;

    /// Up to `k` neighbours by descending similarity; ties keep insertion order.
    async fn search(&self, query: &[Float], k: usize) -> Result<Vec<ScoredEntry>>;

    /// Makes the populated index the durable, visible one.
    async fn persist(&mut self) -> Result<()>;

    /// Releases whatever an abandoned, never-persisted build holds.
    async fn discard(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Opens or creates instances of one backend.
#[async_trait]
pub trait IndexStore: Send + Sync {
    fn backend_name(&self) -> &'static str;

    /// A previously built index, or `None` when nothing valid exists.
    async fn open(&self) -> Result<Option<Box<dyn VectorIndex>>>;

    /// A fresh, empty index that does not disturb the one being served.
    async fn create_empty(&self) -> Result<Box<dyn VectorIndex>>;
}

/// Normalize a vector to unit length. Zero vectors stay zero; use this for
/// queries only, stored rows go through [`unit_vector`].
pub fn normalize(vector: &[Float]) -> Vec<Float> {
    let norm_sq: Float = vector.iter().map(|&x| x * x).sum();
    if norm_sq == 0.0 || !norm_sq.is_finite() {
        return vec![0.0; vector.len()];
    }
    let inv_norm = 1.0 / norm_sq.sqrt();
    vector.iter().map(|&x| x * inv_norm).collect()
}

/// True when the vector has a finite, non-zero length.
pub fn has_direction(vector: &[Float]) -> bool {
    let norm_sq: Float = vector.iter().map(|&x| x * x).sum();
    norm_sq > 0.0 && norm_sq.is_finite()
}

/// Unit-length copy of a vector that is about to be stored.
pub fn unit_vector(vector: &[Float]) -> Result<Vec<Float>> {
    if !has_direction(vector) {
        return Err(SearchError::DegenerateEmbedding(
            "cannot store a vector with zero or non-finite norm".into(),
        ));
    }
    Ok(normalize(vector))
}

#[inline]
pub fn dot_product(vec1: &[Float], vec2: &[Float]) -> Float {
    vec1.iter().zip(vec2.iter()).map(|(a, b)| a * b).sum()
}

/// Canonical score: clamped, NaN mapped to the lowest similarity.
#[inline]
pub fn canonical_similarity(score: Float) -> Float {
    if score.is_nan() {
        -1.0
    } else {
        score.clamp(-1.0, 1.0)
    }
}

pub fn ensure_dimension(expected: usize, actual: usize) -> Result<()> {
    if expected != actual {
        return Err(SearchError::DimensionMismatch { expected, actual });
    }
    Ok(())
}

pub(crate) fn ensure_parallel(vectors: usize, entries: usize) -> Result<()> {
    if vectors != entries {
        return Err(SearchError::Config(format!(
            "Vectors and metadata count mismatch: {} vs {}",
            vectors, entries
        )));
    }
    Ok(())
}
