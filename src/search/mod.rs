pub mod data_loader;
pub mod embedding_engine;
pub mod index_builder;
pub mod local_index;
pub mod query_engine;
pub mod remote_collection;
pub mod vector_index;

use std::sync::Arc;

use crate::config::{IndexBackend, Settings};
use crate::error::Result;

pub use data_loader::{load_nutrition_csv, load_source, load_usda_foundation_foods, Importer, SourceFormat};
pub use embedding_engine::{build_embedder, BatchPolicy, EmbeddingProvider};
pub use index_builder::{BuildReport, IndexBuilder};
pub use local_index::{LocalExactIndex, LocalIndexStore};
pub use query_engine::QueryEngine;
pub use remote_collection::{RemoteCollection, RemoteCollectionStore};
pub use vector_index::{IndexStore, ScoredEntry, VectorIndex};

/// Picks the configured backend once; callers only see the trait.
pub fn build_index_store(settings: &Settings) -> Result<Arc<dyn IndexStore>> {
    let dimension = settings.embedding.dimension;
    match settings.index.backend {
        IndexBackend::Local => Ok(Arc::new(LocalIndexStore::new(
            dimension,
            settings.index.vectors_path.clone(),
            settings.index.metadata_path.clone(),
        ))),
        IndexBackend::Remote => Ok(Arc::new(RemoteCollectionStore::new(&settings.remote, dimension)?)),
    }
}
