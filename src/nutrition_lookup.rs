//! Collaborators around the search core: where records come from and how a
//! hit is joined back to full nutrition data.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::info;

use crate::error::{Result, SearchError};
use crate::models::{FoodId, NutritionDetail, NutritionRecord};

/// Batched detail fetch. One call per search, never one per hit.
#[async_trait]
pub trait NutritionLookup: Send + Sync {
    /// Ids missing from the store are simply absent from the map.
    async fn get_many(&self, ids: &[FoodId]) -> Result<HashMap<FoodId, NutritionDetail>>;
}

/// Supplies the records an index is built from.
#[async_trait]
pub trait RecordSource: Send + Sync {
    async fn records(&self) -> Result<Vec<NutritionRecord>>;
}

const CATALOG_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct CatalogFile {
    version: u32,
    details: Vec<NutritionDetail>,
}

/// In-memory catalog filled by the importer. Serves both roles.
#[derive(Debug, Default)]
pub struct NutritionCatalog {
    details: HashMap<FoodId, NutritionDetail>,
    order: Vec<FoodId>,
    lookups: AtomicUsize,
}

impl NutritionCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_details(details: impl IntoIterator<Item = NutritionDetail>) -> Self {
        let mut catalog = Self::new();
        for detail in details {
            catalog.upsert(detail);
        }
        catalog
    }

    /// Re-importing an id overwrites it in place and keeps its original position.
    pub fn upsert(&mut self, detail: NutritionDetail) {
        let id = detail.record.id;
        if self.details.insert(id, detail).is_none() {
            self.order.push(id);
        }
    }

    pub fn len(&self) -> usize {
        self.details.len()
    }

    pub fn is_empty(&self) -> bool {
        self.details.is_empty()
    }

    pub fn get(&self, id: FoodId) -> Option<&NutritionDetail> {
        self.details.get(&id)
    }

    /// Writes the catalog as versioned JSON, replacing any previous file whole.
    pub fn save(&self, path: &Path) -> Result<()> {
        let file = CatalogFile {
            version: CATALOG_VERSION,
            details: self
                .order
                .iter()
                .filter_map(|id| self.details.get(id).cloned())
                .collect(),
        };
        let mut tmp = path.as_os_str().to_os_string();
        tmp.push(".tmp");
        fs::write(&tmp, serde_json::to_vec(&file)?)?;
        fs::rename(&tmp, path)?;
        info!(count = file.details.len(), path = ?path, "nutrition catalog saved");
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let bytes = fs::read(path).map_err(|e| {
            SearchError::Lookup(format!("cannot read nutrition catalog {:?}: {}", path, e))
        })?;
        let file: CatalogFile = serde_json::from_slice(&bytes)?;
        if file.version != CATALOG_VERSION {
            return Err(SearchError::Lookup(format!(
                "unsupported nutrition catalog version {}",
                file.version
            )));
        }
        Ok(Self::from_details(file.details))
    }

    /// How many batched lookups have been served.
    pub fn lookup_calls(&self) -> usize {
        self.lookups.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl NutritionLookup for NutritionCatalog {
    async fn get_many(&self, ids: &[FoodId]) -> Result<HashMap<FoodId, NutritionDetail>> {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        Ok(ids
            .iter()
            .filter_map(|id| self.details.get(id).map(|d| (*id, d.clone())))
            .collect())
    }
}

#[async_trait]
impl RecordSource for NutritionCatalog {
    async fn records(&self) -> Result<Vec<NutritionRecord>> {
        Ok(self
            .order
            .iter()
            .filter_map(|id| self.details.get(id))
            .map(|d| d.record.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detail(id: FoodId, description: &str) -> NutritionDetail {
        NutritionDetail::new(NutritionRecord::new(id, description))
    }

    #[tokio::test]
    async fn test_get_many_skips_unknown_ids() -> Result<()> {
        let catalog = NutritionCatalog::from_details([detail(1, "Tomato"), detail(2, "Beef")]);
        let found = catalog.get_many(&[2, 99]).await?;
        assert_eq!(found.len(), 1);
        assert_eq!(found[&2].record.description, "Beef");
        assert_eq!(catalog.lookup_calls(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_reimport_overwrites_in_place() -> Result<()> {
        let mut catalog = NutritionCatalog::from_details([detail(1, "Tomato"), detail(2, "Beef")]);
        catalog.upsert(detail(1, "Tomato, red, raw"));
        let records = catalog.records().await?;
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].id, 1);
        assert_eq!(records[0].description, "Tomato, red, raw");
        Ok(())
    }

    #[test]
    fn test_save_and_load_keep_order() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("catalog.json");
        let mut beef = NutritionRecord::new(2, "Beef");
        beef.calories_per_100g = Some(254.0);
        NutritionCatalog::from_details([detail(9, "Tomato"), NutritionDetail::new(beef)]).save(&path)?;

        let loaded = NutritionCatalog::load(&path)?;
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.order, vec![9, 2]);
        assert_eq!(loaded.get(2).and_then(|d| d.energy_unit.as_deref()), Some("kcal"));
        assert!(matches!(
            NutritionCatalog::load(&dir.path().join("missing.json")),
            Err(SearchError::Lookup(_))
        ));
        Ok(())
    }
}
