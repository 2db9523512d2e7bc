use csv::ReaderBuilder;
use serde::Deserialize;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use tracing::{info, warn};

use crate::config::{IndexBackend, Settings};
use crate::error::{Result, SearchError};
use crate::models::{FoodId, NutritionDetail, NutritionRecord, Portion};
use crate::nutrition_lookup::{NutritionCatalog, RecordSource};
use crate::search::index_builder::{BuildReport, IndexBuilder};

// USDA nutrient numbers
const ENERGY_KCAL: &str = "208";
const ENERGY_ATWATER_SPECIFIC: &str = "958";
const ENERGY_ATWATER_GENERAL: &str = "957";
const PROTEIN: &str = "203";
const FAT: &str = "204";
const CARBS: &str = "205";

// Flat CSV headers
const ID_COL: &str = "id";
const DESCRIPTION_COL: &str = "description";
const CATEGORY_COL: &str = "category";
const KCAL_COL: &str = "kcal/100g";
const PROTEIN_COL: &str = "protein";
const FAT_COL: &str = "fat";
const CARBS_COL: &str = "carbs";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFormat {
    Usda,
    Csv,
}

#[derive(Deserialize)]
struct UsdaFile {
    #[serde(rename = "FoundationFoods", default)]
    foundation_foods: Vec<UsdaFood>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsdaFood {
    fdc_id: FoodId,
    #[serde(default)]
    description: String,
    #[serde(default)]
    food_category: Option<UsdaCategory>,
    #[serde(default)]
    food_nutrients: Vec<UsdaFoodNutrient>,
    #[serde(default)]
    food_portions: Vec<UsdaPortion>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum UsdaCategory {
    Described { description: Option<String> },
    Plain(String),
}

impl UsdaCategory {
    fn into_name(self) -> Option<String> {
        let name = match self {
            UsdaCategory::Described { description } => description?,
            UsdaCategory::Plain(name) => name,
        };
        let name = name.trim();
        (!name.is_empty()).then(|| name.to_string())
    }
}

#[derive(Deserialize)]
struct UsdaFoodNutrient {
    #[serde(default)]
    nutrient: Option<UsdaNutrient>,
    #[serde(default)]
    amount: Option<f32>,
}

#[derive(Deserialize)]
struct UsdaNutrient {
    #[serde(default)]
    number: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsdaPortion {
    #[serde(default)]
    amount: Option<f32>,
    #[serde(default)]
    measure_unit: Option<UsdaMeasureUnit>,
    #[serde(default)]
    modifier: Option<String>,
    #[serde(default)]
    gram_weight: Option<f32>,
}

#[derive(Deserialize)]
struct UsdaMeasureUnit {
    #[serde(default)]
    name: Option<String>,
}

impl UsdaFood {
    fn nutrient(&self, number: &str) -> Option<f32> {
        self.food_nutrients
            .iter()
            .find(|fn_| fn_.nutrient.as_ref().and_then(|n| n.number.as_deref()) == Some(number))
            .and_then(|fn_| fn_.amount)
    }

    fn into_detail(self) -> Option<NutritionDetail> {
        let description = self.description.trim().to_string();
        if description.is_empty() {
            return None;
        }
        let mut record = NutritionRecord::new(self.fdc_id, description);
        record.calories_per_100g = self
            .nutrient(ENERGY_KCAL)
            .or_else(|| self.nutrient(ENERGY_ATWATER_SPECIFIC))
            .or_else(|| self.nutrient(ENERGY_ATWATER_GENERAL));
        record.protein = self.nutrient(PROTEIN);
        record.fat = self.nutrient(FAT);
        record.carbs = self.nutrient(CARBS);
        record.category = self.food_category.and_then(UsdaCategory::into_name);

        let portions = self.food_portions.into_iter().filter_map(portion_from_usda).collect();
        let mut detail = NutritionDetail::new(record);
        detail.portions = portions;
        Some(detail)
    }
}

// "undetermined" units carry their real label in the modifier ("1 cup, chopped").
fn portion_from_usda(portion: UsdaPortion) -> Option<Portion> {
    let gram_weight = portion.gram_weight.filter(|g| *g > 0.0)?;
    let unit_name = portion
        .measure_unit
        .and_then(|u| u.name)
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty() && n != "undetermined");
    let modifier = portion
        .modifier
        .map(|m| m.trim().to_string())
        .filter(|m| !m.is_empty());
    let unit = match (unit_name, modifier) {
        (Some(name), Some(modifier)) => format!("{} {}", name, modifier),
        (Some(name), None) => name,
        (None, Some(modifier)) => modifier,
        (None, None) => "portion".to_string(),
    };
    Some(Portion {
        amount: portion.amount.unwrap_or(1.0),
        unit,
        gram_weight,
    })
}

/// Parses a USDA FoodData Central "Foundation Foods" JSON export.
pub fn load_usda_foundation_foods(path: &Path) -> Result<Vec<NutritionDetail>> {
    if !path.exists() {
        return Err(SearchError::Config(format!("USDA file not found at: {:?}", path)));
    }
    let reader = BufReader::new(File::open(path)?);
    let file: UsdaFile = serde_json::from_reader(reader)?;
    let total = file.foundation_foods.len();
    let details: Vec<NutritionDetail> = file
        .foundation_foods
        .into_iter()
        .filter_map(UsdaFood::into_detail)
        .collect();
    if details.len() < total {
        warn!(skipped = total - details.len(), "USDA foods without a description were skipped");
    }
    info!(count = details.len(), path = ?path, "USDA foods loaded");
    Ok(details)
}

fn parse_optional_f32(s: &str) -> Option<f32> {
    s.trim().parse::<f32>().ok().filter(|v| v.is_finite())
}

fn column(headers: &csv::StringRecord, name: &str) -> Option<usize> {
    headers.iter().position(|h| h.trim().eq_ignore_ascii_case(name))
}

fn required_column(headers: &csv::StringRecord, name: &str) -> Result<usize> {
    column(headers, name).ok_or_else(|| SearchError::Config(format!("Column '{}' not found", name)))
}

/// Flat CSV: `id,description[,category,kcal/100g,protein,fat,carbs]`.
pub fn load_nutrition_csv(csv_path: &Path) -> Result<Vec<NutritionDetail>> {
    if !csv_path.exists() {
        return Err(SearchError::Config(format!("CSV file not found at: {:?}", csv_path)));
    }
    let csv_error = |e: csv::Error| SearchError::Config(format!("Failed to read {:?}: {}", csv_path, e));

    let file = File::open(csv_path)?;
    let mut rdr = ReaderBuilder::new().has_headers(true).from_reader(file);
    let headers = rdr.headers().map_err(csv_error)?.clone();

    let id_idx = required_column(&headers, ID_COL)?;
    let description_idx = required_column(&headers, DESCRIPTION_COL)?;
    let category_idx = column(&headers, CATEGORY_COL);
    let kcal_idx = column(&headers, KCAL_COL);
    let protein_idx = column(&headers, PROTEIN_COL);
    let fat_idx = column(&headers, FAT_COL);
    let carbs_idx = column(&headers, CARBS_COL);

    let cell = |row: &csv::StringRecord, idx: Option<usize>| idx.and_then(|i| row.get(i)).and_then(parse_optional_f32);

    let mut details = Vec::new();
    for (row_index, result) in rdr.records().enumerate() {
        let row = result.map_err(csv_error)?;

        let description = row.get(description_idx).unwrap_or_default().trim().to_string();
        if description.is_empty() {
            continue;
        }
        let Some(id) = row.get(id_idx).and_then(|s| s.trim().parse::<FoodId>().ok()) else {
            warn!(row = row_index + 1, "row without a numeric id skipped");
            continue;
        };

        let mut record = NutritionRecord::new(id, description);
        record.category = category_idx
            .and_then(|i| row.get(i))
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(str::to_string);
        record.calories_per_100g = cell(&row, kcal_idx);
        record.protein = cell(&row, protein_idx);
        record.fat = cell(&row, fat_idx);
        record.carbs = cell(&row, carbs_idx);
        details.push(NutritionDetail::new(record));
    }

    info!(count = details.len(), path = ?csv_path, "CSV foods loaded");
    Ok(details)
}

pub fn load_source(path: &Path, format: SourceFormat) -> Result<Vec<NutritionDetail>> {
    match format {
        SourceFormat::Usda => load_usda_foundation_foods(path),
        SourceFormat::Csv => load_nutrition_csv(path),
    }
}

/// Feeds the index build from a bulk dataset.
pub struct Importer;

impl Importer {
    /// Rebuild when asked to, or when the local artifacts are not both present.
    /// The remote store is rebuilt only on request.
    pub fn choose_force_rebuild(settings: &Settings, requested: bool) -> bool {
        match settings.index.backend {
            IndexBackend::Local => requested || !settings.index_exists(),
            IndexBackend::Remote => requested,
        }
    }

    /// Indexes `details` and records them as the catalog searches join against.
    ///
    /// The catalog at `catalog_path` is replaced only when the index was
    /// rebuilt from these details, so the two never drift apart. A reused
    /// index keeps its catalog and the new details are ignored.
    pub async fn import(
        details: Vec<NutritionDetail>,
        builder: &IndexBuilder,
        catalog_path: &Path,
        force_rebuild: bool,
    ) -> Result<BuildReport> {
        let catalog = NutritionCatalog::from_details(details);
        info!(records = catalog.len(), force_rebuild, "starting import");
        let records = catalog.records().await?;
        let (_, report) = builder.build(&records, force_rebuild).await?;

        if report.rebuilt {
            catalog.save(catalog_path)?;
            info!(path = ?catalog_path, records = catalog.len(), "nutrition catalog saved");
        } else if catalog_path.exists() {
            warn!(
                path = ?catalog_path,
                "existing index kept, catalog left unchanged; rerun with --force to index the new data"
            );
        } else {
            warn!(
                path = ?catalog_path,
                "existing index kept but no catalog is present; rerun with --force to rebuild both"
            );
        }
        Ok(report)
    }
}
