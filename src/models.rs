use serde::{Deserialize, Serialize};

/// Stable external key of a nutrition record (USDA `fdcId`).
pub type FoodId = i64;

/// One food as produced by the importer. Macros are per 100 g.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NutritionRecord {
    pub id: FoodId,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default)]
    pub calories_per_100g: Option<f32>,
    #[serde(default)]
    pub protein: Option<f32>,
    #[serde(default)]
    pub fat: Option<f32>,
    #[serde(default)]
    pub carbs: Option<f32>,
}

impl NutritionRecord {
    pub fn new(id: FoodId, description: impl Into<String>) -> Self {
        Self {
            id,
            description: description.into(),
            category: None,
            calories_per_100g: None,
            protein: None,
            fat: None,
            carbs: None,
        }
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    /// Text that gets embedded for this record: description plus category.
    pub fn search_text(&self) -> String {
        match self.category.as_deref().map(str::trim) {
            Some(category) if !category.is_empty() => {
                format!("{} ({})", self.description.trim(), category)
            }
            _ => self.description.trim().to_string(),
        }
    }

    pub fn index_entry(&self) -> IndexEntry {
        IndexEntry {
            id: self.id,
            description: self.description.clone(),
            category: self.category.clone(),
        }
    }
}

/// Household measure of a food, display only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Portion {
    pub amount: f32,
    pub unit: String,
    pub gram_weight: f32,
}

impl Portion {
    /// Energy of this portion given the food's energy density.
    pub fn calories(&self, calories_per_100g: f32) -> f32 {
        calories_per_100g * self.gram_weight / 100.0
    }
}

/// Side-table row stored next to each indexed vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub id: FoodId,
    pub description: String,
    #[serde(default)]
    pub category: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub id: FoodId,
    pub description: String,
    pub category: Option<String>,
    pub similarity: f32,
    #[serde(default)]
    pub calories_per_100g: Option<f32>,
}

/// Full view of a food returned by a `NutritionLookup`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NutritionDetail {
    pub record: NutritionRecord,
    /// Unit of `calories_per_100g`, usually "kcal".
    #[serde(default)]
    pub energy_unit: Option<String>,
    #[serde(default)]
    pub portions: Vec<Portion>,
}

impl NutritionDetail {
    pub fn new(record: NutritionRecord) -> Self {
        let energy_unit = record.calories_per_100g.map(|_| "kcal".to_string());
        Self {
            record,
            energy_unit,
            portions: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetailedSearchResult {
    #[serde(flatten)]
    pub result: SearchResult,
    pub protein: Option<f32>,
    pub fat: Option<f32>,
    pub carbs: Option<f32>,
    pub unit: Option<String>,
    pub portions: Vec<Portion>,
}

impl DetailedSearchResult {
    pub fn merge(mut result: SearchResult, detail: &NutritionDetail) -> Self {
        result.calories_per_100g = detail.record.calories_per_100g;
        Self {
            result,
            protein: detail.record.protein,
            fat: detail.record.fat,
            carbs: detail.record.carbs,
            unit: detail.energy_unit.clone(),
            portions: detail.portions.clone(),
        }
    }
}

/// What a caller asks the engine to find.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryInput {
    Text(String),
    Image { bytes: Vec<u8>, format: String },
}

impl From<&str> for QueryInput {
    fn from(text: &str) -> Self {
        QueryInput::Text(text.to_string())
    }
}

impl From<String> for QueryInput {
    fn from(text: String) -> Self {
        QueryInput::Text(text)
    }
}
