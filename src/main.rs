use anyhow::{bail, Context, Result};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use tracing::warn;

use nutri_search::cli::{parse_args, Command};
use nutri_search::config::{IndexBackend, Settings};
use nutri_search::logging;
use nutri_search::models::QueryInput;
use nutri_search::nutrition_lookup::NutritionCatalog;
use nutri_search::search::{
    build_embedder, build_index_store, load_source, BatchPolicy, Importer, IndexBuilder, QueryEngine, SourceFormat,
};

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = parse_args();
    let settings = Settings::load(cli.config.as_deref()).context("Failed to load settings")?;
    logging::init(&settings.logging);

    match cli.command {
        Command::Import { source, format, force } => import(&settings, &source, format.into(), force).await,
        Command::Search {
            query,
            image,
            limit,
            threshold,
            detail,
        } => {
            let input = match (query, image) {
                (_, Some(path)) => read_image(&path).await?,
                (Some(text), None) => QueryInput::Text(text),
                (None, None) => bail!("either a query or --image is required"),
            };
            let limit = limit.unwrap_or(settings.search.limit);
            let threshold = threshold.unwrap_or(settings.search.threshold);
            search(&settings, input, limit, threshold, detail).await
        }
        Command::Status => status(&settings).await,
    }
}

async fn import(settings: &Settings, source: &Path, format: SourceFormat, requested: bool) -> Result<()> {
    let details = load_source(source, format)
        .with_context(|| format!("Failed to load nutrition data from {:?}", source))?;
    if details.is_empty() {
        bail!("No usable foods found in {:?}", source);
    }
    let force = Importer::choose_force_rebuild(settings, requested);
    let embedder = build_embedder(&settings.embedding).context("Failed to initialise embedding provider")?;
    let store = build_index_store(settings).context("Failed to initialise index backend")?;
    let builder = IndexBuilder::new(embedder, store, BatchPolicy::from_settings(&settings.embedding));

    let report = Importer::import(details, &builder, &settings.index.catalog_path, force)
        .await
        .context("Import failed")?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn search(settings: &Settings, input: QueryInput, limit: usize, threshold: f32, detail: bool) -> Result<()> {
    if !settings.index.catalog_path.exists() {
        bail!(
            "No nutrition catalog at {:?}; run `import` first",
            settings.index.catalog_path
        );
    }
    let catalog = Arc::new(
        NutritionCatalog::load(&settings.index.catalog_path).context("Failed to load nutrition catalog")?,
    );
    let embedder = build_embedder(&settings.embedding).context("Failed to initialise embedding provider")?;
    let store = build_index_store(settings).context("Failed to initialise index backend")?;
    let engine = QueryEngine::new(
        embedder,
        store,
        catalog.clone(),
        catalog,
        BatchPolicy::from_settings(&settings.embedding),
        settings.search.clone(),
    );

    let output = if detail {
        serde_json::to_string_pretty(&engine.search_with_detail(input, limit, threshold).await?)?
    } else {
        serde_json::to_string_pretty(&engine.search(input, limit, threshold).await?)?
    };
    println!("{}", output);
    Ok(())
}

async fn status(settings: &Settings) -> Result<()> {
    let store = build_index_store(settings).context("Failed to initialise index backend")?;
    let indexed = match store.open().await {
        Ok(index) => index.map(|index| index.count()),
        Err(e) => {
            warn!(error = %e, "could not open index");
            None
        }
    };
    let catalog_records = NutritionCatalog::load(&settings.index.catalog_path)
        .map(|catalog| catalog.len())
        .ok();

    let mut report = json!({
        "backend": store.backend_name(),
        "embedding_model": settings.embedding.model,
        "dimension": settings.embedding.dimension,
        "built": indexed.is_some(),
        "indexed": indexed.unwrap_or(0),
        "catalog_records": catalog_records,
    });
    match settings.index.backend {
        IndexBackend::Local => {
            report["artifacts_present"] = json!(settings.index_exists());
        }
        IndexBackend::Remote => {
            report["collection"] = json!(settings.remote.collection);
        }
    }
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn read_image(path: &Path) -> Result<QueryInput> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read image {:?}", path))?;
    let format = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("jpeg")
        .to_lowercase();
    Ok(QueryInput::Image { bytes, format })
}
