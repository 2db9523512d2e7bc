//! Managed vector-store backend speaking the Milvus REST v2 dialect.
//!
//! Callers address the index by an alias. Each build goes into its own
//! physical collection `{alias}_{generation}`; `persist` loads it and
//! re-points the alias in one call, then drops the superseded collection.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

use super::vector_index::{
    canonical_similarity, ensure_dimension, ensure_parallel, normalize, unit_vector, IndexStore,
    ScoredEntry, VectorIndex,
};
use crate::api_connection::{ApiConnectionError, JsonClient};
use crate::config::RemoteSettings;
use crate::error::{Result, SearchError};
use crate::models::{FoodId, IndexEntry, NutritionRecord};

pub const VECTOR_FIELD: &str = "vector";
pub const METRIC_TYPE: &str = "COSINE";
const DESCRIPTION_MAX_LENGTH: usize = 1024;
const CATEGORY_MAX_LENGTH: usize = 256;
const OUTPUT_FIELDS: [&str; 2] = ["description", "category"];
const ALIAS_NOT_FOUND: i64 = 1600;

#[derive(Debug, Deserialize)]
struct ServiceResponse<T> {
    code: i64,
    #[serde(default)]
    message: Option<String>,
    data: Option<T>,
}

impl<T> ServiceResponse<T> {
    fn into_result(self) -> std::result::Result<Option<T>, ApiConnectionError> {
        if self.code != 0 {
            return Err(ApiConnectionError::ServiceError {
                code: self.code,
                message: self.message.unwrap_or_default(),
            });
        }
        Ok(self.data)
    }
}

#[derive(Debug, Deserialize)]
struct HasData {
    has: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatsData {
    row_count: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AliasData {
    collection_name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InsertData {
    insert_count: usize,
}

#[derive(Debug, Deserialize)]
struct SearchHit {
    id: FoodId,
    distance: f32,
    #[serde(default)]
    description: String,
    #[serde(default)]
    category: Option<String>,
}

/// One row in the collection schema.
#[derive(Debug, Serialize)]
struct CollectionRow<'a> {
    id: FoodId,
    vector: Vec<f32>,
    description: &'a str,
    category: &'a str,
    calories_per_100g: f32,
    protein_per_100g: f32,
    fat_per_100g: f32,
    carbs_per_100g: f32,
}

impl<'a> CollectionRow<'a> {
    fn new(record: &'a NutritionRecord, vector: Vec<f32>) -> Self {
        Self {
            id: record.id,
            vector,
            description: truncate(&record.description, DESCRIPTION_MAX_LENGTH),
            category: truncate(record.category.as_deref().unwrap_or(""), CATEGORY_MAX_LENGTH),
            calories_per_100g: record.calories_per_100g.unwrap_or(0.0),
            protein_per_100g: record.protein.unwrap_or(0.0),
            fat_per_100g: record.fat.unwrap_or(0.0),
            carbs_per_100g: record.carbs.unwrap_or(0.0),
        }
    }
}

/// Thin typed wrapper over the service endpoints used here.
#[derive(Debug, Clone)]
struct ServiceClient {
    http: JsonClient,
}

impl ServiceClient {
    async fn call<T: DeserializeOwned>(&self, path: &str, body: serde_json::Value) -> Result<Option<T>> {
        let response: ServiceResponse<T> = self.http.post(path, &body).await?;
        Ok(response.into_result()?)
    }

    async fn has_collection(&self, name: &str) -> Result<bool> {
        let data: Option<HasData> = self
            .call("/v2/vectordb/collections/has", json!({ "collectionName": name }))
            .await?;
        Ok(data.map(|d| d.has).unwrap_or(false))
    }

    async fn drop_collection(&self, name: &str) -> Result<()> {
        self.call::<serde_json::Value>("/v2/vectordb/collections/drop", json!({ "collectionName": name }))
            .await?;
        Ok(())
    }

    async fn create_collection(&self, name: &str, dimension: usize) -> Result<()> {
        let body = json!({
            "collectionName": name,
            "schema": {
                "autoId": false,
                "enableDynamicField": false,
                "fields": [
                    { "fieldName": "id", "dataType": "Int64", "isPrimary": true },
                    { "fieldName": VECTOR_FIELD, "dataType": "FloatVector",
                      "elementTypeParams": { "dim": dimension.to_string() } },
                    { "fieldName": "description", "dataType": "VarChar",
                      "elementTypeParams": { "max_length": DESCRIPTION_MAX_LENGTH.to_string() } },
                    { "fieldName": "category", "dataType": "VarChar",
                      "elementTypeParams": { "max_length": CATEGORY_MAX_LENGTH.to_string() } },
                    { "fieldName": "calories_per_100g", "dataType": "Float" },
                    { "fieldName": "protein_per_100g", "dataType": "Float" },
                    { "fieldName": "fat_per_100g", "dataType": "Float" },
                    { "fieldName": "carbs_per_100g", "dataType": "Float" }
                ]
            },
            "indexParams": [
                { "fieldName": VECTOR_FIELD, "indexName": VECTOR_FIELD,
                  "metricType": METRIC_TYPE, "indexType": "AUTOINDEX" }
            ]
        });
        self.call::<serde_json::Value>("/v2/vectordb/collections/create", body).await?;
        Ok(())
    }

    /// Seals growing segments so `get_stats` reports every inserted row.
    async fn flush_collection(&self, name: &str) -> Result<()> {
        self.call::<serde_json::Value>("/v2/vectordb/collections/flush", json!({ "collectionName": name }))
            .await?;
        Ok(())
    }

    async fn load_collection(&self, name: &str) -> Result<()> {
        self.call::<serde_json::Value>("/v2/vectordb/collections/load", json!({ "collectionName": name }))
            .await?;
        Ok(())
    }

    async fn row_count(&self, name: &str) -> Result<usize> {
        let data: Option<StatsData> = self
            .call("/v2/vectordb/collections/get_stats", json!({ "collectionName": name }))
            .await?;
        Ok(data.map(|d| d.row_count as usize).unwrap_or(0))
    }

    /// Physical collection behind `alias`, if the alias exists.
    async fn describe_alias(&self, alias: &str) -> Result<Option<String>> {
        let response: ServiceResponse<AliasData> = self
            .http
            .post("/v2/vectordb/aliases/describe", &json!({ "aliasName": alias }))
            .await?;
        if response.code != 0 && is_missing_alias(response.code, response.message.as_deref()) {
            debug!(alias, code = response.code, "alias not found");
            return Ok(None);
        }
        Ok(response.into_result()?.map(|d| d.collection_name))
    }

    async fn point_alias(&self, alias: &str, collection: &str, exists: bool) -> Result<()> {
        let path = if exists {
            "/v2/vectordb/aliases/alter"
        } else {
            "/v2/vectordb/aliases/create"
        };
        self.call::<serde_json::Value>(path, json!({ "aliasName": alias, "collectionName": collection }))
            .await?;
        Ok(())
    }
}

#[derive(Debug)]
pub struct RemoteCollection {
    client: ServiceClient,
    alias: String,
    collection: String,
    dimension: usize,
    row_count: usize,
    published: bool,
}

impl RemoteCollection {
    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn collection_name(&self) -> &str {
        &self.collection
    }

    /// Creates the physical collection. An existing one is dropped when
    /// `drop_if_exists` is set and reused otherwise. Returns whether a new
    /// collection was created.
    pub async fn create(&mut self, drop_if_exists: bool) -> Result<bool> {
        if self.client.has_collection(&self.collection).await? {
            if !drop_if_exists {
                self.row_count = self.client.row_count(&self.collection).await?;
                info!(collection = %self.collection, rows = self.row_count, "reusing existing collection");
                return Ok(false);
            }
            warn!(collection = %self.collection, "dropping existing collection");
            self.client.drop_collection(&self.collection).await?;
        }
        self.client.create_collection(&self.collection, self.dimension).await?;
        self.row_count = 0;
        info!(collection = %self.collection, dimension = self.dimension, "collection created");
        Ok(true)
    }

    fn search_target(&self) -> &str {
        if self.published {
            &self.alias
        } else {
            &self.collection
        }
    }
}

#[async_trait]
impl VectorIndex for RemoteCollection {
    fn backend_name(&self) -> &'static str {
        "remote"
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn count(&self) -> usize {
        self.row_count
    }

    async fn add(&mut self, vectors: Vec<Vec<f32>>, records: &[NutritionRecord]) -> Result<usize> {
        ensure_parallel(vectors.len(), records.len())?;
        for vector in &vectors {
            ensure_dimension(self.dimension, vector.len())?;
        }
        if records.is_empty() {
            return Ok(0);
        }
        let rows = records
            .iter()
            .zip(vectors)
            .map(|(record, vector)| Ok(CollectionRow::new(record, unit_vector(&vector)?)))
            .collect::<Result<Vec<CollectionRow<'_>>>>()?;

        let data: Option<InsertData> = self
            .client
            .call(
                "/v2/vectordb/entities/insert",
                json!({ "collectionName": self.collection, "data": rows }),
            )
            .await?;
        let inserted = data.map(|d| d.insert_count).unwrap_or(0);
        self.row_count += inserted;
        if inserted != rows.len() {
            return Err(SearchError::Remote(format!(
                "collection {} accepted {} of {} rows",
                self.collection,
                inserted,
                rows.len()
            )));
        }
        Ok(inserted)
    }

    async fn search(&self, query: &[f32], k: usize) -> Result<Vec<ScoredEntry>> {
        ensure_dimension(self.dimension, query.len())?;
        if k == 0 {
            return Ok(Vec::new());
        }
        let body = json!({
            "collectionName": self.search_target(),
            "data": [normalize(query)],
            "annsField": VECTOR_FIELD,
            "limit": k,
            "outputFields": OUTPUT_FIELDS,
            "searchParams": { "metricType": METRIC_TYPE }
        });
        let hits: Option<Vec<SearchHit>> = self.client.call("/v2/vectordb/entities/search", body).await?;

        let mut scored: Vec<ScoredEntry> = hits
            .unwrap_or_default()
            .into_iter()
            .map(|hit| ScoredEntry {
                position: 0,
                entry: IndexEntry {
                    id: hit.id,
                    description: hit.description,
                    category: hit.category.filter(|c| !c.is_empty()),
                },
                similarity: canonical_similarity(hit.distance),
            })
            .collect();
        // Stable: equal scores keep the service's order.
        scored.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
        scored.truncate(k);
        for (rank, hit) in scored.iter_mut().enumerate() {
            hit.position = rank;
        }
        Ok(scored)
    }

    async fn persist(&mut self) -> Result<()> {
        if self.published {
            return Ok(());
        }
        self.client.flush_collection(&self.collection).await?;
        self.client.load_collection(&self.collection).await?;

        let previous = self.client.describe_alias(&self.alias).await?;
        if previous.is_none() && self.client.has_collection(&self.alias).await? {
            // A plain collection squats on the alias name; it has to go first.
            warn!(collection = %self.alias, "replacing un-aliased collection");
            self.client.drop_collection(&self.alias).await?;
        }
        self.client
            .point_alias(&self.alias, &self.collection, previous.is_some())
            .await?;
        self.published = true;
        info!(alias = %self.alias, collection = %self.collection, rows = self.row_count, "alias switched");

        if let Some(old) = previous.filter(|old| old != &self.collection) {
            if let Err(e) = self.client.drop_collection(&old).await {
                warn!(collection = %old, error = %e, "failed to drop superseded collection");
            }
        }
        Ok(())
    }

    async fn discard(&mut self) -> Result<()> {
        if self.published {
            return Ok(());
        }
        warn!(collection = %self.collection, "dropping unpublished collection");
        self.client.drop_collection(&self.collection).await
    }
}

#[derive(Debug, Clone)]
pub struct RemoteCollectionStore {
    client: ServiceClient,
    alias: String,
    dimension: usize,
}

impl RemoteCollectionStore {
    pub fn new(settings: &RemoteSettings, dimension: usize) -> Result<Self> {
        dotenv::dotenv().ok();
        let token = std::env::var(&settings.token_env).ok().filter(|t| !t.is_empty());
        let http = JsonClient::new(
            &settings.endpoint,
            token,
            Duration::from_secs(settings.timeout_secs),
        )?;
        Ok(Self {
            client: ServiceClient { http },
            alias: settings.collection.clone(),
            dimension,
        })
    }

    fn handle(&self, collection: String, row_count: usize, published: bool) -> RemoteCollection {
        RemoteCollection {
            client: self.client.clone(),
            alias: self.alias.clone(),
            collection,
            dimension: self.dimension,
            row_count,
            published,
        }
    }
}

#[async_trait]
impl IndexStore for RemoteCollectionStore {
    fn backend_name(&self) -> &'static str {
        "remote"
    }

    async fn open(&self) -> Result<Option<Box<dyn VectorIndex>>> {
        let collection = match self.client.describe_alias(&self.alias).await? {
            Some(physical) => physical,
            None => {
                if !self.client.has_collection(&self.alias).await? {
                    return Ok(None);
                }
                self.alias.clone()
            }
        };
        let rows = self.client.row_count(&collection).await?;
        if rows == 0 {
            info!(collection = %collection, "remote collection is empty, treating as not built");
            return Ok(None);
        }
        self.client.load_collection(&collection).await?;
        info!(alias = %self.alias, collection = %collection, rows, "remote collection opened");
        Ok(Some(Box::new(self.handle(collection, rows, true))))
    }

    async fn create_empty(&self) -> Result<Box<dyn VectorIndex>> {
        let generation = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        let mut collection = self.handle(format!("{}_{}", self.alias, generation), 0, false);
        collection.create(true).await?;
        Ok(Box::new(collection))
    }
}

fn is_missing_alias(code: i64, message: Option<&str>) -> bool {
    code == ALIAS_NOT_FOUND
        || message
            .map(|m| m.to_lowercase().contains("alias not found"))
            .unwrap_or(false)
}

fn truncate(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((byte_index, _)) => &text[..byte_index],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::QueryInput;
    use crate::search::embedding_engine::{BatchPolicy, EmbeddingProvider};
    use crate::search::index_builder::IndexBuilder;
    use serde_json::Value;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    const INSERT: &str = "/v2/vectordb/entities/insert";
    const DESCRIBE_ALIAS: &str = "/v2/vectordb/aliases/describe";

    /// In-memory stand-in for the service: collections with row counts,
    /// aliases, and canned failures per endpoint.
    #[derive(Debug, Default)]
    struct FakeService {
        collections: HashMap<String, usize>,
        aliases: HashMap<String, String>,
        calls: Vec<String>,
        failures: HashMap<&'static str, (u16, Value)>,
        accept_at_most: Option<usize>,
        search_hits: Value,
    }

    impl FakeService {
        fn with_collection(mut self, name: &str, rows: usize) -> Self {
            self.collections.insert(name.to_string(), rows);
            self
        }

        fn with_alias(mut self, alias: &str, collection: &str) -> Self {
            self.aliases.insert(alias.to_string(), collection.to_string());
            self
        }

        fn resolve(&self, name: &str) -> String {
            self.aliases.get(name).cloned().unwrap_or_else(|| name.to_string())
        }

        fn respond(&mut self, path: &str, body: &Value) -> (u16, Value) {
            self.calls.push(path.to_string());
            if let Some(failure) = self.failures.get(path) {
                return failure.clone();
            }
            let ok = |data: Value| (200, json!({ "code": 0, "data": data }));
            let name = body["collectionName"].as_str().unwrap_or_default().to_string();
            let alias = body["aliasName"].as_str().unwrap_or_default().to_string();
            match path {
                "/v2/vectordb/collections/has" => ok(json!({ "has": self.collections.contains_key(&name) })),
                "/v2/vectordb/collections/create" => {
                    self.collections.insert(name, 0);
                    ok(json!({}))
                }
                "/v2/vectordb/collections/drop" => {
                    self.collections.remove(&name);
                    ok(json!({}))
                }
                "/v2/vectordb/collections/flush" | "/v2/vectordb/collections/load" => ok(json!({})),
                "/v2/vectordb/collections/get_stats" => {
                    let rows = self.collections.get(&self.resolve(&name)).copied().unwrap_or(0);
                    ok(json!({ "rowCount": rows }))
                }
                DESCRIBE_ALIAS => match self.aliases.get(&alias) {
                    Some(collection) => ok(json!({ "aliasName": alias, "collectionName": collection })),
                    None => (200, json!({ "code": ALIAS_NOT_FOUND, "message": "alias not found" })),
                },
                "/v2/vectordb/aliases/create" | "/v2/vectordb/aliases/alter" => {
                    self.aliases.insert(alias, name);
                    ok(json!({}))
                }
                INSERT => {
                    let rows = body["data"].as_array().map(Vec::len).unwrap_or(0);
                    let accepted = self.accept_at_most.map_or(rows, |max| rows.min(max));
                    *self.collections.entry(name).or_insert(0) += accepted;
                    ok(json!({ "insertCount": accepted }))
                }
                "/v2/vectordb/entities/search" => ok(self.search_hits.clone()),
                _ => (404, json!({ "code": 404, "message": "no such endpoint" })),
            }
        }
    }

    /// Serves a [`FakeService`] over plain HTTP/1.1, one request per connection.
    struct StubServer {
        url: String,
        state: Arc<Mutex<FakeService>>,
    }

    impl StubServer {
        async fn start(service: FakeService) -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let url = format!("http://{}", listener.local_addr().unwrap());
            let state = Arc::new(Mutex::new(service));
            let shared = state.clone();

            tokio::spawn(async move {
                while let Ok((mut stream, _)) = listener.accept().await {
                    let shared = shared.clone();
                    tokio::spawn(async move {
                        let Some((path, body)) = read_request(&mut stream).await else {
                            return;
                        };
                        let (status, reply) = shared.lock().unwrap().respond(&path, &body);
                        let payload = reply.to_string();
                        let response = format!(
                            "HTTP/1.1 {} Stub\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                            status,
                            payload.len(),
                            payload
                        );
                        let _ = stream.write_all(response.as_bytes()).await;
                    });
                }
            });

            Self { url, state }
        }

        fn store(&self) -> RemoteCollectionStore {
            let settings = RemoteSettings {
                endpoint: self.url.clone(),
                token_env: "NUTRI_TEST_NO_SUCH_TOKEN".to_string(),
                collection: "foods".to_string(),
                timeout_secs: 5,
            };
            RemoteCollectionStore::new(&settings, 2).unwrap()
        }

        fn fail(&self, path: &'static str, status: u16, reply: Value) {
            self.state.lock().unwrap().failures.insert(path, (status, reply));
        }

        fn calls(&self) -> Vec<String> {
            self.state.lock().unwrap().calls.clone()
        }

        fn position_of(&self, path: &str) -> Option<usize> {
            self.calls().iter().position(|c| c == path)
        }
    }

    async fn read_request(stream: &mut TcpStream) -> Option<(String, Value)> {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        let header_end = loop {
            let n = stream.read(&mut chunk).await.ok()?;
            if n == 0 {
                return None;
            }
            buf.extend_from_slice(&chunk[..n]);
            if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos + 4;
            }
        };
        let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
        let path = head.split_whitespace().nth(1)?.to_string();
        let length = head
            .lines()
            .filter_map(|line| line.split_once(':'))
            .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
            .and_then(|(_, value)| value.trim().parse::<usize>().ok())
            .unwrap_or(0);
        while buf.len() < header_end + length {
            let n = stream.read(&mut chunk).await.ok()?;
            if n == 0 {
                return None;
            }
            buf.extend_from_slice(&chunk[..n]);
        }
        let body = serde_json::from_slice(&buf[header_end..header_end + length]).unwrap_or(Value::Null);
        Some((path, body))
    }

    fn rows(ids: &[FoodId]) -> (Vec<Vec<f32>>, Vec<NutritionRecord>) {
        let vectors = ids.iter().map(|&id| vec![1.0, id as f32]).collect();
        let records = ids
            .iter()
            .map(|&id| NutritionRecord::new(id, format!("food {}", id)))
            .collect();
        (vectors, records)
    }

    #[tokio::test]
    async fn test_create_reuses_or_drops_existing_collection() {
        let server = StubServer::start(FakeService::default().with_collection("foods_1", 4)).await;
        let mut collection = server.store().handle("foods_1".to_string(), 0, false);

        assert!(!collection.create(false).await.unwrap());
        assert_eq!(collection.count(), 4);
        assert_eq!(server.position_of("/v2/vectordb/collections/drop"), None);

        assert!(collection.create(true).await.unwrap());
        assert_eq!(collection.count(), 0);
        assert!(server.position_of("/v2/vectordb/collections/drop").is_some());
        assert_eq!(server.state.lock().unwrap().collections.get("foods_1"), Some(&0));
    }

    #[tokio::test]
    async fn test_persist_switches_alias_and_drops_superseded() {
        let server = StubServer::start(
            FakeService::default()
                .with_collection("foods_old", 3)
                .with_alias("foods", "foods_old"),
        )
        .await;
        let store = server.store();

        let mut index = store.create_empty().await.unwrap();
        let (vectors, records) = rows(&[1, 2]);
        assert_eq!(index.add(vectors, &records).await.unwrap(), 2);
        index.persist().await.unwrap();

        {
            let state = server.state.lock().unwrap();
            let current = state.aliases.get("foods").cloned().unwrap();
            assert!(current.starts_with("foods_") && current != "foods_old");
            assert_eq!(state.collections.get(&current), Some(&2));
            assert!(!state.collections.contains_key("foods_old"));
        }
        let flush = server.position_of("/v2/vectordb/collections/flush").unwrap();
        let load = server.position_of("/v2/vectordb/collections/load").unwrap();
        assert!(flush < load);

        let reopened = store.open().await.unwrap().expect("alias resolves");
        assert_eq!(reopened.count(), 2);
    }

    #[tokio::test]
    async fn test_persist_replaces_collection_named_like_alias() {
        let server = StubServer::start(FakeService::default().with_collection("foods", 5)).await;
        let mut index = server.store().create_empty().await.unwrap();
        let (vectors, records) = rows(&[7]);
        index.add(vectors, &records).await.unwrap();
        index.persist().await.unwrap();

        let state = server.state.lock().unwrap();
        assert!(!state.collections.contains_key("foods"));
        let current = state.aliases.get("foods").unwrap();
        assert_eq!(state.collections.get(current), Some(&1));
    }

    #[tokio::test]
    async fn test_search_clamps_and_orders_scores() {
        let mut service = FakeService::default().with_collection("foods", 3);
        service.search_hits = json!([
            { "id": 2, "distance": 0.4, "description": "Beef, ground", "category": "" },
            { "id": 1, "distance": 1.0000004, "description": "Tomato, raw", "category": "Vegetables" },
            { "id": 3, "distance": 0.4, "description": "Milk, whole", "category": "Dairy" }
        ]);
        let server = StubServer::start(service).await;
        let collection = server.store().handle("foods".to_string(), 3, true);

        let hits = collection.search(&[3.0, 4.0], 2).await.unwrap();
        let ids: Vec<FoodId> = hits.iter().map(|h| h.entry.id).collect();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(hits[0].similarity, 1.0);
        assert_eq!(hits[0].entry.category.as_deref(), Some("Vegetables"));
        assert_eq!(hits[1].entry.category, None);
        assert_eq!(hits.iter().map(|h| h.position).collect::<Vec<_>>(), vec![0, 1]);

        assert!(matches!(
            collection.search(&[1.0], 2).await,
            Err(SearchError::DimensionMismatch { expected: 2, actual: 1 })
        ));
    }

    #[tokio::test]
    async fn test_insert_failures_are_classified() {
        let server = StubServer::start(FakeService::default()).await;
        let mut collection = server.store().handle("foods_1".to_string(), 0, false);
        collection.create(true).await.unwrap();
        let (vectors, records) = rows(&[1]);

        server.fail(INSERT, 200, json!({ "code": 1800, "message": "user hasn't authenticated" }));
        let err = collection.add(vectors.clone(), &records).await.unwrap_err();
        assert!(matches!(err, SearchError::Auth(_)), "got {:?}", err);

        server.fail(INSERT, 503, json!({ "code": 503, "message": "unavailable" }));
        let err = collection.add(vectors, &records).await.unwrap_err();
        assert!(err.is_transient(), "got {:?}", err);
        assert_eq!(collection.count(), 0);
    }

    #[tokio::test]
    async fn test_partial_insert_is_an_error() {
        let mut service = FakeService::default();
        service.accept_at_most = Some(1);
        let server = StubServer::start(service).await;
        let mut collection = server.store().handle("foods_1".to_string(), 0, false);
        collection.create(true).await.unwrap();

        let (vectors, records) = rows(&[1, 2]);
        let err = collection.add(vectors, &records).await.unwrap_err();
        assert!(matches!(err, SearchError::Remote(_)), "got {:?}", err);
        assert_eq!(collection.count(), 1);
    }

    #[tokio::test]
    async fn test_zero_vector_is_rejected_before_insert() {
        let server = StubServer::start(FakeService::default()).await;
        let mut collection = server.store().handle("foods_1".to_string(), 0, false);
        let records = vec![NutritionRecord::new(1, "water")];
        let err = collection.add(vec![vec![0.0, 0.0]], &records).await.unwrap_err();
        assert!(matches!(err, SearchError::DegenerateEmbedding(_)));
        assert_eq!(server.position_of(INSERT), None);
    }

    #[tokio::test]
    async fn test_open_reports_missing_alias_and_propagates_auth() {
        let server = StubServer::start(FakeService::default()).await;
        let store = server.store();
        assert!(store.open().await.unwrap().is_none());

        server.fail(DESCRIBE_ALIAS, 200, json!({ "code": 1800, "message": "user hasn't authenticated" }));
        assert!(matches!(store.open().await, Err(SearchError::Auth(_))));
    }

    #[derive(Debug)]
    struct ConstantEmbedder;

    #[async_trait]
    impl EmbeddingProvider for ConstantEmbedder {
        fn model_name(&self) -> &str {
            "constant"
        }

        fn dimension(&self) -> usize {
            2
        }

        async fn embed(&self, inputs: &[QueryInput]) -> Result<Vec<Vec<f32>>> {
            Ok(inputs.iter().map(|_| vec![0.6, 0.8]).collect())
        }
    }

    #[tokio::test]
    async fn test_failed_build_drops_unpublished_collection() {
        let server = StubServer::start(FakeService::default().with_collection("foods_old", 2).with_alias("foods", "foods_old")).await;
        server.fail(INSERT, 200, json!({ "code": 1800, "message": "user hasn't authenticated" }));
        let builder = IndexBuilder::new(
            Arc::new(ConstantEmbedder),
            Arc::new(server.store()),
            BatchPolicy {
                batch_size: 2,
                max_retries: 0,
                retry_delay: Duration::ZERO,
                request_interval: Duration::ZERO,
            },
        );

        let (_, records) = rows(&[1, 2, 3]);
        let result = builder.build(&records, true).await;
        assert!(matches!(result, Err(SearchError::Auth(_))));

        let state = server.state.lock().unwrap();
        let names: Vec<&String> = state.collections.keys().collect();
        assert_eq!(names, vec!["foods_old"]);
        assert_eq!(state.aliases.get("foods").map(String::as_str), Some("foods_old"));
    }

    #[test]
    fn test_service_error_code_is_surfaced() {
        let raw = r#"{"code":1100,"message":"collection not found"}"#;
        let response: ServiceResponse<HasData> = serde_json::from_str(raw).unwrap();
        match response.into_result() {
            Err(ApiConnectionError::ServiceError { code, message }) => {
                assert_eq!(code, 1100);
                assert_eq!(message, "collection not found");
            }
            other => panic!("unexpected: {:?}", other.map(|d| d.map(|h| h.has))),
        }
    }

    #[test]
    fn test_search_hits_parse() {
        let raw = r#"{"code":0,"data":[
            {"id":1,"distance":0.93,"description":"Tomato, raw","category":"Vegetables"},
            {"id":2,"distance":0.41,"description":"Beef, ground","category":""}]}"#;
        let response: ServiceResponse<Vec<SearchHit>> = serde_json::from_str(raw).unwrap();
        let hits = response.into_result().unwrap().unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, 1);
        assert!((hits[0].distance - 0.93).abs() < 1e-6);
        assert_eq!(hits[1].category.as_deref(), Some(""));
    }

    #[test]
    fn test_row_uses_zero_for_missing_macros() {
        let mut record = NutritionRecord::new(9, "Oats").with_category("Cereal Grains");
        record.protein = Some(13.2);
        let row = CollectionRow::new(&record, vec![0.0, 1.0]);
        let json = serde_json::to_value(&row).unwrap();
        assert_eq!(json["id"], 9);
        assert_eq!(json["category"], "Cereal Grains");
        assert_eq!(json["calories_per_100g"], 0.0);
        assert!((json["protein_per_100g"].as_f64().unwrap() - 13.2).abs() < 1e-4);
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("番茄炒蛋", 2), "番茄");
        assert_eq!(truncate("tomato", 10), "tomato");
    }
}
