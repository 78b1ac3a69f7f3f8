use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, instrument, warn};

use crate::{
    error::AppError,
    storage::{
        types::chunk_record::ChunkRecord,
        vector_store::{CollectionInfo, ScoredPoint, SearchFilters, SearchRequest, VectorStore},
    },
    utils::{backoff::CallPolicy, config::AppConfig},
};

const HNSW_M: u32 = 64;
const HNSW_EF_CONSTRUCT: u32 = 128;
const HNSW_EF_SEARCH: u32 = 128;
const FULL_SCAN_THRESHOLD: u32 = 10_000;

/// Qdrant over its REST API.
#[derive(Clone)]
pub struct QdrantStore {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    policy: CallPolicy,
}

#[derive(Deserialize)]
struct QdrantEnvelope<T> {
    result: T,
}

#[derive(Deserialize)]
struct QdrantHit {
    #[serde(default)]
    id: Value,
    score: f32,
    #[serde(default)]
    payload: Option<Value>,
}

#[derive(Deserialize)]
struct QdrantCollection {
    #[serde(default)]
    status: String,
    #[serde(default)]
    points_count: Option<u64>,
    config: QdrantCollectionConfig,
}

#[derive(Deserialize)]
struct QdrantCollectionConfig {
    params: QdrantParams,
}

#[derive(Deserialize)]
struct QdrantParams {
    vectors: QdrantVectorParams,
}

#[derive(Deserialize)]
struct QdrantVectorParams {
    size: usize,
}

#[derive(Serialize)]
struct QdrantPoint<'a> {
    id: &'a str,
    vector: &'a [f32],
    payload: &'a ChunkRecord,
}

impl QdrantStore {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        policy: CallPolicy,
    ) -> Result<Self, AppError> {
        let http = reqwest::Client::builder().build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.filter(|key| !key.trim().is_empty()),
            policy,
        })
    }

    pub fn from_config(config: &AppConfig) -> Result<Self, AppError> {
        Self::new(
            config.qdrant_url.clone(),
            config.qdrant_api_key.clone(),
            CallPolicy::from_config(config),
        )
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self.http.request(method, format!("{}{path}", self.base_url));
        match &self.api_key {
            Some(key) => builder.header("api-key", key),
            None => builder,
        }
    }

    /// Sends a request with an optional JSON body, returning the status and
    /// the parsed body of a successful response. 404 is passed through.
    async fn send(
        &self,
        operation: &'static str,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<(StatusCode, Value), AppError> {
        self.policy
            .run(operation, || {
                let mut builder = self.request(method.clone(), path);
                if let Some(body) = body {
                    builder = builder.json(body);
                }
                async move {
                    let response = builder.send().await?;
                    let status = response.status();
                    if status == StatusCode::NOT_FOUND {
                        return Ok((status, Value::Null));
                    }
                    if !status.is_success() {
                        let message = response.text().await.unwrap_or_default();
                        return Err(AppError::Backend {
                            service: "qdrant",
                            status: Some(status.as_u16()),
                            message,
                        });
                    }
                    let value = response.json::<Value>().await?;
                    Ok((status, value))
                }
            })
            .await
    }
}

/// Builds `{"must": [{"key", "match": {"value"}}]}` or nothing.
fn filter_json(filters: &SearchFilters) -> Option<Value> {
    if filters.is_empty() {
        return None;
    }
    let must: Vec<Value> = filters
        .iter()
        .map(|(key, value)| json!({ "key": key, "match": { "value": value } }))
        .collect();
    Some(json!({ "must": must }))
}

/// Qdrant point ids are either UUID strings or unsigned integers.
fn point_id(id: &Value) -> String {
    match id {
        Value::String(id) => id.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn decode_hit(hit: QdrantHit) -> Option<ScoredPoint> {
    let id = point_id(&hit.id);
    let payload = hit.payload?;
    match serde_json::from_value::<ChunkRecord>(payload) {
        Ok(mut chunk) => {
            chunk.fill_missing(&id);
            Some(ScoredPoint {
                score: hit.score,
                chunk,
            })
        }
        Err(err) => {
            warn!(point = %id, error = %err, "Skipping hit with malformed payload");
            None
        }
    }
}

fn not_found(name: &str) -> AppError {
    AppError::Backend {
        service: "qdrant",
        status: Some(404),
        message: format!("collection '{name}' not found"),
    }
}

#[async_trait]
impl VectorStore for QdrantStore {
    fn backend_label(&self) -> &'static str {
        "qdrant"
    }

    #[instrument(skip(self))]
    async fn ensure_collection(&self, name: &str, vector_size: usize) -> Result<(), AppError> {
        if self.collection_info(name).await?.is_some() {
            info!(collection = name, "Collection already exists");
            return Ok(());
        }

        let body = json!({
            "vectors": { "size": vector_size, "distance": "Cosine" },
            "hnsw_config": {
                "m": HNSW_M,
                "ef_construct": HNSW_EF_CONSTRUCT,
                "full_scan_threshold": FULL_SCAN_THRESHOLD
            },
            "optimizers_config": { "memmap_threshold": 20_000, "default_segment_number": 2 }
        });
        self.send(
            "qdrant_create_collection",
            Method::PUT,
            &format!("/collections/{name}"),
            Some(&body),
        )
        .await?;
        info!(collection = name, vector_size, "Collection created");
        Ok(())
    }

    #[instrument(level = "debug", skip_all, fields(collection = request.collection, limit = request.limit))]
    async fn search(&self, request: SearchRequest<'_>) -> Result<Vec<ScoredPoint>, AppError> {
        let mut body = json!({
            "vector": request.vector,
            "limit": request.limit,
            "with_payload": true,
            "params": { "hnsw_ef": HNSW_EF_SEARCH }
        });
        if let Some(filter) = filter_json(request.filters) {
            body["filter"] = filter;
        }
        if let Some(threshold) = request.score_threshold {
            body["score_threshold"] = json!(threshold);
        }

        let (status, value) = self
            .send(
                "qdrant_search",
                Method::POST,
                &format!("/collections/{}/points/search", request.collection),
                Some(&body),
            )
            .await?;
        if status == StatusCode::NOT_FOUND {
            return Err(not_found(request.collection));
        }

        let envelope: QdrantEnvelope<Vec<QdrantHit>> = serde_json::from_value(value)?;
        let hits: Vec<ScoredPoint> = envelope.result.into_iter().filter_map(decode_hit).collect();

        debug!(hits = hits.len(), "Qdrant search complete");
        Ok(hits)
    }

    async fn collection_info(&self, name: &str) -> Result<Option<CollectionInfo>, AppError> {
        let (status, value) = self
            .send(
                "qdrant_collection_info",
                Method::GET,
                &format!("/collections/{name}"),
                None,
            )
            .await?;
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let envelope: QdrantEnvelope<QdrantCollection> = serde_json::from_value(value)?;
        Ok(Some(CollectionInfo {
            name: name.to_string(),
            vector_size: envelope.result.config.params.vectors.size,
            points_count: envelope.result.points_count.unwrap_or_default(),
            status: envelope.result.status,
        }))
    }

    #[instrument(skip(self))]
    async fn delete_collection(&self, name: &str) -> Result<(), AppError> {
        let (status, _) = self
            .send(
                "qdrant_delete_collection",
                Method::DELETE,
                &format!("/collections/{name}"),
                None,
            )
            .await?;
        if status == StatusCode::NOT_FOUND {
            return Err(not_found(name));
        }
        info!(collection = name, "Collection deleted");
        Ok(())
    }

    #[instrument(skip(self, records), fields(count = records.len()))]
    async fn upsert(&self, name: &str, records: Vec<ChunkRecord>) -> Result<usize, AppError> {
        if records.is_empty() {
            return Ok(0);
        }
        if let Some(bad) = records.iter().find(|record| record.embedding.is_empty()) {
            return Err(AppError::Validation(format!(
                "chunk {} has no embedding vector",
                bad.id
            )));
        }

        let points: Vec<QdrantPoint<'_>> = records
            .iter()
            .map(|record| QdrantPoint {
                id: &record.id,
                vector: &record.embedding,
                payload: record,
            })
            .collect();
        let body = json!({ "points": points });

        let (status, _) = self
            .send(
                "qdrant_upsert",
                Method::PUT,
                &format!("/collections/{name}/points?wait=true"),
                Some(&body),
            )
            .await?;
        if status == StatusCode::NOT_FOUND {
            return Err(not_found(name));
        }
        Ok(records.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filters_become_must_clauses() {
        assert!(filter_json(&SearchFilters::new()).is_none());

        let mut filters = SearchFilters::new();
        filters.insert("content_type".into(), "pdf".into());
        filters.insert("language".into(), "en".into());
        let filter = filter_json(&filters).expect("filter");

        assert_eq!(
            filter,
            json!({"must": [
                {"key": "content_type", "match": {"value": "pdf"}},
                {"key": "language", "match": {"value": "en"}}
            ]})
        );
    }

    #[test]
    fn collection_info_parses_rest_shape() {
        let value = json!({
            "result": {
                "status": "green",
                "points_count": 1200,
                "config": { "params": { "vectors": { "size": 1536, "distance": "Cosine" } } }
            },
            "status": "ok",
            "time": 0.001
        });
        let envelope: QdrantEnvelope<QdrantCollection> =
            serde_json::from_value(value).expect("parse");
        assert_eq!(envelope.result.config.params.vectors.size, 1536);
        assert_eq!(envelope.result.points_count, Some(1200));
    }

    #[test]
    fn search_hits_from_external_ingest_decode() {
        let value = json!({
            "result": [
                {
                    "id": "0b6f1e8c-3f2a-5d4b-8c9e-1a2b3c4d5e6f",
                    "version": 3,
                    "score": 0.83,
                    "payload": {
                        "url": "https://www.irs.gov/publications/p501",
                        "title": "The 2024 standard deduction for single filers is $14,600.",
                        "section_heading": "Standard deduction amount",
                        "text": "The 2024 standard deduction for single filers is $14,600.",
                        "char_start": 120,
                        "char_end": 178,
                        "content_type": "html",
                        "crawl_ts": "2024-05-01T12:34:56.789012",
                        "language": "en",
                        "embedding_model": "text-embedding-3-small",
                        "tokens": 14,
                        "hash": "9f2c"
                    }
                },
                { "id": 42, "score": 0.5, "payload": { "text": "no metadata" } },
                { "id": 43, "score": 0.4 }
            ],
            "status": "ok",
            "time": 0.002
        });

        let envelope: QdrantEnvelope<Vec<QdrantHit>> =
            serde_json::from_value(value).expect("parse");
        let hits: Vec<ScoredPoint> = envelope.result.into_iter().filter_map(decode_hit).collect();

        assert_eq!(hits.len(), 1);
        let chunk = &hits[0].chunk;
        assert_eq!(chunk.id, "0b6f1e8c-3f2a-5d4b-8c9e-1a2b3c4d5e6f");
        assert_eq!(chunk.char_start, 120);
        assert_eq!(chunk.crawl_ts.to_rfc3339(), "2024-05-01T12:34:56.789012+00:00");
        assert!((hits[0].score - 0.83).abs() < f32::EPSILON);
    }

    #[test]
    fn integer_point_ids_become_strings() {
        assert_eq!(point_id(&json!(42)), "42");
        assert_eq!(point_id(&json!("abc")), "abc");
        assert_eq!(point_id(&Value::Null), "");
    }

    #[test]
    fn blank_api_key_is_dropped() {
        let store = QdrantStore::new("http://localhost:6333/", Some("  ".into()), CallPolicy::default())
            .expect("client");
        assert!(store.api_key.is_none());
        assert_eq!(store.base_url, "http://localhost:6333");
    }
}
