use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::{
    error::AppError,
    storage::{
        types::chunk_record::ChunkRecord,
        vector_store::{
            matches_filters, CollectionInfo, ScoredPoint, SearchRequest, VectorStore,
        },
    },
    utils::embedding::cosine_similarity,
};

#[derive(Default)]
struct MemoryCollection {
    vector_size: usize,
    points: Vec<ChunkRecord>,
}

/// Brute-force cosine store for tests and offline runs.
pub struct MemoryVectorStore {
    collections: RwLock<HashMap<String, MemoryCollection>>,
    enforce_threshold: bool,
}

impl Default for MemoryVectorStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryVectorStore {
    pub fn new() -> Self {
        Self {
            collections: RwLock::new(HashMap::new()),
            enforce_threshold: true,
        }
    }

    /// When disabled, `score_threshold` is ignored, mimicking a backend
    /// that does not honour it.
    pub fn with_threshold_enforcement(mut self, enforce: bool) -> Self {
        self.enforce_threshold = enforce;
        self
    }
}

#[async_trait]
impl VectorStore for MemoryVectorStore {
    fn backend_label(&self) -> &'static str {
        "memory"
    }

    async fn ensure_collection(&self, name: &str, vector_size: usize) -> Result<(), AppError> {
        let mut collections = self.collections.write().await;
        collections
            .entry(name.to_string())
            .or_insert_with(|| MemoryCollection {
                vector_size,
                points: Vec::new(),
            });
        Ok(())
    }

    async fn search(&self, request: SearchRequest<'_>) -> Result<Vec<ScoredPoint>, AppError> {
        let collections = self.collections.read().await;
        let collection = collections.get(request.collection).ok_or_else(|| AppError::Backend {
            service: "memory",
            status: Some(404),
            message: format!("collection '{}' not found", request.collection),
        })?;

        let mut hits: Vec<ScoredPoint> = collection
            .points
            .iter()
            .filter(|record| matches_filters(record, request.filters))
            .map(|record| ScoredPoint {
                score: cosine_similarity(request.vector, &record.embedding),
                chunk: record.clone(),
            })
            .filter(|hit| match request.score_threshold {
                Some(threshold) if self.enforce_threshold => hit.score >= threshold,
                _ => true,
            })
            .collect();

        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(request.limit);
        Ok(hits)
    }

    async fn collection_info(&self, name: &str) -> Result<Option<CollectionInfo>, AppError> {
        let collections = self.collections.read().await;
        Ok(collections.get(name).map(|collection| CollectionInfo {
            name: name.to_string(),
            vector_size: collection.vector_size,
            points_count: collection.points.len() as u64,
            status: "green".to_string(),
        }))
    }

    async fn delete_collection(&self, name: &str) -> Result<(), AppError> {
        self.collections.write().await.remove(name);
        Ok(())
    }

    async fn upsert(&self, name: &str, records: Vec<ChunkRecord>) -> Result<usize, AppError> {
        let mut collections = self.collections.write().await;
        let collection = collections.get_mut(name).ok_or_else(|| AppError::Backend {
            service: "memory",
            status: Some(404),
            message: format!("collection '{name}' not found"),
        })?;

        if let Some(bad) = records
            .iter()
            .find(|record| record.embedding.len() != collection.vector_size)
        {
            return Err(AppError::Validation(format!(
                "chunk {} has {} dimensions, collection expects {}",
                bad.id,
                bad.embedding.len(),
                collection.vector_size
            )));
        }

        let count = records.len();
        for record in records {
            match collection.points.iter_mut().find(|p| p.id == record.id) {
                Some(existing) => *existing = record,
                None => collection.points.push(record),
            }
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{
        types::chunk_record::{ChunkSource, ContentType},
        vector_store::SearchFilters,
    };

    fn record(url: &str, content_type: ContentType, vector: Vec<f32>) -> ChunkRecord {
        ChunkRecord::new(
            ChunkSource::new(url, "Title", content_type),
            format!("text for {url}"),
            0,
            20,
            vector,
            "test-model",
        )
        .expect("valid record")
    }

    async fn seeded() -> MemoryVectorStore {
        let store = MemoryVectorStore::new();
        store.ensure_collection("c", 2).await.expect("collection");
        store
            .upsert(
                "c",
                vec![
                    record("https://a", ContentType::Html, vec![1.0, 0.0]),
                    record("https://b", ContentType::Pdf, vec![0.7, 0.7]),
                    record("https://c", ContentType::Html, vec![0.0, 1.0]),
                ],
            )
            .await
            .expect("upsert");
        store
    }

    #[tokio::test]
    async fn search_orders_by_cosine_and_applies_threshold() {
        let store = seeded().await;
        let filters = SearchFilters::new();
        let hits = store
            .search(SearchRequest {
                collection: "c",
                vector: &[1.0, 0.0],
                limit: 10,
                filters: &filters,
                score_threshold: Some(0.5),
            })
            .await
            .expect("search");

        let urls: Vec<&str> = hits.iter().map(|h| h.chunk.url.as_str()).collect();
        assert_eq!(urls, vec!["https://a", "https://b"]);
        assert!(hits[0].score >= hits[1].score);
    }

    #[tokio::test]
    async fn threshold_can_be_ignored() {
        let store = seeded().await.with_threshold_enforcement(false);
        let filters = SearchFilters::new();
        let hits = store
            .search(SearchRequest {
                collection: "c",
                vector: &[1.0, 0.0],
                limit: 10,
                filters: &filters,
                score_threshold: Some(0.99),
            })
            .await
            .expect("search");
        assert_eq!(hits.len(), 3);
    }

    #[tokio::test]
    async fn filters_restrict_hits() {
        let store = seeded().await;
        let mut filters = SearchFilters::new();
        filters.insert("content_type".into(), "pdf".into());
        let hits = store
            .search(SearchRequest {
                collection: "c",
                vector: &[1.0, 0.0],
                limit: 10,
                filters: &filters,
                score_threshold: None,
            })
            .await
            .expect("search");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk.url, "https://b");
    }

    #[tokio::test]
    async fn upsert_replaces_by_id_and_checks_dimensions() {
        let store = seeded().await;
        store
            .upsert("c", vec![record("https://a", ContentType::Html, vec![0.5, 0.5])])
            .await
            .expect("replace");
        let info = store.collection_info("c").await.expect("info").expect("exists");
        assert_eq!(info.points_count, 3);
        assert_eq!(info.vector_size, 2);

        let err = store
            .upsert("c", vec![record("https://d", ContentType::Faq, vec![1.0])])
            .await
            .expect_err("wrong dimension");
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn missing_collection_is_a_backend_error() {
        let store = MemoryVectorStore::new();
        let filters = SearchFilters::new();
        let result = store
            .search(SearchRequest {
                collection: "absent",
                vector: &[1.0],
                limit: 1,
                filters: &filters,
                score_threshold: None,
            })
            .await;
        assert!(matches!(result, Err(AppError::Backend { .. })));

        store.ensure_collection("absent", 1).await.expect("create");
        store.delete_collection("absent").await.expect("delete");
        assert!(store.collection_info("absent").await.expect("info").is_none());
    }
}
