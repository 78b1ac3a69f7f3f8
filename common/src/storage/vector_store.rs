use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{error::AppError, storage::types::chunk_record::ChunkRecord};

/// Payload keys that may appear in an equality filter.
pub const ALLOWED_FILTER_KEYS: [&str; 6] = [
    "content_type",
    "url",
    "title",
    "section_heading",
    "language",
    "embedding_model",
];

/// Conjunctive equality constraints; sorted so serialization is stable.
pub type SearchFilters = BTreeMap<String, String>;

pub fn validate_filters(filters: &SearchFilters) -> Result<(), AppError> {
    if let Some(key) = filters
        .keys()
        .find(|key| !ALLOWED_FILTER_KEYS.contains(&key.as_str()))
    {
        return Err(AppError::Validation(format!(
            "unknown filter key '{key}'; allowed keys: {}",
            ALLOWED_FILTER_KEYS.join(", ")
        )));
    }
    Ok(())
}

/// Whether a record satisfies every filter constraint.
pub fn matches_filters(record: &ChunkRecord, filters: &SearchFilters) -> bool {
    filters
        .iter()
        .all(|(key, value)| record.attribute(key) == Some(value.as_str()))
}

#[derive(Debug, Clone)]
pub struct SearchRequest<'a> {
    pub collection: &'a str,
    pub vector: &'a [f32],
    pub limit: usize,
    pub filters: &'a SearchFilters,
    pub score_threshold: Option<f32>,
}

/// A nearest-neighbour hit with its payload.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredPoint {
    pub score: f32,
    pub chunk: ChunkRecord,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionInfo {
    pub name: String,
    pub vector_size: usize,
    pub points_count: u64,
    pub status: String,
}

/// Similarity-search contract over a named collection of chunk records.
#[async_trait]
pub trait VectorStore: Send + Sync {
    fn backend_label(&self) -> &'static str;

    /// Creates the collection (cosine distance) when it does not exist yet.
    async fn ensure_collection(&self, name: &str, vector_size: usize) -> Result<(), AppError>;

    /// Hits in descending score order, at most `request.limit`.
    async fn search(&self, request: SearchRequest<'_>) -> Result<Vec<ScoredPoint>, AppError>;

    /// `None` when the collection does not exist.
    async fn collection_info(&self, name: &str) -> Result<Option<CollectionInfo>, AppError>;

    async fn delete_collection(&self, name: &str) -> Result<(), AppError>;

    /// Inserts or replaces records by id. Every record must carry its vector.
    async fn upsert(&self, name: &str, records: Vec<ChunkRecord>) -> Result<usize, AppError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::types::chunk_record::{ChunkSource, ContentType};

    #[test]
    fn unknown_filter_keys_are_rejected() {
        let mut filters = SearchFilters::new();
        filters.insert("content_type".into(), "pdf".into());
        assert!(validate_filters(&filters).is_ok());

        filters.insert("crawl_ts".into(), "2024".into());
        let err = validate_filters(&filters).expect_err("crawl_ts is not filterable");
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[test]
    fn filters_are_conjunctive() {
        let record = ChunkRecord::new(
            ChunkSource::new("https://www.irs.gov/forms", "Forms", ContentType::Form),
            "Form W-9".into(),
            0,
            8,
            Vec::new(),
            "m",
        )
        .expect("valid");

        let mut filters = SearchFilters::new();
        assert!(matches_filters(&record, &filters));

        filters.insert("content_type".into(), "form".into());
        assert!(matches_filters(&record, &filters));

        filters.insert("language".into(), "es".into());
        assert!(!matches_filters(&record, &filters));

        let mut heading = SearchFilters::new();
        heading.insert("section_heading".into(), "Anything".into());
        assert!(!matches_filters(&record, &heading), "missing heading never matches");
    }
}
