use std::sync::Arc;

use common::{
    error::AppError,
    storage::vector_store::{SearchFilters, SearchRequest, VectorStore},
};
use tracing::{debug, error, instrument};

use crate::RetrievedChunk;

/// Nearest-neighbour lookup with a similarity cutoff.
///
/// The cutoff is sent to the store as its native threshold and applied again
/// on the returned hits, so a backend that ignores the threshold still cannot
/// leak low-similarity chunks. The store is asked for `top_k * overfetch`
/// hits before that re-filter.
#[derive(Clone)]
pub struct VectorRetriever {
    store: Arc<dyn VectorStore>,
    collection: String,
    overfetch_factor: usize,
}

impl VectorRetriever {
    pub fn new(store: Arc<dyn VectorStore>, collection: impl Into<String>) -> Self {
        Self {
            store,
            collection: collection.into(),
            overfetch_factor: 2,
        }
    }

    pub fn with_overfetch_factor(mut self, factor: usize) -> Self {
        self.overfetch_factor = factor.max(1);
        self
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn store(&self) -> &Arc<dyn VectorStore> {
        &self.store
    }

    /// Hits at or above `cutoff`, descending, at most `top_k`. Ties keep
    /// backend order.
    #[instrument(level = "debug", skip_all, fields(top_k, cutoff))]
    pub async fn try_retrieve(
        &self,
        query_vector: &[f32],
        top_k: usize,
        cutoff: f32,
        filters: &SearchFilters,
    ) -> Result<Vec<RetrievedChunk>, AppError> {
        if top_k == 0 {
            return Ok(Vec::new());
        }

        let request = SearchRequest {
            collection: &self.collection,
            vector: query_vector,
            limit: top_k.saturating_mul(self.overfetch_factor),
            filters,
            score_threshold: Some(cutoff),
        };
        let points = self.store.search(request).await?;
        let fetched = points.len();

        let mut hits: Vec<RetrievedChunk> = points
            .into_iter()
            .filter(|point| point.score >= cutoff)
            .map(|point| RetrievedChunk::new(point.chunk, point.score))
            .collect();
        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(top_k);

        debug!(fetched, kept = hits.len(), "Vector retrieval complete");
        Ok(hits)
    }

    /// Like [`Self::try_retrieve`], but a backend failure is logged and
    /// reported as no hits.
    pub async fn retrieve(
        &self,
        query_vector: &[f32],
        top_k: usize,
        cutoff: f32,
        filters: &SearchFilters,
    ) -> Vec<RetrievedChunk> {
        match self.try_retrieve(query_vector, top_k, cutoff, filters).await {
            Ok(hits) => hits,
            Err(err) => {
                error!(
                    backend = self.store.backend_label(),
                    collection = %self.collection,
                    error = %err,
                    "Vector retrieval failed; continuing with no hits"
                );
                Vec::new()
            }
        }
    }
}
