use std::sync::Arc;

use common::{error::AppError, utils::config::AppConfig};
use futures::{stream, StreamExt};
use tracing::{debug, info, warn};

use super::RelevanceScorer;
use crate::RetrievedChunk;

/// Relevance recorded for chunks whose batch could not be scored; the floor
/// of the logistic scale.
pub const UNSCORED_RELEVANCE: f32 = 0.0;

/// Second-pass ordering of retrieval hits by a relevance model.
///
/// Every failure path degrades to the first `top_n` candidates in retrieval
/// order; nothing here returns an error.
#[derive(Clone)]
pub struct Reranker {
    scorer: Option<Arc<dyn RelevanceScorer>>,
    batch_size: usize,
    workers: usize,
    min_candidates: usize,
}

struct BatchOutcome {
    index: usize,
    len: usize,
    scores: Result<Vec<f32>, AppError>,
}

impl Reranker {
    pub fn new(scorer: Option<Arc<dyn RelevanceScorer>>) -> Self {
        Self {
            scorer,
            batch_size: 8,
            workers: 3,
            min_candidates: 10,
        }
    }

    pub fn from_config(config: &AppConfig, scorer: Option<Arc<dyn RelevanceScorer>>) -> Self {
        Self::new(scorer)
            .with_batching(config.rerank_batch_size, config.rerank_workers)
            .with_min_candidates(config.rerank_min_candidates)
    }

    pub fn with_batching(mut self, batch_size: usize, workers: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self.workers = workers.max(1);
        self
    }

    pub fn with_min_candidates(mut self, min_candidates: usize) -> Self {
        self.min_candidates = min_candidates;
        self
    }

    pub fn is_available(&self) -> bool {
        self.scorer.is_some()
    }

    /// Reranking only pays off on a candidate set larger than what is kept.
    pub fn should_rerank(&self, candidates: usize, top_n: usize) -> bool {
        self.is_available() && candidates > top_n && candidates >= self.min_candidates
    }

    /// Scores every candidate in one call.
    pub async fn rerank(
        &self,
        query: &str,
        candidates: Vec<RetrievedChunk>,
        top_n: usize,
    ) -> Vec<RetrievedChunk> {
        let Some(scorer) = self.scorer.as_ref() else {
            warn!("Reranker not available; keeping retrieval order");
            return keep_top(candidates, top_n);
        };

        let documents = documents_for(&candidates);
        let expected = documents.len();
        match scorer.score(query, documents).await {
            Ok(scores) if scores.len() == expected => {
                let scores = scores.into_iter().map(Some).collect();
                apply_scores(candidates, scores, top_n)
            }
            Ok(scores) => {
                warn!(
                    expected,
                    received = scores.len(),
                    "Reranker returned a mismatched score count; keeping retrieval order"
                );
                keep_top(candidates, top_n)
            }
            Err(err) => {
                warn!(error = %err, "Reranking failed; keeping retrieval order");
                keep_top(candidates, top_n)
            }
        }
    }

    /// Scores fixed-size batches concurrently on a bounded number of workers,
    /// then merges them in batch order and sorts globally. Produces the same
    /// order as [`Self::rerank`]. A failed batch sorts after every scored
    /// chunk and carries [`UNSCORED_RELEVANCE`].
    pub async fn rerank_parallel(
        &self,
        query: &str,
        candidates: Vec<RetrievedChunk>,
        top_n: usize,
    ) -> Vec<RetrievedChunk> {
        let Some(scorer) = self.scorer.as_deref() else {
            warn!("Reranker not available; keeping retrieval order");
            return keep_top(candidates, top_n);
        };

        if candidates.len() <= self.batch_size {
            debug!(candidates = candidates.len(), "Single batch; reranking sequentially");
            return self.rerank(query, candidates, top_n).await;
        }

        let batches: Vec<Vec<String>> = candidates
            .chunks(self.batch_size)
            .map(documents_for)
            .collect();
        let batch_count = batches.len();
        info!(
            candidates = candidates.len(),
            batches = batch_count,
            workers = self.workers,
            "Reranking in parallel batches"
        );

        let mut outcomes: Vec<BatchOutcome> = stream::iter(batches.into_iter().enumerate())
            .map(|(index, documents)| async move {
                let len = documents.len();
                let scores = scorer.score(query, documents).await.and_then(|scores| {
                    if scores.len() == len {
                        Ok(scores)
                    } else {
                        Err(AppError::InternalError(format!(
                            "expected {len} scores, received {}",
                            scores.len()
                        )))
                    }
                });
                BatchOutcome { index, len, scores }
            })
            .buffer_unordered(self.workers)
            .collect()
            .await;
        outcomes.sort_by_key(|outcome| outcome.index);

        let mut failed = 0usize;
        let mut merged: Vec<Option<f32>> = Vec::with_capacity(candidates.len());
        for outcome in outcomes {
            match outcome.scores {
                Ok(scores) => merged.extend(scores.into_iter().map(Some)),
                Err(err) => {
                    failed += 1;
                    warn!(batch = outcome.index, error = %err, "Rerank batch failed; demoting its chunks");
                    merged.extend(std::iter::repeat(None).take(outcome.len));
                }
            }
        }

        if failed == batch_count {
            warn!("Every rerank batch failed; keeping retrieval order");
            return keep_top(candidates, top_n);
        }

        apply_scores(candidates, merged, top_n)
    }
}

fn documents_for(candidates: &[RetrievedChunk]) -> Vec<String> {
    candidates
        .iter()
        .map(|candidate| candidate.chunk.text.clone())
        .collect()
}

fn keep_top(mut candidates: Vec<RetrievedChunk>, top_n: usize) -> Vec<RetrievedChunk> {
    candidates.truncate(top_n);
    candidates
}

/// Attaches rerank scores, sorts descending (stable), keeps `top_n`.
/// Unscored chunks sort last with [`UNSCORED_RELEVANCE`].
fn apply_scores(
    candidates: Vec<RetrievedChunk>,
    scores: Vec<Option<f32>>,
    top_n: usize,
) -> Vec<RetrievedChunk> {
    let mut scored: Vec<(f32, RetrievedChunk)> = candidates
        .into_iter()
        .zip(scores)
        .map(|(mut candidate, score)| {
            candidate.rerank_score = Some(score.unwrap_or(UNSCORED_RELEVANCE));
            (score.unwrap_or(f32::NEG_INFINITY), candidate)
        })
        .collect();

    scored.sort_by(|a, b| b.0.total_cmp(&a.0));
    scored.truncate(top_n);
    scored.into_iter().map(|(_, candidate)| candidate).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use common::storage::types::chunk_record::{ChunkRecord, ChunkSource, ContentType};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scores a document by the number encoded after "doc-".
    struct NumberScorer {
        calls: AtomicUsize,
        fail_containing: Option<&'static str>,
    }

    impl NumberScorer {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail_containing: None,
            }
        }

        fn failing_on(marker: &'static str) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail_containing: Some(marker),
            }
        }
    }

    #[async_trait]
    impl RelevanceScorer for NumberScorer {
        async fn score(&self, _query: &str, documents: Vec<String>) -> Result<Vec<f32>, AppError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(marker) = self.fail_containing {
                if documents.iter().any(|doc| doc.contains(marker)) {
                    return Err(AppError::InternalError("model crashed".into()));
                }
            }
            Ok(documents
                .iter()
                .map(|doc| {
                    let n: f32 = doc.trim_start_matches("doc-").parse().unwrap_or(0.0);
                    // Odd numbers rank above even ones to shuffle retrieval order.
                    if n % 2.0 == 1.0 {
                        0.5 + n / 1000.0
                    } else {
                        n / 1000.0
                    }
                })
                .collect())
        }
    }

    fn candidates(count: usize) -> Vec<RetrievedChunk> {
        (0..count)
            .map(|i| {
                let record = ChunkRecord::new(
                    ChunkSource::new(format!("https://irs.gov/{i}"), "T", ContentType::Html),
                    format!("doc-{i}"),
                    0,
                    10,
                    Vec::new(),
                    "m",
                )
                .expect("record");
                RetrievedChunk::new(record, 0.9 - i as f32 * 0.01)
            })
            .collect()
    }

    fn urls(chunks: &[RetrievedChunk]) -> Vec<String> {
        chunks.iter().map(|c| c.chunk.url.clone()).collect()
    }

    #[tokio::test]
    async fn sequential_and_parallel_agree() {
        let scorer: Arc<dyn RelevanceScorer> = Arc::new(NumberScorer::new());
        let reranker = Reranker::new(Some(scorer)).with_batching(8, 3);

        let sequential = reranker.rerank("q", candidates(30), 5).await;
        let parallel = reranker.rerank_parallel("q", candidates(30), 5).await;

        assert_eq!(urls(&sequential), urls(&parallel));
        assert_eq!(sequential.len(), 5);
        assert_eq!(sequential[0].chunk.url, "https://irs.gov/29");
        assert!(sequential.iter().all(|c| c.rerank_score.is_some()));
    }

    #[tokio::test]
    async fn parallel_uses_one_call_per_batch() {
        let scorer = Arc::new(NumberScorer::new());
        let reranker = Reranker::new(Some(scorer.clone() as Arc<dyn RelevanceScorer>))
            .with_batching(8, 3);

        let _ = reranker.rerank_parallel("q", candidates(20), 4).await;
        assert_eq!(scorer.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn failed_batch_sorts_last() {
        // doc-9 lives in the second batch of eight.
        let scorer: Arc<dyn RelevanceScorer> = Arc::new(NumberScorer::failing_on("doc-9"));
        let reranker = Reranker::new(Some(scorer)).with_batching(8, 2);

        let ranked = reranker.rerank_parallel("q", candidates(24), 24).await;
        assert_eq!(ranked.len(), 24);

        let demoted: Vec<&RetrievedChunk> = ranked.iter().skip(16).collect();
        assert!(demoted
            .iter()
            .all(|c| c.rerank_score == Some(UNSCORED_RELEVANCE)));
        assert_eq!(demoted[0].chunk.url, "https://irs.gov/8");
    }

    #[tokio::test]
    async fn failed_batch_does_not_lift_confidence() {
        let scorer: Arc<dyn RelevanceScorer> = Arc::new(NumberScorer::failing_on("doc-9"));
        let reranker = Reranker::new(Some(scorer)).with_batching(8, 2);

        let ranked = reranker.rerank_parallel("q", candidates(24), 24).await;
        let sources: Vec<crate::Source> = ranked.iter().map(crate::Source::from).collect();

        // Demoted chunks retrieved at cosine ~0.8 must not cite that score.
        assert!(sources.iter().skip(16).all(|s| s.score.abs() < f32::EPSILON));
    }

    #[tokio::test]
    async fn unavailable_model_keeps_retrieval_order() {
        let reranker = Reranker::new(None);
        let ranked = reranker.rerank_parallel("q", candidates(12), 3).await;

        assert_eq!(
            urls(&ranked),
            vec!["https://irs.gov/0", "https://irs.gov/1", "https://irs.gov/2"]
        );
        assert!(ranked.iter().all(|c| c.rerank_score.is_none()));
    }

    #[tokio::test]
    async fn scoring_failure_keeps_retrieval_order() {
        let scorer: Arc<dyn RelevanceScorer> = Arc::new(NumberScorer::failing_on("doc-"));
        let reranker = Reranker::new(Some(scorer));

        let ranked = reranker.rerank("q", candidates(12), 2).await;
        assert_eq!(urls(&ranked), vec!["https://irs.gov/0", "https://irs.gov/1"]);

        let ranked = reranker.rerank_parallel("q", candidates(20), 2).await;
        assert_eq!(urls(&ranked), vec!["https://irs.gov/0", "https://irs.gov/1"]);
    }

    #[test]
    fn threshold_gates_reranking() {
        let scorer: Arc<dyn RelevanceScorer> = Arc::new(NumberScorer::new());
        let reranker = Reranker::new(Some(scorer)).with_min_candidates(10);

        assert!(!reranker.should_rerank(9, 3), "below minimum");
        assert!(!reranker.should_rerank(10, 10), "nothing to drop");
        assert!(reranker.should_rerank(10, 3));
        assert!(!Reranker::new(None).should_rerank(40, 3));
    }
}
