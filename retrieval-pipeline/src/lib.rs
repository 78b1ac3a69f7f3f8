pub mod answer;
pub mod cache;
pub mod guardrails;
pub mod pipeline;
pub mod policy;
pub mod prompt;
pub mod reranking;
pub mod retriever;

use common::storage::types::chunk_record::ChunkRecord;

pub use answer::{AnswerResult, Confidence, Source};
pub use pipeline::{
    AnswerPipeline, AnswerRequest, AnswerRun, AnswerTuning, PipelineStageTimings, StageKind,
};

// A retrieved chunk with its cosine similarity and, once reranked, its
// cross-encoder relevance.
#[derive(Debug, Clone)]
pub struct RetrievedChunk {
    pub chunk: ChunkRecord,
    pub score: f32,
    pub rerank_score: Option<f32>,
}

impl RetrievedChunk {
    pub fn new(chunk: ChunkRecord, score: f32) -> Self {
        Self {
            chunk,
            score,
            rerank_score: None,
        }
    }

    /// Relevance used for final ordering and citation scores.
    pub fn ranking_score(&self) -> f32 {
        self.rerank_score.unwrap_or(self.score)
    }
}
