mod config;
mod stages;


pub use config::AnswerTuning;
pub use stages::{parse_follow_ups, PipelineContext};

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use common::{
    error::AppError,
    storage::{
        types::message::Message,
        vector_store::{SearchFilters, VectorStore},
    },
    utils::{config::AppConfig, embedding::Embedder, generation::TextGenerator},
};
use serde::Serialize;
use tracing::{error, info, instrument, warn};

use crate::{
    answer::AnswerResult,
    cache::{embedding_cache, response_cache, EmbeddingCache, ResponseCache},
    guardrails::{log_preview, validate_request},
    policy::classify,
    reranking::{RelevanceScorer, Reranker},
    retriever::VectorRetriever,
};

use stages::{
    BuildPromptStage, CacheCheckStage, EmbedStage, GenerateStage, PostProcessStage, RerankStage,
    RetrieveStage,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    CacheCheck,
    Embed,
    Retrieve,
    Rerank,
    BuildPrompt,
    Generate,
    PostProcess,
}

#[async_trait]
pub trait PipelineStage: Send + Sync {
    fn kind(&self) -> StageKind;
    async fn execute(&self, ctx: &mut PipelineContext<'_>) -> Result<(), AppError>;
}

pub type BoxedStage = Box<dyn PipelineStage>;

/// Wall-clock time spent in each stage that actually ran.
#[derive(Debug, Default, Clone, Serialize)]
pub struct PipelineStageTimings {
    timings: Vec<(StageKind, Duration)>,
}

impl PipelineStageTimings {
    pub fn record(&mut self, kind: StageKind, duration: Duration) {
        self.timings.push((kind, duration));
    }

    pub fn into_vec(self) -> Vec<(StageKind, Duration)> {
        self.timings
    }

    pub fn stages(&self) -> Vec<StageKind> {
        self.timings.iter().map(|(kind, _)| *kind).collect()
    }

    pub fn total(&self) -> Duration {
        self.timings.iter().map(|(_, d)| *d).sum()
    }
}

/// One inbound question.
#[derive(Debug, Clone, Default)]
pub struct AnswerRequest {
    pub query: String,
    pub filters: SearchFilters,
    pub history: Vec<Message>,
    pub summary: Option<String>,
}

impl AnswerRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Self::default()
        }
    }

    pub fn with_filters(mut self, filters: SearchFilters) -> Self {
        self.filters = filters;
        self
    }

    pub fn with_history(mut self, history: Vec<Message>) -> Self {
        self.history = history;
        self
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }

    /// Answers that depend on prior turns are not a function of the query
    /// and filters alone.
    pub fn is_cacheable(&self) -> bool {
        self.history.is_empty() && self.summary.is_none()
    }
}

pub struct AnswerRun {
    pub result: AnswerResult,
    pub stage_timings: PipelineStageTimings,
    pub cache_hit: bool,
}

/// Sequences the answer stages and owns the failure boundary: a failing
/// stage turns into the no-knowledge fallback, never into an error.
pub struct AnswerPipeline {
    embedder: Arc<dyn Embedder>,
    generator: Arc<dyn TextGenerator>,
    retriever: VectorRetriever,
    reranker: Reranker,
    response_cache: Arc<ResponseCache>,
    embedding_cache: Arc<EmbeddingCache>,
    tuning: AnswerTuning,
}

impl AnswerPipeline {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        generator: Arc<dyn TextGenerator>,
        retriever: VectorRetriever,
        reranker: Reranker,
        tuning: AnswerTuning,
    ) -> Self {
        Self {
            embedder,
            generator,
            retriever,
            reranker,
            response_cache: Arc::new(response_cache(512, Duration::from_secs(900))),
            embedding_cache: Arc::new(embedding_cache(256)),
            tuning,
        }
    }

    pub fn with_caches(
        mut self,
        response_cache: Arc<ResponseCache>,
        embedding_cache: Arc<EmbeddingCache>,
    ) -> Self {
        self.response_cache = response_cache;
        self.embedding_cache = embedding_cache;
        self
    }

    /// Wires every collaborator from configuration. Backends are chosen by
    /// the caller; this only applies sizes and budgets.
    pub fn from_config(
        config: &AppConfig,
        embedder: Arc<dyn Embedder>,
        generator: Arc<dyn TextGenerator>,
        store: Arc<dyn VectorStore>,
        scorer: Option<Arc<dyn RelevanceScorer>>,
    ) -> Self {
        let retriever = VectorRetriever::new(store, config.collection_name.clone())
            .with_overfetch_factor(config.overfetch_factor);
        let reranker = Reranker::from_config(config, scorer);
        if !reranker.is_available() {
            warn!("No relevance model available; answers keep retrieval order");
        }

        Self::new(
            embedder,
            generator,
            retriever,
            reranker,
            AnswerTuning::from_config(config),
        )
        .with_caches(
            Arc::new(response_cache(
                config.response_cache_max_entries,
                config.response_cache_ttl(),
            )),
            Arc::new(embedding_cache(config.embedding_cache_max_entries)),
        )
    }

    /// Answers a question. Only input validation produces an `Err`.
    pub async fn answer(&self, request: AnswerRequest) -> Result<AnswerResult, AppError> {
        self.answer_with_timings(request).await.map(|run| run.result)
    }

    #[instrument(skip_all, fields(filters = request.filters.len(), history = request.history.len()))]
    pub async fn answer_with_timings(&self, request: AnswerRequest) -> Result<AnswerRun, AppError> {
        validate_request(&request.query, &request.filters, &request.history)?;

        let classification = classify(&request.query);
        let (preview, preview_truncated) = log_preview(&request.query);
        info!(
            query_chars = request.query.chars().count(),
            preview_truncated,
            preview = %preview,
            classification = %classification.query_type,
            top_n = classification.policy.top_n,
            "Starting answer pipeline"
        );

        let mut ctx = PipelineContext::new(self, &request, classification);

        for stage in default_stages() {
            if ctx.is_complete() {
                break;
            }
            let kind = stage.kind();
            let start = Instant::now();
            let outcome = stage.execute(&mut ctx).await;
            ctx.record_stage_duration(kind, start.elapsed());

            if let Err(err) = outcome {
                error!(stage = ?kind, error = %err, "Answer stage failed; returning fallback");
                ctx.fail();
                break;
            }
        }

        self.finalize(ctx).await
    }

    async fn finalize(&self, mut ctx: PipelineContext<'_>) -> Result<AnswerRun, AppError> {
        let cache_hit = ctx.cache_hit;
        let stage_timings = ctx.take_stage_timings();
        let result = ctx
            .take_result()
            .unwrap_or_else(|| AnswerResult::fallback(Some(&ctx.classification)));

        if let Some(key) = ctx.cache_key.take() {
            if ctx.cacheable && !cache_hit {
                self.response_cache.insert(key, result.clone()).await;
            }
        }

        info!(
            confidence = ?result.confidence,
            sources = result.sources.len(),
            cache_hit,
            total_ms = stage_timings.total().as_millis(),
            "Answer pipeline finished"
        );

        Ok(AnswerRun {
            result,
            stage_timings,
            cache_hit,
        })
    }
}

fn default_stages() -> Vec<BoxedStage> {
    vec![
        Box::new(CacheCheckStage),
        Box::new(EmbedStage),
        Box::new(RetrieveStage),
        Box::new(RerankStage),
        Box::new(BuildPromptStage),
        Box::new(GenerateStage),
        Box::new(PostProcessStage),
    ]
}
