use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use common::{
    error::AppError,
    utils::generation::GenerationRequest,
};
use tracing::{debug, error, instrument, warn};

use crate::{
    answer::{AnswerResult, Confidence, ResponsePolicySummary, Source},
    cache::fingerprint,
    guardrails::needs_disclaimer,
    policy::Classification,
    prompt::{build_prompt, follow_up_prompt, system_prompt, PromptInput, FOLLOW_UP_SYSTEM_PROMPT},
    RetrievedChunk,
};

use super::{AnswerPipeline, AnswerRequest, PipelineStage, PipelineStageTimings, StageKind};

pub struct PipelineContext<'a> {
    pub pipeline: &'a AnswerPipeline,
    pub request: &'a AnswerRequest,
    pub classification: Classification,
    /// Set when the request may be served from, and written to, the
    /// response cache.
    pub cache_key: Option<String>,
    pub cache_hit: bool,
    /// Cleared when the result was degraded by a backend failure.
    pub cacheable: bool,
    pub query_embedding: Option<Arc<Vec<f32>>>,
    pub candidates: Vec<RetrievedChunk>,
    pub context_chunks: Vec<RetrievedChunk>,
    pub prompt: Option<String>,
    pub answer_text: Option<String>,
    result: Option<AnswerResult>,
    stage_timings: PipelineStageTimings,
}

impl<'a> PipelineContext<'a> {
    pub fn new(
        pipeline: &'a AnswerPipeline,
        request: &'a AnswerRequest,
        classification: Classification,
    ) -> Self {
        Self {
            pipeline,
            request,
            classification,
            cache_key: None,
            cache_hit: false,
            cacheable: true,
            query_embedding: None,
            candidates: Vec::new(),
            context_chunks: Vec::new(),
            prompt: None,
            answer_text: None,
            result: None,
            stage_timings: PipelineStageTimings::default(),
        }
    }

    /// A terminal result has been produced; remaining stages are skipped.
    pub fn is_complete(&self) -> bool {
        self.result.is_some()
    }

    pub fn complete(&mut self, result: AnswerResult) {
        self.result = Some(result);
    }

    /// Replaces any partial progress with the fallback answer.
    pub fn fail(&mut self) {
        self.cacheable = false;
        self.result = Some(AnswerResult::fallback(Some(&self.classification)));
    }

    pub fn take_result(&mut self) -> Option<AnswerResult> {
        self.result.take()
    }

    pub fn record_stage_duration(&mut self, kind: StageKind, duration: Duration) {
        self.stage_timings.record(kind, duration);
    }

    pub fn take_stage_timings(&mut self) -> PipelineStageTimings {
        std::mem::take(&mut self.stage_timings)
    }

    fn ensure_embedding(&self) -> Result<Arc<Vec<f32>>, AppError> {
        self.query_embedding.clone().ok_or_else(|| {
            AppError::InternalError("query embedding missing before retrieval".to_string())
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CacheCheckStage;

#[async_trait]
impl PipelineStage for CacheCheckStage {
    fn kind(&self) -> StageKind {
        StageKind::CacheCheck
    }

    async fn execute(&self, ctx: &mut PipelineContext<'_>) -> Result<(), AppError> {
        check_cache(ctx).await
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EmbedStage;

#[async_trait]
impl PipelineStage for EmbedStage {
    fn kind(&self) -> StageKind {
        StageKind::Embed
    }

    async fn execute(&self, ctx: &mut PipelineContext<'_>) -> Result<(), AppError> {
        embed(ctx).await
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetrieveStage;

#[async_trait]
impl PipelineStage for RetrieveStage {
    fn kind(&self) -> StageKind {
        StageKind::Retrieve
    }

    async fn execute(&self, ctx: &mut PipelineContext<'_>) -> Result<(), AppError> {
        retrieve(ctx).await
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RerankStage;

#[async_trait]
impl PipelineStage for RerankStage {
    fn kind(&self) -> StageKind {
        StageKind::Rerank
    }

    async fn execute(&self, ctx: &mut PipelineContext<'_>) -> Result<(), AppError> {
        rerank(ctx).await
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BuildPromptStage;

#[async_trait]
impl PipelineStage for BuildPromptStage {
    fn kind(&self) -> StageKind {
        StageKind::BuildPrompt
    }

    async fn execute(&self, ctx: &mut PipelineContext<'_>) -> Result<(), AppError> {
        prepare_prompt(ctx);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct GenerateStage;

#[async_trait]
impl PipelineStage for GenerateStage {
    fn kind(&self) -> StageKind {
        StageKind::Generate
    }

    async fn execute(&self, ctx: &mut PipelineContext<'_>) -> Result<(), AppError> {
        generate(ctx).await
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PostProcessStage;

#[async_trait]
impl PipelineStage for PostProcessStage {
    fn kind(&self) -> StageKind {
        StageKind::PostProcess
    }

    async fn execute(&self, ctx: &mut PipelineContext<'_>) -> Result<(), AppError> {
        post_process(ctx).await
    }
}

#[instrument(level = "trace", skip_all)]
pub async fn check_cache(ctx: &mut PipelineContext<'_>) -> Result<(), AppError> {
    if !ctx.request.is_cacheable() {
        debug!("Request carries conversation state; bypassing response cache");
        return Ok(());
    }

    let key = fingerprint(&ctx.request.query, &ctx.request.filters);
    if let Some(hit) = ctx.pipeline.response_cache.get(&key).await {
        debug!("Serving answer from response cache");
        ctx.cache_hit = true;
        ctx.complete(hit);
    }
    ctx.cache_key = Some(key);
    Ok(())
}

#[instrument(level = "trace", skip_all)]
pub async fn embed(ctx: &mut PipelineContext<'_>) -> Result<(), AppError> {
    let query = ctx.request.query.as_str();
    if let Some(cached) = ctx.pipeline.embedding_cache.get(query).await {
        debug!("Reusing cached query embedding");
        ctx.query_embedding = Some(cached);
        return Ok(());
    }

    debug!(model = %ctx.pipeline.embedder.model_code(), "Generating query embedding");
    let embedding = Arc::new(ctx.pipeline.embedder.embed(query).await?);
    ctx.pipeline
        .embedding_cache
        .insert(query.to_string(), Arc::clone(&embedding))
        .await;
    ctx.query_embedding = Some(embedding);
    Ok(())
}

#[instrument(level = "trace", skip_all)]
pub async fn retrieve(ctx: &mut PipelineContext<'_>) -> Result<(), AppError> {
    let embedding = ctx.ensure_embedding()?;
    let pipeline = ctx.pipeline;
    let tuning = &pipeline.tuning;
    let retriever = &pipeline.retriever;

    let hits = match retriever
        .try_retrieve(
            &embedding,
            tuning.top_k,
            tuning.similarity_cutoff,
            &ctx.request.filters,
        )
        .await
    {
        Ok(hits) => hits,
        Err(err) => {
            error!(
                backend = retriever.store().backend_label(),
                collection = retriever.collection(),
                error = %err,
                "Vector retrieval failed; answering without context"
            );
            ctx.cacheable = false;
            Vec::new()
        }
    };

    if hits.is_empty() {
        debug!("No chunk cleared the similarity cutoff");
        ctx.complete(AnswerResult::no_knowledge(&ctx.classification));
        return Ok(());
    }

    debug!(hits = hits.len(), "Retrieved candidate chunks");
    ctx.candidates = hits;
    Ok(())
}

#[instrument(level = "trace", skip_all)]
pub async fn rerank(ctx: &mut PipelineContext<'_>) -> Result<(), AppError> {
    let top_n = ctx.classification.policy.top_n;
    let candidates = std::mem::take(&mut ctx.candidates);
    let pipeline = ctx.pipeline;
    let reranker = &pipeline.reranker;

    if !reranker.should_rerank(candidates.len(), top_n) {
        debug!(
            candidates = candidates.len(),
            top_n,
            reranker_available = reranker.is_available(),
            "Skipping rerank; keeping retrieval order"
        );
        ctx.context_chunks = candidates.into_iter().take(top_n).collect();
        return Ok(());
    }

    let budget = pipeline.tuning.rerank_timeout;
    let reranked = tokio::time::timeout(
        budget,
        reranker.rerank_parallel(&ctx.request.query, candidates.clone(), top_n),
    )
    .await;

    ctx.context_chunks = match reranked {
        Ok(chunks) => chunks,
        Err(_) => {
            warn!(
                timeout_ms = budget.as_millis(),
                "Rerank timed out; keeping retrieval order"
            );
            candidates.into_iter().take(top_n).collect()
        }
    };
    Ok(())
}

pub fn prepare_prompt(ctx: &mut PipelineContext<'_>) {
    let prompt = build_prompt(PromptInput {
        chunks: &ctx.context_chunks,
        query: &ctx.request.query,
        history: &ctx.request.history,
        summary: ctx.request.summary.as_deref(),
        history_turns: ctx.pipeline.tuning.history_turns,
    });
    debug!(prompt_chars = prompt.chars().count(), "Prompt assembled");
    ctx.prompt = Some(prompt);
}

#[instrument(level = "trace", skip_all)]
pub async fn generate(ctx: &mut PipelineContext<'_>) -> Result<(), AppError> {
    let prompt = ctx
        .prompt
        .take()
        .ok_or_else(|| AppError::InternalError("prompt missing before generation".to_string()))?;
    let policy = ctx.classification.policy;

    let request = GenerationRequest::new(prompt)
        .with_system_prompt(system_prompt(&policy))
        .with_temperature(ctx.pipeline.tuning.answer_temperature)
        .with_max_tokens(policy.max_tokens);

    let text = ctx.pipeline.generator.generate(&request).await?;
    let text = text.trim();
    if text.is_empty() {
        return Err(AppError::LLMParsing(
            "generator returned an empty answer".to_string(),
        ));
    }

    ctx.answer_text = Some(text.to_string());
    Ok(())
}

#[instrument(level = "trace", skip_all)]
pub async fn post_process(ctx: &mut PipelineContext<'_>) -> Result<(), AppError> {
    let answer = ctx
        .answer_text
        .take()
        .ok_or_else(|| AppError::InternalError("answer missing before post-processing".to_string()))?;
    let tuning = &ctx.pipeline.tuning;
    let classification = ctx.classification;

    let answer_text = if needs_disclaimer(&ctx.request.query) {
        format!("{}\n\n{}", tuning.legal_disclaimer, answer)
    } else {
        answer
    };

    let sources: Vec<Source> = ctx.context_chunks.iter().map(Source::from).collect();
    let similarities: Vec<f32> = sources.iter().map(|source| source.score).collect();
    let confidence = Confidence::from_scores(&similarities);

    let follow_up_questions = if tuning.follow_ups_enabled {
        follow_ups(ctx, &answer_text).await
    } else {
        Vec::new()
    };

    ctx.complete(AnswerResult {
        answer_text,
        sources,
        confidence,
        query_embedding_similarity: similarities,
        follow_up_questions,
        response_level: classification.policy.level,
        response_policy: ResponsePolicySummary::from(&classification.policy),
        classification_type: Some(classification.query_type),
        response_mode: Some(classification.mode),
    });
    Ok(())
}

/// Best effort; any failure yields no suggestions.
async fn follow_ups(ctx: &PipelineContext<'_>, answer: &str) -> Vec<String> {
    let tuning = &ctx.pipeline.tuning;
    let request = GenerationRequest::new(follow_up_prompt(&ctx.request.query, answer))
        .with_system_prompt(FOLLOW_UP_SYSTEM_PROMPT)
        .with_temperature(tuning.follow_up_temperature)
        .with_max_tokens(tuning.follow_up_max_tokens);

    let parsed = match ctx.pipeline.generator.generate(&request).await {
        Ok(raw) => parse_follow_ups(&raw, tuning.max_follow_ups),
        Err(err) => Err(err),
    };

    parsed.unwrap_or_else(|err| {
        warn!(error = %err, "Follow-up generation failed; returning none");
        Vec::new()
    })
}

/// Reads a JSON array of strings, tolerating a surrounding code fence.
/// Blank and non-string entries are dropped.
pub fn parse_follow_ups(raw: &str, max: usize) -> Result<Vec<String>, AppError> {
    let body = strip_code_fence(raw.trim());
    let values: Vec<serde_json::Value> = serde_json::from_str(body)
        .map_err(|e| AppError::LLMParsing(format!("follow-ups are not a JSON array: {e}")))?;

    Ok(values
        .into_iter()
        .filter_map(|value| value.as_str().map(|s| s.trim().to_string()))
        .filter(|question| !question.is_empty())
        .take(max)
        .collect())
}

fn strip_code_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    // Drop the info string ("json") on the opening fence line.
    let rest = rest.split_once('\n').map_or("", |(_, body)| body);
    rest.trim_end().strip_suffix("```").unwrap_or(rest).trim()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn follow_ups_parse_plain_and_fenced_arrays() {
        let plain = parse_follow_ups(r#"["What is Form W-4?", "When is it due?"]"#, 5)
            .expect("plain array");
        assert_eq!(plain, vec!["What is Form W-4?", "When is it due?"]);

        let fenced = parse_follow_ups("```json\n[\"A?\", \"  \", 3, \"B?\"]\n```", 5)
            .expect("fenced array");
        assert_eq!(fenced, vec!["A?", "B?"]);
    }

    #[test]
    fn follow_ups_are_capped() {
        let raw = r#"["1","2","3","4","5","6","7"]"#;
        assert_eq!(parse_follow_ups(raw, 5).expect("array").len(), 5);
    }

    #[test]
    fn non_array_follow_ups_are_rejected() {
        assert!(matches!(
            parse_follow_ups("Here are some questions: ...", 5),
            Err(AppError::LLMParsing(_))
        ));
        assert!(parse_follow_ups(r#"{"questions": []}"#, 5).is_err());
    }
}
