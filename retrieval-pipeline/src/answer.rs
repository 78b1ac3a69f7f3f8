use serde::{Deserialize, Serialize};

use crate::{
    guardrails::NO_KNOWLEDGE_MESSAGE,
    policy::{Classification, QueryType, ResponseLevel, ResponseMode, ResponsePolicy, FALLBACK_POLICY},
    RetrievedChunk,
};

const SNIPPET_CHARS: usize = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

impl Confidence {
    /// High from a mean of 0.8, medium from 0.5; both bounds inclusive.
    pub fn from_mean(mean: f32) -> Self {
        if mean >= 0.8 {
            Confidence::High
        } else if mean >= 0.5 {
            Confidence::Medium
        } else {
            Confidence::Low
        }
    }

    pub fn from_scores(scores: &[f32]) -> Self {
        if scores.is_empty() {
            return Confidence::Low;
        }
        let sum: f32 = scores.iter().sum();
        Self::from_mean(sum / scores.len() as f32)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub url: String,
    pub title: String,
    pub section: Option<String>,
    pub snippet: String,
    pub char_start: usize,
    pub char_end: usize,
    pub score: f32,
}

impl From<&RetrievedChunk> for Source {
    fn from(hit: &RetrievedChunk) -> Self {
        Self {
            url: hit.chunk.url.clone(),
            title: hit.chunk.title.clone(),
            section: hit.chunk.section_heading.clone(),
            snippet: hit.chunk.text.chars().take(SNIPPET_CHARS).collect(),
            char_start: hit.chunk.char_start,
            char_end: hit.chunk.char_end,
            score: clamp_unit(hit.ranking_score()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponsePolicySummary {
    pub max_tokens: u32,
    pub top_n: usize,
}

impl From<&ResponsePolicy> for ResponsePolicySummary {
    fn from(policy: &ResponsePolicy) -> Self {
        Self {
            max_tokens: policy.max_tokens,
            top_n: policy.top_n,
        }
    }
}

/// Structured answer handed back to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnswerResult {
    pub answer_text: String,
    pub sources: Vec<Source>,
    pub confidence: Confidence,
    pub query_embedding_similarity: Vec<f32>,
    pub follow_up_questions: Vec<String>,
    pub response_level: ResponseLevel,
    pub response_policy: ResponsePolicySummary,
    pub classification_type: Option<QueryType>,
    pub response_mode: Option<ResponseMode>,
}

impl AnswerResult {
    /// Nothing relevant was retrieved; generation never ran.
    pub fn no_knowledge(classification: &Classification) -> Self {
        Self {
            answer_text: NO_KNOWLEDGE_MESSAGE.to_string(),
            sources: Vec::new(),
            confidence: Confidence::Low,
            query_embedding_similarity: Vec::new(),
            follow_up_questions: Vec::new(),
            response_level: classification.policy.level,
            response_policy: ResponsePolicySummary::from(&classification.policy),
            classification_type: Some(classification.query_type),
            response_mode: Some(classification.mode),
        }
    }

    /// A stage failed. Carries the fallback budget but keeps whatever
    /// classification was already made.
    pub fn fallback(classification: Option<&Classification>) -> Self {
        Self {
            answer_text: NO_KNOWLEDGE_MESSAGE.to_string(),
            sources: Vec::new(),
            confidence: Confidence::Low,
            query_embedding_similarity: Vec::new(),
            follow_up_questions: Vec::new(),
            response_level: FALLBACK_POLICY.level,
            response_policy: ResponsePolicySummary::from(&FALLBACK_POLICY),
            classification_type: classification.map(|c| c.query_type),
            response_mode: classification.map(|c| c.mode),
        }
    }

    pub fn is_no_knowledge(&self) -> bool {
        self.answer_text == NO_KNOWLEDGE_MESSAGE && self.sources.is_empty()
    }
}

pub fn clamp_unit(value: f32) -> f32 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::classify;
    use common::storage::types::chunk_record::{ChunkRecord, ChunkSource, ContentType};

    #[test]
    fn confidence_tiers_and_inclusive_bounds() {
        assert_eq!(Confidence::from_mean(0.9), Confidence::High);
        assert_eq!(Confidence::from_mean(0.8), Confidence::High);
        assert_eq!(Confidence::from_mean(0.79), Confidence::Medium);
        assert_eq!(Confidence::from_mean(0.6), Confidence::Medium);
        assert_eq!(Confidence::from_mean(0.5), Confidence::Medium);
        assert_eq!(Confidence::from_mean(0.3), Confidence::Low);
        assert_eq!(Confidence::from_scores(&[]), Confidence::Low);
        assert_eq!(Confidence::from_scores(&[1.0, 0.6]), Confidence::High);
    }

    #[test]
    fn sources_are_clamped_and_trimmed() {
        let record = ChunkRecord::new(
            ChunkSource::new("https://www.irs.gov/a", "A", ContentType::Faq),
            "é".repeat(450),
            0,
            450,
            Vec::new(),
            "m",
        )
        .expect("record");
        let mut hit = RetrievedChunk::new(record, 1.3);
        let source = Source::from(&hit);
        assert!((source.score - 1.0).abs() < f32::EPSILON);
        assert_eq!(source.snippet.chars().count(), 300);

        hit.rerank_score = Some(-2.0);
        assert_eq!(Source::from(&hit).score, 0.0);
        hit.rerank_score = Some(f32::NAN);
        assert_eq!(Source::from(&hit).score, 0.0);
    }

    #[test]
    fn serialized_field_names_match_contract() {
        let result = AnswerResult::no_knowledge(&classify("How do I apply for an EIN?"));
        let value = serde_json::to_value(&result).expect("json");

        assert_eq!(value["confidence"], "low");
        assert_eq!(value["response_level"], "detailed");
        assert_eq!(value["classification_type"], "procedural");
        assert_eq!(value["response_mode"], "step_by_step");
        assert_eq!(value["response_policy"]["top_n"], 4);
        assert_eq!(value["sources"], serde_json::json!([]));
    }

    #[test]
    fn fallback_uses_simple_budget() {
        let result = AnswerResult::fallback(None);
        assert!(result.is_no_knowledge());
        assert_eq!(result.response_level, ResponseLevel::Simple);
        assert_eq!(result.response_policy.max_tokens, 250);
        assert_eq!(result.response_policy.top_n, 2);
        assert!(result.classification_type.is_none());
    }
}
