use std::time::Duration;

use common::utils::config::{AppConfig, DEFAULT_LEGAL_DISCLAIMER};
use serde::{Deserialize, Serialize};

/// Tunable parameters that govern each answer stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnswerTuning {
    /// Hits kept after the similarity cutoff, before reranking.
    pub top_k: usize,
    pub similarity_cutoff: f32,
    /// Turns of conversation history rendered into the prompt.
    pub history_turns: usize,
    /// Upper bound on the whole rerank stage.
    pub rerank_timeout: Duration,
    pub answer_temperature: f32,
    pub follow_ups_enabled: bool,
    pub follow_up_temperature: f32,
    pub follow_up_max_tokens: u32,
    pub max_follow_ups: usize,
    pub legal_disclaimer: String,
}

impl Default for AnswerTuning {
    fn default() -> Self {
        Self {
            top_k: 40,
            similarity_cutoff: 0.22,
            history_turns: 10,
            rerank_timeout: Duration::from_secs(20),
            answer_temperature: 0.0,
            follow_ups_enabled: true,
            follow_up_temperature: 0.2,
            follow_up_max_tokens: 128,
            max_follow_ups: 5,
            legal_disclaimer: DEFAULT_LEGAL_DISCLAIMER.to_string(),
        }
    }
}

impl AnswerTuning {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            top_k: config.top_k,
            similarity_cutoff: config.similarity_cutoff,
            history_turns: config.history_turns,
            rerank_timeout: config.rerank_timeout(),
            follow_ups_enabled: config.follow_ups_enabled,
            legal_disclaimer: config.legal_disclaimer.clone(),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_values_flow_into_tuning() {
        let config = AppConfig {
            top_k: 12,
            similarity_cutoff: 0.4,
            follow_ups_enabled: false,
            rerank_timeout_secs: 5,
            ..AppConfig::default()
        };
        let tuning = AnswerTuning::from_config(&config);

        assert_eq!(tuning.top_k, 12);
        assert!((tuning.similarity_cutoff - 0.4).abs() < f32::EPSILON);
        assert!(!tuning.follow_ups_enabled);
        assert_eq!(tuning.rerank_timeout, Duration::from_secs(5));
        assert_eq!(tuning.follow_up_max_tokens, 128);
        assert_eq!(tuning.legal_disclaimer, DEFAULT_LEGAL_DISCLAIMER);
    }
}
