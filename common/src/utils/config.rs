use std::time::Duration;

use config::{Config, Environment, File};
use serde::Deserialize;

use crate::error::AppError;

#[derive(Clone, Copy, Deserialize, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingBackend {
    #[default]
    OpenAI,
    FastEmbed,
    Hashed,
}

#[derive(Clone, Copy, Deserialize, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum GenerationBackend {
    #[default]
    OpenAI,
    Ollama,
}

#[derive(Clone, Deserialize, Debug)]
pub struct AppConfig {
    #[serde(default)]
    pub openai_api_key: Option<String>,
    #[serde(default = "default_base_url")]
    pub openai_base_url: String,

    #[serde(default)]
    pub embedding_backend: EmbeddingBackend,
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    #[serde(default = "default_embedding_dimensions")]
    pub embedding_dimensions: u32,
    #[serde(default)]
    pub fastembed_model: Option<String>,
    #[serde(default)]
    pub fastembed_cache_dir: Option<String>,
    #[serde(default)]
    pub fastembed_show_download_progress: Option<bool>,
    #[serde(default)]
    pub fastembed_max_length: Option<usize>,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    #[serde(default)]
    pub generation_backend: GenerationBackend,
    #[serde(default = "default_chat_model")]
    pub chat_model: String,
    #[serde(default = "default_ollama_host")]
    pub ollama_host: String,
    #[serde(default = "default_ollama_model")]
    pub ollama_model: String,

    #[serde(default = "default_qdrant_url")]
    pub qdrant_url: String,
    #[serde(default)]
    pub qdrant_api_key: Option<String>,
    #[serde(default = "default_collection_name")]
    pub collection_name: String,

    #[serde(default = "default_similarity_cutoff")]
    pub similarity_cutoff: f32,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_overfetch_factor")]
    pub overfetch_factor: usize,

    #[serde(default = "default_true")]
    pub reranking_enabled: bool,
    #[serde(default)]
    pub reranking_pool_size: Option<usize>,
    #[serde(default = "default_rerank_min_candidates")]
    pub rerank_min_candidates: usize,
    #[serde(default = "default_rerank_batch_size")]
    pub rerank_batch_size: usize,
    #[serde(default = "default_rerank_workers")]
    pub rerank_workers: usize,
    #[serde(default = "default_rerank_timeout_secs")]
    pub rerank_timeout_secs: u64,

    #[serde(default = "default_history_turns")]
    pub history_turns: usize,
    #[serde(default = "default_response_cache_ttl_secs")]
    pub response_cache_ttl_secs: u64,
    #[serde(default = "default_response_cache_max_entries")]
    pub response_cache_max_entries: usize,
    #[serde(default = "default_embedding_cache_max_entries")]
    pub embedding_cache_max_entries: usize,

    #[serde(default = "default_backend_timeout_secs")]
    pub backend_timeout_secs: u64,
    #[serde(default = "default_backend_max_retries")]
    pub backend_max_retries: usize,

    #[serde(default = "default_true")]
    pub follow_ups_enabled: bool,
    #[serde(default = "default_legal_disclaimer")]
    pub legal_disclaimer: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

pub const DEFAULT_LEGAL_DISCLAIMER: &str = "I am not a lawyer; for legal or tax-filing advice consult a qualified tax professional or the IRS.";

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}

const fn default_embedding_dimensions() -> u32 {
    1536
}

fn default_data_dir() -> String {
    "./data".to_string()
}

fn default_chat_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_ollama_host() -> String {
    "http://localhost:11434".to_string()
}

fn default_ollama_model() -> String {
    "llama3".to_string()
}

fn default_qdrant_url() -> String {
    "http://localhost:6333".to_string()
}

fn default_collection_name() -> String {
    "irs_rag_v1".to_string()
}

const fn default_similarity_cutoff() -> f32 {
    0.22
}

const fn default_top_k() -> usize {
    40
}

const fn default_overfetch_factor() -> usize {
    2
}

const fn default_true() -> bool {
    true
}

const fn default_rerank_min_candidates() -> usize {
    10
}

const fn default_rerank_batch_size() -> usize {
    8
}

const fn default_rerank_workers() -> usize {
    3
}

const fn default_rerank_timeout_secs() -> u64 {
    20
}

const fn default_history_turns() -> usize {
    10
}

const fn default_response_cache_ttl_secs() -> u64 {
    900
}

const fn default_response_cache_max_entries() -> usize {
    512
}

const fn default_embedding_cache_max_entries() -> usize {
    256
}

const fn default_backend_timeout_secs() -> u64 {
    30
}

const fn default_backend_max_retries() -> usize {
    3
}

fn default_legal_disclaimer() -> String {
    DEFAULT_LEGAL_DISCLAIMER.to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            openai_api_key: None,
            openai_base_url: default_base_url(),
            embedding_backend: EmbeddingBackend::default(),
            embedding_model: default_embedding_model(),
            embedding_dimensions: default_embedding_dimensions(),
            fastembed_model: None,
            fastembed_cache_dir: None,
            fastembed_show_download_progress: None,
            fastembed_max_length: None,
            data_dir: default_data_dir(),
            generation_backend: GenerationBackend::default(),
            chat_model: default_chat_model(),
            ollama_host: default_ollama_host(),
            ollama_model: default_ollama_model(),
            qdrant_url: default_qdrant_url(),
            qdrant_api_key: None,
            collection_name: default_collection_name(),
            similarity_cutoff: default_similarity_cutoff(),
            top_k: default_top_k(),
            overfetch_factor: default_overfetch_factor(),
            reranking_enabled: true,
            reranking_pool_size: None,
            rerank_min_candidates: default_rerank_min_candidates(),
            rerank_batch_size: default_rerank_batch_size(),
            rerank_workers: default_rerank_workers(),
            rerank_timeout_secs: default_rerank_timeout_secs(),
            history_turns: default_history_turns(),
            response_cache_ttl_secs: default_response_cache_ttl_secs(),
            response_cache_max_entries: default_response_cache_max_entries(),
            embedding_cache_max_entries: default_embedding_cache_max_entries(),
            backend_timeout_secs: default_backend_timeout_secs(),
            backend_max_retries: default_backend_max_retries(),
            follow_ups_enabled: true,
            legal_disclaimer: default_legal_disclaimer(),
            log_level: default_log_level(),
        }
    }
}

impl AppConfig {
    pub fn backend_timeout(&self) -> Duration {
        Duration::from_secs(self.backend_timeout_secs)
    }

    pub fn rerank_timeout(&self) -> Duration {
        Duration::from_secs(self.rerank_timeout_secs)
    }

    pub fn response_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.response_cache_ttl_secs)
    }

    /// API key, trimmed, when one is actually present.
    pub fn openai_key(&self) -> Option<&str> {
        self.openai_api_key
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty())
    }

    /// Startup checks. Any failure here is fatal; nothing is retried.
    pub fn validate(&self) -> Result<(), AppError> {
        let needs_openai = self.embedding_backend == EmbeddingBackend::OpenAI
            || self.generation_backend == GenerationBackend::OpenAI;
        if needs_openai && self.openai_key().is_none() {
            return Err(AppError::Configuration(
                "OPENAI_API_KEY is required when an OpenAI backend is selected".into(),
            ));
        }

        if self.embedding_backend == EmbeddingBackend::OpenAI && self.embedding_dimensions == 0 {
            return Err(AppError::Configuration(
                "EMBEDDING_DIMENSIONS must be greater than zero".into(),
            ));
        }

        if !(0.0..=1.0).contains(&self.similarity_cutoff) {
            return Err(AppError::Configuration(
                "SIMILARITY_CUTOFF must be within [0.0, 1.0]".into(),
            ));
        }

        let positive = [
            ("TOP_K", self.top_k),
            ("OVERFETCH_FACTOR", self.overfetch_factor),
            ("RERANK_BATCH_SIZE", self.rerank_batch_size),
            ("RERANK_WORKERS", self.rerank_workers),
            ("RESPONSE_CACHE_MAX_ENTRIES", self.response_cache_max_entries),
            ("EMBEDDING_CACHE_MAX_ENTRIES", self.embedding_cache_max_entries),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(AppError::Configuration(format!(
                "{name} must be greater than zero"
            )));
        }

        if self.collection_name.trim().is_empty() {
            return Err(AppError::Configuration(
                "COLLECTION_NAME must not be empty".into(),
            ));
        }

        Ok(())
    }
}

pub fn get_config() -> Result<AppConfig, AppError> {
    let config = Config::builder()
        .add_source(File::with_name("config").required(false))
        .add_source(Environment::default())
        .build()?;

    let config: AppConfig = config.try_deserialize()?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offline_config() -> AppConfig {
        AppConfig {
            embedding_backend: EmbeddingBackend::Hashed,
            generation_backend: GenerationBackend::Ollama,
            ..AppConfig::default()
        }
    }

    #[test]
    fn defaults_match_retrieval_settings() {
        let config = AppConfig::default();
        assert_eq!(config.top_k, 40);
        assert!((config.similarity_cutoff - 0.22).abs() < f32::EPSILON);
        assert_eq!(config.embedding_cache_max_entries, 256);
        assert_eq!(config.history_turns, 10);
        assert_eq!(config.rerank_workers, 3);
    }

    #[test]
    fn openai_backends_require_a_key() {
        let config = AppConfig::default();
        let err = config.validate().expect_err("missing key must be fatal");
        assert!(matches!(err, AppError::Configuration(_)));

        let config = AppConfig {
            openai_api_key: Some("   ".into()),
            ..AppConfig::default()
        };
        assert!(config.validate().is_err(), "blank key counts as missing");

        let config = AppConfig {
            openai_api_key: Some("sk-test".into()),
            ..AppConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn local_backends_need_no_key() {
        assert!(offline_config().validate().is_ok());
    }

    #[test]
    fn zero_sizes_are_rejected() {
        let config = AppConfig {
            rerank_workers: 0,
            ..offline_config()
        };
        let err = config.validate().expect_err("zero workers");
        assert!(err.to_string().contains("RERANK_WORKERS"));
    }

    #[test]
    fn cutoff_outside_unit_range_is_rejected() {
        let config = AppConfig {
            similarity_cutoff: 1.5,
            ..offline_config()
        };
        assert!(config.validate().is_err());
    }
}
