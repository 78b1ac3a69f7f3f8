mod batch;

pub use batch::{Reranker, UNSCORED_RELEVANCE};

use std::{
    fs,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread::available_parallelism,
};

use async_trait::async_trait;
use common::{error::AppError, utils::config::AppConfig};
use fastembed::{RerankInitOptions, RerankResult, TextRerank};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info};

/// Query/document relevance capability. Scores come back in input order and
/// lie in (0, 1).
#[async_trait]
pub trait RelevanceScorer: Send + Sync {
    async fn score(&self, query: &str, documents: Vec<String>) -> Result<Vec<f32>, AppError>;
}

/// Maps a cross-encoder logit into (0, 1) without changing the ordering.
pub fn logistic(logit: f32) -> f32 {
    1.0 / (1.0 + (-logit).exp())
}

pub struct RerankerPool {
    engines: Vec<Arc<Mutex<TextRerank>>>,
    semaphore: Arc<Semaphore>,
    next_engine: AtomicUsize,
}

impl RerankerPool {
    /// Build the pool at startup.
    /// `pool_size` controls max parallel reranks.
    pub fn new(pool_size: usize) -> Result<Arc<Self>, AppError> {
        Self::new_with_options(pool_size, RerankInitOptions::default())
    }

    fn new_with_options(
        pool_size: usize,
        init_options: RerankInitOptions,
    ) -> Result<Arc<Self>, AppError> {
        if pool_size == 0 {
            return Err(AppError::Configuration(
                "RERANKING_POOL_SIZE must be greater than zero".to_string(),
            ));
        }

        fs::create_dir_all(&init_options.cache_dir)?;

        let mut engines = Vec::with_capacity(pool_size);
        for x in 0..pool_size {
            debug!("Creating reranking engine: {x}");
            let model = TextRerank::try_new(init_options.clone())
                .map_err(|e| AppError::Configuration(format!("reranker init failed: {e}")))?;
            engines.push(Arc::new(Mutex::new(model)));
        }

        info!(pool_size, "Reranker pool initialized");
        Ok(Arc::new(Self {
            engines,
            semaphore: Arc::new(Semaphore::new(pool_size)),
            next_engine: AtomicUsize::new(0),
        }))
    }

    /// `None` when reranking is switched off.
    pub fn maybe_from_config(config: &AppConfig) -> Result<Option<Arc<Self>>, AppError> {
        if !config.reranking_enabled {
            return Ok(None);
        }

        let pool_size = config.reranking_pool_size.unwrap_or_else(default_pool_size);
        let init_options = build_rerank_init_options(config)?;
        Self::new_with_options(pool_size, init_options).map(Some)
    }

    /// Waits for capacity, then hands out one engine round-robin.
    pub async fn checkout(&self) -> Result<RerankerLease, AppError> {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| AppError::InternalError("reranker pool closed".to_string()))?;

        let idx = self.next_engine.fetch_add(1, Ordering::Relaxed) % self.engines.len();
        let engine = self
            .engines
            .get(idx)
            .map(Arc::clone)
            .ok_or_else(|| AppError::InternalError("reranker pool is empty".to_string()))?;

        Ok(RerankerLease {
            _permit: permit,
            engine,
        })
    }
}

#[async_trait]
impl RelevanceScorer for RerankerPool {
    async fn score(&self, query: &str, documents: Vec<String>) -> Result<Vec<f32>, AppError> {
        if documents.is_empty() {
            return Ok(Vec::new());
        }

        let count = documents.len();
        let lease = self.checkout().await?;
        let results = lease.rerank(query, documents).await?;

        let mut scores = vec![0.0; count];
        for result in results {
            if let Some(slot) = scores.get_mut(result.index) {
                *slot = logistic(result.score);
            }
        }
        Ok(scores)
    }
}

fn default_pool_size() -> usize {
    available_parallelism()
        .map(|value| value.get().min(2))
        .unwrap_or(2)
        .max(1)
}

fn build_rerank_init_options(config: &AppConfig) -> Result<RerankInitOptions, AppError> {
    let mut options = RerankInitOptions::default();

    let cache_dir = config
        .fastembed_cache_dir
        .as_ref()
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            Path::new(&config.data_dir)
                .join("fastembed")
                .join("reranker")
        });
    fs::create_dir_all(&cache_dir)?;
    options.cache_dir = cache_dir;
    options.show_download_progress = config.fastembed_show_download_progress.unwrap_or(true);

    if let Some(max_length) = config.fastembed_max_length {
        options.max_length = max_length;
    }

    Ok(options)
}

/// Active lease on a single TextRerank instance.
pub struct RerankerLease {
    // When this drops the semaphore permit is released.
    _permit: OwnedSemaphorePermit,
    engine: Arc<Mutex<TextRerank>>,
}

impl RerankerLease {
    /// Raw cross-encoder results. Inference runs on the blocking pool.
    pub async fn rerank(
        &self,
        query: &str,
        documents: Vec<String>,
    ) -> Result<Vec<RerankResult>, AppError> {
        let engine = Arc::clone(&self.engine);
        let query = query.to_owned();

        tokio::task::spawn_blocking(move || {
            let mut guard = engine.blocking_lock();
            guard
                .rerank(query, documents, false, None)
                .map_err(|e| AppError::InternalError(e.to_string()))
        })
        .await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logistic_is_monotonic_and_bounded() {
        let logits = [-8.0_f32, -1.5, 0.0, 2.0, 9.0];
        let scores: Vec<f32> = logits.iter().copied().map(logistic).collect();

        assert!(scores.windows(2).all(|w| w[0] < w[1]));
        assert!(scores.iter().all(|s| *s > 0.0 && *s < 1.0));
        assert!((logistic(0.0) - 0.5).abs() < f32::EPSILON);
    }

    #[test]
    fn zero_sized_pool_is_rejected() {
        let result = RerankerPool::new(0);
        assert!(matches!(result, Err(AppError::Configuration(_))));
    }

    #[test]
    fn disabled_reranking_builds_no_pool() {
        let config = AppConfig {
            reranking_enabled: false,
            ..AppConfig::default()
        };
        let pool = RerankerPool::maybe_from_config(&config).expect("config");
        assert!(pool.is_none());
    }
}
