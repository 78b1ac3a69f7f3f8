use std::{future::Future, time::Duration};

use tokio_retry::{
    strategy::{jitter, ExponentialBackoff},
    RetryIf,
};
use tracing::warn;

use crate::{error::AppError, utils::config::AppConfig};

const MAX_BACKOFF: Duration = Duration::from_secs(2);

/// Timeout and retry budget applied to every network-bound backend call.
#[derive(Debug, Clone, Copy)]
pub struct CallPolicy {
    pub timeout: Duration,
    pub max_retries: usize,
}

impl Default for CallPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_retries: 3,
        }
    }
}

impl CallPolicy {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            timeout: config.backend_timeout(),
            max_retries: config.backend_max_retries,
        }
    }

    /// Delays between attempts: 200ms, 400ms, 800ms... capped at two seconds, jittered.
    fn strategy(&self) -> impl Iterator<Item = Duration> {
        ExponentialBackoff::from_millis(2)
            .factor(100)
            .max_delay(MAX_BACKOFF)
            .map(jitter)
            .take(self.max_retries)
    }

    /// Runs `action`, bounding each attempt by the timeout and retrying only
    /// transient failures.
    pub async fn run<T, F, Fut>(&self, operation: &'static str, mut action: F) -> Result<T, AppError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        let timeout = self.timeout;
        RetryIf::spawn(
            self.strategy(),
            || {
                let attempt = action();
                async move {
                    match tokio::time::timeout(timeout, attempt).await {
                        Ok(result) => result,
                        Err(_) => Err(AppError::Timeout {
                            operation,
                            after: timeout,
                        }),
                    }
                }
            },
            |err: &AppError| {
                let retry = err.is_transient();
                if retry {
                    warn!(operation, error = %err, "Transient backend failure; retrying");
                }
                retry
            },
        )
        .await
    }
}
