use std::time::Duration;

use async_openai::error::OpenAIError;
use thiserror::Error;
use tokio::task::JoinError;

// Core internal errors
#[derive(Error, Debug)]
pub enum AppError {
    #[error("OpenAI error: {0}")]
    OpenAI(#[from] OpenAIError),
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Config source error: {0}")]
    ConfigSource(#[from] config::ConfigError),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("{service} backend error (status {status:?}): {message}")]
    Backend {
        service: &'static str,
        status: Option<u16>,
        message: String,
    },
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },
    #[error("LLM parsing error: {0}")]
    LLMParsing(String),
    #[error("Task join error: {0}")]
    Join(#[from] JoinError),
    #[error("IoError: {0}")]
    Io(#[from] std::io::Error),
    #[error("Reqwest error: {0}")]
    Reqwest(#[from] reqwest::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Anyhow error: {0}")]
    Anyhow(#[from] anyhow::Error),
    #[error("Internal service error: {0}")]
    InternalError(String),
}

impl AppError {
    /// Whether a failed backend call is worth another attempt.
    ///
    /// Timeouts, connection failures, rate limiting and 5xx responses are
    /// transient. Everything else (bad requests, bad configuration, parse
    /// failures) fails the same way on every attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            AppError::Timeout { .. } => true,
            AppError::Backend { status, .. } => match status {
                Some(code) => *code == 429 || *code >= 500,
                None => true,
            },
            AppError::Reqwest(err) => {
                err.is_timeout()
                    || err.is_connect()
                    || err
                        .status()
                        .is_some_and(|s| s.as_u16() == 429 || s.is_server_error())
            }
            AppError::OpenAI(OpenAIError::Reqwest(_)) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_status_decides_transience() {
        let server = AppError::Backend {
            service: "qdrant",
            status: Some(503),
            message: "unavailable".into(),
        };
        let throttled = AppError::Backend {
            service: "qdrant",
            status: Some(429),
            message: "slow down".into(),
        };
        let client = AppError::Backend {
            service: "qdrant",
            status: Some(400),
            message: "bad filter".into(),
        };

        assert!(server.is_transient());
        assert!(throttled.is_transient());
        assert!(!client.is_transient());
    }

    #[test]
    fn validation_and_configuration_are_not_retried() {
        assert!(!AppError::Validation("empty query".into()).is_transient());
        assert!(!AppError::Configuration("missing key".into()).is_transient());
        assert!(AppError::Timeout {
            operation: "embed",
            after: Duration::from_secs(1)
        }
        .is_transient());
    }
}
