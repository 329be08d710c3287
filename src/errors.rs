use std::io;

use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("cache store error: {0}")]
    CacheStore(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("worker failed: {0}")]
    Worker(String),
}

/// Failure reported by the external geocoding service for a single attempt.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ServiceError {
    /// Timeouts, throttling and 5xx-style responses. Retried with backoff.
    #[error("transient service failure: {0}")]
    Transient(String),
    /// Malformed or rejected queries. Never retried.
    #[error("permanent query failure: {0}")]
    Permanent(String),
}

impl ServiceError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ServiceError::Transient(_))
    }
}
