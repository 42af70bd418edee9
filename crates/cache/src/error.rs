//! Cache error types.

use thiserror::Error;

/// Artifact cache errors.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("artifact not found: {0}")]
    NotFound(String),

    #[error("artifact busy: {0}")]
    Busy(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid artifact filename: {0}")]
    InvalidName(String),

    #[error("corrupt cache entry: {0}")]
    Corrupt(String),

    #[error("remote cache error: {0}")]
    Remote(String),

    #[error("remote cache is not write-enabled")]
    WritesDisabled,

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<reqwest::Error> for CacheError {
    fn from(err: reqwest::Error) -> Self {
        CacheError::Remote(err.to_string())
    }
}

/// Result type for cache operations.
pub type CacheResult<T> = std::result::Result<T, CacheError>;
