//! Distbuild error types.

use thiserror::Error;

/// Errors from the distributed build layer.
#[derive(Debug, Error)]
pub enum DistbuildError {
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("worker disconnected: {0}")]
    WorkerDisconnected(String),

    #[error("no workers available")]
    NoWorkers,

    #[error("exec failed: {0}")]
    Exec(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cache error: {0}")]
    Cache(#[from] morph_cache::CacheError),

    #[error(transparent)]
    Core(#[from] morph_core::Error),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Result type for distbuild operations.
pub type DistbuildResult<T> = std::result::Result<T, DistbuildError>;
