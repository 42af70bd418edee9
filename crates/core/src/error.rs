//! Error types for the core domain.

use thiserror::Error;

/// Core domain error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid morphology {path}: {reason}")]
    InvalidMorphology { path: String, reason: String },

    #[error("unknown build system: {0}")]
    UnknownBuildSystem(String),

    #[error("unknown architecture: {0}")]
    UnknownArchitecture(String),

    #[error("dependency cycle: {}", path.join(" -> "))]
    DependencyCycle { path: Vec<String> },

    #[error("unsatisfied dependency: {name}")]
    UnsatisfiedDependency { name: String },

    #[error("source unavailable: {repo} ref {reference}: {reason}")]
    SourceUnavailable {
        repo: String,
        reference: String,
        reason: String,
    },

    #[error("invalid cache key: {0}")]
    InvalidCacheKey(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;
