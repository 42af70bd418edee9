//! Builder error types.

use morph_core::Phase;
use thiserror::Error;

/// Errors from staging assembly and building.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("build command failed: {unit} phase {phase}: exit code {exit_code}")]
    BuildCommandFailed {
        unit: String,
        phase: Phase,
        exit_code: i32,
    },

    #[error("dependency artifact missing from cache: {name}")]
    MissingDependency { name: String },

    #[error("staging error: {0}")]
    Staging(String),

    #[error("remote build error: {0}")]
    Remote(String),

    #[error("build cancelled")]
    Cancelled,

    #[error("cache error: {0}")]
    Cache(#[from] morph_cache::CacheError),

    #[error(transparent)]
    Core(#[from] morph_core::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BuildError {
    /// Transient errors re-enter the ready queue once before they are
    /// treated as fatal.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BuildError::Cache(morph_cache::CacheError::Busy(_))
                | BuildError::Cache(morph_cache::CacheError::Io(_))
                | BuildError::Io(_)
        )
    }
}

/// Result type for build operations.
pub type BuildResult<T> = std::result::Result<T, BuildError>;
