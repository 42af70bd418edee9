//! Application state shared across handlers.

use morph_cache::LocalArtifactCache;
use std::sync::Arc;

/// Shared server state.
#[derive(Clone)]
pub struct AppState {
    /// The artifact store this server fronts.
    pub cache: Arc<LocalArtifactCache>,
    /// Whether POST uploads and server-side fetches are accepted.
    pub enable_writes: bool,
    /// Client for `/1.0/fetch` composition with other caches.
    pub http: reqwest::Client,
}

impl AppState {
    pub fn new(cache: Arc<LocalArtifactCache>, enable_writes: bool) -> Self {
        Self {
            cache,
            enable_writes,
            http: reqwest::Client::new(),
        }
    }
}
