//! HTTP service in front of a morph artifact cache.
//!
//! Serves the stable remote-cache protocol:
//! - `GET  /1.0/artifacts?filename=...` streams artifact bytes
//! - `HEAD /1.0/artifacts?filename=...` existence check
//! - `POST /1.0/artifacts` multipart upload (write-enabled servers only)
//! - `GET  /1.0/fetch?url=...` server-side fetch from another cache

pub mod error;
pub mod handlers;
pub mod routes;
pub mod state;

pub use error::ApiError;
pub use routes::create_router;
pub use state::AppState;
