//! Route configuration.

use crate::handlers;
use crate::state::AppState;
use axum::Router;
use axum::routing::get;
use tower_http::trace::TraceLayer;

/// Create the application router.
///
/// GET routes answer HEAD with the same status and no body, which is
/// exactly the existence-check contract.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route(
            "/1.0/artifacts",
            get(handlers::get_artifact).post(handlers::post_artifacts),
        )
        .route("/1.0/fetch", get(handlers::fetch))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
