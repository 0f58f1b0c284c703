//! HTTP route handlers for the agent.

use axum::{Router, routing::get};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

mod health;

/// Create the agent router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Liveness & readiness
        .route("/health", get(health::health_check))
        .route("/ready", get(health::ready_check))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
