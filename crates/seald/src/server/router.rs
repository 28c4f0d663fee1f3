//! Axum router construction.

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

use super::{handlers, middleware, state::AppState};

/// Build the application [`Router`] with all routes and middleware attached.
pub fn build(state: AppState) -> Router {
    Router::new()
        .route("/health/ready", get(handlers::ready))
        .route("/health/metrics", get(handlers::metrics))
        .route("/crypto/status", get(handlers::status))
        .route("/crypto/force-new-dek", post(handlers::force_new_dek))
        .route("/crypto/rotate/begin", post(handlers::rotate_begin))
        .route("/crypto/rotate/run", post(handlers::rotate_run))
        .route("/crypto/rotate/finalize", post(handlers::rotate_finalize))
        .route("/crypto/rewrap", post(handlers::rewrap))
        .fallback(handlers::not_found)
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(middleware::REQUEST_TIMEOUT))
        .with_state(state)
}
