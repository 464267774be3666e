pub mod config;
pub mod health;
pub mod predict;

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::middleware;
use axum::routing::{get, post};
use axum::Router;

use crate::metrics::track_requests;
use crate::AppState;

/// Every gateway route. Body size is enforced by the predict handler.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthcheck", get(health::healthcheck))
        .route("/metrics", get(health::metrics))
        .route("/config", get(config::config))
        .route("/:out/:input", post(predict::predict))
        .route("/:out/:input/:step", post(predict::predict_from))
        .route_layer(middleware::from_fn_with_state(state.metrics.clone(), track_requests))
        .layer(DefaultBodyLimit::disable())
        .with_state(state)
}
