use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};

use crate::error::GatewayError;
use crate::AppState;

/// GET /healthcheck - 204 once every stage is warm
pub async fn healthcheck(State(state): State<Arc<AppState>>) -> Response {
    if state.lifecycle.is_ready() {
        return StatusCode::NO_CONTENT.into_response();
    }
    let message = if state.lifecycle.is_draining() {
        "gateway is shutting down".to_string()
    } else {
        let pending: Vec<String> = state
            .lifecycle
            .states()
            .into_iter()
            .filter(|(_, s)| !s.is_ready())
            .map(|(name, _)| name)
            .collect();
        format!("stages not ready: {}", pending.join(", "))
    };
    GatewayError::NotReady(message).into_response()
}

/// GET /metrics - Prometheus text exposition
pub async fn metrics(State(state): State<Arc<AppState>>) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        state.metrics.render(),
    )
        .into_response()
}
