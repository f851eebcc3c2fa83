//! HTTP request handlers.

use super::AppState;

use axum::{
    extract::State,
    http::header,
    response::{IntoResponse, Json},
};

/// Serve the Prometheus text exposition and drain the collector.
pub async fn handle_metrics(State(state): State<AppState>) -> impl IntoResponse {
    let body = state.metrics.render();

    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

/// Liveness endpoint for the service manager.
pub async fn handle_health(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "targets": state.registry.len(),
        "uptime_seconds": state.started.elapsed().as_secs(),
        "dropped_writes": state.writer.dropped_count(),
    }))
}
