//! Health and metrics endpoints.

use std::sync::Arc;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;

use crate::server::AppState;

/// Health check endpoint.
pub async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

/// Operation counters of the asset service.
pub async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let compass = &state.compass;
    Json(json!({
        "operations": compass.assets().metrics(),
        "background_tasks": compass.assets().pending_background_tasks(),
        "durable_worker": compass.is_durable(),
    }))
}
