// src/routes/health.rs
//! Health check endpoint.
//!
//! Lets orchestrators and CI confirm the service is up. It reports the chunk
//! catalogue and live subscriber count from memory and never touches storage.
//! Like every sibling in `routes`, it exports only a subrouter to the gateway.

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;

use super::AppState;
use crate::store::ChunkState;

/// JSON response body for the `/health` endpoint.
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    chunks: ChunkCounts,
    zones: usize,
    subscribers: usize,
}

#[derive(Serialize, Default)]
struct ChunkCounts {
    open: usize,
    sealed: usize,
    compressed: usize,
}

/// Handle `GET /health`.
async fn health(State(telemetry): State<AppState>) -> Json<HealthResponse> {
    // ---
    let mut chunks = ChunkCounts::default();
    for info in telemetry.chunks().await {
        match info.state {
            ChunkState::Open => chunks.open += 1,
            ChunkState::Sealed => chunks.sealed += 1,
            ChunkState::Compressed => chunks.compressed += 1,
        }
    }

    Json(HealthResponse {
        status: "ok",
        chunks,
        zones: telemetry.zones().len(),
        subscribers: telemetry.notifier().subscriber_count(),
    })
}

/// Create a subrouter containing the `/health` route.
pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health))
}
