//! HTTP gateway.
//!
//! Each sibling module owns one concern and exports a subrouter; this module
//! merges them and attaches the shared [`Telemetry`] handle so `main.rs` never
//! sees individual endpoints.

use std::sync::Arc;

use axum::Router;

use crate::telemetry::Telemetry;

mod alerts;
mod error;
mod health;
mod notifications;
mod phases;
mod readings;
mod rollups;

pub use error::{ApiError, ApiResult};

/// State shared by every handler.
pub type AppState = Arc<Telemetry>;

// ---

pub fn router(telemetry: AppState) -> Router {
    // ---
    Router::new()
        .merge(readings::router())
        .merge(rollups::router())
        .merge(phases::router())
        .merge(alerts::router())
        .merge(notifications::router())
        .merge(health::router())
        .with_state(telemetry)
}
