//! Alert listing, acknowledgement and manual resolution.

use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use uuid::Uuid;

use super::{ApiError, ApiResult, AppState};
use crate::alert::AlertFilter;

// ---

pub fn router() -> Router<AppState> {
    // ---
    Router::new()
        .route("/alerts", get(list))
        .route("/alerts/{id}/acknowledge", post(acknowledge))
        .route("/alerts/{id}/resolve", post(resolve))
}

#[derive(Debug, Deserialize)]
struct AlertsQuery {
    zone_id: Option<String>,
    #[serde(default)]
    unresolved: bool,
    limit: Option<i64>,
}

async fn list(State(telemetry): State<AppState>, Query(params): Query<AlertsQuery>) -> ApiResult<impl IntoResponse> {
    // ---
    let alerts = telemetry
        .list_alerts(&AlertFilter {
            zone_id: params.zone_id,
            unresolved_only: params.unresolved,
            limit: params.limit,
        })
        .await?;
    Ok(Json(alerts))
}

#[derive(Debug, Deserialize)]
struct AcknowledgeRequest {
    by: String,
}

async fn acknowledge(
    State(telemetry): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<AcknowledgeRequest>,
) -> ApiResult<impl IntoResponse> {
    // ---
    let by = req.by.trim();
    if by.is_empty() {
        return Err(ApiError::bad_request("`by` must not be empty"));
    }
    let alert = telemetry.acknowledge_alert(id, by, Utc::now()).await?;
    Ok(Json(alert))
}

async fn resolve(State(telemetry): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<impl IntoResponse> {
    let alert = telemetry.resolve_alert(id, Utc::now()).await?;
    Ok(Json(alert))
}
