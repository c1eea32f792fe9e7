//! Reading ingest and raw-reading queries.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, TimeDelta, Utc};
use serde::Deserialize;
use tracing::{debug, info};

use super::{ApiError, ApiResult, AppState};
use crate::models::{DevicePayload, RawReading};
use crate::store::ReadingFilter;
use crate::telemetry::IngestOutcome;

// ---

/// Cap on readings returned by one query.
const DEFAULT_LIMIT: usize = 1000;

pub fn router() -> Router<AppState> {
    // ---
    Router::new()
        .route("/readings", post(ingest).get(list))
        .route("/readings/stats", get(stats))
        .route("/payloads", post(ingest_payload))
}

async fn ingest(State(telemetry): State<AppState>, Json(raw): Json<RawReading>) -> ApiResult<impl IntoResponse> {
    // ---
    let outcome = telemetry.ingest(raw).await?;
    let status = match outcome {
        IngestOutcome::Stored { .. } => StatusCode::CREATED,
        IngestOutcome::Dropped { .. } => StatusCode::ACCEPTED,
    };
    Ok((status, Json(outcome)))
}

async fn ingest_payload(
    State(telemetry): State<AppState>,
    Json(payload): Json<DevicePayload>,
) -> ApiResult<impl IntoResponse> {
    // ---
    info!(
        "POST /payloads - {} reading(s) from {}",
        payload.readings.len(),
        payload.device_id
    );
    let report = telemetry.ingest_payload(payload, Utc::now()).await?;
    Ok(Json(report))
}

/// Query parameters shared by the list and stats endpoints.
#[derive(Debug, Deserialize)]
struct ReadingsQuery {
    device_id: Option<String>,
    zone_id: Option<String>,
    sensor_type: Option<String>,
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
    limit: Option<usize>,
}

impl ReadingsQuery {
    /// Range defaults to the last 24 hours.
    fn filter(&self) -> ApiResult<ReadingFilter> {
        // ---
        let to = self.to.unwrap_or_else(Utc::now);
        let from = self.from.unwrap_or(to - TimeDelta::hours(24));
        if from > to {
            return Err(ApiError::bad_request(format!("`from` {from} is after `to` {to}")));
        }
        Ok(ReadingFilter {
            device_id: self.device_id.clone(),
            zone_id: self.zone_id.clone(),
            sensor_type: self.sensor_type.as_deref().map(|s| s.trim().to_lowercase()),
            from,
            to,
        })
    }
}

async fn list(State(telemetry): State<AppState>, Query(params): Query<ReadingsQuery>) -> ApiResult<impl IntoResponse> {
    // ---
    debug!("GET /readings - {:?}", params);
    let filter = params.filter()?;
    let limit = params.limit.unwrap_or(DEFAULT_LIMIT).min(DEFAULT_LIMIT);
    let readings = telemetry.query_readings(filter, Some(limit)).await?;
    Ok(Json(readings))
}

async fn stats(State(telemetry): State<AppState>, Query(params): Query<ReadingsQuery>) -> ApiResult<impl IntoResponse> {
    // ---
    let filter = params.filter()?;
    match telemetry.statistics(filter).await? {
        Some(stats) => Ok(Json(stats)),
        None => Err(ApiError::not_found("no readings in range")),
    }
}
