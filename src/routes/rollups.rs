//! Rollup bucket queries.

use axum::{
    extract::{Query, State},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chrono::{DateTime, TimeDelta, Utc};
use serde::Deserialize;

use super::{ApiError, ApiResult, AppState};
use crate::rollup::{Granularity, RollupQuery};

// ---

pub fn router() -> Router<AppState> {
    Router::new().route("/rollups", get(list))
}

#[derive(Debug, Deserialize)]
struct RollupParams {
    granularity: Option<String>,
    device_id: Option<String>,
    zone_id: Option<String>,
    sensor_type: Option<String>,
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
}

/// Handle `GET /rollups`. Granularity defaults to `hour`, the range to the
/// last 24 hours for hourly and the last 30 days for daily buckets.
async fn list(State(telemetry): State<AppState>, Query(params): Query<RollupParams>) -> ApiResult<impl IntoResponse> {
    // ---
    let granularity = match params.granularity.as_deref() {
        None => Granularity::Hour,
        Some(g) => Granularity::parse(g).ok_or_else(|| ApiError::bad_request(format!("unknown granularity `{g}`")))?,
    };
    let span = match granularity {
        Granularity::Hour => TimeDelta::hours(24),
        Granularity::Day => TimeDelta::days(30),
    };
    let to = params.to.unwrap_or_else(Utc::now);
    let from = params.from.unwrap_or(to - span);

    let buckets = telemetry
        .query_rollups(&RollupQuery {
            granularity,
            device_id: params.device_id,
            zone_id: params.zone_id,
            sensor_type: params.sensor_type.as_deref().map(|s| s.trim().to_lowercase()),
            from,
            to,
        })
        .await?;
    Ok(Json(buckets))
}
