//! Growth phase knowledge and per-zone phase management.

use axum::{
    extract::{Path, State},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{ApiError, ApiResult, AppState};
use crate::derivation::{ec_to_ppm_500, ec_to_ppm_700};
use crate::phase::{GrowthPhase, Parameter, PhaseWindow, TargetRanges};

// ---

pub fn router() -> Router<AppState> {
    // ---
    Router::new()
        .route("/phases", get(list_phases))
        .route("/phases/{phase}", get(get_phase))
        .route("/zones", get(list_zones))
        .route("/zones/{zone_id}/phase", get(active_phase).put(set_phase))
        .route("/zones/{zone_id}/phase/advance", post(advance_phase))
        .route("/zones/{zone_id}/phase/history", get(history))
        .route("/zones/{zone_id}/overview", get(overview))
}

#[derive(Serialize)]
struct PhaseInfo {
    phase: GrowthPhase,
    min_days: i64,
    max_days: i64,
    previous: Option<GrowthPhase>,
    next: Option<GrowthPhase>,
    target_ranges: TargetRanges,
    /// EC target on the 500 and 700 PPM scales.
    ec_ppm_500: Option<(i64, i64)>,
    ec_ppm_700: Option<(i64, i64)>,
}

fn phase_info(telemetry: &AppState, phase: GrowthPhase) -> PhaseInfo {
    // ---
    let (min_days, max_days) = phase.duration_days();
    let target_ranges = telemetry.target_ranges(phase);
    let ec = target_ranges.get(&Parameter::Ec).and_then(|t| t.range());
    PhaseInfo {
        phase,
        min_days,
        max_days,
        previous: phase.previous(),
        next: phase.next(),
        ec_ppm_500: ec.map(|(min, max)| (ec_to_ppm_500(min), ec_to_ppm_500(max))),
        ec_ppm_700: ec.map(|(min, max)| (ec_to_ppm_700(min), ec_to_ppm_700(max))),
        target_ranges,
    }
}

fn parse_phase(s: &str) -> ApiResult<GrowthPhase> {
    GrowthPhase::parse(s).ok_or_else(|| ApiError::not_found(format!("unknown phase `{s}`")))
}

async fn list_phases(State(telemetry): State<AppState>) -> Json<Vec<PhaseInfo>> {
    Json(GrowthPhase::ALL.into_iter().map(|p| phase_info(&telemetry, p)).collect())
}

async fn get_phase(State(telemetry): State<AppState>, Path(phase): Path<String>) -> ApiResult<impl IntoResponse> {
    let phase = parse_phase(&phase)?;
    Ok(Json(phase_info(&telemetry, phase)))
}

async fn list_zones(State(telemetry): State<AppState>) -> Json<Vec<String>> {
    Json(telemetry.zones())
}

#[derive(Serialize)]
struct ActivePhase {
    #[serde(flatten)]
    window: PhaseWindow,
    days_in_phase: i64,
    should_advance: bool,
    reason: String,
}

async fn active_phase(State(telemetry): State<AppState>, Path(zone_id): Path<String>) -> ApiResult<impl IntoResponse> {
    // ---
    let window = telemetry.active_phase(&zone_id)?;
    let now = Utc::now();
    let (should_advance, reason) = window.phase.should_advance(window.started_at, now);
    Ok(Json(ActivePhase {
        days_in_phase: (now - window.started_at).num_days(),
        window,
        should_advance,
        reason,
    }))
}

#[derive(Debug, Deserialize)]
struct SetPhaseRequest {
    phase: String,
    /// Merged over the table's targets for this window when given.
    target_ranges: Option<TargetRanges>,
    /// Transition time; defaults to now.
    at: Option<DateTime<Utc>>,
}

/// Handle `PUT /zones/{zone_id}/phase`.
async fn set_phase(
    State(telemetry): State<AppState>,
    Path(zone_id): Path<String>,
    Json(req): Json<SetPhaseRequest>,
) -> ApiResult<impl IntoResponse> {
    // ---
    let phase = GrowthPhase::parse(&req.phase)
        .ok_or_else(|| ApiError::bad_request(format!("unknown phase `{}`", req.phase)))?;
    info!("PUT /zones/{}/phase - {}", zone_id, phase.as_str());

    let at = req.at.unwrap_or_else(Utc::now);
    let window = telemetry.transition_phase(&zone_id, phase, req.target_ranges, at).await?;
    Ok(Json(window))
}

async fn advance_phase(State(telemetry): State<AppState>, Path(zone_id): Path<String>) -> ApiResult<impl IntoResponse> {
    let window = telemetry.advance_phase(&zone_id, Utc::now()).await?;
    Ok(Json(window))
}

async fn history(State(telemetry): State<AppState>, Path(zone_id): Path<String>) -> ApiResult<impl IntoResponse> {
    let windows = telemetry.phase_history(&zone_id).await?;
    Ok(Json(windows))
}

/// Handle `GET /zones/{zone_id}/overview`.
async fn overview(State(telemetry): State<AppState>, Path(zone_id): Path<String>) -> ApiResult<impl IntoResponse> {
    let overview = telemetry.zone_overview(&zone_id).await?;
    Ok(Json(overview))
}
