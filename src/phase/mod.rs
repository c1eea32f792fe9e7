//! Phase registry: the active growth phase of each zone and its history.
//!
//! Every zone has at most one open window (`ended_at = None`). A transition
//! closes it and opens the next in a single transaction, serialized per zone;
//! a partial unique index in storage backs the invariant.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::SqlitePool;
use tracing::info;

use crate::error::{Result, TelemetryError};
use crate::schema::{from_micros, micros};

pub mod targets;

pub use targets::{check_targets, GrowthPhase, Parameter, PhaseOverrides, PhaseTable, Target, TargetRanges};

// ---

/// One stretch of a zone's life spent in a single phase.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhaseWindow {
    // ---
    pub zone_id: String,
    pub phase: GrowthPhase,
    pub target_ranges: TargetRanges,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

#[derive(sqlx::FromRow)]
struct WindowRow {
    zone_id: String,
    phase: String,
    target_ranges: String,
    started_at_us: i64,
    ended_at_us: Option<i64>,
}

impl TryFrom<WindowRow> for PhaseWindow {
    type Error = TelemetryError;

    fn try_from(row: WindowRow) -> Result<Self> {
        Ok(PhaseWindow {
            phase: GrowthPhase::parse(&row.phase)
                .ok_or_else(|| TelemetryError::codec(format!("unknown phase `{}`", row.phase)))?,
            target_ranges: serde_json::from_str(&row.target_ranges).map_err(TelemetryError::codec)?,
            started_at: from_micros(row.started_at_us)?,
            ended_at: row.ended_at_us.map(from_micros).transpose()?,
            zone_id: row.zone_id,
        })
    }
}

/// Holds each zone's active phase window.
pub struct PhaseRegistry {
    pool: SqlitePool,
    table: Arc<PhaseTable>,
    active: RwLock<HashMap<String, PhaseWindow>>,
    writers: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl PhaseRegistry {
    // ---
    /// Open the registry, loading every zone's active window.
    pub async fn open(pool: SqlitePool, table: Arc<PhaseTable>) -> Result<Self> {
        // ---
        let rows: Vec<WindowRow> = sqlx::query_as(
            r#"
            SELECT zone_id, phase, target_ranges, started_at_us, ended_at_us
            FROM phase_windows WHERE ended_at_us IS NULL
            "#,
        )
        .fetch_all(&pool)
        .await?;

        let mut active = HashMap::new();
        for row in rows {
            let window = PhaseWindow::try_from(row)?;
            active.insert(window.zone_id.clone(), window);
        }
        info!("Phase registry opened with {} active zones", active.len());

        Ok(Self {
            pool,
            table,
            active: RwLock::new(active),
            writers: Mutex::new(HashMap::new()),
        })
    }

    /// Snapshot of the zone's active window.
    pub fn active_phase(&self, zone_id: &str) -> Result<PhaseWindow> {
        self.active
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(zone_id)
            .cloned()
            .ok_or_else(|| TelemetryError::NoActivePhase {
                zone_id: zone_id.to_string(),
            })
    }

    /// Configured targets for `phase`.
    pub fn target_ranges(&self, phase: GrowthPhase) -> TargetRanges {
        self.table.target_ranges(phase).clone()
    }

    /// Zones that currently have an active phase, sorted.
    pub fn zones(&self) -> Vec<String> {
        let mut zones: Vec<String> = self
            .active
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        zones.sort();
        zones
    }

    fn writer(&self, zone_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut writers = self.writers.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(writers.entry(zone_id.to_string()).or_default())
    }

    /// Close the zone's active window at `at` and open `phase` from `at`.
    ///
    /// Initializes the zone when it has no active window yet.
    pub async fn transition_phase(
        &self,
        zone_id: &str,
        phase: GrowthPhase,
        target_ranges: TargetRanges,
        at: DateTime<Utc>,
    ) -> Result<PhaseWindow> {
        // ---
        let writer = self.writer(zone_id);
        let _serialized = writer.lock().await;

        let previous = self.active_phase(zone_id).ok();
        if let Some(prev) = &previous {
            if at < prev.started_at {
                return Err(TelemetryError::InvalidTransition {
                    zone_id: zone_id.to_string(),
                    reason: format!(
                        "transition at {at} precedes active window start {}",
                        prev.started_at
                    ),
                });
            }
        }

        let ranges_json = serde_json::to_string(&target_ranges).map_err(TelemetryError::codec)?;

        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE phase_windows SET ended_at_us = $1 WHERE zone_id = $2 AND ended_at_us IS NULL")
            .bind(micros(at))
            .bind(zone_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            r#"
            INSERT INTO phase_windows (zone_id, phase, target_ranges, started_at_us, ended_at_us)
            VALUES ($1, $2, $3, $4, NULL)
            "#,
        )
        .bind(zone_id)
        .bind(phase.as_str())
        .bind(ranges_json)
        .bind(micros(at))
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        let window = PhaseWindow {
            zone_id: zone_id.to_string(),
            phase,
            target_ranges,
            started_at: at,
            ended_at: None,
        };
        self.active
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(zone_id.to_string(), window.clone());

        info!(
            zone_id,
            old_phase = previous.as_ref().map(|p| p.phase.as_str()).unwrap_or("none"),
            new_phase = phase.as_str(),
            "Phase transition at {}",
            at
        );
        Ok(window)
    }

    /// Move the zone on to the next phase in sequence with table targets.
    pub async fn advance_phase(&self, zone_id: &str, at: DateTime<Utc>) -> Result<PhaseWindow> {
        // ---
        let current = self.active_phase(zone_id)?;
        let next = current.phase.next().ok_or_else(|| TelemetryError::InvalidTransition {
            zone_id: zone_id.to_string(),
            reason: format!("no phase after {}", current.phase.as_str()),
        })?;
        self.transition_phase(zone_id, next, self.target_ranges(next), at).await
    }

    /// Every window the zone has had, oldest first.
    pub async fn history(&self, zone_id: &str) -> Result<Vec<PhaseWindow>> {
        // ---
        let rows: Vec<WindowRow> = sqlx::query_as(
            r#"
            SELECT zone_id, phase, target_ranges, started_at_us, ended_at_us
            FROM phase_windows WHERE zone_id = $1
            ORDER BY started_at_us, id
            "#,
        )
        .bind(zone_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(PhaseWindow::try_from).collect()
    }
}
