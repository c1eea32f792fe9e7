//! Alert persistence.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::error::{Result, TelemetryError};
use crate::models::{Alert, Severity};
use crate::schema::{from_micros, micros};

// ---

/// Default number of alerts returned by a listing.
pub const DEFAULT_LIST_LIMIT: i64 = 100;

/// Filters for [`AlertRepository::list`].
#[derive(Debug, Clone, Default)]
pub struct AlertFilter {
    pub zone_id: Option<String>,
    pub unresolved_only: bool,
    pub limit: Option<i64>,
}

#[derive(sqlx::FromRow)]
struct AlertRow {
    id: String,
    zone_id: String,
    device_id: Option<String>,
    alert_type: String,
    severity: String,
    message: String,
    sensor_type: Option<String>,
    value: Option<f64>,
    threshold_min: Option<f64>,
    threshold_max: Option<f64>,
    acknowledged: bool,
    acknowledged_at_us: Option<i64>,
    acknowledged_by: Option<String>,
    resolved: bool,
    resolved_at_us: Option<i64>,
    created_at_us: i64,
}

impl TryFrom<AlertRow> for Alert {
    type Error = TelemetryError;

    fn try_from(row: AlertRow) -> Result<Self> {
        Ok(Alert {
            id: Uuid::parse_str(&row.id).map_err(TelemetryError::codec)?,
            severity: Severity::parse(&row.severity)
                .ok_or_else(|| TelemetryError::codec(format!("unknown severity `{}`", row.severity)))?,
            acknowledged_at: row.acknowledged_at_us.map(from_micros).transpose()?,
            resolved_at: row.resolved_at_us.map(from_micros).transpose()?,
            created_at: from_micros(row.created_at_us)?,
            zone_id: row.zone_id,
            device_id: row.device_id,
            alert_type: row.alert_type,
            message: row.message,
            sensor_type: row.sensor_type,
            value: row.value,
            threshold_min: row.threshold_min,
            threshold_max: row.threshold_max,
            acknowledged: row.acknowledged,
            acknowledged_by: row.acknowledged_by,
            resolved: row.resolved,
        })
    }
}

const SELECT_ALERT: &str = r#"
    SELECT id, zone_id, device_id, alert_type, severity, message, sensor_type, value,
           threshold_min, threshold_max, acknowledged, acknowledged_at_us, acknowledged_by,
           resolved, resolved_at_us, created_at_us
    FROM alerts
"#;

/// Reads and writes the `alerts` table.
#[derive(Clone)]
pub struct AlertRepository {
    pool: SqlitePool,
}

impl AlertRepository {
    // ---
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, alert: &Alert) -> Result<()> {
        // ---
        sqlx::query(
            r#"
            INSERT INTO alerts (id, zone_id, device_id, alert_type, severity, message, sensor_type,
                                value, threshold_min, threshold_max, acknowledged, acknowledged_at_us,
                                acknowledged_by, resolved, resolved_at_us, created_at_us)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            "#,
        )
        .bind(alert.id.to_string())
        .bind(&alert.zone_id)
        .bind(&alert.device_id)
        .bind(&alert.alert_type)
        .bind(alert.severity.as_str())
        .bind(&alert.message)
        .bind(&alert.sensor_type)
        .bind(alert.value)
        .bind(alert.threshold_min)
        .bind(alert.threshold_max)
        .bind(alert.acknowledged)
        .bind(alert.acknowledged_at.map(micros))
        .bind(&alert.acknowledged_by)
        .bind(alert.resolved)
        .bind(alert.resolved_at.map(micros))
        .bind(micros(alert.created_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get(&self, id: Uuid) -> Result<Alert> {
        // ---
        let row: Option<AlertRow> = sqlx::query_as(&format!("{SELECT_ALERT} WHERE id = $1"))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.ok_or_else(|| TelemetryError::not_found(format!("alert {id}")))?
            .try_into()
    }

    /// Newest first, capped at the filter's limit (default 100).
    pub async fn list(&self, filter: &AlertFilter) -> Result<Vec<Alert>> {
        // ---
        let rows: Vec<AlertRow> = sqlx::query_as(&format!(
            r#"{SELECT_ALERT}
            WHERE ($1 IS NULL OR zone_id = $1)
              AND ($2 = 0 OR resolved = 0)
            ORDER BY created_at_us DESC, id
            LIMIT $3"#
        ))
        .bind(&filter.zone_id)
        .bind(filter.unresolved_only)
        .bind(filter.limit.unwrap_or(DEFAULT_LIST_LIMIT).max(0))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Alert::try_from).collect()
    }

    /// Every unresolved alert, oldest first.
    pub async fn unresolved(&self) -> Result<Vec<Alert>> {
        let rows: Vec<AlertRow> =
            sqlx::query_as(&format!("{SELECT_ALERT} WHERE resolved = 0 ORDER BY created_at_us, id"))
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter().map(Alert::try_from).collect()
    }

    /// Number of unresolved alerts in one zone.
    pub async fn count_unresolved(&self, zone_id: &str) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM alerts WHERE zone_id = $1 AND resolved = 0")
            .bind(zone_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn acknowledge(&self, id: Uuid, by: &str, at: DateTime<Utc>) -> Result<Alert> {
        // ---
        let done = sqlx::query(
            "UPDATE alerts SET acknowledged = 1, acknowledged_at_us = $1, acknowledged_by = $2 WHERE id = $3",
        )
        .bind(micros(at))
        .bind(by)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        if done.rows_affected() == 0 {
            return Err(TelemetryError::not_found(format!("alert {id}")));
        }
        self.get(id).await
    }

    /// Mark one alert resolved. Resolving twice keeps the first timestamp.
    pub async fn resolve(&self, id: Uuid, at: DateTime<Utc>) -> Result<Alert> {
        // ---
        let done = sqlx::query(
            r#"
            UPDATE alerts SET resolved = 1,
                   resolved_at_us = COALESCE(resolved_at_us, $1)
            WHERE id = $2
            "#,
        )
        .bind(micros(at))
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        if done.rows_affected() == 0 {
            return Err(TelemetryError::not_found(format!("alert {id}")));
        }
        self.get(id).await
    }

    /// Resolve every open alert of one `(zone, sensor_type)` key and return them.
    pub async fn resolve_open_for(&self, zone_id: &str, sensor_type: &str, at: DateTime<Utc>) -> Result<Vec<Alert>> {
        // ---
        let rows: Vec<AlertRow> = sqlx::query_as(&format!(
            "{SELECT_ALERT} WHERE zone_id = $1 AND sensor_type = $2 AND resolved = 0 ORDER BY created_at_us, id"
        ))
        .bind(zone_id)
        .bind(sensor_type)
        .fetch_all(&self.pool)
        .await?;

        let mut resolved = Vec::with_capacity(rows.len());
        for row in rows {
            let alert = Alert::try_from(row)?;
            resolved.push(self.resolve(alert.id, at).await?);
        }
        Ok(resolved)
    }
}
