//! Data models shared across the telemetry core.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{Result, TelemetryError};

// ---

/// One stored sensor measurement. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    // ---
    pub time: DateTime<Utc>,
    pub device_id: String,
    pub zone_id: String,
    pub sensor_type: String,
    pub value: f64,
    pub unit: String,
    pub quality: u8,
    #[serde(default)]
    pub metadata: Value,
}

/// Reading as it arrives from the transport layer, before validation.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawReading {
    // ---
    pub time: Option<DateTime<Utc>>,
    pub device_id: Option<String>,
    pub zone_id: Option<String>,
    pub sensor_type: Option<String>,
    pub value: Option<f64>,
    pub unit: Option<String>,
    pub quality: Option<i64>,
    pub metadata: Option<Value>,
}

fn required(field: &'static str, value: Option<String>) -> Result<String> {
    match value.map(|v| v.trim().to_string()) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(TelemetryError::invalid(format!("missing required field `{field}`"))),
    }
}

impl RawReading {
    // ---
    /// Validate and normalise into a storable [`Reading`].
    ///
    /// Quality defaults to 100 when absent; sensor types are lower-cased.
    pub fn validate(self) -> Result<Reading> {
        // ---
        let time = self
            .time
            .ok_or_else(|| TelemetryError::invalid("missing required field `time`"))?;
        let device_id = required("device_id", self.device_id)?;
        let zone_id = required("zone_id", self.zone_id)?;
        let sensor_type = required("sensor_type", self.sensor_type)?.to_lowercase();
        let unit = required("unit", self.unit)?;

        let value = self
            .value
            .ok_or_else(|| TelemetryError::invalid("missing required field `value`"))?;
        if !value.is_finite() {
            return Err(TelemetryError::invalid(format!("value {value} is not finite")));
        }

        let quality = match self.quality {
            None => 100,
            Some(q) if (0..=100).contains(&q) => q as u8,
            Some(q) => {
                return Err(TelemetryError::invalid(format!(
                    "quality {q} outside [0, 100]"
                )))
            }
        };

        Ok(Reading {
            time,
            device_id,
            zone_id,
            sensor_type,
            value,
            unit,
            quality,
            metadata: self.metadata.unwrap_or(Value::Null),
        })
    }
}

/// One measurement inside a device payload.
#[derive(Debug, Clone, Deserialize)]
pub struct PayloadEntry {
    // ---
    #[serde(rename = "type")]
    pub sensor_type: String,
    pub value: f64,
    pub unit: String,
    pub quality: Option<i64>,
    pub metadata: Option<Value>,
}

/// Multi-reading message from a single device, sharing one timestamp.
#[derive(Debug, Clone, Deserialize)]
pub struct DevicePayload {
    // ---
    pub device_id: String,
    pub zone_id: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub readings: Vec<PayloadEntry>,
}

impl DevicePayload {
    // ---
    /// Fan the payload out into individual raw readings, stamping `now` when
    /// the device sent no timestamp.
    pub fn into_raw_readings(self, now: DateTime<Utc>) -> Vec<RawReading> {
        // ---
        let time = self.timestamp.unwrap_or(now);
        self.readings
            .into_iter()
            .map(|entry| RawReading {
                time: Some(time),
                device_id: Some(self.device_id.clone()),
                zone_id: Some(self.zone_id.clone()),
                sensor_type: Some(entry.sensor_type),
                value: Some(entry.value),
                unit: Some(entry.unit),
                quality: entry.quality,
                metadata: entry.metadata,
            })
            .collect()
    }
}

/// Alert severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "info" => Some(Severity::Info),
            "warning" => Some(Severity::Warning),
            "critical" => Some(Severity::Critical),
            _ => None,
        }
    }
}

/// Alert record. Created by the alert engine, mutated by acknowledge/resolve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    // ---
    pub id: Uuid,
    pub zone_id: String,
    pub device_id: Option<String>,
    pub alert_type: String,
    pub severity: Severity,
    pub message: String,
    pub sensor_type: Option<String>,
    pub value: Option<f64>,
    pub threshold_min: Option<f64>,
    pub threshold_max: Option<f64>,
    pub acknowledged: bool,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub acknowledged_by: Option<String>,
    pub resolved: bool,
    pub resolved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}
