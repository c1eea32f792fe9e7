//! Debounce/hysteresis state machine for one (zone, parameter) key.
//!
//! Time is taken from the readings themselves, never from the wall clock, so
//! the machine is deterministic and replayable.

use std::collections::BTreeMap;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::models::Severity;
use crate::phase::Parameter;

// ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DebounceStatus {
    Ok,
    Pending,
    Active,
    Resolved,
}

/// How far past the target window a value must be to escalate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SeverityBands {
    /// Severity for any deviation up to `critical`.
    pub base: Severity,
    /// Deviation beyond which the alert is critical.
    pub critical: f64,
}

/// Timing and severity configuration for the alert engine.
#[derive(Debug, Clone)]
pub struct DebounceConfig {
    // ---
    pub debounce: TimeDelta,
    pub cooldown: TimeDelta,
    pub bands: BTreeMap<Parameter, SeverityBands>,
}

impl Default for DebounceConfig {
    fn default() -> Self {
        // ---
        let band = |base, critical| SeverityBands { base, critical };
        Self {
            debounce: TimeDelta::seconds(60),
            cooldown: TimeDelta::minutes(30),
            bands: BTreeMap::from([
                (Parameter::Temperature, band(Severity::Warning, 5.0)),
                (Parameter::Humidity, band(Severity::Warning, 10.0)),
                (Parameter::Vpd, band(Severity::Warning, 0.4)),
                (Parameter::Co2, band(Severity::Info, 400.0)),
                (Parameter::Ph, band(Severity::Warning, 0.5)),
                (Parameter::Ec, band(Severity::Warning, 0.5)),
                (Parameter::Light, band(Severity::Info, f64::INFINITY)),
            ]),
        }
    }
}

impl DebounceConfig {
    /// Severity of `value` against `[min, max]` for `parameter`.
    pub fn classify(&self, parameter: Parameter, value: f64, min: f64, max: f64) -> Severity {
        // ---
        let deviation = if value < min {
            min - value
        } else if value > max {
            value - max
        } else {
            0.0
        };
        let bands = self.bands.get(&parameter).copied().unwrap_or(SeverityBands {
            base: Severity::Warning,
            critical: f64::INFINITY,
        });
        if deviation > bands.critical {
            Severity::Critical
        } else {
            bands.base
        }
    }
}

/// What a single step asks the engine to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Nothing to report.
    Unchanged,
    /// Breach started; waiting out the debounce window.
    Pending,
    /// Breach ended before the debounce window elapsed.
    Cleared,
    /// Raise an alert; `repeat` when this episode already has an alert.
    Raise { repeat: bool },
    /// Still breaching but within cooldown of the last alert.
    Suppressed,
    /// Breach ended; close the episode's alerts.
    Resolve,
}

/// Per-key debounce state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DebounceState {
    // ---
    pub status: DebounceStatus,
    pub breach_started_at: Option<DateTime<Utc>>,
    pub last_alert_at: Option<DateTime<Utc>>,
    pub current_alert_id: Option<Uuid>,
    /// Time of the newest reading evaluated for this key.
    pub last_seen: Option<DateTime<Utc>>,
}

impl Default for DebounceState {
    fn default() -> Self {
        Self {
            status: DebounceStatus::Ok,
            breach_started_at: None,
            last_alert_at: None,
            current_alert_id: None,
            last_seen: None,
        }
    }
}

impl DebounceState {
    // ---
    fn cooled_down(&self, at: DateTime<Utc>, cfg: &DebounceConfig) -> bool {
        self.last_alert_at.map_or(true, |last| at - last >= cfg.cooldown)
    }

    fn activate(&mut self, at: DateTime<Utc>, cfg: &DebounceConfig) -> Transition {
        self.status = DebounceStatus::Active;
        if self.cooled_down(at, cfg) {
            self.last_alert_at = Some(at);
            Transition::Raise { repeat: false }
        } else {
            Transition::Suppressed
        }
    }

    /// Advance the machine with one reading taken at `at`.
    pub fn step(&mut self, breach: bool, at: DateTime<Utc>, cfg: &DebounceConfig) -> Transition {
        // ---
        self.last_seen = Some(at);

        match (self.status, breach) {
            (DebounceStatus::Ok | DebounceStatus::Resolved, false) => {
                self.status = DebounceStatus::Ok;
                Transition::Unchanged
            }
            (DebounceStatus::Ok | DebounceStatus::Resolved, true) => {
                self.status = DebounceStatus::Pending;
                self.breach_started_at = Some(at);
                if cfg.debounce <= TimeDelta::zero() {
                    self.activate(at, cfg)
                } else {
                    Transition::Pending
                }
            }
            (DebounceStatus::Pending, false) => {
                self.status = DebounceStatus::Ok;
                self.breach_started_at = None;
                Transition::Cleared
            }
            (DebounceStatus::Pending, true) => {
                let started = self.breach_started_at.unwrap_or(at);
                if at - started >= cfg.debounce {
                    self.activate(at, cfg)
                } else {
                    Transition::Unchanged
                }
            }
            (DebounceStatus::Active, false) => {
                self.status = DebounceStatus::Resolved;
                self.breach_started_at = None;
                self.current_alert_id = None;
                Transition::Resolve
            }
            (DebounceStatus::Active, true) => {
                if self.cooled_down(at, cfg) {
                    self.last_alert_at = Some(at);
                    Transition::Raise {
                        repeat: self.current_alert_id.is_some(),
                    }
                } else {
                    Transition::Suppressed
                }
            }
        }
    }
}
