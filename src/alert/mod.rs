//! Alert debounce engine.
//!
//! Readings are judged against the active phase's target window for their
//! zone. A per-(zone, parameter) state machine turns sustained breaches into
//! alerts and closes them when the value comes back. Evaluation never blocks
//! ingestion: anything the engine cannot judge is skipped and logged.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Result, TelemetryError};
use crate::events::{Notification, Notifier};
use crate::models::{Alert, Reading};
use crate::phase::{GrowthPhase, Parameter, PhaseRegistry};

mod debounce;
mod dispatch;
mod repository;

pub use debounce::{DebounceConfig, DebounceState, DebounceStatus, SeverityBands, Transition};
pub use dispatch::AlertDispatcher;
pub use repository::{AlertFilter, AlertRepository, DEFAULT_LIST_LIMIT};

// ---

/// `alert_type` of alerts raised by threshold evaluation.
pub const THRESHOLD_ALERT: &str = "threshold";

/// Why a reading was not evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    UnknownSensor,
    NoActivePhase,
    NoNumericTarget,
    OutOfOrder,
}

/// Result of evaluating one reading.
#[derive(Debug, Clone, PartialEq)]
pub enum Evaluation {
    Skipped(SkipReason),
    Evaluated {
        status: DebounceStatus,
        transition: Transition,
        /// Alerts created or resolved by this step.
        alerts: Vec<Alert>,
    },
}

type StateKey = (String, Parameter);

pub struct AlertEngine {
    registry: Arc<PhaseRegistry>,
    repository: AlertRepository,
    config: DebounceConfig,
    notifier: Notifier,
    states: Mutex<HashMap<StateKey, Arc<tokio::sync::Mutex<DebounceState>>>>,
}

impl AlertEngine {
    // ---
    pub fn new(
        registry: Arc<PhaseRegistry>,
        repository: AlertRepository,
        config: DebounceConfig,
        notifier: Notifier,
    ) -> Self {
        Self {
            registry,
            repository,
            config,
            notifier,
            states: Mutex::new(HashMap::new()),
        }
    }

    pub fn repository(&self) -> &AlertRepository {
        &self.repository
    }

    pub(crate) fn state_handle(&self, zone_id: &str, parameter: Parameter) -> Arc<tokio::sync::Mutex<DebounceState>> {
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(states.entry((zone_id.to_string(), parameter)).or_default())
    }

    /// Current debounce state of a key, if it has ever been evaluated.
    pub async fn state(&self, zone_id: &str, parameter: Parameter) -> Option<DebounceState> {
        // ---
        let handle = {
            let states = self.states.lock().unwrap_or_else(|e| e.into_inner());
            states.get(&(zone_id.to_string(), parameter)).cloned()
        }?;
        let state = handle.lock().await;
        Some(state.clone())
    }

    /// Run one reading through its key's state machine.
    ///
    /// Readings of the same key are serialized; a reading older than the last
    /// one evaluated for its key is skipped.
    pub async fn evaluate(&self, reading: &Reading) -> Result<Evaluation> {
        // ---
        let Some(parameter) = Parameter::from_sensor_type(&reading.sensor_type) else {
            debug!(sensor_type = %reading.sensor_type, "No alert targets for sensor type, skipping");
            return Ok(Evaluation::Skipped(SkipReason::UnknownSensor));
        };

        let window = match self.registry.active_phase(&reading.zone_id) {
            Ok(window) => window,
            Err(TelemetryError::NoActivePhase { .. }) => {
                debug!(zone_id = %reading.zone_id, "Zone has no active phase, skipping alert evaluation");
                return Ok(Evaluation::Skipped(SkipReason::NoActivePhase));
            }
            Err(e) => return Err(e),
        };

        let Some((min, max)) = window.target_ranges.get(&parameter).and_then(|t| t.range()) else {
            debug!(
                zone_id = %reading.zone_id,
                parameter = parameter.as_str(),
                "No numeric target in phase {}, skipping",
                window.phase.as_str()
            );
            return Ok(Evaluation::Skipped(SkipReason::NoNumericTarget));
        };

        let handle = self.state_handle(&reading.zone_id, parameter);
        let mut state = handle.lock().await;

        if state.last_seen.is_some_and(|seen| reading.time < seen) {
            debug!(
                zone_id = %reading.zone_id,
                parameter = parameter.as_str(),
                "Reading at {} older than last evaluated, skipping",
                reading.time
            );
            return Ok(Evaluation::Skipped(SkipReason::OutOfOrder));
        }

        let snapshot = state.clone();
        let breach = reading.value < min || reading.value > max;
        let transition = state.step(breach, reading.time, &self.config);

        let alerts = match transition {
            Transition::Raise { repeat } => {
                let alert = self.build_alert(reading, parameter, window.phase, (min, max), repeat);
                if let Err(e) = self.repository.insert(&alert).await {
                    *state = snapshot;
                    return Err(e);
                }
                state.current_alert_id = Some(alert.id);
                warn!(
                    zone_id = %alert.zone_id,
                    severity = alert.severity.as_str(),
                    repeat,
                    "Alert raised: {}",
                    alert.message
                );
                self.notifier.publish(Notification::Alert { alert: alert.clone() });
                vec![alert]
            }
            Transition::Resolve => {
                let closed = match self
                    .repository
                    .resolve_open_for(&reading.zone_id, parameter.as_str(), reading.time)
                    .await
                {
                    Ok(closed) => closed,
                    Err(e) => {
                        *state = snapshot;
                        return Err(e);
                    }
                };
                info!(
                    zone_id = %reading.zone_id,
                    parameter = parameter.as_str(),
                    "Value {} back within [{min}, {max}], resolved {} alert(s)",
                    reading.value,
                    closed.len()
                );
                for alert in &closed {
                    self.notifier.publish(Notification::Alert { alert: alert.clone() });
                }
                closed
            }
            Transition::Suppressed => {
                debug!(zone_id = %reading.zone_id, parameter = parameter.as_str(), "Breach within cooldown");
                Vec::new()
            }
            Transition::Unchanged | Transition::Pending | Transition::Cleared => Vec::new(),
        };

        Ok(Evaluation::Evaluated {
            status: state.status,
            transition,
            alerts,
        })
    }

    fn build_alert(
        &self,
        reading: &Reading,
        parameter: Parameter,
        phase: GrowthPhase,
        (min, max): (f64, f64),
        repeat: bool,
    ) -> Alert {
        // ---
        let severity = self.config.classify(parameter, reading.value, min, max);
        let direction = if reading.value < min { "below" } else { "above" };
        let mut message = format!(
            "{} {} is {direction} {} target [{min}, {max}] ({})",
            parameter.as_str(),
            reading.value,
            phase.as_str(),
            severity.as_str()
        );
        if repeat {
            message.push_str(", still out of range");
        }

        Alert {
            id: Uuid::new_v4(),
            zone_id: reading.zone_id.clone(),
            device_id: Some(reading.device_id.clone()),
            alert_type: THRESHOLD_ALERT.to_string(),
            severity,
            message,
            sensor_type: Some(parameter.as_str().to_string()),
            value: Some(reading.value),
            threshold_min: Some(min),
            threshold_max: Some(max),
            acknowledged: false,
            acknowledged_at: None,
            acknowledged_by: None,
            resolved: false,
            resolved_at: None,
            created_at: reading.time,
        }
    }

    pub async fn acknowledge(&self, id: Uuid, by: &str, at: DateTime<Utc>) -> Result<Alert> {
        let alert = self.repository.acknowledge(id, by, at).await?;
        info!(alert_id = %id, by, "Alert acknowledged");
        Ok(alert)
    }

    /// Resolve an alert by hand.
    ///
    /// When it is the current alert of its key, every other open alert of the
    /// key is closed with it, the key returns to OK and a continuing breach
    /// has to re-qualify through the debounce window.
    pub async fn resolve(&self, id: Uuid, at: DateTime<Utc>) -> Result<Alert> {
        // ---
        let alert = self.repository.resolve(id, at).await?;
        info!(alert_id = %id, zone_id = %alert.zone_id, "Alert resolved manually");
        self.notifier.publish(Notification::Alert { alert: alert.clone() });

        let Some(parameter) = alert.sensor_type.as_deref().and_then(Parameter::from_sensor_type) else {
            return Ok(alert);
        };
        let handle = {
            let states = self.states.lock().unwrap_or_else(|e| e.into_inner());
            states.get(&(alert.zone_id.clone(), parameter)).cloned()
        };
        let Some(handle) = handle else {
            return Ok(alert);
        };

        let mut state = handle.lock().await;
        if state.current_alert_id == Some(id) {
            let closed = self
                .repository
                .resolve_open_for(&alert.zone_id, parameter.as_str(), at)
                .await?;
            if !closed.is_empty() {
                info!(
                    zone_id = %alert.zone_id,
                    parameter = parameter.as_str(),
                    "Closed {} earlier alert(s) of the same breach",
                    closed.len()
                );
            }
            for earlier in &closed {
                self.notifier.publish(Notification::Alert { alert: earlier.clone() });
            }
            state.status = DebounceStatus::Ok;
            state.breach_started_at = None;
            state.current_alert_id = None;
        }
        Ok(alert)
    }

    /// Reconstruct debounce state after a restart.
    ///
    /// Keys with unresolved threshold alerts come back ACTIVE; every key's
    /// `last_seen` is the newer of its latest alert and its latest stored
    /// reading. Returns the number of keys restored.
    pub async fn rebuild(&self, latest_readings: &[(String, String, DateTime<Utc>)]) -> Result<usize> {
        // ---
        let mut restored: HashMap<StateKey, DebounceState> = HashMap::new();

        for alert in self.repository.unresolved().await? {
            if alert.alert_type != THRESHOLD_ALERT {
                continue;
            }
            let Some(parameter) = alert.sensor_type.as_deref().and_then(Parameter::from_sensor_type) else {
                continue;
            };
            let state = restored.entry((alert.zone_id.clone(), parameter)).or_default();
            state.status = DebounceStatus::Active;
            state.breach_started_at.get_or_insert(alert.created_at);
            state.last_alert_at = Some(alert.created_at);
            state.current_alert_id = Some(alert.id);
            state.last_seen = state.last_seen.max(Some(alert.created_at));
        }

        for (zone_id, sensor_type, time) in latest_readings {
            let Some(parameter) = Parameter::from_sensor_type(sensor_type) else {
                continue;
            };
            let state = restored.entry((zone_id.clone(), parameter)).or_default();
            state.last_seen = state.last_seen.max(Some(*time));
        }

        let count = restored.len();
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        for (key, state) in restored {
            states.insert(key, Arc::new(tokio::sync::Mutex::new(state)));
        }
        info!("Alert engine rebuilt {} key state(s)", count);
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::models::Severity;
    use crate::phase::PhaseTable;
    use crate::schema::open_memory_pool;
    use chrono::{TimeDelta, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 7, 14, 10, 0, 0).unwrap()
    }

    fn create_test_reading(sensor_type: &str, value: f64, secs: i64) -> Reading {
        // ---
        Reading {
            time: t0() + TimeDelta::seconds(secs),
            device_id: "esp32-growroom-01".to_string(),
            zone_id: "zone-main".to_string(),
            sensor_type: sensor_type.to_string(),
            value,
            unit: "°C".to_string(),
            quality: 100,
            metadata: serde_json::Value::Null,
        }
    }

    /// Engine with `zone-main` in early flowering (temperature 20..=26).
    async fn create_test_engine() -> (AlertEngine, Notifier) {
        // ---
        let pool = open_memory_pool().await.unwrap();
        let registry = Arc::new(PhaseRegistry::open(pool.clone(), Arc::new(PhaseTable::default())).await.unwrap());
        let phase = GrowthPhase::FloweringEarly;
        let mut ranges = registry.target_ranges(phase);
        ranges.insert(Parameter::Temperature, crate::phase::Target::Range(20.0, 26.0));
        registry
            .transition_phase("zone-main", phase, ranges, t0() - TimeDelta::days(1))
            .await
            .unwrap();

        let notifier = Notifier::new(64);
        let engine = AlertEngine::new(
            registry,
            AlertRepository::new(pool),
            DebounceConfig::default(),
            notifier.clone(),
        );
        (engine, notifier)
    }

    async fn feed(engine: &AlertEngine, steps: &[(f64, i64)]) -> Vec<Alert> {
        // ---
        let mut raised = Vec::new();
        for (value, secs) in steps {
            let eval = engine.evaluate(&create_test_reading("temperature", *value, *secs)).await.unwrap();
            if let Evaluation::Evaluated {
                transition: Transition::Raise { .. },
                alerts,
                ..
            } = eval
            {
                raised.extend(alerts);
            }
        }
        raised
    }

    #[tokio::test]
    async fn test_transient_breach_creates_no_alert() {
        // ---
        let (engine, _) = create_test_engine().await;
        let raised = feed(&engine, &[(28.0, 0), (28.0, 30), (24.0, 50)]).await;

        assert!(raised.is_empty());
        assert!(engine.repository().list(&AlertFilter::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sustained_breach_alerts_once_then_auto_resolves() {
        // ---
        let (engine, notifier) = create_test_engine().await;
        let mut rx = notifier.subscribe();

        let raised = feed(&engine, &[(28.0, 0), (28.5, 30), (29.0, 60), (29.0, 120)]).await;
        assert_eq!(raised.len(), 1);
        let alert = &raised[0];
        assert_eq!(alert.severity, Severity::Warning);
        assert_eq!(alert.threshold_min, Some(20.0));
        assert_eq!(alert.threshold_max, Some(26.0));
        assert!(alert.message.contains("29"));
        assert!(alert.message.contains("[20, 26]"));

        let eval = engine.evaluate(&create_test_reading("temperature", 24.0, 180)).await.unwrap();
        assert!(matches!(
            eval,
            Evaluation::Evaluated {
                status: DebounceStatus::Resolved,
                transition: Transition::Resolve,
                ..
            }
        ));

        let stored = engine.repository().get(alert.id).await.unwrap();
        assert!(stored.resolved);
        assert_eq!(stored.resolved_at, Some(t0() + TimeDelta::seconds(180)));

        let opened = rx.recv().await.unwrap();
        let closed = rx.recv().await.unwrap();
        assert!(matches!(opened, Notification::Alert { ref alert } if !alert.resolved));
        assert!(matches!(closed, Notification::Alert { ref alert } if alert.resolved));
    }

    #[tokio::test]
    async fn test_cooldown_suppresses_until_elapsed() {
        // ---
        let (engine, _) = create_test_engine().await;
        let cooldown = 30 * 60;

        let first = feed(&engine, &[(28.0, 0), (28.0, 60), (24.0, 90), (28.0, 120), (28.0, 200)]).await;
        assert_eq!(first.len(), 1, "second episode inside cooldown stays quiet");

        let state = engine.state("zone-main", Parameter::Temperature).await.unwrap();
        assert_eq!(state.status, DebounceStatus::Active);

        let later = feed(&engine, &[(28.0, 60 + cooldown + 1)]).await;
        assert_eq!(later.len(), 1);
        assert_eq!(engine.repository().unresolved().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_critical_deviation() {
        // ---
        let (engine, _) = create_test_engine().await;
        let raised = feed(&engine, &[(32.0, 0), (32.0, 60)]).await;
        assert_eq!(raised[0].severity, Severity::Critical);
    }

    #[tokio::test]
    async fn test_skips_never_fail() {
        // ---
        let (engine, _) = create_test_engine().await;

        let unknown = engine.evaluate(&create_test_reading("soil_moisture", 1.0, 0)).await.unwrap();
        assert_eq!(unknown, Evaluation::Skipped(SkipReason::UnknownSensor));

        let mut elsewhere = create_test_reading("temperature", 40.0, 0);
        elsewhere.zone_id = "tent-9".to_string();
        assert_eq!(
            engine.evaluate(&elsewhere).await.unwrap(),
            Evaluation::Skipped(SkipReason::NoActivePhase)
        );

        // light is a schedule outside of drying/curing
        let light = engine.evaluate(&create_test_reading("light", 0.0, 0)).await.unwrap();
        assert_eq!(light, Evaluation::Skipped(SkipReason::NoNumericTarget));

        engine.evaluate(&create_test_reading("temperature", 24.0, 100)).await.unwrap();
        let late = engine.evaluate(&create_test_reading("temperature", 40.0, 50)).await.unwrap();
        assert_eq!(late, Evaluation::Skipped(SkipReason::OutOfOrder));
    }

    #[tokio::test]
    async fn test_manual_resolve_resets_key() {
        // ---
        let (engine, _) = create_test_engine().await;
        let raised = feed(&engine, &[(28.0, 0), (28.0, 60)]).await;

        let resolved = engine.resolve(raised[0].id, t0() + TimeDelta::seconds(70)).await.unwrap();
        assert!(resolved.resolved);

        let state = engine.state("zone-main", Parameter::Temperature).await.unwrap();
        assert_eq!(state.status, DebounceStatus::Ok);
        assert_eq!(state.current_alert_id, None);

        let acked = engine.acknowledge(raised[0].id, "grower", t0() + TimeDelta::seconds(80)).await.unwrap();
        assert!(acked.acknowledged);
    }

    #[tokio::test]
    async fn test_manual_resolve_of_repeat_closes_whole_breach() {
        // ---
        let (engine, _) = create_test_engine().await;
        let raised = feed(&engine, &[(28.0, 0), (28.0, 60), (28.0, 1861)]).await;
        assert_eq!(raised.len(), 2);
        assert!(raised[1].message.ends_with(", still out of range"));

        engine.resolve(raised[1].id, t0() + TimeDelta::seconds(1870)).await.unwrap();

        let first = engine.repository().get(raised[0].id).await.unwrap();
        assert!(first.resolved, "earlier alert of the breach closes with the repeat");
        assert_eq!(first.resolved_at, Some(t0() + TimeDelta::seconds(1870)));

        feed(&engine, &[(24.0, 1881), (24.0, 5461)]).await;
        assert!(engine.repository().unresolved().await.unwrap().is_empty());

        // A restart finds nothing left to restore as ACTIVE.
        let fresh = AlertEngine::new(
            Arc::clone(&engine.registry),
            engine.repository().clone(),
            DebounceConfig::default(),
            Notifier::new(4),
        );
        fresh.rebuild(&[]).await.unwrap();
        assert!(fresh.state("zone-main", Parameter::Temperature).await.is_none());
    }

    #[tokio::test]
    async fn test_first_alert_after_suppressed_episode_is_not_a_repeat() {
        // ---
        let (engine, _) = create_test_engine().await;
        let cooldown = 30 * 60;

        // Episode one alerts at 60 and resolves; episode two starts inside the cooldown.
        let raised = feed(&engine, &[(28.0, 0), (28.0, 60), (24.0, 90), (28.0, 120), (28.0, 180)]).await;
        assert_eq!(raised.len(), 1);

        let later = feed(&engine, &[(28.0, 60 + cooldown + 1)]).await;
        assert_eq!(later.len(), 1);
        assert!(!later[0].message.contains("still out of range"));
    }

    #[tokio::test]
    async fn test_rebuild_restores_active_keys() {
        // ---
        let (engine, _) = create_test_engine().await;
        let raised = feed(&engine, &[(28.0, 0), (28.0, 60)]).await;

        // Fresh engine over the same storage.
        let fresh = AlertEngine::new(
            Arc::clone(&engine.registry),
            engine.repository().clone(),
            DebounceConfig::default(),
            Notifier::new(4),
        );
        let latest = vec![(
            "zone-main".to_string(),
            "temperature".to_string(),
            t0() + TimeDelta::seconds(90),
        )];
        assert_eq!(fresh.rebuild(&latest).await.unwrap(), 1);

        let state = fresh.state("zone-main", Parameter::Temperature).await.unwrap();
        assert_eq!(state.status, DebounceStatus::Active);
        assert_eq!(state.current_alert_id, Some(raised[0].id));
        assert_eq!(state.last_seen, Some(t0() + TimeDelta::seconds(90)));

        let eval = fresh.evaluate(&create_test_reading("temperature", 22.0, 120)).await.unwrap();
        assert!(matches!(eval, Evaluation::Evaluated { transition: Transition::Resolve, .. }));
    }
}
