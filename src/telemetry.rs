//! The telemetry core as one handle: ingest pipeline plus query, phase and
//! alert operations.
//!
//! Ingest path: validate, store, enrich (VPD), publish, then hand the reading
//! to the alert dispatcher. Storage is the only step that can fail the caller;
//! alerting runs off to the side and may drop work under load.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use serde_json::json;
use sqlx::SqlitePool;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::alert::{AlertDispatcher, AlertEngine, AlertFilter, AlertRepository, DebounceConfig};
use crate::derivation::{ec_to_ppm_500, ec_to_ppm_700, fahrenheit, vapor_pressure_deficit};
use crate::error::{Result, TelemetryError};
use crate::events::{Notification, Notifier};
use crate::models::{Alert, DevicePayload, RawReading, Reading};
use crate::phase::{check_targets, GrowthPhase, PhaseRegistry, PhaseTable, PhaseWindow, TargetRanges};
use crate::rollup::{Aggregate, RefreshPolicy, RollupBucket, RollupEngine, RollupQuery};
use crate::store::{ChunkInfo, PartitionedStore, ReadingFilter};

// ---

/// Everything the core needs to open, independent of where it came from.
#[derive(Debug, Clone)]
pub struct TelemetrySettings {
    // ---
    pub chunk_span: TimeDelta,
    pub alerts: DebounceConfig,
    pub alert_workers: usize,
    pub alert_queue_depth: usize,
    /// Largest time gap between a temperature and a humidity reading that
    /// still pairs them into a derived VPD reading.
    pub vpd_pair_window: TimeDelta,
    pub notify_capacity: usize,
    pub phase_table: PhaseTable,
    pub rollup_policies: Vec<RefreshPolicy>,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            chunk_span: TimeDelta::days(1),
            alerts: DebounceConfig::default(),
            alert_workers: 4,
            alert_queue_depth: 1024,
            vpd_pair_window: TimeDelta::minutes(5),
            notify_capacity: 256,
            phase_table: PhaseTable::default(),
            rollup_policies: vec![RefreshPolicy::hourly(), RefreshPolicy::daily()],
        }
    }
}

/// Result of ingesting one reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum IngestOutcome {
    /// Stored, along with `derived` enrichment readings.
    Stored { derived: usize },
    /// Past the compaction horizon of `chunk_id`; dropped.
    Dropped { chunk_id: i64 },
}

/// Per-payload ingest tally.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchReport {
    pub accepted: usize,
    pub rejected: usize,
    pub dropped: usize,
    pub derived: usize,
    pub errors: Vec<String>,
}

/// Count/avg/min/max over raw readings.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReadingStats {
    pub count: i64,
    pub avg: f64,
    pub min: f64,
    pub max: f64,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

/// Newest value of each monitored quantity in a zone, with display units.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EnvironmentStatus {
    // ---
    pub temperature_c: Option<f64>,
    pub temperature_f: Option<f64>,
    pub humidity_percent: Option<f64>,
    pub vpd_kpa: Option<f64>,
    pub co2_ppm: Option<f64>,
    pub light_ppfd: Option<f64>,
    pub ph: Option<f64>,
    pub ec_ms: Option<f64>,
    pub ec_ppm_500: Option<i64>,
    pub ec_ppm_700: Option<i64>,
}

impl EnvironmentStatus {
    fn from_latest(readings: &[Reading]) -> Self {
        // ---
        let mut env = Self::default();
        let mut light_at: Option<DateTime<Utc>> = None;
        for r in readings {
            match r.sensor_type.as_str() {
                "temperature" => env.temperature_c = Some(r.value),
                "humidity" => env.humidity_percent = Some(r.value),
                "vpd" => env.vpd_kpa = Some(r.value),
                "co2" => env.co2_ppm = Some(r.value),
                "ph" => env.ph = Some(r.value),
                "ec" => env.ec_ms = Some(r.value),
                // Both names feed the same field; the newer one wins
                "light" | "light_ppfd" if light_at.map_or(true, |at| at <= r.time) => {
                    env.light_ppfd = Some(r.value);
                    light_at = Some(r.time);
                }
                _ => {}
            }
        }
        env.temperature_f = env.temperature_c.map(fahrenheit);
        env.ec_ppm_500 = env.ec_ms.map(ec_to_ppm_500);
        env.ec_ppm_700 = env.ec_ms.map(ec_to_ppm_700);
        env
    }
}

/// Current state of one zone at a glance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ZoneOverview {
    pub zone_id: String,
    pub phase: Option<PhaseWindow>,
    pub environment: EnvironmentStatus,
    /// Newest reading of every sensor type seen in the zone.
    pub latest: Vec<Reading>,
    pub reporting_devices: usize,
    pub unresolved_alerts: i64,
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    time: DateTime<Utc>,
    value: f64,
    quality: u8,
}

#[derive(Debug, Default)]
struct Companions {
    temperature: Option<Sample>,
    humidity: Option<Sample>,
}

pub struct Telemetry {
    store: Arc<PartitionedStore>,
    rollups: Arc<RollupEngine>,
    phases: Arc<PhaseRegistry>,
    alerts: Arc<AlertEngine>,
    dispatcher: AlertDispatcher,
    notifier: Notifier,
    vpd_pair_window: TimeDelta,
    companions: Mutex<HashMap<(String, String), Companions>>,
}

impl Telemetry {
    // ---
    /// Open every component over `pool` and rebuild in-memory state.
    ///
    /// Must be called from within a tokio runtime; alert workers are spawned here.
    pub async fn open(pool: SqlitePool, settings: TelemetrySettings) -> Result<Self> {
        // ---
        let store = Arc::new(PartitionedStore::open(pool.clone(), settings.chunk_span).await?);
        let rollups = Arc::new(RollupEngine::new(
            Arc::clone(&store),
            pool.clone(),
            settings.rollup_policies,
        ));
        let phases = Arc::new(PhaseRegistry::open(pool.clone(), Arc::new(settings.phase_table)).await?);
        let notifier = Notifier::new(settings.notify_capacity);

        let alerts = Arc::new(AlertEngine::new(
            Arc::clone(&phases),
            AlertRepository::new(pool),
            settings.alerts,
            notifier.clone(),
        ));
        alerts.rebuild(&store.latest_per_key().await?).await?;

        let dispatcher = AlertDispatcher::spawn(
            Arc::clone(&alerts),
            settings.alert_workers,
            settings.alert_queue_depth,
        );
        info!("Telemetry core opened with {} alert worker(s)", settings.alert_workers.max(1));

        Ok(Self {
            store,
            rollups,
            phases,
            alerts,
            dispatcher,
            notifier,
            vpd_pair_window: settings.vpd_pair_window,
            companions: Mutex::new(HashMap::new()),
        })
    }

    pub fn store(&self) -> &Arc<PartitionedStore> {
        &self.store
    }

    pub fn rollup_engine(&self) -> &Arc<RollupEngine> {
        &self.rollups
    }

    pub fn alert_engine(&self) -> &Arc<AlertEngine> {
        &self.alerts
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    // --- ingest

    async fn record(&self, reading: Reading) -> Result<()> {
        // ---
        self.store.append(&reading).await?;
        self.notifier.publish(Notification::SensorData {
            zone_id: reading.zone_id.clone(),
            device_id: reading.device_id.clone(),
            sensor_type: reading.sensor_type.clone(),
            value: reading.value,
            time: reading.time,
        });
        self.dispatcher.submit(reading);
        Ok(())
    }

    /// Validate and store one reading.
    ///
    /// `InvalidReading` is returned to the caller. Late data past the
    /// compaction horizon is reported as [`IngestOutcome::Dropped`].
    pub async fn ingest(&self, raw: RawReading) -> Result<IngestOutcome> {
        // ---
        let reading = raw.validate()?;
        let companion = self.pair_vpd(&reading);

        match self.record(reading).await {
            Ok(()) => {}
            Err(TelemetryError::OutOfOrderRejected { chunk_id, .. }) => {
                return Ok(IngestOutcome::Dropped { chunk_id });
            }
            Err(e) => return Err(e),
        }

        let mut derived = 0;
        if let Some(vpd) = companion {
            match self.record(vpd).await {
                Ok(()) => derived += 1,
                Err(TelemetryError::OutOfOrderRejected { .. }) => {}
                Err(e) => warn!("Failed to store derived VPD reading: {}", e),
            }
        }
        Ok(IngestOutcome::Stored { derived })
    }

    /// Ingest every reading of a device payload, validating each on its own.
    pub async fn ingest_payload(&self, payload: DevicePayload, now: DateTime<Utc>) -> Result<BatchReport> {
        // ---
        let device_id = payload.device_id.clone();
        let mut report = BatchReport::default();

        for raw in payload.into_raw_readings(now) {
            match self.ingest(raw).await {
                Ok(IngestOutcome::Stored { derived }) => {
                    report.accepted += 1;
                    report.derived += derived;
                }
                Ok(IngestOutcome::Dropped { .. }) => report.dropped += 1,
                Err(TelemetryError::InvalidReading { reason }) => {
                    report.rejected += 1;
                    report.errors.push(reason);
                }
                Err(e) => return Err(e),
            }
        }

        debug!(
            device_id = %device_id,
            accepted = report.accepted,
            rejected = report.rejected,
            dropped = report.dropped,
            "Payload ingested"
        );
        Ok(report)
    }

    /// Remember the newest temperature/humidity per (device, zone) and build
    /// a VPD reading when both are close enough in time.
    fn pair_vpd(&self, reading: &Reading) -> Option<Reading> {
        // ---
        let is_temperature = match reading.sensor_type.as_str() {
            "temperature" => true,
            "humidity" => false,
            _ => return None,
        };
        let sample = Sample {
            time: reading.time,
            value: reading.value,
            quality: reading.quality,
        };

        let other = {
            let mut companions = self.companions.lock().unwrap_or_else(|e| e.into_inner());
            let entry = companions
                .entry((reading.device_id.clone(), reading.zone_id.clone()))
                .or_default();
            let (slot, other) = if is_temperature {
                (&mut entry.temperature, entry.humidity)
            } else {
                (&mut entry.humidity, entry.temperature)
            };
            if slot.map_or(true, |s| s.time <= sample.time) {
                *slot = Some(sample);
            }
            other
        }?;

        if sample.time - other.time > self.vpd_pair_window || other.time - sample.time > self.vpd_pair_window {
            return None;
        }

        let (temp, rh) = if is_temperature { (sample, other) } else { (other, sample) };
        if !(0.0..=100.0).contains(&rh.value) {
            debug!(device_id = %reading.device_id, "Humidity {} outside 0..=100, no VPD", rh.value);
            return None;
        }

        Some(Reading {
            time: reading.time,
            device_id: reading.device_id.clone(),
            zone_id: reading.zone_id.clone(),
            sensor_type: "vpd".to_string(),
            value: vapor_pressure_deficit(temp.value, rh.value),
            unit: "kPa".to_string(),
            quality: temp.quality.min(rh.quality),
            metadata: json!({ "derived": true }),
        })
    }

    // --- queries

    pub async fn query_readings(&self, filter: ReadingFilter, limit: Option<usize>) -> Result<Vec<Reading>> {
        self.store.query_range(filter).collect(limit).await
    }

    /// Aggregate over raw readings in the filter's range; `None` when empty.
    pub async fn statistics(&self, filter: ReadingFilter) -> Result<Option<ReadingStats>> {
        // ---
        let (from, to) = (filter.from, filter.to);
        let mut cursor = self.store.query_range(filter);
        let mut agg: Option<Aggregate> = None;

        while let Some(batch) = cursor.next_batch().await? {
            for r in &batch {
                Aggregate::accumulate(&mut agg, r.value);
            }
        }

        Ok(agg.map(|a| ReadingStats {
            count: a.count,
            avg: a.avg(),
            min: a.min,
            max: a.max,
            from,
            to,
        }))
    }

    pub async fn query_rollups(&self, query: &RollupQuery) -> Result<Vec<RollupBucket>> {
        self.rollups.query(query).await
    }

    pub async fn chunks(&self) -> Vec<ChunkInfo> {
        self.store.chunks().await
    }

    /// Phase, newest readings and open alert count of a zone.
    ///
    /// `NotFound` when the zone has neither a phase nor any readings.
    pub async fn zone_overview(&self, zone_id: &str) -> Result<ZoneOverview> {
        // ---
        let phase = match self.phases.active_phase(zone_id) {
            Ok(window) => Some(window),
            Err(TelemetryError::NoActivePhase { .. }) => None,
            Err(e) => return Err(e),
        };
        let latest = self.store.latest_for_zone(zone_id).await?;
        if phase.is_none() && latest.is_empty() {
            return Err(TelemetryError::not_found(format!("zone {zone_id}")));
        }

        let reporting_devices = latest
            .iter()
            .map(|r| r.device_id.as_str())
            .collect::<HashSet<_>>()
            .len();
        Ok(ZoneOverview {
            zone_id: zone_id.to_string(),
            environment: EnvironmentStatus::from_latest(&latest),
            unresolved_alerts: self.alerts.repository().count_unresolved(zone_id).await?,
            phase,
            latest,
            reporting_devices,
        })
    }

    // --- phases

    pub fn active_phase(&self, zone_id: &str) -> Result<PhaseWindow> {
        self.phases.active_phase(zone_id)
    }

    pub fn zones(&self) -> Vec<String> {
        self.phases.zones()
    }

    pub fn target_ranges(&self, phase: GrowthPhase) -> TargetRanges {
        self.phases.target_ranges(phase)
    }

    /// Move a zone into `phase`.
    ///
    /// `overrides` are merged over the table's targets for the phase, so
    /// parameters they leave out keep their table values.
    pub async fn transition_phase(
        &self,
        zone_id: &str,
        phase: GrowthPhase,
        overrides: Option<TargetRanges>,
        at: DateTime<Utc>,
    ) -> Result<PhaseWindow> {
        // ---
        let mut ranges = self.phases.target_ranges(phase);
        if let Some(overrides) = overrides {
            check_targets(&overrides)?;
            ranges.extend(overrides);
        }
        let window = self.phases.transition_phase(zone_id, phase, ranges, at).await?;
        self.publish_phase(&window);
        Ok(window)
    }

    pub async fn advance_phase(&self, zone_id: &str, at: DateTime<Utc>) -> Result<PhaseWindow> {
        let window = self.phases.advance_phase(zone_id, at).await?;
        self.publish_phase(&window);
        Ok(window)
    }

    pub async fn phase_history(&self, zone_id: &str) -> Result<Vec<PhaseWindow>> {
        self.phases.history(zone_id).await
    }

    fn publish_phase(&self, window: &PhaseWindow) {
        self.notifier.publish(Notification::PhaseChange {
            zone_id: window.zone_id.clone(),
            new_phase: window.phase,
            started_at: window.started_at,
        });
    }

    // --- alerts

    pub async fn list_alerts(&self, filter: &AlertFilter) -> Result<Vec<Alert>> {
        self.alerts.repository().list(filter).await
    }

    pub async fn acknowledge_alert(&self, id: Uuid, by: &str, at: DateTime<Utc>) -> Result<Alert> {
        self.alerts.acknowledge(id, by, at).await
    }

    pub async fn resolve_alert(&self, id: Uuid, at: DateTime<Utc>) -> Result<Alert> {
        self.alerts.resolve(id, at).await
    }
}
