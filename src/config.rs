//! Configuration loader for the `growtelemetry` service.
//!
//! All runtime settings come from environment variables (with optional `.env`
//! support provided by the caller) and are loaded once at startup. Nothing
//! else in the crate reads the environment.

use std::{env, fs, net::SocketAddr, time::Duration};

use anyhow::{anyhow, Context, Result};
use chrono::TimeDelta;

use growtelemetry::alert::DebounceConfig;
use growtelemetry::phase::{check_targets, PhaseOverrides, PhaseTable};
use growtelemetry::rollup::RefreshPolicy;
use growtelemetry::scheduler::MaintenanceSettings;
use growtelemetry::telemetry::TelemetrySettings;

/// Parse an optional integer environment variable with a default value.
macro_rules! parse_env_u32 {
    ($var_name:expr, $default:expr) => {
        env::var($var_name)
            .ok()
            .map(|v| v.parse::<u32>())
            .transpose()
            .map_err(|e| anyhow!("Invalid {}: {}", $var_name, e))?
            .unwrap_or($default)
    };
}

/// Parse an optional duration in whole seconds.
macro_rules! parse_env_secs {
    ($var_name:expr, $default:expr) => {
        env::var($var_name)
            .ok()
            .map(|v| v.parse::<u64>())
            .transpose()
            .map_err(|e| anyhow!("Invalid {}: {}", $var_name, e))?
            .unwrap_or($default)
    };
}

/// Parse a required string environment variable.
macro_rules! require_env {
    ($var_name:expr) => {
        env::var($var_name)
            .map_err(|_| anyhow!("{} must be set in .env or environment", $var_name))?
    };
}

/// Strongly typed application configuration.
///
/// Immutable after loading.
#[derive(Debug, Clone)]
pub struct Config {
    // ---
    /// sqlx SQLite connection string.
    pub db_url: String,

    /// Maximum number of database connections in the pool.
    pub db_pool_max: u32,

    /// Address the HTTP server binds to.
    pub bind_addr: SocketAddr,

    pub chunk_span_secs: u64,
    pub compress_after_secs: u64,
    pub maintenance_interval_secs: u64,

    pub alert_debounce_secs: u64,
    pub alert_cooldown_secs: u64,
    pub alert_workers: u32,
    pub alert_queue_depth: u32,

    pub vpd_pair_window_secs: u64,
    pub notify_capacity: u32,

    /// Where the phase-target overrides came from, if anywhere.
    pub phase_targets_file: Option<String>,
    pub phase_overrides: PhaseOverrides,

    pub rollup_policies: Vec<RefreshPolicy>,
}

/// Load configuration from environment variables with defaults.
///
/// Required:
/// - `DATABASE_URL` – sqlx SQLite URL, e.g. `sqlite://telemetry.db`
///
/// Optional:
/// - `DB_POOL_MAX` (5), `BIND_ADDR` (`0.0.0.0:8080`)
/// - `CHUNK_SPAN_SECS` (86400), `COMPRESS_AFTER_SECS` (604800),
///   `MAINTENANCE_INTERVAL_SECS` (300)
/// - `ALERT_DEBOUNCE_SECS` (60), `ALERT_COOLDOWN_SECS` (1800),
///   `ALERT_WORKERS` (4), `ALERT_QUEUE_DEPTH` (1024)
/// - `VPD_PAIR_WINDOW_SECS` (300), `NOTIFY_CAPACITY` (256)
/// - `PHASE_TARGETS_FILE` – JSON file of per-phase target overrides
pub fn load_from_env() -> Result<Config> {
    // ---
    let db_url = require_env!("DATABASE_URL");
    let db_pool_max = parse_env_u32!("DB_POOL_MAX", 5);
    let bind_addr = env::var("BIND_ADDR")
        .unwrap_or_else(|_| "0.0.0.0:8080".to_string())
        .parse::<SocketAddr>()
        .map_err(|e| anyhow!("Invalid BIND_ADDR: {}", e))?;

    let chunk_span_secs = parse_env_secs!("CHUNK_SPAN_SECS", 86_400);
    if chunk_span_secs == 0 {
        return Err(anyhow!("CHUNK_SPAN_SECS must be greater than zero"));
    }

    let phase_targets_file = env::var("PHASE_TARGETS_FILE").ok().filter(|p| !p.is_empty());
    let phase_overrides = match &phase_targets_file {
        Some(path) => load_phase_overrides(path)?,
        None => PhaseOverrides::new(),
    };

    Ok(Config {
        db_url,
        db_pool_max,
        bind_addr,
        chunk_span_secs,
        compress_after_secs: parse_env_secs!("COMPRESS_AFTER_SECS", 604_800),
        maintenance_interval_secs: parse_env_secs!("MAINTENANCE_INTERVAL_SECS", 300),
        alert_debounce_secs: parse_env_secs!("ALERT_DEBOUNCE_SECS", 60),
        alert_cooldown_secs: parse_env_secs!("ALERT_COOLDOWN_SECS", 1_800),
        alert_workers: parse_env_u32!("ALERT_WORKERS", 4),
        alert_queue_depth: parse_env_u32!("ALERT_QUEUE_DEPTH", 1024),
        vpd_pair_window_secs: parse_env_secs!("VPD_PAIR_WINDOW_SECS", 300),
        notify_capacity: parse_env_u32!("NOTIFY_CAPACITY", 256),
        phase_targets_file,
        phase_overrides,
        rollup_policies: vec![RefreshPolicy::hourly(), RefreshPolicy::daily()],
    })
}

fn load_phase_overrides(path: &str) -> Result<PhaseOverrides> {
    // ---
    let text = fs::read_to_string(path).with_context(|| format!("Failed to read PHASE_TARGETS_FILE '{path}'"))?;
    let overrides: PhaseOverrides =
        serde_json::from_str(&text).with_context(|| format!("Invalid phase targets in '{path}'"))?;
    for (phase, ranges) in &overrides {
        check_targets(ranges).with_context(|| format!("Invalid {} targets in '{path}'", phase.as_str()))?;
    }
    Ok(overrides)
}

fn secs(s: u64) -> TimeDelta {
    // Clamped well inside TimeDelta's range.
    TimeDelta::seconds(s.min(u64::MAX >> 24) as i64)
}

impl Config {
    /// Settings for [`growtelemetry::Telemetry::open`].
    pub fn telemetry_settings(&self) -> TelemetrySettings {
        // ---
        TelemetrySettings {
            chunk_span: secs(self.chunk_span_secs),
            alerts: DebounceConfig {
                debounce: secs(self.alert_debounce_secs),
                cooldown: secs(self.alert_cooldown_secs),
                ..Default::default()
            },
            alert_workers: self.alert_workers as usize,
            alert_queue_depth: self.alert_queue_depth as usize,
            vpd_pair_window: secs(self.vpd_pair_window_secs),
            notify_capacity: self.notify_capacity as usize,
            phase_table: PhaseTable::with_overrides(self.phase_overrides.clone()),
            rollup_policies: self.rollup_policies.clone(),
        }
    }

    pub fn maintenance_settings(&self) -> MaintenanceSettings {
        MaintenanceSettings {
            interval: Duration::from_secs(self.maintenance_interval_secs),
            compress_after: secs(self.compress_after_secs),
        }
    }

    /// Log the loaded configuration for debugging purposes.
    ///
    /// Masks any password embedded in the database URL.
    pub fn log_config(&self) {
        // ---
        let masked_db_url = if let Some(at_pos) = self.db_url.rfind('@') {
            if let Some(colon_pos) = self.db_url[..at_pos].rfind(':') {
                format!(
                    "{}:****{}",
                    &self.db_url[..colon_pos],
                    &self.db_url[at_pos..]
                )
            } else {
                self.db_url.clone()
            }
        } else {
            self.db_url.clone()
        };

        tracing::info!("Configuration loaded:");
        tracing::info!("  DATABASE_URL              : {}", masked_db_url);
        tracing::info!("  DB_POOL_MAX               : {}", self.db_pool_max);
        tracing::info!("  BIND_ADDR                 : {}", self.bind_addr);
        tracing::info!("  CHUNK_SPAN_SECS           : {}", self.chunk_span_secs);
        tracing::info!("  COMPRESS_AFTER_SECS       : {}", self.compress_after_secs);
        tracing::info!("  MAINTENANCE_INTERVAL_SECS : {}", self.maintenance_interval_secs);
        tracing::info!("  ALERT_DEBOUNCE_SECS       : {}", self.alert_debounce_secs);
        tracing::info!("  ALERT_COOLDOWN_SECS       : {}", self.alert_cooldown_secs);
        tracing::info!("  ALERT_WORKERS             : {}", self.alert_workers);
        tracing::info!("  ALERT_QUEUE_DEPTH         : {}", self.alert_queue_depth);
        tracing::info!("  VPD_PAIR_WINDOW_SECS      : {}", self.vpd_pair_window_secs);
        tracing::info!("  NOTIFY_CAPACITY           : {}", self.notify_capacity);
        tracing::info!(
            "  PHASE_TARGETS_FILE        : {} ({} phase override(s))",
            self.phase_targets_file.as_deref().unwrap_or("<built-in>"),
            self.phase_overrides.len()
        );
        for policy in &self.rollup_policies {
            tracing::info!(
                "  ROLLUP {:<5}              : every {:?}, window [now-{}s, now-{}s)",
                policy.granularity.as_str(),
                policy.schedule_interval,
                policy.start_offset.num_seconds(),
                policy.end_offset.num_seconds()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_settings_carry_alert_timing() {
        // ---
        let cfg = Config {
            db_url: "sqlite::memory:".to_string(),
            db_pool_max: 1,
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            chunk_span_secs: 3600,
            compress_after_secs: 7200,
            maintenance_interval_secs: 10,
            alert_debounce_secs: 30,
            alert_cooldown_secs: 600,
            alert_workers: 2,
            alert_queue_depth: 8,
            vpd_pair_window_secs: 120,
            notify_capacity: 16,
            phase_targets_file: None,
            phase_overrides: PhaseOverrides::new(),
            rollup_policies: vec![RefreshPolicy::hourly()],
        };

        let settings = cfg.telemetry_settings();
        assert_eq!(settings.chunk_span, TimeDelta::hours(1));
        assert_eq!(settings.alerts.debounce, TimeDelta::seconds(30));
        assert_eq!(settings.alerts.cooldown, TimeDelta::minutes(10));
        assert_eq!(settings.rollup_policies.len(), 1);
        assert_eq!(cfg.maintenance_settings().compress_after, TimeDelta::hours(2));
    }

    #[test]
    fn test_phase_overrides_parse() {
        // ---
        let path = env::temp_dir().join(format!("phase-targets-{}.json", std::process::id()));
        fs::write(&path, r#"{"flowering_mid": {"temperature": [19.0, 25.0], "light": "12/12"}}"#).unwrap();

        let overrides = load_phase_overrides(path.to_str().unwrap()).unwrap();
        assert_eq!(overrides.len(), 1);

        fs::write(&path, r#"{"flowering_mid": {"humidity": [50.0, 40.0]}}"#).unwrap();
        let err = load_phase_overrides(path.to_str().unwrap()).unwrap_err();
        assert!(format!("{err:#}").contains("inverted"));

        fs::write(&path, "not json").unwrap();
        assert!(load_phase_overrides(path.to_str().unwrap()).is_err());
        let _ = fs::remove_file(&path);
    }
}
