//! Background maintenance: sealing, compaction and rollup refresh.
//!
//! Each concern runs in its own task on a `tokio::time::interval`. All tasks
//! stop when the shutdown channel flips to `true`. A failed tick is logged
//! and the work is picked up again on the next one.

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::rollup::{RefreshPolicy, RollupEngine};
use crate::store::PartitionedStore;
use crate::telemetry::Telemetry;

// ---

#[derive(Debug, Clone)]
pub struct MaintenanceSettings {
    /// Period of the seal and compress passes.
    pub interval: Duration,
    /// How long a chunk stays sealed before it is compressed.
    pub compress_after: TimeDelta,
}

impl Default for MaintenanceSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            compress_after: TimeDelta::days(7),
        }
    }
}

/// Spawn every maintenance task. Send `true` on the shutdown channel to stop
/// them, then await the returned handles.
pub fn spawn(
    telemetry: &Telemetry,
    settings: MaintenanceSettings,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    // ---
    let mut tasks = vec![
        tokio::spawn(run_seal_loop(
            Arc::clone(telemetry.store()),
            settings.interval,
            shutdown.clone(),
        )),
        tokio::spawn(run_compact_loop(
            Arc::clone(telemetry.store()),
            settings.clone(),
            shutdown.clone(),
        )),
    ];

    let engine = telemetry.rollup_engine();
    for policy in engine.policies().iter().cloned() {
        tasks.push(tokio::spawn(run_rollup_loop(
            Arc::clone(engine),
            policy,
            shutdown.clone(),
        )));
    }

    info!("Started {} maintenance task(s)", tasks.len());
    tasks
}

/// Wait for the next tick, or return `false` once shutdown is requested.
async fn next_tick(timer: &mut tokio::time::Interval, shutdown: &mut watch::Receiver<bool>) -> bool {
    // ---
    if *shutdown.borrow() {
        return false;
    }
    tokio::select! {
        _ = timer.tick() => true,
        changed = shutdown.changed() => changed.is_ok() && !*shutdown.borrow(),
    }
}

fn timer(period: Duration) -> tokio::time::Interval {
    let mut timer = tokio::time::interval(period.max(Duration::from_millis(1)));
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    timer
}

async fn run_seal_loop(store: Arc<PartitionedStore>, period: Duration, mut shutdown: watch::Receiver<bool>) {
    // ---
    let mut timer = timer(period);
    while next_tick(&mut timer, &mut shutdown).await {
        match store.seal_chunks_older_than(Utc::now()).await {
            Ok(sealed) if !sealed.is_empty() => info!("Sealed {} chunk(s)", sealed.len()),
            Ok(_) => debug!("No chunks to seal"),
            Err(e) => error!(error = %e, "Seal pass failed"),
        }
    }
    debug!("Seal loop stopped");
}

async fn run_compact_loop(
    store: Arc<PartitionedStore>,
    settings: MaintenanceSettings,
    mut shutdown: watch::Receiver<bool>,
) {
    // ---
    let mut timer = timer(settings.interval);
    while next_tick(&mut timer, &mut shutdown).await {
        let compressed = store.compress_eligible(Utc::now(), settings.compress_after).await;
        if !compressed.is_empty() {
            info!("Compressed {} chunk(s): {:?}", compressed.len(), compressed);
        }
    }
    debug!("Compaction loop stopped");
}

async fn run_rollup_loop(engine: Arc<RollupEngine>, policy: RefreshPolicy, mut shutdown: watch::Receiver<bool>) {
    // ---
    let granularity = policy.granularity.as_str();
    let mut timer = timer(policy.schedule_interval);
    while next_tick(&mut timer, &mut shutdown).await {
        let report = engine.refresh(&policy, Utc::now()).await;
        if report.failed > 0 {
            warn!(
                granularity,
                failed = report.failed,
                "Rollup refresh incomplete, retrying next tick"
            );
        } else {
            debug!(
                granularity,
                materialized = report.materialized,
                skipped = report.skipped,
                "Rollup refresh done"
            );
        }
    }
    debug!(granularity, "Rollup loop stopped");
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::schema::open_memory_pool;
    use crate::telemetry::TelemetrySettings;

    #[tokio::test]
    async fn test_tasks_stop_on_shutdown() {
        // ---
        let pool = open_memory_pool().await.unwrap();
        let telemetry = Telemetry::open(pool, TelemetrySettings::default()).await.unwrap();
        let (tx, rx) = watch::channel(false);

        let tasks = spawn(
            &telemetry,
            MaintenanceSettings {
                interval: Duration::from_millis(20),
                compress_after: TimeDelta::days(7),
            },
            rx,
        );
        assert_eq!(tasks.len(), 4);

        tokio::time::sleep(Duration::from_millis(60)).await;
        tx.send(true).unwrap();

        for task in tasks {
            tokio::time::timeout(Duration::from_secs(5), task)
                .await
                .unwrap()
                .unwrap();
        }
    }
}
