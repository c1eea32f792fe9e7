//! Hands readings to the alert engine off the ingest path.
//!
//! Each key hashes to one worker, so a key's readings are evaluated in the
//! order they were submitted. Queues are bounded and a full queue drops the
//! evaluation, never the stored reading.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

use super::AlertEngine;
use crate::models::Reading;
use crate::phase::Parameter;

// ---

pub struct AlertDispatcher {
    shards: Vec<mpsc::Sender<Reading>>,
}

impl AlertDispatcher {
    // ---
    /// Spawn `workers` evaluation tasks with queues of `depth` readings each.
    pub fn spawn(engine: Arc<AlertEngine>, workers: usize, depth: usize) -> Self {
        // ---
        let shards = (0..workers.max(1))
            .map(|shard| {
                let (tx, mut rx) = mpsc::channel::<Reading>(depth.max(1));
                let engine = Arc::clone(&engine);
                tokio::spawn(async move {
                    while let Some(reading) = rx.recv().await {
                        if let Err(e) = engine.evaluate(&reading).await {
                            warn!(shard, zone_id = %reading.zone_id, "Alert evaluation failed: {}", e);
                        }
                    }
                    debug!(shard, "Alert worker stopped");
                });
                tx
            })
            .collect();
        Self { shards }
    }

    fn shard_for(&self, reading: &Reading) -> usize {
        // ---
        let mut hasher = DefaultHasher::new();
        reading.zone_id.hash(&mut hasher);
        match Parameter::from_sensor_type(&reading.sensor_type) {
            Some(parameter) => parameter.hash(&mut hasher),
            None => reading.sensor_type.hash(&mut hasher),
        }
        (hasher.finish() % self.shards.len() as u64) as usize
    }

    /// Queue a reading for evaluation. Returns `false` when it was dropped.
    pub fn submit(&self, reading: Reading) -> bool {
        // ---
        let shard = self.shard_for(&reading);
        match self.shards[shard].try_send(reading) {
            Ok(()) => true,
            Err(TrySendError::Full(reading)) => {
                warn!(
                    zone_id = %reading.zone_id,
                    sensor_type = %reading.sensor_type,
                    "Alert queue {} full, evaluation dropped",
                    shard
                );
                false
            }
            Err(TrySendError::Closed(_)) => {
                warn!(shard, "Alert worker has stopped, evaluation dropped");
                false
            }
        }
    }
}
