//! Fan-out of ingest, alert and phase events to push subscribers.
//!
//! Delivery is best effort. A slow subscriber lags and skips messages; a
//! publish with no subscribers is simply dropped.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

use crate::models::Alert;
use crate::phase::GrowthPhase;

// ---

/// Message pushed to live subscribers, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    /// A reading was stored.
    SensorData {
        zone_id: String,
        device_id: String,
        sensor_type: String,
        value: f64,
        time: DateTime<Utc>,
    },
    /// An alert was opened, repeated or resolved.
    Alert { alert: Alert },
    /// A zone entered a new growth phase.
    PhaseChange {
        zone_id: String,
        new_phase: GrowthPhase,
        started_at: DateTime<Utc>,
    },
}

impl Notification {
    pub fn zone_id(&self) -> &str {
        match self {
            Notification::SensorData { zone_id, .. } => zone_id,
            Notification::Alert { alert } => &alert.zone_id,
            Notification::PhaseChange { zone_id, .. } => zone_id,
        }
    }
}

/// Cloneable handle on the broadcast channel.
#[derive(Clone)]
pub struct Notifier {
    tx: broadcast::Sender<Notification>,
}

impl Notifier {
    // ---
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, notification: Notification) {
        // ---
        if self.tx.send(notification).is_err() {
            trace!("No live subscribers; notification dropped");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use chrono::TimeZone;

    #[tokio::test]
    async fn test_publish_reaches_subscribers() {
        // ---
        let notifier = Notifier::new(8);
        let mut rx = notifier.subscribe();
        let at = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();

        notifier.publish(Notification::PhaseChange {
            zone_id: "zone-main".to_string(),
            new_phase: GrowthPhase::FloweringEarly,
            started_at: at,
        });

        let got = rx.recv().await.unwrap();
        assert_eq!(got.zone_id(), "zone-main");

        let json = serde_json::to_value(&got).unwrap();
        assert_eq!(json["type"], "phase_change");
        assert_eq!(json["new_phase"], "flowering_early");
    }

    #[test]
    fn test_publish_without_subscribers_is_silent() {
        // ---
        let notifier = Notifier::new(1);
        assert_eq!(notifier.subscriber_count(), 0);
        notifier.publish(Notification::SensorData {
            zone_id: "zone-main".to_string(),
            device_id: "esp32-growroom-01".to_string(),
            sensor_type: "co2".to_string(),
            value: 900.0,
            time: Utc::now(),
        });
    }
}
