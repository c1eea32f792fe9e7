//! Rollup engine: fixed-granularity aggregate buckets derived from raw readings.
//!
//! A bucket is always recomputed from the complete set of readings in its
//! window and swapped in atomically; there is no incremental patching. Only
//! buckets inside a policy's refresh window are ever recomputed by the
//! scheduler, so buckets older than that are final.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::{debug, info, warn};

use crate::error::{Result, TelemetryError};
use crate::schema::{from_micros, micros};
use crate::store::{PartitionedStore, ReadingFilter};

// ---

/// Bucket width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Hour,
    Day,
}

impl Granularity {
    pub fn as_str(self) -> &'static str {
        match self {
            Granularity::Hour => "hour",
            Granularity::Day => "day",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "hour" | "hourly" => Some(Granularity::Hour),
            "day" | "daily" => Some(Granularity::Day),
            _ => None,
        }
    }

    pub fn width(self) -> TimeDelta {
        match self {
            Granularity::Hour => TimeDelta::hours(1),
            Granularity::Day => TimeDelta::days(1),
        }
    }

    /// Start of the bucket containing `t` (UTC-aligned).
    pub fn align(self, t: DateTime<Utc>) -> DateTime<Utc> {
        let width = self.width().num_microseconds().unwrap_or(i64::MAX);
        let us = micros(t);
        // Aligned instants are always representable when `t` is
        from_micros(us - us.rem_euclid(width)).unwrap_or(t)
    }
}

/// How often a granularity is recomputed and which buckets are still eligible.
#[derive(Debug, Clone)]
pub struct RefreshPolicy {
    // ---
    pub granularity: Granularity,
    pub schedule_interval: Duration,
    /// Buckets overlapping `[now - start_offset, now - end_offset)` are
    /// recomputed on every refresh; older ones are final.
    pub start_offset: TimeDelta,
    /// Buckets starting at or after `now - end_offset` are not yet materialized.
    pub end_offset: TimeDelta,
}

impl RefreshPolicy {
    pub fn hourly() -> Self {
        Self {
            granularity: Granularity::Hour,
            schedule_interval: Duration::from_secs(5 * 60),
            start_offset: TimeDelta::hours(3),
            end_offset: TimeDelta::zero(),
        }
    }

    pub fn daily() -> Self {
        Self {
            granularity: Granularity::Day,
            schedule_interval: Duration::from_secs(60 * 60),
            start_offset: TimeDelta::days(3),
            end_offset: TimeDelta::zero(),
        }
    }

    /// Bucket starts eligible for re-materialization at `now`, oldest first.
    pub fn eligible_buckets(&self, now: DateTime<Utc>) -> Vec<DateTime<Utc>> {
        // ---
        let g = self.granularity;
        let hi = now - self.end_offset;
        let mut b = g.align(now - self.start_offset);
        let mut out = Vec::new();
        while b < hi {
            out.push(b);
            b += g.width();
        }
        out
    }
}

/// Materialized aggregate over one bucket for one (device, zone, sensor) key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollupBucket {
    // ---
    pub bucket_start: DateTime<Utc>,
    pub granularity: Granularity,
    pub device_id: String,
    pub zone_id: String,
    pub sensor_type: String,
    pub avg: f64,
    pub min: f64,
    pub max: f64,
    pub count: i64,
}

/// Running avg/min/max/count, fed in time order.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Aggregate {
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    pub count: i64,
}

impl Aggregate {
    fn new(value: f64) -> Self {
        Self {
            sum: value,
            min: value,
            max: value,
            count: 1,
        }
    }

    fn push(&mut self, value: f64) {
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        self.count += 1;
    }

    pub fn avg(&self) -> f64 {
        self.sum / self.count as f64
    }

    /// Fold `value` into `acc`, starting it on the first value.
    pub fn accumulate(acc: &mut Option<Self>, value: f64) {
        match acc.as_mut() {
            Some(a) => a.push(value),
            None => *acc = Some(Self::new(value)),
        }
    }
}

/// Filter for [`RollupEngine::query`].
#[derive(Debug, Clone)]
pub struct RollupQuery {
    // ---
    pub granularity: Granularity,
    pub device_id: Option<String>,
    pub zone_id: Option<String>,
    pub sensor_type: Option<String>,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

/// Outcome of one scheduled refresh pass.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RefreshReport {
    pub materialized: usize,
    pub skipped: usize,
    pub failed: usize,
}

type FlightKey = (Granularity, i64);

struct FlightGuard<'a> {
    set: &'a Mutex<HashSet<FlightKey>>,
    key: FlightKey,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.key);
    }
}

#[derive(sqlx::FromRow)]
struct BucketRow {
    granularity: String,
    bucket_start_us: i64,
    device_id: String,
    zone_id: String,
    sensor_type: String,
    avg: f64,
    min: f64,
    max: f64,
    count: i64,
}

impl TryFrom<BucketRow> for RollupBucket {
    type Error = TelemetryError;

    fn try_from(row: BucketRow) -> Result<Self> {
        Ok(RollupBucket {
            bucket_start: from_micros(row.bucket_start_us)?,
            granularity: Granularity::parse(&row.granularity).ok_or_else(|| {
                TelemetryError::codec(format!("unknown granularity `{}`", row.granularity))
            })?,
            device_id: row.device_id,
            zone_id: row.zone_id,
            sensor_type: row.sensor_type,
            avg: row.avg,
            min: row.min,
            max: row.max,
            count: row.count,
        })
    }
}

/// Derives and serves rollup buckets.
pub struct RollupEngine {
    store: Arc<PartitionedStore>,
    pool: SqlitePool,
    policies: Vec<RefreshPolicy>,
    in_flight: Mutex<HashSet<FlightKey>>,
}

impl RollupEngine {
    // ---
    pub fn new(store: Arc<PartitionedStore>, pool: SqlitePool, policies: Vec<RefreshPolicy>) -> Self {
        Self {
            store,
            pool,
            policies,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn policies(&self) -> &[RefreshPolicy] {
        &self.policies
    }

    fn try_fly(&self, key: FlightKey) -> Option<FlightGuard<'_>> {
        let mut set = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if set.insert(key) {
            Some(FlightGuard {
                set: &self.in_flight,
                key,
            })
        } else {
            None
        }
    }

    /// Recompute every key's bucket in the window starting at `bucket_start`.
    ///
    /// Returns the number of buckets written, or `None` when another task is
    /// already materializing the same window.
    pub async fn materialize(&self, granularity: Granularity, bucket_start: DateTime<Utc>) -> Result<Option<usize>> {
        // ---
        let bucket_start = granularity.align(bucket_start);
        let Some(_guard) = self.try_fly((granularity, micros(bucket_start))) else {
            debug!(granularity = granularity.as_str(), %bucket_start, "Materialization already in flight");
            return Ok(None);
        };

        self.recompute(granularity, bucket_start)
            .await
            .map(Some)
            .map_err(|e| TelemetryError::RollupRecomputeFailed {
                granularity: granularity.as_str().to_string(),
                bucket_start,
                message: e.to_string(),
            })
    }

    async fn recompute(&self, granularity: Granularity, bucket_start: DateTime<Utc>) -> Result<usize> {
        // ---
        let filter = ReadingFilter::range(bucket_start, bucket_start + granularity.width());
        let mut cursor = self.store.query_range(filter);

        let mut groups: BTreeMap<(String, String, String), Option<Aggregate>> = BTreeMap::new();
        while let Some(batch) = cursor.next_batch().await? {
            for r in batch {
                Aggregate::accumulate(groups.entry((r.device_id, r.zone_id, r.sensor_type)).or_default(), r.value);
            }
        }
        let groups: Vec<_> = groups
            .into_iter()
            .filter_map(|(key, agg)| agg.map(|agg| (key, agg)))
            .collect();

        // Replace the whole window in one transaction
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM rollup_buckets WHERE granularity = $1 AND bucket_start_us = $2")
            .bind(granularity.as_str())
            .bind(micros(bucket_start))
            .execute(&mut *tx)
            .await?;

        for ((device_id, zone_id, sensor_type), agg) in &groups {
            sqlx::query(
                r#"
                INSERT INTO rollup_buckets (
                    granularity, bucket_start_us, device_id, zone_id, sensor_type,
                    avg, min, max, count
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                "#,
            )
            .bind(granularity.as_str())
            .bind(micros(bucket_start))
            .bind(device_id)
            .bind(zone_id)
            .bind(sensor_type)
            .bind(agg.avg())
            .bind(agg.min)
            .bind(agg.max)
            .bind(agg.count)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        Ok(groups.len())
    }

    /// Re-materialize every bucket in `policy`'s refresh window at `now`.
    pub async fn refresh(&self, policy: &RefreshPolicy, now: DateTime<Utc>) -> RefreshReport {
        // ---
        let mut report = RefreshReport::default();
        for bucket_start in policy.eligible_buckets(now) {
            match self.materialize(policy.granularity, bucket_start).await {
                Ok(Some(_)) => report.materialized += 1,
                Ok(None) => report.skipped += 1,
                Err(e) => {
                    warn!("{}; retrying next tick", e);
                    report.failed += 1;
                }
            }
        }
        info!(
            granularity = policy.granularity.as_str(),
            materialized = report.materialized,
            skipped = report.skipped,
            failed = report.failed,
            "Rollup refresh complete"
        );
        report
    }

    /// Materialized buckets whose start lies in `[from, to)`, ordered by start then key.
    pub async fn query(&self, q: &RollupQuery) -> Result<Vec<RollupBucket>> {
        // ---
        let rows: Vec<BucketRow> = sqlx::query_as(
            r#"
            SELECT granularity, bucket_start_us, device_id, zone_id, sensor_type, avg, min, max, count
            FROM rollup_buckets
            WHERE granularity = $1
              AND bucket_start_us >= $2 AND bucket_start_us < $3
              AND ($4 IS NULL OR device_id = $4)
              AND ($5 IS NULL OR zone_id = $5)
              AND ($6 IS NULL OR sensor_type = $6)
            ORDER BY bucket_start_us, device_id, zone_id, sensor_type
            "#,
        )
        .bind(q.granularity.as_str())
        .bind(micros(q.from))
        .bind(micros(q.to))
        .bind(q.device_id.as_deref())
        .bind(q.zone_id.as_deref())
        .bind(q.sensor_type.as_deref())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(RollupBucket::try_from).collect()
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::models::Reading;
    use crate::schema::open_memory_pool;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 10, 0, 0).unwrap()
    }

    fn create_test_reading(time: DateTime<Utc>, value: f64) -> Reading {
        Reading {
            time,
            device_id: "esp32-growroom-01".to_string(),
            zone_id: "zone-main".to_string(),
            sensor_type: "temperature".to_string(),
            value,
            unit: "°C".to_string(),
            quality: 100,
            metadata: serde_json::Value::Null,
        }
    }

    async fn create_test_engine() -> (Arc<PartitionedStore>, RollupEngine) {
        // ---
        let pool = open_memory_pool().await.unwrap();
        let store = Arc::new(PartitionedStore::open(pool.clone(), TimeDelta::days(1)).await.unwrap());
        let engine = RollupEngine::new(Arc::clone(&store), pool, vec![RefreshPolicy::hourly()]);
        (store, engine)
    }

    fn hour_query(from: DateTime<Utc>, to: DateTime<Utc>) -> RollupQuery {
        RollupQuery {
            granularity: Granularity::Hour,
            device_id: None,
            zone_id: Some("zone-main".to_string()),
            sensor_type: Some("temperature".to_string()),
            from,
            to,
        }
    }

    #[test]
    fn test_alignment() {
        // ---
        let t = Utc.with_ymd_and_hms(2025, 6, 1, 10, 42, 17).unwrap();
        assert_eq!(Granularity::Hour.align(t), t0());
        assert_eq!(
            Granularity::Day.align(t),
            Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_eligible_window() {
        // ---
        let now = t0() + TimeDelta::minutes(30);
        let buckets = RefreshPolicy::hourly().eligible_buckets(now);
        // The first bucket starts before now - 3h but overlaps the window
        assert_eq!(
            buckets,
            vec![
                t0() - TimeDelta::hours(3),
                t0() - TimeDelta::hours(2),
                t0() - TimeDelta::hours(1),
                t0()
            ]
        );
    }

    #[tokio::test]
    async fn test_bucket_aggregates() {
        // ---
        let (store, engine) = create_test_engine().await;
        for (i, v) in [10.0, 20.0, 30.0].into_iter().enumerate() {
            store
                .append(&create_test_reading(t0() + TimeDelta::minutes(i as i64 * 10), v))
                .await
                .unwrap();
        }
        // Next bucket must not leak into this one
        store.append(&create_test_reading(t0() + TimeDelta::hours(1), 99.0)).await.unwrap();

        assert_eq!(engine.materialize(Granularity::Hour, t0()).await.unwrap(), Some(1));

        let buckets = engine.query(&hour_query(t0(), t0() + TimeDelta::hours(1))).await.unwrap();
        assert_eq!(buckets.len(), 1);
        let b = &buckets[0];
        assert_eq!((b.avg, b.min, b.max, b.count), (20.0, 10.0, 30.0, 3));
        assert_eq!(b.bucket_start, t0());
    }

    #[tokio::test]
    async fn test_materialize_is_idempotent() {
        // ---
        let (store, engine) = create_test_engine().await;
        for i in 0..17 {
            store
                .append(&create_test_reading(t0() + TimeDelta::minutes(i * 3), 21.0 + (i as f64) * 0.37))
                .await
                .unwrap();
        }

        engine.materialize(Granularity::Hour, t0()).await.unwrap();
        let first = engine.query(&hour_query(t0(), t0() + TimeDelta::hours(1))).await.unwrap();
        engine.materialize(Granularity::Hour, t0()).await.unwrap();
        let second = engine.query(&hour_query(t0(), t0() + TimeDelta::hours(1))).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first[0].avg.to_bits(), second[0].avg.to_bits());
    }

    #[tokio::test]
    async fn test_late_data_inside_window_is_absorbed_outside_is_final() {
        // ---
        let (store, engine) = create_test_engine().await;
        let policy = RefreshPolicy::hourly();

        store.append(&create_test_reading(t0() + TimeDelta::minutes(5), 20.0)).await.unwrap();
        engine.refresh(&policy, t0() + TimeDelta::minutes(30)).await;

        // Late arrival while the bucket is still in the refresh window
        store.append(&create_test_reading(t0() + TimeDelta::minutes(10), 30.0)).await.unwrap();
        engine.refresh(&policy, t0() + TimeDelta::hours(1)).await;
        let b = engine.query(&hour_query(t0(), t0() + TimeDelta::hours(1))).await.unwrap();
        assert_eq!((b[0].count, b[0].avg), (2, 25.0));

        // Extremely late arrival after the bucket fell out of the window
        store.append(&create_test_reading(t0() + TimeDelta::minutes(15), 100.0)).await.unwrap();
        let report = engine.refresh(&policy, t0() + TimeDelta::hours(6)).await;
        assert_eq!(report.failed, 0);
        let b = engine.query(&hour_query(t0(), t0() + TimeDelta::hours(1))).await.unwrap();
        assert_eq!((b[0].count, b[0].avg), (2, 25.0));
    }

    #[tokio::test]
    async fn test_single_flight_per_bucket() {
        // ---
        let (_store, engine) = create_test_engine().await;
        let key = (Granularity::Hour, micros(t0()));

        let guard = engine.try_fly(key).unwrap();
        assert_eq!(engine.materialize(Granularity::Hour, t0()).await.unwrap(), None);
        drop(guard);
        assert_eq!(engine.materialize(Granularity::Hour, t0()).await.unwrap(), Some(0));
    }

    #[test]
    fn test_aggregate_accumulates() {
        // ---
        let mut agg = None;
        for v in [4.0, 1.0, 7.0] {
            Aggregate::accumulate(&mut agg, v);
        }
        let agg = agg.unwrap();
        assert_eq!((agg.count, agg.min, agg.max, agg.avg()), (3, 1.0, 7.0, 4.0));
    }
}
