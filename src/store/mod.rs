//! Partitioned, append-only storage of raw readings.
//!
//! Readings land in time-aligned chunks of a fixed span. Each chunk moves
//! `Open -> Sealed -> Compressed`; only compression changes the physical
//! representation (row table to a columnar blob), never the query result.
//!
//! Appends to a chunk hold its state lock shared, so any number of writers
//! proceed together. Seal and compress take it exclusively, which drains
//! in-flight appends before the state flips.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use sqlx::SqlitePool;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::{Result, TelemetryError};
use crate::models::Reading;
use crate::schema::{from_micros, micros};

pub mod codec;

use codec::StoredRow;

// ---

/// Lifecycle of a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkState {
    Open,
    Sealed,
    Compressed,
}

impl ChunkState {
    fn as_str(self) -> &'static str {
        match self {
            ChunkState::Open => "open",
            ChunkState::Sealed => "sealed",
            ChunkState::Compressed => "compressed",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s {
            "open" => Ok(ChunkState::Open),
            "sealed" => Ok(ChunkState::Sealed),
            "compressed" => Ok(ChunkState::Compressed),
            other => Err(TelemetryError::codec(format!("unknown chunk state `{other}`"))),
        }
    }
}

/// Snapshot of one chunk for listings.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChunkInfo {
    pub chunk_id: i64,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub state: ChunkState,
}

struct ChunkHandle {
    id: i64,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    state: RwLock<ChunkState>,
}

/// Filter for range queries; `None` matches everything.
#[derive(Debug, Clone, Default)]
pub struct ReadingFilter {
    // ---
    pub device_id: Option<String>,
    pub zone_id: Option<String>,
    pub sensor_type: Option<String>,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl ReadingFilter {
    /// Half-open range `[from, to)` with no key filters.
    pub fn range(from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self {
            from,
            to,
            ..Default::default()
        }
    }

    fn matches(&self, row: &StoredRow) -> bool {
        let from = micros(self.from);
        let to = micros(self.to);
        row.time_us >= from
            && row.time_us < to
            && self.device_id.as_ref().map_or(true, |d| &row.device_id == d)
            && self.zone_id.as_ref().map_or(true, |z| &row.zone_id == z)
            && self.sensor_type.as_ref().map_or(true, |s| &row.sensor_type == s)
    }
}

/// Chunked reading store backed by SQLite.
pub struct PartitionedStore {
    pool: SqlitePool,
    span: TimeDelta,
    chunks: Mutex<BTreeMap<i64, Arc<ChunkHandle>>>,
}

impl PartitionedStore {
    // ---
    /// Open the store, rebuilding the chunk catalogue from storage.
    pub async fn open(pool: SqlitePool, span: TimeDelta) -> Result<Self> {
        // ---
        let rows: Vec<(i64, i64, i64, String)> =
            sqlx::query_as("SELECT chunk_id, start_us, end_us, state FROM chunks ORDER BY chunk_id")
                .fetch_all(&pool)
                .await?;

        let mut chunks = BTreeMap::new();
        for (id, start_us, end_us, state) in rows {
            chunks.insert(
                id,
                Arc::new(ChunkHandle {
                    id,
                    start: from_micros(start_us)?,
                    end: from_micros(end_us)?,
                    state: RwLock::new(ChunkState::parse(&state)?),
                }),
            );
        }
        info!("Partitioned store opened with {} chunks", chunks.len());

        Ok(Self {
            pool,
            span,
            chunks: Mutex::new(chunks),
        })
    }

    /// Chunk span used for partitioning.
    pub fn span(&self) -> TimeDelta {
        self.span
    }

    /// Id of the chunk that owns `time`.
    pub fn chunk_id_for(&self, time: DateTime<Utc>) -> i64 {
        micros(time).div_euclid(self.span_us())
    }

    fn span_us(&self) -> i64 {
        self.span.num_microseconds().unwrap_or(i64::MAX).max(1)
    }

    fn lock_chunks(&self) -> std::sync::MutexGuard<'_, BTreeMap<i64, Arc<ChunkHandle>>> {
        // Only plain map operations happen under this lock, so a poisoned
        // guard still holds a consistent map.
        self.chunks.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn chunk_for(&self, time: DateTime<Utc>) -> Result<Arc<ChunkHandle>> {
        // ---
        let id = self.chunk_id_for(time);
        let (handle, created) = {
            let mut chunks = self.lock_chunks();
            match chunks.get(&id) {
                Some(h) => (Arc::clone(h), false),
                None => {
                    let start = from_micros(id * self.span_us())?;
                    let handle = Arc::new(ChunkHandle {
                        id,
                        start,
                        end: start + self.span,
                        state: RwLock::new(ChunkState::Open),
                    });
                    chunks.insert(id, Arc::clone(&handle));
                    (handle, true)
                }
            }
        };

        if created {
            // Transitions upsert their state, so losing this race to a seal is harmless
            sqlx::query(
                "INSERT OR IGNORE INTO chunks (chunk_id, start_us, end_us, state) VALUES ($1, $2, $3, 'open')",
            )
            .bind(handle.id)
            .bind(micros(handle.start))
            .bind(micros(handle.end))
            .execute(&self.pool)
            .await?;
            debug!(chunk_id = handle.id, "Created chunk");
        }
        Ok(handle)
    }

    fn handle(&self, chunk_id: i64) -> Result<Arc<ChunkHandle>> {
        self.lock_chunks()
            .get(&chunk_id)
            .cloned()
            .ok_or_else(|| TelemetryError::not_found(format!("chunk {chunk_id}")))
    }

    /// Append one reading; visible to queries as soon as this returns.
    ///
    /// Fails with `OutOfOrderRejected` only when the owning chunk is already
    /// compressed.
    pub async fn append(&self, reading: &Reading) -> Result<()> {
        // ---
        let handle = self.chunk_for(reading.time).await?;
        let state = handle.state.read().await;

        if *state == ChunkState::Compressed {
            warn!(
                chunk_id = handle.id,
                device_id = %reading.device_id,
                sensor_type = %reading.sensor_type,
                "Dropping reading at {} past the compaction horizon",
                reading.time
            );
            return Err(TelemetryError::OutOfOrderRejected {
                chunk_id: handle.id,
                time: reading.time,
            });
        }

        let metadata = serde_json::to_string(&reading.metadata).map_err(TelemetryError::codec)?;
        sqlx::query(
            r#"
            INSERT INTO readings (
                chunk_id, time_us, device_id, zone_id,
                sensor_type, value, unit, quality, metadata
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(handle.id)
        .bind(micros(reading.time))
        .bind(&reading.device_id)
        .bind(&reading.zone_id)
        .bind(&reading.sensor_type)
        .bind(reading.value)
        .bind(&reading.unit)
        .bind(i64::from(reading.quality))
        .bind(metadata)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Lazy, restartable cursor over readings matching `filter`, time ascending.
    pub fn query_range(&self, filter: ReadingFilter) -> ReadingCursor<'_> {
        ReadingCursor::new(self, filter)
    }

    fn overlapping(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Vec<Arc<ChunkHandle>> {
        if from >= to {
            return Vec::new();
        }
        let first = self.chunk_id_for(from);
        let last = self.chunk_id_for(to - TimeDelta::microseconds(1));
        self.lock_chunks()
            .range(first..=last)
            .map(|(_, h)| Arc::clone(h))
            .collect()
    }

    async fn load_chunk(&self, handle: &ChunkHandle, filter: &ReadingFilter) -> Result<Vec<Reading>> {
        // ---
        let state = handle.state.read().await;

        let rows = if *state == ChunkState::Compressed {
            let (payload,): (Vec<u8>,) =
                sqlx::query_as("SELECT payload FROM compressed_chunks WHERE chunk_id = $1")
                    .bind(handle.id)
                    .fetch_one(&self.pool)
                    .await?;
            codec::decode(&payload)?
                .into_iter()
                .filter(|row| filter.matches(row))
                .collect()
        } else {
            sqlx::query_as::<_, StoredRow>(
                r#"
                SELECT time_us, device_id, zone_id, sensor_type, value, unit, quality, metadata
                FROM readings
                WHERE chunk_id = $1
                  AND time_us >= $2 AND time_us < $3
                  AND ($4 IS NULL OR device_id = $4)
                  AND ($5 IS NULL OR zone_id = $5)
                  AND ($6 IS NULL OR sensor_type = $6)
                ORDER BY time_us, seq
                "#,
            )
            .bind(handle.id)
            .bind(micros(filter.from))
            .bind(micros(filter.to))
            .bind(filter.device_id.as_deref())
            .bind(filter.zone_id.as_deref())
            .bind(filter.sensor_type.as_deref())
            .fetch_all(&self.pool)
            .await?
        };
        drop(state);

        rows.into_iter().map(to_reading).collect()
    }

    /// Seal every open chunk whose end boundary is at or before `now`.
    ///
    /// Idempotent; returns the ids that changed state on this call.
    pub async fn seal_chunks_older_than(&self, now: DateTime<Utc>) -> Result<Vec<i64>> {
        // ---
        let candidates: Vec<Arc<ChunkHandle>> = self
            .lock_chunks()
            .values()
            .filter(|h| h.end <= now)
            .cloned()
            .collect();

        let mut sealed = Vec::new();
        for handle in candidates {
            let mut state = handle.state.write().await;
            if *state != ChunkState::Open {
                continue;
            }
            self.persist_state(&handle, ChunkState::Sealed).await?;
            *state = ChunkState::Sealed;
            sealed.push(handle.id);
            info!(chunk_id = handle.id, "Sealed chunk [{}, {})", handle.start, handle.end);
        }
        Ok(sealed)
    }

    async fn persist_state(&self, handle: &ChunkHandle, state: ChunkState) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO chunks (chunk_id, start_us, end_us, state) VALUES ($1, $2, $3, $4)
            ON CONFLICT (chunk_id) DO UPDATE SET state = excluded.state
            "#,
        )
        .bind(handle.id)
        .bind(micros(handle.start))
        .bind(micros(handle.end))
        .bind(state.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Move a sealed chunk to its compressed representation.
    ///
    /// Returns `false` when the chunk was already compressed. On failure the
    /// chunk stays sealed and its rows are untouched.
    pub async fn compress(&self, chunk_id: i64) -> Result<bool> {
        // ---
        let handle = self.handle(chunk_id)?;
        let mut state = handle.state.write().await;

        match *state {
            ChunkState::Compressed => return Ok(false),
            ChunkState::Open => {
                return Err(TelemetryError::CompactionFailed {
                    chunk_id,
                    message: "chunk is still open".to_string(),
                })
            }
            ChunkState::Sealed => {}
        }

        let rows = self
            .compress_sealed(&handle)
            .await
            .map_err(|e| TelemetryError::CompactionFailed {
                chunk_id,
                message: e.to_string(),
            })?;
        *state = ChunkState::Compressed;

        info!(chunk_id, rows, "Compressed chunk");
        Ok(true)
    }

    async fn compress_sealed(&self, handle: &ChunkHandle) -> Result<usize> {
        // ---
        let rows: Vec<StoredRow> = sqlx::query_as(
            r#"
            SELECT time_us, device_id, zone_id, sensor_type, value, unit, quality, metadata
            FROM readings WHERE chunk_id = $1 ORDER BY time_us, seq
            "#,
        )
        .bind(handle.id)
        .fetch_all(&self.pool)
        .await?;

        let payload = codec::encode(&rows)?;
        if codec::decode(&payload)? != rows {
            return Err(TelemetryError::codec("re-read of encoded chunk differs from source rows"));
        }

        // Dropping the transaction before commit rolls everything back
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT OR REPLACE INTO compressed_chunks (chunk_id, row_count, payload, compressed_at_us) VALUES ($1, $2, $3, $4)",
        )
        .bind(handle.id)
        .bind(rows.len() as i64)
        .bind(&payload)
        .bind(micros(Utc::now()))
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM readings WHERE chunk_id = $1")
            .bind(handle.id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE chunks SET state = 'compressed' WHERE chunk_id = $1")
            .bind(handle.id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(rows.len())
    }

    /// Compress every sealed chunk that ended at least `age` before `now`.
    ///
    /// Failures are logged and left for the next pass.
    pub async fn compress_eligible(&self, now: DateTime<Utc>, age: TimeDelta) -> Vec<i64> {
        // ---
        let horizon = now - age;
        let candidates: Vec<Arc<ChunkHandle>> = self
            .lock_chunks()
            .values()
            .filter(|h| h.end <= horizon)
            .cloned()
            .collect();

        let mut compressed = Vec::new();
        for handle in candidates {
            if *handle.state.read().await != ChunkState::Sealed {
                continue;
            }
            match self.compress(handle.id).await {
                Ok(true) => compressed.push(handle.id),
                Ok(false) => {}
                Err(e) => warn!(chunk_id = handle.id, "Compaction failed, will retry: {}", e),
            }
        }
        compressed
    }

    /// Catalogue snapshot, oldest first.
    pub async fn chunks(&self) -> Vec<ChunkInfo> {
        // ---
        let handles: Vec<Arc<ChunkHandle>> = self.lock_chunks().values().cloned().collect();
        let mut out = Vec::with_capacity(handles.len());
        for h in handles {
            out.push(ChunkInfo {
                chunk_id: h.id,
                start: h.start,
                end: h.end,
                state: *h.state.read().await,
            });
        }
        out
    }

    /// Newest reading of each sensor type in `zone_id`, sorted by sensor type.
    ///
    /// Walks chunks newest first, compressed ones included; a sensor type
    /// keeps the reading from the newest chunk that has one.
    pub async fn latest_for_zone(&self, zone_id: &str) -> Result<Vec<Reading>> {
        // ---
        let handles: Vec<Arc<ChunkHandle>> = self.lock_chunks().values().rev().cloned().collect();
        let mut latest: BTreeMap<String, Reading> = BTreeMap::new();

        for handle in handles {
            let filter = ReadingFilter {
                zone_id: Some(zone_id.to_string()),
                ..ReadingFilter::range(handle.start, handle.end)
            };
            let mut newest_here: BTreeMap<String, Reading> = BTreeMap::new();
            for reading in self.load_chunk(&handle, &filter).await? {
                // Ascending order, so the last one of a type wins
                newest_here.insert(reading.sensor_type.clone(), reading);
            }
            for (sensor_type, reading) in newest_here {
                latest.entry(sensor_type).or_insert(reading);
            }
        }
        Ok(latest.into_values().collect())
    }

    /// Newest reading time per (zone_id, sensor_type) among row-stored chunks.
    pub async fn latest_per_key(&self) -> Result<Vec<(String, String, DateTime<Utc>)>> {
        // ---
        let rows: Vec<(String, String, i64)> = sqlx::query_as(
            "SELECT zone_id, sensor_type, MAX(time_us) FROM readings GROUP BY zone_id, sensor_type",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(zone, sensor, us)| Ok((zone, sensor, from_micros(us)?)))
            .collect()
    }
}

fn to_reading(row: StoredRow) -> Result<Reading> {
    // ---
    Ok(Reading {
        time: from_micros(row.time_us)?,
        device_id: row.device_id,
        zone_id: row.zone_id,
        sensor_type: row.sensor_type,
        value: row.value,
        unit: row.unit,
        quality: u8::try_from(row.quality).map_err(TelemetryError::codec)?,
        metadata: serde_json::from_str(&row.metadata).map_err(TelemetryError::codec)?,
    })
}

/// Chunk-at-a-time cursor returned by [`PartitionedStore::query_range`].
///
/// Nothing is read until [`next_batch`](Self::next_batch) is called; the
/// sequence is finite (chunk list fixed at creation) and can be replayed with
/// [`restart`](Self::restart).
pub struct ReadingCursor<'a> {
    store: &'a PartitionedStore,
    filter: ReadingFilter,
    chunks: Vec<Arc<ChunkHandle>>,
    pos: usize,
}

impl<'a> ReadingCursor<'a> {
    fn new(store: &'a PartitionedStore, filter: ReadingFilter) -> Self {
        let chunks = store.overlapping(filter.from, filter.to);
        Self {
            store,
            filter,
            chunks,
            pos: 0,
        }
    }

    /// Next non-empty chunk worth of readings, or `None` when exhausted.
    pub async fn next_batch(&mut self) -> Result<Option<Vec<Reading>>> {
        // ---
        while let Some(handle) = self.chunks.get(self.pos).cloned() {
            self.pos += 1;
            let batch = self.store.load_chunk(&handle, &self.filter).await?;
            if !batch.is_empty() {
                return Ok(Some(batch));
            }
        }
        Ok(None)
    }

    /// Rewind to the start, picking up chunks created since the last pass.
    pub fn restart(&mut self) {
        self.chunks = self.store.overlapping(self.filter.from, self.filter.to);
        self.pos = 0;
    }

    /// Drain the rest of the sequence into memory, up to `limit` readings.
    pub async fn collect(mut self, limit: Option<usize>) -> Result<Vec<Reading>> {
        // ---
        let limit = limit.unwrap_or(usize::MAX);
        let mut out = Vec::new();
        while out.len() < limit {
            match self.next_batch().await? {
                Some(batch) => out.extend(batch),
                None => break,
            }
        }
        out.truncate(limit);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::schema::open_memory_pool;
    use chrono::TimeZone;
    use serde_json::json;

    fn day0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap()
    }

    fn create_test_reading(time: DateTime<Utc>, sensor: &str, value: f64) -> Reading {
        // ---
        Reading {
            time,
            device_id: "esp32-growroom-01".to_string(),
            zone_id: "zone-main".to_string(),
            sensor_type: sensor.to_string(),
            value,
            unit: "u".to_string(),
            quality: 100,
            metadata: json!({"fw": "1.0.0"}),
        }
    }

    async fn create_test_store() -> PartitionedStore {
        let pool = open_memory_pool().await.unwrap();
        PartitionedStore::open(pool, TimeDelta::days(1)).await.unwrap()
    }

    #[tokio::test]
    async fn test_append_is_immediately_visible_in_time_order() {
        // ---
        let store = create_test_store().await;
        let t = day0() + TimeDelta::hours(5);

        store.append(&create_test_reading(t + TimeDelta::minutes(2), "temperature", 25.0)).await.unwrap();
        store.append(&create_test_reading(t, "temperature", 24.0)).await.unwrap();
        store.append(&create_test_reading(t + TimeDelta::days(1), "temperature", 26.0)).await.unwrap();

        let all = store
            .query_range(ReadingFilter::range(day0(), day0() + TimeDelta::days(3)))
            .collect(None)
            .await
            .unwrap();

        let values: Vec<f64> = all.iter().map(|r| r.value).collect();
        assert_eq!(values, vec![24.0, 25.0, 26.0]);
        assert_eq!(all[0].metadata, json!({"fw": "1.0.0"}));
        assert_eq!(store.chunks().await.len(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_timestamps_are_retained() {
        // ---
        let store = create_test_store().await;
        let t = day0() + TimeDelta::hours(1);

        store.append(&create_test_reading(t, "co2", 800.0)).await.unwrap();
        store.append(&create_test_reading(t, "co2", 810.0)).await.unwrap();

        let all = store
            .query_range(ReadingFilter::range(day0(), day0() + TimeDelta::days(1)))
            .collect(None)
            .await
            .unwrap();
        assert_eq!(all.iter().map(|r| r.value).collect::<Vec<_>>(), vec![800.0, 810.0]);
    }

    #[tokio::test]
    async fn test_filters_and_half_open_range() {
        // ---
        let store = create_test_store().await;
        let t = day0() + TimeDelta::hours(2);

        store.append(&create_test_reading(t, "temperature", 24.0)).await.unwrap();
        store.append(&create_test_reading(t, "humidity", 60.0)).await.unwrap();
        store.append(&create_test_reading(t + TimeDelta::hours(1), "humidity", 61.0)).await.unwrap();

        let filter = ReadingFilter {
            sensor_type: Some("humidity".to_string()),
            ..ReadingFilter::range(t, t + TimeDelta::hours(1))
        };
        let hits = store.query_range(filter).collect(None).await.unwrap();

        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].value, 60.0);
    }

    #[tokio::test]
    async fn test_cursor_is_lazy_and_restartable() {
        // ---
        let store = create_test_store().await;
        for d in 0..3 {
            store
                .append(&create_test_reading(day0() + TimeDelta::days(d), "ph", 6.0 + d as f64 / 10.0))
                .await
                .unwrap();
        }

        let mut cursor = store.query_range(ReadingFilter::range(day0(), day0() + TimeDelta::days(3)));
        let mut first_pass = Vec::new();
        while let Some(batch) = cursor.next_batch().await.unwrap() {
            assert_eq!(batch.len(), 1, "one chunk per batch");
            first_pass.extend(batch);
        }
        assert!(cursor.next_batch().await.unwrap().is_none());

        cursor.restart();
        let second_pass = cursor.collect(None).await.unwrap();
        assert_eq!(first_pass, second_pass);
    }

    #[tokio::test]
    async fn test_seal_is_idempotent_and_sealed_chunks_accept_writes() {
        // ---
        let store = create_test_store().await;
        store.append(&create_test_reading(day0(), "ec", 1.2)).await.unwrap();

        let now = day0() + TimeDelta::days(2);
        assert_eq!(store.seal_chunks_older_than(now).await.unwrap(), vec![store.chunk_id_for(day0())]);
        assert!(store.seal_chunks_older_than(now).await.unwrap().is_empty());

        // Late but not yet compressed
        store.append(&create_test_reading(day0() + TimeDelta::hours(3), "ec", 1.3)).await.unwrap();
        assert_eq!(store.chunks().await[0].state, ChunkState::Sealed);
    }

    #[tokio::test]
    async fn test_compression_is_transparent_to_queries() {
        // ---
        let store = create_test_store().await;
        for i in 0..50 {
            let sensor = if i % 2 == 0 { "temperature" } else { "humidity" };
            store
                .append(&create_test_reading(day0() + TimeDelta::minutes(i * 7), sensor, 20.0 + i as f64 * 0.3))
                .await
                .unwrap();
        }
        let filter = ReadingFilter {
            zone_id: Some("zone-main".to_string()),
            ..ReadingFilter::range(day0() + TimeDelta::hours(1), day0() + TimeDelta::hours(4))
        };
        let before = store.query_range(filter.clone()).collect(None).await.unwrap();

        let chunk_id = store.chunk_id_for(day0());
        assert!(store.compress(chunk_id).await.is_err(), "open chunk must not compress");

        store.seal_chunks_older_than(day0() + TimeDelta::days(1)).await.unwrap();
        assert!(store.compress(chunk_id).await.unwrap());
        assert!(!store.compress(chunk_id).await.unwrap());

        let after = store.query_range(filter).collect(None).await.unwrap();
        assert_eq!(before, after);
        assert!(!before.is_empty());
    }

    #[tokio::test]
    async fn test_append_to_compressed_chunk_is_rejected() {
        // ---
        let store = create_test_store().await;
        store.append(&create_test_reading(day0(), "temperature", 22.0)).await.unwrap();

        let now = day0() + TimeDelta::days(10);
        store.seal_chunks_older_than(now).await.unwrap();
        let compressed = store.compress_eligible(now, TimeDelta::days(7)).await;
        assert_eq!(compressed.len(), 1);

        let late = create_test_reading(day0() + TimeDelta::hours(1), "temperature", 23.0);
        assert!(matches!(
            store.append(&late).await,
            Err(TelemetryError::OutOfOrderRejected { .. })
        ));

        let all = store
            .query_range(ReadingFilter::range(day0(), now))
            .collect(None)
            .await
            .unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn test_latest_for_zone_spans_compressed_chunks() {
        // ---
        let store = create_test_store().await;
        store.append(&create_test_reading(day0() + TimeDelta::hours(1), "ph", 6.0)).await.unwrap();
        store.append(&create_test_reading(day0() + TimeDelta::hours(2), "ph", 6.1)).await.unwrap();
        store.append(&create_test_reading(day0() + TimeDelta::hours(3), "temperature", 21.0)).await.unwrap();
        store.seal_chunks_older_than(day0() + TimeDelta::days(1)).await.unwrap();
        store.compress(store.chunk_id_for(day0())).await.unwrap();

        let next_day = day0() + TimeDelta::days(1);
        store.append(&create_test_reading(next_day + TimeDelta::hours(4), "temperature", 23.5)).await.unwrap();
        store.append(&create_test_reading(next_day + TimeDelta::hours(1), "temperature", 22.0)).await.unwrap();
        let mut elsewhere = create_test_reading(next_day + TimeDelta::hours(5), "ph", 5.0);
        elsewhere.zone_id = "tent-2".to_string();
        store.append(&elsewhere).await.unwrap();

        let latest = store.latest_for_zone("zone-main").await.unwrap();
        let got: Vec<(&str, f64)> = latest.iter().map(|r| (r.sensor_type.as_str(), r.value)).collect();
        assert_eq!(got, vec![("ph", 6.1), ("temperature", 23.5)]);
        assert!(store.latest_for_zone("tent-9").await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_appends_racing_transitions_are_never_lost() {
        // ---
        let store = Arc::new(create_test_store().await);
        store.append(&create_test_reading(day0(), "co2", 0.0)).await.unwrap();
        let chunk_id = store.chunk_id_for(day0());

        let mut appends = Vec::new();
        for i in 1..=40 {
            let store = Arc::clone(&store);
            appends.push(tokio::spawn(async move {
                let reading = create_test_reading(day0() + TimeDelta::minutes(i), "co2", i as f64);
                (i as f64, store.append(&reading).await)
            }));
        }
        let transitions = {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                store.seal_chunks_older_than(day0() + TimeDelta::days(2)).await?;
                store.compress(chunk_id).await
            })
        };

        let mut landed = vec![0.0];
        for task in appends {
            match task.await.unwrap() {
                (value, Ok(())) => landed.push(value),
                (_, Err(TelemetryError::OutOfOrderRejected { .. })) => {}
                (_, Err(e)) => panic!("unexpected append error {e}"),
            }
        }
        assert!(transitions.await.unwrap().unwrap());

        let stored: Vec<f64> = store
            .query_range(ReadingFilter::range(day0(), day0() + TimeDelta::days(1)))
            .collect(None)
            .await
            .unwrap()
            .iter()
            .map(|r| r.value)
            .collect();
        landed.sort_by(f64::total_cmp);
        assert_eq!(stored, landed, "every accepted append survives compression");
        assert_eq!(store.chunks().await[0].state, ChunkState::Compressed);
    }

    #[tokio::test]
    async fn test_failed_compression_leaves_chunk_sealed() {
        // ---
        let pool = open_memory_pool().await.unwrap();
        let store = PartitionedStore::open(pool.clone(), TimeDelta::days(1)).await.unwrap();
        for i in 0..5 {
            store
                .append(&create_test_reading(day0() + TimeDelta::hours(i), "ec", 1.0 + i as f64 / 10.0))
                .await
                .unwrap();
        }
        store.seal_chunks_older_than(day0() + TimeDelta::days(1)).await.unwrap();
        let everything = ReadingFilter::range(day0(), day0() + TimeDelta::days(1));
        let before = store.query_range(everything.clone()).collect(None).await.unwrap();

        sqlx::query("DROP TABLE compressed_chunks").execute(&pool).await.unwrap();
        let chunk_id = store.chunk_id_for(day0());
        assert!(matches!(
            store.compress(chunk_id).await,
            Err(TelemetryError::CompactionFailed { .. })
        ));

        assert_eq!(store.chunks().await[0].state, ChunkState::Sealed);
        let (state,): (String,) = sqlx::query_as("SELECT state FROM chunks WHERE chunk_id = $1")
            .bind(chunk_id)
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(state, "sealed");
        assert_eq!(store.query_range(everything).collect(None).await.unwrap(), before);

        // Still writable while sealed
        store.append(&create_test_reading(day0() + TimeDelta::hours(9), "ec", 2.0)).await.unwrap();
    }

    #[tokio::test]
    async fn test_catalogue_survives_reopen() {
        // ---
        let pool = open_memory_pool().await.unwrap();
        let store = PartitionedStore::open(pool.clone(), TimeDelta::days(1)).await.unwrap();
        store.append(&create_test_reading(day0(), "temperature", 22.0)).await.unwrap();
        store.seal_chunks_older_than(day0() + TimeDelta::days(9)).await.unwrap();
        store.compress(store.chunk_id_for(day0())).await.unwrap();
        drop(store);

        let reopened = PartitionedStore::open(pool, TimeDelta::days(1)).await.unwrap();
        let chunks = reopened.chunks().await;
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].state, ChunkState::Compressed);

        let all = reopened
            .query_range(ReadingFilter::range(day0(), day0() + TimeDelta::days(1)))
            .collect(Some(10))
            .await
            .unwrap();
        assert_eq!(all[0].value, 22.0);
    }
}
