//! Storage schema management for `growtelemetry`.
//!
//! Ensures required tables and indexes exist before the core opens.
//! Applied once on startup from `main.rs` (EMBP: single gateway call).
//!
//! All timestamps are stored as integer microseconds since the Unix epoch so
//! that ordering and range predicates stay purely numeric.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

use crate::error::{Result, TelemetryError};

// ---

/// Open a pool against `url`, creating the database file when missing.
pub async fn connect(url: &str, max_connections: u32) -> Result<SqlitePool> {
    // ---
    let mut options = SqliteConnectOptions::from_str(url)?
        .create_if_missing(true)
        .busy_timeout(Duration::from_secs(5));
    if !url.contains(":memory:") {
        options = options.journal_mode(SqliteJournalMode::Wal);
    }

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await?;
    Ok(pool)
}

/// Open a private in-memory database with the schema applied.
///
/// Uses a single connection that never expires, since every connection to
/// `:memory:` would otherwise see its own empty database.
pub async fn open_memory_pool() -> Result<SqlitePool> {
    // ---
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await?;
    create_schema(&pool).await?;
    Ok(pool)
}

/// Create or update the storage schema (idempotent).
///
/// Safe to call on every startup; no-op if objects already exist.
/// Errors are propagated if any SQL execution fails.
pub async fn create_schema(pool: &SqlitePool) -> Result<()> {
    // ---
    let mut tx = pool.begin().await?;

    // Chunk catalogue; one row per time-aligned partition
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            chunk_id   INTEGER PRIMARY KEY,
            start_us   INTEGER NOT NULL,
            end_us     INTEGER NOT NULL,
            state      TEXT    NOT NULL
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    // Row-oriented storage for OPEN and SEALED chunks
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS readings (
            seq          INTEGER PRIMARY KEY AUTOINCREMENT,
            chunk_id     INTEGER NOT NULL,
            time_us      INTEGER NOT NULL,
            device_id    TEXT    NOT NULL,
            zone_id      TEXT    NOT NULL,
            sensor_type  TEXT    NOT NULL,
            value        REAL    NOT NULL,
            unit         TEXT    NOT NULL,
            quality      INTEGER NOT NULL,
            metadata     TEXT    NOT NULL
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    // Columnar, deflated payloads for COMPRESSED chunks
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS compressed_chunks (
            chunk_id          INTEGER PRIMARY KEY,
            row_count         INTEGER NOT NULL,
            payload           BLOB    NOT NULL,
            compressed_at_us  INTEGER NOT NULL
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS rollup_buckets (
            granularity      TEXT    NOT NULL,
            bucket_start_us  INTEGER NOT NULL,
            device_id        TEXT    NOT NULL,
            zone_id          TEXT    NOT NULL,
            sensor_type      TEXT    NOT NULL,
            avg              REAL    NOT NULL,
            min              REAL    NOT NULL,
            max              REAL    NOT NULL,
            count            INTEGER NOT NULL,
            PRIMARY KEY (granularity, bucket_start_us, device_id, zone_id, sensor_type)
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS phase_windows (
            id             INTEGER PRIMARY KEY AUTOINCREMENT,
            zone_id        TEXT    NOT NULL,
            phase          TEXT    NOT NULL,
            target_ranges  TEXT    NOT NULL,
            started_at_us  INTEGER NOT NULL,
            ended_at_us    INTEGER
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS alerts (
            id               TEXT    PRIMARY KEY,
            zone_id          TEXT    NOT NULL,
            device_id        TEXT,
            alert_type       TEXT    NOT NULL,
            severity         TEXT    NOT NULL,
            message          TEXT    NOT NULL,
            sensor_type      TEXT,
            value            REAL,
            threshold_min    REAL,
            threshold_max    REAL,
            acknowledged     INTEGER NOT NULL DEFAULT 0,
            acknowledged_at_us INTEGER,
            acknowledged_by  TEXT,
            resolved         INTEGER NOT NULL DEFAULT 0,
            resolved_at_us   INTEGER,
            created_at_us    INTEGER NOT NULL
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    // Indexes for range scans and the single-active-window guarantee
    for ddl in [
        "CREATE INDEX IF NOT EXISTS idx_readings_chunk_time ON readings (chunk_id, time_us, seq);",
        "CREATE INDEX IF NOT EXISTS idx_readings_zone_type_time ON readings (zone_id, sensor_type, time_us);",
        "CREATE INDEX IF NOT EXISTS idx_rollup_lookup ON rollup_buckets (granularity, zone_id, sensor_type, bucket_start_us);",
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_phase_windows_active ON phase_windows (zone_id) WHERE ended_at_us IS NULL;",
        "CREATE INDEX IF NOT EXISTS idx_alerts_zone_unresolved ON alerts (zone_id, created_at_us) WHERE resolved = 0;",
    ] {
        sqlx::query(ddl).execute(&mut *tx).await?;
    }

    tx.commit().await?;
    Ok(())
}

pub(crate) fn micros(t: DateTime<Utc>) -> i64 {
    t.timestamp_micros()
}

pub(crate) fn from_micros(us: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_micros(us)
        .ok_or_else(|| TelemetryError::codec(format!("timestamp {us}us out of range")))
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[tokio::test]
    async fn test_create_schema_is_idempotent() {
        // ---
        let pool = open_memory_pool().await.unwrap();
        create_schema(&pool).await.unwrap();

        let tables: Vec<(String,)> =
            sqlx::query_as("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
                .fetch_all(&pool)
                .await
                .unwrap();
        let names: Vec<&str> = tables.iter().map(|(n,)| n.as_str()).collect();

        for expected in [
            "alerts",
            "chunks",
            "compressed_chunks",
            "phase_windows",
            "readings",
            "rollup_buckets",
        ] {
            assert!(names.contains(&expected), "missing table {expected}");
        }
    }

    #[test]
    fn test_micros_round_trip_keeps_precision() {
        // ---
        let t = DateTime::from_timestamp_micros(1_735_732_800_123_456).unwrap();
        assert_eq!(from_micros(micros(t)).unwrap(), t);
    }
}
