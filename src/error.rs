//! Error taxonomy for the telemetry core.
//!
//! None of these are process-fatal. Callers decide per variant whether to
//! surface, retry on the next tick, or log and move on.

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, TelemetryError>;

/// Errors raised by the store, rollup engine, phase registry and alert engine.
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// Malformed input, rejected before storage.
    #[error("invalid reading: {reason}")]
    InvalidReading {
        /// What was wrong with the reading.
        reason: String,
    },

    /// Target window that no reading could satisfy consistently.
    #[error("invalid target: {reason}")]
    InvalidTarget {
        /// Which target was wrong and how.
        reason: String,
    },

    /// Late data whose chunk has already been compressed.
    #[error("reading at {time} targets compressed chunk {chunk_id}")]
    OutOfOrderRejected {
        /// Chunk the reading would have landed in.
        chunk_id: i64,
        /// Timestamp of the rejected reading.
        time: DateTime<Utc>,
    },

    /// Zone has never had a phase assigned.
    #[error("zone {zone_id} has no active phase")]
    NoActivePhase {
        /// Zone that was looked up.
        zone_id: String,
    },

    /// Phase transition that would break the zone's window history.
    #[error("invalid phase transition for zone {zone_id}: {reason}")]
    InvalidTransition {
        /// Zone being transitioned.
        zone_id: String,
        /// Why the transition was refused.
        reason: String,
    },

    /// Transient rollup failure; retried on the next scheduled tick.
    #[error("rollup recompute failed for {granularity} bucket at {bucket_start}: {message}")]
    RollupRecomputeFailed {
        /// Granularity label (`hour`, `day`).
        granularity: String,
        /// Start of the bucket that failed.
        bucket_start: DateTime<Utc>,
        /// Underlying cause.
        message: String,
    },

    /// Chunk stays SEALED; retried later.
    #[error("compaction of chunk {chunk_id} failed: {message}")]
    CompactionFailed {
        /// Chunk that failed to compress.
        chunk_id: i64,
        /// Underlying cause.
        message: String,
    },

    /// Resource not found.
    #[error("not found: {message}")]
    NotFound {
        /// Description of what was not found.
        message: String,
    },

    /// Compressed chunk payload could not be encoded or decoded.
    #[error("chunk codec error: {message}")]
    Codec {
        /// Description of the codec failure.
        message: String,
    },

    /// Storage substrate failure.
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),
}

impl TelemetryError {
    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidReading {
            reason: reason.into(),
        }
    }

    pub(crate) fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    pub(crate) fn codec(message: impl std::fmt::Display) -> Self {
        Self::Codec {
            message: message.to_string(),
        }
    }
}
