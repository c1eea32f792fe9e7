//! Grow-room telemetry core.
//!
//! Ingests environmental sensor readings per zone, stores them in
//! time-partitioned chunks that compress once cold, keeps hourly and daily
//! rollups fresh, and raises debounced alerts when a reading leaves the
//! target window of the zone's current growth phase.
//!
//! Modules follow the Explicit Module Boundary Pattern: each exposes a small
//! surface and [`Telemetry`] ties them together for the HTTP layer.

pub mod alert;
pub mod derivation;
pub mod error;
pub mod events;
pub mod models;
pub mod phase;
pub mod rollup;
pub mod routes;
pub mod scheduler;
pub mod schema;
pub mod store;
pub mod telemetry;

pub use error::{Result, TelemetryError};
pub use models::{Alert, DevicePayload, RawReading, Reading, Severity};
pub use telemetry::{IngestOutcome, Telemetry, TelemetrySettings};
