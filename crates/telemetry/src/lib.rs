//! Telemetry for the ingestion worker: structured logging setup, in-process
//! counters, and connection health of the broker and the database.

pub mod health;
pub mod metrics;
pub mod tracing_setup;

pub use health::*;
pub use metrics::*;
pub use tracing_setup::*;
