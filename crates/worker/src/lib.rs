//! Consumer loop and background tasks for the ingestion worker.
//!
//! - Consumer (RabbitMQ → PostgreSQL pipeline, with dead-lettering)
//! - Metrics log (periodic counter snapshot)

pub mod backoff;
pub mod consumer;
pub mod scheduler;

pub use backoff::pause;
pub use consumer::*;
pub use scheduler::*;
