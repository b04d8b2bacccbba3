//! RabbitMQ consumption, dead-letter routing, and replay for the ingestion
//! worker.

pub mod config;
pub mod consumer;
pub mod dead_letter;
pub mod headers;
pub mod health;
pub mod replay;
pub mod topology;

pub use config::*;
pub use consumer::*;
pub use dead_letter::*;
pub use replay::*;
