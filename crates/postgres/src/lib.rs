//! Idempotent PostgreSQL persistence for the ingestion worker.

pub mod client;
pub mod config;
pub mod health;
pub mod persist;
pub mod schema;

pub use client::*;
pub use config::*;
pub use persist::*;
