//! Unified error types for the ingestion worker.
//!
//! Failure categories map onto how the consumer loop reacts:
//! - Broker / Database: transient connectivity, retried with backoff
//! - Decode: message format error, dead-lettered
//! - Config / Schema: startup errors, fatal

use thiserror::Error;

use crate::decode::DecodeError;

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for the ingestion worker.
#[derive(Debug, Error)]
pub enum Error {
    /// Broker connection, channel, or publish failure.
    #[error("broker error: {0}")]
    Broker(String),

    /// Database connectivity failure.
    #[error("database error: {0}")]
    Database(String),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("config error: {0}")]
    Config(String),

    #[error("schema error: {0}")]
    Schema(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn broker(msg: impl Into<String>) -> Self {
        Self::Broker(msg.into())
    }

    pub fn database(msg: impl Into<String>) -> Self {
        Self::Database(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn schema(msg: impl Into<String>) -> Self {
        Self::Schema(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether retrying the same operation later can succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Broker(_) | Self::Database(_))
    }
}
