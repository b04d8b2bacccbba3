//! API responses.

use engine_core::ConnectionState;
use serde::{Deserialize, Serialize};
use telemetry::MetricsSnapshot;

/// Health check response.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub queue: String,
    pub table: String,
    pub uptime_secs: i64,
    pub broker: ComponentStatus,
    pub database: ComponentStatus,
    pub metrics: MetricsSnapshot,
}

/// Connection state of one dependency.
#[derive(Debug, Serialize, Deserialize)]
pub struct ComponentStatus {
    pub state: ConnectionState,
    pub connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}
