//! Connection health of the broker and the database.

use engine_core::ConnectionState;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU8, Ordering};

/// Health status for the whole process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
        }
    }
}

/// Connection state of one external dependency.
#[derive(Debug)]
pub struct ComponentHealth {
    name: &'static str,
    state: AtomicU8,
    message: parking_lot::RwLock<Option<String>>,
}

impl ComponentHealth {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            state: AtomicU8::new(0),
            message: parking_lot::RwLock::new(None),
        }
    }

    pub fn set_connecting(&self) {
        self.state
            .store(ConnectionState::Connecting.as_u8(), Ordering::Relaxed);
    }

    pub fn set_connected(&self) {
        self.state
            .store(ConnectionState::Connected.as_u8(), Ordering::Relaxed);
        *self.message.write() = None;
    }

    pub fn set_disconnected(&self, msg: impl Into<String>) {
        self.state
            .store(ConnectionState::Disconnected.as_u8(), Ordering::Relaxed);
        *self.message.write() = Some(msg.into());
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Relaxed))
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Last failure message, cleared on reconnect.
    pub fn message(&self) -> Option<String> {
        self.message.read().clone()
    }

    fn report(&self) -> ComponentHealthReport {
        ComponentHealthReport {
            name: self.name.to_string(),
            state: self.state(),
            message: self.message(),
        }
    }
}

/// Aggregated health status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub components: Vec<ComponentHealthReport>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealthReport {
    pub name: String,
    pub state: ConnectionState,
    pub message: Option<String>,
}

/// Process-wide view of dependency connection state.
///
/// The broker and store implementations write to it; the HTTP front end
/// reads it. It is observational only and never drives control flow.
pub struct HealthRegistry {
    pub broker: ComponentHealth,
    pub database: ComponentHealth,
}

impl HealthRegistry {
    pub const fn new() -> Self {
        Self {
            broker: ComponentHealth::new("broker"),
            database: ComponentHealth::new("database"),
        }
    }

    /// Generate a health report.
    pub fn report(&self) -> HealthReport {
        let components = vec![self.broker.report(), self.database.report()];

        let connected = components.iter().filter(|c| c.state.is_connected()).count();
        let status = if connected == components.len() {
            HealthStatus::Healthy
        } else if connected > 0 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Unhealthy
        };

        HealthReport { status, components }
    }

    /// Whether the worker is currently able to consume.
    pub fn is_ready(&self) -> bool {
        self.broker.is_connected()
    }

    /// The process is alive as long as it can answer.
    pub fn is_alive(&self) -> bool {
        true
    }
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Global health registry.
pub static HEALTH: std::sync::LazyLock<HealthRegistry> =
    std::sync::LazyLock::new(HealthRegistry::new);

/// Get the global health registry.
pub fn health() -> &'static HealthRegistry {
    &HEALTH
}
