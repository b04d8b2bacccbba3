//! Application state shared across handlers.

use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Static facts about the running worker.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<StateInner>,
}

struct StateInner {
    service: String,
    queue: String,
    table: String,
    started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(service: impl Into<String>, queue: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(StateInner {
                service: service.into(),
                queue: queue.into(),
                table: table.into(),
                started_at: Utc::now(),
            }),
        }
    }

    pub fn service(&self) -> &str {
        &self.inner.service
    }

    /// Queue the worker consumes from.
    pub fn queue(&self) -> &str {
        &self.inner.queue
    }

    /// Table records are written to.
    pub fn table(&self) -> &str {
        &self.inner.table
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.inner.started_at
    }

    pub fn uptime_secs(&self) -> i64 {
        (Utc::now() - self.inner.started_at).num_seconds().max(0)
    }
}
