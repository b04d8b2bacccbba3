//! In-process metrics collection.
//!
//! Counters are logged periodically by the worker scheduler and exposed on
//! the health endpoint.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// A counter metric.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_by(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Histogram for latency tracking.
#[derive(Debug)]
pub struct Histogram {
    /// Buckets: 1ms, 5ms, 10ms, 25ms, 50ms, 100ms, 250ms, 500ms, 1s, 5s, 10s
    buckets: [AtomicU64; 11],
    sum: AtomicU64,
    count: AtomicU64,
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new()
    }
}

impl Histogram {
    const BUCKET_BOUNDS: [u64; 11] = [1, 5, 10, 25, 50, 100, 250, 500, 1000, 5000, 10000];

    pub fn new() -> Self {
        Self {
            buckets: Default::default(),
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    /// Records a value in milliseconds.
    pub fn observe(&self, ms: u64) {
        self.sum.fetch_add(ms, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);

        let idx = Self::BUCKET_BOUNDS
            .iter()
            .position(|&bound| ms <= bound)
            .unwrap_or(Self::BUCKET_BOUNDS.len() - 1);
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn sum(&self) -> u64 {
        self.sum.load(Ordering::Relaxed)
    }

    pub fn mean(&self) -> f64 {
        let count = self.count();
        if count == 0 {
            0.0
        } else {
            self.sum() as f64 / count as f64
        }
    }

    /// Returns bucket counts.
    pub fn buckets(&self) -> Vec<(u64, u64)> {
        Self::BUCKET_BOUNDS
            .iter()
            .zip(self.buckets.iter())
            .map(|(&bound, count)| (bound, count.load(Ordering::Relaxed)))
            .collect()
    }
}

/// Collected metrics for the ingestion worker.
#[derive(Debug, Default)]
pub struct Metrics {
    // Consumption
    pub messages_received: Counter,
    pub messages_redelivered: Counter,
    pub messages_acked: Counter,
    pub messages_requeued: Counter,

    // Outcomes
    pub records_committed: Counter,
    pub duplicates_skipped: Counter,
    pub decode_failures: Counter,
    pub persist_rejections: Counter,
    pub persist_unavailable: Counter,

    // Dead-lettering
    pub dead_lettered: Counter,
    pub dead_letter_failures: Counter,
    pub dead_letters_replayed: Counter,

    // Connectivity
    pub broker_connect_attempts: Counter,
    pub broker_connect_failures: Counter,

    // Latency
    pub persist_latency_ms: Histogram,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes a snapshot of current metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            timestamp: Utc::now(),
            messages_received: self.messages_received.get(),
            messages_redelivered: self.messages_redelivered.get(),
            messages_acked: self.messages_acked.get(),
            messages_requeued: self.messages_requeued.get(),
            records_committed: self.records_committed.get(),
            duplicates_skipped: self.duplicates_skipped.get(),
            decode_failures: self.decode_failures.get(),
            persist_rejections: self.persist_rejections.get(),
            persist_unavailable: self.persist_unavailable.get(),
            dead_lettered: self.dead_lettered.get(),
            dead_letter_failures: self.dead_letter_failures.get(),
            dead_letters_replayed: self.dead_letters_replayed.get(),
            broker_connect_attempts: self.broker_connect_attempts.get(),
            broker_connect_failures: self.broker_connect_failures.get(),
            persist_latency_mean_ms: self.persist_latency_ms.mean(),
        }
    }
}

/// A snapshot of metrics at a point in time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub timestamp: DateTime<Utc>,
    pub messages_received: u64,
    pub messages_redelivered: u64,
    pub messages_acked: u64,
    pub messages_requeued: u64,
    pub records_committed: u64,
    pub duplicates_skipped: u64,
    pub decode_failures: u64,
    pub persist_rejections: u64,
    pub persist_unavailable: u64,
    pub dead_lettered: u64,
    pub dead_letter_failures: u64,
    pub dead_letters_replayed: u64,
    pub broker_connect_attempts: u64,
    pub broker_connect_failures: u64,
    pub persist_latency_mean_ms: f64,
}

/// Global metrics registry.
pub static METRICS: std::sync::LazyLock<Metrics> = std::sync::LazyLock::new(Metrics::new);

/// Get the global metrics instance.
pub fn metrics() -> &'static Metrics {
    &METRICS
}
