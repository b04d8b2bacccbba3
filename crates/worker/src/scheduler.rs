//! Worker scheduler for the consumer loop and background tasks.

use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use broker::MessageBroker;
use engine_core::Result;
use telemetry::{health, metrics};

use crate::consumer::ConsumerLoop;

/// Worker scheduler configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Metrics log interval
    pub metrics_log_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            metrics_log_interval: Duration::from_secs(60),
        }
    }
}

/// Handles of the spawned tasks.
pub struct WorkerHandles {
    /// The consumer loop. A join error means it panicked.
    pub consumer: JoinHandle<Result<()>>,
    pub background: Vec<JoinHandle<()>>,
}

/// Spawns the consumer loop next to its background tasks.
pub struct WorkerScheduler {
    config: WorkerConfig,
}

impl WorkerScheduler {
    pub fn new(config: WorkerConfig) -> Self {
        Self { config }
    }

    /// Starts all workers. Every task stops when `shutdown` fires.
    pub fn start<B>(&self, mut consumer: ConsumerLoop<B>, shutdown: CancellationToken) -> WorkerHandles
    where
        B: MessageBroker + 'static,
    {
        let token = shutdown.clone();
        let consumer = tokio::spawn(async move {
            let result = consumer.run(token).await;
            if let Err(ref e) = result {
                error!("Consumer loop fatal error: {}", e);
            }
            result
        });
        info!("Consumer worker started");

        let period = self.config.metrics_log_interval;
        let metrics_task = tokio::spawn(async move {
            run_metrics_log(period, shutdown).await;
        });

        info!("Background workers started");
        WorkerHandles {
            consumer,
            background: vec![metrics_task],
        }
    }
}

async fn run_metrics_log(period: Duration, shutdown: CancellationToken) {
    let mut ticker = interval(period);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => log_metrics(),
        }
    }
}

/// Logs a snapshot of the pipeline counters.
pub fn log_metrics() {
    let snapshot = metrics().snapshot();
    let report = health().report();
    info!(
        status = report.status.as_str(),
        received = snapshot.messages_received,
        acked = snapshot.messages_acked,
        committed = snapshot.records_committed,
        duplicates = snapshot.duplicates_skipped,
        decode_failures = snapshot.decode_failures,
        rejections = snapshot.persist_rejections,
        requeued = snapshot.messages_requeued,
        dead_lettered = snapshot.dead_lettered,
        dead_letter_failures = snapshot.dead_letter_failures,
        broker_reconnects = snapshot.broker_connect_attempts,
        persist_latency_mean_ms = snapshot.persist_latency_mean_ms,
        "Pipeline metrics"
    );
}
