//! Consumer loop moving messages from RabbitMQ into PostgreSQL.
//!
//! Per delivery:
//! 1. Decode the payload against the table schema
//! 2. Persist the record idempotently
//! 3. Ack, or dead-letter then ack, or requeue when the database is down
//!
//! A message is acked only after its outcome is final, so a crash at any
//! point leaves it on the queue (at-least-once). Redeliveries of committed
//! records hit the natural-key conflict and are skipped.

use broker::{DeadLetterRouter, MessageBroker};
use engine_core::{InboundMessage, MessageDecoder, PersistenceOutcome, Result, RouteOutcome};
use postgres_store::RecordStore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use telemetry::metrics;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backoff::pause;

/// Consumer loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// Pause between broker reconnects and database probes
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    /// How long `main` waits for the loop to stop after a shutdown signal
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

fn default_backoff_ms() -> u64 {
    5_000
}

fn default_shutdown_grace_secs() -> u64 {
    10
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            backoff_ms: default_backoff_ms(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

impl ConsumerConfig {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

/// Where the loop is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    ConnectingBroker,
    Consuming,
}

/// What happened to one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Persisted (or already present) and acked
    Acked,
    /// Failed permanently, sent to the dead-letter exchange, and acked
    DeadLettered(RouteOutcome),
    /// Database unavailable; returned to the queue
    Requeued,
}

/// Sequential consumer over one broker session and a shared store.
pub struct ConsumerLoop<B: MessageBroker> {
    broker: B,
    store: Arc<dyn RecordStore>,
    decoder: MessageDecoder,
    router: DeadLetterRouter,
    config: ConsumerConfig,
    state: LoopState,
}

impl<B: MessageBroker> ConsumerLoop<B> {
    pub fn new(
        broker: B,
        store: Arc<dyn RecordStore>,
        decoder: MessageDecoder,
        router: DeadLetterRouter,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            broker,
            store,
            decoder,
            router,
            config,
            state: LoopState::Idle,
        }
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn broker(&self) -> &B {
        &self.broker
    }

    /// Runs until `shutdown` fires.
    ///
    /// Broker failures never end the loop; it reconnects after a pause for
    /// as long as it takes.
    pub async fn run(&mut self, shutdown: CancellationToken) -> Result<()> {
        info!(
            table = %self.decoder.schema().table,
            backoff_ms = self.config.backoff_ms,
            "Consumer loop starting"
        );

        while !shutdown.is_cancelled() {
            match self.state {
                LoopState::Idle | LoopState::ConnectingBroker => {
                    self.state = LoopState::ConnectingBroker;
                    match self.establish().await {
                        Ok(()) => self.state = LoopState::Consuming,
                        Err(e) => {
                            warn!(
                                error = %e,
                                retry_in_ms = self.config.backoff_ms,
                                "Broker unavailable; retrying"
                            );
                            self.broker.close().await;
                            if !pause(self.config.backoff(), &shutdown).await {
                                break;
                            }
                        }
                    }
                }
                LoopState::Consuming => {
                    let next = tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => break,
                        next = self.broker.next_delivery() => next,
                    };

                    let message = match next {
                        Ok(Some(message)) => message,
                        Ok(None) => {
                            warn!("Consumer stream closed; reconnecting");
                            self.reconnect().await;
                            continue;
                        }
                        Err(e) => {
                            error!(error = %e, "Broker channel failed; reconnecting");
                            self.reconnect().await;
                            continue;
                        }
                    };

                    let delivery_tag = message.delivery_tag;
                    let verdict = tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => {
                            warn!(delivery_tag, "Shutdown while processing; message left unacknowledged");
                            break;
                        }
                        verdict = evaluate(&self.decoder, self.store.as_ref(), &message) => verdict,
                    };

                    // Not raced against shutdown: a published dead letter is
                    // always followed by its ack.
                    let handled = self.settle(&message, verdict).await;

                    match handled {
                        Ok(Disposition::Requeued) => {
                            if !self.wait_for_database(&shutdown).await {
                                break;
                            }
                        }
                        Ok(_) => {}
                        Err(e) => {
                            error!(delivery_tag, error = %e, "Failed to settle delivery; reconnecting");
                            self.reconnect().await;
                        }
                    }
                }
            }
        }

        self.broker.close().await;
        self.state = LoopState::Idle;
        info!("Consumer stopped gracefully");
        Ok(())
    }

    /// Decodes, persists, and settles one delivery.
    ///
    /// An `Err` means the delivery could not be acked or nacked; the broker
    /// will redeliver it once the session is re-established.
    pub async fn handle_delivery(&mut self, message: InboundMessage) -> Result<Disposition> {
        let verdict = evaluate(&self.decoder, self.store.as_ref(), &message).await;
        self.settle(&message, verdict).await
    }

    /// Acks, dead-letters, or requeues according to the verdict.
    async fn settle(&mut self, message: &InboundMessage, verdict: Verdict) -> Result<Disposition> {
        let tag = message.delivery_tag;

        match verdict {
            Verdict::Undecodable(reason) => self.dead_letter(message, &reason).await,
            Verdict::Persisted(PersistenceOutcome::Committed) => {
                self.broker.ack(tag).await?;
                debug!(delivery_tag = tag, "Message acked");
                Ok(Disposition::Acked)
            }
            Verdict::Persisted(PersistenceOutcome::Rejected(reason)) => {
                self.dead_letter(message, &format!("persist rejected: {}", reason))
                    .await
            }
            Verdict::Persisted(PersistenceOutcome::ConnectionUnavailable) => {
                self.broker.nack(tag, true).await?;
                warn!(delivery_tag = tag, "Database unavailable; message requeued");
                Ok(Disposition::Requeued)
            }
        }
    }

    /// Routes to the dead-letter exchange and acks whatever the outcome.
    async fn dead_letter(&mut self, message: &InboundMessage, reason: &str) -> Result<Disposition> {
        let routed = self.router.route(&mut self.broker, message, reason).await;
        self.broker.ack(message.delivery_tag).await?;
        Ok(Disposition::DeadLettered(routed))
    }

    async fn establish(&mut self) -> Result<()> {
        self.broker.connect().await?;
        self.broker.subscribe().await
    }

    async fn reconnect(&mut self) {
        self.broker.close().await;
        self.state = LoopState::ConnectingBroker;
    }

    /// Pauses and pings until the database answers.
    ///
    /// Returns `false` if shutdown fired first.
    async fn wait_for_database(&mut self, shutdown: &CancellationToken) -> bool {
        loop {
            if !pause(self.config.backoff(), shutdown).await {
                return false;
            }

            let reachable = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return false,
                reachable = self.store.ping() => reachable,
            };

            if reachable {
                info!("Database reachable again; resuming");
                return true;
            }
            warn!(retry_in_ms = self.config.backoff_ms, "Database still unavailable");
        }
    }
}

/// Decode and persist result of one delivery, before it is settled.
#[derive(Debug)]
enum Verdict {
    Persisted(PersistenceOutcome),
    Undecodable(String),
}

/// Decodes and persists without touching the broker.
async fn evaluate(
    decoder: &MessageDecoder,
    store: &dyn RecordStore,
    message: &InboundMessage,
) -> Verdict {
    match decoder.decode(&message.payload) {
        Ok(record) => Verdict::Persisted(store.persist(&record).await),
        Err(e) => {
            metrics().decode_failures.inc();
            warn!(
                delivery_tag = message.delivery_tag,
                routing_key = %message.routing_key,
                error = %e,
                payload = %message.payload_preview(),
                "Failed to decode message"
            );
            Verdict::Undecodable(format!("decode failed: {}", e))
        }
    }
}
