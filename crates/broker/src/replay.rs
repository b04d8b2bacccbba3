//! Operator-driven replay of dead-lettered messages.
//!
//! Each message in the dead-letter queue is republished to the primary
//! queue with its retry count bumped, unless it has already been replayed
//! `max_retries` times. Those stay in the dead-letter queue.
//!
//! The pass is bounded by the queue depth at start, so messages that fail
//! again during the pass are not picked up twice.

use crate::config::BrokerConfig;
use crate::consumer::{MessageBroker, PublishRequest};
use engine_core::{
    DeliveryTag, InboundMessage, Result, HEADER_DEATH_REASON, HEADER_FAILED_AT,
    HEADER_ORIGINAL_EXCHANGE, HEADER_ORIGINAL_ROUTING_KEY, HEADER_RETRY_COUNT,
};
use serde::Serialize;
use telemetry::metrics;
use tracing::{info, warn};

pub const DEFAULT_MAX_RETRIES: i64 = 5;

/// Result of a replay pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReplaySummary {
    pub inspected: u32,
    pub replayed: u32,
    /// Left in the dead-letter queue because the retry budget is spent
    pub retained: u32,
}

/// Builds the republish of a dead letter onto the primary queue.
///
/// Goes through the default exchange so only the primary queue receives it,
/// not every queue bound to the source exchange.
pub fn replay_request(message: &InboundMessage, primary_queue: &str) -> PublishRequest {
    let original_routing_key = message.original_routing_key().to_string();
    let mut headers = message.headers.clone();
    headers.remove(HEADER_DEATH_REASON);
    headers.remove(HEADER_FAILED_AT);
    headers.remove(HEADER_ORIGINAL_EXCHANGE);
    headers.insert(
        HEADER_ORIGINAL_ROUTING_KEY.to_string(),
        original_routing_key.into(),
    );
    headers.insert(
        HEADER_RETRY_COUNT.to_string(),
        (message.retry_count() + 1).into(),
    );

    PublishRequest {
        exchange: String::new(),
        routing_key: primary_queue.to_string(),
        payload: message.payload.clone(),
        headers,
    }
}

/// Runs one replay pass over the dead-letter queue.
pub async fn replay_dead_letters<B: MessageBroker + ?Sized>(
    broker: &mut B,
    config: &BrokerConfig,
    max_retries: i64,
) -> Result<ReplaySummary> {
    let depth = broker.queue_depth(&config.dead_letter_queue).await?;
    info!(
        queue = %config.dead_letter_queue,
        depth,
        max_retries,
        "Replaying dead letters"
    );

    let mut summary = ReplaySummary::default();
    // Held unacked until the end so basic.get keeps moving forward.
    let mut held: Vec<DeliveryTag> = Vec::new();

    let result = replay_pass(broker, config, max_retries, depth, &mut summary, &mut held).await;

    // Reverse order puts them back in their original sequence.
    for tag in held.into_iter().rev() {
        if let Err(e) = broker.nack(tag, true).await {
            // The channel is gone; the broker requeues unacked messages itself.
            warn!(error = %e, "Failed to return retained dead letter");
            break;
        }
    }

    result?;

    info!(
        inspected = summary.inspected,
        replayed = summary.replayed,
        retained = summary.retained,
        "Dead-letter replay finished"
    );

    Ok(summary)
}

async fn replay_pass<B: MessageBroker + ?Sized>(
    broker: &mut B,
    config: &BrokerConfig,
    max_retries: i64,
    depth: u32,
    summary: &mut ReplaySummary,
    held: &mut Vec<DeliveryTag>,
) -> Result<()> {
    for _ in 0..depth {
        let Some(message) = broker.get(&config.dead_letter_queue).await? else {
            break;
        };
        summary.inspected += 1;

        if message.retry_count() >= max_retries {
            warn!(
                delivery_tag = message.delivery_tag,
                retry_count = message.retry_count(),
                payload = %message.payload_preview(),
                "Retry budget spent; leaving message in dead-letter queue"
            );
            held.push(message.delivery_tag);
            summary.retained += 1;
            continue;
        }

        broker
            .publish(replay_request(&message, &config.queue))
            .await?;
        broker.ack(message.delivery_tag).await?;

        metrics().dead_letters_replayed.inc();
        summary.replayed += 1;
    }

    Ok(())
}
