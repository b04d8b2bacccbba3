//! Dead-letter routing for messages that cannot be persisted.

use crate::config::BrokerConfig;
use crate::consumer::{MessageBroker, PublishRequest};
use chrono::Utc;
use engine_core::{
    InboundMessage, RouteOutcome, HEADER_DEATH_REASON, HEADER_FAILED_AT,
    HEADER_ORIGINAL_EXCHANGE, HEADER_ORIGINAL_ROUTING_KEY, HEADER_RETRY_COUNT,
};
use telemetry::metrics;
use tracing::{error, warn};

/// Publishes failed messages to the dead-letter exchange.
///
/// The payload is forwarded unchanged; the failure is described in headers.
#[derive(Debug, Clone)]
pub struct DeadLetterRouter {
    exchange: String,
    routing_key: String,
}

impl DeadLetterRouter {
    pub fn new(exchange: impl Into<String>, routing_key: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
        }
    }

    /// Routes to the configured dead-letter exchange, keyed by the
    /// dead-letter queue name as the topology binds it.
    pub fn from_config(config: &BrokerConfig) -> Self {
        Self::new(&config.dead_letter_exchange, &config.dead_letter_queue)
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    /// Builds the dead-letter publish for a failed message.
    pub fn annotate(&self, message: &InboundMessage, reason: &str) -> PublishRequest {
        let mut headers = message.headers.clone();
        headers.insert(HEADER_DEATH_REASON.to_string(), reason.into());
        headers.insert(
            HEADER_ORIGINAL_EXCHANGE.to_string(),
            message.exchange.as_str().into(),
        );
        headers.insert(
            HEADER_ORIGINAL_ROUTING_KEY.to_string(),
            message.original_routing_key().into(),
        );
        headers.insert(HEADER_FAILED_AT.to_string(), Utc::now().to_rfc3339().into());
        headers.insert(HEADER_RETRY_COUNT.to_string(), message.retry_count().into());

        PublishRequest {
            exchange: self.exchange.clone(),
            routing_key: self.routing_key.clone(),
            payload: message.payload.clone(),
            headers,
        }
    }

    /// Publishes the message to the dead-letter exchange.
    ///
    /// Never fails: a publish error is logged and reported as
    /// [`RouteOutcome::RouteFailed`] so the caller can decide what to do
    /// with the original delivery.
    pub async fn route<B: MessageBroker + ?Sized>(
        &self,
        broker: &mut B,
        message: &InboundMessage,
        reason: &str,
    ) -> RouteOutcome {
        let request = self.annotate(message, reason);

        match broker.publish(request).await {
            Ok(()) => {
                metrics().dead_lettered.inc();
                warn!(
                    delivery_tag = message.delivery_tag,
                    exchange = %self.exchange,
                    reason,
                    "Message dead-lettered"
                );
                RouteOutcome::Routed
            }
            Err(e) => {
                metrics().dead_letter_failures.inc();
                error!(
                    delivery_tag = message.delivery_tag,
                    exchange = %self.exchange,
                    reason,
                    error = %e,
                    payload = %message.payload_preview(),
                    "Failed to dead-letter message"
                );
                RouteOutcome::RouteFailed
            }
        }
    }
}
