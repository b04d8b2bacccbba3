//! Exchange and queue declarations.
//!
//! Declarations are idempotent as long as the arguments match what the
//! broker already holds. A mismatch comes back as PRECONDITION_FAILED and
//! closes the channel; the caller treats it like any other connect failure.

use crate::config::BrokerConfig;
use engine_core::{Error, Result};
use lapin::{
    options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions},
    types::{AMQPValue, FieldTable, LongString, ShortString},
    Channel, ExchangeKind,
};
use tracing::{debug, error};

pub const ARG_MESSAGE_TTL: &str = "x-message-ttl";
pub const ARG_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
pub const ARG_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";

/// Arguments of the primary queue: TTL plus dead-letter target.
pub fn primary_queue_arguments(config: &BrokerConfig) -> FieldTable {
    let mut args = FieldTable::default();
    if let Some(ttl) = config.message_ttl_ms {
        args.insert(
            ShortString::from(ARG_MESSAGE_TTL),
            AMQPValue::LongLongInt(i64::from(ttl)),
        );
    }
    args.insert(
        ShortString::from(ARG_DEAD_LETTER_EXCHANGE),
        AMQPValue::LongString(LongString::from(config.dead_letter_exchange.clone())),
    );
    args.insert(
        ShortString::from(ARG_DEAD_LETTER_ROUTING_KEY),
        AMQPValue::LongString(LongString::from(config.dead_letter_queue.clone())),
    );
    args
}

/// Declares both exchanges, the dead-letter queue, and the primary queue.
pub async fn declare_topology(channel: &Channel, config: &BrokerConfig) -> Result<()> {
    let durable_exchange = ExchangeDeclareOptions {
        durable: true,
        ..ExchangeDeclareOptions::default()
    };
    let durable_queue = QueueDeclareOptions {
        durable: true,
        ..QueueDeclareOptions::default()
    };

    channel
        .exchange_declare(
            &config.exchange,
            ExchangeKind::Topic,
            durable_exchange,
            FieldTable::default(),
        )
        .await
        .map_err(|e| declare_error("exchange", &config.exchange, e))?;

    channel
        .exchange_declare(
            &config.dead_letter_exchange,
            ExchangeKind::Direct,
            durable_exchange,
            FieldTable::default(),
        )
        .await
        .map_err(|e| declare_error("exchange", &config.dead_letter_exchange, e))?;

    // No TTL here: dead letters wait for an operator.
    channel
        .queue_declare(&config.dead_letter_queue, durable_queue, FieldTable::default())
        .await
        .map_err(|e| declare_error("queue", &config.dead_letter_queue, e))?;

    channel
        .queue_bind(
            &config.dead_letter_queue,
            &config.dead_letter_exchange,
            &config.dead_letter_queue,
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await
        .map_err(|e| declare_error("binding", &config.dead_letter_queue, e))?;

    channel
        .queue_declare(&config.queue, durable_queue, primary_queue_arguments(config))
        .await
        .map_err(|e| declare_error("queue", &config.queue, e))?;

    channel
        .queue_bind(
            &config.queue,
            &config.exchange,
            &config.binding_key,
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await
        .map_err(|e| declare_error("binding", &config.queue, e))?;

    debug!(
        exchange = %config.exchange,
        queue = %config.queue,
        binding_key = %config.binding_key,
        dead_letter_queue = %config.dead_letter_queue,
        "Topology declared"
    );

    Ok(())
}

fn declare_error(kind: &str, name: &str, e: lapin::Error) -> Error {
    let text = e.to_string();
    if text.contains("PRECONDITION_FAILED") || text.contains("inequivalent arg") {
        error!(
            kind,
            name,
            error = %text,
            "Existing {} was declared with different arguments; delete it or align the configuration",
            kind
        );
    }
    Error::broker(format!("Failed to declare {} `{}`: {}", kind, name, text))
}
