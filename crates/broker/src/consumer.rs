//! RabbitMQ consumer for reading messages bound for Postgres.
//!
//! Uses lapin with:
//! - Manual acknowledgement for at-least-once delivery
//! - A prefetch window of one by default, so messages are handled in order
//! - Publisher confirms on the same channel for dead-letter publishes

use crate::config::BrokerConfig;
use crate::headers::{from_field_table, to_field_table};
use crate::topology::declare_topology;
use async_trait::async_trait;
use engine_core::{ConnectionState, DeliveryTag, Error, InboundMessage, MessageHeaders, Result};
use futures::StreamExt;
use lapin::{
    message::Delivery,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicGetOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions, QueueDeclareOptions,
    },
    types::FieldTable,
    BasicProperties, Channel, Connection, ConnectionProperties, Consumer,
};
use std::time::Duration;
use telemetry::{health, metrics};
use tracing::{debug, error, info, warn};

/// A message to publish.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishRequest {
    /// Target exchange; empty string is the default exchange
    pub exchange: String,
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub headers: MessageHeaders,
}

/// Operations the consumer loop, dead-letter router, and replay need from a
/// broker session.
///
/// A session owns one connection and one channel. Any failed operation
/// leaves the session disconnected; callers reconnect with `connect`.
#[async_trait]
pub trait MessageBroker: Send {
    /// Opens the connection and channel and declares the topology.
    async fn connect(&mut self) -> Result<()>;

    /// Starts consuming the primary queue with manual acknowledgement.
    async fn subscribe(&mut self) -> Result<()>;

    /// Waits for the next delivery. `Ok(None)` means the stream ended and
    /// the session must be re-established.
    async fn next_delivery(&mut self) -> Result<Option<InboundMessage>>;

    async fn ack(&mut self, tag: DeliveryTag) -> Result<()>;

    async fn nack(&mut self, tag: DeliveryTag, requeue: bool) -> Result<()>;

    /// Publishes and waits for the broker to confirm.
    async fn publish(&mut self, request: PublishRequest) -> Result<()>;

    /// Number of ready messages in a queue.
    async fn queue_depth(&mut self, queue: &str) -> Result<u32>;

    /// Pulls a single message without subscribing.
    async fn get(&mut self, queue: &str) -> Result<Option<InboundMessage>>;

    /// Closes the session. Unacknowledged deliveries return to the queue.
    async fn close(&mut self);

    fn state(&self) -> ConnectionState;

    fn is_connected(&self) -> bool {
        self.state().is_connected()
    }
}

/// Lapin-backed broker session.
pub struct AmqpBroker {
    config: BrokerConfig,
    connection: Option<Connection>,
    channel: Option<Channel>,
    consumer: Option<Consumer>,
    state: ConnectionState,
}

impl AmqpBroker {
    pub fn new(config: BrokerConfig) -> Self {
        info!(
            uri = %config.redacted_uri(),
            queue = %config.queue,
            prefetch = config.prefetch,
            "Creating RabbitMQ consumer"
        );

        Self {
            config,
            connection: None,
            channel: None,
            consumer: None,
            state: ConnectionState::Disconnected,
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    fn channel(&self) -> Result<&Channel> {
        match self.channel.as_ref() {
            Some(channel) if self.state.is_connected() => Ok(channel),
            _ => Err(Error::broker("Not connected to RabbitMQ")),
        }
    }

    /// Marks the session lost and converts the error.
    fn fail(&mut self, action: &str, e: lapin::Error) -> Error {
        let text = e.to_string();
        warn!(action, error = %text, "RabbitMQ operation failed");
        self.drop_session();
        health().broker.set_disconnected(format!("{}: {}", action, text));
        Error::broker(format!("Failed to {}: {}", action, text))
    }

    fn drop_session(&mut self) {
        self.consumer = None;
        self.channel = None;
        self.connection = None;
        self.state = ConnectionState::Disconnected;
    }

    async fn open(&self) -> Result<(Connection, Channel)> {
        let uri = self.config.amqp_uri()?;
        let properties = ConnectionProperties::default()
            .with_connection_name(self.config.connection_name.clone().into());

        let timeout = Duration::from_secs(self.config.connect_timeout_secs);
        let connection = tokio::time::timeout(timeout, Connection::connect(&uri, properties))
            .await
            .map_err(|_| Error::broker(format!("Connection timed out after {:?}", timeout)))?
            .map_err(|e| {
                let text = e.to_string();
                if text.contains("ACCESS_REFUSED") {
                    error!(
                        username = %self.config.username,
                        vhost = %self.config.vhost,
                        "RabbitMQ refused the credentials; check the broker user and password"
                    );
                }
                Error::broker(format!("Failed to connect to RabbitMQ: {}", text))
            })?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| Error::broker(format!("Failed to open channel: {}", e)))?;

        channel
            .basic_qos(self.config.prefetch, BasicQosOptions::default())
            .await
            .map_err(|e| Error::broker(format!("Failed to set prefetch: {}", e)))?;

        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| Error::broker(format!("Failed to enable publisher confirms: {}", e)))?;

        declare_topology(&channel, &self.config).await?;

        Ok((connection, channel))
    }
}

/// Converts a lapin delivery into the broker-agnostic message.
pub fn inbound_from_delivery(delivery: Delivery) -> InboundMessage {
    InboundMessage {
        delivery_tag: delivery.delivery_tag,
        exchange: delivery.exchange.as_str().to_string(),
        routing_key: delivery.routing_key.as_str().to_string(),
        redelivered: delivery.redelivered,
        headers: from_field_table(delivery.properties.headers().as_ref()),
        payload: delivery.data,
    }
}

#[async_trait]
impl MessageBroker for AmqpBroker {
    async fn connect(&mut self) -> Result<()> {
        if self.state.is_connected() {
            return Ok(());
        }

        self.state = ConnectionState::Connecting;
        health().broker.set_connecting();
        metrics().broker_connect_attempts.inc();

        match self.open().await {
            Ok((connection, channel)) => {
                self.connection = Some(connection);
                self.channel = Some(channel);
                self.state = ConnectionState::Connected;
                health().broker.set_connected();
                info!(
                    uri = %self.config.redacted_uri(),
                    queue = %self.config.queue,
                    "Connected to RabbitMQ"
                );
                Ok(())
            }
            Err(e) => {
                self.drop_session();
                metrics().broker_connect_failures.inc();
                health().broker.set_disconnected(e.to_string());
                Err(e)
            }
        }
    }

    async fn subscribe(&mut self) -> Result<()> {
        let result = self
            .channel()?
            .basic_consume(
                &self.config.queue,
                &self.config.consumer_tag,
                BasicConsumeOptions {
                    no_ack: false,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await;

        match result {
            Ok(consumer) => {
                self.consumer = Some(consumer);
                info!(queue = %self.config.queue, "Consuming");
                Ok(())
            }
            Err(e) => Err(self.fail("start consuming", e)),
        }
    }

    async fn next_delivery(&mut self) -> Result<Option<InboundMessage>> {
        let Some(consumer) = self.consumer.as_mut() else {
            return Err(Error::broker("Not subscribed"));
        };

        match consumer.next().await {
            Some(Ok(delivery)) => {
                let message = inbound_from_delivery(delivery);
                metrics().messages_received.inc();
                if message.redelivered {
                    metrics().messages_redelivered.inc();
                }
                debug!(
                    delivery_tag = message.delivery_tag,
                    routing_key = %message.routing_key,
                    redelivered = message.redelivered,
                    bytes = message.payload.len(),
                    "Received message"
                );
                Ok(Some(message))
            }
            Some(Err(e)) => Err(self.fail("receive delivery", e)),
            None => {
                warn!(queue = %self.config.queue, "Delivery stream ended");
                self.drop_session();
                health().broker.set_disconnected("delivery stream ended");
                Ok(None)
            }
        }
    }

    async fn ack(&mut self, tag: DeliveryTag) -> Result<()> {
        let result = self
            .channel()?
            .basic_ack(tag, BasicAckOptions::default())
            .await;

        match result {
            Ok(()) => {
                metrics().messages_acked.inc();
                Ok(())
            }
            Err(e) => Err(self.fail("acknowledge delivery", e)),
        }
    }

    async fn nack(&mut self, tag: DeliveryTag, requeue: bool) -> Result<()> {
        let result = self
            .channel()?
            .basic_nack(
                tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await;

        match result {
            Ok(()) => {
                if requeue {
                    metrics().messages_requeued.inc();
                }
                Ok(())
            }
            Err(e) => Err(self.fail("reject delivery", e)),
        }
    }

    async fn publish(&mut self, request: PublishRequest) -> Result<()> {
        let properties = BasicProperties::default()
            .with_delivery_mode(2)
            .with_headers(to_field_table(&request.headers));

        let confirm = self
            .channel()?
            .basic_publish(
                &request.exchange,
                &request.routing_key,
                BasicPublishOptions::default(),
                &request.payload,
                properties,
            )
            .await;

        let confirm = match confirm {
            Ok(confirm) => confirm,
            Err(e) => return Err(self.fail("publish", e)),
        };

        match confirm.await {
            Ok(confirmation) if confirmation.is_nack() => Err(Error::broker(format!(
                "Broker rejected publish to `{}` with key `{}`",
                request.exchange, request.routing_key
            ))),
            Ok(_) => Ok(()),
            Err(e) => Err(self.fail("confirm publish", e)),
        }
    }

    async fn queue_depth(&mut self, queue: &str) -> Result<u32> {
        let result = self
            .channel()?
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    passive: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await;

        match result {
            Ok(declared) => Ok(declared.message_count()),
            Err(e) => Err(self.fail("inspect queue", e)),
        }
    }

    async fn get(&mut self, queue: &str) -> Result<Option<InboundMessage>> {
        let result = self
            .channel()?
            .basic_get(queue, BasicGetOptions { no_ack: false })
            .await;

        match result {
            Ok(Some(message)) => Ok(Some(inbound_from_delivery(message.delivery))),
            Ok(None) => Ok(None),
            Err(e) => Err(self.fail("get message", e)),
        }
    }

    async fn close(&mut self) {
        self.consumer = None;

        if let Some(channel) = self.channel.take() {
            if let Err(e) = channel.close(200, "closing").await {
                debug!(error = %e, "Channel close failed");
            }
        }
        if let Some(connection) = self.connection.take() {
            if let Err(e) = connection.close(200, "closing").await {
                debug!(error = %e, "Connection close failed");
            }
        }

        if self.state != ConnectionState::Disconnected {
            info!("RabbitMQ connection closed");
        }
        self.state = ConnectionState::Disconnected;
        health().broker.set_disconnected("closed");
    }

    fn state(&self) -> ConnectionState {
        self.state
    }
}
