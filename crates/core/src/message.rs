//! Broker-agnostic view of a delivered message.

use std::collections::BTreeMap;

/// Header carrying how many times a message went through dead-letter replay.
pub const HEADER_RETRY_COUNT: &str = "x-retry-count";
/// Header carrying the failure reason on dead-lettered messages.
pub const HEADER_DEATH_REASON: &str = "x-death-reason";
/// Exchange the message was originally published to.
pub const HEADER_ORIGINAL_EXCHANGE: &str = "x-original-exchange";
/// Routing key the message was originally published with.
pub const HEADER_ORIGINAL_ROUTING_KEY: &str = "x-original-routing-key";
/// RFC 3339 time at which the message was dead-lettered.
pub const HEADER_FAILED_AT: &str = "x-failed-at";

/// Broker-assigned identifier used to ack or nack a delivery.
pub type DeliveryTag = u64;

/// A message header value.
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValue {
    Int(i64),
    Text(String),
    Bool(bool),
}

impl HeaderValue {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            Self::Text(s) => s.trim().parse().ok(),
            Self::Bool(_) => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl From<i64> for HeaderValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<String> for HeaderValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<&str> for HeaderValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

/// Message headers keyed by name.
pub type MessageHeaders = BTreeMap<String, HeaderValue>;

/// The raw unit delivered by the broker.
///
/// Owned by the consumer loop for one processing cycle and never persisted.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub delivery_tag: DeliveryTag,
    pub payload: Vec<u8>,
    pub exchange: String,
    pub routing_key: String,
    /// Set by the broker when this delivery was handed out before.
    pub redelivered: bool,
    pub headers: MessageHeaders,
}

impl InboundMessage {
    pub fn new(delivery_tag: DeliveryTag, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            delivery_tag,
            payload: payload.into(),
            exchange: String::new(),
            routing_key: String::new(),
            redelivered: false,
            headers: MessageHeaders::new(),
        }
    }

    pub fn with_routing_key(mut self, exchange: impl Into<String>, routing_key: impl Into<String>) -> Self {
        self.exchange = exchange.into();
        self.routing_key = routing_key.into();
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<HeaderValue>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Number of dead-letter replays this message has been through.
    ///
    /// Missing or unreadable headers count as a fresh message.
    pub fn retry_count(&self) -> i64 {
        self.headers
            .get(HEADER_RETRY_COUNT)
            .and_then(HeaderValue::as_int)
            .unwrap_or(0)
            .max(0)
    }

    /// Routing key the message was first published with.
    ///
    /// Dead-lettered copies travel under the dead-letter routing key, so the
    /// original one is read back from the annotation header when present.
    pub fn original_routing_key(&self) -> &str {
        self.headers
            .get(HEADER_ORIGINAL_ROUTING_KEY)
            .and_then(HeaderValue::as_text)
            .unwrap_or(&self.routing_key)
    }

    /// Payload rendered for logs, truncated.
    pub fn payload_preview(&self) -> String {
        const MAX_PREVIEW: usize = 256;
        let text = String::from_utf8_lossy(&self.payload);
        if text.chars().count() > MAX_PREVIEW {
            let cut: String = text.chars().take(MAX_PREVIEW).collect();
            format!("{}…", cut)
        } else {
            text.into_owned()
        }
    }
}
