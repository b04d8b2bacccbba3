//! RabbitMQ configuration.

use engine_core::{Error, Result};
use serde::{Deserialize, Serialize};
use url::Url;

/// Broker connection and topology configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Full AMQP URI; when set, host/port/credentials/vhost are ignored
    #[serde(default)]
    pub uri: Option<String>,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_username")]
    pub username: String,
    #[serde(default = "default_password")]
    pub password: String,
    #[serde(default = "default_vhost")]
    pub vhost: String,

    /// Topic exchange producers publish to
    #[serde(default = "default_exchange")]
    pub exchange: String,
    /// Queue this worker consumes from
    #[serde(default = "default_queue")]
    pub queue: String,
    /// Binding key between `exchange` and `queue`
    #[serde(default = "default_binding_key")]
    pub binding_key: String,
    #[serde(default = "default_dead_letter_exchange")]
    pub dead_letter_exchange: String,
    #[serde(default = "default_dead_letter_queue")]
    pub dead_letter_queue: String,

    /// Per-message TTL on the primary queue; expired messages are
    /// dead-lettered by the broker
    #[serde(default = "default_message_ttl_ms")]
    pub message_ttl_ms: Option<u32>,
    /// Unacknowledged deliveries the broker may push ahead
    #[serde(default = "default_prefetch")]
    pub prefetch: u16,
    #[serde(default = "default_consumer_tag")]
    pub consumer_tag: String,
    /// Connection name shown in the management UI
    #[serde(default = "default_connection_name")]
    pub connection_name: String,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

fn default_host() -> String {
    "rabbitmq".to_string()
}

fn default_port() -> u16 {
    5672
}

fn default_username() -> String {
    "guest".to_string()
}

fn default_password() -> String {
    "guest".to_string()
}

fn default_vhost() -> String {
    "/".to_string()
}

fn default_exchange() -> String {
    "source_exchange".to_string()
}

fn default_queue() -> String {
    "postgres".to_string()
}

fn default_binding_key() -> String {
    "source.#".to_string()
}

fn default_dead_letter_exchange() -> String {
    "dead_letter_exchange".to_string()
}

fn default_dead_letter_queue() -> String {
    "dead_letter_queue".to_string()
}

fn default_message_ttl_ms() -> Option<u32> {
    Some(60_000)
}

fn default_prefetch() -> u16 {
    1
}

fn default_consumer_tag() -> String {
    "queue-ingest".to_string()
}

fn default_connection_name() -> String {
    "queue-ingest_Consumer".to_string()
}

fn default_connect_timeout_secs() -> u64 {
    10
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            uri: None,
            host: default_host(),
            port: default_port(),
            username: default_username(),
            password: default_password(),
            vhost: default_vhost(),
            exchange: default_exchange(),
            queue: default_queue(),
            binding_key: default_binding_key(),
            dead_letter_exchange: default_dead_letter_exchange(),
            dead_letter_queue: default_dead_letter_queue(),
            message_ttl_ms: default_message_ttl_ms(),
            prefetch: default_prefetch(),
            consumer_tag: default_consumer_tag(),
            connection_name: default_connection_name(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

impl BrokerConfig {
    /// Returns the AMQP URI, building it from parts when `uri` is unset.
    ///
    /// Credentials and vhost are percent-encoded, so `/` as a vhost becomes
    /// `%2f` as AMQP expects.
    pub fn amqp_uri(&self) -> Result<String> {
        if let Some(uri) = self.uri.as_ref().filter(|u| !u.trim().is_empty()) {
            return Ok(uri.clone());
        }

        let mut url = Url::parse(&format!("amqp://{}:{}", self.host, self.port))
            .map_err(|e| Error::config(format!("invalid broker host `{}`: {}", self.host, e)))?;

        url.set_username(&self.username)
            .map_err(|_| Error::config("broker username cannot be set on this URI"))?;
        url.set_password(Some(&self.password))
            .map_err(|_| Error::config("broker password cannot be set on this URI"))?;

        let vhost = self.vhost.replace('%', "%25").replace('/', "%2f");
        url.set_path(&format!("/{}", vhost));

        Ok(url.to_string())
    }

    /// URI with the password masked, for logs.
    pub fn redacted_uri(&self) -> String {
        match self.amqp_uri().ok().and_then(|u| Url::parse(&u).ok()) {
            Some(mut url) => {
                if url.password().is_some() {
                    let _ = url.set_password(Some("***"));
                }
                url.to_string()
            }
            None => format!("amqp://{}:{}", self.host, self.port),
        }
    }
}
