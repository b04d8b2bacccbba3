//! RabbitMQ health checks.

use crate::config::BrokerConfig;
use lapin::{Connection, ConnectionProperties};
use std::time::Duration;
use tracing::{debug, error};

/// Opens and closes a throwaway connection to verify the broker answers
/// and accepts the configured credentials.
pub async fn check_connection(config: &BrokerConfig) -> bool {
    let uri = match config.amqp_uri() {
        Ok(uri) => uri,
        Err(e) => {
            error!("Invalid RabbitMQ address: {}", e);
            return false;
        }
    };

    let timeout = Duration::from_secs(config.connect_timeout_secs);
    match tokio::time::timeout(timeout, Connection::connect(&uri, ConnectionProperties::default())).await {
        Ok(Ok(connection)) => {
            debug!(uri = %config.redacted_uri(), "RabbitMQ connection healthy");
            let _ = connection.close(200, "health check").await;
            true
        }
        Ok(Err(e)) => {
            error!("Failed to connect to RabbitMQ: {}", e);
            false
        }
        Err(_) => {
            error!("RabbitMQ health check timed out after {:?}", timeout);
            false
        }
    }
}
