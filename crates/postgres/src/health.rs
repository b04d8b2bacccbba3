//! PostgreSQL health checks.

use crate::client::PostgresClient;
use telemetry::health;
use tracing::error;

/// Pings the database and records the result in the health registry.
pub async fn check_connection(client: &PostgresClient) -> bool {
    match client.ping().await {
        Ok(()) => {
            health().database.set_connected();
            true
        }
        Err(e) => {
            error!("PostgreSQL health check failed: {}", e);
            health().database.set_disconnected(e.to_string());
            false
        }
    }
}
