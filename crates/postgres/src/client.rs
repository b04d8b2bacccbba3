//! PostgreSQL pool wrapper.

use crate::config::DatabaseConfig;
use deadpool_postgres::{
    Config, ManagerConfig, Pool, PoolConfig, RecyclingMethod, Runtime, Timeouts,
};
use engine_core::{Error, Result};
use tokio_postgres::NoTls;
use tracing::{debug, info};

/// PostgreSQL client wrapper with connection pooling.
///
/// Connections are opened lazily, so creating the client never touches the
/// network and works while the database is down.
#[derive(Clone)]
pub struct PostgresClient {
    pool: Pool,
    config: DatabaseConfig,
}

impl PostgresClient {
    /// Creates a new pooled client.
    pub fn new(config: DatabaseConfig) -> Result<Self> {
        let mut cfg = Config::new();
        cfg.host = Some(config.host.clone());
        cfg.port = Some(config.port);
        cfg.dbname = Some(config.dbname.clone());
        cfg.user = Some(config.user.clone());
        cfg.password = config.password.clone();
        cfg.connect_timeout = Some(config.acquire_timeout());
        cfg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });
        cfg.pool = Some(PoolConfig {
            max_size: config.pool_size.max(1),
            timeouts: Timeouts {
                wait: Some(config.acquire_timeout()),
                create: Some(config.acquire_timeout()),
                recycle: Some(config.acquire_timeout()),
            },
            ..PoolConfig::default()
        });

        let pool = cfg
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| Error::database(format!("Failed to create pool: {}", e)))?;

        info!(
            host = %config.host,
            port = config.port,
            dbname = %config.dbname,
            pool_size = config.pool_size,
            "Created PostgreSQL client"
        );

        Ok(Self { pool, config })
    }

    /// Runs `SELECT 1` on a pooled connection.
    pub async fn ping(&self) -> Result<()> {
        let client = self
            .pool
            .get()
            .await
            .map_err(|e| Error::database(format!("Failed to acquire connection: {}", e)))?;
        client
            .execute("SELECT 1", &[])
            .await
            .map_err(|e| Error::database(format!("Ping failed: {}", e)))?;
        debug!("PostgreSQL connection healthy");
        Ok(())
    }

    /// Returns the underlying pool.
    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    /// Closes the pool; later acquires fail immediately.
    pub fn close(&self) {
        self.pool.close();
    }
}
