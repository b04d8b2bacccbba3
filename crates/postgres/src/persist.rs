//! Idempotent record persistence.
//!
//! Each attempt acquires a pooled connection, opens a transaction, runs one
//! `INSERT … ON CONFLICT DO NOTHING`, and commits. The connection guard and
//! the transaction are dropped on every exit path, so an error or a
//! cancelled attempt rolls back and returns the connection to the pool.

use crate::client::PostgresClient;
use crate::schema::{create_table_sql, insert_sql, TABLE_EXISTS_SQL};
use async_trait::async_trait;
use deadpool_postgres::PoolError;
use engine_core::{DecodedRecord, Error, FieldValue, PersistenceOutcome, Result, TableSchema};
use std::time::{Duration, Instant};
use telemetry::{health, metrics};
use tokio_postgres::types::ToSql;
use tracing::{debug, error, info, warn};

/// Durable storage for decoded records.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Writes the record once per natural key.
    ///
    /// A record whose key already exists counts as committed.
    async fn persist(&self, record: &DecodedRecord) -> PersistenceOutcome;

    /// Whether the database answers right now.
    async fn ping(&self) -> bool;

    /// Last known connectivity, without a round trip.
    fn is_connected(&self) -> bool;

    fn close(&self);
}

/// PostgreSQL-backed [`RecordStore`].
#[derive(Clone)]
pub struct PgRecordStore {
    client: PostgresClient,
    schema: TableSchema,
    attempt_timeout: Duration,
}

impl PgRecordStore {
    /// Creates the store. The schema must already have passed
    /// `TableSchema::check`.
    pub fn new(client: PostgresClient, schema: TableSchema) -> Self {
        let attempt_timeout = client.config().statement_timeout();
        Self {
            client,
            schema,
            attempt_timeout,
        }
    }

    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    pub fn client(&self) -> &PostgresClient {
        &self.client
    }

    /// Creates the target table if it does not exist.
    pub async fn init_schema(&self) -> Result<()> {
        let client = self
            .client
            .pool()
            .get()
            .await
            .map_err(|e| Error::database(format!("Failed to acquire connection: {}", e)))?;

        let ddl = create_table_sql(&self.schema);
        debug!(sql = %ddl, "Ensuring table exists");
        client
            .batch_execute(&ddl)
            .await
            .map_err(|e| Error::database(format!("Failed to create table: {}", e)))?;

        info!(table = %self.schema.table, "Table ready");
        Ok(())
    }

    /// Whether the target table exists in the current schema.
    pub async fn table_exists(&self) -> Result<bool> {
        let client = self
            .client
            .pool()
            .get()
            .await
            .map_err(|e| Error::database(format!("Failed to acquire connection: {}", e)))?;

        let rows = client
            .query(TABLE_EXISTS_SQL, &[&self.schema.table])
            .await
            .map_err(|e| Error::database(format!("Failed to inspect tables: {}", e)))?;

        Ok(!rows.is_empty())
    }

    async fn insert(&self, record: &DecodedRecord) -> std::result::Result<u64, StoreFailure> {
        let mut client = self.client.pool().get().await?;
        let tx = client.transaction().await?;

        let (sql, _) = insert_sql(&self.schema, record);
        let params: Vec<&(dyn ToSql + Sync)> = record.columns().map(|(_, v)| sql_param(v)).collect();

        let inserted = tx.execute(sql.as_str(), &params).await?;
        tx.commit().await?;
        Ok(inserted)
    }
}

fn sql_param(value: &FieldValue) -> &(dyn ToSql + Sync) {
    match value {
        FieldValue::Text(v) => v,
        FieldValue::Integer(v) => v,
        FieldValue::Float(v) => v,
        FieldValue::Boolean(v) => v,
        FieldValue::Timestamp(v) => v,
    }
}

/// Why an attempt failed, before it becomes a [`PersistenceOutcome`].
#[derive(Debug)]
enum StoreFailure {
    Unavailable(String),
    Rejected(String),
}

impl From<PoolError> for StoreFailure {
    fn from(e: PoolError) -> Self {
        Self::Unavailable(e.to_string())
    }
}

impl From<tokio_postgres::Error> for StoreFailure {
    fn from(e: tokio_postgres::Error) -> Self {
        if is_connectivity_error(&e) {
            Self::Unavailable(e.to_string())
        } else {
            let reason = match e.as_db_error() {
                Some(db) => format!("{} ({})", db.message(), db.code().code()),
                None => e.to_string(),
            };
            Self::Rejected(reason)
        }
    }
}

/// SQLSTATE classes that mean the server cannot take work right now rather
/// than that the data is wrong.
fn is_unavailable_sqlstate(code: &str) -> bool {
    code.starts_with("08") || code.starts_with("57P") || code.starts_with("53")
}

fn is_connectivity_error(e: &tokio_postgres::Error) -> bool {
    if let Some(db) = e.as_db_error() {
        return is_unavailable_sqlstate(db.code().code());
    }
    if e.is_closed() {
        return true;
    }
    let mut source = std::error::Error::source(e);
    while let Some(inner) = source {
        if inner.is::<std::io::Error>() {
            return true;
        }
        source = inner.source();
    }
    false
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn persist(&self, record: &DecodedRecord) -> PersistenceOutcome {
        let started = Instant::now();
        let attempt = tokio::time::timeout(self.attempt_timeout, self.insert(record)).await;
        metrics()
            .persist_latency_ms
            .observe(started.elapsed().as_millis() as u64);

        let key = record.natural_key().map(|k| k.to_string()).unwrap_or_default();

        match attempt {
            Ok(Ok(inserted)) => {
                health().database.set_connected();
                if inserted == 0 {
                    metrics().duplicates_skipped.inc();
                    debug!(table = %self.schema.table, key = %key, "Duplicate key; already stored");
                } else {
                    metrics().records_committed.inc();
                    debug!(table = %self.schema.table, key = %key, "Record committed");
                }
                PersistenceOutcome::Committed
            }
            Ok(Err(StoreFailure::Rejected(reason))) => {
                health().database.set_connected();
                metrics().persist_rejections.inc();
                warn!(table = %self.schema.table, key = %key, reason = %reason, "Record rejected");
                PersistenceOutcome::Rejected(reason)
            }
            Ok(Err(StoreFailure::Unavailable(reason))) => {
                metrics().persist_unavailable.inc();
                health().database.set_disconnected(reason.clone());
                error!(table = %self.schema.table, key = %key, error = %reason, "Database unavailable");
                PersistenceOutcome::ConnectionUnavailable
            }
            Err(_) => {
                metrics().persist_unavailable.inc();
                let reason = format!("persist timed out after {:?}", self.attempt_timeout);
                health().database.set_disconnected(reason.clone());
                error!(table = %self.schema.table, key = %key, "{}", reason);
                PersistenceOutcome::ConnectionUnavailable
            }
        }
    }

    async fn ping(&self) -> bool {
        let result = tokio::time::timeout(self.attempt_timeout, self.client.ping()).await;
        match result {
            Ok(Ok(())) => {
                health().database.set_connected();
                true
            }
            Ok(Err(e)) => {
                health().database.set_disconnected(e.to_string());
                false
            }
            Err(_) => {
                health().database.set_disconnected("ping timed out");
                false
            }
        }
    }

    fn is_connected(&self) -> bool {
        health().database.is_connected()
    }

    fn close(&self) {
        self.client.close();
        info!("PostgreSQL pool closed");
    }
}
