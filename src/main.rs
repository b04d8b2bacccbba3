//! Queue-to-Postgres ingestion worker.
//!
//! Consumes JSON messages from RabbitMQ and stores them in PostgreSQL:
//! - Schema-driven decoding with type coercion
//! - Idempotent inserts keyed on a natural key
//! - Dead-lettering of messages that can never be stored
//! - Reconnect loop for both the broker and the database
//!
//! `mode = "replay"` instead moves dead letters back onto the primary queue
//! once and exits.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use api::{router, AppState};
use broker::{replay_dead_letters, AmqpBroker, BrokerConfig, DeadLetterRouter, MessageBroker, DEFAULT_MAX_RETRIES};
use engine_core::{MessageDecoder, TableSchema};
use postgres_store::{DatabaseConfig, PgRecordStore, PostgresClient, RecordStore};
use telemetry::init_tracing_from_env;
use worker::{ConsumerConfig, ConsumerLoop, WorkerConfig, WorkerScheduler};

const SERVICE_NAME: &str = "queue-ingest";

/// What the process does after startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
enum RunMode {
    /// Consume the primary queue until stopped
    Consume,
    /// Replay the dead-letter queue once and exit
    Replay,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct ReplayConfig {
    /// Replays allowed per message before it stays dead-lettered
    #[serde(default = "default_max_retries")]
    max_retries: i64,
}

fn default_max_retries() -> i64 {
    DEFAULT_MAX_RETRIES
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
        }
    }
}

/// Application configuration.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct Config {
    #[serde(default = "default_host")]
    host: String,
    #[serde(default = "default_port")]
    port: u16,
    #[serde(default = "default_mode")]
    mode: RunMode,
    #[serde(default = "default_metrics_log_interval_secs")]
    metrics_log_interval_secs: u64,

    #[serde(default)]
    broker: BrokerConfig,

    #[serde(default)]
    database: DatabaseConfig,

    #[serde(default)]
    consumer: ConsumerConfig,

    #[serde(default)]
    schema: TableSchema,

    #[serde(default)]
    replay: ReplayConfig,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_mode() -> RunMode {
    RunMode::Consume
}

fn default_metrics_log_interval_secs() -> u64 {
    60
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            mode: default_mode(),
            metrics_log_interval_secs: default_metrics_log_interval_secs(),
            broker: BrokerConfig::default(),
            database: DatabaseConfig::default(),
            consumer: ConsumerConfig::default(),
            schema: TableSchema::default(),
            replay: ReplayConfig::default(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    init_tracing_from_env();

    info!("Starting {} v{}", SERVICE_NAME, env!("CARGO_PKG_VERSION"));

    let config = load_config()?;
    config.schema.check().context("Invalid table schema")?;

    info!(
        broker = %config.broker.redacted_uri(),
        queue = %config.broker.queue,
        database_host = %config.database.host,
        database = %config.database.dbname,
        table = %config.schema.table,
        mode = ?config.mode,
        "Loaded configuration"
    );

    match config.mode {
        RunMode::Consume => run_consumer(config).await,
        RunMode::Replay => run_replay(config).await,
    }
}

async fn run_consumer(config: Config) -> Result<()> {
    let client = PostgresClient::new(config.database.clone())
        .context("Failed to create PostgreSQL client")?;
    let store = Arc::new(PgRecordStore::new(client.clone(), config.schema.clone()));

    check_health(&config, &client).await;

    if config.database.init_schema {
        if let Err(e) = store.init_schema().await {
            error!("Failed to initialize table: {}", e);
            // Continue anyway - the table may be created by a migration
        }
    } else {
        match store.table_exists().await {
            Ok(true) => {}
            Ok(false) => warn!(table = %config.schema.table, "Target table does not exist"),
            Err(e) => warn!("Could not verify target table: {}", e),
        }
    }

    let shutdown = CancellationToken::new();
    let record_store: Arc<dyn RecordStore> = store.clone();

    let consumer = ConsumerLoop::new(
        AmqpBroker::new(config.broker.clone()),
        record_store,
        MessageDecoder::new(config.schema.clone()),
        DeadLetterRouter::from_config(&config.broker),
        config.consumer.clone(),
    );

    let scheduler = WorkerScheduler::new(WorkerConfig {
        metrics_log_interval: std::time::Duration::from_secs(config.metrics_log_interval_secs),
    });
    let handles = scheduler.start(consumer, shutdown.clone());

    let state = AppState::new(SERVICE_NAME, &config.broker.queue, &config.schema.table);
    let app = router(state);

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .context("Invalid server address")?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;

    info!("Listening on http://{}", addr);

    let server_token = shutdown.clone();
    let server = tokio::spawn(async move {
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(server_token.clone().cancelled_owned())
            .await;
        if let Err(e) = result {
            error!("Server error: {}", e);
            server_token.cancel();
        }
    });

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_token.cancel();
    });

    let grace = config.consumer.shutdown_grace();
    let mut consumer_handle = handles.consumer;

    let joined = tokio::select! {
        joined = &mut consumer_handle => Some(joined),
        _ = shutdown.cancelled() => None,
    };

    info!("Shutting down...");

    let joined = match joined {
        Some(joined) => joined,
        None => match tokio::time::timeout(grace, consumer_handle).await {
            Ok(joined) => joined,
            Err(_) => {
                warn!(grace_secs = grace.as_secs(), "Consumer did not stop in time");
                Ok(Ok(()))
            }
        },
    };

    // The consumer may have ended on its own; stop everything else too.
    shutdown.cancel();
    for task in handles.background {
        task.abort();
    }
    if tokio::time::timeout(grace, server).await.is_err() {
        warn!("HTTP server did not stop in time");
    }
    store.close();

    match joined {
        Ok(Ok(())) => {
            info!("Shutdown complete");
            Ok(())
        }
        Ok(Err(e)) => Err(anyhow::Error::new(e).context("Consumer loop failed")),
        Err(e) if e.is_panic() => {
            error!("Consumer task panicked: {}", e);
            Err(anyhow!("Consumer task panicked: {}", e))
        }
        Err(e) => Err(anyhow!("Consumer task was cancelled: {}", e)),
    }
}

async fn run_replay(config: Config) -> Result<()> {
    let mut broker = AmqpBroker::new(config.broker.clone());
    broker
        .connect()
        .await
        .context("Failed to connect to RabbitMQ")?;

    let result = replay_dead_letters(&mut broker, &config.broker, config.replay.max_retries).await;
    broker.close().await;

    let summary = result.context("Dead-letter replay failed")?;
    info!(
        inspected = summary.inspected,
        replayed = summary.replayed,
        retained = summary.retained,
        "Replay complete"
    );
    Ok(())
}

/// Load configuration from files and environment.
fn load_config() -> Result<Config> {
    let config = config::Config::builder()
        // Start with defaults
        .add_source(config::Config::try_from(&Config::default())?)
        // Load from config file if exists
        .add_source(
            config::File::with_name("config/default")
                .required(false)
                .format(config::FileFormat::Toml),
        )
        // Override with environment variables
        .add_source(
            config::Environment::default()
                .separator("__")
                .prefix("PIPELINE")
                .try_parsing(true),
        )
        .build()
        .context("Failed to build configuration")?;

    let mut config: Config = config
        .try_deserialize()
        .context("Failed to deserialize configuration")?;

    apply_legacy_env(&mut config, |name| std::env::var(name).ok())?;

    Ok(config)
}

/// Flat variable names used by existing deployments.
fn apply_legacy_env(config: &mut Config, var: impl Fn(&str) -> Option<String>) -> Result<()> {
    if let Some(host) = var("RABBITMQ_HOST") {
        config.broker.host = host;
    }
    if let Some(user) = var("RABBITMQ_USER") {
        config.broker.username = user;
    }
    if let Some(pass) = var("RABBITMQ_PASS") {
        config.broker.password = pass;
    }
    if let Some(exchange) = var("RABBITMQ_EXCHANGE") {
        config.broker.exchange = exchange;
    }
    if let Some(exchange) = var("RABBITMQ_DL_EXCHANGE") {
        config.broker.dead_letter_exchange = exchange;
    }
    if let Some(queue) = var("RABBITMQ_DL_QUEUE") {
        config.broker.dead_letter_queue = queue;
    }
    if let Some(queue) = var("POSTGRES_QUEUE") {
        config.broker.queue = queue;
    }

    if let Some(host) = var("POSTGRES_HOST") {
        config.database.host = host;
    }
    if let Some(db) = var("POSTGRES_DB") {
        config.database.dbname = db;
    }
    if let Some(user) = var("POSTGRES_USER") {
        config.database.user = user;
    }
    if let Some(password) = var("POSTGRES_PASSWORD") {
        config.database.password = Some(password);
    }
    if let Some(table) = var("POSTGRES_TABLE") {
        config.schema.table = table;
    }

    if let Some(port) = var("APP_PORT") {
        config.port = port.trim().parse().context("APP_PORT must be a port number")?;
    }
    if let Some(retries) = var("MAX_RETRIES") {
        config.replay.max_retries = retries
            .trim()
            .parse()
            .context("MAX_RETRIES must be an integer")?;
    }

    Ok(())
}

/// Check component health on startup.
async fn check_health(config: &Config, client: &PostgresClient) {
    if broker::health::check_connection(&config.broker).await {
        info!("RabbitMQ connection: healthy");
    } else {
        error!("RabbitMQ connection: unhealthy");
    }

    if postgres_store::health::check_connection(client).await {
        info!("PostgreSQL connection: healthy");
    } else {
        error!("PostgreSQL connection: unhealthy");
    }
}

/// Graceful shutdown signal handler.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received terminate signal");
        }
    }
}
