//! PostgreSQL persistence against a real server.
//!
//! Tests that need Docker run with `--features integration-tests`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use broker::{BrokerConfig, DeadLetterRouter};
use engine_core::{DecodedRecord, MessageDecoder, PersistenceOutcome, TableSchema};
use integration_tests::containers::TestContainers;
use integration_tests::fixtures::{fast_consumer_config, keyless_payload, record_payload, test_schema};
use integration_tests::mocks::MockBroker;
use integration_tests::setup::{wait_until, wait_until_async};
use postgres_store::{DatabaseConfig, PgRecordStore, PostgresClient, RecordStore};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use worker::ConsumerLoop;

const READY: Duration = Duration::from_secs(30);

fn schema_for(table: &str) -> TableSchema {
    TableSchema {
        table: table.to_string(),
        ..test_schema()
    }
}

fn decode(schema: &TableSchema, payload: &[u8]) -> DecodedRecord {
    MessageDecoder::new(schema.clone())
        .decode(payload)
        .expect("payload should decode")
}

/// Store over a fresh table, once the server accepts connections.
async fn ready_store(database: &DatabaseConfig, table: &str) -> PgRecordStore {
    let client = PostgresClient::new(database.clone()).expect("Failed to create client");
    let store = PgRecordStore::new(client, schema_for(table));
    assert!(
        wait_until_async(READY, || store.ping()).await,
        "PostgreSQL did not become ready"
    );
    store
}

async fn count_rows(store: &PgRecordStore, table: &str) -> i64 {
    let client = store.client().pool().get().await.unwrap();
    let row = client
        .query_one(&format!("SELECT COUNT(*) FROM \"{}\"", table), &[])
        .await
        .unwrap();
    row.get(0)
}

#[tokio::test]
#[cfg_attr(not(feature = "integration-tests"), ignore)]
async fn test_init_schema_creates_table() {
    let containers = TestContainers::start().await;
    let store = ready_store(&containers.database, "records_init").await;

    store.init_schema().await.unwrap();
    assert!(store.table_exists().await.unwrap());

    // Second run is a no-op.
    store.init_schema().await.unwrap();
    assert_eq!(count_rows(&store, "records_init").await, 0);
}

#[tokio::test]
#[cfg_attr(not(feature = "integration-tests"), ignore)]
async fn test_table_exists_is_false_before_init() {
    let containers = TestContainers::start().await;
    let store = ready_store(&containers.database, "records_missing").await;

    assert!(!store.table_exists().await.unwrap());
}

#[tokio::test]
#[cfg_attr(not(feature = "integration-tests"), ignore)]
async fn test_persist_commits_once_per_key() {
    let containers = TestContainers::start().await;
    let table = "records_dedup";
    let store = ready_store(&containers.database, table).await;
    store.init_schema().await.unwrap();

    let record = decode(store.schema(), &record_payload("abc", 42));

    assert_eq!(store.persist(&record).await, PersistenceOutcome::Committed);
    assert_eq!(store.persist(&record).await, PersistenceOutcome::Committed);
    assert_eq!(count_rows(&store, table).await, 1);

    let client = store.client().pool().get().await.unwrap();
    let row = client
        .query_one(
            &format!("SELECT value, note FROM \"{}\" WHERE id = $1", table),
            &[&"abc"],
        )
        .await
        .unwrap();
    let value: i64 = row.get(0);
    let note: Option<String> = row.get(1);
    assert_eq!(value, 42);
    assert_eq!(note, None);
}

#[tokio::test]
#[cfg_attr(not(feature = "integration-tests"), ignore)]
async fn test_constraint_violation_is_rejected() {
    let containers = TestContainers::start().await;
    let table = "records_checked";
    let store = ready_store(&containers.database, table).await;

    let client = store.client().pool().get().await.unwrap();
    client
        .batch_execute(&format!(
            "CREATE TABLE \"{}\" (id TEXT PRIMARY KEY, value BIGINT NOT NULL CHECK (value >= 0), note TEXT)",
            table
        ))
        .await
        .unwrap();
    drop(client);

    let record = decode(store.schema(), &record_payload("neg", -1));
    match store.persist(&record).await {
        PersistenceOutcome::Rejected(reason) => {
            assert!(reason.contains("23514"), "reason should carry SQLSTATE: {}", reason)
        }
        other => panic!("expected Rejected, got {:?}", other),
    }
    assert_eq!(count_rows(&store, table).await, 0);

    // The connection went back to the pool in a usable state.
    let good = decode(store.schema(), &record_payload("pos", 1));
    assert_eq!(store.persist(&good).await, PersistenceOutcome::Committed);
}

#[tokio::test]
#[cfg_attr(not(feature = "integration-tests"), ignore)]
async fn test_missing_table_is_rejected() {
    let containers = TestContainers::start().await;
    let store = ready_store(&containers.database, "records_never_created").await;

    let record = decode(store.schema(), &record_payload("abc", 1));
    assert!(matches!(
        store.persist(&record).await,
        PersistenceOutcome::Rejected(_)
    ));
}

#[tokio::test]
#[cfg_attr(not(feature = "integration-tests"), ignore)]
async fn test_consumer_loop_writes_through_to_postgres() {
    let containers = TestContainers::start().await;
    let table = "records_pipeline";
    let store = ready_store(&containers.database, table).await;
    store.init_schema().await.unwrap();

    let broker = MockBroker::new();
    broker.push(record_payload("a", 1));
    broker.push(record_payload("a", 1));
    broker.push(keyless_payload(2));
    broker.push(record_payload("b", 3));

    let config = BrokerConfig::default();
    let shared: Arc<dyn RecordStore> = Arc::new(store.clone());
    let mut consumer = ConsumerLoop::new(
        broker.clone(),
        shared,
        MessageDecoder::new(store.schema().clone()),
        DeadLetterRouter::from_config(&config),
        fast_consumer_config(),
    );
    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    let handle = tokio::spawn(async move { consumer.run(token).await });

    assert!(wait_until(Duration::from_secs(10), || broker.acked_count() == 4).await);
    shutdown.cancel();
    handle.await.unwrap().unwrap();

    assert_eq!(count_rows(&store, table).await, 2);
    assert_eq!(broker.queue_len(&config.dead_letter_queue), 1);
}

#[tokio::test]
async fn test_unreachable_server_is_unavailable() {
    let database = DatabaseConfig {
        host: "127.0.0.1".to_string(),
        port: 1,
        acquire_timeout_secs: 1,
        statement_timeout_secs: 2,
        ..DatabaseConfig::default()
    };
    let client = PostgresClient::new(database).unwrap();
    let store = PgRecordStore::new(client, test_schema());

    let record = decode(store.schema(), &record_payload("abc", 42));

    assert_eq!(
        store.persist(&record).await,
        PersistenceOutcome::ConnectionUnavailable
    );
    assert!(!store.ping().await);
    assert!(!store.is_connected());
}

/// Accepts TCP connections and never answers the startup handshake.
async fn silent_server() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let mut open = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            open.push(socket);
        }
    });
    port
}

fn silent_config(port: u16, acquire_timeout_secs: u64, statement_timeout_secs: u64) -> DatabaseConfig {
    DatabaseConfig {
        host: "127.0.0.1".to_string(),
        port,
        pool_size: 1,
        acquire_timeout_secs,
        statement_timeout_secs,
        ..DatabaseConfig::default()
    }
}

#[tokio::test]
async fn test_stalled_server_hits_attempt_timeout() {
    let port = silent_server().await;
    // The attempt bound fires before the pool gives up on connecting.
    let client = PostgresClient::new(silent_config(port, 30, 1)).unwrap();
    let store = PgRecordStore::new(client, test_schema());
    let record = decode(store.schema(), &record_payload("abc", 42));

    let started = Instant::now();
    let outcome = store.persist(&record).await;

    assert_eq!(outcome, PersistenceOutcome::ConnectionUnavailable);
    assert!(
        started.elapsed() < Duration::from_secs(5),
        "persist took {:?}",
        started.elapsed()
    );
}

#[tokio::test]
async fn test_stalled_server_hits_pool_timeout() {
    let port = silent_server().await;
    let client = PostgresClient::new(silent_config(port, 1, 30)).unwrap();
    let store = PgRecordStore::new(client, test_schema());
    let record = decode(store.schema(), &record_payload("abc", 42));

    let started = Instant::now();
    let outcome = store.persist(&record).await;

    assert_eq!(outcome, PersistenceOutcome::ConnectionUnavailable);
    assert!(
        started.elapsed() < Duration::from_secs(5),
        "persist took {:?}",
        started.elapsed()
    );

    // The pool is not left wedged; the next attempt is bounded the same way.
    let started = Instant::now();
    assert_eq!(
        store.persist(&record).await,
        PersistenceOutcome::ConnectionUnavailable
    );
    assert!(started.elapsed() < Duration::from_secs(5));
}
