//! Test fixtures and payload generators.

use broker::{BrokerConfig, DeadLetterRouter};
use engine_core::{ColumnSpec, FieldKind, MessageDecoder, TableSchema};
use postgres_store::RecordStore;
use std::sync::Arc;
use worker::{ConsumerConfig, ConsumerLoop};

use crate::mocks::{MockBroker, MockStore};

/// Schema with a text key and an integer value, the default layout.
pub fn test_schema() -> TableSchema {
    TableSchema {
        table: "records".into(),
        key_column: "id".into(),
        columns: vec![
            ColumnSpec::new("id", FieldKind::Text, true),
            ColumnSpec::new("value", FieldKind::Integer, true),
            ColumnSpec::new("note", FieldKind::Text, false),
        ],
    }
}

/// Well-formed payload for [`test_schema`].
pub fn record_payload(id: &str, value: i64) -> Vec<u8> {
    serde_json::json!({ "id": id, "value": value })
        .to_string()
        .into_bytes()
}

/// Payload missing the natural key.
pub fn keyless_payload(value: i64) -> Vec<u8> {
    serde_json::json!({ "value": value }).to_string().into_bytes()
}

/// Consumer config with pauses short enough for tests.
pub fn fast_consumer_config() -> ConsumerConfig {
    ConsumerConfig {
        backoff_ms: 10,
        shutdown_grace_secs: 1,
    }
}

/// Consumer loop wired to the given mocks with default routing.
pub fn consumer_loop(broker: &MockBroker, store: &MockStore) -> ConsumerLoop<MockBroker> {
    let config = BrokerConfig::default();
    let store: Arc<dyn RecordStore> = Arc::new(store.clone());
    ConsumerLoop::new(
        broker.clone(),
        store,
        MessageDecoder::new(test_schema()),
        DeadLetterRouter::from_config(&config),
        fast_consumer_config(),
    )
}
