//! Mock implementations for testing.
//!
//! Both mocks implement the same traits as the real RabbitMQ and PostgreSQL
//! backends, so the consumer loop runs its production code paths against
//! them. Clones share state, which lets a test keep a handle while the loop
//! owns another.

use async_trait::async_trait;
use broker::{MessageBroker, PublishRequest};
use engine_core::{
    ConnectionState, DecodedRecord, DeliveryTag, Error, InboundMessage, PersistenceOutcome,
    Result,
};
use parking_lot::Mutex;
use postgres_store::RecordStore;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

/// Queue the mock broker consumes from, matching the default config.
pub const PRIMARY_QUEUE: &str = "postgres";

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, VecDeque<InboundMessage>>,
    bindings: HashMap<String, String>,
    unacked: BTreeMap<DeliveryTag, (String, InboundMessage)>,
    acked: Vec<InboundMessage>,
    nacked: Vec<(InboundMessage, bool)>,
    published: Vec<PublishRequest>,
    next_tag: DeliveryTag,
    connected: bool,
    subscribed: bool,
    connect_attempts: u32,
    closes: u32,
    failing_connects: u32,
    fail_publish: bool,
    drop_on_next_publish: bool,
    publish_delay: Option<Duration>,
    publish_attempts: u32,
    drop_on_next_receive: bool,
    end_stream_on_next_receive: bool,
}

/// In-memory broker with RabbitMQ-like ack semantics.
///
/// Unacked deliveries go back to the front of their queue, flagged
/// redelivered, when nacked with requeue or when the session closes.
#[derive(Clone, Default)]
pub struct MockBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MockBroker {
    pub fn new() -> Self {
        let broker = Self::default();
        broker.bind("dead_letter_exchange", "dead_letter_queue");
        broker
    }

    /// Routes publishes on `exchange` into `queue`.
    pub fn bind(&self, exchange: &str, queue: &str) {
        self.state
            .lock()
            .bindings
            .insert(exchange.to_string(), queue.to_string());
    }

    /// Enqueues a payload on the primary queue.
    pub fn push(&self, payload: impl Into<Vec<u8>>) {
        self.push_message(
            PRIMARY_QUEUE,
            InboundMessage::new(0, payload).with_routing_key("source_exchange", "source.test"),
        );
    }

    /// Enqueues a prepared message on any queue.
    pub fn push_message(&self, queue: &str, message: InboundMessage) {
        self.state
            .lock()
            .queues
            .entry(queue.to_string())
            .or_default()
            .push_back(message);
    }

    /// Makes the next `n` connect attempts fail.
    pub fn fail_connects(&self, n: u32) {
        self.state.lock().failing_connects = n;
    }

    /// Makes every publish come back negatively confirmed; the session survives.
    pub fn set_fail_publish(&self, fail: bool) {
        self.state.lock().fail_publish = fail;
    }

    /// Severs the session during the next publish, as a channel error would.
    pub fn drop_connection_on_publish(&self) {
        self.state.lock().drop_on_next_publish = true;
    }

    /// Holds every publish for `delay` before it lands.
    pub fn set_publish_delay(&self, delay: Duration) {
        self.state.lock().publish_delay = Some(delay);
    }

    pub fn publish_attempts(&self) -> u32 {
        self.state.lock().publish_attempts
    }

    /// Severs the session on the next receive, as a dropped TCP connection would.
    pub fn drop_connection(&self) {
        self.state.lock().drop_on_next_receive = true;
    }

    /// Ends the delivery stream on the next receive, as a broker-side cancel would.
    pub fn end_stream(&self) {
        self.state.lock().end_stream_on_next_receive = true;
    }

    pub fn acked(&self) -> Vec<InboundMessage> {
        self.state.lock().acked.clone()
    }

    pub fn acked_count(&self) -> usize {
        self.state.lock().acked.len()
    }

    pub fn nacked(&self) -> Vec<(InboundMessage, bool)> {
        self.state.lock().nacked.clone()
    }

    pub fn published(&self) -> Vec<PublishRequest> {
        self.state.lock().published.clone()
    }

    pub fn queue_len(&self, queue: &str) -> usize {
        self.state.lock().queues.get(queue).map_or(0, VecDeque::len)
    }

    pub fn queued(&self, queue: &str) -> Vec<InboundMessage> {
        self.state
            .lock()
            .queues
            .get(queue)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn unacked_count(&self) -> usize {
        self.state.lock().unacked.len()
    }

    pub fn connect_attempts(&self) -> u32 {
        self.state.lock().connect_attempts
    }

    pub fn closes(&self) -> u32 {
        self.state.lock().closes
    }

    pub fn connected(&self) -> bool {
        self.state.lock().connected
    }

    fn require_connected(state: &BrokerState) -> Result<()> {
        if state.connected {
            Ok(())
        } else {
            Err(Error::broker("mock broker not connected"))
        }
    }

    fn deliver(state: &mut BrokerState, queue: &str) -> Option<InboundMessage> {
        let mut message = state.queues.get_mut(queue)?.pop_front()?;
        state.next_tag += 1;
        message.delivery_tag = state.next_tag;
        state
            .unacked
            .insert(message.delivery_tag, (queue.to_string(), message.clone()));
        Some(message)
    }

    fn requeue(state: &mut BrokerState, queue: String, mut message: InboundMessage) {
        message.redelivered = true;
        state.queues.entry(queue).or_default().push_front(message);
    }

    fn return_unacked(state: &mut BrokerState) {
        let unacked = std::mem::take(&mut state.unacked);
        for (queue, message) in unacked.into_values().rev() {
            Self::requeue(state, queue, message);
        }
    }
}

#[async_trait]
impl MessageBroker for MockBroker {
    async fn connect(&mut self) -> Result<()> {
        let mut state = self.state.lock();
        state.connect_attempts += 1;
        if state.failing_connects > 0 {
            state.failing_connects -= 1;
            return Err(Error::broker("mock broker refused connection"));
        }
        state.connected = true;
        Ok(())
    }

    async fn subscribe(&mut self) -> Result<()> {
        let mut state = self.state.lock();
        Self::require_connected(&state)?;
        state.subscribed = true;
        Ok(())
    }

    async fn next_delivery(&mut self) -> Result<Option<InboundMessage>> {
        loop {
            {
                let mut state = self.state.lock();
                if !state.connected || !state.subscribed {
                    return Err(Error::broker("mock broker not consuming"));
                }
                if state.drop_on_next_receive {
                    state.drop_on_next_receive = false;
                    state.connected = false;
                    state.subscribed = false;
                    return Err(Error::broker("connection reset by peer"));
                }
                if state.end_stream_on_next_receive {
                    state.end_stream_on_next_receive = false;
                    state.subscribed = false;
                    return Ok(None);
                }
                if let Some(message) = Self::deliver(&mut state, PRIMARY_QUEUE) {
                    return Ok(Some(message));
                }
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }

    async fn ack(&mut self, tag: DeliveryTag) -> Result<()> {
        let mut state = self.state.lock();
        Self::require_connected(&state)?;
        let (_, message) = state
            .unacked
            .remove(&tag)
            .ok_or_else(|| Error::broker(format!("unknown delivery tag {}", tag)))?;
        state.acked.push(message);
        Ok(())
    }

    async fn nack(&mut self, tag: DeliveryTag, requeue: bool) -> Result<()> {
        let mut state = self.state.lock();
        Self::require_connected(&state)?;
        let (queue, message) = state
            .unacked
            .remove(&tag)
            .ok_or_else(|| Error::broker(format!("unknown delivery tag {}", tag)))?;
        state.nacked.push((message.clone(), requeue));
        if requeue {
            Self::requeue(&mut state, queue, message);
        }
        Ok(())
    }

    async fn publish(&mut self, request: PublishRequest) -> Result<()> {
        let delay = {
            let mut state = self.state.lock();
            Self::require_connected(&state)?;
            state.publish_attempts += 1;
            state.publish_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        Self::require_connected(&state)?;
        if state.drop_on_next_publish {
            state.drop_on_next_publish = false;
            state.connected = false;
            state.subscribed = false;
            return Err(Error::broker("channel closed during publish"));
        }
        if state.fail_publish {
            return Err(Error::broker("mock publish nacked"));
        }

        let target = if request.exchange.is_empty() {
            Some(request.routing_key.clone())
        } else {
            state.bindings.get(&request.exchange).cloned()
        };
        if let Some(queue) = target {
            let mut message = InboundMessage::new(0, request.payload.clone())
                .with_routing_key(request.exchange.clone(), request.routing_key.clone());
            message.headers = request.headers.clone();
            state.queues.entry(queue).or_default().push_back(message);
        }

        state.published.push(request);
        Ok(())
    }

    async fn queue_depth(&mut self, queue: &str) -> Result<u32> {
        let state = self.state.lock();
        Self::require_connected(&state)?;
        Ok(state.queues.get(queue).map_or(0, |q| q.len() as u32))
    }

    async fn get(&mut self, queue: &str) -> Result<Option<InboundMessage>> {
        let mut state = self.state.lock();
        Self::require_connected(&state)?;
        Ok(Self::deliver(&mut state, queue))
    }

    async fn close(&mut self) {
        let mut state = self.state.lock();
        state.connected = false;
        state.subscribed = false;
        state.closes += 1;
        Self::return_unacked(&mut state);
    }

    fn state(&self) -> ConnectionState {
        if self.state.lock().connected {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }
}

#[derive(Default)]
struct StoreState {
    rows: BTreeMap<String, DecodedRecord>,
    unavailable: bool,
    recover_after_pings: Option<u32>,
    rejected_keys: HashSet<String>,
    persist_calls: u32,
    duplicates: u32,
    pings: u32,
}

/// In-memory record store keyed on the natural key.
#[derive(Clone, Default)]
pub struct MockStore {
    state: Arc<Mutex<StoreState>>,
}

impl MockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates the database going down or coming back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().unavailable = unavailable;
    }

    /// Brings the database back once `pings` pings have been answered.
    pub fn recover_after_pings(&self, pings: u32) {
        self.state.lock().recover_after_pings = Some(pings);
    }

    /// Makes inserts for `key` fail as a constraint violation would.
    pub fn reject_key(&self, key: &str) {
        self.state.lock().rejected_keys.insert(key.to_string());
    }

    pub fn row_count(&self) -> usize {
        self.state.lock().rows.len()
    }

    pub fn row(&self, key: &str) -> Option<DecodedRecord> {
        self.state.lock().rows.get(key).cloned()
    }

    pub fn persist_calls(&self) -> u32 {
        self.state.lock().persist_calls
    }

    pub fn duplicates(&self) -> u32 {
        self.state.lock().duplicates
    }

    pub fn pings(&self) -> u32 {
        self.state.lock().pings
    }
}

#[async_trait]
impl RecordStore for MockStore {
    async fn persist(&self, record: &DecodedRecord) -> PersistenceOutcome {
        let mut state = self.state.lock();
        state.persist_calls += 1;

        if state.unavailable {
            return PersistenceOutcome::ConnectionUnavailable;
        }

        let key = record
            .natural_key()
            .map(|k| k.to_string())
            .unwrap_or_default();

        if state.rejected_keys.contains(&key) {
            return PersistenceOutcome::Rejected(format!("check constraint violated for {}", key));
        }

        if state.rows.contains_key(&key) {
            state.duplicates += 1;
        } else {
            state.rows.insert(key, record.clone());
        }
        PersistenceOutcome::Committed
    }

    async fn ping(&self) -> bool {
        let mut state = self.state.lock();
        state.pings += 1;
        if let Some(after) = state.recover_after_pings {
            if state.pings >= after {
                state.unavailable = false;
                state.recover_after_pings = None;
            }
        }
        !state.unavailable
    }

    fn is_connected(&self) -> bool {
        !self.state.lock().unavailable
    }

    fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_broker_requeues_on_close() {
        let mut broker = MockBroker::new();
        broker.push(b"{}".to_vec());
        broker.connect().await.unwrap();
        broker.subscribe().await.unwrap();

        let first = broker.next_delivery().await.unwrap().unwrap();
        assert!(!first.redelivered);
        broker.close().await;

        broker.connect().await.unwrap();
        broker.subscribe().await.unwrap();
        let again = broker.next_delivery().await.unwrap().unwrap();
        assert!(again.redelivered);
        assert_ne!(again.delivery_tag, first.delivery_tag);
    }

    #[tokio::test]
    async fn test_mock_broker_rejects_unknown_tag() {
        let mut broker = MockBroker::new();
        broker.connect().await.unwrap();
        assert!(broker.ack(42).await.is_err());
    }

    #[tokio::test]
    async fn test_mock_store_recovers_after_pings() {
        let store = MockStore::new();
        store.set_unavailable(true);
        store.recover_after_pings(2);

        assert!(!store.ping().await);
        assert!(store.ping().await);
        assert!(store.is_connected());
    }
}
