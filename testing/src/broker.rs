//! In-memory broker.
//!
//! [`InMemoryBroker`] implements the three broker seams of `relay-core`
//! ([`ClusterAdmin`], [`ProducerTransport`], [`GroupClient`]) over shared
//! in-process state, so producer and consumer logic can be tested end to end
//! without a cluster.
//!
//! - Records are partitioned by key hash and get consecutive offsets per partition.
//! - Deliveries are acknowledged immediately on the acknowledgement channels.
//! - One consumer group: a session delivers every partition of the subscribed
//!   topics from the committed offset (or the start) and commits `offset + 1`
//!   when a record is marked.
//! - Failure injection: full queues, failed deliveries, failed listings,
//!   concurrent topic creation, failed joins, slow close, forced rebalance.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Locks are never poisoned outside of failing tests

use futures::future::join_all;
use relay_core::BoxFuture;
use relay_core::messaging::{
    AckSenders, Acknowledgements, AdminError, Claim, ClusterAdmin, Delivery, DeliveryFailure,
    EnqueueError, GroupClient, GroupError, GroupSession, InboundMessage, OutboundMessage,
    ProducerTransport, SessionHandler, TopicSpec, ack_channels,
};
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

type PartitionKey = (String, i32);

#[derive(Default)]
struct State {
    topics: HashMap<String, TopicSpec>,
    create_requests: Vec<(String, TopicSpec)>,
    concurrently_created: HashSet<String>,
    logs: HashMap<PartitionKey, Vec<InboundMessage>>,
    committed: HashMap<PartitionKey, i64>,
    failing_topics: HashSet<String>,
    full_enqueues: usize,
    fail_list: bool,
    join_failures: Vec<String>,
    close_delay: Option<Duration>,
    setup_delay: Option<Duration>,
    acks: Option<AckSenders>,
    transport_closed: bool,
    group_closed: bool,
    session: Option<CancellationToken>,
}

struct Inner {
    state: Mutex<State>,
    appended: watch::Sender<u64>,
    acknowledgements: Mutex<Option<Acknowledgements>>,
    admin_closes: AtomicUsize,
    transport_closes: AtomicUsize,
    group_closes: AtomicUsize,
    sessions: AtomicUsize,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Shared in-memory broker. Clones share state.
#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for InMemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state();
        f.debug_struct("InMemoryBroker")
            .field("topics", &state.topics.keys().collect::<Vec<_>>())
            .field("records", &state.logs.values().map(Vec::len).sum::<usize>())
            .finish_non_exhaustive()
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    /// Create an empty broker.
    #[must_use]
    pub fn new() -> Self {
        let (senders, receivers) = ack_channels();
        let (appended, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    acks: Some(senders),
                    ..State::default()
                }),
                appended,
                acknowledgements: Mutex::new(Some(receivers)),
                admin_closes: AtomicUsize::new(0),
                transport_closes: AtomicUsize::new(0),
                group_closes: AtomicUsize::new(0),
                sessions: AtomicUsize::new(0),
            }),
        }
    }

    /// Take the delivery-report receivers. Returns `None` after the first call.
    #[must_use]
    pub fn take_acknowledgements(&self) -> Option<Acknowledgements> {
        self.inner.acknowledgements.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    /// Register a topic directly, bypassing create-request accounting.
    pub fn add_topic(&self, name: &str, spec: TopicSpec) {
        self.inner.state().topics.insert(name.to_string(), spec);
    }

    /// Names of existing topics.
    #[must_use]
    pub fn topics(&self) -> HashSet<String> {
        self.inner.state().topics.keys().cloned().collect()
    }

    /// Every successful create request, in order.
    #[must_use]
    pub fn create_requests(&self) -> Vec<(String, TopicSpec)> {
        self.inner.state().create_requests.clone()
    }

    /// Number of successful create requests for `topic`.
    #[must_use]
    pub fn create_count(&self, topic: &str) -> usize {
        self.create_requests().iter().filter(|(name, _)| name == topic).count()
    }

    /// All records of `topic`, ordered by partition then offset.
    #[must_use]
    pub fn records(&self, topic: &str) -> Vec<InboundMessage> {
        let state = self.inner.state();
        let mut keys: Vec<&PartitionKey> = state.logs.keys().filter(|(t, _)| t == topic).collect();
        keys.sort();
        keys.into_iter().flat_map(|k| state.logs[k].iter().cloned()).collect()
    }

    /// Next offset to consume for a partition, if anything was committed.
    #[must_use]
    pub fn committed_offset(&self, topic: &str, partition: i32) -> Option<i64> {
        self.inner
            .state()
            .committed
            .get(&(topic.to_string(), partition))
            .copied()
    }

    /// Pretend another client creates `topic` between our list and create calls.
    ///
    /// The topic stays invisible to listing; the next create for it fails with
    /// [`AdminError::TopicAlreadyExists`].
    pub fn simulate_concurrent_create(&self, topic: &str) {
        self.inner
            .state()
            .concurrently_created
            .insert(topic.to_string());
    }

    /// Make listing fail until reset.
    pub fn fail_list(&self, fail: bool) {
        self.inner.state().fail_list = fail;
    }

    /// Report every delivery to `topic` as failed.
    pub fn fail_deliveries_for(&self, topic: &str) {
        self.inner.state().failing_topics.insert(topic.to_string());
    }

    /// Answer the next `count` enqueues with [`EnqueueError::QueueFull`].
    pub fn fill_queue(&self, count: usize) {
        self.inner.state().full_enqueues = count;
    }

    /// Fail the next join with [`GroupError::Connection`].
    pub fn fail_next_join(&self, reason: &str) {
        self.inner.state().join_failures.push(reason.to_string());
    }

    /// Delay closing the transport.
    pub fn set_close_delay(&self, delay: Duration) {
        self.inner.state().close_delay = Some(delay);
    }

    /// Hold the next session for `delay` before its handler is set up.
    pub fn delay_next_setup(&self, delay: Duration) {
        self.inner.state().setup_delay = Some(delay);
    }

    /// Token of the most recent group session.
    #[must_use]
    pub fn session_token(&self) -> Option<CancellationToken> {
        self.inner.state().session.clone()
    }

    /// End the current group session, as a rebalance would.
    pub fn rebalance(&self) {
        if let Some(token) = self.inner.state().session.take() {
            token.cancel();
        }
    }

    /// Number of admin closes.
    #[must_use]
    pub fn admin_closes(&self) -> usize {
        self.inner.admin_closes.load(Ordering::SeqCst)
    }

    /// Number of transport closes.
    #[must_use]
    pub fn transport_closes(&self) -> usize {
        self.inner.transport_closes.load(Ordering::SeqCst)
    }

    /// Number of group-client closes.
    #[must_use]
    pub fn group_closes(&self) -> usize {
        self.inner.group_closes.load(Ordering::SeqCst)
    }

    /// Number of group sessions started.
    #[must_use]
    pub fn sessions(&self) -> usize {
        self.inner.sessions.load(Ordering::SeqCst)
    }

    fn partition_for(key: &str, partitions: i32) -> i32 {
        if key.is_empty() || partitions <= 1 {
            return 0;
        }
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let bucket = hasher.finish() % u64::from(partitions.unsigned_abs());
        i32::try_from(bucket).unwrap_or(0)
    }

    fn append(&self, message: OutboundMessage) -> Result<(), EnqueueError> {
        let mut state = self.inner.state();
        if state.transport_closed {
            return Err(EnqueueError::Rejected {
                topic: message.topic,
                reason: "transport closed".to_string(),
            });
        }
        if state.full_enqueues > 0 {
            state.full_enqueues -= 1;
            return Err(EnqueueError::QueueFull(Box::new(message)));
        }

        if state.failing_topics.contains(&message.topic) {
            if let Some(acks) = &state.acks {
                let _ = acks.errors.send(DeliveryFailure {
                    topic: message.topic,
                    key: message.key,
                    reason: "Broker: injected delivery failure".to_string(),
                });
            }
            return Ok(());
        }

        let partitions = state
            .topics
            .entry(message.topic.clone())
            .or_insert(TopicSpec {
                partition_count: 1,
                replication_factor: 1,
            })
            .partition_count;
        let partition = Self::partition_for(&message.key, partitions);
        let log = state.logs.entry((message.topic.clone(), partition)).or_default();
        let offset = i64::try_from(log.len()).unwrap_or(i64::MAX);
        log.push(InboundMessage {
            key: message.key,
            topic: message.topic.clone(),
            value: message.value,
            headers: message.headers,
            partition,
            offset,
            timestamp: Some(chrono::Utc::now()),
        });

        if let Some(acks) = &state.acks {
            let _ = acks.successes.send(Delivery {
                topic: message.topic,
                partition,
                offset,
            });
        }
        drop(state);
        self.inner.appended.send_modify(|version| *version += 1);
        Ok(())
    }

    fn partitions_of(&self, topics: &[String]) -> Vec<PartitionKey> {
        let state = self.inner.state();
        topics
            .iter()
            .flat_map(|topic| {
                let count = state.topics.get(topic).map_or(1, |spec| spec.partition_count.max(1));
                (0..count).map(move |p| (topic.clone(), p))
            })
            .collect()
    }

    fn pending(&self, key: &PartitionKey, from: i64) -> Vec<InboundMessage> {
        let state = self.inner.state();
        let start = usize::try_from(from).unwrap_or(0);
        state
            .logs
            .get(key)
            .map(|log| log.iter().skip(start).cloned().collect())
            .unwrap_or_default()
    }

    fn spawn_feeder(&self, key: PartitionKey, token: CancellationToken) -> mpsc::Receiver<InboundMessage> {
        let (tx, rx) = mpsc::channel(64);
        let broker = self.clone();
        let mut appended = self.inner.appended.subscribe();
        tokio::spawn(async move {
            let mut next = broker.committed_offset(&key.0, key.1).unwrap_or(0);
            loop {
                let _seen = *appended.borrow_and_update();
                for message in broker.pending(&key, next) {
                    next = message.offset + 1;
                    tokio::select! {
                        sent = tx.send(message) => {
                            if sent.is_err() {
                                return;
                            }
                        }
                        () = token.cancelled() => return,
                    }
                }
                tokio::select! {
                    changed = appended.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                    () = token.cancelled() => return,
                }
            }
        });
        rx
    }
}

impl ClusterAdmin for InMemoryBroker {
    fn list_topics(&self) -> BoxFuture<'_, Result<HashSet<String>, AdminError>> {
        Box::pin(async move {
            let state = self.inner.state();
            if state.fail_list {
                return Err(AdminError::ListFailed("injected metadata failure".to_string()));
            }
            Ok(state.topics.keys().cloned().collect())
        })
    }

    fn create_topic<'a>(&'a self, name: &'a str, spec: TopicSpec) -> BoxFuture<'a, Result<(), AdminError>> {
        Box::pin(async move {
            let mut state = self.inner.state();
            if state.concurrently_created.remove(name) {
                state.topics.insert(name.to_string(), spec);
                return Err(AdminError::TopicAlreadyExists(name.to_string()));
            }
            if state.topics.contains_key(name) {
                return Err(AdminError::TopicAlreadyExists(name.to_string()));
            }
            if spec.partition_count < 1 {
                return Err(AdminError::CreateFailed {
                    topic: name.to_string(),
                    reason: "partition count must be positive".to_string(),
                });
            }
            state.topics.insert(name.to_string(), spec);
            state.create_requests.push((name.to_string(), spec));
            Ok(())
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<(), AdminError>> {
        Box::pin(async move {
            self.inner.admin_closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }
}

impl ProducerTransport for InMemoryBroker {
    fn enqueue(&self, message: OutboundMessage) -> Result<(), EnqueueError> {
        self.append(message)
    }

    fn close(&self) -> BoxFuture<'_, Result<(), EnqueueError>> {
        Box::pin(async move {
            let delay = self.inner.state().close_delay;
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            let mut state = self.inner.state();
            state.transport_closed = true;
            state.acks = None;
            self.inner.transport_closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }
}

struct InMemorySession {
    broker: InMemoryBroker,
    token: CancellationToken,
    member_id: String,
}

impl GroupSession for InMemorySession {
    fn mark_message(&self, message: &InboundMessage) {
        let mut state = self.broker.inner.state();
        let committed = state
            .committed
            .entry((message.topic.clone(), message.partition))
            .or_insert(0);
        *committed = (*committed).max(message.offset + 1);
    }

    fn token(&self) -> &CancellationToken {
        &self.token
    }

    fn member_id(&self) -> &str {
        &self.member_id
    }
}

impl GroupClient for InMemoryBroker {
    fn consume<'a>(
        &'a self,
        topics: &'a [String],
        handler: Arc<dyn SessionHandler>,
        cancel: CancellationToken,
    ) -> BoxFuture<'a, Result<(), GroupError>> {
        Box::pin(async move {
            let (token, setup_delay) = {
                let mut state = self.inner.state();
                if state.group_closed {
                    return Err(GroupError::Closed);
                }
                if !state.join_failures.is_empty() {
                    return Err(GroupError::Connection(state.join_failures.remove(0)));
                }
                let token = cancel.child_token();
                state.session = Some(token.clone());
                (token, state.setup_delay.take())
            };

            let generation = self.inner.sessions.fetch_add(1, Ordering::SeqCst) + 1;
            let session = InMemorySession {
                broker: self.clone(),
                token: token.clone(),
                member_id: format!("in-memory-member-{generation}"),
            };

            if let Some(delay) = setup_delay {
                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    () = token.cancelled() => return Ok(()),
                }
            }

            if let Err(err) = handler.setup(&session) {
                token.cancel();
                return Err(err);
            }

            let claims: Vec<Claim> = self
                .partitions_of(topics)
                .into_iter()
                .map(|key| Claim {
                    messages: self.spawn_feeder(key.clone(), token.clone()),
                    topic: key.0,
                    partition: key.1,
                })
                .collect();

            let results = join_all(claims.into_iter().map(|claim| handler.consume_claim(&session, claim))).await;
            token.cancel();

            let cleanup = handler.cleanup(&session);
            results.into_iter().find_map(Result::err).map_or(cleanup, Err)
        })
    }

    fn close(&self) -> Result<(), GroupError> {
        self.inner.group_closes.fetch_add(1, Ordering::SeqCst);
        let mut state = self.inner.state();
        state.group_closed = true;
        if let Some(token) = state.session.take() {
            token.cancel();
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn spec(partitions: i32) -> TopicSpec {
        TopicSpec {
            partition_count: partitions,
            replication_factor: 1,
        }
    }

    #[tokio::test]
    async fn create_is_idempotent_only_through_the_error() {
        let broker = InMemoryBroker::new();
        broker.create_topic("orders", spec(3)).await.unwrap();
        assert_eq!(
            broker.create_topic("orders", spec(3)).await,
            Err(AdminError::TopicAlreadyExists("orders".into()))
        );
        assert_eq!(broker.create_count("orders"), 1);
    }

    #[tokio::test]
    async fn same_key_lands_in_same_partition_with_consecutive_offsets() {
        let broker = InMemoryBroker::new();
        broker.add_topic("orders", spec(4));
        let mut acks = broker.take_acknowledgements().unwrap();

        for i in 0..3u8 {
            broker.enqueue(OutboundMessage::new("k1", "orders", vec![i])).unwrap();
        }

        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(acks.successes.recv().await.unwrap());
        }
        assert!(seen.windows(2).all(|w| w[0].partition == w[1].partition));
        assert_eq!(seen.iter().map(|d| d.offset).collect::<Vec<_>>(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn full_queue_hands_the_record_back() {
        let broker = InMemoryBroker::new();
        broker.fill_queue(1);
        let msg = OutboundMessage::new("k", "t", vec![1]);

        assert_eq!(broker.enqueue(msg.clone()), Err(EnqueueError::QueueFull(Box::new(msg.clone()))));
        assert!(broker.enqueue(msg).is_ok());
    }

    #[tokio::test]
    async fn closing_the_transport_closes_ack_channels() {
        let broker = InMemoryBroker::new();
        let mut acks = broker.take_acknowledgements().unwrap();
        ProducerTransport::close(&broker).await.unwrap();

        assert!(acks.successes.recv().await.is_none());
        assert!(acks.errors.recv().await.is_none());
        assert!(broker.enqueue(OutboundMessage::new("k", "t", vec![])).is_err());
    }
}
