//! Consumer-group consumer with per-topic handlers.
//!
//! # Delivery semantics
//!
//! **At-most-once.** Every received record is marked as consumed after its
//! handler returns, whether the handler succeeded or not. A failed handler is
//! logged and never retried, and there is no dead-letter routing. Handlers
//! that cannot afford to lose a record must persist it themselves before
//! returning.
//!
//! # Lifecycle
//!
//! ```text
//!   start(ctx)
//!     ├─ ensure every registered topic exists
//!     ├─ spawn supervisor:  loop { join group → session → reset readiness }
//!     │                     until ctx is done or the client is closed
//!     ├─ wait for readiness (at most READINESS_TIMEOUT)
//!     └─ block on the supervisor's error channel
//! ```
//!
//! `start` does not return successfully while the consumer runs; spawn it if
//! the caller has other work to do. Cancel the context passed to `start` to
//! stop consuming, then call [`Consumer::close`].

use crate::admin::KafkaAdmin;
use crate::group::KafkaGroupClient;
use crate::provisioner::TopicProvisioner;
use crate::KafkaConfig;
use relay_core::messaging::{
    AdminError, Claim, ClusterAdmin, GroupClient, GroupError, GroupSession, InboundMessage, SessionHandler,
    TopicSpec,
};
use relay_core::{BoxFuture, Context};
use relay_runtime::metrics::{CONSUMER_HANDLER_ERRORS, CONSUMER_PROCESSED};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

/// How long [`Consumer::start`] waits for the first session.
pub const READINESS_TIMEOUT: Duration = Duration::from_secs(10);

/// Pause before rejoining after a failed session.
pub const REJOIN_BACKOFF: Duration = Duration::from_secs(1);

/// Capacity of the supervisor's error channel.
const ERROR_BUFFER: usize = 8;

/// Handles the records of one topic.
pub type MessageHandler = Arc<dyn Fn(InboundMessage) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Build a [`MessageHandler`] from an async closure.
pub fn handle_fn<F, Fut>(f: F) -> MessageHandler
where
    F: Fn(InboundMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |message| -> BoxFuture<'static, anyhow::Result<()>> { Box::pin(f(message)) })
}

/// Errors from the consumer.
#[derive(Error, Debug)]
pub enum ConsumerError {
    /// No consumer group id was configured.
    #[error("consumer group id is empty")]
    EmptyGroupId,

    /// The client could not be created.
    #[error("Failed to connect consumer: {0}")]
    Connection(String),

    /// No session was established within [`READINESS_TIMEOUT`].
    #[error("consumer was not ready within {0:?}")]
    ReadinessTimeout(Duration),

    /// The context passed to `start` was cancelled or reached its deadline.
    #[error("consumer context cancelled")]
    Cancelled,

    /// The registered topics could not be provisioned.
    #[error(transparent)]
    Provision(#[from] AdminError),

    /// A group session failed.
    #[error(transparent)]
    Group(#[from] GroupError),
}

type Handlers = Arc<RwLock<HashMap<String, MessageHandler>>>;

/// Consumes registered topics as a member of a consumer group.
pub struct Consumer {
    group_id: String,
    client: Arc<dyn GroupClient>,
    provisioner: TopicProvisioner,
    handlers: Handlers,
    ready: Arc<watch::Sender<bool>>,
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("group_id", &self.group_id)
            .field("topics", &self.topics())
            .finish_non_exhaustive()
    }
}

impl Consumer {
    /// Connect to the cluster described by `config`.
    ///
    /// # Errors
    ///
    /// Returns [`ConsumerError::EmptyGroupId`] before contacting the cluster
    /// if no group id is configured, and [`ConsumerError::Connection`] if a
    /// client cannot be created.
    pub fn connect(config: &KafkaConfig) -> Result<Self, ConsumerError> {
        if config.consumer_group.is_empty() {
            return Err(ConsumerError::EmptyGroupId);
        }

        let admin = KafkaAdmin::new(config).map_err(|e| ConsumerError::Connection(e.to_string()))?;
        let client = KafkaGroupClient::new(config).map_err(|e| ConsumerError::Connection(e.to_string()))?;

        Self::with_parts(
            config.consumer_group.clone(),
            Arc::new(client),
            Arc::new(admin),
            config.topic_spec(),
        )
    }

    /// Assemble a consumer from its parts.
    ///
    /// # Errors
    ///
    /// Returns [`ConsumerError::EmptyGroupId`] if `group_id` is empty.
    pub fn with_parts(
        group_id: impl Into<String>,
        client: Arc<dyn GroupClient>,
        admin: Arc<dyn ClusterAdmin>,
        spec: TopicSpec,
    ) -> Result<Self, ConsumerError> {
        let group_id = group_id.into();
        if group_id.is_empty() {
            return Err(ConsumerError::EmptyGroupId);
        }

        let (ready, _) = watch::channel(false);
        Ok(Self {
            group_id,
            client,
            provisioner: TopicProvisioner::new(admin, spec),
            handlers: Arc::new(RwLock::new(HashMap::new())),
            ready: Arc::new(ready),
        })
    }

    /// Route records of `topic` to `handler`, replacing any previous handler.
    ///
    /// Topics registered after [`start`](Self::start) are not subscribed.
    pub fn register(&self, topic: impl Into<String>, handler: MessageHandler) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(topic.into(), handler);
    }

    /// Registered topics, sorted.
    #[must_use]
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        topics.sort();
        topics
    }

    /// The consumer group id.
    #[must_use]
    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    /// Run the consumer until it terminates.
    ///
    /// # Errors
    ///
    /// - [`ConsumerError::Provision`] if the registered topics cannot be created
    /// - [`ConsumerError::ReadinessTimeout`] if no session starts in time
    /// - [`ConsumerError::Cancelled`] once `ctx` is cancelled or past its deadline
    /// - [`ConsumerError::Group`] for the first session failure reported
    pub async fn start(&self, ctx: &Context) -> Result<(), ConsumerError> {
        let topics = self.topics();
        self.provisioner.ensure_exists(&topics).await?;

        let cancel = ctx.token().child_token();
        let deadline_watch = {
            let ctx = ctx.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                ctx.done().await;
                cancel.cancel();
            })
        };

        self.ready.send_replace(false);
        let mut ready = self.ready.subscribe();
        let (errors_tx, mut errors) = mpsc::channel(ERROR_BUFFER);

        let supervisor = Supervisor {
            client: Arc::clone(&self.client),
            topics: topics.clone(),
            dispatcher: Arc::new(Dispatcher {
                handlers: Arc::clone(&self.handlers),
                ready: Arc::clone(&self.ready),
            }),
            cancel: cancel.clone(),
            errors: errors_tx,
        };
        tokio::spawn(async move {
            supervisor.run().await;
            deadline_watch.abort();
        });

        tokio::select! {
            became_ready = tokio::time::timeout(READINESS_TIMEOUT, wait_ready(&mut ready)) => {
                match became_ready {
                    Ok(true) => tracing::info!(group = %self.group_id, topics = ?topics, "Consumer up and running"),
                    Ok(false) => return Err(ConsumerError::Cancelled),
                    Err(_) => {
                        cancel.cancel();
                        return Err(ConsumerError::ReadinessTimeout(READINESS_TIMEOUT));
                    }
                }
            }
            Some(err) = errors.recv() => {
                cancel.cancel();
                return Err(err);
            }
        }

        match errors.recv().await {
            Some(err) => {
                cancel.cancel();
                Err(err)
            }
            None => Ok(()),
        }
    }

    /// Leave the group and release the admin connection.
    ///
    /// Does not interrupt a running session; cancel the context passed to
    /// [`start`](Self::start) for that.
    ///
    /// # Errors
    ///
    /// Returns the first failure from releasing the clients.
    pub async fn close(&self) -> Result<(), ConsumerError> {
        self.client.close()?;
        self.provisioner.admin().close().await?;
        tracing::info!(group = %self.group_id, "Consumer closed");
        Ok(())
    }
}

async fn wait_ready(ready: &mut watch::Receiver<bool>) -> bool {
    ready.wait_for(|ready| *ready).await.is_ok()
}

struct Supervisor {
    client: Arc<dyn GroupClient>,
    topics: Vec<String>,
    dispatcher: Arc<Dispatcher>,
    cancel: CancellationToken,
    errors: mpsc::Sender<ConsumerError>,
}

impl Supervisor {
    async fn run(self) {
        loop {
            let handler: Arc<dyn SessionHandler> = self.dispatcher.clone();
            let outcome = self.client.consume(&self.topics, handler, self.cancel.clone()).await;

            if let Err(err) = outcome {
                let terminal = matches!(err, GroupError::Closed);
                tracing::error!(error = %err, "Consumer group session failed");
                self.report(ConsumerError::Group(err));
                if terminal {
                    break;
                }
                tokio::select! {
                    () = self.cancel.cancelled() => {}
                    () = tokio::time::sleep(REJOIN_BACKOFF) => {}
                }
            }

            if self.cancel.is_cancelled() {
                self.report(ConsumerError::Cancelled);
                break;
            }
            if self.errors.is_closed() {
                tracing::debug!("Nobody is waiting on the consumer, stopping");
                self.cancel.cancel();
                break;
            }

            self.dispatcher.ready.send_replace(false);
            tracing::debug!("Consumer group session ended, rejoining");
        }
    }

    fn report(&self, err: ConsumerError) {
        if let Err(mpsc::error::TrySendError::Full(err)) = self.errors.try_send(err) {
            tracing::warn!(error = %err, "Consumer error channel is full, dropping error");
        }
    }
}

struct Dispatcher {
    handlers: Handlers,
    ready: Arc<watch::Sender<bool>>,
}

impl Dispatcher {
    async fn dispatch(&self, message: &InboundMessage) {
        let handler = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&message.topic)
            .cloned();
        let Some(handler) = handler else {
            return;
        };

        match handler(message.clone()).await {
            Ok(()) => {
                metrics::counter!(CONSUMER_PROCESSED, "topic" => message.topic.clone()).increment(1);
            }
            Err(err) => {
                tracing::error!(
                    topic = %message.topic,
                    partition = message.partition,
                    offset = message.offset,
                    error = %err,
                    "Error handling message"
                );
                metrics::counter!(CONSUMER_HANDLER_ERRORS, "topic" => message.topic.clone()).increment(1);
            }
        }
    }
}

impl SessionHandler for Dispatcher {
    fn setup(&self, session: &dyn GroupSession) -> Result<(), GroupError> {
        tracing::debug!(member_id = session.member_id(), "Consumer group session started");
        self.ready.send_replace(true);
        Ok(())
    }

    fn cleanup(&self, _session: &dyn GroupSession) -> Result<(), GroupError> {
        Ok(())
    }

    fn consume_claim<'a>(
        &'a self,
        session: &'a dyn GroupSession,
        mut claim: Claim,
    ) -> BoxFuture<'a, Result<(), GroupError>> {
        Box::pin(async move {
            loop {
                tokio::select! {
                    () = session.token().cancelled() => return Ok(()),
                    received = claim.messages.recv() => {
                        let Some(message) = received else {
                            tracing::debug!(topic = %claim.topic, partition = claim.partition, "Message channel was closed");
                            return Ok(());
                        };
                        self.dispatch(&message).await;
                        session.mark_message(&message);
                    }
                }
            }
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::Producer;
    use relay_core::messaging::{OutboundMessage, ProducerTransport};
    use relay_testing::InMemoryBroker;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn consumer(broker: &InMemoryBroker) -> Arc<Consumer> {
        let shared = Arc::new(broker.clone());
        Arc::new(Consumer::with_parts("books", shared.clone(), shared, TopicSpec::for_brokers(1, 1)).unwrap())
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[test]
    fn empty_group_id_is_rejected_before_connecting() {
        let broker = InMemoryBroker::new();
        let shared = Arc::new(broker.clone());
        let err = Consumer::with_parts("", shared.clone(), shared, TopicSpec::for_brokers(1, 1)).unwrap_err();
        assert!(matches!(err, ConsumerError::EmptyGroupId));

        let config = KafkaConfig::default();
        assert!(matches!(Consumer::connect(&config), Err(ConsumerError::EmptyGroupId)));
        assert_eq!(broker.sessions(), 0);
    }

    #[tokio::test]
    async fn failing_handler_does_not_block_offset_commit() {
        let broker = InMemoryBroker::new();
        let consumer = consumer(&broker);
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        consumer.register(
            "book.created",
            handle_fn(move |message| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    if message.offset == 0 {
                        anyhow::bail!("cannot handle first record");
                    }
                    Ok(())
                }
            }),
        );

        let ctx = Context::background();
        let runner = {
            let consumer = Arc::clone(&consumer);
            let ctx = ctx.clone();
            tokio::spawn(async move { consumer.start(&ctx).await })
        };

        wait_until(|| broker.sessions() == 1).await;
        broker.enqueue(OutboundMessage::new("1", "book.created", b"a".to_vec())).unwrap();
        broker.enqueue(OutboundMessage::new("1", "book.created", b"b".to_vec())).unwrap();

        wait_until(|| broker.committed_offset("book.created", 0) == Some(2)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 2);

        ctx.cancel();
        assert!(matches!(runner.await.unwrap(), Err(ConsumerError::Cancelled)));
    }

    async fn produce_and_consume(handler_fails: bool) {
        relay_testing::init_test_tracing();
        let broker = InMemoryBroker::new();
        let shared = Arc::new(broker.clone());
        let producer = Producer::with_parts(
            shared.clone(),
            broker.take_acknowledgements().unwrap(),
            shared,
            TopicSpec::for_brokers(1, 1),
        );
        let consumer = consumer(&broker);

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        consumer.register(
            "orders",
            handle_fn(move |message| {
                let sink = Arc::clone(&sink);
                async move {
                    sink.lock().unwrap().push(message);
                    if handler_fails {
                        anyhow::bail!("order rejected");
                    }
                    Ok(())
                }
            }),
        );

        let ctx = Context::background();
        let runner = {
            let consumer = Arc::clone(&consumer);
            let ctx = ctx.clone();
            tokio::spawn(async move { consumer.start(&ctx).await })
        };
        wait_until(|| broker.sessions() == 1).await;

        let headers = HashMap::from([("trace".to_string(), "abc".to_string())]);
        producer.send_message("k1", "orders", vec![0x01, 0x02], headers).await.unwrap();

        wait_until(|| broker.committed_offset("orders", 0) == Some(1)).await;
        {
            let received = received.lock().unwrap();
            assert_eq!(received.len(), 1);
            assert_eq!(received[0].key, "k1");
            assert_eq!(received[0].topic, "orders");
            assert_eq!(received[0].value, vec![0x01, 0x02]);
            assert_eq!(received[0].headers.get("trace").map(String::as_str), Some("abc"));
            assert_eq!(received[0].offset, 0);
        }

        ctx.cancel();
        assert!(matches!(runner.await.unwrap(), Err(ConsumerError::Cancelled)));
    }

    #[tokio::test]
    async fn produced_record_reaches_handler_and_is_committed() {
        produce_and_consume(false).await;
    }

    #[tokio::test]
    async fn produced_record_is_committed_even_when_handler_fails() {
        produce_and_consume(true).await;
    }

    #[tokio::test(start_paused = true)]
    async fn slow_join_times_out_and_cancels_the_session() {
        let broker = InMemoryBroker::new();
        broker.delay_next_setup(Duration::from_secs(60));
        let consumer = consumer(&broker);
        consumer.register("book.created", handle_fn(|_| async { anyhow::Ok(()) }));

        let started = tokio::time::Instant::now();
        let err = consumer.start(&Context::background()).await.unwrap_err();

        assert!(matches!(err, ConsumerError::ReadinessTimeout(timeout) if timeout == READINESS_TIMEOUT));
        assert!(started.elapsed() >= READINESS_TIMEOUT);
        assert!(started.elapsed() < Duration::from_secs(60));
        assert!(broker.session_token().unwrap().is_cancelled());
        assert_eq!(broker.sessions(), 1);
    }

    #[tokio::test]
    async fn start_provisions_registered_topics() {
        let broker = InMemoryBroker::new();
        let consumer = consumer(&broker);
        consumer.register("a", handle_fn(|_| async { anyhow::Ok(()) }));
        consumer.register("b", handle_fn(|_| async { anyhow::Ok(()) }));

        let ctx = Context::background();
        let runner = {
            let consumer = Arc::clone(&consumer);
            let ctx = ctx.clone();
            tokio::spawn(async move { consumer.start(&ctx).await })
        };

        wait_until(|| broker.sessions() == 1).await;
        assert_eq!(broker.create_count("a"), 1);
        assert_eq!(broker.create_count("b"), 1);

        ctx.cancel();
        let _ = runner.await.unwrap();
    }

    #[tokio::test]
    async fn records_without_handler_are_still_marked() {
        let broker = InMemoryBroker::new();
        let consumer = consumer(&broker);
        consumer.register("book.created", handle_fn(|_| async { anyhow::Ok(()) }));

        let ctx = Context::background();
        let runner = {
            let consumer = Arc::clone(&consumer);
            let ctx = ctx.clone();
            tokio::spawn(async move { consumer.start(&ctx).await })
        };
        wait_until(|| broker.sessions() == 1).await;

        consumer.handlers.write().unwrap().clear();
        broker.enqueue(OutboundMessage::new("k", "book.created", vec![1])).unwrap();
        wait_until(|| broker.committed_offset("book.created", 0) == Some(1)).await;

        ctx.cancel();
        let _ = runner.await.unwrap();
    }

    #[tokio::test]
    async fn session_is_rejoined_after_rebalance() {
        let broker = InMemoryBroker::new();
        let consumer = consumer(&broker);
        consumer.register("book.created", handle_fn(|_| async { anyhow::Ok(()) }));

        let ctx = Context::background();
        let runner = {
            let consumer = Arc::clone(&consumer);
            let ctx = ctx.clone();
            tokio::spawn(async move { consumer.start(&ctx).await })
        };
        wait_until(|| broker.sessions() == 1).await;

        broker.rebalance();
        wait_until(|| broker.sessions() == 2).await;

        broker.enqueue(OutboundMessage::new("k", "book.created", vec![1])).unwrap();
        wait_until(|| broker.committed_offset("book.created", 0) == Some(1)).await;

        ctx.cancel();
        assert!(matches!(runner.await.unwrap(), Err(ConsumerError::Cancelled)));
    }

    #[tokio::test]
    async fn join_failure_before_readiness_is_returned() {
        let broker = InMemoryBroker::new();
        broker.fail_next_join("broker unreachable");
        let consumer = consumer(&broker);
        consumer.register("book.created", handle_fn(|_| async { anyhow::Ok(()) }));

        let err = consumer.start(&Context::background()).await.unwrap_err();

        assert!(matches!(err, ConsumerError::Group(GroupError::Connection(_))));
    }

    #[tokio::test]
    async fn expired_context_stops_the_consumer() {
        let broker = InMemoryBroker::new();
        let consumer = consumer(&broker);
        consumer.register("book.created", handle_fn(|_| async { anyhow::Ok(()) }));

        let ctx = Context::background().with_timeout(Duration::from_millis(100));
        let err = consumer.start(&ctx).await.unwrap_err();

        assert!(matches!(err, ConsumerError::Cancelled));
        assert_eq!(broker.sessions(), 1);
    }

    #[tokio::test]
    async fn close_releases_both_clients() {
        let broker = InMemoryBroker::new();
        let consumer = consumer(&broker);

        consumer.close().await.unwrap();

        assert_eq!(broker.group_closes(), 1);
        assert_eq!(broker.admin_closes(), 1);
    }
}
