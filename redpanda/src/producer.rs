//! Asynchronous producer.
//!
//! [`Producer::send_message`] returns once the record is queued, not once it
//! is delivered. Delivery outcomes arrive later on the transport's
//! acknowledgement channels and are drained by two background monitors that
//! log them and record metrics; a failed delivery is never reported back to
//! the caller that queued it.
//!
//! # Backpressure
//!
//! When the transport's queue is full, `send_message` retries every
//! [`QUEUE_FULL_BACKOFF`] until the record is accepted or shutdown begins.
//! Under sustained backpressure a send can wait indefinitely.
//!
//! # Shutdown
//!
//! ```text
//!   shutdown(deadline)
//!     ├─ closed = true          new sends fail with ProducerError::Closed
//!     ├─ stop.cancel()          waiting sends fail with ProducerError::ShuttingDown
//!     └─ spawned release task:  join monitors → close transport → close admin
//!            finished before deadline → Ok(())
//!            otherwise                → ProducerError::ShutdownTimedOut (task keeps running)
//! ```

use crate::admin::KafkaAdmin;
use crate::provisioner::TopicProvisioner;
use crate::transport::KafkaTransport;
use crate::KafkaConfig;
use relay_core::messaging::{
    Acknowledgements, AdminError, ClusterAdmin, EnqueueError, Headers, OutboundMessage, ProducerTransport, TopicSpec,
};
use relay_runtime::metrics::{PRODUCER_DELIVERED, PRODUCER_DELIVERY_ERRORS};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Pause between enqueue attempts while the transport's queue is full.
pub const QUEUE_FULL_BACKOFF: Duration = Duration::from_millis(10);

/// Errors from the producer.
#[derive(Error, Debug)]
pub enum ProducerError {
    /// The client could not be created.
    #[error("Failed to connect producer: {0}")]
    Connection(String),

    /// Shutdown has begun or completed.
    #[error("producer is closed")]
    Closed,

    /// Shutdown began while the send was waiting for queue space.
    #[error("producer is shutting down")]
    ShuttingDown,

    /// The release sequence did not finish before the deadline.
    #[error("shutdown timed out after {0:?}")]
    ShutdownTimedOut(Duration),

    /// The release sequence failed.
    #[error("shutdown failed: {0}")]
    ShutdownFailed(String),

    /// The destination topic could not be provisioned.
    #[error(transparent)]
    Provision(#[from] AdminError),

    /// The transport refused the record.
    #[error(transparent)]
    Enqueue(#[from] EnqueueError),

    /// The payload could not be serialized.
    #[error("Failed to serialize payload: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Publishes records to a Kafka-compatible cluster.
pub struct Producer {
    transport: Arc<dyn ProducerTransport>,
    provisioner: TopicProvisioner,
    topics: RwLock<HashSet<String>>,
    closed: AtomicBool,
    stop: CancellationToken,
    monitors: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for Producer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Producer")
            .field("closed", &self.is_closed())
            .field("known_topics", &self.known_topics())
            .finish_non_exhaustive()
    }
}

impl Producer {
    /// Connect to the cluster described by `config`.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`ProducerError::Connection`] if the producer or admin client
    /// cannot be created. No retry is attempted.
    pub fn connect(config: &KafkaConfig) -> Result<Self, ProducerError> {
        let admin = KafkaAdmin::new(config).map_err(|e| ProducerError::Connection(e.to_string()))?;
        let (transport, acks) = KafkaTransport::new(config).map_err(|e| ProducerError::Connection(e.to_string()))?;

        Ok(Self::with_parts(
            Arc::new(transport),
            acks,
            Arc::new(admin),
            config.topic_spec(),
        ))
    }

    /// Assemble a producer from its parts and start the delivery monitors.
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn with_parts(
        transport: Arc<dyn ProducerTransport>,
        acks: Acknowledgements,
        admin: Arc<dyn ClusterAdmin>,
        spec: TopicSpec,
    ) -> Self {
        let stop = CancellationToken::new();
        let monitors = spawn_monitors(acks, &stop);

        Self {
            transport,
            provisioner: TopicProvisioner::new(admin, spec),
            topics: RwLock::new(HashSet::new()),
            closed: AtomicBool::new(false),
            stop,
            monitors: Mutex::new(monitors),
        }
    }

    /// Queue a record.
    ///
    /// The topic is created first if this producer has not seen it before.
    ///
    /// # Errors
    ///
    /// - [`ProducerError::Closed`] if shutdown has begun
    /// - [`ProducerError::Provision`] if the topic cannot be created
    /// - [`ProducerError::ShuttingDown`] if shutdown begins while waiting for queue space
    /// - [`ProducerError::Enqueue`] if the transport refuses the record
    pub async fn send_message(
        &self,
        key: &str,
        topic: &str,
        value: Vec<u8>,
        headers: Headers,
    ) -> Result<(), ProducerError> {
        if self.is_closed() {
            return Err(ProducerError::Closed);
        }

        self.ensure_topic(topic).await?;

        let mut message = OutboundMessage {
            key: key.to_string(),
            topic: topic.to_string(),
            value,
            headers,
        };

        loop {
            if self.stop.is_cancelled() {
                return Err(ProducerError::ShuttingDown);
            }
            match self.transport.enqueue(message) {
                Ok(()) => return Ok(()),
                Err(EnqueueError::QueueFull(returned)) => {
                    message = *returned;
                    tokio::select! {
                        () = self.stop.cancelled() => return Err(ProducerError::ShuttingDown),
                        () = tokio::time::sleep(QUEUE_FULL_BACKOFF) => {}
                    }
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Queue an [`OutboundMessage`].
    ///
    /// # Errors
    ///
    /// See [`send_message`](Self::send_message).
    pub async fn send(&self, message: &OutboundMessage) -> Result<(), ProducerError> {
        self.send_message(&message.key, &message.topic, message.value.clone(), message.headers.clone())
            .await
    }

    /// Queue `payload` serialized as JSON.
    ///
    /// # Errors
    ///
    /// Returns [`ProducerError::Serialize`] if serialization fails, otherwise
    /// see [`send_message`](Self::send_message).
    pub async fn send_json<T: Serialize + Sync>(
        &self,
        key: &str,
        topic: &str,
        payload: &T,
        headers: Headers,
    ) -> Result<(), ProducerError> {
        let value = serde_json::to_vec(payload)?;
        self.send_message(key, topic, value, headers).await
    }

    /// Stop the monitors and release the transport and admin.
    ///
    /// Only the first call does anything; later calls return `Ok(())`.
    ///
    /// # Errors
    ///
    /// Returns [`ProducerError::ShutdownTimedOut`] if the release sequence is
    /// still running at `deadline`. It keeps running in the background.
    pub async fn shutdown(&self, deadline: Duration) -> Result<(), ProducerError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.stop.cancel();

        let monitors = std::mem::take(&mut *self.monitors.lock().unwrap_or_else(PoisonError::into_inner));
        let transport = Arc::clone(&self.transport);
        let admin = Arc::clone(self.provisioner.admin());

        let release = tokio::spawn(async move {
            for monitor in monitors {
                if let Err(err) = monitor.await {
                    tracing::warn!(error = %err, "Delivery monitor ended abnormally");
                }
            }
            if let Err(err) = transport.close().await {
                tracing::warn!(error = %err, "Failed to close producer transport");
            }
            if let Err(err) = admin.close().await {
                tracing::warn!(error = %err, "Failed to close admin client");
            }
        });

        match tokio::time::timeout(deadline, release).await {
            Ok(Ok(())) => {
                tracing::info!("Producer shut down");
                Ok(())
            }
            Ok(Err(err)) => Err(ProducerError::ShutdownFailed(err.to_string())),
            Err(_) => {
                tracing::warn!(deadline = ?deadline, "Producer shutdown timed out");
                Err(ProducerError::ShutdownTimedOut(deadline))
            }
        }
    }

    /// Whether shutdown has begun.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Topics this producer has provisioned or seen.
    #[must_use]
    pub fn known_topics(&self) -> HashSet<String> {
        self.topics.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    async fn ensure_topic(&self, topic: &str) -> Result<(), AdminError> {
        let cached = self
            .topics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(topic);
        if cached {
            return Ok(());
        }

        self.provisioner.ensure_exists(&[topic.to_string()]).await?;

        self.topics
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(topic.to_string());
        Ok(())
    }
}

fn spawn_monitors(acks: Acknowledgements, stop: &CancellationToken) -> Vec<JoinHandle<()>> {
    let Acknowledgements {
        mut successes,
        mut errors,
    } = acks;

    let success_stop = stop.clone();
    let success_monitor = tokio::spawn(async move {
        loop {
            tokio::select! {
                () = success_stop.cancelled() => return,
                delivery = successes.recv() => {
                    let Some(delivery) = delivery else { return };
                    tracing::debug!(
                        topic = %delivery.topic,
                        partition = delivery.partition,
                        offset = delivery.offset,
                        "Message delivered"
                    );
                    metrics::counter!(PRODUCER_DELIVERED, "topic" => delivery.topic).increment(1);
                }
            }
        }
    });

    let error_stop = stop.clone();
    let error_monitor = tokio::spawn(async move {
        loop {
            tokio::select! {
                () = error_stop.cancelled() => return,
                failure = errors.recv() => {
                    let Some(failure) = failure else { return };
                    tracing::error!(
                        topic = %failure.topic,
                        key = %failure.key,
                        reason = %failure.reason,
                        "Failed to deliver message"
                    );
                    metrics::counter!(PRODUCER_DELIVERY_ERRORS, "topic" => failure.topic).increment(1);
                }
            }
        }
    });

    vec![success_monitor, error_monitor]
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use relay_testing::InMemoryBroker;

    fn producer(broker: &InMemoryBroker) -> Producer {
        let shared = Arc::new(broker.clone());
        Producer::with_parts(
            shared.clone(),
            broker.take_acknowledgements().unwrap(),
            shared,
            TopicSpec::for_brokers(3, 1),
        )
    }

    #[tokio::test]
    async fn topic_is_created_once() {
        let broker = InMemoryBroker::new();
        let producer = producer(&broker);

        for i in 0..3u8 {
            producer
                .send_message("book-1", "book.created", vec![i], Headers::new())
                .await
                .unwrap();
        }

        assert_eq!(broker.create_count("book.created"), 1);
        assert_eq!(broker.records("book.created").len(), 3);
        assert!(producer.known_topics().contains("book.created"));
    }

    #[tokio::test]
    async fn headers_and_key_are_carried() {
        relay_testing::init_test_tracing();
        let broker = InMemoryBroker::new();
        let producer = producer(&broker);

        let message = OutboundMessage::new("book-7", "book.created", b"{}".to_vec()).with_header("trace", "abc");
        producer.send(&message).await.unwrap();

        let records = broker.records("book.created");
        assert_eq!(records[0].key, "book-7");
        assert_eq!(records[0].headers["trace"], "abc");
    }

    #[tokio::test]
    async fn send_json_serializes_payload() {
        #[derive(Serialize)]
        struct BookCreated<'a> {
            name: &'a str,
        }

        let broker = InMemoryBroker::new();
        let producer = producer(&broker);

        producer
            .send_json("1", "book.created", &BookCreated { name: "Dune" }, Headers::new())
            .await
            .unwrap();

        assert_eq!(broker.records("book.created")[0].value, br#"{"name":"Dune"}"#.to_vec());
    }

    #[tokio::test(start_paused = true)]
    async fn full_queue_is_retried() {
        let broker = InMemoryBroker::new();
        let producer = producer(&broker);
        broker.fill_queue(3);

        producer
            .send_message("k", "orders", vec![1], Headers::new())
            .await
            .unwrap();

        assert_eq!(broker.records("orders").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_interrupts_send_waiting_for_queue_space() {
        let broker = InMemoryBroker::new();
        let producer = Arc::new(producer(&broker));
        broker.add_topic("orders", TopicSpec::for_brokers(1, 1));
        producer.ensure_topic("orders").await.unwrap();
        broker.fill_queue(usize::MAX);

        let sender = Arc::clone(&producer);
        let pending = tokio::spawn(async move { sender.send_message("k", "orders", vec![1], Headers::new()).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        producer.shutdown(Duration::from_secs(1)).await.unwrap();
        assert!(matches!(pending.await.unwrap(), Err(ProducerError::ShuttingDown)));
    }

    #[tokio::test]
    async fn send_after_shutdown_is_rejected() {
        let broker = InMemoryBroker::new();
        let producer = producer(&broker);

        producer.shutdown(Duration::from_secs(1)).await.unwrap();

        let err = producer
            .send_message("k", "orders", vec![], Headers::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ProducerError::Closed));
        assert!(broker.create_requests().is_empty());
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let broker = InMemoryBroker::new();
        let producer = producer(&broker);

        producer.shutdown(Duration::from_secs(1)).await.unwrap();
        producer.shutdown(Duration::from_secs(1)).await.unwrap();

        assert_eq!(broker.transport_closes(), 1);
        assert_eq!(broker.admin_closes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_release_times_out() {
        let broker = InMemoryBroker::new();
        broker.set_close_delay(Duration::from_secs(5));
        let producer = producer(&broker);

        let err = producer.shutdown(Duration::from_millis(100)).await.unwrap_err();
        assert!(matches!(err, ProducerError::ShutdownTimedOut(_)));

        // The release sequence still completes in the background.
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(broker.transport_closes(), 1);
    }

    #[tokio::test]
    async fn failed_delivery_does_not_fail_the_send() {
        let broker = InMemoryBroker::new();
        broker.fail_deliveries_for("audit");
        let producer = producer(&broker);

        producer
            .send_message("k", "audit", vec![1], Headers::new())
            .await
            .unwrap();
        assert!(broker.records("audit").is_empty());
    }
}
