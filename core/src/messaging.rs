//! Messaging contracts.
//!
//! This module defines the record shapes exchanged with the broker and the
//! traits that separate the producer/consumer logic from a concrete client.
//!
//! # Implementations
//!
//! - `relay-redpanda`: rdkafka-backed admin, transport and consumer group
//! - `relay-testing`: `InMemoryBroker`, implementing all three in memory
//!
//! # Consumer-group sessions
//!
//! A [`GroupClient`] runs one group session per [`GroupClient::consume`] call:
//!
//! ```text
//!   join ──► SessionHandler::setup
//!              │
//!              ├─► consume_claim(partition 0) ─┐
//!              ├─► consume_claim(partition 1) ─┤  one task per claim,
//!              └─► consume_claim(partition n) ─┘  records in partition order
//!              │
//!   end  ◄── SessionHandler::cleanup   (rebalance, error or cancellation)
//! ```
//!
//! # Dyn Compatibility
//!
//! All traits return [`BoxFuture`] instead of using `async fn` so they can be
//! held as `Arc<dyn Trait>`.

use crate::BoxFuture;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Record headers. Keys are unique; order is not preserved.
pub type Headers = HashMap<String, String>;

/// Highest replication factor requested for auto-created topics.
pub const MAX_REPLICATION_FACTOR: usize = 3;

/// A record to publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    /// Partitioning key.
    pub key: String,
    /// Destination topic (auto-provisioned if absent).
    pub topic: String,
    /// Opaque payload.
    pub value: Vec<u8>,
    /// Headers.
    pub headers: Headers,
}

impl OutboundMessage {
    /// Create a record without headers.
    #[must_use]
    pub fn new(key: impl Into<String>, topic: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            topic: topic.into(),
            value: value.into(),
            headers: Headers::new(),
        }
    }

    /// Add a header, replacing any previous value for the key.
    #[must_use]
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

/// A record received from the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Partitioning key (empty when the record had none).
    pub key: String,
    /// Source topic.
    pub topic: String,
    /// Payload (empty when the record had none).
    pub value: Vec<u8>,
    /// Headers.
    pub headers: Headers,
    /// Source partition.
    pub partition: i32,
    /// Offset within the partition.
    pub offset: i64,
    /// Broker timestamp, when available.
    pub timestamp: Option<DateTime<Utc>>,
}

/// Parameters for auto-created topics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopicSpec {
    /// Number of partitions.
    pub partition_count: i32,
    /// Replication factor.
    pub replication_factor: i16,
}

impl TopicSpec {
    /// Spec for a cluster reached through `broker_count` configured brokers.
    ///
    /// The replication factor is `min(broker_count, 3)`, and at least 1.
    #[must_use]
    pub fn for_brokers(partition_count: i32, broker_count: usize) -> Self {
        let factor = broker_count.clamp(1, MAX_REPLICATION_FACTOR);
        Self {
            partition_count,
            replication_factor: i16::try_from(factor).unwrap_or(1),
        }
    }
}

/// Successful delivery reported by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Topic.
    pub topic: String,
    /// Partition the record landed in.
    pub partition: i32,
    /// Offset assigned to the record.
    pub offset: i64,
}

/// Failed delivery reported by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryFailure {
    /// Topic.
    pub topic: String,
    /// Key of the failed record.
    pub key: String,
    /// Broker-reported reason.
    pub reason: String,
}

/// Receiving side of a transport's delivery reports.
#[derive(Debug)]
pub struct Acknowledgements {
    /// Successful deliveries.
    pub successes: mpsc::UnboundedReceiver<Delivery>,
    /// Failed deliveries.
    pub errors: mpsc::UnboundedReceiver<DeliveryFailure>,
}

/// Sending side of a transport's delivery reports.
#[derive(Debug, Clone)]
pub struct AckSenders {
    /// Successful deliveries.
    pub successes: mpsc::UnboundedSender<Delivery>,
    /// Failed deliveries.
    pub errors: mpsc::UnboundedSender<DeliveryFailure>,
}

/// Create a connected pair of delivery-report channels.
#[must_use]
pub fn ack_channels() -> (AckSenders, Acknowledgements) {
    let (success_tx, success_rx) = mpsc::unbounded_channel();
    let (error_tx, error_rx) = mpsc::unbounded_channel();
    (
        AckSenders {
            successes: success_tx,
            errors: error_tx,
        },
        Acknowledgements {
            successes: success_rx,
            errors: error_rx,
        },
    )
}

/// Errors from topic administration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdminError {
    /// The topic exists already. Provisioning treats this as success.
    #[error("Topic '{0}' already exists")]
    TopicAlreadyExists(String),

    /// Listing topics failed.
    #[error("Failed to list topics: {0}")]
    ListFailed(String),

    /// Creating a topic failed.
    #[error("Failed to create topic '{topic}': {reason}")]
    CreateFailed {
        /// The topic.
        topic: String,
        /// Broker-reported reason.
        reason: String,
    },

    /// Could not reach the cluster.
    #[error("Admin connection failed: {0}")]
    Connection(String),
}

/// Errors from handing a record to a transport.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EnqueueError {
    /// The local queue is full; the record is handed back for a later retry.
    #[error("Producer queue is full")]
    QueueFull(Box<OutboundMessage>),

    /// The transport refused the record.
    #[error("Failed to enqueue message for topic '{topic}': {reason}")]
    Rejected {
        /// The topic.
        topic: String,
        /// Reason.
        reason: String,
    },

    /// Releasing the transport failed.
    #[error("Failed to close transport: {0}")]
    Close(String),
}

/// Errors from a consumer-group client.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GroupError {
    /// Could not join or talk to the group.
    #[error("Consumer group connection failed: {0}")]
    Connection(String),

    /// A session ended abnormally.
    #[error("Consumer group session failed: {0}")]
    Session(String),

    /// The client was closed.
    #[error("Consumer group client is closed")]
    Closed,
}

/// Topic administration.
pub trait ClusterAdmin: Send + Sync {
    /// Fetch the names of all topics in the cluster.
    ///
    /// # Errors
    ///
    /// Returns [`AdminError::ListFailed`] when metadata cannot be fetched.
    fn list_topics(&self) -> BoxFuture<'_, Result<HashSet<String>, AdminError>>;

    /// Create a topic.
    ///
    /// # Errors
    ///
    /// Returns [`AdminError::TopicAlreadyExists`] when the topic exists and
    /// [`AdminError::CreateFailed`] for any other failure.
    fn create_topic<'a>(&'a self, name: &'a str, spec: TopicSpec) -> BoxFuture<'a, Result<(), AdminError>>;

    /// Release the admin connection.
    ///
    /// # Errors
    ///
    /// Returns [`AdminError::Connection`] if the connection cannot be released cleanly.
    fn close(&self) -> BoxFuture<'_, Result<(), AdminError>>;
}

/// Outbound side of a producer.
///
/// Delivery outcomes are not returned from [`enqueue`](Self::enqueue); they
/// arrive later on the [`Acknowledgements`] handed out with the transport.
pub trait ProducerTransport: Send + Sync {
    /// Queue a record without waiting for delivery.
    ///
    /// # Errors
    ///
    /// Returns [`EnqueueError::QueueFull`] (with the record) when the local
    /// queue is full, [`EnqueueError::Rejected`] otherwise.
    fn enqueue(&self, message: OutboundMessage) -> Result<(), EnqueueError>;

    /// Flush queued records and release the client.
    ///
    /// Closing drops the transport's acknowledgement senders.
    ///
    /// # Errors
    ///
    /// Returns [`EnqueueError::Close`] if the flush fails.
    fn close(&self) -> BoxFuture<'_, Result<(), EnqueueError>>;
}

/// One group session as seen by a [`SessionHandler`].
pub trait GroupSession: Send + Sync {
    /// Mark a record as processed so its offset gets committed.
    fn mark_message(&self, message: &InboundMessage);

    /// Cancelled when the session ends (rebalance, error or shutdown).
    fn token(&self) -> &CancellationToken;

    /// This member's id within the group.
    fn member_id(&self) -> &str;
}

/// Records of one assigned partition, in partition order.
#[derive(Debug)]
pub struct Claim {
    /// Topic.
    pub topic: String,
    /// Partition.
    pub partition: i32,
    /// Records. The channel closes when the claim is revoked.
    pub messages: mpsc::Receiver<InboundMessage>,
}

/// Callbacks driven by a [`GroupClient`] during a session.
pub trait SessionHandler: Send + Sync {
    /// Called once the session has joined, before any claim is consumed.
    ///
    /// # Errors
    ///
    /// An error aborts the session.
    fn setup(&self, session: &dyn GroupSession) -> Result<(), GroupError>;

    /// Called once all claims have finished.
    ///
    /// # Errors
    ///
    /// An error is reported as the session's outcome.
    fn cleanup(&self, session: &dyn GroupSession) -> Result<(), GroupError>;

    /// Consume one claim until its channel closes or the session ends.
    fn consume_claim<'a>(
        &'a self,
        session: &'a dyn GroupSession,
        claim: Claim,
    ) -> BoxFuture<'a, Result<(), GroupError>>;
}

/// A consumer-group client.
pub trait GroupClient: Send + Sync {
    /// Join the group for `topics` and run a single session to completion.
    ///
    /// Returns `Ok(())` when the session ends normally (rebalance or
    /// cancellation of `cancel`); callers loop to rejoin.
    ///
    /// # Errors
    ///
    /// Returns [`GroupError`] when joining fails or the session breaks.
    fn consume<'a>(
        &'a self,
        topics: &'a [String],
        handler: Arc<dyn SessionHandler>,
        cancel: CancellationToken,
    ) -> BoxFuture<'a, Result<(), GroupError>>;

    /// Leave the group and release the client.
    ///
    /// # Errors
    ///
    /// Returns [`GroupError::Connection`] if the client cannot be released cleanly.
    fn close(&self) -> Result<(), GroupError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replication_factor_is_capped_at_three() {
        assert_eq!(TopicSpec::for_brokers(12, 1).replication_factor, 1);
        assert_eq!(TopicSpec::for_brokers(12, 3).replication_factor, 3);
        assert_eq!(TopicSpec::for_brokers(12, 7).replication_factor, 3);
        assert_eq!(TopicSpec::for_brokers(12, 0).replication_factor, 1);
    }

    #[test]
    fn header_keys_are_unique() {
        let msg = OutboundMessage::new("k1", "orders", vec![1, 2])
            .with_header("trace", "a")
            .with_header("trace", "b");
        assert_eq!(msg.headers.len(), 1);
        assert_eq!(msg.headers["trace"], "b");
    }

    #[test]
    fn traits_are_dyn_compatible() {
        fn assert_dyn(
            _: Option<Arc<dyn ClusterAdmin>>,
            _: Option<Arc<dyn ProducerTransport>>,
            _: Option<Arc<dyn GroupClient>>,
            _: Option<Arc<dyn SessionHandler>>,
        ) {
        }
        assert_dyn(None, None, None, None);
    }
}
