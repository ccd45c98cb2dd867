//! rdkafka-backed [`GroupClient`].
//!
//! librdkafka assigns partitions to group members internally. A session
//! starts when the subscription is (re)established and lasts until it is
//! cancelled or the client reports an error; a claim is opened for each
//! partition the first time one of its records arrives.
//!
//! Offsets are stored when a record is marked and committed by the client's
//! background auto-commit.

use crate::KafkaConfig;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer as _, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Headers as _, Message};
use rdkafka::topic_partition_list::{Offset, TopicPartitionList};
use relay_core::BoxFuture;
use relay_core::messaging::{
    Claim, GroupClient, GroupError, GroupSession, Headers, InboundMessage, SessionHandler,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Records buffered per claim before the session stops reading.
const CLAIM_BUFFER: usize = 256;

/// Consumer-group client over a [`StreamConsumer`].
pub struct KafkaGroupClient {
    consumer: Arc<StreamConsumer>,
    member_id: String,
    closed: AtomicBool,
}

impl KafkaGroupClient {
    /// Create a group member for `config.consumer_group`.
    ///
    /// # Errors
    ///
    /// Returns [`GroupError::Connection`] if the client cannot be created.
    pub fn new(config: &KafkaConfig) -> Result<Self, GroupError> {
        let member_id = format!("{}-{}", config.consumer_group, uuid::Uuid::new_v4());
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", config.bootstrap_servers())
            .set("group.id", &config.consumer_group)
            .set("client.id", &member_id)
            .set("enable.auto.commit", "true")
            .set("enable.auto.offset.store", "false")
            .set("auto.offset.reset", "earliest")
            .set("enable.partition.eof", "false")
            .set("session.timeout.ms", "6000")
            .create()
            .map_err(|e| GroupError::Connection(e.to_string()))?;

        tracing::info!(
            group = %config.consumer_group,
            member_id = %member_id,
            "Kafka consumer group client created"
        );

        Ok(Self {
            consumer: Arc::new(consumer),
            member_id,
            closed: AtomicBool::new(false),
        })
    }

    async fn run_session(&self, session: &KafkaSession, handler: &dyn SessionHandler) -> Result<(), GroupError> {
        let mut claims: HashMap<(String, i32), mpsc::Sender<InboundMessage>> = HashMap::new();
        let mut running = FuturesUnordered::new();

        let outcome = loop {
            tokio::select! {
                () = session.token.cancelled() => break Ok(()),
                Some(finished) = running.next() => {
                    if let Err(err) = finished {
                        break Err(err);
                    }
                }
                received = self.consumer.recv() => {
                    let message = match received {
                        Ok(borrowed) => to_inbound(&borrowed),
                        Err(err) => break Err(GroupError::Session(err.to_string())),
                    };
                    let claim = claims
                        .entry((message.topic.clone(), message.partition))
                        .or_insert_with(|| {
                            let (tx, rx) = mpsc::channel(CLAIM_BUFFER);
                            tracing::debug!(topic = %message.topic, partition = message.partition, "Claim opened");
                            running.push(handler.consume_claim(
                                session,
                                Claim {
                                    topic: message.topic.clone(),
                                    partition: message.partition,
                                    messages: rx,
                                },
                            ));
                            tx
                        })
                        .clone();

                    // Keep the other claims moving while this one is full.
                    let send = claim.send(message);
                    tokio::pin!(send);
                    let failed = loop {
                        tokio::select! {
                            sent = &mut send => {
                                if sent.is_err() {
                                    tracing::debug!("Claim ended before its records were delivered");
                                }
                                break None;
                            }
                            Some(finished) = running.next() => {
                                if let Err(err) = finished {
                                    break Some(err);
                                }
                            }
                        }
                    };
                    if let Some(err) = failed {
                        break Err(err);
                    }
                }
            }
        };

        session.token.cancel();
        drop(claims);
        while running.next().await.is_some() {}
        outcome
    }
}

impl GroupClient for KafkaGroupClient {
    fn consume<'a>(
        &'a self,
        topics: &'a [String],
        handler: Arc<dyn SessionHandler>,
        cancel: CancellationToken,
    ) -> BoxFuture<'a, Result<(), GroupError>> {
        Box::pin(async move {
            if self.closed.load(Ordering::SeqCst) {
                return Err(GroupError::Closed);
            }

            let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();
            self.consumer
                .subscribe(&topic_refs)
                .map_err(|e| GroupError::Connection(e.to_string()))?;

            let session = KafkaSession {
                consumer: Arc::clone(&self.consumer),
                token: cancel.child_token(),
                member_id: self.member_id.clone(),
            };

            handler.setup(&session)?;
            let outcome = self.run_session(&session, handler.as_ref()).await;
            let cleanup = handler.cleanup(&session);
            outcome.and(cleanup)
        })
    }

    fn close(&self) -> Result<(), GroupError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.consumer.unsubscribe();
            tracing::info!(member_id = %self.member_id, "Left consumer group");
        }
        Ok(())
    }
}

struct KafkaSession {
    consumer: Arc<StreamConsumer>,
    token: CancellationToken,
    member_id: String,
}

impl GroupSession for KafkaSession {
    fn mark_message(&self, message: &InboundMessage) {
        let mut offsets = TopicPartitionList::new();
        let stored = offsets
            .add_partition_offset(&message.topic, message.partition, Offset::Offset(message.offset + 1))
            .and_then(|()| self.consumer.store_offsets(&offsets));

        if let Err(err) = stored {
            tracing::warn!(
                topic = %message.topic,
                partition = message.partition,
                offset = message.offset,
                error = %err,
                "Failed to store offset"
            );
        }
    }

    fn token(&self) -> &CancellationToken {
        &self.token
    }

    fn member_id(&self) -> &str {
        &self.member_id
    }
}

fn to_inbound(message: &BorrowedMessage<'_>) -> InboundMessage {
    let mut headers = Headers::new();
    if let Some(raw) = message.headers() {
        for header in raw.iter() {
            let value = header.value.map(|v| String::from_utf8_lossy(v).into_owned()).unwrap_or_default();
            headers.insert(header.key.to_string(), value);
        }
    }

    InboundMessage {
        key: message
            .key()
            .map(|k| String::from_utf8_lossy(k).into_owned())
            .unwrap_or_default(),
        topic: message.topic().to_string(),
        value: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
        headers,
        partition: message.partition(),
        offset: message.offset(),
        timestamp: message.timestamp().to_millis().and_then(DateTime::<Utc>::from_timestamp_millis),
    }
}
