//! rdkafka-backed [`ProducerTransport`].
//!
//! A [`ThreadedProducer`] polls delivery reports on its own thread; the
//! [`DeliveryReporter`] context forwards each report onto the acknowledgement
//! channels handed out by [`KafkaTransport::new`].

use crate::KafkaConfig;
use rdkafka::client::ClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::{DeliveryResult, Header, Message, OwnedHeaders};
use rdkafka::producer::{BaseRecord, Producer as _, ProducerContext, ThreadedProducer};
use relay_core::BoxFuture;
use relay_core::messaging::{
    AckSenders, Acknowledgements, Delivery, DeliveryFailure, EnqueueError, OutboundMessage, ProducerTransport,
    ack_channels,
};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Forwards delivery reports to the acknowledgement channels.
pub struct DeliveryReporter {
    senders: Mutex<Option<AckSenders>>,
}

impl DeliveryReporter {
    fn close(&self) {
        self.senders.lock().unwrap_or_else(PoisonError::into_inner).take();
    }
}

impl ClientContext for DeliveryReporter {}

impl ProducerContext for DeliveryReporter {
    type DeliveryOpaque = ();

    fn delivery(&self, delivery_result: &DeliveryResult<'_>, _delivery_opaque: Self::DeliveryOpaque) {
        let senders = self.senders.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(senders) = senders.as_ref() else {
            return;
        };

        match delivery_result {
            Ok(message) => {
                let _ = senders.successes.send(Delivery {
                    topic: message.topic().to_string(),
                    partition: message.partition(),
                    offset: message.offset(),
                });
            }
            Err((err, message)) => {
                let _ = senders.errors.send(DeliveryFailure {
                    topic: message.topic().to_string(),
                    key: message
                        .key()
                        .map(|k| String::from_utf8_lossy(k).into_owned())
                        .unwrap_or_default(),
                    reason: err.to_string(),
                });
            }
        }
    }
}

/// Asynchronous producer transport.
pub struct KafkaTransport {
    producer: Arc<ThreadedProducer<DeliveryReporter>>,
    flush_timeout: Duration,
}

impl KafkaTransport {
    /// Create the transport and its acknowledgement receivers.
    ///
    /// # Errors
    ///
    /// Returns the client error if the producer cannot be created.
    pub fn new(config: &KafkaConfig) -> Result<(Self, Acknowledgements), KafkaError> {
        let (senders, acknowledgements) = ack_channels();
        let producer: ThreadedProducer<DeliveryReporter> = ClientConfig::new()
            .set("bootstrap.servers", config.bootstrap_servers())
            .set("queue.buffering.max.messages", config.outbound_buffer.to_string())
            .set("message.timeout.ms", config.message_timeout_ms().to_string())
            .create_with_context(DeliveryReporter {
                senders: Mutex::new(Some(senders)),
            })?;

        tracing::info!(
            brokers = %config.bootstrap_servers(),
            outbound_buffer = config.outbound_buffer,
            "Kafka producer created"
        );

        Ok((
            Self {
                producer: Arc::new(producer),
                flush_timeout: config.timeout(),
            },
            acknowledgements,
        ))
    }
}

impl ProducerTransport for KafkaTransport {
    fn enqueue(&self, message: OutboundMessage) -> Result<(), EnqueueError> {
        let headers = message.headers.iter().fold(
            OwnedHeaders::new_with_capacity(message.headers.len()),
            |headers, (key, value)| {
                headers.insert(Header {
                    key: key.as_str(),
                    value: Some(value.as_bytes()),
                })
            },
        );
        let record = BaseRecord::to(&message.topic)
            .key(message.key.as_bytes())
            .payload(&message.value)
            .headers(headers);

        let result = self.producer.send(record).map_err(|(err, _record)| err);

        match result {
            Ok(()) => Ok(()),
            Err(KafkaError::MessageProduction(RDKafkaErrorCode::QueueFull)) => {
                Err(EnqueueError::QueueFull(Box::new(message)))
            }
            Err(err) => Err(EnqueueError::Rejected {
                topic: message.topic,
                reason: err.to_string(),
            }),
        }
    }

    fn close(&self) -> BoxFuture<'_, Result<(), EnqueueError>> {
        let producer = Arc::clone(&self.producer);
        let timeout = self.flush_timeout;
        Box::pin(async move {
            let flushed = tokio::task::spawn_blocking(move || {
                let result = producer.flush(timeout);
                producer.context().close();
                result
            })
            .await
            .map_err(|e| EnqueueError::Close(e.to_string()))?;

            flushed.map_err(|e| EnqueueError::Close(e.to_string()))
        })
    }
}
