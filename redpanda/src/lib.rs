//! Kafka-compatible messaging for Relay services.
//!
//! Works against Redpanda, Apache Kafka or any broker speaking the Kafka
//! protocol, through rdkafka.
//!
//! - [`Producer`] publishes records asynchronously, creating topics on first
//!   use and retrying while the client's outbound queue is full.
//! - [`Consumer`] joins a consumer group and routes each record to the
//!   handler registered for its topic.
//! - [`TopicProvisioner`] creates missing topics with the configured
//!   partition count and a replication factor derived from the broker count.
//!
//! The Kafka clients sit behind the `ClusterAdmin`, `ProducerTransport` and
//! `GroupClient` traits of `relay-core`, so both sides run unchanged over the
//! in-memory broker from `relay-testing`.
//!
//! # Delivery semantics
//!
//! - **Producer**: a successful send means the record was queued. Broker
//!   acknowledgements are logged and counted in the background; a record
//!   the broker rejects is not reported to the sender.
//! - **Consumer**: at-most-once. Offsets are marked after the handler runs
//!   regardless of its outcome.
//!
//! # Example
//!
//! ```no_run
//! use relay_core::Context;
//! use relay_redpanda::{Consumer, KafkaConfig, Producer, handle_fn};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = KafkaConfig::from_env();
//!
//! let producer = Producer::connect(&config)?;
//! producer
//!     .send_message("42", "book.created", br#"{"title":"Dune"}"#.to_vec(), Default::default())
//!     .await?;
//!
//! let consumer = Consumer::connect(&config)?;
//! consumer.register(
//!     "book.created",
//!     handle_fn(|message| async move {
//!         tracing::info!(key = %message.key, "book created");
//!         anyhow::Ok(())
//!     }),
//! );
//!
//! let ctx = Context::background();
//! tokio::spawn({
//!     let ctx = ctx.clone();
//!     async move {
//!         tokio::time::sleep(Duration::from_secs(30)).await;
//!         ctx.cancel();
//!     }
//! });
//! let _ = consumer.start(&ctx).await;
//!
//! consumer.close().await?;
//! producer.shutdown(Duration::from_secs(5)).await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod admin;
mod config;
pub mod consumer;
mod group;
pub mod producer;
mod provisioner;
mod transport;

pub use admin::KafkaAdmin;
pub use config::KafkaConfig;
pub use consumer::{Consumer, ConsumerError, MessageHandler, handle_fn};
pub use group::KafkaGroupClient;
pub use producer::{Producer, ProducerError, QUEUE_FULL_BACKOFF};
pub use provisioner::TopicProvisioner;
pub use transport::{DeliveryReporter, KafkaTransport};
