//! # Relay Core
//!
//! Core contracts shared by every Relay crate.
//!
//! Relay is an in-process messaging client (producer + consumer over a
//! Kafka-compatible broker) combined with a typed request-processing pipeline
//! that layers cross-cutting behavior (transactions, cancellation, metrics,
//! validation, logging) around arbitrary handlers.
//!
//! This crate holds the pieces every other crate agrees on:
//!
//! - [`context`]: the request-scoped [`Context`] (typed values, cancellation, deadlines)
//! - [`error`]: the cross-boundary [`AppError`] with its static code registry
//! - [`messaging`]: record shapes and the broker-facing traits implemented by
//!   `relay-redpanda` (rdkafka) and `relay-testing` (in memory)
//! - [`transaction`]: the transactional context bound into a [`Context`]
//! - [`validate`]: structural request validation
//!
//! ## Architecture
//!
//! ```text
//!   caller ──► ServiceMiddleware::wrap(method, handler)
//!                 │  globals (outermost) → method middlewares → handler
//!                 ▼
//!            TransactionMiddleware ──► TxContext (bound in Context)
//!                 │
//!                 ▼
//!            handler ──► Producer::send_message ──► broker
//!
//!   broker ──► Consumer (group session) ──► handler registered by topic
//! ```

pub mod context;
pub mod error;
pub mod messaging;
pub mod transaction;
pub mod validate;

pub use context::Context;
pub use error::{AppError, ErrorDef, RpcStatus};

use std::future::Future;
use std::pin::Pin;

/// A boxed, sendable future.
///
/// Used at trait seams that must stay dyn-compatible (`Arc<dyn ClusterAdmin>`,
/// handler closures) instead of `async fn` in traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
