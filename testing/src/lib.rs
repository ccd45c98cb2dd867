//! # Relay Testing
//!
//! Test doubles for Relay services.
//!
//! This crate provides:
//! - [`InMemoryBroker`]: topic admin, producer transport and consumer group in memory
//! - [`InMemoryTransactions`]: a transaction backend counting begins, commits and rollbacks
//! - [`init_test_tracing`]: log output captured by the test harness
//!
//! ## Example
//!
//! ```
//! use relay_core::messaging::{OutboundMessage, ProducerTransport};
//! use relay_testing::InMemoryBroker;
//!
//! let broker = InMemoryBroker::new();
//! broker.enqueue(OutboundMessage::new("book-1", "book.created", b"{}".to_vec())).unwrap();
//! assert_eq!(broker.records("book.created").len(), 1);
//! ```

pub mod broker;
pub mod transactions;

pub use broker::InMemoryBroker;
pub use transactions::{InMemoryPool, InMemoryTransaction, InMemoryTransactions, TransactionStats};

/// Send `tracing` output to the test harness.
///
/// Honors `RUST_LOG` and defaults to `debug`. Safe to call from every test;
/// only the first call installs a subscriber.
pub fn init_test_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}
