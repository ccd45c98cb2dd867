//! In-memory transaction backend.
//!
//! Statements recorded on an [`InMemoryTransaction`] become visible in the
//! [`InMemoryPool`] only when the transaction commits.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)]

use relay_core::BoxFuture;
use relay_core::transaction::{TransactionBackend, TransactionError};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// An open in-memory transaction.
#[derive(Debug)]
pub struct InMemoryTransaction {
    id: u64,
    statements: Vec<String>,
}

impl InMemoryTransaction {
    /// Transaction id, starting at 1.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Record a statement, applied on commit.
    pub fn execute(&mut self, statement: impl Into<String>) {
        self.statements.push(statement.into());
    }

    /// Statements recorded so far.
    #[must_use]
    pub fn statements(&self) -> &[String] {
        &self.statements
    }
}

/// The non-transactional executor: a log of applied statements.
#[derive(Debug, Default, Clone)]
pub struct InMemoryPool {
    applied: Arc<Mutex<Vec<String>>>,
}

impl InMemoryPool {
    /// Apply a statement immediately.
    pub fn execute(&self, statement: impl Into<String>) {
        self.applied.lock().unwrap_or_else(PoisonError::into_inner).push(statement.into());
    }

    /// Every applied statement, in order.
    #[must_use]
    pub fn applied(&self) -> Vec<String> {
        self.applied.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

/// Counters for transaction outcomes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransactionStats {
    /// Transactions started.
    pub begun: usize,
    /// Transactions committed.
    pub committed: usize,
    /// Transactions rolled back.
    pub rolled_back: usize,
}

/// In-memory [`TransactionBackend`] with failure injection.
#[derive(Debug, Default)]
pub struct InMemoryTransactions {
    pool: InMemoryPool,
    next_id: AtomicU64,
    begun: AtomicUsize,
    committed: AtomicUsize,
    rolled_back: AtomicUsize,
    fail_begins: AtomicBool,
    fail_commits: AtomicBool,
    fail_rollbacks: AtomicBool,
}

impl InMemoryTransactions {
    /// Create a backend with an empty pool.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Outcome counters.
    #[must_use]
    pub fn stats(&self) -> TransactionStats {
        TransactionStats {
            begun: self.begun.load(Ordering::SeqCst),
            committed: self.committed.load(Ordering::SeqCst),
            rolled_back: self.rolled_back.load(Ordering::SeqCst),
        }
    }

    /// Make `begin` fail.
    pub fn fail_begins(&self, fail: bool) {
        self.fail_begins.store(fail, Ordering::SeqCst);
    }

    /// Make `commit` fail. The transaction's statements are discarded.
    pub fn fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::SeqCst);
    }

    /// Make `rollback` fail.
    pub fn fail_rollbacks(&self, fail: bool) {
        self.fail_rollbacks.store(fail, Ordering::SeqCst);
    }
}

impl TransactionBackend for InMemoryTransactions {
    type Transaction = InMemoryTransaction;
    type Pool = InMemoryPool;

    fn pool(&self) -> &InMemoryPool {
        &self.pool
    }

    fn begin(&self) -> BoxFuture<'_, Result<InMemoryTransaction, TransactionError>> {
        Box::pin(async move {
            if self.fail_begins.load(Ordering::SeqCst) {
                return Err(TransactionError::Begin("connection refused".to_string()));
            }
            self.begun.fetch_add(1, Ordering::SeqCst);
            Ok(InMemoryTransaction {
                id: self.next_id.fetch_add(1, Ordering::SeqCst) + 1,
                statements: Vec::new(),
            })
        })
    }

    fn commit(&self, tx: InMemoryTransaction) -> BoxFuture<'_, Result<(), TransactionError>> {
        Box::pin(async move {
            if self.fail_commits.load(Ordering::SeqCst) {
                return Err(TransactionError::Commit(format!(
                    "transaction {} could not be serialized",
                    tx.id
                )));
            }
            self.pool.applied.lock().unwrap_or_else(PoisonError::into_inner).extend(tx.statements);
            self.committed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn rollback(&self, tx: InMemoryTransaction) -> BoxFuture<'_, Result<(), TransactionError>> {
        Box::pin(async move {
            if self.fail_rollbacks.load(Ordering::SeqCst) {
                return Err(TransactionError::Rollback(format!("transaction {} is gone", tx.id)));
            }
            self.rolled_back.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use relay_core::Context;
    use tokio_test::{assert_err, assert_ok};
    use relay_core::transaction::{Executor, TxContext};

    #[tokio::test]
    async fn statements_apply_only_on_commit() {
        let txc = TxContext::new(InMemoryTransactions::new());

        let ctx = txc.begin(&Context::background()).await.unwrap();
        if let Executor::Transaction(mut tx) = txc.resolve(&ctx).await {
            tx.execute("INSERT INTO books VALUES (1)");
        }
        assert!(txc.backend().pool().applied().is_empty());

        assert_ok!(txc.commit(&ctx).await);
        assert_eq!(txc.backend().pool().applied(), vec!["INSERT INTO books VALUES (1)"]);
    }

    #[tokio::test]
    async fn rollback_discards_statements() {
        let txc = TxContext::new(InMemoryTransactions::new());

        let ctx = txc.begin(&Context::background()).await.unwrap();
        if let Executor::Transaction(mut tx) = txc.resolve(&ctx).await {
            tx.execute("DELETE FROM books");
        }
        assert_ok!(txc.rollback(&ctx).await);
        assert_err!(txc.commit(&ctx).await);

        assert!(txc.backend().pool().applied().is_empty());
        assert_eq!(
            txc.backend().stats(),
            TransactionStats {
                begun: 1,
                committed: 0,
                rolled_back: 1
            }
        );
    }

    #[tokio::test]
    async fn failing_begin_binds_nothing() {
        let txc = TxContext::new(InMemoryTransactions::new());
        txc.backend().fail_begins(true);

        let err = txc.begin(&Context::background()).await.unwrap_err();
        assert!(matches!(err, TransactionError::Begin(_)));
        assert_eq!(txc.backend().stats().begun, 0);
    }
}
