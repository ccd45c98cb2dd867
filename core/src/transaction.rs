//! Transactional context.
//!
//! [`TxContext`] binds at most one active transaction into a [`Context`]
//! lineage. Code further down the call chain asks [`TxContext::resolve`] for an
//! executor and gets the bound transaction when there is one, or the plain
//! pool otherwise, so query code does not need to know whether it runs inside
//! a unit of work.
//!
//! # Lifecycle
//!
//! ```text
//!   begin(ctx) ──► ctx' (transaction bound)
//!                    │
//!                    ├─ resolve(ctx') ──► Executor::Transaction
//!                    │
//!                    ├─ commit(ctx')   ──► slot emptied
//!                    └─ rollback(ctx') ──► slot emptied
//! ```
//!
//! Beginning a second transaction on a lineage that already has an active one
//! is rejected with [`TransactionError::AlreadyActive`]; there is no nesting.
//! After commit or rollback the lineage has no active transaction, so
//! `resolve` falls back to the pool and a new `begin` is allowed.
//!
//! The backend is pluggable ([`TransactionBackend`]); `relay-postgres` provides
//! the sqlx implementation.

use crate::{BoxFuture, Context};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{MappedMutexGuard, Mutex, MutexGuard};

/// Errors from the transactional context.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransactionError {
    /// Commit or rollback was requested but no transaction is bound.
    #[error("context transaction is empty")]
    NoActiveTransaction,

    /// Begin was requested while a transaction is already bound.
    #[error("a transaction is already active in this context")]
    AlreadyActive,

    /// The backend could not start a transaction.
    #[error("Failed to begin transaction: {0}")]
    Begin(String),

    /// The backend could not commit.
    #[error("Failed to commit transaction: {0}")]
    Commit(String),

    /// The backend could not roll back.
    #[error("Failed to rollback transaction: {0}")]
    Rollback(String),
}

/// A store that can run transactions.
pub trait TransactionBackend: Send + Sync + 'static {
    /// An open transaction.
    type Transaction: Send + 'static;
    /// The non-transactional executor.
    type Pool: Send + Sync + 'static;

    /// The non-transactional executor.
    fn pool(&self) -> &Self::Pool;

    /// Start a transaction.
    ///
    /// # Errors
    ///
    /// Returns [`TransactionError::Begin`] on failure.
    fn begin(&self) -> BoxFuture<'_, Result<Self::Transaction, TransactionError>>;

    /// Commit a transaction.
    ///
    /// # Errors
    ///
    /// Returns [`TransactionError::Commit`] on failure.
    fn commit(&self, tx: Self::Transaction) -> BoxFuture<'_, Result<(), TransactionError>>;

    /// Roll back a transaction.
    ///
    /// # Errors
    ///
    /// Returns [`TransactionError::Rollback`] on failure.
    fn rollback(&self, tx: Self::Transaction) -> BoxFuture<'_, Result<(), TransactionError>>;
}

/// Context value holding the lineage's transaction.
struct ActiveTransaction<T> {
    slot: Mutex<Option<T>>,
}

/// Executor returned by [`TxContext::resolve`].
pub enum Executor<'a, B: TransactionBackend> {
    /// The transaction bound to the context. Held exclusively until dropped.
    Transaction(MappedMutexGuard<'a, B::Transaction>),
    /// No transaction is bound.
    Pool(&'a B::Pool),
}

impl<B: TransactionBackend> Executor<'_, B> {
    /// Whether this executor runs inside a transaction.
    #[must_use]
    pub const fn is_transactional(&self) -> bool {
        matches!(self, Self::Transaction(_))
    }
}

/// Binds transactions into request contexts.
pub struct TxContext<B: TransactionBackend> {
    backend: Arc<B>,
}

impl<B: TransactionBackend> Clone for TxContext<B> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
        }
    }
}

impl<B: TransactionBackend> TxContext<B> {
    /// Wrap a backend.
    #[must_use]
    pub fn new(backend: B) -> Self {
        Self {
            backend: Arc::new(backend),
        }
    }

    /// The backend.
    #[must_use]
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Start a transaction and return a context carrying it.
    ///
    /// # Errors
    ///
    /// Returns [`TransactionError::AlreadyActive`] if `ctx` already carries an
    /// active transaction, or the backend's begin error.
    pub async fn begin(&self, ctx: &Context) -> Result<Context, TransactionError> {
        if self.in_transaction(ctx).await {
            return Err(TransactionError::AlreadyActive);
        }
        let tx = self.backend.begin().await?;
        tracing::debug!(method = ctx.method_name(), "Transaction started");
        Ok(ctx.with_value(ActiveTransaction {
            slot: Mutex::new(Some(tx)),
        }))
    }

    /// The bound transaction, or the pool when none is active.
    pub async fn resolve<'a>(&'a self, ctx: &'a Context) -> Executor<'a, B> {
        if let Some(active) = ctx.value::<ActiveTransaction<B::Transaction>>() {
            if let Ok(tx) = MutexGuard::try_map(active.slot.lock().await, Option::as_mut) {
                return Executor::Transaction(tx);
            }
        }
        Executor::Pool(self.backend.pool())
    }

    /// Whether `ctx` carries an active transaction.
    pub async fn in_transaction(&self, ctx: &Context) -> bool {
        match ctx.value::<ActiveTransaction<B::Transaction>>() {
            Some(active) => active.slot.lock().await.is_some(),
            None => false,
        }
    }

    /// Commit the bound transaction.
    ///
    /// # Errors
    ///
    /// Returns [`TransactionError::NoActiveTransaction`] if none is bound, or
    /// the backend's commit error.
    pub async fn commit(&self, ctx: &Context) -> Result<(), TransactionError> {
        let tx = Self::take(ctx).await?;
        self.backend.commit(tx).await
    }

    /// Roll back the bound transaction.
    ///
    /// # Errors
    ///
    /// Returns [`TransactionError::NoActiveTransaction`] if none is bound, or
    /// the backend's rollback error.
    pub async fn rollback(&self, ctx: &Context) -> Result<(), TransactionError> {
        let tx = Self::take(ctx).await?;
        self.backend.rollback(tx).await
    }

    async fn take(ctx: &Context) -> Result<B::Transaction, TransactionError> {
        let active = ctx
            .value::<ActiveTransaction<B::Transaction>>()
            .ok_or(TransactionError::NoActiveTransaction)?;
        active
            .slot
            .lock()
            .await
            .take()
            .ok_or(TransactionError::NoActiveTransaction)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct CountingBackend {
        next: AtomicU32,
        commits: AtomicU32,
        rollbacks: AtomicU32,
    }

    impl TransactionBackend for CountingBackend {
        type Transaction = u32;
        type Pool = &'static str;

        fn pool(&self) -> &Self::Pool {
            &"pool"
        }

        fn begin(&self) -> BoxFuture<'_, Result<u32, TransactionError>> {
            Box::pin(async move { Ok(self.next.fetch_add(1, Ordering::SeqCst) + 1) })
        }

        fn commit(&self, _tx: u32) -> BoxFuture<'_, Result<(), TransactionError>> {
            Box::pin(async move {
                self.commits.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        }

        fn rollback(&self, _tx: u32) -> BoxFuture<'_, Result<(), TransactionError>> {
            Box::pin(async move {
                self.rollbacks.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        }
    }

    #[tokio::test]
    async fn resolve_prefers_bound_transaction() {
        let txc = TxContext::new(CountingBackend::default());
        let root = Context::background();

        assert!(matches!(txc.resolve(&root).await, Executor::Pool(&"pool")));

        let ctx = txc.begin(&root).await.unwrap();
        let executor = txc.resolve(&ctx).await;
        assert!(matches!(executor, Executor::Transaction(ref tx) if **tx == 1));
        drop(executor);

        // The caller's context never sees the transaction.
        assert!(!txc.in_transaction(&root).await);
    }

    #[tokio::test]
    async fn commit_empties_the_slot() {
        let txc = TxContext::new(CountingBackend::default());
        let ctx = txc.begin(&Context::background()).await.unwrap();

        txc.commit(&ctx).await.unwrap();
        assert_eq!(txc.backend().commits.load(Ordering::SeqCst), 1);
        assert!(!txc.resolve(&ctx).await.is_transactional());
        assert_eq!(txc.commit(&ctx).await, Err(TransactionError::NoActiveTransaction));
    }

    #[tokio::test]
    async fn commit_and_rollback_without_transaction_fail() {
        let txc = TxContext::new(CountingBackend::default());
        let ctx = Context::background();

        assert_eq!(txc.commit(&ctx).await, Err(TransactionError::NoActiveTransaction));
        assert_eq!(txc.rollback(&ctx).await, Err(TransactionError::NoActiveTransaction));
    }

    #[tokio::test]
    async fn second_begin_on_same_lineage_is_rejected() {
        let txc = TxContext::new(CountingBackend::default());
        let ctx = txc.begin(&Context::background()).await.unwrap();
        let child = ctx.with_method_name("inner");

        assert_eq!(txc.begin(&child).await.unwrap_err(), TransactionError::AlreadyActive);

        txc.rollback(&ctx).await.unwrap();
        assert!(txc.begin(&child).await.is_ok());
    }
}
