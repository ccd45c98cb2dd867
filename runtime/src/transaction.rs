//! One transaction per invocation.
//!
//! [`TransactionMiddleware`] begins a transaction, binds it into the context
//! handed to the inner handler, and settles it from the handler's outcome:
//!
//! | inner result | action | returned |
//! |---|---|---|
//! | `Ok(resp)` | commit | `Ok(resp)`; a commit failure is logged, or returned as [`ServiceError::Transaction`] with [`surface_commit_errors`](TransactionMiddleware::surface_commit_errors) |
//! | `Err(e)` | rollback | `Err(e)` unchanged; a rollback failure is only logged |
//!
//! If the handler settles the transaction itself, the middleware finds no
//! active transaction and only logs it.

use crate::ServiceError;
use crate::middleware::{Handler, HandlerFuture, Middleware};
use relay_core::transaction::{TransactionBackend, TxContext};
use std::sync::Arc;

/// Wraps each invocation in a transaction.
pub struct TransactionMiddleware<B: TransactionBackend> {
    tx: TxContext<B>,
    surface_commit_errors: bool,
}

impl<B: TransactionBackend> Clone for TransactionMiddleware<B> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            surface_commit_errors: self.surface_commit_errors,
        }
    }
}

impl<B: TransactionBackend> TransactionMiddleware<B> {
    /// Create a middleware running transactions through `tx`.
    ///
    /// Commit failures are logged and not returned.
    #[must_use]
    pub const fn new(tx: TxContext<B>) -> Self {
        Self {
            tx,
            surface_commit_errors: false,
        }
    }

    /// Return commit failures to the caller as [`ServiceError::Transaction`].
    #[must_use]
    pub const fn surface_commit_errors(mut self, surface: bool) -> Self {
        self.surface_commit_errors = surface;
        self
    }
}

impl<Req, Resp, B> Middleware<Req, Resp> for TransactionMiddleware<B>
where
    Req: Send + 'static,
    Resp: Send + 'static,
    B: TransactionBackend,
{
    fn wrap(&self, next: Handler<Req, Resp>) -> Handler<Req, Resp> {
        let this = self.clone();
        Arc::new(move |ctx, req| -> HandlerFuture<Resp> {
            let next = Arc::clone(&next);
            let this = this.clone();
            Box::pin(async move {
                let tx_ctx = this.tx.begin(&ctx).await?;

                match next(tx_ctx.clone(), req).await {
                    Err(err) => {
                        if let Err(rollback_err) = this.tx.rollback(&tx_ctx).await {
                            tracing::error!(
                                method = ctx.method_name(),
                                error = %rollback_err,
                                cause = %err,
                                "Failed to rollback transaction"
                            );
                        }
                        Err(err)
                    }
                    Ok(response) => {
                        if let Err(commit_err) = this.tx.commit(&tx_ctx).await {
                            tracing::error!(
                                method = ctx.method_name(),
                                error = %commit_err,
                                "Failed to commit transaction"
                            );
                            if this.surface_commit_errors {
                                return Err(ServiceError::Transaction(commit_err));
                            }
                        }
                        Ok(response)
                    }
                }
            })
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::{ServiceMiddleware, handler_fn};
    use relay_core::Context;
    use relay_core::error::{AppError, PLATFORM_USER_NOT_FOUND};
    use relay_core::transaction::TransactionError;
    use relay_testing::InMemoryTransactions;

    fn chain(
        txc: &TxContext<InMemoryTransactions>,
        handler: Handler<bool, &'static str>,
    ) -> Handler<bool, &'static str> {
        let mut chain = ServiceMiddleware::default();
        chain.use_for_method("book.Save", TransactionMiddleware::new(txc.clone()));
        chain.wrap("book.Save", handler)
    }

    fn handler(txc: &TxContext<InMemoryTransactions>) -> Handler<bool, &'static str> {
        let txc = txc.clone();
        handler_fn(move |ctx: Context, fail: bool| {
            let txc = txc.clone();
            async move {
                assert!(txc.resolve(&ctx).await.is_transactional());
                if fail {
                    Err(ServiceError::from(
                        AppError::new(PLATFORM_USER_NOT_FOUND).with_message("no such author"),
                    ))
                } else {
                    Ok("saved")
                }
            }
        })
    }

    #[tokio::test]
    async fn success_commits_exactly_once() {
        let txc = TxContext::new(InMemoryTransactions::new());
        let wrapped = chain(&txc, handler(&txc));

        assert_eq!(wrapped(Context::background(), false).await.unwrap(), "saved");

        let stats = txc.backend().stats();
        assert_eq!((stats.begun, stats.committed, stats.rolled_back), (1, 1, 0));
    }

    #[tokio::test]
    async fn failure_rolls_back_and_returns_original_error() {
        let txc = TxContext::new(InMemoryTransactions::new());
        let wrapped = chain(&txc, handler(&txc));

        let err = wrapped(Context::background(), true).await.unwrap_err();

        let ServiceError::App(app) = err else {
            unreachable!("expected the handler's error, got {err:?}");
        };
        assert!(app.is(&PLATFORM_USER_NOT_FOUND));
        assert_eq!(app.message(), "no such author");

        let stats = txc.backend().stats();
        assert_eq!((stats.begun, stats.committed, stats.rolled_back), (1, 0, 1));
    }

    #[tokio::test]
    async fn commit_failure_is_logged_by_default() {
        let txc = TxContext::new(InMemoryTransactions::new());
        txc.backend().fail_commits(true);
        let wrapped = chain(&txc, handler(&txc));

        assert_eq!(wrapped(Context::background(), false).await.unwrap(), "saved");
        assert_eq!(txc.backend().stats().committed, 0);
    }

    #[tokio::test]
    async fn commit_failure_can_be_surfaced() {
        let txc = TxContext::new(InMemoryTransactions::new());
        txc.backend().fail_commits(true);

        let mut chain = ServiceMiddleware::default();
        chain.use_for_method(
            "book.Save",
            TransactionMiddleware::new(txc.clone()).surface_commit_errors(true),
        );
        let wrapped = chain.wrap("book.Save", handler(&txc));

        let err = wrapped(Context::background(), false).await.unwrap_err();
        assert!(matches!(err, ServiceError::Transaction(TransactionError::Commit(_))));
    }

    #[tokio::test]
    async fn nested_transaction_is_rejected_before_handler_runs() {
        let txc = TxContext::new(InMemoryTransactions::new());
        let wrapped = chain(&txc, handler(&txc));

        let outer = txc.begin(&Context::background()).await.unwrap();
        let err = wrapped(outer.clone(), false).await.unwrap_err();

        assert!(matches!(err, ServiceError::Transaction(TransactionError::AlreadyActive)));
        assert_eq!(txc.backend().stats().begun, 1);
        txc.rollback(&outer).await.unwrap();
    }
}
