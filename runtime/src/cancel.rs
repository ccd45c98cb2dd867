//! Panic recovery and caller cancellation.
//!
//! [`WaitContextCancel`] runs the inner handler in its own task and races it
//! against the caller's context:
//!
//! ```text
//!   caller ctx ──child()──► inner ctx ──► tokio::spawn(inner handler)
//!        │                                    │
//!        ├── done first:  cancel inner ctx, abort task  → ServiceError::Timeout
//!        └── task first:  Ok/Err as returned            → passed through
//!                         panicked                      → ServiceError::Panicked
//! ```
//!
//! Aborting takes effect at the inner handler's next `.await`; work between
//! two suspension points (a blocking call, a CPU loop) runs to its end, but no
//! further. Handlers doing long blocking work should check
//! [`Context::is_done`](relay_core::Context::is_done) themselves.

use crate::ServiceError;
use crate::middleware::{Handler, HandlerFuture, Middleware};
use std::any::Any;
use std::sync::Arc;

/// Recovers panics and stops waiting once the caller's context is done.
#[derive(Debug, Clone, Copy, Default)]
pub struct WaitContextCancel;

impl WaitContextCancel {
    /// Create the middleware.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl<Req, Resp> Middleware<Req, Resp> for WaitContextCancel
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    fn wrap(&self, next: Handler<Req, Resp>) -> Handler<Req, Resp> {
        Arc::new(move |ctx, req| -> HandlerFuture<Resp> {
            let next = Arc::clone(&next);
            Box::pin(async move {
                if ctx.is_done() {
                    return Err(ServiceError::Timeout);
                }

                let inner_ctx = ctx.child();
                let inner_token = inner_ctx.token().clone();
                let mut task = tokio::spawn(next(inner_ctx, req));

                tokio::select! {
                    joined = &mut task => match joined {
                        Ok(result) => result,
                        Err(err) if err.is_panic() => {
                            let message = panic_message(err.into_panic().as_ref());
                            tracing::error!(
                                method = ctx.method_name(),
                                panic = %message,
                                "Recovered from panic in handler"
                            );
                            Err(ServiceError::Panicked(message))
                        }
                        Err(err) => Err(ServiceError::Internal(anyhow::anyhow!("handler task failed: {err}"))),
                    },
                    () = ctx.done() => {
                        inner_token.cancel();
                        task.abort();
                        tracing::warn!(method = ctx.method_name(), "Context done before handler finished");
                        Err(ServiceError::Timeout)
                    }
                }
            })
        })
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::{ServiceMiddleware, handler_fn};
    use relay_core::Context;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    fn chain() -> ServiceMiddleware<u64, u64> {
        let mut chain = ServiceMiddleware::default();
        chain.use_global(WaitContextCancel::new());
        chain
    }

    #[tokio::test]
    async fn result_passes_through() {
        let handler = chain().wrap("m", handler_fn(|_ctx, n: u64| async move { Ok(n + 1) }));
        assert_eq!(handler(Context::background(), 41).await.unwrap(), 42);
    }

    #[tokio::test]
    async fn panic_is_recovered() {
        let handler = chain().wrap(
            "m",
            handler_fn(|_ctx, n: u64| async move {
                if n > 0 {
                    panic!("boom");
                }
                Ok(n)
            }),
        );

        let err = handler(Context::background(), 1).await.unwrap_err();
        assert!(matches!(err, ServiceError::Panicked(ref msg) if msg == "boom"));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_wins_over_slow_handler() {
        let finished = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&finished);
        let handler = chain().wrap(
            "m",
            handler_fn(move |_ctx, n: u64| {
                let flag = Arc::clone(&flag);
                async move {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    flag.store(true, Ordering::SeqCst);
                    Ok(n)
                }
            }),
        );

        let ctx = Context::background().with_timeout(Duration::from_millis(100));
        let err = handler(ctx, 1).await.unwrap_err();
        assert!(matches!(err, ServiceError::Timeout));

        // The inner task was aborted and never completes.
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(!finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn inner_context_is_cancelled_with_caller() {
        let (seen_tx, seen_rx) = tokio::sync::oneshot::channel::<Context>();
        let seen_tx = Arc::new(std::sync::Mutex::new(Some(seen_tx)));
        let handler = chain().wrap(
            "m",
            handler_fn(move |ctx: Context, n: u64| {
                if let Some(tx) = seen_tx.lock().unwrap().take() {
                    let _ = tx.send(ctx.clone());
                }
                async move {
                    std::future::pending::<()>().await;
                    Ok(n)
                }
            }),
        );

        let caller = Context::background();
        let call = tokio::spawn(handler(caller.clone(), 1));
        let inner = seen_rx.await.unwrap();
        assert!(!inner.is_done());

        caller.cancel();
        assert!(matches!(call.await.unwrap(), Err(ServiceError::Timeout)));
        assert!(inner.is_done());
    }

    #[tokio::test]
    async fn already_done_context_skips_handler() {
        let called = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&called);
        let handler = chain().wrap(
            "m",
            handler_fn(move |_ctx, n: u64| {
                flag.store(true, Ordering::SeqCst);
                async move { Ok(n) }
            }),
        );

        let ctx = Context::background();
        ctx.cancel();
        assert!(matches!(handler(ctx, 1).await, Err(ServiceError::Timeout)));
        assert!(!called.load(Ordering::SeqCst));
    }
}
