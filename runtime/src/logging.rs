//! Request/response logging.

use crate::middleware::{Handler, HandlerFuture, Middleware};
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;
use tracing::Instrument;

/// Logs the request before invocation and the outcome with elapsed time after.
///
/// Opens a `request` span carrying the method name and request id, attaches it
/// to the context (so inner code logging through [`Context::span`] shares the
/// fields) and runs the inner handler inside it.
///
/// [`Context::span`]: relay_core::Context::span
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingMiddleware;

impl LoggingMiddleware {
    /// Create the middleware.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl<Req, Resp> Middleware<Req, Resp> for LoggingMiddleware
where
    Req: Debug + Send + 'static,
    Resp: Debug + Send + 'static,
{
    fn wrap(&self, next: Handler<Req, Resp>) -> Handler<Req, Resp> {
        Arc::new(move |ctx, req| -> HandlerFuture<Resp> {
            let next = Arc::clone(&next);
            let request_id = ctx.request_id().map(|id| id.to_string()).unwrap_or_default();
            let span = tracing::info_span!(
                "request",
                method = %ctx.method_name(),
                request_id = %request_id,
                user_id = ctx.user_id().unwrap_or_default(),
            );
            let ctx = ctx.with_span(span.clone());

            Box::pin(
                async move {
                    tracing::info!(request = ?req, "Request received");
                    let start = Instant::now();

                    let result = next(ctx, req).await;

                    let elapsed_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
                    match &result {
                        Ok(response) => {
                            tracing::info!(response = ?response, elapsed_ms, "Request completed");
                        }
                        Err(err) => {
                            tracing::error!(
                                error = %err,
                                code = err.app_code(),
                                elapsed_ms,
                                "Request failed"
                            );
                        }
                    }
                    result
                }
                .instrument(span),
            )
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::{ServiceError, ServiceMiddleware, handler_fn};
    use relay_core::Context;

    #[tokio::test]
    async fn outcome_is_returned_unchanged() {
        let mut chain: ServiceMiddleware<u8, u8> = ServiceMiddleware::default();
        chain.use_global(LoggingMiddleware::new());

        let ok = chain.wrap("ok", handler_fn(|_ctx, n: u8| async move { Ok(n) }));
        let failing = chain.wrap(
            "fail",
            handler_fn(|_ctx, _n: u8| async move { Err::<u8, _>(ServiceError::UnexpectedResponse("Book")) }),
        );

        assert_eq!(ok(Context::background(), 7).await.unwrap(), 7);
        assert!(matches!(
            failing(Context::background(), 7).await,
            Err(ServiceError::UnexpectedResponse("Book"))
        ));
    }
}
