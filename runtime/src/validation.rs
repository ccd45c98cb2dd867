//! Structural request validation.

use crate::ServiceError;
use crate::middleware::{Handler, HandlerFuture, Middleware};
use relay_core::validate::Validate;
use std::sync::Arc;

/// Runs [`Validate::validate`] on the request and short-circuits on failure.
///
/// The inner handler is not called for an invalid request; the caller gets
/// [`ServiceError::Validation`] with every violated rule.
#[derive(Debug, Clone, Copy, Default)]
pub struct ValidationMiddleware;

impl ValidationMiddleware {
    /// Create the middleware.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl<Req, Resp> Middleware<Req, Resp> for ValidationMiddleware
where
    Req: Validate + Send + 'static,
    Resp: Send + 'static,
{
    fn wrap(&self, next: Handler<Req, Resp>) -> Handler<Req, Resp> {
        Arc::new(move |ctx, req: Req| -> HandlerFuture<Resp> {
            if let Err(errors) = req.validate() {
                tracing::debug!(
                    method = ctx.method_name(),
                    violations = errors.fields().len(),
                    "Request rejected by validation"
                );
                return Box::pin(async move { Err(ServiceError::Validation(errors)) });
            }
            next(ctx, req)
        })
    }
}
