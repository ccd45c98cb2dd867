//! # Relay Runtime
//!
//! Request-processing pipeline for Relay services.
//!
//! A service exposes one closed request enum and one closed response enum; every
//! method goes through the same [`ServiceMiddleware`] chain, so cross-cutting
//! behavior is written once and composed uniformly:
//!
//! - [`metrics::MetricsMiddleware`]: request/error counters and latency per method
//! - [`logging::LoggingMiddleware`]: structured request/response logging
//! - [`validation::ValidationMiddleware`]: structural validation, short-circuits on failure
//! - [`cancel::WaitContextCancel`]: panic recovery and caller cancellation
//! - [`transaction::TransactionMiddleware`]: one transaction per invocation
//!
//! Process-level telemetry (the tracing subscriber and the Prometheus recorder)
//! lives in [`telemetry`] and [`metrics`].
//!
//! ## Example
//!
//! ```
//! use relay_core::Context;
//! use relay_runtime::{ServiceMiddleware, handler_fn};
//! use relay_runtime::cancel::WaitContextCancel;
//!
//! # async fn example() -> Result<(), relay_runtime::ServiceError> {
//! let mut chain: ServiceMiddleware<String, usize> = ServiceMiddleware::new(Vec::new());
//! chain.use_global(WaitContextCancel::new());
//!
//! let handler = chain.wrap("strings.Len", handler_fn(|_ctx, s: String| async move { Ok(s.len()) }));
//! assert_eq!(handler(Context::background(), "hello".into()).await?, 5);
//! # Ok(())
//! # }
//! ```

pub mod cancel;
pub mod config;
pub mod logging;
pub mod metrics;
pub mod middleware;
pub mod telemetry;
pub mod transaction;
pub mod validation;

pub use middleware::{Handler, HandlerFuture, Middleware, Optional, ServiceMiddleware, handler_fn};

/// Error types for the request pipeline
pub mod error {
    use relay_core::error::{COMMON_INTERNAL, COMMON_TIMEOUT, PLATFORM_VALIDATION};
    use relay_core::transaction::TransactionError;
    use relay_core::validate::ValidationErrors;
    use relay_core::AppError;
    use thiserror::Error;

    /// Errors returned by a wrapped handler.
    ///
    /// Handler errors pass through the chain unchanged; middlewares only add the
    /// variants they produce themselves.
    #[derive(Error, Debug)]
    pub enum ServiceError {
        /// A structured error with a stable code.
        #[error(transparent)]
        App(#[from] AppError),

        /// The request failed structural validation.
        #[error(transparent)]
        Validation(#[from] ValidationErrors),

        /// The caller's context was cancelled or its deadline passed first.
        #[error("request cancelled or deadline exceeded")]
        Timeout,

        /// The handler panicked; the panic was recovered.
        #[error("handler panicked: {0}")]
        Panicked(String),

        /// The transactional context failed.
        #[error(transparent)]
        Transaction(#[from] TransactionError),

        /// A handler returned a response variant the caller did not expect.
        #[error("unexpected response, expected {0}")]
        UnexpectedResponse(&'static str),

        /// Any other internal failure.
        #[error(transparent)]
        Internal(#[from] anyhow::Error),
    }

    impl ServiceError {
        /// The registry code this error is presented with across a boundary.
        ///
        /// Internal-only failures share [`COMMON_INTERNAL`].
        #[must_use]
        pub fn app_code(&self) -> u32 {
            match self {
                Self::App(err) => err.code(),
                Self::Validation(_) => PLATFORM_VALIDATION.code,
                Self::Timeout => COMMON_TIMEOUT.code,
                Self::Panicked(_)
                | Self::Transaction(_)
                | Self::UnexpectedResponse(_)
                | Self::Internal(_) => COMMON_INTERNAL.code,
            }
        }

        /// Convert into the cross-boundary [`AppError`], keeping the cause.
        #[must_use]
        pub fn into_app_error(self) -> AppError {
            match self {
                Self::App(err) => err,
                Self::Validation(errors) => errors.into(),
                Self::Timeout => AppError::new(COMMON_TIMEOUT),
                Self::Panicked(message) => AppError::new(COMMON_INTERNAL).with_message(message),
                Self::Transaction(err) => AppError::new(COMMON_INTERNAL).wrap(err),
                Self::UnexpectedResponse(expected) => AppError::new(COMMON_INTERNAL)
                    .with_metadata("expected", expected),
                Self::Internal(err) => AppError::new(COMMON_INTERNAL).wrap(err),
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use relay_core::error::{PLATFORM_USER_NOT_FOUND, is_error_code};

        #[test]
        fn app_codes_follow_the_registry() {
            let not_found: ServiceError = AppError::new(PLATFORM_USER_NOT_FOUND).into();
            assert_eq!(not_found.app_code(), 1003);
            assert_eq!(ServiceError::Timeout.app_code(), COMMON_TIMEOUT.code);
            assert_eq!(
                ServiceError::Transaction(TransactionError::NoActiveTransaction).app_code(),
                COMMON_INTERNAL.code
            );
        }

        #[test]
        fn app_error_survives_conversion() {
            let err: ServiceError = AppError::new(PLATFORM_USER_NOT_FOUND).into();
            let app = err.into_app_error();
            assert!(is_error_code(&app, &PLATFORM_USER_NOT_FOUND));
        }
    }
}

pub use error::ServiceError;
