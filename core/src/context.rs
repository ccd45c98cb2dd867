//! Request-scoped context.
//!
//! A [`Context`] travels with a single request through the middleware chain and
//! into handlers. It carries:
//!
//! - **Typed values**: looked up by type, never by untyped key. A missing value is
//!   `None`, not a failed cast.
//! - **Cancellation**: a [`CancellationToken`] plus an optional deadline. Children
//!   are cancelled with their parent; the earliest deadline wins.
//! - **A tracing span**: request-scoped log fields, entered by the logging middleware.
//!
//! Contexts are immutable. Every `with_*` call returns a new context that shares
//! its ancestors through an `Arc` chain, so cloning is cheap and values bound
//! further down a call chain never leak back to the caller.
//!
//! # Example
//!
//! ```
//! use relay_core::Context;
//! use std::time::Duration;
//!
//! #[derive(Debug, PartialEq)]
//! struct TenantId(u64);
//!
//! let ctx = Context::background()
//!     .with_method_name("book.SaveBook")
//!     .with_value(TenantId(7))
//!     .with_timeout(Duration::from_secs(5));
//!
//! assert_eq!(ctx.method_name(), "book.SaveBook");
//! assert_eq!(ctx.value::<TenantId>(), Some(&TenantId(7)));
//! assert!(ctx.deadline().is_some());
//! ```

use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Language used when none is bound to the context.
pub const DEFAULT_LANGUAGE: &str = "ru";

/// One link of the value chain.
struct ValueNode {
    type_id: TypeId,
    value: Box<dyn Any + Send + Sync>,
    parent: Option<Arc<ValueNode>>,
}

/// Request-scoped, immutable context.
#[derive(Clone)]
pub struct Context {
    values: Option<Arc<ValueNode>>,
    token: CancellationToken,
    deadline: Option<Instant>,
    span: tracing::Span,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct MethodName(String);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RequestId(Uuid);

#[derive(Debug, Clone, PartialEq, Eq)]
struct UserId(String);

#[derive(Debug, Clone, PartialEq, Eq)]
struct Language(String);

impl Context {
    /// Create an empty root context with no deadline.
    #[must_use]
    pub fn background() -> Self {
        Self {
            values: None,
            token: CancellationToken::new(),
            deadline: None,
            span: tracing::Span::none(),
        }
    }

    /// Bind a value of type `T`, shadowing any value of the same type bound by an ancestor.
    #[must_use]
    pub fn with_value<T: Any + Send + Sync>(&self, value: T) -> Self {
        let node = ValueNode {
            type_id: TypeId::of::<T>(),
            value: Box::new(value),
            parent: self.values.clone(),
        };
        Self {
            values: Some(Arc::new(node)),
            ..self.clone()
        }
    }

    /// Look up the nearest value of type `T`.
    #[must_use]
    pub fn value<T: Any + Send + Sync>(&self) -> Option<&T> {
        let wanted = TypeId::of::<T>();
        let mut node = self.values.as_deref();
        while let Some(current) = node {
            if current.type_id == wanted {
                return current.value.downcast_ref::<T>();
            }
            node = current.parent.as_deref();
        }
        None
    }

    /// Derive a context whose cancellation token is a child of this one.
    ///
    /// Cancelling the child leaves the parent untouched; cancelling the parent
    /// cancels the child.
    #[must_use]
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            ..self.clone()
        }
    }

    /// Derive a child context that is done after `timeout`.
    #[must_use]
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Derive a child context that is done at `deadline` (or earlier, if an ancestor's deadline is earlier).
    #[must_use]
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(existing) if existing <= deadline => existing,
            _ => deadline,
        };
        Self {
            deadline: Some(deadline),
            ..self.child()
        }
    }

    /// The effective deadline, if any.
    #[must_use]
    pub const fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// The cancellation token of this context.
    #[must_use]
    pub const fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Cancel this context and every context derived from it.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Whether the context was cancelled or its deadline has passed.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.token.is_cancelled() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Resolve once the context is cancelled or its deadline passes.
    ///
    /// Never resolves for a background context that nobody cancels.
    pub async fn done(&self) {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    () = self.token.cancelled() => {}
                    () = tokio::time::sleep_until(deadline) => {}
                }
            }
            None => self.token.cancelled().await,
        }
    }

    /// Attach a tracing span carrying request-scoped log fields.
    #[must_use]
    pub fn with_span(&self, span: tracing::Span) -> Self {
        Self {
            span,
            ..self.clone()
        }
    }

    /// The request span (a disabled span if none was attached).
    #[must_use]
    pub const fn span(&self) -> &tracing::Span {
        &self.span
    }

    /// Bind the name of the service method being invoked.
    #[must_use]
    pub fn with_method_name(&self, method: impl Into<String>) -> Self {
        self.with_value(MethodName(method.into()))
    }

    /// The bound method name, or `""` when none is bound.
    #[must_use]
    pub fn method_name(&self) -> &str {
        self.value::<MethodName>().map_or("", |m| m.0.as_str())
    }

    /// Bind a request id.
    #[must_use]
    pub fn with_request_id(&self, id: Uuid) -> Self {
        self.with_value(RequestId(id))
    }

    /// Bind a freshly generated request id.
    #[must_use]
    pub fn with_new_request_id(&self) -> Self {
        self.with_request_id(Uuid::new_v4())
    }

    /// The bound request id.
    #[must_use]
    pub fn request_id(&self) -> Option<Uuid> {
        self.value::<RequestId>().map(|r| r.0)
    }

    /// Bind the calling user's id.
    #[must_use]
    pub fn with_user_id(&self, user_id: impl Into<String>) -> Self {
        self.with_value(UserId(user_id.into()))
    }

    /// The calling user's id.
    #[must_use]
    pub fn user_id(&self) -> Option<&str> {
        self.value::<UserId>().map(|u| u.0.as_str())
    }

    /// Bind the request language.
    #[must_use]
    pub fn with_language(&self, language: impl Into<String>) -> Self {
        self.with_value(Language(language.into()))
    }

    /// The request language, [`DEFAULT_LANGUAGE`] when none is bound.
    #[must_use]
    pub fn language(&self) -> &str {
        self.value::<Language>().map_or(DEFAULT_LANGUAGE, |l| l.0.as_str())
    }

    /// Copy request identity (request id, user id, language) into a fresh background context.
    ///
    /// Used for work that must outlive the request: the copy has no deadline,
    /// no cancellation link and no transaction.
    #[must_use]
    pub fn detached(&self) -> Self {
        let mut ctx = Self::background().with_language(self.language().to_string());
        if let Some(id) = self.request_id() {
            ctx = ctx.with_request_id(id);
        }
        if let Some(user) = self.user_id() {
            ctx = ctx.with_user_id(user.to_string());
        }
        ctx
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("method", &self.method_name())
            .field("request_id", &self.request_id())
            .field("deadline", &self.deadline)
            .field("cancelled", &self.token.is_cancelled())
            .finish_non_exhaustive()
    }
}
