//! Middleware chain.
//!
//! A [`ServiceMiddleware`] holds global middlewares and per-method middleware
//! lists. [`ServiceMiddleware::wrap`] returns a handler that, on every call,
//! assembles the chain from the registrations current at that moment:
//!
//! ```text
//!   globals (registration order) ++ method's required middlewares (registration order)
//!
//!   wrap("m", h) with globals [A, B] and "m" → [C]:
//!
//!     in:   A → B → C → h
//!     out:  h → C → B → A
//! ```
//!
//! Registrations are append-only. Middlewares registered with
//! [`ServiceMiddleware::use_optional_for_method`] are recorded but never placed
//! in the chain.

use crate::ServiceError;
use relay_core::{BoxFuture, Context};
use smallvec::SmallVec;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};

/// Future returned by a [`Handler`].
pub type HandlerFuture<Resp> = BoxFuture<'static, Result<Resp, ServiceError>>;

/// A request handler: takes the request context and the request, returns the response.
pub type Handler<Req, Resp> = Arc<dyn Fn(Context, Req) -> HandlerFuture<Resp> + Send + Sync>;

/// Turn an async closure into a [`Handler`].
pub fn handler_fn<Req, Resp, F, Fut>(f: F) -> Handler<Req, Resp>
where
    F: Fn(Context, Req) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Resp, ServiceError>> + Send + 'static,
{
    Arc::new(move |ctx, req| -> HandlerFuture<Resp> { Box::pin(f(ctx, req)) })
}

/// Cross-cutting behavior wrapped around a handler without changing its signature.
pub trait Middleware<Req, Resp>: Send + Sync {
    /// Return a handler that runs this middleware around `next`.
    fn wrap(&self, next: Handler<Req, Resp>) -> Handler<Req, Resp>;
}

/// A middleware that is never invoked.
///
/// Keeps the inner middleware around so it can be inspected or enabled later,
/// but always passes straight through to the next handler.
pub struct Optional<M> {
    inner: M,
}

impl<M> Optional<M> {
    /// Wrap a middleware that should stay inactive.
    #[must_use]
    pub const fn new(inner: M) -> Self {
        Self { inner }
    }

    /// The wrapped middleware.
    #[must_use]
    pub const fn inner(&self) -> &M {
        &self.inner
    }
}

impl<Req, Resp, M> Middleware<Req, Resp> for Optional<M>
where
    M: Send + Sync,
{
    fn wrap(&self, next: Handler<Req, Resp>) -> Handler<Req, Resp> {
        next
    }
}

struct Registration<Req, Resp> {
    middleware: Arc<dyn Middleware<Req, Resp>>,
    required: bool,
}

impl<Req, Resp> Clone for Registration<Req, Resp> {
    fn clone(&self) -> Self {
        Self {
            middleware: Arc::clone(&self.middleware),
            required: self.required,
        }
    }
}

struct Registry<Req, Resp> {
    globals: Vec<Arc<dyn Middleware<Req, Resp>>>,
    methods: HashMap<String, Vec<Registration<Req, Resp>>>,
}

type Chain<Req, Resp> = SmallVec<[Arc<dyn Middleware<Req, Resp>>; 8]>;

impl<Req, Resp> Registry<Req, Resp> {
    fn chain_for(&self, method: &str) -> Chain<Req, Resp> {
        let mut chain: Chain<Req, Resp> = self.globals.iter().cloned().collect();
        if let Some(registrations) = self.methods.get(method) {
            chain.extend(
                registrations
                    .iter()
                    .filter(|r| r.required)
                    .map(|r| Arc::clone(&r.middleware)),
            );
        }
        chain
    }
}

/// Global and per-method middlewares for one service.
///
/// `Req` and `Resp` are the service's closed request and response types.
pub struct ServiceMiddleware<Req, Resp> {
    registry: Arc<RwLock<Registry<Req, Resp>>>,
}

impl<Req, Resp> Clone for ServiceMiddleware<Req, Resp> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
        }
    }
}

impl<Req, Resp> ServiceMiddleware<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    /// Create a chain with the given global middlewares (first is outermost).
    #[must_use]
    pub fn new(globals: Vec<Arc<dyn Middleware<Req, Resp>>>) -> Self {
        Self {
            registry: Arc::new(RwLock::new(Registry {
                globals,
                methods: HashMap::new(),
            })),
        }
    }

    /// Append a global middleware.
    pub fn use_global(&mut self, middleware: impl Middleware<Req, Resp> + 'static) -> &mut Self {
        self.write().globals.push(Arc::new(middleware));
        self
    }

    /// Append a middleware to `method`'s list.
    pub fn use_for_method(
        &mut self,
        method: impl Into<String>,
        middleware: impl Middleware<Req, Resp> + 'static,
    ) -> &mut Self {
        self.register(method.into(), Arc::new(middleware), true)
    }

    /// Record an optional middleware for `method`. Optional middlewares are never invoked.
    pub fn use_optional_for_method(
        &mut self,
        method: impl Into<String>,
        middleware: impl Middleware<Req, Resp> + 'static,
    ) -> &mut Self {
        self.register(method.into(), Arc::new(middleware), false)
    }

    /// Number of middlewares that would run for `method` right now.
    #[must_use]
    pub fn chain_len(&self, method: &str) -> usize {
        self.read().chain_for(method).len()
    }

    /// Wrap `handler` for `method`.
    ///
    /// The returned handler binds `method` into the context as the method name
    /// and assembles the chain on every call.
    pub fn wrap(&self, method: impl Into<String>, handler: Handler<Req, Resp>) -> Handler<Req, Resp> {
        let method: Arc<str> = Arc::from(method.into());
        let registry = Arc::clone(&self.registry);

        Arc::new(move |ctx: Context, req: Req| {
            let chain = registry
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .chain_for(&method);

            let mut next = Arc::clone(&handler);
            for middleware in chain.iter().rev() {
                next = middleware.wrap(next);
            }

            let ctx = if ctx.method_name() == &*method {
                ctx
            } else {
                ctx.with_method_name(method.to_string())
            };
            next(ctx, req)
        })
    }

    fn register(
        &mut self,
        method: String,
        middleware: Arc<dyn Middleware<Req, Resp>>,
        required: bool,
    ) -> &mut Self {
        self.write()
            .methods
            .entry(method)
            .or_default()
            .push(Registration { middleware, required });
        self
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Registry<Req, Resp>> {
        self.registry.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Registry<Req, Resp>> {
        self.registry.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<Req, Resp> Default for ServiceMiddleware<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Mutex;

    type Trace = Arc<Mutex<Vec<String>>>;

    /// Records `>name` on the way in and `<name` on the way out.
    struct Recorder {
        name: String,
        trace: Trace,
    }

    impl Recorder {
        fn new(name: &str, trace: &Trace) -> Self {
            Self {
                name: name.to_string(),
                trace: Arc::clone(trace),
            }
        }
    }

    impl Middleware<u32, u32> for Recorder {
        fn wrap(&self, next: Handler<u32, u32>) -> Handler<u32, u32> {
            let name = self.name.clone();
            let trace = Arc::clone(&self.trace);
            Arc::new(move |ctx, req| -> HandlerFuture<u32> {
                let next = Arc::clone(&next);
                let name = name.clone();
                let trace = Arc::clone(&trace);
                Box::pin(async move {
                    trace.lock().unwrap().push(format!(">{name}"));
                    let result = next(ctx, req).await;
                    trace.lock().unwrap().push(format!("<{name}"));
                    result
                })
            })
        }
    }

    fn recording_handler(trace: &Trace) -> Handler<u32, u32> {
        let trace = Arc::clone(trace);
        handler_fn(move |_ctx, req: u32| {
            let trace = Arc::clone(&trace);
            async move {
                trace.lock().unwrap().push("h".to_string());
                Ok(req + 1)
            }
        })
    }

    #[tokio::test]
    async fn globals_then_method_middlewares_then_handler() {
        let trace: Trace = Arc::default();
        let mut chain = ServiceMiddleware::new(vec![
            Arc::new(Recorder::new("A", &trace)) as Arc<dyn Middleware<u32, u32>>,
            Arc::new(Recorder::new("B", &trace)),
        ]);
        chain.use_for_method("m", Recorder::new("C", &trace));

        let handler = chain.wrap("m", recording_handler(&trace));
        assert_eq!(handler(Context::background(), 1).await.unwrap(), 2);

        assert_eq!(
            *trace.lock().unwrap(),
            vec![">A", ">B", ">C", "h", "<C", "<B", "<A"]
        );
    }

    #[tokio::test]
    async fn other_methods_do_not_see_method_middlewares() {
        let trace: Trace = Arc::default();
        let mut chain = ServiceMiddleware::default();
        chain.use_global(Recorder::new("A", &trace));
        chain.use_for_method("m", Recorder::new("C", &trace));

        let handler = chain.wrap("other", recording_handler(&trace));
        handler(Context::background(), 0).await.unwrap();

        assert_eq!(*trace.lock().unwrap(), vec![">A", "h", "<A"]);
    }

    #[tokio::test]
    async fn optional_middlewares_are_never_invoked() {
        let trace: Trace = Arc::default();
        let mut chain = ServiceMiddleware::default();
        chain.use_optional_for_method("m", Recorder::new("X", &trace));
        chain.use_for_method("m", Optional::new(Recorder::new("Y", &trace)));

        let handler = chain.wrap("m", recording_handler(&trace));
        handler(Context::background(), 0).await.unwrap();

        assert_eq!(*trace.lock().unwrap(), vec!["h"]);
        assert_eq!(chain.chain_len("m"), 1);
    }

    #[tokio::test]
    async fn chain_is_assembled_per_invocation() {
        let trace: Trace = Arc::default();
        let mut chain = ServiceMiddleware::default();
        let handler = chain.wrap("m", recording_handler(&trace));

        handler(Context::background(), 0).await.unwrap();
        chain.use_for_method("m", Recorder::new("late", &trace));
        handler(Context::background(), 0).await.unwrap();

        assert_eq!(*trace.lock().unwrap(), vec!["h", ">late", "h", "<late"]);
    }

    #[tokio::test]
    async fn method_name_is_bound_for_inner_middlewares() {
        let chain: ServiceMiddleware<u32, String> = ServiceMiddleware::default();
        let handler = chain.wrap(
            "book.SaveBook",
            handler_fn(|ctx: Context, _req: u32| async move { Ok(ctx.method_name().to_string()) }),
        );

        assert_eq!(handler(Context::background(), 0).await.unwrap(), "book.SaveBook");
    }

    proptest! {
        #[test]
        fn order_matches_registration(globals in 0usize..5, locals in 0usize..5) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let trace: Trace = Arc::default();
            let mut chain = ServiceMiddleware::default();
            for i in 0..globals {
                chain.use_global(Recorder::new(&format!("g{i}"), &trace));
            }
            for i in 0..locals {
                chain.use_for_method("m", Recorder::new(&format!("m{i}"), &trace));
            }

            let handler = chain.wrap("m", recording_handler(&trace));
            rt.block_on(handler(Context::background(), 0)).unwrap();

            let names: Vec<String> = (0..globals)
                .map(|i| format!("g{i}"))
                .chain((0..locals).map(|i| format!("m{i}")))
                .collect();
            let mut expected: Vec<String> = names.iter().map(|n| format!(">{n}")).collect();
            expected.push("h".to_string());
            expected.extend(names.iter().rev().map(|n| format!("<{n}")));

            prop_assert_eq!(trace.lock().unwrap().clone(), expected);
        }
    }
}
