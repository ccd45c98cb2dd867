//! Prometheus metrics.
//!
//! [`MetricsServer`] installs the global Prometheus recorder and serves the
//! scrape endpoint. [`MetricsMiddleware`] records per-method request metrics
//! through the `metrics` facade, so it works with any installed recorder (and
//! is a no-op without one).
//!
//! # Request metrics
//!
//! With the default [`MetricsConfig`] (`api` / `service`):
//!
//! | metric | kind | labels |
//! |---|---|---|
//! | `api_service_request_count` | counter | `method` |
//! | `api_service_error_count` | counter | `method`, `code` |
//! | `api_service_request_latency_seconds` | histogram | `method` |
//!
//! # Example
//!
//! ```rust,no_run
//! use relay_runtime::config::MetricsConfig;
//! use relay_runtime::metrics::MetricsServer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start(&MetricsConfig::default())?;
//! // Metrics available at http://localhost:9090/metrics
//! # Ok(())
//! # }
//! ```

use crate::config::MetricsConfig;
use crate::middleware::{Handler, HandlerFuture, Middleware};
use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

/// Records delivered by the producer.
pub const PRODUCER_DELIVERED: &str = "relay_producer_messages_delivered_total";
/// Delivery failures reported to the producer.
pub const PRODUCER_DELIVERY_ERRORS: &str = "relay_producer_delivery_errors_total";
/// Records dispatched by the consumer.
pub const CONSUMER_PROCESSED: &str = "relay_consumer_messages_processed_total";
/// Handler failures seen by the consumer.
pub const CONSUMER_HANDLER_ERRORS: &str = "relay_consumer_handler_errors_total";

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus metrics server.
///
/// Exposes metrics on an HTTP endpoint for Prometheus scraping.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server bound to `addr` once started.
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Install the global recorder and spawn the HTTP listener.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::Build`] if the exporter cannot be built (including
    /// a failure to bind the listener) and [`MetricsError::Install`] if another
    /// recorder could not be replaced.
    ///
    /// # Note
    ///
    /// If a metrics recorder is already installed (e.g., in tests), the listener
    /// is not started and `Ok(())` is returned with a warning.
    pub fn start(&mut self, config: &MetricsConfig) -> Result<(), MetricsError> {
        describe_metrics(config);

        let (recorder, exporter) = PrometheusBuilder::new()
            .with_http_listener(self.addr)
            .set_buckets_for_metric(
                Matcher::Suffix("latency_seconds".to_string()),
                &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?
            .build()
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        let handle = recorder.handle();
        match metrics::set_global_recorder(recorder) {
            Ok(()) => {
                tokio::spawn(async move {
                    if exporter.await.is_err() {
                        tracing::error!("Metrics listener stopped");
                    }
                });
                self.handle = Some(handle);
                tracing::info!(addr = %self.addr, "Metrics server started - available at http://{}/metrics", self.addr);
                Ok(())
            }
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already") {
                    tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                    Ok(())
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            }
        }
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if server hasn't been started.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

fn describe_metrics(config: &MetricsConfig) {
    describe_counter!(config.metric_name("request_count"), "Total number of requests");
    describe_counter!(config.metric_name("error_count"), "Total number of failed requests");
    describe_histogram!(
        config.metric_name("request_latency_seconds"),
        "Time taken to handle requests"
    );

    describe_counter!(PRODUCER_DELIVERED, "Total number of records acknowledged by the broker");
    describe_counter!(PRODUCER_DELIVERY_ERRORS, "Total number of records the broker failed to accept");
    describe_counter!(CONSUMER_PROCESSED, "Total number of records dispatched to handlers");
    describe_counter!(CONSUMER_HANDLER_ERRORS, "Total number of records whose handler failed");
}

struct RequestMetricNames {
    requests: String,
    errors: String,
    latency: String,
}

/// Counts requests and errors and records latency per method.
///
/// The method label is read from the context
/// ([`Context::method_name`](relay_core::Context::method_name)).
#[derive(Clone)]
pub struct MetricsMiddleware {
    names: Arc<RequestMetricNames>,
}

impl MetricsMiddleware {
    /// Create a middleware recording under `config`'s names.
    #[must_use]
    pub fn new(config: &MetricsConfig) -> Self {
        Self {
            names: Arc::new(RequestMetricNames {
                requests: config.metric_name("request_count"),
                errors: config.metric_name("error_count"),
                latency: config.metric_name("request_latency_seconds"),
            }),
        }
    }
}

impl Default for MetricsMiddleware {
    fn default() -> Self {
        Self::new(&MetricsConfig::default())
    }
}

impl<Req, Resp> Middleware<Req, Resp> for MetricsMiddleware
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    fn wrap(&self, next: Handler<Req, Resp>) -> Handler<Req, Resp> {
        let names = Arc::clone(&self.names);
        Arc::new(move |ctx, req| -> HandlerFuture<Resp> {
            let next = Arc::clone(&next);
            let names = Arc::clone(&names);
            Box::pin(async move {
                let method = ctx.method_name().to_string();
                let start = Instant::now();
                counter!(names.requests.clone(), "method" => method.clone()).increment(1);

                let result = next(ctx, req).await;

                histogram!(names.latency.clone(), "method" => method.clone())
                    .record(start.elapsed().as_secs_f64());
                if let Err(err) = &result {
                    counter!(names.errors.clone(), "method" => method, "code" => err.app_code().to_string())
                        .increment(1);
                }
                result
            })
        })
    }
}
