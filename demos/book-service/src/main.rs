//! Book service demo.
//!
//! Wires every Relay piece into one process:
//!
//! 1. `.env` and environment configuration
//! 2. tracing subscriber and Prometheus exporter
//! 3. Postgres pool and transactional context
//! 4. producer, and a consumer registered on `book.created`
//! 5. `BookService` behind the middleware chain, with a transaction around `book.SaveBook`
//!
//! # Running
//!
//! ```bash
//! docker run -d -p 5432:5432 -e POSTGRES_PASSWORD=postgres postgres:16
//! docker run -d -p 9092:9092 redpandadata/redpanda redpanda start --overprovisioned --smp 1
//! KAFKA_CONSUMER_GROUP=book-service LOGGER_CONFIG_FORMAT=pretty cargo run -p book-service
//! ```
//!
//! Metrics are served on `METRICS_ADDR` (default `0.0.0.0:9000`). Stop with Ctrl-C.

mod events;
mod service;

use relay_core::Context;
use relay_postgres::PostgresConfig;
use relay_redpanda::{Consumer, KafkaConfig, Producer, handle_fn};
use relay_runtime::ServiceMiddleware;
use relay_runtime::cancel::WaitContextCancel;
use relay_runtime::config::{LoggerConfig, MetricsConfig, RequestConfig};
use relay_runtime::logging::LoggingMiddleware;
use relay_runtime::metrics::{MetricsMiddleware, MetricsServer};
use relay_runtime::telemetry::init_tracing;
use relay_runtime::transaction::TransactionMiddleware;
use relay_runtime::validation::ValidationMiddleware;
use service::{BOOK_CREATED_TOPIC, BookRequest, BookResponse, BookService, SAVE_BOOK, SaveBook};
use std::sync::Arc;
use std::time::Duration;

const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    init_tracing(&LoggerConfig::from_env())?;

    let metrics_config = MetricsConfig::from_env();
    let metrics_addr = std::env::var("METRICS_ADDR").unwrap_or_else(|_| "0.0.0.0:9000".to_string());
    let mut metrics_server = MetricsServer::new(metrics_addr.parse()?);
    metrics_server.start(&metrics_config)?;

    let tx = relay_postgres::connect(&PostgresConfig::from_env()).await?;
    service::ensure_schema(&tx).await?;

    let kafka = KafkaConfig::from_env();
    let producer = Arc::new(Producer::connect(&kafka)?);
    let consumer = Arc::new(Consumer::connect(&kafka)?);
    consumer.register(BOOK_CREATED_TOPIC, handle_fn(events::on_book_created));

    let mut chain: ServiceMiddleware<BookRequest, BookResponse> = ServiceMiddleware::new(Vec::new());
    chain
        .use_global(MetricsMiddleware::new(&metrics_config))
        .use_global(LoggingMiddleware::new())
        .use_global(ValidationMiddleware::new())
        .use_global(WaitContextCancel::new())
        .use_for_method(SAVE_BOOK, TransactionMiddleware::new(tx.clone()));

    let books = Arc::new(BookService::new(tx, Arc::clone(&producer)));
    let save_book = chain.wrap(SAVE_BOOK, books.handler());

    let root = Context::background();
    let mut consuming = {
        let consumer = Arc::clone(&consumer);
        let ctx = root.clone();
        tokio::spawn(async move { consumer.start(&ctx).await })
    };

    let request = RequestConfig::from_env();
    let ctx = root
        .with_timeout(request.timeout)
        .with_new_request_id()
        .with_language("en");
    match save_book(
        ctx,
        BookRequest::SaveBook(SaveBook {
            title: "The Left Hand of Darkness".to_string(),
            author: "Ursula K Le Guin".to_string(),
            library_id: 1,
        }),
    )
    .await
    {
        Ok(BookResponse::SaveBook(book)) => tracing::info!(book_id = %book.id, title = %book.title, "Saved"),
        Err(err) => tracing::error!(error = %err, code = err.app_code(), "Failed to save book"),
    }

    tracing::info!("Running, press Ctrl-C to stop");
    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            tracing::info!("Shutdown signal received");
        }
        finished = &mut consuming => {
            tracing::warn!(outcome = ?finished, "Consumer stopped on its own");
        }
    }

    root.cancel();
    if !consuming.is_finished() {
        match consuming.await {
            Ok(Err(relay_redpanda::ConsumerError::Cancelled)) | Ok(Ok(())) => {}
            Ok(Err(err)) => tracing::warn!(error = %err, "Consumer stopped with an error"),
            Err(err) => tracing::warn!(error = %err, "Consumer task failed"),
        }
    }
    if let Err(err) = consumer.close().await {
        tracing::warn!(error = %err, "Failed to close consumer");
    }
    producer.shutdown(SHUTDOWN_DEADLINE).await?;

    tracing::info!("Stopped");
    Ok(())
}
