//! sqlx-backed [`TransactionBackend`].

use crate::PostgresConfig;
use relay_core::BoxFuture;
use relay_core::transaction::{TransactionBackend, TransactionError, TxContext};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};
use thiserror::Error;

/// Transactional context over `PostgreSQL`.
pub type PostgresTxContext = TxContext<PgBackend>;

/// Errors from setting up the pool.
#[derive(Error, Debug)]
pub enum PostgresError {
    /// The pool could not reach the database.
    #[error("Failed to connect to database: {0}")]
    Connect(#[source] sqlx::Error),
}

/// Transactions on a [`PgPool`].
#[derive(Debug, Clone)]
pub struct PgBackend {
    pool: PgPool,
}

impl PgBackend {
    /// Use an existing pool.
    #[must_use]
    pub const fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// Open a pool and wrap it in a transactional context.
///
/// # Errors
///
/// Returns [`PostgresError::Connect`] if no connection can be established
/// within the configured timeout.
pub async fn connect(config: &PostgresConfig) -> Result<PostgresTxContext, PostgresError> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(config.connect_timeout)
        .connect(&config.url)
        .await
        .map_err(PostgresError::Connect)?;

    tracing::info!(
        max_connections = config.max_connections,
        connect_timeout_secs = config.connect_timeout.as_secs(),
        "Connected to PostgreSQL"
    );

    Ok(TxContext::new(PgBackend::from_pool(pool)))
}

impl TransactionBackend for PgBackend {
    type Transaction = Transaction<'static, Postgres>;
    type Pool = PgPool;

    fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn begin(&self) -> BoxFuture<'_, Result<Self::Transaction, TransactionError>> {
        Box::pin(async move {
            let tx = self.pool.begin().await.map_err(|e| {
                metrics::counter!("relay_postgres_transactions_total", "outcome" => "begin_failed")
                    .increment(1);
                TransactionError::Begin(e.to_string())
            })?;
            tracing::trace!("Transaction started");
            Ok(tx)
        })
    }

    fn commit(&self, tx: Self::Transaction) -> BoxFuture<'_, Result<(), TransactionError>> {
        Box::pin(async move {
            match tx.commit().await {
                Ok(()) => {
                    metrics::counter!("relay_postgres_transactions_total", "outcome" => "committed")
                        .increment(1);
                    Ok(())
                }
                Err(e) => {
                    metrics::counter!("relay_postgres_transactions_total", "outcome" => "commit_failed")
                        .increment(1);
                    Err(TransactionError::Commit(e.to_string()))
                }
            }
        })
    }

    fn rollback(&self, tx: Self::Transaction) -> BoxFuture<'_, Result<(), TransactionError>> {
        Box::pin(async move {
            tx.rollback()
                .await
                .map_err(|e| TransactionError::Rollback(e.to_string()))?;
            metrics::counter!("relay_postgres_transactions_total", "outcome" => "rolled_back")
                .increment(1);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<PgBackend>();
        assert_send_sync::<PostgresTxContext>();
    }

    #[tokio::test]
    async fn unreachable_database_is_a_connect_error() {
        let config = PostgresConfig {
            url: "postgres://nobody@127.0.0.1:1/none".to_string(),
            max_connections: 1,
            connect_timeout: std::time::Duration::from_millis(200),
        };

        let result = connect(&config).await;
        assert!(matches!(result, Err(PostgresError::Connect(_))));
    }
}
