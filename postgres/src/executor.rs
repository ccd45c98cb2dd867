//! Query helpers for resolved executors.

use crate::PgBackend;
use relay_core::BoxFuture;
use relay_core::transaction::Executor;
use sqlx::Postgres;
use sqlx::postgres::{PgArguments, PgQueryResult, PgRow};
use sqlx::query::{Query, QueryAs};

/// Runs sqlx queries on the bound transaction, or on the pool when none is bound.
pub trait PgExecutor {
    /// Execute a statement.
    ///
    /// # Errors
    ///
    /// Returns the database error.
    fn execute<'e, 'q: 'e>(
        &'e mut self,
        query: Query<'q, Postgres, PgArguments>,
    ) -> BoxFuture<'e, Result<PgQueryResult, sqlx::Error>>;

    /// Fetch all rows.
    ///
    /// # Errors
    ///
    /// Returns the database or decoding error.
    fn fetch_all<'e, 'q: 'e, O>(
        &'e mut self,
        query: QueryAs<'q, Postgres, O, PgArguments>,
    ) -> BoxFuture<'e, Result<Vec<O>, sqlx::Error>>
    where
        O: Send + Unpin + for<'r> sqlx::FromRow<'r, PgRow> + 'e;

    /// Fetch at most one row.
    ///
    /// # Errors
    ///
    /// Returns the database or decoding error.
    fn fetch_optional<'e, 'q: 'e, O>(
        &'e mut self,
        query: QueryAs<'q, Postgres, O, PgArguments>,
    ) -> BoxFuture<'e, Result<Option<O>, sqlx::Error>>
    where
        O: Send + Unpin + for<'r> sqlx::FromRow<'r, PgRow> + 'e;
}

impl PgExecutor for Executor<'_, PgBackend> {
    fn execute<'e, 'q: 'e>(
        &'e mut self,
        query: Query<'q, Postgres, PgArguments>,
    ) -> BoxFuture<'e, Result<PgQueryResult, sqlx::Error>> {
        Box::pin(async move {
            match self {
                Executor::Transaction(tx) => query.execute(&mut ***tx).await,
                Executor::Pool(pool) => query.execute(*pool).await,
            }
        })
    }

    fn fetch_all<'e, 'q: 'e, O>(
        &'e mut self,
        query: QueryAs<'q, Postgres, O, PgArguments>,
    ) -> BoxFuture<'e, Result<Vec<O>, sqlx::Error>>
    where
        O: Send + Unpin + for<'r> sqlx::FromRow<'r, PgRow> + 'e,
    {
        Box::pin(async move {
            match self {
                Executor::Transaction(tx) => query.fetch_all(&mut ***tx).await,
                Executor::Pool(pool) => query.fetch_all(*pool).await,
            }
        })
    }

    fn fetch_optional<'e, 'q: 'e, O>(
        &'e mut self,
        query: QueryAs<'q, Postgres, O, PgArguments>,
    ) -> BoxFuture<'e, Result<Option<O>, sqlx::Error>>
    where
        O: Send + Unpin + for<'r> sqlx::FromRow<'r, PgRow> + 'e,
    {
        Box::pin(async move {
            match self {
                Executor::Transaction(tx) => query.fetch_optional(&mut ***tx).await,
                Executor::Pool(pool) => query.fetch_optional(*pool).await,
            }
        })
    }
}
