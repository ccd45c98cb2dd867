//! `PostgreSQL` transaction backend for Relay.
//!
//! This crate plugs sqlx into the transactional context of `relay-core`:
//!
//! - [`PostgresConfig`]: pool settings read from the environment
//! - [`PgBackend`]: a [`TransactionBackend`](relay_core::transaction::TransactionBackend)
//!   over a [`PgPool`](sqlx::PgPool)
//! - [`PgExecutor`]: runs queries on whatever [`Executor`](relay_core::transaction::Executor)
//!   the context resolves to
//!
//! # Example
//!
//! ```no_run
//! use relay_core::Context;
//! use relay_postgres::{PgExecutor, PostgresConfig, PostgresTxContext, connect};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let txc: PostgresTxContext = connect(&PostgresConfig::from_env()).await?;
//!
//! let ctx = txc.begin(&Context::background()).await?;
//! txc.resolve(&ctx)
//!     .await
//!     .execute(sqlx::query("INSERT INTO books (name) VALUES ($1)").bind("Dune"))
//!     .await?;
//! txc.commit(&ctx).await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod config;
mod executor;

pub use backend::{PgBackend, PostgresError, PostgresTxContext, connect};
pub use config::PostgresConfig;
pub use executor::PgExecutor;
