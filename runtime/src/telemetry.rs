//! Process-wide tracing subscriber.
//!
//! The subscriber is installed once at startup and is read-only afterwards.
//! Request-scoped fields do not go through it: they travel in the request's
//! [`Context`](relay_core::Context) as a span, attached by
//! [`LoggingMiddleware`](crate::logging::LoggingMiddleware).

use crate::config::{LogFormat, LoggerConfig};
use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

/// Errors from installing telemetry.
#[derive(Error, Debug)]
pub enum TelemetryError {
    /// The configured filter directive is invalid.
    #[error("Invalid log filter '{directive}': {reason}")]
    Filter {
        /// The directive.
        directive: String,
        /// Parser message.
        reason: String,
    },

    /// A global subscriber is already installed.
    #[error("Failed to install tracing subscriber: {0}")]
    Install(String),
}

/// Install the global tracing subscriber.
///
/// `RUST_LOG` overrides `config.level` when set.
///
/// # Errors
///
/// Returns [`TelemetryError::Filter`] for an invalid level directive and
/// [`TelemetryError::Install`] if a subscriber is already installed.
pub fn init_tracing(config: &LoggerConfig) -> Result<(), TelemetryError> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.level).map_err(|e| TelemetryError::Filter {
            directive: config.level.clone(),
            reason: e.to_string(),
        })?,
    };

    let registry = tracing_subscriber::registry().with(filter);
    let installed = match config.format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_current_span(true).with_span_list(false))
            .try_init(),
        LogFormat::Pretty => registry.with(fmt::layer().pretty()).try_init(),
        LogFormat::Compact => registry.with(fmt::layer().compact()).try_init(),
    };
    installed.map_err(|e| TelemetryError::Install(e.to_string()))?;

    tracing::info!(level = %config.level, format = ?config.format, "Tracing initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_directive_is_rejected() {
        // Only reached when RUST_LOG is unset, which is the case under `cargo test` by default.
        if std::env::var("RUST_LOG").is_ok() {
            return;
        }
        let config = LoggerConfig {
            level: "relay=loud".to_string(),
            format: LogFormat::Compact,
        };
        assert!(matches!(init_tracing(&config), Err(TelemetryError::Filter { .. })));
    }

    #[test]
    fn second_install_fails() {
        let config = LoggerConfig {
            level: "warn".to_string(),
            format: LogFormat::Compact,
        };
        let first = init_tracing(&config);
        let second = init_tracing(&config);
        // Another test may have installed the subscriber first.
        assert!(first.is_ok() || matches!(first, Err(TelemetryError::Install(_))));
        assert!(matches!(second, Err(TelemetryError::Install(_))));
    }
}
