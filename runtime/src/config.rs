//! Process configuration read from the environment.
//!
//! Every value has a default, so loading never fails; unparsable values fall
//! back to the default as well. Call `dotenvy::dotenv()` first to pick up a
//! local `.env` file.

use std::env;
use std::time::Duration;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// One JSON object per line.
    #[default]
    Json,
    /// Multi-line, human-oriented.
    Pretty,
    /// Single-line, human-oriented.
    Compact,
}

impl LogFormat {
    /// Parse a format name; unknown names select JSON.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "pretty" | "console" | "text" => Self::Pretty,
            "compact" => Self::Compact,
            _ => Self::Json,
        }
    }
}

/// Logger configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggerConfig {
    /// Filter directive, e.g. `info` or `info,relay_redpanda=debug`. `RUST_LOG` takes precedence.
    pub level: String,
    /// Output format.
    pub format: LogFormat,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Json,
        }
    }
}

impl LoggerConfig {
    /// Load from `LOGGER_CONFIG_LEVEL` and `LOGGER_CONFIG_FORMAT`.
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            level: env::var("LOGGER_CONFIG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            format: env::var("LOGGER_CONFIG_FORMAT")
                .map(|s| LogFormat::parse(&s))
                .unwrap_or_default(),
        }
    }
}

/// Names under which request metrics are recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsConfig {
    /// Metric namespace.
    pub namespace: String,
    /// Metric subsystem.
    pub subsystem: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            namespace: "api".to_string(),
            subsystem: "service".to_string(),
        }
    }
}

impl MetricsConfig {
    /// Load from `METRICS_NAMESPACE` and `METRICS_SUBSYSTEM`.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            namespace: env::var("METRICS_NAMESPACE").unwrap_or(defaults.namespace),
            subsystem: env::var("METRICS_SUBSYSTEM").unwrap_or(defaults.subsystem),
        }
    }

    /// Fully qualified metric name: `{namespace}_{subsystem}_{name}`.
    #[must_use]
    pub fn metric_name(&self, name: &str) -> String {
        format!("{}_{}_{name}", self.namespace, self.subsystem)
    }
}

/// Per-request settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestConfig {
    /// Deadline applied to each incoming request.
    pub timeout: Duration,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
        }
    }
}

impl RequestConfig {
    /// Load from `HTTP_CONFIG__REQUEST_TIMEOUT_SECONDS`.
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            timeout: Duration::from_secs(
                env::var("HTTP_CONFIG__REQUEST_TIMEOUT_SECONDS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(60),
            ),
        }
    }
}
