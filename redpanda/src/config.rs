//! Broker configuration.

use relay_core::messaging::TopicSpec;
use std::env;
use std::time::Duration;

/// Connection and topic settings for a Kafka-compatible cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KafkaConfig {
    /// Bootstrap brokers.
    pub brokers: Vec<String>,
    /// Consumer group id. Required for consumers, unused by producers.
    pub consumer_group: String,
    /// Client operation timeout in seconds.
    pub timeout_seconds: u64,
    /// Partitions for auto-created topics.
    pub partition_count: i32,
    /// Maximum records buffered in the client before enqueue reports a full queue.
    pub outbound_buffer: usize,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            brokers: vec!["127.0.0.1:9092".to_string()],
            consumer_group: String::new(),
            timeout_seconds: 60,
            partition_count: 12,
            outbound_buffer: 1000,
        }
    }
}

impl KafkaConfig {
    /// Load configuration from environment variables.
    ///
    /// - `KAFKA_BROKERS`: comma separated (default `127.0.0.1:9092`)
    /// - `KAFKA_CONSUMER_GROUP` (default empty)
    /// - `KAFKA_CONFIG_TIMEOUT_SECONDS` (default 60)
    /// - `KAFKA_CONFIG_PARTITION_NUMBER` (default 12)
    /// - `KAFKA_OUTBOUND_BUFFER` (default 1000)
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            brokers: env::var("KAFKA_BROKERS")
                .ok()
                .map(|s| parse_brokers(&s))
                .filter(|b| !b.is_empty())
                .unwrap_or(defaults.brokers),
            consumer_group: env::var("KAFKA_CONSUMER_GROUP").unwrap_or(defaults.consumer_group),
            timeout_seconds: env::var("KAFKA_CONFIG_TIMEOUT_SECONDS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.timeout_seconds),
            partition_count: env::var("KAFKA_CONFIG_PARTITION_NUMBER")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.partition_count),
            outbound_buffer: env::var("KAFKA_OUTBOUND_BUFFER")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.outbound_buffer),
        }
    }

    /// Brokers joined for `bootstrap.servers`.
    #[must_use]
    pub fn bootstrap_servers(&self) -> String {
        self.brokers.join(",")
    }

    /// Client operation timeout.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    /// Delivery timeout for `message.timeout.ms`, saturating on huge settings.
    #[must_use]
    pub const fn message_timeout_ms(&self) -> u64 {
        self.timeout_seconds.saturating_mul(1000)
    }

    /// Spec for topics this client creates.
    #[must_use]
    pub fn topic_spec(&self) -> TopicSpec {
        TopicSpec::for_brokers(self.partition_count, self.brokers.len())
    }
}

fn parse_brokers(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn brokers_are_split_and_trimmed() {
        assert_eq!(
            parse_brokers("kafka-1:9092, kafka-2:9092,,"),
            vec!["kafka-1:9092".to_string(), "kafka-2:9092".to_string()]
        );
    }

    #[test]
    fn topic_spec_follows_broker_count() {
        let config = KafkaConfig {
            brokers: parse_brokers("a:9092,b:9092"),
            ..KafkaConfig::default()
        };
        let spec = config.topic_spec();
        assert_eq!(spec.partition_count, 12);
        assert_eq!(spec.replication_factor, 2);
        assert_eq!(config.bootstrap_servers(), "a:9092,b:9092");
    }

    #[test]
    fn message_timeout_saturates() {
        let config = KafkaConfig {
            timeout_seconds: u64::MAX,
            ..KafkaConfig::default()
        };
        assert_eq!(config.message_timeout_ms(), u64::MAX);
        assert_eq!(KafkaConfig::default().message_timeout_ms(), 60_000);
    }

    proptest! {
        #[test]
        fn parsed_brokers_are_never_blank(raw in "[a-z0-9:, ]{0,40}") {
            let brokers = parse_brokers(&raw);
            prop_assert!(brokers.iter().all(|b| !b.is_empty() && b.trim() == b));
            prop_assert!(brokers.len() <= raw.split(',').count());
        }
    }
}
