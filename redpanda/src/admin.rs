//! rdkafka-backed [`ClusterAdmin`].

use crate::KafkaConfig;
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::error::RDKafkaErrorCode;
use relay_core::BoxFuture;
use relay_core::messaging::{AdminError, ClusterAdmin, TopicSpec};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

/// Topic administration over the Kafka admin API.
pub struct KafkaAdmin {
    client: Arc<AdminClient<DefaultClientContext>>,
    timeout: Duration,
}

impl KafkaAdmin {
    /// Create an admin client.
    ///
    /// # Errors
    ///
    /// Returns [`AdminError::Connection`] if the client cannot be created.
    pub fn new(config: &KafkaConfig) -> Result<Self, AdminError> {
        let client: AdminClient<DefaultClientContext> = ClientConfig::new()
            .set("bootstrap.servers", config.bootstrap_servers())
            .create()
            .map_err(|e| AdminError::Connection(e.to_string()))?;

        Ok(Self {
            client: Arc::new(client),
            timeout: config.timeout(),
        })
    }
}

impl ClusterAdmin for KafkaAdmin {
    fn list_topics(&self) -> BoxFuture<'_, Result<HashSet<String>, AdminError>> {
        let client = Arc::clone(&self.client);
        let timeout = self.timeout;
        Box::pin(async move {
            // Metadata requests block the calling thread.
            tokio::task::spawn_blocking(move || {
                client
                    .inner()
                    .fetch_metadata(None, timeout)
                    .map(|metadata| {
                        metadata
                            .topics()
                            .iter()
                            .map(|topic| topic.name().to_string())
                            .collect::<HashSet<String>>()
                    })
                    .map_err(|e| AdminError::ListFailed(e.to_string()))
            })
            .await
            .map_err(|e| AdminError::ListFailed(e.to_string()))?
        })
    }

    fn create_topic<'a>(&'a self, name: &'a str, spec: TopicSpec) -> BoxFuture<'a, Result<(), AdminError>> {
        Box::pin(async move {
            let topic = NewTopic::new(
                name,
                spec.partition_count,
                TopicReplication::Fixed(i32::from(spec.replication_factor)),
            );
            let options = AdminOptions::new().operation_timeout(Some(self.timeout));

            let results = self
                .client
                .create_topics(&[topic], &options)
                .await
                .map_err(|e| AdminError::CreateFailed {
                    topic: name.to_string(),
                    reason: e.to_string(),
                })?;

            match results.into_iter().next() {
                Some(Ok(_)) | None => Ok(()),
                Some(Err((_, RDKafkaErrorCode::TopicAlreadyExists))) => {
                    Err(AdminError::TopicAlreadyExists(name.to_string()))
                }
                Some(Err((_, code))) => Err(AdminError::CreateFailed {
                    topic: name.to_string(),
                    reason: code.to_string(),
                }),
            }
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<(), AdminError>> {
        // The client is released when the last reference drops.
        Box::pin(async { Ok(()) })
    }
}
