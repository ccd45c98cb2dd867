//! Topic provisioning.

use relay_core::messaging::{AdminError, ClusterAdmin, TopicSpec};
use std::sync::Arc;

/// Creates missing topics before they are produced to or consumed from.
///
/// Safe to call concurrently from several producers and consumers: a create
/// that loses the race reports [`AdminError::TopicAlreadyExists`], which is
/// treated as success. Nothing is retried.
#[derive(Clone)]
pub struct TopicProvisioner {
    admin: Arc<dyn ClusterAdmin>,
    spec: TopicSpec,
}

impl std::fmt::Debug for TopicProvisioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopicProvisioner")
            .field("spec", &self.spec)
            .finish_non_exhaustive()
    }
}

impl TopicProvisioner {
    /// Create a provisioner creating topics with `spec`.
    #[must_use]
    pub fn new(admin: Arc<dyn ClusterAdmin>, spec: TopicSpec) -> Self {
        Self { admin, spec }
    }

    /// Spec used for new topics.
    #[must_use]
    pub const fn spec(&self) -> TopicSpec {
        self.spec
    }

    /// The admin connection.
    #[must_use]
    pub fn admin(&self) -> &Arc<dyn ClusterAdmin> {
        &self.admin
    }

    /// Create every topic in `topics` missing from a fresh listing.
    ///
    /// # Errors
    ///
    /// Returns [`AdminError::ListFailed`] if the listing fails, or the first
    /// create failure other than [`AdminError::TopicAlreadyExists`].
    pub async fn ensure_exists(&self, topics: &[String]) -> Result<(), AdminError> {
        if topics.is_empty() {
            return Ok(());
        }

        let existing = self.admin.list_topics().await?;

        for topic in topics.iter().filter(|t| !existing.contains(*t)) {
            match self.admin.create_topic(topic, self.spec).await {
                Ok(()) => tracing::info!(
                    topic = %topic,
                    partitions = self.spec.partition_count,
                    replication_factor = self.spec.replication_factor,
                    "Created topic"
                ),
                Err(AdminError::TopicAlreadyExists(_)) => {
                    tracing::debug!(topic = %topic, "Topic was created concurrently");
                }
                Err(err) => {
                    tracing::error!(topic = %topic, error = %err, "Failed to create topic");
                    return Err(err);
                }
            }
        }

        Ok(())
    }
}
