use remedy_core::DEFAULT_QUEUE_PREFIX;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables for the queue store and recovery sweeper
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Key prefix shared by every queue key
    pub prefix: String,
    /// Blocking wait spent on each priority list during one dequeue pass
    pub priority_wait_ms: u64,
    /// Lifetime of a per-task status record
    pub status_ttl_secs: u64,
    /// Lifetime of a per-task heartbeat marker after each renewal
    pub heartbeat_ttl_secs: u64,
    /// Age after which an in-flight message is presumed orphaned
    pub stale_after_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            prefix: DEFAULT_QUEUE_PREFIX.to_string(),
            priority_wait_ms: 1000,
            status_ttl_secs: 24 * 60 * 60,
            heartbeat_ttl_secs: 120,
            stale_after_secs: 300,
        }
    }
}

impl QueueConfig {
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        QueueConfig {
            prefix: prefix.into(),
            ..Default::default()
        }
    }

    pub fn priority_wait(&self) -> Duration {
        Duration::from_millis(self.priority_wait_ms)
    }

    pub fn status_ttl(&self) -> Duration {
        Duration::from_secs(self.status_ttl_secs)
    }

    pub fn heartbeat_ttl(&self) -> Duration {
        Duration::from_secs(self.heartbeat_ttl_secs)
    }
}
