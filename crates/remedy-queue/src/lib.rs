pub mod backend;
mod config;
mod keys;
mod recovery;
mod status;
mod store;

pub use backend::{MemoryBackend, QueueBackend, RedisBackend};
pub use config::QueueConfig;
pub use keys::KeySpace;
pub use recovery::{RecoverySweeper, SweepReport, RECOVERY_NOTE};
pub use status::{fields, TaskStatusRecord};
pub use store::{DequeuedTask, QueueStats, TaskQueueStore, PARSE_FAILURE};

use remedy_core::{CoreError, ErrorKind};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Task error: {0}")]
    Core(#[from] CoreError),

    #[error("Backend unavailable: {0}")]
    Unavailable(String),
}

impl QueueError {
    /// Queue failures are infrastructure failures; callers retry them.
    pub fn kind(&self) -> ErrorKind {
        match self {
            QueueError::Core(CoreError::InvalidPriority(_)) => ErrorKind::Business,
            _ => ErrorKind::System,
        }
    }
}

pub type Result<T> = std::result::Result<T, QueueError>;
