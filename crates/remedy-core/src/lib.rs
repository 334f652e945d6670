mod task;
mod priority;
mod error;
pub mod signature;
pub mod crypto;
pub mod wire;

pub use task::{Task, TaskId, TaskKind, TaskMessage, TaskStatus};
pub use priority::Priority;
pub use error::{CoreError, ErrorKind, Result};

/// Default task execution timeout in seconds
pub const DEFAULT_TASK_TIMEOUT_SECS: u64 = 3600;

/// Default key prefix for queue keys
pub const DEFAULT_QUEUE_PREFIX: &str = "ahop:queue";
