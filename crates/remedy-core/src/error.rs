use thiserror::Error;

/// Classification of a failure for retry purposes.
///
/// Business errors are caused by the task's own inputs and are never retried.
/// System errors come from infrastructure and may succeed on another attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Business,
    System,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Business => "business",
            ErrorKind::System => "system",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::System)
    }
}

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Invalid priority value: {0} (expected 1-10)")]
    InvalidPriority(u8),

    #[error("Unknown task status: {0}")]
    UnknownStatus(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Task in terminal state {status}: {task_id}")]
    TerminalState { task_id: String, status: String },
}

pub type Result<T> = std::result::Result<T, CoreError>;
