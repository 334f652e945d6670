use remedy_core::crypto::CryptoError;
use remedy_core::signature::SignatureError;
use remedy_core::{CoreError, ErrorKind, TaskStatus};
use remedy_queue::QueueError;
use thiserror::Error;

/// Fragments of infrastructure error messages that are worth another attempt
const TRANSIENT_PATTERNS: &[&str] = &[
    "cached plan must not change result type",
    "connection refused",
    "connection reset",
    "timeout",
    "timed out",
    "temporary failure",
    "service unavailable",
    "too many connections",
];

/// Whether an error message describes a transient infrastructure condition
pub fn is_transient_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    TRANSIENT_PATTERNS.iter().any(|pattern| lower.contains(pattern))
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Worker not registered: {0}")]
    WorkerNotFound(String),

    #[error("Task {task_id} cannot move from {from} to {to}")]
    InvalidTransition {
        task_id: String,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Core(#[from] CoreError),
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::Database(sqlx::Error::RowNotFound)
            | StoreError::Database(sqlx::Error::ColumnDecode { .. })
            | StoreError::Database(sqlx::Error::Decode(_)) => ErrorKind::Business,
            StoreError::Database(sqlx::Error::Database(e)) if !is_transient_message(e.message()) => {
                ErrorKind::Business
            }
            StoreError::Database(_) => ErrorKind::System,
            StoreError::TaskNotFound(_)
            | StoreError::WorkerNotFound(_)
            | StoreError::InvalidTransition { .. }
            | StoreError::Serialization(_)
            | StoreError::Core(_) => ErrorKind::Business,
        }
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Outcome of a failed task execution, split by whether a retry can help
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutionError {
    /// The task's own inputs or targets make success impossible
    #[error("{0}")]
    Business(String),

    /// Infrastructure failure; the task may succeed on another attempt
    #[error("{0}")]
    System(String),

    #[error("task cancelled")]
    Cancelled,
}

impl ExecutionError {
    pub fn business(message: impl Into<String>) -> Self {
        ExecutionError::Business(message.into())
    }

    pub fn system(message: impl Into<String>) -> Self {
        ExecutionError::System(message.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ExecutionError::System(_) => ErrorKind::System,
            ExecutionError::Business(_) | ExecutionError::Cancelled => ErrorKind::Business,
        }
    }
}

impl From<StoreError> for ExecutionError {
    fn from(e: StoreError) -> Self {
        match e.kind() {
            ErrorKind::Business => ExecutionError::Business(e.to_string()),
            ErrorKind::System => ExecutionError::System(e.to_string()),
        }
    }
}

impl From<std::io::Error> for ExecutionError {
    fn from(e: std::io::Error) -> Self {
        ExecutionError::System(e.to_string())
    }
}

impl From<serde_json::Error> for ExecutionError {
    fn from(e: serde_json::Error) -> Self {
        ExecutionError::System(format!("Serialization error: {}", e))
    }
}

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Failed to read configuration: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    #[error("Master rejected request (HTTP {status}, code {code}): {message}")]
    Master { status: u16, code: i32, message: String },

    #[error("Master request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Signing failed: {0}")]
    Signature(#[from] SignatureError),

    #[error("Credential error: {0}")]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl WorkerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            WorkerError::Http(_) | WorkerError::Io(_) => ErrorKind::System,
            WorkerError::Queue(e) => e.kind(),
            WorkerError::Master { status, .. } if *status >= 500 => ErrorKind::System,
            WorkerError::Store(e) => e.kind(),
            _ => ErrorKind::Business,
        }
    }
}

pub type Result<T> = std::result::Result<T, WorkerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_patterns() {
        assert!(is_transient_message("dial tcp: Connection refused"));
        assert!(is_transient_message("operation timed out"));
        assert!(is_transient_message("FATAL: too many connections for role"));
        assert!(!is_transient_message("relation \"hosts\" does not exist"));
    }

    #[test]
    fn test_store_error_kind() {
        assert_eq!(StoreError::TaskNotFound("t".into()).kind(), ErrorKind::Business);
        assert_eq!(StoreError::Database(sqlx::Error::PoolTimedOut).kind(), ErrorKind::System);
        assert_eq!(StoreError::Database(sqlx::Error::RowNotFound).kind(), ErrorKind::Business);
    }

    #[test]
    fn test_execution_error_from_store() {
        let e: ExecutionError = StoreError::Database(sqlx::Error::PoolClosed).into();
        assert_eq!(e.kind(), ErrorKind::System);

        let e: ExecutionError = StoreError::TaskNotFound("gone".into()).into();
        assert_eq!(e, ExecutionError::Business("Task not found: gone".into()));
    }
}
