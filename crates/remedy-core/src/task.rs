use crate::{CoreError, Priority, Result, DEFAULT_TASK_TIMEOUT_SECS};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Unique identifier for a task (UUID string, generated by the producer)
pub type TaskId = String;

/// Task lifecycle status.
///
/// `Processing` only ever appears in the queue's status record; the durable row moves
/// through `Queued -> Locked -> Running` instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Queued,
    Processing,
    Locked,
    Running,
    Success,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Queued => "queued",
            TaskStatus::Processing => "processing",
            TaskStatus::Locked => "locked",
            TaskStatus::Running => "running",
            TaskStatus::Success => "success",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskStatus::Pending),
            "queued" => Some(TaskStatus::Queued),
            "processing" => Some(TaskStatus::Processing),
            "locked" => Some(TaskStatus::Locked),
            "running" => Some(TaskStatus::Running),
            "success" => Some(TaskStatus::Success),
            "failed" => Some(TaskStatus::Failed),
            "cancelled" => Some(TaskStatus::Cancelled),
            _ => None,
        }
    }

    /// Terminal statuses never change once reached
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Success | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Statuses a dequeued message passes through while a worker owns it
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            TaskStatus::Processing | TaskStatus::Locked | TaskStatus::Running
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Built-in task types a worker knows how to execute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    Ping,
    Collect,
    ShellCommand,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Ping => "ping",
            TaskKind::Collect => "collect",
            TaskKind::ShellCommand => "shell_command",
        }
    }

    pub fn from_task_type(task_type: &str) -> Option<Self> {
        match task_type {
            "ping" => Some(TaskKind::Ping),
            "collect" => Some(TaskKind::Collect),
            "shell_command" => Some(TaskKind::ShellCommand),
            _ => None,
        }
    }

    /// Whether results of this kind feed the host fact tables
    pub fn ingests_host_facts(&self) -> bool {
        matches!(self, TaskKind::Ping | TaskKind::Collect)
    }

    pub fn all() -> &'static [TaskKind] {
        &[TaskKind::Ping, TaskKind::Collect, TaskKind::ShellCommand]
    }
}

/// Queue wire representation of a task.
///
/// This is the only form that lives inside the queue lists. The durable [`Task`] row is
/// maintained separately by whoever owns the relational store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMessage {
    pub task_id: TaskId,
    pub task_type: String,
    pub tenant_id: i64,
    #[serde(default)]
    pub tenant_name: String,
    #[serde(default)]
    pub user_id: i64,
    #[serde(default)]
    pub username: String,
    pub priority: Priority,
    #[serde(default)]
    pub params: Value,
    /// Unix seconds
    pub created: i64,
    #[serde(default)]
    pub source: String,
}

impl TaskMessage {
    pub fn new(task_id: impl Into<TaskId>, task_type: impl Into<String>, priority: Priority) -> Self {
        TaskMessage {
            task_id: task_id.into(),
            task_type: task_type.into(),
            tenant_id: 0,
            tenant_name: String::new(),
            user_id: 0,
            username: String::new(),
            priority,
            params: Value::Object(Default::default()),
            created: Utc::now().timestamp(),
            source: String::new(),
        }
    }

    pub fn tenant(mut self, tenant_id: i64, tenant_name: impl Into<String>) -> Self {
        self.tenant_id = tenant_id;
        self.tenant_name = tenant_name.into();
        self
    }

    pub fn user(mut self, user_id: i64, username: impl Into<String>) -> Self {
        self.user_id = user_id;
        self.username = username.into();
        self
    }

    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(CoreError::from)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(CoreError::from)
    }

    pub fn kind(&self) -> Option<TaskKind> {
        TaskKind::from_task_type(&self.task_type)
    }
}

/// Durable task record owned by the relational store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: TaskId,
    pub task_type: String,
    pub tenant_id: i64,
    pub name: String,
    pub priority: Priority,
    pub params: Value,
    pub status: TaskStatus,
    pub progress: i32,
    pub retry_count: u32,
    pub max_retries: u32,
    /// Timeout in seconds (0 = default)
    pub timeout_secs: u64,
    pub worker_id: Option<String>,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub queued_at: Option<DateTime<Utc>>,
    pub locked_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn builder(task_type: impl Into<String>, tenant_id: i64) -> TaskBuilder {
        TaskBuilder::new(task_type.into(), tenant_id)
    }

    /// Check if task can be retried
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    pub fn timeout(&self) -> std::time::Duration {
        let secs = if self.timeout_secs > 0 {
            self.timeout_secs
        } else {
            DEFAULT_TASK_TIMEOUT_SECS
        };
        std::time::Duration::from_secs(secs)
    }

    fn ensure_not_terminal(&self) -> Result<()> {
        if self.status.is_terminal() {
            return Err(CoreError::TerminalState {
                task_id: self.task_id.clone(),
                status: self.status.as_str().to_string(),
            });
        }
        Ok(())
    }

    /// Claim the task for a worker (queued -> locked)
    pub fn lock(&mut self, worker_id: &str) -> Result<()> {
        self.ensure_not_terminal()?;
        self.status = TaskStatus::Locked;
        self.worker_id = Some(worker_id.to_string());
        self.locked_at = Some(Utc::now());
        Ok(())
    }

    /// Mark execution as started (locked -> running)
    pub fn start(&mut self) -> Result<()> {
        self.ensure_not_terminal()?;
        self.status = TaskStatus::Running;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    /// Write the terminal outcome. `finished_at` is set exactly once.
    pub fn finish(
        &mut self,
        status: TaskStatus,
        result: Option<Value>,
        error: Option<String>,
    ) -> Result<()> {
        self.ensure_not_terminal()?;
        self.status = status;
        self.result = result;
        self.error = error;
        if status.is_terminal() {
            self.progress = 100;
            self.finished_at = Some(Utc::now());
        }
        Ok(())
    }

    /// Put the task back into the queue after a transient failure
    pub fn requeue(&mut self, note: &str) -> Result<()> {
        self.ensure_not_terminal()?;
        self.retry_count += 1;
        self.status = TaskStatus::Queued;
        self.worker_id = None;
        self.error = Some(note.to_string());
        self.queued_at = Some(Utc::now());
        Ok(())
    }

    /// Build the queue message for this row
    pub fn to_message(&self) -> TaskMessage {
        TaskMessage::new(self.task_id.clone(), self.task_type.clone(), self.priority)
            .tenant(self.tenant_id, "")
            .params(self.params.clone())
    }
}

/// Builder for creating task rows
pub struct TaskBuilder {
    task_type: String,
    tenant_id: i64,
    name: String,
    priority: Priority,
    params: Value,
    max_retries: u32,
    timeout_secs: u64,
}

impl TaskBuilder {
    pub fn new(task_type: String, tenant_id: i64) -> Self {
        TaskBuilder {
            name: task_type.clone(),
            task_type,
            tenant_id,
            priority: Priority::default(),
            params: Value::Object(Default::default()),
            max_retries: 3,
            timeout_secs: DEFAULT_TASK_TIMEOUT_SECS,
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn timeout_secs(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    pub fn build(self) -> Task {
        let now = Utc::now();
        Task {
            task_id: Uuid::new_v4().to_string(),
            task_type: self.task_type,
            tenant_id: self.tenant_id,
            name: self.name,
            priority: self.priority,
            params: self.params,
            status: TaskStatus::Queued,
            progress: 0,
            retry_count: 0,
            max_retries: self.max_retries,
            timeout_secs: self.timeout_secs,
            worker_id: None,
            result: None,
            error: None,
            created_at: now,
            queued_at: Some(now),
            locked_at: None,
            started_at: None,
            finished_at: None,
        }
    }
}
