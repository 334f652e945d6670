use crate::{Result, WorkerError};
use remedy_core::crypto::ENCRYPTION_KEY_ENV;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const MIN_CONCURRENCY: usize = 1;
pub const MAX_CONCURRENCY: usize = 50;

#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub worker: IdentityConfig,
    pub master: MasterEndpoint,
    pub execution: ExecutionConfig,
    pub log: LogConfig,
    pub credentials: CredentialConfig,
}

/// Locally configured identity presented to the control plane
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    pub id: String,
    pub access_key: String,
    pub secret_key: String,
    pub name: String,
    pub concurrency: usize,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        IdentityConfig {
            id: String::new(),
            access_key: String::new(),
            secret_key: String::new(),
            name: String::new(),
            concurrency: 2,
        }
    }
}

impl fmt::Debug for IdentityConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityConfig")
            .field("id", &self.id)
            .field("access_key", &self.access_key)
            .field("secret_key", &"<redacted>")
            .field("name", &self.name)
            .field("concurrency", &self.concurrency)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MasterEndpoint {
    pub url: String,
}

impl Default for MasterEndpoint {
    fn default() -> Self {
        MasterEndpoint {
            url: "http://localhost:8080".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub shutdown_timeout_secs: u64,
    pub heartbeat_interval_secs: u64,
    pub recovery_interval_secs: u64,
    pub cancel_poll_interval_secs: u64,
    pub task_heartbeat_interval_secs: u64,
    /// How long each priority level is polled per dequeue attempt
    pub dequeue_wait_ms: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        ExecutionConfig {
            shutdown_timeout_secs: 30,
            heartbeat_interval_secs: 30,
            recovery_interval_secs: 120,
            cancel_poll_interval_secs: 5,
            task_heartbeat_interval_secs: 30,
            dequeue_wait_ms: 1000,
        }
    }
}

impl ExecutionConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    pub fn recovery_interval(&self) -> Duration {
        Duration::from_secs(self.recovery_interval_secs.max(1))
    }

    pub fn cancel_poll_interval(&self) -> Duration {
        Duration::from_secs(self.cancel_poll_interval_secs.max(1))
    }

    pub fn task_heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.task_heartbeat_interval_secs.max(1))
    }

    pub fn dequeue_wait(&self) -> Duration {
        Duration::from_millis(self.dequeue_wait_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub format: LogFormat,
    /// Daily-rolling log file in addition to stdout
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            level: "info".to_string(),
            format: LogFormat::Text,
            file: None,
        }
    }
}

#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialConfig {
    /// Local AES key; when empty, credentials are decrypted by the master
    pub encryption_key: String,
}

impl fmt::Debug for CredentialConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shown = if self.encryption_key.is_empty() { "<unset>" } else { "<redacted>" };
        f.debug_struct("CredentialConfig")
            .field("encryption_key", &shown)
            .finish()
    }
}

impl fmt::Debug for WorkerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerConfig")
            .field("worker", &self.worker)
            .field("master", &self.master)
            .field("execution", &self.execution)
            .field("log", &self.log)
            .field("credentials", &self.credentials)
            .finish()
    }
}

impl WorkerConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: WorkerConfig = serde_yaml::from_str(&contents)?;
        Ok(config)
    }

    /// Overlay values from the process environment
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());

        if let Some(v) = get("WORKER_ID") {
            self.worker.id = v;
        }
        if let Some(v) = get("WORKER_ACCESS_KEY") {
            self.worker.access_key = v;
        }
        if let Some(v) = get("WORKER_SECRET_KEY") {
            self.worker.secret_key = v;
        }
        if let Some(v) = get("WORKER_NAME") {
            self.worker.name = v;
        }
        if let Some(v) = get("WORKER_CONCURRENCY") {
            self.worker.concurrency = v
                .parse()
                .map_err(|_| WorkerError::Config(format!("WORKER_CONCURRENCY is not a number: {}", v)))?;
        }
        if let Some(v) = get("AHOP_MASTER_URL") {
            self.master.url = v;
        }
        if let Some(v) = get("LOG_LEVEL") {
            self.log.level = v;
        }
        if let Some(v) = get("LOG_FILE_PATH") {
            self.log.file = Some(PathBuf::from(v));
        }
        if let Some(v) = get(ENCRYPTION_KEY_ENV) {
            self.credentials.encryption_key = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let required = [
            ("worker.id", &self.worker.id),
            ("worker.access_key", &self.worker.access_key),
            ("worker.secret_key", &self.worker.secret_key),
            ("master.url", &self.master.url),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                return Err(WorkerError::Config(format!("{} is required", name)));
            }
        }

        if !(MIN_CONCURRENCY..=MAX_CONCURRENCY).contains(&self.worker.concurrency) {
            return Err(WorkerError::Config(format!(
                "worker.concurrency must be between {} and {}, got {}",
                MIN_CONCURRENCY, MAX_CONCURRENCY, self.worker.concurrency
            )));
        }

        Ok(())
    }

    /// Display name, falling back to the machine hostname
    pub fn display_name(&self) -> String {
        if !self.worker.name.is_empty() {
            return self.worker.name.clone();
        }
        hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string())
    }
}
