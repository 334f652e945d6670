//! Relational state the worker reads and writes: durable task rows, hosts and their
//! credentials, collected facts, and the worker registry.

mod memory;
mod postgres;

pub use memory::{MemoryStore, StoredHost, StoredWorker};
pub use postgres::PgStore;

use crate::error::StoreResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use remedy_core::{Task, TaskStatus};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Connection details of a managed host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostRecord {
    pub id: i64,
    pub tenant_id: i64,
    pub name: String,
    pub ip_address: String,
    pub port: u16,
    /// `None` when no credential is bound
    pub credential_id: Option<i64>,
    pub hostname: String,
}

impl HostRecord {
    /// Key used in per-host result maps
    pub fn address(&self) -> String {
        format!("{}:{}", self.ip_address, self.port)
    }
}

/// Credential row as stored: secrets are base64 ciphertext
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredCredential {
    pub id: i64,
    pub tenant_id: i64,
    pub kind: String,
    pub username: String,
    pub password: String,
    pub private_key: String,
    pub passphrase: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostWithCredential {
    pub host: HostRecord,
    pub credential: Option<StoredCredential>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostStatus {
    Online,
    Offline,
}

impl HostStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HostStatus::Online => "online",
            HostStatus::Offline => "offline",
        }
    }
}

/// Host summary fields taken from collected facts; `None` leaves the column untouched
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HostScalars {
    pub hostname: Option<String>,
    pub os_type: Option<String>,
    pub os_version: Option<String>,
    pub kernel: Option<String>,
    pub architecture: Option<String>,
    pub cpu_model: Option<String>,
    pub cpu_cores: Option<i32>,
    pub memory_total_mb: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HostDisk {
    pub device: String,
    pub mount_point: String,
    pub file_system: String,
    pub total_mb: i64,
    pub used_mb: i64,
    pub free_mb: i64,
    pub usage_percent: f64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostNetworkCard {
    pub name: String,
    pub mac_address: String,
    /// Primary IPv4 address
    pub ip_address: String,
    /// Primary and secondary IPv4 addresses, comma separated
    pub ip_addresses: String,
    pub mtu: i32,
    pub speed: i32,
    pub state: String,
}

/// Everything one successful collect run learned about a host
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CollectedFacts {
    pub scalars: HostScalars,
    pub disks: Vec<HostDisk>,
    pub network_cards: Vec<HostNetworkCard>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerRegistration {
    pub worker_id: String,
    pub worker_type: String,
    pub hostname: String,
    pub ip_address: String,
    pub concurrent: i32,
    pub task_types: Vec<String>,
    pub version: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct WorkerStats {
    pub task_count: i64,
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub total_tasks: i64,
    pub success_tasks: i64,
    pub failed_tasks: i64,
}

/// Durable task rows
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn get_task(&self, task_id: &str) -> StoreResult<Task>;

    /// Claim a non-terminal task for `worker_id` (-> locked)
    async fn lock_task(&self, task_id: &str, worker_id: &str) -> StoreResult<Task>;

    /// Locked -> running
    async fn start_task(&self, task_id: &str) -> StoreResult<()>;

    /// Write the terminal outcome. Returns `false` without writing when the row is
    /// already terminal.
    async fn finish_task(
        &self,
        task_id: &str,
        status: TaskStatus,
        result: Option<&Value>,
        error: Option<&str>,
    ) -> StoreResult<bool>;

    /// Back to queued after a transient failure, bumping the retry count
    async fn requeue_task(&self, task_id: &str, note: &str) -> StoreResult<()>;

    async fn is_cancelled(&self, task_id: &str) -> StoreResult<bool>;

    async fn update_progress(&self, task_id: &str, progress: i32) -> StoreResult<()>;
}

#[async_trait]
pub trait HostStore: Send + Sync {
    /// Hosts of `tenant_id` among `host_ids`, with their credentials when bound.
    /// Unknown ids are silently absent from the result.
    async fn find_hosts_with_credentials(
        &self,
        tenant_id: i64,
        host_ids: &[i64],
    ) -> StoreResult<Vec<HostWithCredential>>;

    async fn update_host_status(
        &self,
        host_id: i64,
        status: HostStatus,
        checked_at: DateTime<Utc>,
    ) -> StoreResult<()>;

    /// Replace a host's collected state in one transaction: scalar fields are merged,
    /// disks and network cards are deleted and reinserted.
    async fn apply_collected_facts(
        &self,
        host_id: i64,
        facts: &CollectedFacts,
        collected_at: DateTime<Utc>,
    ) -> StoreResult<()>;
}

/// Relational view of live workers
#[async_trait]
pub trait WorkerRegistry: Send + Sync {
    async fn register_worker(&self, registration: &WorkerRegistration) -> StoreResult<()>;

    async fn heartbeat_worker(&self, worker_id: &str, stats: &WorkerStats) -> StoreResult<()>;

    async fn mark_worker_offline(&self, worker_id: &str) -> StoreResult<()>;
}
