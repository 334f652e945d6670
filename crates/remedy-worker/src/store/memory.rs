use super::{
    CollectedFacts, HostDisk, HostNetworkCard, HostRecord, HostScalars, HostStatus, HostStore,
    HostWithCredential, StoredCredential, TaskStore, WorkerRegistration, WorkerRegistry, WorkerStats,
};
use crate::error::{StoreError, StoreResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use remedy_core::{Task, TaskStatus};
use serde_json::Value;
use std::collections::HashMap;

/// Host row plus everything ingestion writes against it
#[derive(Debug, Clone)]
pub struct StoredHost {
    pub record: HostRecord,
    pub scalars: HostScalars,
    pub status: String,
    pub last_check_at: Option<DateTime<Utc>>,
    pub disks: Vec<HostDisk>,
    pub network_cards: Vec<HostNetworkCard>,
}

#[derive(Debug, Clone)]
pub struct StoredWorker {
    pub registration: WorkerRegistration,
    pub stats: WorkerStats,
    pub status: String,
    pub last_heartbeat: DateTime<Utc>,
}

fn merge(target: &mut Option<String>, value: &Option<String>) {
    if value.is_some() {
        target.clone_from(value);
    }
}

/// In-process relational store for tests and local runs
#[derive(Default)]
pub struct MemoryStore {
    tasks: RwLock<HashMap<String, Task>>,
    hosts: RwLock<HashMap<i64, StoredHost>>,
    credentials: RwLock<HashMap<i64, StoredCredential>>,
    workers: RwLock<HashMap<String, StoredWorker>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_task(&self, task: Task) {
        self.tasks.write().insert(task.task_id.clone(), task);
    }

    pub fn task(&self, task_id: &str) -> Option<Task> {
        self.tasks.read().get(task_id).cloned()
    }

    /// Operator-side cancellation
    pub fn cancel_task(&self, task_id: &str) -> bool {
        let mut tasks = self.tasks.write();
        match tasks.get_mut(task_id) {
            Some(task) => task.finish(TaskStatus::Cancelled, None, None).is_ok(),
            None => false,
        }
    }

    pub fn insert_host(&self, record: HostRecord) {
        let host = StoredHost {
            record,
            scalars: HostScalars::default(),
            status: "pending".to_string(),
            last_check_at: None,
            disks: Vec::new(),
            network_cards: Vec::new(),
        };
        self.hosts.write().insert(host.record.id, host);
    }

    pub fn host(&self, host_id: i64) -> Option<StoredHost> {
        self.hosts.read().get(&host_id).cloned()
    }

    pub fn insert_credential(&self, credential: StoredCredential) {
        self.credentials.write().insert(credential.id, credential);
    }

    pub fn worker(&self, worker_id: &str) -> Option<StoredWorker> {
        self.workers.read().get(worker_id).cloned()
    }

    fn with_task<T>(&self, task_id: &str, f: impl FnOnce(&mut Task) -> StoreResult<T>) -> StoreResult<T> {
        let mut tasks = self.tasks.write();
        let task = tasks
            .get_mut(task_id)
            .ok_or_else(|| StoreError::TaskNotFound(task_id.to_string()))?;
        f(task)
    }
}

fn transition(task: &Task, to: TaskStatus) -> StoreError {
    StoreError::InvalidTransition {
        task_id: task.task_id.clone(),
        from: task.status,
        to,
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn get_task(&self, task_id: &str) -> StoreResult<Task> {
        self.task(task_id)
            .ok_or_else(|| StoreError::TaskNotFound(task_id.to_string()))
    }

    async fn lock_task(&self, task_id: &str, worker_id: &str) -> StoreResult<Task> {
        self.with_task(task_id, |task| {
            if task.status.is_terminal() {
                return Err(transition(task, TaskStatus::Locked));
            }
            task.lock(worker_id)?;
            Ok(task.clone())
        })
    }

    async fn start_task(&self, task_id: &str) -> StoreResult<()> {
        self.with_task(task_id, |task| {
            if task.status != TaskStatus::Locked {
                return Err(transition(task, TaskStatus::Running));
            }
            task.start()?;
            Ok(())
        })
    }

    async fn finish_task(
        &self,
        task_id: &str,
        status: TaskStatus,
        result: Option<&Value>,
        error: Option<&str>,
    ) -> StoreResult<bool> {
        self.with_task(task_id, |task| {
            if task.status.is_terminal() {
                return Ok(false);
            }
            task.finish(status, result.cloned(), error.map(str::to_string))?;
            Ok(true)
        })
    }

    async fn requeue_task(&self, task_id: &str, note: &str) -> StoreResult<()> {
        self.with_task(task_id, |task| {
            if task.status.is_terminal() {
                return Err(transition(task, TaskStatus::Queued));
            }
            task.requeue(note)?;
            Ok(())
        })
    }

    async fn is_cancelled(&self, task_id: &str) -> StoreResult<bool> {
        Ok(self
            .tasks
            .read()
            .get(task_id)
            .map(|task| task.status == TaskStatus::Cancelled)
            .unwrap_or(false))
    }

    async fn update_progress(&self, task_id: &str, progress: i32) -> StoreResult<()> {
        self.with_task(task_id, |task| {
            task.progress = progress.clamp(0, 100);
            Ok(())
        })
    }
}

#[async_trait]
impl HostStore for MemoryStore {
    async fn find_hosts_with_credentials(
        &self,
        tenant_id: i64,
        host_ids: &[i64],
    ) -> StoreResult<Vec<HostWithCredential>> {
        let hosts = self.hosts.read();
        let credentials = self.credentials.read();

        Ok(host_ids
            .iter()
            .filter_map(|id| hosts.get(id))
            .filter(|host| host.record.tenant_id == tenant_id)
            .map(|host| HostWithCredential {
                host: host.record.clone(),
                credential: host
                    .record
                    .credential_id
                    .and_then(|id| credentials.get(&id).cloned()),
            })
            .collect())
    }

    async fn update_host_status(
        &self,
        host_id: i64,
        status: HostStatus,
        checked_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        if let Some(host) = self.hosts.write().get_mut(&host_id) {
            host.status = status.as_str().to_string();
            host.last_check_at = Some(checked_at);
        }
        Ok(())
    }

    async fn apply_collected_facts(
        &self,
        host_id: i64,
        facts: &CollectedFacts,
        collected_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let mut hosts = self.hosts.write();
        let Some(host) = hosts.get_mut(&host_id) else {
            return Ok(());
        };

        let incoming = &facts.scalars;
        let current = &mut host.scalars;
        merge(&mut current.hostname, &incoming.hostname);
        merge(&mut current.os_type, &incoming.os_type);
        merge(&mut current.os_version, &incoming.os_version);
        merge(&mut current.kernel, &incoming.kernel);
        merge(&mut current.architecture, &incoming.architecture);
        merge(&mut current.cpu_model, &incoming.cpu_model);
        if incoming.cpu_cores.is_some() {
            current.cpu_cores = incoming.cpu_cores;
        }
        if incoming.memory_total_mb.is_some() {
            current.memory_total_mb = incoming.memory_total_mb;
        }
        if let Some(hostname) = &incoming.hostname {
            host.record.hostname = hostname.clone();
        }

        host.status = HostStatus::Online.as_str().to_string();
        host.last_check_at = Some(collected_at);
        host.disks = facts.disks.clone();
        host.network_cards = facts.network_cards.clone();
        Ok(())
    }
}

#[async_trait]
impl WorkerRegistry for MemoryStore {
    async fn register_worker(&self, registration: &WorkerRegistration) -> StoreResult<()> {
        let mut workers = self.workers.write();
        let stats = workers
            .get(&registration.worker_id)
            .map(|existing| existing.stats)
            .unwrap_or_default();
        workers.insert(
            registration.worker_id.clone(),
            StoredWorker {
                registration: registration.clone(),
                stats,
                status: "online".to_string(),
                last_heartbeat: Utc::now(),
            },
        );
        Ok(())
    }

    async fn heartbeat_worker(&self, worker_id: &str, stats: &WorkerStats) -> StoreResult<()> {
        let mut workers = self.workers.write();
        let worker = workers
            .get_mut(worker_id)
            .ok_or_else(|| StoreError::WorkerNotFound(worker_id.to_string()))?;
        worker.stats = *stats;
        worker.status = "online".to_string();
        worker.last_heartbeat = Utc::now();
        Ok(())
    }

    async fn mark_worker_offline(&self, worker_id: &str) -> StoreResult<()> {
        if let Some(worker) = self.workers.write().get_mut(worker_id) {
            worker.status = "offline".to_string();
            worker.last_heartbeat = Utc::now();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn queued_task() -> Task {
        Task::builder("ping", 1).params(json!({"hosts": [1]})).build()
    }

    fn host(id: i64, tenant_id: i64, credential_id: Option<i64>) -> HostRecord {
        HostRecord {
            id,
            tenant_id,
            name: format!("host-{}", id),
            ip_address: format!("10.0.0.{}", id),
            port: 22,
            credential_id,
            hostname: String::new(),
        }
    }

    #[tokio::test]
    async fn test_lock_start_finish() {
        let store = MemoryStore::new();
        let task = queued_task();
        let id = task.task_id.clone();
        store.insert_task(task);

        let locked = store.lock_task(&id, "w-1").await.unwrap();
        assert_eq!(locked.status, TaskStatus::Locked);
        assert_eq!(locked.worker_id.as_deref(), Some("w-1"));

        store.start_task(&id).await.unwrap();
        assert!(store
            .finish_task(&id, TaskStatus::Success, Some(&json!({"ok": true})), None)
            .await
            .unwrap());

        let row = store.get_task(&id).await.unwrap();
        assert_eq!(row.status, TaskStatus::Success);
        assert_eq!(row.progress, 100);
        let finished_at = row.finished_at;

        // terminal rows are never overwritten
        assert!(!store
            .finish_task(&id, TaskStatus::Failed, None, Some("late"))
            .await
            .unwrap());
        let row = store.get_task(&id).await.unwrap();
        assert_eq!(row.status, TaskStatus::Success);
        assert_eq!(row.finished_at, finished_at);
    }

    #[tokio::test]
    async fn test_start_requires_lock() {
        let store = MemoryStore::new();
        let task = queued_task();
        let id = task.task_id.clone();
        store.insert_task(task);

        assert!(matches!(
            store.start_task(&id).await,
            Err(StoreError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_cancelled_task_cannot_be_locked() {
        let store = MemoryStore::new();
        let task = queued_task();
        let id = task.task_id.clone();
        store.insert_task(task);

        assert!(store.cancel_task(&id));
        assert!(store.is_cancelled(&id).await.unwrap());
        assert!(store.lock_task(&id, "w").await.is_err());
    }

    #[tokio::test]
    async fn test_requeue_bumps_retry_count() {
        let store = MemoryStore::new();
        let task = queued_task();
        let id = task.task_id.clone();
        store.insert_task(task);

        store.lock_task(&id, "w").await.unwrap();
        store.requeue_task(&id, "connection refused").await.unwrap();

        let row = store.get_task(&id).await.unwrap();
        assert_eq!(row.status, TaskStatus::Queued);
        assert_eq!(row.retry_count, 1);
        assert_eq!(row.worker_id, None);
    }

    #[tokio::test]
    async fn test_missing_task() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.get_task("nope").await,
            Err(StoreError::TaskNotFound(_))
        ));
        assert!(!store.is_cancelled("nope").await.unwrap());
    }

    #[tokio::test]
    async fn test_find_hosts_scopes_tenant() {
        let store = MemoryStore::new();
        store.insert_host(host(1, 7, Some(10)));
        store.insert_host(host(2, 7, None));
        store.insert_host(host(3, 8, Some(10)));
        store.insert_credential(StoredCredential {
            id: 10,
            tenant_id: 7,
            kind: "password".into(),
            username: "root".into(),
            password: String::new(),
            private_key: String::new(),
            passphrase: String::new(),
        });

        let found = store.find_hosts_with_credentials(7, &[1, 2, 3, 99]).await.unwrap();
        assert_eq!(found.len(), 2);
        assert!(found[0].credential.is_some());
        assert!(found[1].credential.is_none());
    }

    #[tokio::test]
    async fn test_worker_registry() {
        let store = MemoryStore::new();
        let registration = WorkerRegistration {
            worker_id: "w-1".into(),
            worker_type: "distributed".into(),
            hostname: "box".into(),
            ip_address: "10.0.0.1".into(),
            concurrent: 2,
            task_types: vec!["ping".into()],
            version: "0.1.0".into(),
        };

        assert!(store.heartbeat_worker("w-1", &WorkerStats::default()).await.is_err());
        store.register_worker(&registration).await.unwrap();

        let stats = WorkerStats {
            task_count: 1,
            total_tasks: 5,
            ..Default::default()
        };
        store.heartbeat_worker("w-1", &stats).await.unwrap();
        assert_eq!(store.worker("w-1").unwrap().stats.total_tasks, 5);

        store.mark_worker_offline("w-1").await.unwrap();
        assert_eq!(store.worker("w-1").unwrap().status, "offline");
    }
}
