use super::{
    CollectedFacts, HostRecord, HostStatus, HostStore, HostWithCredential, StoredCredential,
    TaskStore, WorkerRegistration, WorkerRegistry, WorkerStats,
};
use crate::error::{StoreError, StoreResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use remedy_core::wire::DatabaseConfig;
use remedy_core::{Priority, Task, TaskStatus};
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;
use std::time::Duration;
use tracing::{debug, info};

const TASK_COLUMNS: &str = "task_id, task_type, tenant_id, name, priority, params, status, progress, \
     retry_count, max_retries, timeout, worker_id, result, error, created_at, queued_at, locked_at, \
     started_at, finished_at";

const TERMINAL: &str = "('success', 'failed', 'cancelled')";

#[derive(FromRow)]
struct TaskRow {
    task_id: String,
    task_type: String,
    tenant_id: i64,
    name: String,
    priority: i64,
    params: Option<Value>,
    status: String,
    progress: i64,
    retry_count: i64,
    max_retries: i64,
    timeout: i64,
    worker_id: Option<String>,
    result: Option<Value>,
    error: Option<String>,
    created_at: DateTime<Utc>,
    queued_at: Option<DateTime<Utc>>,
    locked_at: Option<DateTime<Utc>>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

impl TryFrom<TaskRow> for Task {
    type Error = StoreError;

    fn try_from(row: TaskRow) -> StoreResult<Task> {
        let status = TaskStatus::from_str(&row.status)
            .ok_or_else(|| remedy_core::CoreError::UnknownStatus(row.status.clone()))?;

        Ok(Task {
            task_id: row.task_id,
            task_type: row.task_type,
            tenant_id: row.tenant_id,
            name: row.name,
            priority: Priority::from_raw(row.priority.clamp(0, u8::MAX as i64) as u8),
            params: row.params.unwrap_or(Value::Null),
            status,
            progress: row.progress as i32,
            retry_count: row.retry_count.max(0) as u32,
            max_retries: row.max_retries.max(0) as u32,
            timeout_secs: row.timeout.max(0) as u64,
            worker_id: row.worker_id.filter(|w| !w.is_empty()),
            result: row.result,
            error: row.error.filter(|e| !e.is_empty()),
            created_at: row.created_at,
            queued_at: row.queued_at,
            locked_at: row.locked_at,
            started_at: row.started_at,
            finished_at: row.finished_at,
        })
    }
}

#[derive(FromRow)]
struct HostJoinRow {
    id: i64,
    tenant_id: i64,
    name: String,
    ip_address: String,
    port: i64,
    credential_id: Option<i64>,
    hostname: Option<String>,
    cred_id: Option<i64>,
    cred_tenant_id: Option<i64>,
    cred_type: Option<String>,
    cred_username: Option<String>,
    cred_password: Option<Vec<u8>>,
    cred_private_key: Option<Vec<u8>>,
    cred_passphrase: Option<Vec<u8>>,
}

fn ciphertext(bytes: Option<Vec<u8>>) -> String {
    bytes
        .map(|b| String::from_utf8_lossy(&b).trim().to_string())
        .unwrap_or_default()
}

impl From<HostJoinRow> for HostWithCredential {
    fn from(row: HostJoinRow) -> Self {
        let credential = row.cred_id.map(|id| StoredCredential {
            id,
            tenant_id: row.cred_tenant_id.unwrap_or(row.tenant_id),
            kind: row.cred_type.unwrap_or_default(),
            username: row.cred_username.unwrap_or_default(),
            password: ciphertext(row.cred_password),
            private_key: ciphertext(row.cred_private_key),
            passphrase: ciphertext(row.cred_passphrase),
        });

        HostWithCredential {
            host: HostRecord {
                id: row.id,
                tenant_id: row.tenant_id,
                name: row.name,
                ip_address: row.ip_address,
                port: u16::try_from(row.port).unwrap_or(22),
                credential_id: row.credential_id.filter(|id| *id > 0),
                hostname: row.hostname.unwrap_or_default(),
            },
            credential,
        }
    }
}

/// Postgres-backed stores over the control plane's schema
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(config: &DatabaseConfig, max_connections: u32) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect(&config.connection_url())
            .await?;
        info!(host = %config.host, dbname = %config.dbname, "Connected to database");
        Ok(PgStore { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        PgStore { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Distinguish a missing row from one in the wrong state after a guarded update
    async fn explain_miss(&self, task_id: &str, to: TaskStatus) -> StoreError {
        match self.get_task(task_id).await {
            Ok(task) => StoreError::InvalidTransition {
                task_id: task_id.to_string(),
                from: task.status,
                to,
            },
            Err(e) => e,
        }
    }
}

#[async_trait]
impl TaskStore for PgStore {
    async fn get_task(&self, task_id: &str) -> StoreResult<Task> {
        let sql = format!("SELECT {} FROM tasks WHERE task_id = $1", TASK_COLUMNS);
        let row: Option<TaskRow> = sqlx::query_as(&sql)
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;
        row.ok_or_else(|| StoreError::TaskNotFound(task_id.to_string()))?
            .try_into()
    }

    async fn lock_task(&self, task_id: &str, worker_id: &str) -> StoreResult<Task> {
        let sql = format!(
            "UPDATE tasks SET status = 'locked', worker_id = $2, locked_at = NOW(), updated_at = NOW() \
             WHERE task_id = $1 AND status NOT IN {} RETURNING {}",
            TERMINAL, TASK_COLUMNS
        );
        let row: Option<TaskRow> = sqlx::query_as(&sql)
            .bind(task_id)
            .bind(worker_id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => row.try_into(),
            None => Err(self.explain_miss(task_id, TaskStatus::Locked).await),
        }
    }

    async fn start_task(&self, task_id: &str) -> StoreResult<()> {
        let updated = sqlx::query(
            "UPDATE tasks SET status = 'running', started_at = NOW(), updated_at = NOW() \
             WHERE task_id = $1 AND status = 'locked'",
        )
        .bind(task_id)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(self.explain_miss(task_id, TaskStatus::Running).await);
        }
        Ok(())
    }

    async fn finish_task(
        &self,
        task_id: &str,
        status: TaskStatus,
        result: Option<&Value>,
        error: Option<&str>,
    ) -> StoreResult<bool> {
        let sql = format!(
            "UPDATE tasks SET status = $2, result = COALESCE($3, result), error = COALESCE($4, error), \
             progress = 100, finished_at = NOW(), updated_at = NOW() \
             WHERE task_id = $1 AND status NOT IN {}",
            TERMINAL
        );
        let updated = sqlx::query(&sql)
            .bind(task_id)
            .bind(status.as_str())
            .bind(result)
            .bind(error)
            .execute(&self.pool)
            .await?;

        if updated.rows_affected() == 0 {
            // confirm the row exists; an already-terminal row is not an error
            self.get_task(task_id).await?;
            debug!(task_id, "Task already terminal, outcome not written");
            return Ok(false);
        }
        Ok(true)
    }

    async fn requeue_task(&self, task_id: &str, note: &str) -> StoreResult<()> {
        let sql = format!(
            "UPDATE tasks SET status = 'queued', retry_count = retry_count + 1, worker_id = '', \
             error = $2, queued_at = NOW(), updated_at = NOW() \
             WHERE task_id = $1 AND status NOT IN {}",
            TERMINAL
        );
        let updated = sqlx::query(&sql)
            .bind(task_id)
            .bind(note)
            .execute(&self.pool)
            .await?;

        if updated.rows_affected() == 0 {
            return Err(self.explain_miss(task_id, TaskStatus::Queued).await);
        }
        Ok(())
    }

    async fn is_cancelled(&self, task_id: &str) -> StoreResult<bool> {
        let status: Option<String> = sqlx::query_scalar("SELECT status FROM tasks WHERE task_id = $1")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(status.as_deref() == Some(TaskStatus::Cancelled.as_str()))
    }

    async fn update_progress(&self, task_id: &str, progress: i32) -> StoreResult<()> {
        sqlx::query("UPDATE tasks SET progress = $2, updated_at = NOW() WHERE task_id = $1")
            .bind(task_id)
            .bind(i64::from(progress.clamp(0, 100)))
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl HostStore for PgStore {
    async fn find_hosts_with_credentials(
        &self,
        tenant_id: i64,
        host_ids: &[i64],
    ) -> StoreResult<Vec<HostWithCredential>> {
        if host_ids.is_empty() {
            return Ok(Vec::new());
        }

        let rows: Vec<HostJoinRow> = sqlx::query_as(
            "SELECT h.id, h.tenant_id, h.name, h.ip_address, h.port, h.credential_id, h.hostname, \
                    c.id AS cred_id, c.tenant_id AS cred_tenant_id, c.type AS cred_type, \
                    c.username AS cred_username, c.password AS cred_password, \
                    c.private_key AS cred_private_key, c.passphrase AS cred_passphrase \
             FROM hosts h \
             LEFT JOIN credentials c ON c.id = h.credential_id \
             WHERE h.id = ANY($1) AND h.tenant_id = $2 \
             ORDER BY h.id",
        )
        .bind(host_ids)
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(HostWithCredential::from).collect())
    }

    async fn update_host_status(
        &self,
        host_id: i64,
        status: HostStatus,
        checked_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        sqlx::query("UPDATE hosts SET status = $2, last_check_at = $3, updated_at = NOW() WHERE id = $1")
            .bind(host_id)
            .bind(status.as_str())
            .bind(checked_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn apply_collected_facts(
        &self,
        host_id: i64,
        facts: &CollectedFacts,
        collected_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let scalars = &facts.scalars;
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "UPDATE hosts SET hostname = COALESCE($2, hostname), os_type = COALESCE($3, os_type), \
             os_version = COALESCE($4, os_version), kernel = COALESCE($5, kernel), \
             architecture = COALESCE($6, architecture), cpu_model = COALESCE($7, cpu_model), \
             cpu_cores = COALESCE($8, cpu_cores), memory_total_mb = COALESCE($9, memory_total_mb), \
             status = 'online', last_check_at = $10, updated_at = NOW() \
             WHERE id = $1",
        )
        .bind(host_id)
        .bind(scalars.hostname.as_deref())
        .bind(scalars.os_type.as_deref())
        .bind(scalars.os_version.as_deref())
        .bind(scalars.kernel.as_deref())
        .bind(scalars.architecture.as_deref())
        .bind(scalars.cpu_model.as_deref())
        .bind(scalars.cpu_cores.map(i64::from))
        .bind(scalars.memory_total_mb)
        .bind(collected_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM host_disks WHERE host_id = $1")
            .bind(host_id)
            .execute(&mut *tx)
            .await?;
        for disk in &facts.disks {
            sqlx::query(
                "INSERT INTO host_disks (host_id, device, mount_point, file_system, total_mb, used_mb, \
                 free_mb, usage_percent, updated_at) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
            )
            .bind(host_id)
            .bind(&disk.device)
            .bind(&disk.mount_point)
            .bind(&disk.file_system)
            .bind(disk.total_mb)
            .bind(disk.used_mb)
            .bind(disk.free_mb)
            .bind(disk.usage_percent)
            .bind(collected_at)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query("DELETE FROM host_network_cards WHERE host_id = $1")
            .bind(host_id)
            .execute(&mut *tx)
            .await?;
        for card in &facts.network_cards {
            sqlx::query(
                "INSERT INTO host_network_cards (host_id, name, mac_address, ip_address, ip_addresses, \
                 mtu, speed, state, updated_at) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
            )
            .bind(host_id)
            .bind(&card.name)
            .bind(&card.mac_address)
            .bind(&card.ip_address)
            .bind(&card.ip_addresses)
            .bind(i64::from(card.mtu))
            .bind(i64::from(card.speed))
            .bind(&card.state)
            .bind(collected_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!(
            host_id,
            disks = facts.disks.len(),
            network_cards = facts.network_cards.len(),
            "Host facts stored"
        );
        Ok(())
    }
}

#[async_trait]
impl WorkerRegistry for PgStore {
    async fn register_worker(&self, registration: &WorkerRegistration) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO workers (worker_id, worker_type, hostname, ip_address, concurrent, task_types, \
             version, status, registered_at, last_heartbeat) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, 'online', NOW(), NOW()) \
             ON CONFLICT (worker_id) DO UPDATE SET worker_type = EXCLUDED.worker_type, \
             hostname = EXCLUDED.hostname, ip_address = EXCLUDED.ip_address, \
             concurrent = EXCLUDED.concurrent, task_types = EXCLUDED.task_types, \
             version = EXCLUDED.version, status = 'online', last_heartbeat = NOW()",
        )
        .bind(&registration.worker_id)
        .bind(&registration.worker_type)
        .bind(&registration.hostname)
        .bind(&registration.ip_address)
        .bind(i64::from(registration.concurrent))
        .bind(registration.task_types.join(","))
        .bind(&registration.version)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn heartbeat_worker(&self, worker_id: &str, stats: &WorkerStats) -> StoreResult<()> {
        let updated = sqlx::query(
            "UPDATE workers SET last_heartbeat = NOW(), status = 'online', task_count = $2, \
             cpu_usage = $3, memory_usage = $4, total_tasks = $5, success_tasks = $6, failed_tasks = $7 \
             WHERE worker_id = $1",
        )
        .bind(worker_id)
        .bind(stats.task_count)
        .bind(stats.cpu_usage)
        .bind(stats.memory_usage)
        .bind(stats.total_tasks)
        .bind(stats.success_tasks)
        .bind(stats.failed_tasks)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(StoreError::WorkerNotFound(worker_id.to_string()));
        }
        Ok(())
    }

    async fn mark_worker_offline(&self, worker_id: &str) -> StoreResult<()> {
        sqlx::query("UPDATE workers SET status = 'offline', last_heartbeat = NOW() WHERE worker_id = $1")
            .bind(worker_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
