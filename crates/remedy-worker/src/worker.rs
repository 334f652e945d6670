use crate::auth_client::ControlPlane;
use crate::config::WorkerConfig;
use crate::error::{ExecutionError, Result, StoreError};
use crate::executor::{ExecutionContext, Executors, TaskOutput, ALL_HOSTS_FAILED};
use crate::hosts::HostResolver;
use crate::ingest::HostFactIngestor;
use crate::store::{TaskStore, WorkerRegistration, WorkerRegistry, WorkerStats};
use remedy_core::{ErrorKind, Task, TaskKind, TaskStatus};
use remedy_queue::{DequeuedTask, RecoverySweeper, TaskQueueStore};

use parking_lot::RwLock;
use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use std::sync::Arc;
use std::time::Duration;
use sysinfo::System;
use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const WORKER_TYPE: &str = "distributed";

const DEQUEUE_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// How one dequeued message ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Succeeded,
    /// Terminal business failure
    Failed(String),
    Cancelled,
    /// Transient failure, pushed back onto its priority list
    Requeued(String),
    /// Transient failure left in the processing list for the recovery sweeper
    Abandoned(String),
    /// The durable row was already terminal; nothing ran
    Skipped(TaskStatus),
}

#[derive(Debug, Default)]
struct Counters {
    active: usize,
    total: i64,
    success: i64,
    failed: i64,
}

/// Collaborators the runtime drives
#[derive(Clone)]
pub struct WorkerDeps {
    pub queue: TaskQueueStore,
    pub tasks: Arc<dyn TaskStore>,
    pub resolver: HostResolver,
    pub executors: Executors,
    pub ingestor: HostFactIngestor,
    pub registry: Arc<dyn WorkerRegistry>,
    pub control_plane: Option<Arc<dyn ControlPlane>>,
}

/// Worker process that executes tasks
#[derive(Clone)]
pub struct Worker {
    config: Arc<WorkerConfig>,
    deps: WorkerDeps,
    counters: Arc<RwLock<Counters>>,
}

/// Keeps the active count accurate however execution ends
struct ActiveSlot {
    counters: Arc<RwLock<Counters>>,
}

impl ActiveSlot {
    fn enter(counters: &Arc<RwLock<Counters>>) -> Self {
        counters.write().active += 1;
        ActiveSlot {
            counters: counters.clone(),
        }
    }
}

impl Drop for ActiveSlot {
    fn drop(&mut self) {
        let mut counters = self.counters.write();
        counters.active = counters.active.saturating_sub(1);
    }
}

struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl Worker {
    pub fn new(config: WorkerConfig, deps: WorkerDeps) -> Self {
        Worker {
            config: Arc::new(config),
            deps,
            counters: Arc::new(RwLock::new(Counters::default())),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker.id
    }

    pub fn active_tasks(&self) -> usize {
        self.counters.read().active
    }

    pub fn registration(&self) -> WorkerRegistration {
        WorkerRegistration {
            worker_id: self.worker_id().to_string(),
            worker_type: WORKER_TYPE.to_string(),
            hostname: machine_hostname(),
            ip_address: local_ip().to_string(),
            concurrent: self.config.worker.concurrency as i32,
            task_types: Executors::supported_types(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    pub async fn register(&self) -> Result<()> {
        let registration = self.registration();
        self.deps.registry.register_worker(&registration).await?;
        info!(
            worker_id = %registration.worker_id,
            hostname = %registration.hostname,
            ip = %registration.ip_address,
            task_types = ?registration.task_types,
            "Worker registered"
        );
        Ok(())
    }

    /// Current counters with the given resource usage
    pub fn stats(&self, cpu_usage: f64, memory_usage: f64) -> WorkerStats {
        let counters = self.counters.read();
        WorkerStats {
            task_count: counters.active as i64,
            cpu_usage,
            memory_usage,
            total_tasks: counters.total,
            success_tasks: counters.success,
            failed_tasks: counters.failed,
        }
    }

    /// Run until `shutdown` fires, then drain and disconnect
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        info!(
            worker_id = %self.worker_id(),
            name = %self.config.display_name(),
            concurrency = self.config.worker.concurrency,
            "Starting worker"
        );

        let mut pollers = JoinSet::new();
        for slot in 0..self.config.worker.concurrency {
            let worker = self.clone();
            let shutdown = shutdown.clone();
            pollers.spawn(async move { worker.poll_loop(slot, shutdown).await });
        }

        let background = CancellationToken::new();
        let heartbeat = {
            let worker = self.clone();
            let stop = background.clone();
            tokio::spawn(async move { worker.heartbeat_loop(stop).await })
        };
        let recovery = {
            let sweeper = RecoverySweeper::new(self.deps.queue.clone())
                .with_stale_after(Duration::from_secs(self.deps.queue.config().stale_after_secs));
            let interval = self.config.execution.recovery_interval();
            let stop = background.clone();
            tokio::spawn(async move { sweeper.run(interval, stop).await })
        };

        shutdown.cancelled().await;
        info!(worker_id = %self.worker_id(), "Worker shutting down gracefully");

        self.graceful_shutdown(&mut pollers).await;

        background.cancel();
        let _ = heartbeat.await;
        let _ = recovery.await;

        if let Some(control_plane) = &self.deps.control_plane {
            if let Err(e) = control_plane.disconnect().await {
                warn!(error = %e, "Failed to notify master of disconnect");
            }
        }
        if let Err(e) = self.deps.registry.mark_worker_offline(self.worker_id()).await {
            warn!(error = %e, "Failed to mark worker offline");
        }

        info!(worker_id = %self.worker_id(), "Worker stopped");
        Ok(())
    }

    async fn poll_loop(&self, slot: usize, shutdown: CancellationToken) {
        debug!(slot, "Poller started");
        let wait = self.config.execution.dequeue_wait();

        while !shutdown.is_cancelled() {
            match self.poll_once(wait).await {
                Ok(_) => {}
                Err(e) => {
                    error!(slot, error = %e, "Dequeue failed");
                    tokio::select! {
                        _ = tokio::time::sleep(DEQUEUE_ERROR_BACKOFF) => {}
                        _ = shutdown.cancelled() => break,
                    }
                }
            }
        }
        debug!(slot, "Poller stopped");
    }

    /// Dequeue at most one message and run it to completion
    pub async fn poll_once(&self, wait: Duration) -> Result<Option<TaskOutcome>> {
        match self.deps.queue.dequeue(wait).await? {
            Some(dequeued) => Ok(Some(self.process(dequeued).await)),
            None => Ok(None),
        }
    }

    /// Drive one dequeued message through lock, resolve, run and outcome recording
    pub async fn process(&self, dequeued: DequeuedTask) -> TaskOutcome {
        let _slot = ActiveSlot::enter(&self.counters);
        let task_id = dequeued.message.task_id.clone();
        info!(task_id = %task_id, task_type = %dequeued.message.task_type, "Task received");

        let outcome = self.process_inner(&dequeued).await;
        self.record(&outcome);

        match &outcome {
            TaskOutcome::Succeeded => info!(task_id = %task_id, "Task succeeded"),
            TaskOutcome::Failed(reason) => warn!(task_id = %task_id, error = %reason, "Task failed"),
            TaskOutcome::Cancelled => info!(task_id = %task_id, "Task cancelled"),
            TaskOutcome::Requeued(reason) => warn!(task_id = %task_id, error = %reason, "Task requeued"),
            TaskOutcome::Abandoned(reason) => {
                warn!(task_id = %task_id, error = %reason, "Task left for recovery")
            }
            TaskOutcome::Skipped(status) => {
                info!(task_id = %task_id, status = %status, "Task already finished, skipped")
            }
        }
        outcome
    }

    fn record(&self, outcome: &TaskOutcome) {
        let mut counters = self.counters.write();
        counters.total += 1;
        match outcome {
            TaskOutcome::Succeeded => counters.success += 1,
            TaskOutcome::Failed(_) => counters.failed += 1,
            _ => {}
        }
    }

    async fn process_inner(&self, dequeued: &DequeuedTask) -> TaskOutcome {
        let task_id = dequeued.message.task_id.as_str();

        let Some(kind) = dequeued.message.kind() else {
            let reason = format!("unsupported task type: {}", dequeued.message.task_type);
            return self.fail(task_id, &reason, None).await;
        };

        let task = match self.deps.tasks.lock_task(task_id, self.worker_id()).await {
            Ok(task) => task,
            Err(StoreError::InvalidTransition { from, .. }) if from.is_terminal() => {
                self.set_queue_status(task_id, from, 100).await;
                return TaskOutcome::Skipped(from);
            }
            Err(e) if e.kind() == ErrorKind::Business => {
                return self.fail(task_id, &e.to_string(), None).await;
            }
            Err(e) => return TaskOutcome::Abandoned(e.to_string()),
        };
        self.set_queue_status(task_id, TaskStatus::Locked, 0).await;

        let hosts = match self.deps.resolver.resolve(task.tenant_id, &task.params).await {
            Ok(hosts) => hosts,
            Err(e) => return self.conclude(dequeued, &task, kind, Err(e)).await,
        };

        if let Err(e) = self.deps.tasks.start_task(task_id).await {
            return self.conclude(dequeued, &task, kind, Err(e.into())).await;
        }
        self.set_queue_status(task_id, TaskStatus::Running, 0).await;

        let result = self.execute(&task, kind, hosts).await;
        self.conclude(dequeued, &task, kind, result).await
    }

    /// Run the executor in its own task under the task timeout, with heartbeat renewal and
    /// cancellation polling alongside
    async fn execute(
        &self,
        task: &Task,
        kind: TaskKind,
        hosts: Vec<crate::hosts::ResolvedHost>,
    ) -> std::result::Result<TaskOutput, ExecutionError> {
        let cancel = CancellationToken::new();
        let (progress_tx, progress_rx) = watch::channel(0);
        let ctx = ExecutionContext::new(task.task_id.clone(), kind, task.params.clone(), hosts)
            .with_cancel(cancel.clone())
            .with_progress(progress_tx);

        let done = CancellationToken::new();
        // stop renewing the heartbeat even if this future is dropped mid-run
        let _stop_watcher = done.clone().drop_guard();
        let watcher = {
            let worker = self.clone();
            let task_id = task.task_id.clone();
            let cancel = cancel.clone();
            let done = done.clone();
            tokio::spawn(async move { worker.watch_task(task_id, cancel, progress_rx, done).await })
        };

        let timeout = task.timeout();
        let executors = self.deps.executors.clone();
        let handle = tokio::spawn(async move { tokio::time::timeout(timeout, executors.execute(&ctx)).await });
        let _abort_executor = AbortOnDrop(handle.abort_handle());

        let result = match handle.await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ExecutionError::system(format!(
                "execution timed out after {}s",
                timeout.as_secs()
            ))),
            Err(e) if e.is_panic() => Err(ExecutionError::system(format!("executor panicked: {}", e))),
            Err(e) => Err(ExecutionError::system(e.to_string())),
        };

        done.cancel();
        let _ = watcher.await;

        match result {
            Err(ExecutionError::System(_)) | Err(ExecutionError::Business(_)) if cancel.is_cancelled() => {
                Err(ExecutionError::Cancelled)
            }
            other => other,
        }
    }

    /// Renew the task heartbeat and watch for external cancellation until `done`
    async fn watch_task(
        &self,
        task_id: String,
        cancel: CancellationToken,
        progress: watch::Receiver<i32>,
        done: CancellationToken,
    ) {
        let mut heartbeat = tokio::time::interval(self.config.execution.task_heartbeat_interval());
        let mut cancel_poll = tokio::time::interval(self.config.execution.cancel_poll_interval());

        loop {
            tokio::select! {
                _ = done.cancelled() => break,
                _ = heartbeat.tick() => {
                    let current = *progress.borrow();
                    if let Err(e) = self.deps.queue.renew_task_heartbeat(&task_id).await {
                        warn!(task_id = %task_id, error = %e, "Failed to renew task heartbeat");
                    }
                    self.set_queue_status(&task_id, TaskStatus::Running, current).await;
                    if let Err(e) = self.deps.tasks.update_progress(&task_id, current).await {
                        debug!(task_id = %task_id, error = %e, "Failed to store progress");
                    }
                }
                _ = cancel_poll.tick(), if !cancel.is_cancelled() => {
                    match self.deps.tasks.is_cancelled(&task_id).await {
                        Ok(true) => {
                            info!(task_id = %task_id, "Cancellation requested");
                            cancel.cancel();
                        }
                        Ok(false) => {}
                        Err(e) => debug!(task_id = %task_id, error = %e, "Cancel check failed"),
                    }
                }
            }
        }
    }

    /// Record the outcome of an attempt. Business failures are terminal; system failures
    /// are never written as failed.
    async fn conclude(
        &self,
        dequeued: &DequeuedTask,
        task: &Task,
        kind: TaskKind,
        result: std::result::Result<TaskOutput, ExecutionError>,
    ) -> TaskOutcome {
        let task_id = task.task_id.as_str();

        match result {
            Ok(output) if output.all_failed() => self.fail(task_id, ALL_HOSTS_FAILED, Some(&output.result)).await,
            Ok(output) => {
                if let Err(e) = self.deps.queue.set_task_result(task_id, Some(&output.result), "").await {
                    warn!(task_id, error = %e, "Failed to write queue result");
                }
                if let Err(e) = self
                    .deps
                    .tasks
                    .finish_task(task_id, TaskStatus::Success, Some(&output.result), None)
                    .await
                {
                    error!(task_id, error = %e, "Failed to record task success");
                }
                if kind.ingests_host_facts() {
                    self.deps.ingestor.ingest(kind, &output.result).await;
                }
                TaskOutcome::Succeeded
            }
            Err(ExecutionError::Cancelled) => {
                if let Err(e) = self
                    .deps
                    .tasks
                    .finish_task(task_id, TaskStatus::Cancelled, None, Some("task cancelled"))
                    .await
                {
                    warn!(task_id, error = %e, "Failed to record cancellation");
                }
                self.set_queue_status(task_id, TaskStatus::Cancelled, 100).await;
                TaskOutcome::Cancelled
            }
            Err(ExecutionError::Business(reason)) => self.fail(task_id, &reason, None).await,
            Err(ExecutionError::System(reason)) => self.retry_or_abandon(dequeued, task, reason).await,
        }
    }

    async fn fail(&self, task_id: &str, reason: &str, result: Option<&serde_json::Value>) -> TaskOutcome {
        if let Err(e) = self
            .deps
            .tasks
            .finish_task(task_id, TaskStatus::Failed, result, Some(reason))
            .await
        {
            warn!(task_id, error = %e, "Failed to record task failure");
        }
        if let Err(e) = self.deps.queue.set_task_result(task_id, None, reason).await {
            warn!(task_id, error = %e, "Failed to write queue result");
        }
        TaskOutcome::Failed(reason.to_string())
    }

    async fn retry_or_abandon(&self, dequeued: &DequeuedTask, task: &Task, reason: String) -> TaskOutcome {
        let task_id = task.task_id.as_str();
        if !task.can_retry() {
            warn!(
                task_id,
                retry_count = task.retry_count,
                max_retries = task.max_retries,
                "Retries exhausted, leaving task for recovery"
            );
            return TaskOutcome::Abandoned(reason);
        }

        if let Err(e) = self.deps.tasks.requeue_task(task_id, &reason).await {
            warn!(task_id, error = %e, "Failed to requeue task row");
            return TaskOutcome::Abandoned(reason);
        }
        match self.deps.queue.requeue(dequeued, &reason).await {
            Ok(true) => {}
            Ok(false) => debug!(task_id, "Message already moved back by a recovery sweep"),
            Err(e) => {
                warn!(task_id, error = %e, "Failed to requeue message");
                return TaskOutcome::Abandoned(reason);
            }
        }
        TaskOutcome::Requeued(reason)
    }

    async fn set_queue_status(&self, task_id: &str, status: TaskStatus, progress: i32) {
        if let Err(e) = self
            .deps
            .queue
            .update_task_status(task_id, status, progress, self.worker_id())
            .await
        {
            warn!(task_id, status = %status, error = %e, "Failed to update queue status");
        }
    }

    async fn heartbeat_loop(&self, stop: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.execution.heartbeat_interval());
        let mut sys = System::new();

        loop {
            tokio::select! {
                _ = interval.tick() => self.send_heartbeat(&mut sys).await,
                _ = stop.cancelled() => break,
            }
        }
    }

    /// Refresh the relational worker row and ping the master
    pub async fn send_heartbeat(&self, sys: &mut System) {
        let (cpu, memory) = get_system_stats(sys);
        let stats = self.stats(cpu, memory);

        if let Err(e) = self.deps.registry.heartbeat_worker(self.worker_id(), &stats).await {
            warn!(error = %e, "Failed to update worker heartbeat");
        }
        if let Some(control_plane) = &self.deps.control_plane {
            if let Err(e) = control_plane.heartbeat().await {
                warn!(error = %e, "Failed to send heartbeat to master");
            }
        }
        debug!(active = stats.task_count, cpu = stats.cpu_usage, memory = stats.memory_usage, "Heartbeat sent");
    }

    /// Graceful shutdown - wait for active tasks to complete
    /// Let each poller finish its current dequeue and task, aborting what remains at the
    /// deadline. Aborted tasks stay in the processing list for the recovery sweeper.
    async fn graceful_shutdown(&self, pollers: &mut JoinSet<()>) {
        info!("Waiting for active tasks to complete...");

        let drain = async { while pollers.join_next().await.is_some() {} };
        if tokio::time::timeout(self.config.execution.shutdown_timeout(), drain)
            .await
            .is_ok()
        {
            info!("All tasks completed, shutting down");
            return;
        }

        warn!("Shutdown deadline exceeded, {} tasks still active", self.active_tasks());
        pollers.abort_all();
        while pollers.join_next().await.is_some() {}
    }
}

/// Host CPU and memory usage, both in percent
fn get_system_stats(sys: &mut System) -> (f64, f64) {
    sys.refresh_cpu_usage();
    sys.refresh_memory();

    let cpu = sys.global_cpu_usage() as f64;
    let memory = match sys.total_memory() {
        0 => 0.0,
        total => sys.used_memory() as f64 * 100.0 / total as f64,
    };
    (cpu, memory)
}

fn machine_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Address of the interface that routes outward; no packet is sent
fn local_ip() -> IpAddr {
    UdpSocket::bind("0.0.0.0:0")
        .and_then(|socket| {
            socket.connect("8.8.8.8:80")?;
            socket.local_addr()
        })
        .map(|addr| addr.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}
