//! End-to-end runs of the worker runtime on the in-memory queue and stores.

use async_trait::async_trait;
use parking_lot::Mutex;
use remedy_core::crypto::CredentialCipher;
use remedy_core::{Priority, Task, TaskMessage, TaskStatus};
use remedy_queue::{MemoryBackend, QueueConfig, RecoverySweeper, TaskQueueStore};
use remedy_worker::executor::{CommandOutput, CommandRunner, CommandSpec};
use remedy_worker::store::{HostRecord, MemoryStore, StoredCredential};
use remedy_worker::{
    Executors, HostFactIngestor, HostResolver, LocalDecryptor, TaskOutcome, Worker, WorkerConfig, WorkerDeps,
};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const KEY: &str = "integration-key";
const WAIT: Duration = Duration::from_millis(10);

const PING_OK: &str = "3 packets transmitted, 3 received, 0% packet loss\n\
                       rtt min/avg/max/mdev = 0.2/0.3/0.4/0.1 ms\n";

enum Step {
    Reply(i32, String),
    Refuse,
    Sleep(Duration),
    SlowReply(Duration, String),
    Panic,
    CancelThenSleep(String, Duration),
}

/// Plays back one step per command
struct FakeRunner {
    steps: Mutex<VecDeque<Step>>,
    store: Arc<MemoryStore>,
}

#[async_trait]
impl CommandRunner for FakeRunner {
    async fn run(&self, _command: &CommandSpec) -> io::Result<CommandOutput> {
        let step = self.steps.lock().pop_front();
        match step {
            Some(Step::Reply(exit_code, stdout)) => Ok(CommandOutput {
                exit_code,
                stdout,
                stderr: String::new(),
            }),
            Some(Step::Refuse) => Err(io::Error::new(io::ErrorKind::ConnectionRefused, "connection refused")),
            Some(Step::Sleep(duration)) => {
                tokio::time::sleep(duration).await;
                Ok(CommandOutput::default())
            }
            Some(Step::SlowReply(duration, stdout)) => {
                tokio::time::sleep(duration).await;
                Ok(CommandOutput {
                    exit_code: 0,
                    stdout,
                    stderr: String::new(),
                })
            }
            Some(Step::Panic) => panic!("runner exploded"),
            Some(Step::CancelThenSleep(task_id, duration)) => {
                self.store.cancel_task(&task_id);
                tokio::time::sleep(duration).await;
                Ok(CommandOutput {
                    exit_code: 0,
                    stdout: PING_OK.to_string(),
                    stderr: String::new(),
                })
            }
            None => Ok(CommandOutput::default()),
        }
    }
}

struct Harness {
    worker: Worker,
    queue: TaskQueueStore,
    store: Arc<MemoryStore>,
}

fn harness(steps: Vec<Step>) -> Harness {
    harness_with(steps, |_| {})
}

fn harness_with(steps: Vec<Step>, configure: impl FnOnce(&mut WorkerConfig)) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let cipher = CredentialCipher::new(KEY);
    for id in 1..=3 {
        store.insert_host(HostRecord {
            id,
            tenant_id: 1,
            name: format!("web-{}", id),
            ip_address: format!("10.1.0.{}", id),
            port: 22,
            credential_id: Some(100 + id),
            hostname: String::new(),
        });
        store.insert_credential(StoredCredential {
            id: 100 + id,
            tenant_id: 1,
            kind: "password".into(),
            username: "root".into(),
            password: cipher.encrypt("secret").unwrap(),
            private_key: String::new(),
            passphrase: String::new(),
        });
    }

    let mut config = WorkerConfig::default();
    config.worker.id = "worker-it".into();
    config.execution.cancel_poll_interval_secs = 1;
    config.execution.task_heartbeat_interval_secs = 1;
    config.execution.dequeue_wait_ms = 10;
    configure(&mut config);

    let queue = TaskQueueStore::new(Arc::new(MemoryBackend::new()), QueueConfig::default());
    let runner = Arc::new(FakeRunner {
        steps: Mutex::new(steps.into()),
        store: store.clone(),
    });

    let worker = Worker::new(
        config,
        WorkerDeps {
            queue: queue.clone(),
            tasks: store.clone(),
            resolver: HostResolver::new(store.clone(), Arc::new(LocalDecryptor::new(cipher))),
            executors: Executors::new(runner),
            ingestor: HostFactIngestor::new(store.clone()),
            registry: store.clone(),
            control_plane: None,
        },
    );

    Harness { worker, queue, store }
}

impl Harness {
    async fn submit(&self, task: Task) -> String {
        let id = task.task_id.clone();
        self.queue.enqueue(task.to_message()).await.unwrap();
        self.store.insert_task(task);
        id
    }

    async fn run_one(&self) -> TaskOutcome {
        self.worker.poll_once(WAIT).await.unwrap().expect("a message was queued")
    }

    async fn queue_status(&self, id: &str) -> TaskStatus {
        self.queue.get_task_status(id).await.unwrap().unwrap().status.unwrap()
    }

    /// Start the full runtime, returning once `id` is executing
    async fn start_until_running(&self, id: &str) -> (CancellationToken, JoinHandle<()>) {
        self.worker.register().await.unwrap();
        let shutdown = CancellationToken::new();
        let handle = {
            let worker = self.worker.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { worker.run(shutdown).await.unwrap() })
        };

        for _ in 0..100 {
            if self.queue_status(id).await == TaskStatus::Running {
                return (shutdown, handle);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("task {id} never started");
    }
}

fn task(task_type: &str, params: Value) -> Task {
    Task::builder(task_type, 1).params(params).build()
}

#[tokio::test]
async fn zero_hosts_fails_without_requeue() {
    let h = harness(vec![]);
    let id = h.submit(task("ping", json!({"hosts": []}))).await;

    assert_eq!(h.run_one().await, TaskOutcome::Failed("no hosts specified".into()));

    let row = h.store.task(&id).unwrap();
    assert_eq!(row.status, TaskStatus::Failed);
    assert_eq!(row.error.as_deref(), Some("no hosts specified"));
    assert_eq!(row.retry_count, 0);
    assert_eq!(h.queue_status(&id).await, TaskStatus::Failed);
    assert_eq!(h.queue.get_queue_stats().await.unwrap().total, 0);
}

#[tokio::test]
async fn unknown_hosts_are_not_executable() {
    let h = harness(vec![]);
    let id = h.submit(task("ping", json!({"hosts": [42]}))).await;

    assert_eq!(h.run_one().await, TaskOutcome::Failed("no executable hosts".into()));
    assert_eq!(h.store.task(&id).unwrap().status, TaskStatus::Failed);
}

#[tokio::test]
async fn connectivity_error_requeues_instead_of_failing() {
    let h = harness(vec![Step::Refuse]);
    let id = h.submit(task("ping", json!({"hosts": [1]}))).await;

    let outcome = h.run_one().await;
    assert!(matches!(outcome, TaskOutcome::Requeued(ref reason) if reason.contains("connection refused")));

    let row = h.store.task(&id).unwrap();
    assert_eq!(row.status, TaskStatus::Queued);
    assert_eq!(row.retry_count, 1);
    assert_eq!(h.queue_status(&id).await, TaskStatus::Queued);
    assert_eq!(h.queue.get_queue_stats().await.unwrap().total, 1);
    assert_eq!(h.queue.processing_len().await.unwrap(), 0);
}

#[tokio::test]
async fn exhausted_retries_are_left_for_recovery() {
    let h = harness(vec![Step::Refuse]);
    let id = h
        .submit(Task::builder("ping", 1).params(json!({"hosts": [1]})).max_retries(0).build())
        .await;

    assert!(matches!(h.run_one().await, TaskOutcome::Abandoned(_)));

    let row = h.store.task(&id).unwrap();
    assert_eq!(row.status, TaskStatus::Running);
    assert!(row.error.is_none());
    assert_eq!(h.queue_status(&id).await, TaskStatus::Running);
    assert_eq!(h.queue.processing_len().await.unwrap(), 1);
}

#[tokio::test]
async fn ping_success_updates_hosts() {
    let h = harness(vec![Step::Reply(0, PING_OK.into()), Step::Reply(1, String::new())]);
    let id = h.submit(task("ping", json!({"hosts": [1, 2]}))).await;

    assert_eq!(h.run_one().await, TaskOutcome::Succeeded);

    let row = h.store.task(&id).unwrap();
    assert_eq!(row.status, TaskStatus::Success);
    assert_eq!(row.progress, 100);
    let result = row.result.unwrap();
    assert_eq!(result["summary"], json!({"total": 2, "success": 1, "failed": 1}));

    assert_eq!(h.store.host(1).unwrap().status, "online");
    assert_eq!(h.store.host(2).unwrap().status, "offline");

    let record = h.queue.get_task_status(&id).await.unwrap().unwrap();
    assert_eq!(record.status, Some(TaskStatus::Success));
    assert_eq!(record.result.unwrap()["summary"]["success"], json!(1));
}

#[tokio::test]
async fn all_hosts_failing_is_terminal() {
    let h = harness(vec![Step::Reply(1, String::new()), Step::Reply(2, String::new())]);
    let id = h.submit(task("ping", json!({"hosts": [1, 2]}))).await;

    assert_eq!(h.run_one().await, TaskOutcome::Failed("all hosts failed".into()));

    let row = h.store.task(&id).unwrap();
    assert_eq!(row.status, TaskStatus::Failed);
    assert_eq!(row.result.unwrap()["summary"]["failed"], json!(2));
    assert_eq!(h.queue.get_queue_stats().await.unwrap().total, 0);
}

#[tokio::test]
async fn collect_stores_facts() {
    let facts = json!({
        "ansible_facts": {
            "ansible_hostname": "web-1",
            "ansible_system": "Linux",
            "ansible_mounts": [
                {"device": "/dev/sda1", "mount": "/", "fstype": "ext4",
                 "size_total": 107374182400u64, "size_available": 53687091200u64}
            ],
            "ansible_interfaces": ["lo", "eth0"],
            "ansible_eth0": {"macaddress": "aa:bb:cc:dd:ee:ff", "active": true, "ipv4": {"address": "10.1.0.1"}}
        },
        "changed": false
    });
    let stdout = format!("10.1.0.1 | SUCCESS => {}", serde_json::to_string_pretty(&facts).unwrap());
    let h = harness(vec![Step::Reply(0, stdout)]);
    h.submit(task("collect", json!({"hosts": [1]}))).await;

    assert_eq!(h.run_one().await, TaskOutcome::Succeeded);

    let host = h.store.host(1).unwrap();
    assert_eq!(host.status, "online");
    assert_eq!(host.scalars.hostname.as_deref(), Some("web-1"));
    assert_eq!(host.disks.len(), 1);
    assert_eq!(host.disks[0].usage_percent, 50.0);
    assert_eq!(host.network_cards.len(), 1);
    assert_eq!(host.network_cards[0].state, "up");
}

#[tokio::test]
async fn shell_without_command_fails() {
    let h = harness(vec![]);
    let id = h.submit(task("shell_command", json!({"hosts": [1]}))).await;

    assert_eq!(h.run_one().await, TaskOutcome::Failed("missing command parameter".into()));
    assert_eq!(h.store.task(&id).unwrap().status, TaskStatus::Failed);
}

#[tokio::test]
async fn unsupported_task_type_fails() {
    let h = harness(vec![]);
    let message = TaskMessage::new("t-reboot", "reboot", Priority::default()).params(json!({"hosts": [1]}));
    h.queue.enqueue(message).await.unwrap();

    assert_eq!(
        h.worker.poll_once(WAIT).await.unwrap(),
        Some(TaskOutcome::Failed("unsupported task type: reboot".into()))
    );
    assert_eq!(h.queue_status("t-reboot").await, TaskStatus::Failed);
}

#[tokio::test]
async fn cancelled_before_pickup_is_skipped() {
    let h = harness(vec![]);
    let id = h.submit(task("ping", json!({"hosts": [1]}))).await;
    h.store.cancel_task(&id);

    assert_eq!(h.run_one().await, TaskOutcome::Skipped(TaskStatus::Cancelled));
    assert_eq!(h.queue_status(&id).await, TaskStatus::Cancelled);
}

#[tokio::test]
async fn cancellation_stops_between_hosts() {
    let t = task("ping", json!({"hosts": [1, 2]}));
    let id = t.task_id.clone();
    let h = harness(vec![Step::CancelThenSleep(id.clone(), Duration::from_millis(1500))]);
    h.submit(t).await;

    assert_eq!(h.run_one().await, TaskOutcome::Cancelled);
    assert_eq!(h.store.task(&id).unwrap().status, TaskStatus::Cancelled);
    assert_eq!(h.queue_status(&id).await, TaskStatus::Cancelled);
}

#[tokio::test]
async fn timeout_is_a_system_error() {
    let h = harness(vec![Step::Sleep(Duration::from_secs(5))]);
    let id = h
        .submit(Task::builder("ping", 1).params(json!({"hosts": [1]})).timeout_secs(1).build())
        .await;

    let outcome = h.run_one().await;
    assert!(matches!(outcome, TaskOutcome::Requeued(ref reason) if reason.contains("timed out")));
    assert_eq!(h.store.task(&id).unwrap().status, TaskStatus::Queued);
}

#[tokio::test]
async fn panic_is_a_system_error() {
    let h = harness(vec![Step::Panic]);
    let id = h.submit(task("ping", json!({"hosts": [1]}))).await;

    let outcome = h.run_one().await;
    assert!(matches!(outcome, TaskOutcome::Requeued(ref reason) if reason.contains("panicked")));
    assert_ne!(h.store.task(&id).unwrap().status, TaskStatus::Failed);
}

#[tokio::test]
async fn idle_queue_returns_none() {
    let h = harness(vec![]);
    assert_eq!(h.worker.poll_once(WAIT).await.unwrap(), None);
    assert_eq!(h.worker.active_tasks(), 0);
}

#[tokio::test]
async fn shutdown_drains_in_flight_task() {
    let h = harness(vec![Step::SlowReply(Duration::from_millis(700), PING_OK.to_string())]);
    let id = h.submit(task("ping", json!({"hosts": [1]}))).await;

    let (shutdown, handle) = h.start_until_running(&id).await;
    shutdown.cancel();
    handle.await.unwrap();

    assert_eq!(h.store.task(&id).unwrap().status, TaskStatus::Success);
    assert_eq!(h.queue_status(&id).await, TaskStatus::Success);
    assert_eq!(h.queue.get_queue_stats().await.unwrap().total, 0);
}

#[tokio::test]
async fn shutdown_deadline_stops_heartbeat_and_leaves_task_recoverable() {
    let h = harness_with(vec![Step::Sleep(Duration::from_secs(30))], |config| {
        config.execution.shutdown_timeout_secs = 1;
    });
    let id = h.submit(task("ping", json!({"hosts": [1]}))).await;

    let (shutdown, handle) = h.start_until_running(&id).await;
    shutdown.cancel();
    handle.await.unwrap();

    // nothing may renew the marker once the runtime has returned
    tokio::time::sleep(Duration::from_millis(100)).await;
    let heartbeat = h.queue.keys().heartbeat(&id);
    h.queue.backend().del(&heartbeat).await.unwrap();
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(!h.queue.task_heartbeat_alive(&id).await.unwrap());

    assert_eq!(h.queue_status(&id).await, TaskStatus::Running);
    assert_eq!(h.queue.processing_len().await.unwrap(), 1);

    let report = RecoverySweeper::new(h.queue.clone())
        .sweep_at(chrono::Utc::now().timestamp() + 10_000)
        .await
        .unwrap();
    assert_eq!(report.recovered, 1);
    assert_eq!(h.queue_status(&id).await, TaskStatus::Queued);
    assert_eq!(h.queue.get_queue_stats().await.unwrap().total, 1);
}
