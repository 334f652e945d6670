use crate::backend::QueueBackend;
use crate::status::{fields, TaskStatusRecord};
use crate::{KeySpace, QueueConfig, Result};
use chrono::Utc;
use remedy_core::{Priority, TaskMessage, TaskStatus};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Error written into the status record of a message that cannot be decoded
pub const PARSE_FAILURE: &str = "parse failure";

/// A message handed out by [`TaskQueueStore::dequeue`].
///
/// Keeps the exact stored text so the entry can later be removed from the processing
/// list byte-for-byte.
#[derive(Debug, Clone, PartialEq)]
pub struct DequeuedTask {
    pub message: TaskMessage,
    pub raw: String,
}

/// Depth of each priority list
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub by_priority: BTreeMap<u8, usize>,
    pub total: usize,
}

impl QueueStats {
    pub fn depth(&self, priority: Priority) -> usize {
        self.by_priority.get(&priority.value()).copied().unwrap_or(0)
    }

    /// Flat `priority_N` / `total` view used by JSON outputs
    pub fn to_map(&self) -> BTreeMap<String, usize> {
        let mut map: BTreeMap<String, usize> = self
            .by_priority
            .iter()
            .map(|(level, depth)| (format!("priority_{}", level), *depth))
            .collect();
        map.insert("total".to_string(), self.total);
        map
    }
}

fn now() -> String {
    Utc::now().timestamp().to_string()
}

fn field(name: &str, value: impl Into<String>) -> (String, String) {
    (name.to_string(), value.into())
}

/// Priority-partitioned task queue with per-task status records.
///
/// Cheap to clone; every clone shares the same backend handle.
#[derive(Clone)]
pub struct TaskQueueStore {
    backend: Arc<dyn QueueBackend>,
    keys: KeySpace,
    config: QueueConfig,
}

impl TaskQueueStore {
    pub fn new(backend: Arc<dyn QueueBackend>, config: QueueConfig) -> Self {
        TaskQueueStore {
            backend,
            keys: KeySpace::new(config.prefix.clone()),
            config,
        }
    }

    pub fn backend(&self) -> &Arc<dyn QueueBackend> {
        &self.backend
    }

    pub fn keys(&self) -> &KeySpace {
        &self.keys
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub async fn ping(&self) -> Result<()> {
        self.backend.ping().await
    }

    /// Push a message onto its priority list and open its status record.
    ///
    /// The priority is not validated here; producers are expected to send 1-10.
    pub async fn enqueue(&self, mut message: TaskMessage) -> Result<()> {
        message.created = Utc::now().timestamp();
        let raw = message.to_json()?;
        let list = self.keys.priority(message.priority);

        let record = [
            field(fields::STATUS, TaskStatus::Queued.as_str()),
            field(fields::QUEUED_AT, now()),
        ];
        self.backend
            .push_tracked(&list, &raw, &self.keys.task(&message.task_id), &record, self.config.status_ttl())
            .await?;

        debug!(task_id = %message.task_id, priority = %message.priority, "Task enqueued");
        Ok(())
    }

    /// Take the most urgent available message, moving it to the processing list.
    ///
    /// Each priority list is polled in order for up to `wait`. Returns `None` when every
    /// list stayed empty.
    pub async fn dequeue(&self, wait: Duration) -> Result<Option<DequeuedTask>> {
        let processing = self.keys.processing();

        for priority in Priority::levels() {
            let list = self.keys.priority(priority);
            let Some(raw) = self.backend.blmove(&list, &processing, wait).await? else {
                continue;
            };

            let message = match TaskMessage::from_json(&raw) {
                Ok(message) => message,
                Err(e) => {
                    self.reject_unparseable(&raw, &e.to_string()).await?;
                    return Ok(None);
                }
            };

            let record = [
                field(fields::STATUS, TaskStatus::Processing.as_str()),
                field(fields::DEQUEUED_AT, now()),
            ];
            self.backend.hset(&self.keys.task(&message.task_id), &record).await?;

            return Ok(Some(DequeuedTask { message, raw }));
        }

        Ok(None)
    }

    /// Mark a message that cannot be decoded as failed so it never loops.
    /// Without a recoverable task id the entry is dropped from the processing list.
    async fn reject_unparseable(&self, raw: &str, reason: &str) -> Result<()> {
        let task_id = serde_json::from_str::<Value>(raw)
            .ok()
            .and_then(|v| v.get("task_id").and_then(Value::as_str).map(str::to_string));

        match task_id {
            Some(task_id) => {
                error!(task_id = %task_id, error = %reason, "Failed to parse task message");
                let record = [
                    field(fields::STATUS, TaskStatus::Failed.as_str()),
                    field(fields::ERROR, PARSE_FAILURE),
                    field(fields::FINISHED_AT, now()),
                ];
                self.backend.hset(&self.keys.task(&task_id), &record).await
            }
            None => {
                error!(error = %reason, "Dropping task message without task id");
                self.backend.lrem(&self.keys.processing(), 1, raw).await?;
                Ok(())
            }
        }
    }

    pub async fn update_task_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        progress: i32,
        worker_id: &str,
    ) -> Result<()> {
        let stamp = now();
        let mut record = vec![
            field(fields::STATUS, status.as_str()),
            field(fields::PROGRESS, progress.to_string()),
            field(fields::UPDATED_AT, stamp.clone()),
        ];
        if !worker_id.is_empty() {
            record.push(field(fields::WORKER_ID, worker_id));
        }
        if status == TaskStatus::Running {
            record.push(field(fields::STARTED_AT, stamp));
        } else if status.is_terminal() {
            record.push(field(fields::FINISHED_AT, stamp));
        }

        self.backend.hset(&self.keys.task(task_id), &record).await
    }

    /// Terminal write. A non-empty `error` marks the task failed, otherwise succeeded.
    ///
    /// The message stays in the processing list; the recovery sweeper removes it.
    pub async fn set_task_result(&self, task_id: &str, result: Option<&Value>, error: &str) -> Result<()> {
        let mut record = vec![field(fields::FINISHED_AT, now())];
        if !error.is_empty() {
            record.push(field(fields::STATUS, TaskStatus::Failed.as_str()));
            record.push(field(fields::ERROR, error));
        } else {
            record.push(field(fields::STATUS, TaskStatus::Success.as_str()));
            if let Some(result) = result {
                record.push(field(fields::RESULT, serde_json::to_string(result)?));
            }
        }

        self.backend.hset(&self.keys.task(task_id), &record).await
    }

    pub async fn get_task_status(&self, task_id: &str) -> Result<Option<TaskStatusRecord>> {
        let record = self.backend.hgetall(&self.keys.task(task_id)).await?;
        Ok(TaskStatusRecord::from_fields(&record))
    }

    pub async fn get_queue_stats(&self) -> Result<QueueStats> {
        let mut stats = QueueStats::default();
        for priority in Priority::levels() {
            let depth = self.backend.llen(&self.keys.priority(priority)).await?;
            stats.by_priority.insert(priority.value(), depth);
            stats.total += depth;
        }
        Ok(stats)
    }

    pub async fn processing_len(&self) -> Result<usize> {
        self.backend.llen(&self.keys.processing()).await
    }

    /// Delete a task's status record
    pub async fn remove_task(&self, task_id: &str) -> Result<bool> {
        self.backend.del(&self.keys.task(task_id)).await
    }

    /// Drop every message waiting at one priority level
    pub async fn clear_queue(&self, priority: Priority) -> Result<bool> {
        warn!(priority = %priority, "Clearing priority queue");
        self.backend.del(&self.keys.priority(priority)).await
    }

    /// Refresh the liveness marker of an executing task
    pub async fn renew_task_heartbeat(&self, task_id: &str) -> Result<()> {
        self.backend
            .set_ex(&self.keys.heartbeat(task_id), &now(), self.config.heartbeat_ttl())
            .await
    }

    pub async fn task_heartbeat_alive(&self, task_id: &str) -> Result<bool> {
        self.backend.exists(&self.keys.heartbeat(task_id)).await
    }

    /// Move an in-flight message back onto its priority list, annotating the record.
    ///
    /// Returns `false` without touching anything when the message is no longer in the
    /// processing list, e.g. because another sweeper already moved it.
    pub async fn requeue(&self, task: &DequeuedTask, note: &str) -> Result<bool> {
        let stamp = now();
        let record = [
            field(fields::STATUS, TaskStatus::Queued.as_str()),
            field(fields::RECOVERED_AT, stamp.clone()),
            field(fields::QUEUED_AT, stamp),
            field(fields::ERROR, note),
        ];
        self.backend
            .requeue(
                &self.keys.processing(),
                &self.keys.priority(task.message.priority),
                &task.raw,
                &self.keys.task(&task.message.task_id),
                &record,
                self.config.status_ttl(),
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryBackend;
    use serde_json::json;

    const WAIT: Duration = Duration::from_millis(5);

    fn store() -> TaskQueueStore {
        TaskQueueStore::new(Arc::new(MemoryBackend::new()), QueueConfig::default())
    }

    fn message(id: &str, priority: u8) -> TaskMessage {
        TaskMessage::new(id, "ping", Priority::new(priority).unwrap())
            .tenant(1, "acme")
            .params(json!({"hosts": [1]}))
    }

    #[tokio::test]
    async fn test_higher_priority_dequeued_first() {
        let store = store();
        store.enqueue(message("a", 3)).await.unwrap();
        store.enqueue(message("b", 1)).await.unwrap();

        let first = store.dequeue(WAIT).await.unwrap().unwrap();
        let second = store.dequeue(WAIT).await.unwrap().unwrap();
        assert_eq!(first.message.task_id, "b");
        assert_eq!(second.message.task_id, "a");
    }

    #[tokio::test]
    async fn test_fifo_within_level() {
        let store = store();
        store.enqueue(message("x", 5)).await.unwrap();
        store.enqueue(message("y", 5)).await.unwrap();

        assert_eq!(store.dequeue(WAIT).await.unwrap().unwrap().message.task_id, "x");
        assert_eq!(store.dequeue(WAIT).await.unwrap().unwrap().message.task_id, "y");
    }

    #[tokio::test]
    async fn test_empty_queue_returns_none() {
        assert!(store().dequeue(WAIT).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_dequeue_marks_processing() {
        let store = store();
        store.enqueue(message("t", 2)).await.unwrap();
        assert_eq!(
            store.get_task_status("t").await.unwrap().unwrap().status,
            Some(TaskStatus::Queued)
        );

        let task = store.dequeue(WAIT).await.unwrap().unwrap();
        let record = store.get_task_status("t").await.unwrap().unwrap();
        assert_eq!(record.status, Some(TaskStatus::Processing));
        assert!(record.dequeued_at.is_some());

        // the message lives in exactly one list
        assert_eq!(store.get_queue_stats().await.unwrap().total, 0);
        assert_eq!(
            store.backend().lrange(&store.keys().processing()).await.unwrap(),
            vec![task.raw]
        );
    }

    #[tokio::test]
    async fn test_status_updates_stamp_times() {
        let store = store();
        store.enqueue(message("t", 1)).await.unwrap();

        store.update_task_status("t", TaskStatus::Running, 10, "w-1").await.unwrap();
        let record = store.get_task_status("t").await.unwrap().unwrap();
        assert_eq!(record.status, Some(TaskStatus::Running));
        assert_eq!(record.worker_id.as_deref(), Some("w-1"));
        assert!(record.started_at.is_some());
        assert!(record.finished_at.is_none());

        store.update_task_status("t", TaskStatus::Cancelled, 10, "").await.unwrap();
        let record = store.get_task_status("t").await.unwrap().unwrap();
        assert!(record.finished_at.is_some());
        assert_eq!(record.worker_id.as_deref(), Some("w-1"));
    }

    #[tokio::test]
    async fn test_set_task_result() {
        let store = store();
        store.enqueue(message("ok", 1)).await.unwrap();
        store.enqueue(message("bad", 1)).await.unwrap();
        let _ = store.dequeue(WAIT).await.unwrap();

        store
            .set_task_result("ok", Some(&json!({"hosts": {}})), "")
            .await
            .unwrap();
        store.set_task_result("bad", None, "no hosts specified").await.unwrap();

        let ok = store.get_task_status("ok").await.unwrap().unwrap();
        assert_eq!(ok.status, Some(TaskStatus::Success));
        assert_eq!(ok.result, Some(json!({"hosts": {}})));

        let bad = store.get_task_status("bad").await.unwrap().unwrap();
        assert_eq!(bad.status, Some(TaskStatus::Failed));
        assert_eq!(bad.error.as_deref(), Some("no hosts specified"));

        // result writes never touch the lists
        assert_eq!(store.processing_len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_unparseable_message_marked_failed() {
        let store = store();
        let list = store.keys().priority(Priority::HIGHEST);
        store
            .backend()
            .lpush(&list, r#"{"task_id":"broken","priority":"high"}"#)
            .await
            .unwrap();
        store.backend().lpush(&list, "not json at all").await.unwrap();

        assert!(store.dequeue(WAIT).await.unwrap().is_none());
        let record = store.get_task_status("broken").await.unwrap().unwrap();
        assert_eq!(record.status, Some(TaskStatus::Failed));
        assert_eq!(record.error.as_deref(), Some(PARSE_FAILURE));

        // id-less garbage is dropped outright
        assert!(store.dequeue(WAIT).await.unwrap().is_none());
        assert_eq!(store.processing_len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_stats_remove_and_clear() {
        let store = store();
        store.enqueue(message("a", 1)).await.unwrap();
        store.enqueue(message("b", 1)).await.unwrap();
        store.enqueue(message("c", 10)).await.unwrap();

        let stats = store.get_queue_stats().await.unwrap();
        assert_eq!(stats.depth(Priority::HIGHEST), 2);
        assert_eq!(stats.depth(Priority::LOWEST), 1);
        assert_eq!(stats.total, 3);
        assert_eq!(stats.to_map()["priority_1"], 2);
        assert_eq!(stats.to_map()["total"], 3);

        assert!(store.clear_queue(Priority::HIGHEST).await.unwrap());
        assert_eq!(store.get_queue_stats().await.unwrap().total, 1);

        assert!(store.remove_task("c").await.unwrap());
        assert!(store.get_task_status("c").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_heartbeat_marker() {
        let store = store();
        assert!(!store.task_heartbeat_alive("t").await.unwrap());
        store.renew_task_heartbeat("t").await.unwrap();
        assert!(store.task_heartbeat_alive("t").await.unwrap());
    }

    #[tokio::test]
    async fn test_requeue_returns_message_to_its_level() {
        let store = store();
        store.enqueue(message("t", 4)).await.unwrap();
        let task = store.dequeue(WAIT).await.unwrap().unwrap();

        assert!(store.requeue(&task, "connection refused").await.unwrap());

        assert_eq!(store.processing_len().await.unwrap(), 0);
        assert_eq!(store.get_queue_stats().await.unwrap().depth(Priority::new(4).unwrap()), 1);
        let record = store.get_task_status("t").await.unwrap().unwrap();
        assert_eq!(record.status, Some(TaskStatus::Queued));
        assert_eq!(record.error.as_deref(), Some("connection refused"));
    }

    #[tokio::test]
    async fn test_requeue_twice_moves_once() {
        let store = store();
        store.enqueue(message("t", 3)).await.unwrap();
        let task = store.dequeue(WAIT).await.unwrap().unwrap();

        assert!(store.requeue(&task, "first").await.unwrap());
        assert!(!store.requeue(&task, "second").await.unwrap());

        let level = Priority::new(3).unwrap();
        assert_eq!(store.get_queue_stats().await.unwrap().depth(level), 1);
        assert_eq!(store.processing_len().await.unwrap(), 0);
        // the losing call leaves the record alone
        let record = store.get_task_status("t").await.unwrap().unwrap();
        assert_eq!(record.error.as_deref(), Some("first"));
    }

    #[tokio::test]
    async fn test_requeue_recreates_missing_record() {
        let store = store();
        store.enqueue(message("t", 2)).await.unwrap();
        let task = store.dequeue(WAIT).await.unwrap().unwrap();
        store.remove_task("t").await.unwrap();

        assert!(store.requeue(&task, "reclaimed").await.unwrap());
        let record = store.get_task_status("t").await.unwrap().unwrap();
        assert_eq!(record.status, Some(TaskStatus::Queued));
        assert!(record.queued_at.is_some());
    }
}
