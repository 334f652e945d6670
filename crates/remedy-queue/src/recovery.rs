use crate::store::DequeuedTask;
use crate::{Result, TaskQueueStore};
use chrono::Utc;
use remedy_core::{TaskMessage, TaskStatus};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Annotation written into the status record of a forcibly requeued task
pub const RECOVERY_NOTE: &str = "execution timed out, worker presumed crashed, requeued";

/// Outcome of one pass over the processing list
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub scanned: usize,
    /// Terminal entries removed from the processing list
    pub cleaned: usize,
    /// Stale entries pushed back onto their priority list
    pub recovered: usize,
    /// Entries left alone: unparseable, heartbeat live, already moved, or still within
    /// the threshold
    pub skipped: usize,
}

/// Reconciles the processing list against status records.
///
/// Only elapsed time and status are consulted, so a sweep is safe to run from any
/// process, at any time, as often as needed.
#[derive(Clone)]
pub struct RecoverySweeper {
    store: TaskQueueStore,
    stale_after: Duration,
}

impl RecoverySweeper {
    pub fn new(store: TaskQueueStore) -> Self {
        let stale_after = Duration::from_secs(store.config().stale_after_secs);
        RecoverySweeper { store, stale_after }
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub async fn sweep(&self) -> Result<SweepReport> {
        self.sweep_at(Utc::now().timestamp()).await
    }

    /// Sweep using `now` (unix seconds) as the current time
    pub async fn sweep_at(&self, now: i64) -> Result<SweepReport> {
        let processing = self.store.keys().processing();
        let entries = self.store.backend().lrange(&processing).await?;
        let threshold = self.stale_after.as_secs() as i64;

        let mut report = SweepReport {
            scanned: entries.len(),
            ..Default::default()
        };

        for raw in entries {
            let Ok(message) = TaskMessage::from_json(&raw) else {
                report.skipped += 1;
                continue;
            };

            let record = self.store.get_task_status(&message.task_id).await?;
            let status = record.as_ref().and_then(|r| r.status);

            if let Some(status) = status.filter(TaskStatus::is_terminal) {
                self.store.backend().lrem(&processing, 1, &raw).await?;
                debug!(task_id = %message.task_id, status = %status, "Removed finished task from processing list");
                report.cleaned += 1;
                continue;
            }

            // a queued status here means the dequeue never marked it; no record means it expired
            let since = match (&record, status) {
                (Some(record), Some(status)) if status.is_in_flight() => record.dequeued_at,
                (Some(record), _) => record.queued_at,
                (None, _) => None,
            }
            .unwrap_or(message.created);
            let age = now.saturating_sub(since);

            if age <= threshold {
                report.skipped += 1;
                continue;
            }

            if self.store.task_heartbeat_alive(&message.task_id).await? {
                debug!(task_id = %message.task_id, "Task past threshold but heartbeat is live");
                report.skipped += 1;
                continue;
            }

            let task_id = message.task_id.clone();
            let priority = message.priority;
            let task = DequeuedTask { message, raw };
            if self.store.requeue(&task, RECOVERY_NOTE).await? {
                warn!(
                    task_id = %task_id,
                    priority = %priority,
                    status = status.map(|s| s.as_str()).unwrap_or("absent"),
                    age_secs = age,
                    "Requeued orphaned task"
                );
                report.recovered += 1;
            } else {
                debug!(task_id = %task_id, "Orphaned task already moved elsewhere");
                report.skipped += 1;
            }
        }

        Ok(report)
    }

    /// Sweep on a fixed interval until `shutdown` fires
    pub async fn run(&self, interval: Duration, shutdown: CancellationToken) {
        info!(interval_secs = interval.as_secs(), "Recovery sweeper started");
        let mut ticker = tokio::time::interval(interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.sweep().await {
                        Ok(report) if report.cleaned > 0 || report.recovered > 0 => {
                            info!(
                                scanned = report.scanned,
                                cleaned = report.cleaned,
                                recovered = report.recovered,
                                "Recovery sweep finished"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => error!("Recovery sweep failed: {}", e),
                    }
                }
                _ = shutdown.cancelled() => {
                    info!("Recovery sweeper stopped");
                    break;
                }
            }
        }
    }
}
