use crate::{auth::AuthService, config::MasterConfig, metrics::MasterMetrics};
use remedy_queue::{QueueBackend, RecoverySweeper, TaskQueueStore};

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Control-plane state shared by the HTTP handlers and the background loops
pub struct Master {
    config: Arc<MasterConfig>,
    auth: Arc<AuthService>,
    queue: TaskQueueStore,
    sweeper: RecoverySweeper,
    metrics: Arc<MasterMetrics>,
}

impl Master {
    pub fn new(config: MasterConfig, backend: Arc<dyn QueueBackend>) -> anyhow::Result<Self> {
        let auth = AuthService::new(&config);
        let queue = TaskQueueStore::new(backend, config.queue.clone());
        let sweeper = RecoverySweeper::new(queue.clone());
        let metrics = MasterMetrics::new()?;

        Ok(Master {
            config: Arc::new(config),
            auth: Arc::new(auth),
            queue,
            sweeper,
            metrics: Arc::new(metrics),
        })
    }

    /// Background tasks (recovery sweep, stale connection cleanup, metrics)
    pub async fn background_tasks(&self, shutdown: CancellationToken) {
        let mut recovery = tokio::time::interval(self.config.recovery_interval());
        let mut cleanup = tokio::time::interval(self.config.cleanup_interval());

        info!(
            recovery_secs = self.config.recovery.interval_secs,
            cleanup_secs = self.config.auth.cleanup_interval_secs,
            "Background tasks started"
        );

        loop {
            tokio::select! {
                _ = recovery.tick() => {
                    self.recover_orphans().await;
                    self.update_queue_metrics().await;
                }
                _ = cleanup.tick() => {
                    self.cleanup_connections();
                }
                _ = shutdown.cancelled() => {
                    info!("Background tasks stopped");
                    break;
                }
            }
        }
    }

    /// One recovery pass over the processing list
    pub async fn recover_orphans(&self) {
        match self.sweeper.sweep().await {
            Ok(report) => {
                self.metrics.record_sweep(&report);
                if report.recovered > 0 || report.cleaned > 0 {
                    info!(
                        scanned = report.scanned,
                        cleaned = report.cleaned,
                        recovered = report.recovered,
                        "Recovery sweep finished"
                    );
                }
            }
            Err(e) => error!("Recovery sweep failed: {}", e),
        }
    }

    pub fn cleanup_connections(&self) {
        let removed = self.auth.cleanup_stale();
        for conn in &removed {
            debug!(worker_id = %conn.worker_id, ip = %conn.ip_address, "Connection timed out");
        }
        self.metrics
            .workers_connected
            .set(self.auth.connections().count_active() as i64);
    }

    pub async fn update_queue_metrics(&self) {
        let stats = match self.queue.get_queue_stats().await {
            Ok(stats) => stats,
            Err(e) => {
                error!("Failed to read queue stats: {}", e);
                return;
            }
        };
        let processing = self.queue.processing_len().await.unwrap_or_default();
        self.metrics.update_queue_depth(&stats, processing);
    }

    pub fn config(&self) -> &MasterConfig {
        &self.config
    }

    pub fn auth(&self) -> &AuthService {
        &self.auth
    }

    pub fn queue(&self) -> &TaskQueueStore {
        &self.queue
    }

    pub fn metrics(&self) -> Arc<MasterMetrics> {
        self.metrics.clone()
    }
}
