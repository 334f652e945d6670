use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};
use remedy_queue::{QueueStats, SweepReport};

/// Prometheus metrics for the master
pub struct MasterMetrics {
    pub registry: Registry,

    // Queue depth
    pub queue_depth: IntGaugeVec,
    pub processing_depth: IntGauge,

    // Recovery sweeps
    pub tasks_recovered_total: IntCounter,
    pub tasks_cleaned_total: IntCounter,

    // Workers
    pub auth_attempts_total: IntCounterVec,
    pub workers_connected: IntGauge,
}

impl MasterMetrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let queue_depth = IntGaugeVec::new(
            Opts::new("remedy_queue_depth", "Pending tasks by priority level"),
            &["priority"],
        )?;
        registry.register(Box::new(queue_depth.clone()))?;

        let processing_depth = IntGauge::new("remedy_processing_depth", "Entries on the processing list")?;
        registry.register(Box::new(processing_depth.clone()))?;

        let tasks_recovered_total = IntCounter::new(
            "remedy_tasks_recovered_total",
            "Orphaned tasks pushed back onto their priority list",
        )?;
        registry.register(Box::new(tasks_recovered_total.clone()))?;

        let tasks_cleaned_total = IntCounter::new(
            "remedy_tasks_cleaned_total",
            "Finished tasks removed from the processing list",
        )?;
        registry.register(Box::new(tasks_cleaned_total.clone()))?;

        let auth_attempts_total = IntCounterVec::new(
            Opts::new("remedy_worker_auth_total", "Worker authentication attempts by result"),
            &["result"],
        )?;
        registry.register(Box::new(auth_attempts_total.clone()))?;

        let workers_connected = IntGauge::new("remedy_workers_connected", "Workers holding an active connection")?;
        registry.register(Box::new(workers_connected.clone()))?;

        Ok(MasterMetrics {
            registry,
            queue_depth,
            processing_depth,
            tasks_recovered_total,
            tasks_cleaned_total,
            auth_attempts_total,
            workers_connected,
        })
    }

    pub fn update_queue_depth(&self, stats: &QueueStats, processing: usize) {
        for (level, depth) in &stats.by_priority {
            self.queue_depth
                .with_label_values(&[&level.to_string()])
                .set(*depth as i64);
        }
        self.processing_depth.set(processing as i64);
    }

    pub fn record_sweep(&self, report: &SweepReport) {
        self.tasks_recovered_total.inc_by(report.recovered as u64);
        self.tasks_cleaned_total.inc_by(report.cleaned as u64);
    }

    pub fn record_auth(&self, result: &str) {
        self.auth_attempts_total.with_label_values(&[result]).inc();
    }

    /// Text exposition format
    pub fn gather(&self) -> prometheus::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}
