use anyhow::{bail, Context};
use chrono::{TimeZone, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use comfy_table::{presets::UTF8_FULL, Table};
use remedy_core::{Priority, TaskMessage, DEFAULT_QUEUE_PREFIX};
use remedy_queue::{QueueConfig, QueueStats, RecoverySweeper, RedisBackend, TaskQueueStore, TaskStatusRecord};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "remedy-admin")]
#[command(about = "Task queue admin CLI", long_about = None)]
struct Args {
    /// Redis connection URL
    #[arg(long, env = "REMEDY_REDIS_URL", default_value = "redis://127.0.0.1:6379/0")]
    redis_url: String,

    /// Key prefix shared with the master and workers
    #[arg(long, default_value = DEFAULT_QUEUE_PREFIX)]
    prefix: String,

    /// Output format
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Table)]
    format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show queue depth per priority
    Stats,

    /// Show a task's status record
    Status {
        task_id: String,
    },

    /// Delete a task's status record
    Remove {
        task_id: String,
    },

    /// Drop every message waiting at one priority level
    Clear {
        /// Priority level (1-10)
        priority: u8,
    },

    /// Run one recovery pass over the processing list
    Sweep {
        /// Seconds after dequeue before an in-flight task counts as orphaned
        #[arg(long)]
        stale_after: Option<u64>,
    },

    /// Enqueue a task (smoke testing)
    Enqueue {
        /// Task type
        #[arg(short, long)]
        task_type: String,

        /// Priority (1-10)
        #[arg(short = 'P', long, default_value = "5")]
        priority: u8,

        #[arg(long, default_value = "0")]
        tenant_id: i64,

        /// Task params as JSON
        #[arg(long, default_value = "{}")]
        params: String,

        /// Task id, generated when omitted
        #[arg(long)]
        task_id: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let backend = RedisBackend::connect(&args.redis_url)
        .await
        .with_context(|| format!("connecting to {}", args.redis_url))?;
    let store = TaskQueueStore::new(Arc::new(backend), QueueConfig::with_prefix(args.prefix.clone()));

    let output = run(&store, args.command, args.format).await?;
    println!("{output}");

    Ok(())
}

async fn run(store: &TaskQueueStore, command: Commands, format: OutputFormat) -> anyhow::Result<String> {
    let output = match command {
        Commands::Stats => {
            let stats = store.get_queue_stats().await?;
            let processing = store.processing_len().await?;
            match format {
                OutputFormat::Json => {
                    serde_json::to_string_pretty(&json!({ "queues": stats.to_map(), "processing": processing }))?
                }
                OutputFormat::Table => stats_table(&stats, processing).to_string(),
            }
        }

        Commands::Status { task_id } => {
            let Some(record) = store.get_task_status(&task_id).await? else {
                bail!("no status record for task {task_id}");
            };
            match format {
                OutputFormat::Json => serde_json::to_string_pretty(&record_json(&task_id, &record))?,
                OutputFormat::Table => status_table(&task_id, &record).to_string(),
            }
        }

        Commands::Remove { task_id } => {
            let removed = store.remove_task(&task_id).await?;
            match format {
                OutputFormat::Json => json!({ "task_id": task_id, "removed": removed }).to_string(),
                OutputFormat::Table if removed => format!("Removed status record for {task_id}"),
                OutputFormat::Table => format!("No status record for {task_id}"),
            }
        }

        Commands::Clear { priority } => {
            let priority = Priority::new(priority)?;
            let cleared = store.clear_queue(priority).await?;
            match format {
                OutputFormat::Json => json!({ "priority": priority.value(), "cleared": cleared }).to_string(),
                OutputFormat::Table => format!("Cleared priority {priority} queue: {cleared}"),
            }
        }

        Commands::Sweep { stale_after } => {
            let mut sweeper = RecoverySweeper::new(store.clone());
            if let Some(secs) = stale_after {
                sweeper = sweeper.with_stale_after(Duration::from_secs(secs));
            }
            let report = sweeper.sweep().await?;
            match format {
                OutputFormat::Json => serde_json::to_string_pretty(&json!({
                    "scanned": report.scanned,
                    "cleaned": report.cleaned,
                    "recovered": report.recovered,
                    "skipped": report.skipped,
                }))?,
                OutputFormat::Table => {
                    let mut table = Table::new();
                    table.load_preset(UTF8_FULL);
                    table.set_header(vec!["Scanned", "Cleaned", "Recovered", "Skipped"]);
                    table.add_row(vec![
                        report.scanned.to_string(),
                        report.cleaned.to_string(),
                        report.recovered.to_string(),
                        report.skipped.to_string(),
                    ]);
                    table.to_string()
                }
            }
        }

        Commands::Enqueue {
            task_type,
            priority,
            tenant_id,
            params,
            task_id,
        } => {
            let params: Value = serde_json::from_str(&params).context("--params must be JSON")?;
            let task_id = task_id.unwrap_or_else(|| Uuid::new_v4().to_string());
            let message = TaskMessage::new(task_id.clone(), task_type, Priority::new(priority)?)
                .tenant(tenant_id, "")
                .source("admin")
                .params(params);
            store.enqueue(message).await?;
            match format {
                OutputFormat::Json => json!({ "task_id": task_id }).to_string(),
                OutputFormat::Table => format!("Task enqueued: {task_id}"),
            }
        }
    };

    Ok(output)
}

fn stats_table(stats: &QueueStats, processing: usize) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["Priority", "Depth"]);
    for priority in Priority::levels() {
        table.add_row(vec![priority.to_string(), stats.depth(priority).to_string()]);
    }
    table.add_row(vec!["total".to_string(), stats.total.to_string()]);
    table.add_row(vec!["processing".to_string(), processing.to_string()]);
    table
}

fn format_time(ts: Option<i64>) -> String {
    ts.and_then(|ts| Utc.timestamp_opt(ts, 0).single())
        .map(|t| t.to_rfc3339())
        .unwrap_or_default()
}

fn status_table(task_id: &str, record: &TaskStatusRecord) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["Field", "Value"]);
    table.add_row(vec!["ID", task_id]);
    table.add_row(vec!["Status", record.status.map(|s| s.as_str()).unwrap_or("unknown")]);
    table.add_row(vec!["Progress".to_string(), record.progress.to_string()]);
    if let Some(worker) = &record.worker_id {
        table.add_row(vec!["Worker", worker]);
    }
    table.add_row(vec!["Queued".to_string(), format_time(record.queued_at)]);
    table.add_row(vec!["Dequeued".to_string(), format_time(record.dequeued_at)]);
    table.add_row(vec!["Finished".to_string(), format_time(record.finished_at)]);
    if record.recovered_at.is_some() {
        table.add_row(vec!["Recovered".to_string(), format_time(record.recovered_at)]);
    }
    if let Some(error) = &record.error {
        table.add_row(vec!["Error", error]);
    }
    table
}

fn record_json(task_id: &str, record: &TaskStatusRecord) -> Value {
    json!({
        "task_id": task_id,
        "status": record.status.map(|s| s.as_str()),
        "progress": record.progress,
        "worker_id": record.worker_id,
        "result": record.result,
        "error": record.error,
        "queued_at": record.queued_at,
        "dequeued_at": record.dequeued_at,
        "started_at": record.started_at,
        "updated_at": record.updated_at,
        "finished_at": record.finished_at,
        "recovered_at": record.recovered_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use remedy_queue::MemoryBackend;

    fn store() -> TaskQueueStore {
        TaskQueueStore::new(Arc::new(MemoryBackend::new()), QueueConfig::default())
    }

    fn enqueue(task_id: &str, priority: u8) -> Commands {
        Commands::Enqueue {
            task_type: "ping".into(),
            priority,
            tenant_id: 1,
            params: r#"{"hosts": [1]}"#.into(),
            task_id: Some(task_id.into()),
        }
    }

    #[tokio::test]
    async fn test_enqueue_then_stats() {
        let store = store();
        run(&store, enqueue("t-1", 2), OutputFormat::Table).await.unwrap();
        run(&store, enqueue("t-2", 2), OutputFormat::Table).await.unwrap();

        let out = run(&store, Commands::Stats, OutputFormat::Json).await.unwrap();
        let stats: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(stats["queues"]["priority_2"], 2);
        assert_eq!(stats["queues"]["total"], 2);
        assert_eq!(stats["processing"], 0);

        let table = run(&store, Commands::Stats, OutputFormat::Table).await.unwrap();
        assert!(table.contains("processing"));
    }

    #[tokio::test]
    async fn test_status_and_remove() {
        let store = store();
        run(&store, enqueue("t-1", 5), OutputFormat::Table).await.unwrap();

        let out = run(&store, Commands::Status { task_id: "t-1".into() }, OutputFormat::Json)
            .await
            .unwrap();
        let record: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(record["status"], "queued");

        let out = run(&store, Commands::Remove { task_id: "t-1".into() }, OutputFormat::Json)
            .await
            .unwrap();
        assert!(out.contains("\"removed\":true"));
        assert!(run(&store, Commands::Status { task_id: "t-1".into() }, OutputFormat::Table)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_clear_rejects_bad_priority() {
        let store = store();
        run(&store, enqueue("t-1", 3), OutputFormat::Table).await.unwrap();

        assert!(run(&store, Commands::Clear { priority: 11 }, OutputFormat::Table).await.is_err());
        run(&store, Commands::Clear { priority: 3 }, OutputFormat::Table).await.unwrap();
        assert_eq!(store.get_queue_stats().await.unwrap().total, 0);
    }

    #[tokio::test]
    async fn test_sweep_recovers_with_zero_threshold() {
        let store = store();
        run(&store, enqueue("t-1", 1), OutputFormat::Table).await.unwrap();
        store.dequeue(Duration::from_millis(10)).await.unwrap().unwrap();

        // dequeued within this second; zero threshold still needs elapsed time
        tokio::time::sleep(Duration::from_millis(1100)).await;
        let out = run(&store, Commands::Sweep { stale_after: Some(0) }, OutputFormat::Json)
            .await
            .unwrap();
        let report: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(report["recovered"], 1);
        assert_eq!(store.get_queue_stats().await.unwrap().depth(Priority::HIGHEST), 1);
    }

    #[tokio::test]
    async fn test_enqueue_rejects_bad_params() {
        let store = store();
        let command = Commands::Enqueue {
            task_type: "ping".into(),
            priority: 5,
            tenant_id: 0,
            params: "not json".into(),
            task_id: None,
        };
        assert!(run(&store, command, OutputFormat::Table).await.is_err());
    }
}
