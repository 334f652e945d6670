use remedy_core::TaskStatus;
use serde_json::Value;
use std::collections::HashMap;

/// Field names of the per-task status record
pub mod fields {
    pub const STATUS: &str = "status";
    pub const PROGRESS: &str = "progress";
    pub const WORKER_ID: &str = "worker_id";
    pub const RESULT: &str = "result";
    pub const ERROR: &str = "error";
    pub const QUEUED_AT: &str = "queued_at";
    pub const DEQUEUED_AT: &str = "dequeued_at";
    pub const STARTED_AT: &str = "started_at";
    pub const UPDATED_AT: &str = "updated_at";
    pub const FINISHED_AT: &str = "finished_at";
    pub const RECOVERED_AT: &str = "recovered_at";
}

/// Parsed view of a task's ephemeral status record
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskStatusRecord {
    /// `None` when the field is missing or holds an unknown value
    pub status: Option<TaskStatus>,
    pub progress: i32,
    pub worker_id: Option<String>,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub queued_at: Option<i64>,
    pub dequeued_at: Option<i64>,
    pub started_at: Option<i64>,
    pub updated_at: Option<i64>,
    pub finished_at: Option<i64>,
    pub recovered_at: Option<i64>,
}

impl TaskStatusRecord {
    /// Returns `None` for an absent (empty) record
    pub fn from_fields(record: &HashMap<String, String>) -> Option<Self> {
        if record.is_empty() {
            return None;
        }

        let text = |name: &str| record.get(name).filter(|v| !v.is_empty()).cloned();
        let number = |name: &str| record.get(name).and_then(|v| v.parse::<i64>().ok());

        Some(TaskStatusRecord {
            status: record.get(fields::STATUS).and_then(|s| TaskStatus::from_str(s)),
            progress: record
                .get(fields::PROGRESS)
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            worker_id: text(fields::WORKER_ID),
            result: record
                .get(fields::RESULT)
                .and_then(|raw| serde_json::from_str(raw).ok()),
            error: text(fields::ERROR),
            queued_at: number(fields::QUEUED_AT),
            dequeued_at: number(fields::DEQUEUED_AT),
            started_at: number(fields::STARTED_AT),
            updated_at: number(fields::UPDATED_AT),
            finished_at: number(fields::FINISHED_AT),
            recovered_at: number(fields::RECOVERED_AT),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_empty_record_is_absent() {
        assert!(TaskStatusRecord::from_fields(&HashMap::new()).is_none());
    }

    #[test]
    fn test_parses_fields() {
        let parsed = TaskStatusRecord::from_fields(&record(&[
            ("status", "success"),
            ("progress", "100"),
            ("worker_id", "w-1"),
            ("result", r#"{"hosts":{}}"#),
            ("dequeued_at", "1700000000"),
        ]))
        .unwrap();

        assert_eq!(parsed.status, Some(TaskStatus::Success));
        assert_eq!(parsed.progress, 100);
        assert_eq!(parsed.worker_id.as_deref(), Some("w-1"));
        assert!(parsed.result.unwrap()["hosts"].is_object());
        assert_eq!(parsed.dequeued_at, Some(1_700_000_000));
        assert_eq!(parsed.error, None);
    }

    #[test]
    fn test_unknown_status_reads_as_missing() {
        let parsed = TaskStatusRecord::from_fields(&record(&[("status", "exploded")])).unwrap();
        assert_eq!(parsed.status, None);
    }
}
