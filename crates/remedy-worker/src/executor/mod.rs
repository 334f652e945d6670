//! Task execution, one variant per task type.

mod ansible;
mod ping;
mod runner;

pub use ansible::{build_inventory, parse_module_output, Inventory, ANSIBLE_ENV};
pub use runner::{CommandOutput, CommandRunner, CommandSpec, SystemRunner};

use crate::error::ExecutionError;
use crate::hosts::ResolvedHost;
use crate::store::HostRecord;
use remedy_core::TaskKind;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

pub const ALL_HOSTS_FAILED: &str = "all hosts failed";

/// Everything an executor needs for one task run
pub struct ExecutionContext {
    pub task_id: String,
    pub kind: TaskKind,
    pub params: Value,
    pub hosts: Vec<ResolvedHost>,
    pub cancel: CancellationToken,
    progress: Option<watch::Sender<i32>>,
}

impl ExecutionContext {
    pub fn new(task_id: impl Into<String>, kind: TaskKind, params: Value, hosts: Vec<ResolvedHost>) -> Self {
        ExecutionContext {
            task_id: task_id.into(),
            kind,
            params,
            hosts,
            cancel: CancellationToken::new(),
            progress: None,
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_progress(mut self, progress: watch::Sender<i32>) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Cooperative cancellation point, checked between hosts
    pub fn check_cancelled(&self) -> Result<(), ExecutionError> {
        if self.cancel.is_cancelled() {
            return Err(ExecutionError::Cancelled);
        }
        Ok(())
    }

    pub fn report_progress(&self, progress: i32) {
        if let Some(tx) = &self.progress {
            tx.send_replace(progress.clamp(0, 100));
        }
    }

    /// Progress for the host at `index`, spread over 10..90
    fn host_progress(&self, index: usize) -> i32 {
        let total = self.hosts.len().max(1);
        10 + (index * 80 / total) as i32
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    pub total: usize,
    pub success: usize,
    pub failed: usize,
}

/// Result of an execution that ran to completion, possibly with failed hosts
#[derive(Debug, Clone, PartialEq)]
pub struct TaskOutput {
    /// `{hosts: {"ip:port": {...}}, summary: {...}}`
    pub result: Value,
    pub summary: Summary,
}

impl TaskOutput {
    pub fn all_failed(&self) -> bool {
        self.summary.total > 0 && self.summary.success == 0
    }
}

/// Accumulates per-host entries keyed by `ip:port`
#[derive(Default)]
pub(crate) struct HostResults {
    hosts: Map<String, Value>,
    summary: Summary,
}

impl HostResults {
    pub(crate) fn record(&mut self, host: &HostRecord, success: bool, message: impl Into<String>, extra: Map<String, Value>) {
        let mut entry = Map::new();
        entry.insert("host_id".into(), json!(host.id));
        entry.insert("hostname".into(), json!(host.hostname));
        entry.insert("ip".into(), json!(host.ip_address));
        entry.insert("port".into(), json!(host.port));
        entry.insert("success".into(), json!(success));
        entry.insert("message".into(), json!(message.into()));
        entry.extend(extra);

        self.summary.total += 1;
        if success {
            self.summary.success += 1;
        } else {
            self.summary.failed += 1;
        }
        self.hosts.insert(host.address(), Value::Object(entry));
    }

    pub(crate) fn finish(self) -> TaskOutput {
        TaskOutput {
            result: json!({
                "hosts": self.hosts,
                "summary": self.summary,
            }),
            summary: self.summary,
        }
    }
}

/// Dispatches a task to the executor for its kind
#[derive(Clone)]
pub struct Executors {
    runner: Arc<dyn CommandRunner>,
}

impl Executors {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Executors { runner }
    }

    pub fn supported_types() -> Vec<String> {
        TaskKind::all().iter().map(|k| k.as_str().to_string()).collect()
    }

    pub async fn execute(&self, ctx: &ExecutionContext) -> Result<TaskOutput, ExecutionError> {
        ctx.check_cancelled()?;
        ctx.report_progress(10);

        let output = match ctx.kind {
            TaskKind::Ping => ping::run(self.runner.as_ref(), ctx).await?,
            TaskKind::Collect => ansible::collect(self.runner.as_ref(), ctx).await?,
            TaskKind::ShellCommand => ansible::shell(self.runner.as_ref(), ctx).await?,
        };

        ctx.report_progress(100);
        Ok(output)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use remedy_core::wire::DecryptedCredential;
    use std::collections::VecDeque;
    use std::io;

    /// Replays canned outputs and records every command it was asked to run
    #[derive(Default)]
    pub struct ScriptedRunner {
        outputs: Mutex<VecDeque<io::Result<CommandOutput>>>,
        pub seen: Mutex<Vec<CommandSpec>>,
    }

    impl ScriptedRunner {
        pub fn push(&self, exit_code: i32, stdout: &str, stderr: &str) {
            self.outputs.lock().push_back(Ok(CommandOutput {
                exit_code,
                stdout: stdout.to_string(),
                stderr: stderr.to_string(),
            }));
        }

        pub fn push_error(&self, kind: io::ErrorKind) {
            self.outputs.lock().push_back(Err(io::Error::new(kind, "spawn failed")));
        }
    }

    #[async_trait]
    impl CommandRunner for ScriptedRunner {
        async fn run(&self, command: &CommandSpec) -> io::Result<CommandOutput> {
            self.seen.lock().push(command.clone());
            self.outputs.lock().pop_front().unwrap_or_else(|| Ok(CommandOutput::default()))
        }
    }

    pub fn resolved(id: i64, kind: &str) -> ResolvedHost {
        ResolvedHost {
            host: HostRecord {
                id,
                tenant_id: 1,
                name: format!("host-{}", id),
                ip_address: format!("10.1.0.{}", id),
                port: 22,
                credential_id: Some(id),
                hostname: format!("node{}", id),
            },
            credential: DecryptedCredential {
                kind: kind.to_string(),
                username: "ops".into(),
                password: "pw".into(),
                private_key: "-----BEGIN KEY-----".into(),
                passphrase: String::new(),
            },
        }
    }
}
