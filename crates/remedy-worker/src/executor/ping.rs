use super::{CommandRunner, CommandSpec, ExecutionContext, HostResults, TaskOutput};
use crate::error::ExecutionError;
use serde_json::{json, Map};
use tracing::{debug, info, warn};

pub(super) fn command(ip: &str) -> CommandSpec {
    CommandSpec::new("ping").args(["-c", "3", "-W", "3", ip])
}

/// The `rtt min/avg/max` summary line, if present
fn stats_line(stdout: &str) -> Option<&str> {
    stdout.lines().map(str::trim).find(|line| line.contains("min/avg/max"))
}

pub(super) async fn run(runner: &dyn CommandRunner, ctx: &ExecutionContext) -> Result<TaskOutput, ExecutionError> {
    let mut results = HostResults::default();
    info!(task_id = %ctx.task_id, hosts = ctx.hosts.len(), "Pinging hosts");

    for (index, target) in ctx.hosts.iter().enumerate() {
        ctx.check_cancelled()?;
        ctx.report_progress(ctx.host_progress(index));

        let host = &target.host;
        let output = runner.run(&command(&host.ip_address)).await?;

        let mut extra = Map::new();
        extra.insert("output".into(), json!(output.stdout));
        extra.insert("stderr".into(), json!(output.stderr));
        extra.insert("exit_code".into(), json!(output.exit_code));

        if output.success() {
            if let Some(stats) = stats_line(&output.stdout) {
                extra.insert("stats".into(), json!(stats));
            }
            debug!(task_id = %ctx.task_id, ip = %host.ip_address, "Ping succeeded");
            results.record(host, true, "ping succeeded", extra);
        } else {
            warn!(task_id = %ctx.task_id, ip = %host.ip_address, exit_code = output.exit_code, "Ping failed");
            results.record(host, false, format!("ping failed with exit code {}", output.exit_code), extra);
        }
    }

    let output = results.finish();
    info!(
        task_id = %ctx.task_id,
        success = output.summary.success,
        failed = output.summary.failed,
        "Ping finished"
    );
    Ok(output)
}
