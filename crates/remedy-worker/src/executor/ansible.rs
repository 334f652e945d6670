use super::{CommandRunner, CommandSpec, ExecutionContext, HostResults, TaskOutput};
use crate::error::ExecutionError;
use crate::hosts::ResolvedHost;
use serde_json::{json, Map, Value};
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

/// Environment applied to every ansible invocation
pub const ANSIBLE_ENV: &[(&str, &str)] = &[
    ("ANSIBLE_HOST_KEY_CHECKING", "False"),
    ("ANSIBLE_SSH_RETRIES", "2"),
    ("ANSIBLE_TIMEOUT", "30"),
];

const SSH_COMMON_ARGS: &str = "-o StrictHostKeyChecking=no -o UserKnownHostsFile=/dev/null";
const MISSING_COMMAND: &str = "missing command parameter";

/// Single-host JSON inventory. Backing files are removed on drop.
pub struct Inventory {
    file: NamedTempFile,
    _private_key: Option<NamedTempFile>,
}

impl Inventory {
    pub fn path(&self) -> &Path {
        self.file.path()
    }
}

fn private_key_file(key: &str) -> Result<NamedTempFile, ExecutionError> {
    let mut file = tempfile::Builder::new()
        .prefix("ansible-ssh-key-")
        .suffix(".pem")
        .tempfile()?;
    file.write_all(key.as_bytes())?;
    if !key.ends_with('\n') {
        file.write_all(b"\n")?;
    }
    file.flush()?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(file.path(), std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(file)
}

/// Write the inventory for one host. An unsupported credential type is a business
/// error for that host only.
pub fn build_inventory(target: &ResolvedHost) -> Result<Inventory, ExecutionError> {
    let host = &target.host;
    let credential = &target.credential;

    let mut vars = Map::new();
    vars.insert("ansible_host".into(), json!(host.ip_address));
    vars.insert("ansible_port".into(), json!(host.port));
    vars.insert("ansible_ssh_common_args".into(), json!(SSH_COMMON_ARGS));
    vars.insert("ansible_connection".into(), json!("ssh"));
    vars.insert("ansible_user".into(), json!(credential.username));

    let private_key = match credential.kind.as_str() {
        "password" => {
            vars.insert("ansible_password".into(), json!(credential.password));
            None
        }
        "ssh_key" => {
            let key = private_key_file(&credential.private_key)?;
            vars.insert(
                "ansible_ssh_private_key_file".into(),
                json!(key.path().to_string_lossy()),
            );
            if !credential.passphrase.is_empty() {
                vars.insert("ansible_ssh_pass".into(), json!(credential.passphrase));
            }
            Some(key)
        }
        other => {
            return Err(ExecutionError::business(format!(
                "unsupported credential type: {}",
                other
            )))
        }
    };

    let mut hosts = Map::new();
    hosts.insert(host.ip_address.clone(), Value::Object(vars));
    let inventory = json!({ "all": { "hosts": hosts } });

    let mut file = tempfile::Builder::new()
        .prefix("ansible-inventory-")
        .suffix(".json")
        .tempfile()?;
    serde_json::to_writer_pretty(&mut file, &inventory)?;
    file.flush()?;

    Ok(Inventory {
        file,
        _private_key: private_key,
    })
}

fn ansible(inventory: &Path, module: &str) -> CommandSpec {
    let spec = CommandSpec::new("ansible")
        .arg("all")
        .arg("-i")
        .arg(inventory.to_string_lossy())
        .arg("-m")
        .arg(module);
    ANSIBLE_ENV.iter().fold(spec, |spec, (k, v)| spec.env(*k, *v))
}

/// Extract the JSON document following `host | STATUS => ` in ansible's ad-hoc output.
/// Trailing text after the document is ignored.
pub fn parse_module_output(stdout: &str) -> Option<Value> {
    let start = match stdout.find("=> {") {
        Some(index) => index + 3,
        None => {
            let trimmed = stdout.trim_start();
            if !trimmed.starts_with('{') {
                return None;
            }
            stdout.len() - trimmed.len()
        }
    };

    let mut documents = serde_json::Deserializer::from_str(&stdout[start..]).into_iter::<Value>();
    match documents.next() {
        Some(Ok(value)) => Some(value),
        _ => None,
    }
}

/// Output of the shell module: the text after the `host | STATUS | rc=N >>` banner
fn shell_output(stdout: &str) -> (Option<i32>, String) {
    let Some(banner_end) = stdout.find(">>") else {
        return (None, stdout.to_string());
    };
    let banner = &stdout[..banner_end];
    let rc = banner
        .split('|')
        .map(str::trim)
        .find_map(|part| part.strip_prefix("rc="))
        .and_then(|rc| rc.trim().parse().ok());

    let body = stdout[banner_end + 2..].trim_start_matches([' ', '\r']);
    let body = body.strip_prefix('\n').unwrap_or(body);
    (rc, body.to_string())
}

fn failure_message(parsed: Option<&Value>, exit_code: i32) -> String {
    parsed
        .and_then(|v| v.get("msg"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| format!("ansible exited with code {}", exit_code))
}

fn base_extra(stdout: &str, stderr: &str, exit_code: i32) -> Map<String, Value> {
    let mut extra = Map::new();
    extra.insert("output".into(), json!(stdout));
    extra.insert("stderr".into(), json!(stderr));
    extra.insert("exit_code".into(), json!(exit_code));
    extra
}

/// Build the inventory or record the host as failed; `None` means skip the host
fn prepare(target: &ResolvedHost, results: &mut HostResults) -> Result<Option<Inventory>, ExecutionError> {
    match build_inventory(target) {
        Ok(inventory) => Ok(Some(inventory)),
        Err(ExecutionError::Business(message)) => {
            warn!(ip = %target.host.ip_address, error = %message, "Cannot build inventory");
            results.record(&target.host, false, message, base_extra("", "", -1));
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

pub(super) async fn collect(runner: &dyn CommandRunner, ctx: &ExecutionContext) -> Result<TaskOutput, ExecutionError> {
    let mut results = HostResults::default();
    info!(task_id = %ctx.task_id, hosts = ctx.hosts.len(), "Collecting host facts");

    for (index, target) in ctx.hosts.iter().enumerate() {
        ctx.check_cancelled()?;
        ctx.report_progress(ctx.host_progress(index));

        let host = &target.host;
        let Some(inventory) = prepare(target, &mut results)? else {
            continue;
        };

        let output = runner.run(&ansible(inventory.path(), "setup")).await?;
        let parsed = parse_module_output(&output.stdout);

        match parsed {
            Some(document) if output.success() => {
                let facts = document
                    .get("ansible_facts")
                    .filter(|facts| facts.as_object().is_some_and(|f| !f.is_empty()))
                    .cloned()
                    .unwrap_or(document);
                let mut extra = base_extra("", &output.stderr, output.exit_code);
                extra.insert("ansible_facts".into(), facts);
                debug!(task_id = %ctx.task_id, ip = %host.ip_address, "Facts collected");
                results.record(host, true, "facts collected", extra);
            }
            parsed => {
                let message = failure_message(parsed.as_ref(), output.exit_code);
                warn!(task_id = %ctx.task_id, ip = %host.ip_address, error = %message, "Fact collection failed");
                let mut extra = base_extra(&output.stdout, &output.stderr, output.exit_code);
                if let Some(details) = parsed {
                    extra.insert("details".into(), details);
                }
                results.record(host, false, message, extra);
            }
        }
    }

    Ok(results.finish())
}

pub(super) async fn shell(runner: &dyn CommandRunner, ctx: &ExecutionContext) -> Result<TaskOutput, ExecutionError> {
    let command = ctx
        .params
        .get("command")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .ok_or_else(|| ExecutionError::business(MISSING_COMMAND))?;

    let mut results = HostResults::default();
    info!(task_id = %ctx.task_id, hosts = ctx.hosts.len(), command, "Running shell command");

    for (index, target) in ctx.hosts.iter().enumerate() {
        ctx.check_cancelled()?;
        ctx.report_progress(ctx.host_progress(index));

        let host = &target.host;
        let Some(inventory) = prepare(target, &mut results)? else {
            continue;
        };

        let spec = ansible(inventory.path(), "shell").arg("-a").arg(command);
        let output = runner.run(&spec).await?;

        if let Some(document) = parse_module_output(&output.stdout) {
            // unreachable or module failure reported as JSON
            let message = failure_message(Some(&document), output.exit_code);
            let mut extra = base_extra(&output.stdout, &output.stderr, output.exit_code);
            extra.insert("details".into(), document);
            results.record(host, false, message, extra);
            continue;
        }

        let (rc, body) = shell_output(&output.stdout);
        let exit_code = rc.unwrap_or(output.exit_code);
        let extra = base_extra(&body, &output.stderr, exit_code);
        if exit_code == 0 && output.success() {
            results.record(host, true, "command succeeded", extra);
        } else {
            warn!(task_id = %ctx.task_id, ip = %host.ip_address, exit_code, "Shell command failed");
            results.record(host, false, format!("command exited with code {}", exit_code), extra);
        }
    }

    Ok(results.finish())
}
