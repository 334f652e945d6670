//! Writes what ping and collect runs learned back onto host rows.

use crate::store::{CollectedFacts, HostDisk, HostNetworkCard, HostScalars, HostStatus, HostStore};
use chrono::Utc;
use remedy_core::TaskKind;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

const VIRTUAL_FILESYSTEMS: [&str; 4] = ["tmpfs", "devtmpfs", "proc", "sysfs"];
const LOOPBACK: &str = "lo";
const BYTES_PER_MB: u64 = 1024 * 1024;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub updated: usize,
    pub skipped: usize,
    pub failed: usize,
}

fn string(facts: &Map<String, Value>, key: &str) -> Option<String> {
    facts.get(key).and_then(Value::as_str).map(str::to_string)
}

fn integer(facts: &Map<String, Value>, key: &str) -> Option<i64> {
    let value = facts.get(key)?;
    value.as_i64().or_else(|| value.as_f64().map(|f| f as i64))
}

fn bytes_to_mb(value: Option<&Value>) -> Option<i64> {
    let value = value?;
    let bytes = value.as_u64().or_else(|| value.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))?;
    Some((bytes / BYTES_PER_MB) as i64)
}

fn scalars(facts: &Map<String, Value>) -> HostScalars {
    HostScalars {
        hostname: string(facts, "ansible_hostname"),
        os_type: string(facts, "ansible_system"),
        os_version: string(facts, "ansible_distribution_version"),
        kernel: string(facts, "ansible_kernel"),
        architecture: string(facts, "ansible_architecture"),
        // the list interleaves index, vendor and model; the model comes last
        cpu_model: facts
            .get("ansible_processor")
            .and_then(Value::as_array)
            .and_then(|entries| entries.last())
            .and_then(Value::as_str)
            .map(str::to_string),
        cpu_cores: integer(facts, "ansible_processor_vcpus").map(|n| n as i32),
        memory_total_mb: integer(facts, "ansible_memtotal_mb"),
    }
}

fn disks(facts: &Map<String, Value>) -> Vec<HostDisk> {
    let Some(mounts) = facts.get("ansible_mounts").and_then(Value::as_array) else {
        return Vec::new();
    };

    mounts
        .iter()
        .filter_map(Value::as_object)
        .filter_map(|mount| {
            let file_system = mount.get("fstype").and_then(Value::as_str).unwrap_or_default();
            if VIRTUAL_FILESYSTEMS.contains(&file_system) {
                return None;
            }

            let total = bytes_to_mb(mount.get("size_total"));
            let free = bytes_to_mb(mount.get("size_available"));
            // usage is only derived when both sizes were reported
            let (used_mb, usage_percent) = match (total, free) {
                (Some(total), Some(free)) if total > 0 => {
                    let used = total - free;
                    (used, used as f64 * 100.0 / total as f64)
                }
                _ => (0, 0.0),
            };
            let total_mb = total.unwrap_or(0);
            let free_mb = free.unwrap_or(0);

            Some(HostDisk {
                device: string(mount, "device").unwrap_or_default(),
                mount_point: string(mount, "mount").unwrap_or_default(),
                file_system: file_system.to_string(),
                total_mb,
                used_mb,
                free_mb,
                usage_percent,
            })
        })
        .collect()
}

fn network_cards(facts: &Map<String, Value>) -> Vec<HostNetworkCard> {
    let Some(names) = facts.get("ansible_interfaces").and_then(Value::as_array) else {
        return Vec::new();
    };

    names
        .iter()
        .filter_map(Value::as_str)
        .filter(|name| *name != LOOPBACK)
        .filter_map(|name| {
            let detail = facts.get(&format!("ansible_{}", name))?.as_object()?;

            let primary = detail
                .get("ipv4")
                .and_then(|ipv4| ipv4.get("address"))
                .and_then(Value::as_str);
            let mut addresses: Vec<&str> = primary.into_iter().collect();
            if let Some(secondaries) = detail.get("ipv4_secondaries").and_then(Value::as_array) {
                addresses.extend(
                    secondaries
                        .iter()
                        .filter_map(|entry| entry.get("address").and_then(Value::as_str)),
                );
            }

            let state = match detail.get("active").and_then(Value::as_bool) {
                Some(true) => "up",
                Some(false) => "down",
                None => "",
            };

            Some(HostNetworkCard {
                name: name.to_string(),
                mac_address: string(detail, "macaddress").unwrap_or_default(),
                ip_address: primary.unwrap_or_default().to_string(),
                ip_addresses: addresses.join(","),
                mtu: integer(detail, "mtu").unwrap_or(0) as i32,
                speed: integer(detail, "speed").unwrap_or(0) as i32,
                state: state.to_string(),
            })
        })
        .collect()
}

/// Map an `ansible_facts` object onto host columns, disks and network cards
pub fn parse_facts(facts: &Value) -> CollectedFacts {
    let Some(facts) = facts.as_object() else {
        return CollectedFacts::default();
    };
    CollectedFacts {
        scalars: scalars(facts),
        disks: disks(facts),
        network_cards: network_cards(facts),
    }
}

fn host_id(entry: &Value) -> Option<i64> {
    entry.get("host_id").and_then(Value::as_i64)
}

fn succeeded(entry: &Value) -> bool {
    entry.get("success").and_then(Value::as_bool).unwrap_or(false)
}

/// Applies finished ping and collect results to the host inventory.
/// Failures here are logged and never change the task outcome.
#[derive(Clone)]
pub struct HostFactIngestor {
    hosts: Arc<dyn HostStore>,
}

impl HostFactIngestor {
    pub fn new(hosts: Arc<dyn HostStore>) -> Self {
        HostFactIngestor { hosts }
    }

    pub async fn ingest(&self, kind: TaskKind, result: &Value) -> IngestReport {
        let Some(entries) = result.get("hosts").and_then(Value::as_object) else {
            warn!(task_type = kind.as_str(), "Result has no host map, nothing to ingest");
            return IngestReport::default();
        };

        let report = match kind {
            TaskKind::Ping => self.ingest_ping(entries).await,
            TaskKind::Collect => self.ingest_collect(entries).await,
            TaskKind::ShellCommand => return IngestReport::default(),
        };

        info!(
            task_type = kind.as_str(),
            updated = report.updated,
            skipped = report.skipped,
            failed = report.failed,
            "Host facts ingested"
        );
        report
    }

    async fn ingest_ping(&self, entries: &Map<String, Value>) -> IngestReport {
        let mut report = IngestReport::default();
        let now = Utc::now();

        for (address, entry) in entries {
            let Some(id) = host_id(entry) else {
                warn!(%address, "Ping result without host id");
                report.skipped += 1;
                continue;
            };
            let status = if succeeded(entry) { HostStatus::Online } else { HostStatus::Offline };

            match self.hosts.update_host_status(id, status, now).await {
                Ok(()) => {
                    debug!(host_id = id, status = status.as_str(), "Host status updated");
                    report.updated += 1;
                }
                Err(e) => {
                    error!(host_id = id, error = %e, "Failed to update host status");
                    report.failed += 1;
                }
            }
        }
        report
    }

    async fn ingest_collect(&self, entries: &Map<String, Value>) -> IngestReport {
        let mut report = IngestReport::default();
        let now = Utc::now();

        for (address, entry) in entries {
            let Some(id) = host_id(entry) else {
                warn!(%address, "Collect result without host id");
                report.skipped += 1;
                continue;
            };
            if !succeeded(entry) {
                debug!(host_id = id, "Collect failed on host, leaving it untouched");
                report.skipped += 1;
                continue;
            }
            let Some(facts) = entry.get("ansible_facts").filter(|f| f.is_object()) else {
                warn!(host_id = id, "Collect result has no facts");
                report.skipped += 1;
                continue;
            };

            let collected = parse_facts(facts);
            match self.hosts.apply_collected_facts(id, &collected, now).await {
                Ok(()) => {
                    debug!(
                        host_id = id,
                        disks = collected.disks.len(),
                        network_cards = collected.network_cards.len(),
                        "Host facts stored"
                    );
                    report.updated += 1;
                }
                Err(e) => {
                    error!(host_id = id, error = %e, "Failed to store host facts");
                    report.failed += 1;
                }
            }
        }
        report
    }
}
