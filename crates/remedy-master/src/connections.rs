use crate::error::{MasterError, Result};
use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Active,
    Disconnected,
}

/// An authenticated worker session
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub worker_id: String,
    pub access_key: String,
    pub ip_address: String,
    pub connected_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub status: ConnectionStatus,
}

impl ConnectionInfo {
    /// Active with a heartbeat inside the timeout
    pub fn is_live(&self, timeout_secs: i64, now: DateTime<Utc>) -> bool {
        self.status == ConnectionStatus::Active && now - self.last_heartbeat <= Duration::seconds(timeout_secs)
    }
}

/// One session per worker id. A second instance may only take over an id once the
/// first has gone quiet for longer than the timeout.
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<String, ConnectionInfo>>,
    timeout_secs: i64,
}

impl ConnectionRegistry {
    pub fn new(timeout_secs: i64) -> Self {
        ConnectionRegistry {
            connections: RwLock::new(HashMap::new()),
            timeout_secs,
        }
    }

    pub fn register(&self, worker_id: &str, access_key: &str, ip_address: &str) -> Result<ConnectionInfo> {
        self.register_at(worker_id, access_key, ip_address, Utc::now())
    }

    pub fn register_at(
        &self,
        worker_id: &str,
        access_key: &str,
        ip_address: &str,
        now: DateTime<Utc>,
    ) -> Result<ConnectionInfo> {
        let mut connections = self.connections.write();

        if let Some(existing) = connections.get(worker_id) {
            if existing.is_live(self.timeout_secs, now) {
                return Err(MasterError::WorkerIdInUse {
                    worker_id: worker_id.to_string(),
                    ip_address: existing.ip_address.clone(),
                });
            }
        }

        let info = ConnectionInfo {
            worker_id: worker_id.to_string(),
            access_key: access_key.to_string(),
            ip_address: ip_address.to_string(),
            connected_at: now,
            last_heartbeat: now,
            status: ConnectionStatus::Active,
        };
        connections.insert(worker_id.to_string(), info.clone());
        Ok(info)
    }

    /// Returns false when the worker has no active connection
    pub fn heartbeat(&self, worker_id: &str) -> bool {
        self.heartbeat_at(worker_id, Utc::now())
    }

    pub fn heartbeat_at(&self, worker_id: &str, now: DateTime<Utc>) -> bool {
        match self.connections.write().get_mut(worker_id) {
            Some(conn) if conn.status == ConnectionStatus::Active => {
                conn.last_heartbeat = now;
                true
            }
            _ => false,
        }
    }

    pub fn disconnect(&self, worker_id: &str) -> bool {
        match self.connections.write().get_mut(worker_id) {
            Some(conn) => {
                conn.status = ConnectionStatus::Disconnected;
                true
            }
            None => false,
        }
    }

    pub fn get(&self, worker_id: &str) -> Option<ConnectionInfo> {
        self.connections.read().get(worker_id).cloned()
    }

    pub fn active_connections(&self) -> Vec<ConnectionInfo> {
        self.connections
            .read()
            .values()
            .filter(|c| c.status == ConnectionStatus::Active)
            .cloned()
            .collect()
    }

    pub fn count_active(&self) -> usize {
        self.active_connections().len()
    }

    /// Mark active connections whose heartbeat is older than the timeout as disconnected
    pub fn cleanup_stale(&self) -> Vec<ConnectionInfo> {
        self.cleanup_stale_at(Utc::now())
    }

    pub fn cleanup_stale_at(&self, now: DateTime<Utc>) -> Vec<ConnectionInfo> {
        let mut connections = self.connections.write();
        let mut removed = Vec::new();

        for conn in connections.values_mut() {
            if conn.status == ConnectionStatus::Active && !conn.is_live(self.timeout_secs, now) {
                conn.status = ConnectionStatus::Disconnected;
                removed.push(conn.clone());
            }
        }

        removed
    }
}
