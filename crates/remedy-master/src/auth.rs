//! Worker authentication: AK/SK lookup, replay window, HMAC check and worker-id
//! uniqueness.

use crate::config::{AccessKeyEntry, MasterConfig};
use crate::connections::{ConnectionInfo, ConnectionRegistry};
use crate::error::{MasterError, Result};
use chrono::Utc;
use remedy_core::signature::SignatureVerifier;
use remedy_core::wire::{AuthGrant, AuthRequest};
use std::collections::HashMap;
use tracing::{debug, info, warn};

pub struct AuthService {
    keys: HashMap<String, AccessKeyEntry>,
    verifier: SignatureVerifier,
    connections: ConnectionRegistry,
    grant: AuthGrant,
}

impl AuthService {
    pub fn new(config: &MasterConfig) -> Self {
        AuthService {
            keys: config
                .access_keys
                .iter()
                .map(|entry| (entry.access_key.clone(), entry.clone()))
                .collect(),
            verifier: SignatureVerifier::new(config.auth.timestamp_skew_secs),
            connections: ConnectionRegistry::new(config.auth.connection_timeout_secs),
            grant: config.grant.to_grant(),
        }
    }

    pub fn connections(&self) -> &ConnectionRegistry {
        &self.connections
    }

    fn active_key(&self, access_key: &str) -> Result<&AccessKeyEntry> {
        self.keys
            .get(access_key)
            .filter(|entry| entry.active)
            .ok_or(MasterError::InvalidAccessKey)
    }

    /// Check a signed request: key active, timestamp in window, signature over `subject`
    pub fn verify_signed(&self, access_key: &str, timestamp: i64, signature: &str, subject: &str) -> Result<()> {
        self.verify_signed_at(access_key, timestamp, signature, subject, Utc::now().timestamp())
    }

    pub fn verify_signed_at(
        &self,
        access_key: &str,
        timestamp: i64,
        signature: &str,
        subject: &str,
        now: i64,
    ) -> Result<()> {
        let entry = self.active_key(access_key)?;
        self.verifier
            .verify_at(&entry.secret_key, access_key, subject, timestamp, signature, now)?;
        Ok(())
    }

    /// Handshake. On success the worker holds its id until it disconnects or goes quiet.
    pub fn authenticate(&self, request: &AuthRequest, ip_address: &str) -> Result<AuthGrant> {
        self.authenticate_at(request, ip_address, Utc::now().timestamp())
    }

    pub fn authenticate_at(&self, request: &AuthRequest, ip_address: &str, now: i64) -> Result<AuthGrant> {
        if request.worker_id.is_empty() {
            return Err(MasterError::BadRequest("worker_id is required".into()));
        }

        if let Err(e) = self.verify_signed_at(
            &request.access_key,
            request.timestamp,
            &request.signature,
            &request.worker_id,
            now,
        ) {
            warn!(
                worker_id = %request.worker_id,
                access_key = %request.access_key,
                ip = ip_address,
                error = %e,
                "Worker authentication rejected"
            );
            return Err(e);
        }

        self.connections
            .register(&request.worker_id, &request.access_key, ip_address)?;

        info!(
            worker_id = %request.worker_id,
            access_key = %request.access_key,
            ip = ip_address,
            "Worker authenticated"
        );
        Ok(self.grant.clone())
    }

    pub fn heartbeat(&self, worker_id: &str) {
        if self.connections.heartbeat(worker_id) {
            debug!(worker_id, "Worker heartbeat");
        } else {
            warn!(worker_id, "Heartbeat from worker without an active connection");
        }
    }

    pub fn disconnect(&self, worker_id: &str) {
        if self.connections.disconnect(worker_id) {
            info!(worker_id, "Worker disconnected");
        }
    }

    pub fn cleanup_stale(&self) -> Vec<ConnectionInfo> {
        let removed = self.connections.cleanup_stale();
        if !removed.is_empty() {
            info!(count = removed.len(), "Cleaned up timed out worker connections");
        }
        removed
    }
}
