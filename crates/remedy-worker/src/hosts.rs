use crate::error::ExecutionError;
use crate::store::{HostRecord, HostStore, StoredCredential};
use async_trait::async_trait;
use remedy_core::crypto::CredentialCipher;
use remedy_core::wire::DecryptedCredential;
use remedy_core::ErrorKind;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error, warn};

pub const NO_HOSTS_SPECIFIED: &str = "no hosts specified";
pub const NO_EXECUTABLE_HOSTS: &str = "no executable hosts";

/// A target host ready to be contacted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedHost {
    pub host: HostRecord,
    pub credential: DecryptedCredential,
}

/// Turns stored ciphertext into usable credentials
#[async_trait]
pub trait CredentialDecryptor: Send + Sync {
    async fn decrypt(&self, credential: &StoredCredential) -> crate::Result<DecryptedCredential>;
}

/// Decrypts with a locally configured key
pub struct LocalDecryptor {
    cipher: CredentialCipher,
}

impl LocalDecryptor {
    pub fn new(cipher: CredentialCipher) -> Self {
        LocalDecryptor { cipher }
    }
}

#[async_trait]
impl CredentialDecryptor for LocalDecryptor {
    async fn decrypt(&self, credential: &StoredCredential) -> crate::Result<DecryptedCredential> {
        Ok(DecryptedCredential {
            kind: credential.kind.clone(),
            username: credential.username.clone(),
            password: self.cipher.decrypt(&credential.password)?,
            private_key: self.cipher.decrypt(&credential.private_key)?,
            passphrase: self.cipher.decrypt(&credential.passphrase)?,
        })
    }
}

/// Read `params.hosts`: an array of host ids given as numbers or numeric strings
pub fn extract_host_ids(params: &Value) -> Result<Vec<i64>, ExecutionError> {
    let hosts = match params.get("hosts") {
        None | Some(Value::Null) => return Err(ExecutionError::business(NO_HOSTS_SPECIFIED)),
        Some(Value::Array(hosts)) => hosts,
        Some(other) => {
            return Err(ExecutionError::business(format!(
                "hosts must be an array of host ids, got {}",
                other
            )))
        }
    };

    let mut ids = Vec::with_capacity(hosts.len());
    for value in hosts {
        let id = match value {
            Value::Number(n) => n
                .as_i64()
                .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
            Value::String(s) => s.trim().parse::<i64>().ok(),
            _ => None,
        };
        match id {
            Some(id) if id > 0 => {
                if !ids.contains(&id) {
                    ids.push(id);
                }
            }
            _ => return Err(ExecutionError::business(format!("invalid host id: {}", value))),
        }
    }

    if ids.is_empty() {
        return Err(ExecutionError::business(NO_HOSTS_SPECIFIED));
    }
    Ok(ids)
}

/// Loads a task's target hosts and their decrypted credentials
#[derive(Clone)]
pub struct HostResolver {
    hosts: Arc<dyn HostStore>,
    decryptor: Arc<dyn CredentialDecryptor>,
}

impl HostResolver {
    pub fn new(hosts: Arc<dyn HostStore>, decryptor: Arc<dyn CredentialDecryptor>) -> Self {
        HostResolver { hosts, decryptor }
    }

    /// Hosts without a credential, or whose credential cannot be decrypted, are skipped.
    /// When nothing is left the task cannot succeed, unless the skips were caused by an
    /// infrastructure failure.
    pub async fn resolve(&self, tenant_id: i64, params: &Value) -> Result<Vec<ResolvedHost>, ExecutionError> {
        let ids = extract_host_ids(params)?;
        let found = self.hosts.find_hosts_with_credentials(tenant_id, &ids).await?;

        if found.len() != ids.len() {
            warn!(
                tenant_id,
                requested = ids.len(),
                found = found.len(),
                "Some hosts were not found"
            );
        }

        let mut resolved = Vec::with_capacity(found.len());
        let mut transient_failure = None;

        for entry in found {
            let host = entry.host;
            let Some(stored) = entry.credential else {
                warn!(host_id = host.id, host = %host.name, ip = %host.ip_address, "Host has no credential, skipping");
                continue;
            };

            match self.decryptor.decrypt(&stored).await {
                Ok(credential) => {
                    debug!(host_id = host.id, ip = %host.ip_address, credential_type = %credential.kind, "Host prepared");
                    resolved.push(ResolvedHost { host, credential });
                }
                Err(e) => {
                    error!(host_id = host.id, credential_id = stored.id, error = %e, "Failed to decrypt credential");
                    if e.kind() == ErrorKind::System {
                        transient_failure = Some(e.to_string());
                    }
                }
            }
        }

        if resolved.is_empty() {
            return Err(match transient_failure {
                Some(reason) => ExecutionError::system(format!("credential lookup failed: {}", reason)),
                None => ExecutionError::business(NO_EXECUTABLE_HOSTS),
            });
        }

        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::WorkerError;
    use serde_json::json;

    const KEY: &str = "unit-test-key";

    fn host(id: i64, credential_id: Option<i64>) -> HostRecord {
        HostRecord {
            id,
            tenant_id: 1,
            name: format!("web-{}", id),
            ip_address: format!("192.168.1.{}", id),
            port: 22,
            credential_id,
            hostname: String::new(),
        }
    }

    fn credential(id: i64, password: &str) -> StoredCredential {
        let cipher = CredentialCipher::new(KEY);
        StoredCredential {
            id,
            tenant_id: 1,
            kind: "password".into(),
            username: "root".into(),
            password: cipher.encrypt(password).unwrap(),
            private_key: String::new(),
            passphrase: String::new(),
        }
    }

    fn resolver(store: Arc<MemoryStore>) -> HostResolver {
        HostResolver::new(store, Arc::new(LocalDecryptor::new(CredentialCipher::new(KEY))))
    }

    struct Unreachable;

    #[async_trait]
    impl CredentialDecryptor for Unreachable {
        async fn decrypt(&self, _credential: &StoredCredential) -> crate::Result<DecryptedCredential> {
            Err(WorkerError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "connection refused",
            )))
        }
    }

    #[test]
    fn test_extract_host_ids() {
        assert_eq!(extract_host_ids(&json!({"hosts": [3, "4", 3.0]})).unwrap(), vec![3, 4]);
        assert_eq!(
            extract_host_ids(&json!({})),
            Err(ExecutionError::business(NO_HOSTS_SPECIFIED))
        );
        assert_eq!(
            extract_host_ids(&json!({"hosts": []})),
            Err(ExecutionError::business(NO_HOSTS_SPECIFIED))
        );
        assert!(extract_host_ids(&json!({"hosts": "1,2"})).is_err());
        assert!(extract_host_ids(&json!({"hosts": [{"id": 1}]})).is_err());
    }

    #[tokio::test]
    async fn test_resolve_decrypts_and_skips() {
        let store = Arc::new(MemoryStore::new());
        store.insert_host(host(1, Some(10)));
        store.insert_host(host(2, None));
        store.insert_credential(credential(10, "hunter2"));

        let resolved = resolver(store).resolve(1, &json!({"hosts": [1, 2, 9]})).await.unwrap();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].host.id, 1);
        assert_eq!(resolved[0].credential.password, "hunter2");
        assert_eq!(resolved[0].credential.private_key, "");
    }

    #[tokio::test]
    async fn test_no_executable_hosts_is_business() {
        let store = Arc::new(MemoryStore::new());
        store.insert_host(host(2, None));

        let err = resolver(store).resolve(1, &json!({"hosts": [2]})).await.unwrap_err();
        assert_eq!(err, ExecutionError::business(NO_EXECUTABLE_HOSTS));
    }

    #[tokio::test]
    async fn test_unreachable_decryptor_is_system() {
        let store = Arc::new(MemoryStore::new());
        store.insert_host(host(1, Some(10)));
        store.insert_credential(credential(10, "pw"));

        let resolver = HostResolver::new(store, Arc::new(Unreachable));
        let err = resolver.resolve(1, &json!({"hosts": [1]})).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::System);
    }
}
