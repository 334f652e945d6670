//! Signed HTTP client for the control plane.

use crate::config::WorkerConfig;
use crate::error::{Result, WorkerError};
use crate::hosts::CredentialDecryptor;
use crate::store::StoredCredential;
use async_trait::async_trait;
use remedy_core::signature::Signer;
use remedy_core::wire::{
    self, ApiResponse, AuthGrant, AuthRequest, DecryptedCredential, WorkerRequest, HEADER_ACCESS_KEY,
    HEADER_SIGNATURE, HEADER_TIMESTAMP,
};
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info, warn};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Bootstrap data the control plane hands to a fresh worker
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InitializationData {
    #[serde(default)]
    pub repositories: Vec<Value>,
    #[serde(default)]
    pub templates: Vec<Value>,
    #[serde(default)]
    pub timestamp: i64,
}

/// Liveness calls the runtime makes against the control plane
#[async_trait]
pub trait ControlPlane: Send + Sync {
    async fn heartbeat(&self) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;
}

pub struct AuthClient {
    http: Client,
    base_url: String,
    worker_id: String,
    signer: Signer,
}

impl AuthClient {
    pub fn new(
        base_url: impl Into<String>,
        worker_id: impl Into<String>,
        access_key: impl Into<String>,
        secret_key: impl Into<String>,
    ) -> Result<Self> {
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("remedy-worker/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(AuthClient {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            worker_id: worker_id.into(),
            signer: Signer::new(access_key, secret_key),
        })
    }

    pub fn from_config(config: &WorkerConfig) -> Result<Self> {
        Self::new(
            &config.master.url,
            &config.worker.id,
            &config.worker.access_key,
            &config.worker.secret_key,
        )
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Attach the signature headers for `subject`
    fn signed(&self, request: RequestBuilder, subject: &str) -> Result<RequestBuilder> {
        let signed = self.signer.sign(subject)?;
        Ok(request
            .header(HEADER_ACCESS_KEY, signed.access_key)
            .header(HEADER_TIMESTAMP, signed.timestamp.to_string())
            .header(HEADER_SIGNATURE, signed.signature))
    }

    /// Unwrap the `{code, message, data}` envelope. Non-2xx statuses and non-OK codes
    /// both become [`WorkerError::Master`].
    async fn read_envelope<T: DeserializeOwned>(response: Response) -> Result<Option<T>> {
        let status = response.status();
        let body = response.text().await?;

        let envelope: ApiResponse<T> = match serde_json::from_str(&body) {
            Ok(envelope) => envelope,
            Err(e) => {
                return Err(WorkerError::Master {
                    status: status.as_u16(),
                    code: status.as_u16() as i32,
                    message: if status.is_success() {
                        format!("malformed response: {}", e)
                    } else {
                        body
                    },
                })
            }
        };

        if !status.is_success() || !envelope.is_ok() {
            return Err(WorkerError::Master {
                status: status.as_u16(),
                code: envelope.code,
                message: envelope.message,
            });
        }
        Ok(envelope.data)
    }

    fn require<T>(data: Option<T>, what: &str) -> Result<T> {
        data.ok_or_else(|| WorkerError::Master {
            status: 200,
            code: wire::CODE_OK,
            message: format!("response has no {}", what),
        })
    }

    /// Handshake with the control plane; returns the database and queue connection details
    pub async fn authenticate(&self) -> Result<AuthGrant> {
        let signed = self.signer.sign(&self.worker_id)?;
        let request = AuthRequest {
            access_key: signed.access_key,
            worker_id: self.worker_id.clone(),
            timestamp: signed.timestamp,
            signature: signed.signature,
        };

        let response = self.http.post(self.url(wire::AUTH_PATH)).json(&request).send().await?;
        let grant = Self::require(Self::read_envelope::<AuthGrant>(response).await?, "grant")?;

        info!(
            worker_id = %self.worker_id,
            database = %grant.database_config.host,
            redis = %grant.redis_config.host,
            "Authenticated with master"
        );
        Ok(grant)
    }

    pub async fn send_heartbeat(&self) -> Result<()> {
        let request = self.http.put(self.url(wire::HEARTBEAT_PATH)).json(&WorkerRequest {
            worker_id: self.worker_id.clone(),
        });
        let response = self.signed(request, wire::HEARTBEAT_PATH)?.send().await?;
        Self::read_envelope::<Value>(response).await?;
        debug!(worker_id = %self.worker_id, "Master heartbeat sent");
        Ok(())
    }

    pub async fn send_disconnect(&self) -> Result<()> {
        let request = self.http.post(self.url(wire::DISCONNECT_PATH)).json(&WorkerRequest {
            worker_id: self.worker_id.clone(),
        });
        let response = self.signed(request, &self.worker_id)?.send().await?;
        Self::read_envelope::<Value>(response).await?;
        info!(worker_id = %self.worker_id, "Disconnected from master");
        Ok(())
    }

    /// Ask the control plane to decrypt a credential on our behalf
    pub async fn decrypt_credential(&self, credential_id: i64, tenant_id: i64) -> Result<DecryptedCredential> {
        let request = self
            .http
            .get(self.url(&wire::credential_decrypt_path(credential_id)))
            .query(&[("tenant_id", tenant_id)]);
        let response = self.signed(request, &credential_id.to_string())?.send().await?;
        Self::require(Self::read_envelope(response).await?, "credential")
    }

    pub async fn initialization_data(&self) -> Result<InitializationData> {
        let request = self.http.get(self.url(wire::INITIALIZATION_PATH));
        let response = self.signed(request, wire::INITIALIZATION_PATH)?.send().await?;
        let data: InitializationData = Self::read_envelope(response).await?.unwrap_or_default();
        info!(
            repositories = data.repositories.len(),
            templates = data.templates.len(),
            "Initialization data received"
        );
        Ok(data)
    }
}

#[async_trait]
impl ControlPlane for AuthClient {
    async fn heartbeat(&self) -> Result<()> {
        self.send_heartbeat().await
    }

    async fn disconnect(&self) -> Result<()> {
        self.send_disconnect().await
    }
}

#[async_trait]
impl CredentialDecryptor for AuthClient {
    async fn decrypt(&self, credential: &StoredCredential) -> Result<DecryptedCredential> {
        self.decrypt_credential(credential.id, credential.tenant_id)
            .await
            .inspect_err(|e| warn!(credential_id = credential.id, error = %e, "Remote decrypt failed"))
    }
}

impl std::fmt::Debug for AuthClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthClient")
            .field("base_url", &self.base_url)
            .field("worker_id", &self.worker_id)
            .finish_non_exhaustive()
    }
}
