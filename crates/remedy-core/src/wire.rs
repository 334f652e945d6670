//! Worker handshake wire contract shared with the control plane.

use crate::DEFAULT_QUEUE_PREFIX;
use serde::{Deserialize, Serialize};

pub const API_PREFIX: &str = "/api/v1";
pub const AUTH_PATH: &str = "/api/v1/worker/auth";
pub const HEARTBEAT_PATH: &str = "/api/v1/worker/heartbeat";
pub const DISCONNECT_PATH: &str = "/api/v1/worker/disconnect";
pub const INITIALIZATION_PATH: &str = "/api/v1/worker/initialization";

pub const HEADER_ACCESS_KEY: &str = "X-Access-Key";
pub const HEADER_TIMESTAMP: &str = "X-Timestamp";
pub const HEADER_SIGNATURE: &str = "X-Signature";

/// Envelope code for success
pub const CODE_OK: i32 = 200;

pub fn credential_decrypt_path(credential_id: i64) -> String {
    format!("{}/worker/credentials/{}/decrypt", API_PREFIX, credential_id)
}

/// Standard `{code, message, data}` response envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub code: i32,
    #[serde(default)]
    pub message: String,
    pub data: Option<T>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        ApiResponse {
            code: CODE_OK,
            message: "success".to_string(),
            data: Some(data),
        }
    }

    pub fn error(code: i32, message: impl Into<String>) -> Self {
        ApiResponse {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == CODE_OK
    }
}

/// Body of `POST /worker/auth`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthRequest {
    pub access_key: String,
    pub worker_id: String,
    pub timestamp: i64,
    pub signature: String,
}

/// Body of heartbeat and disconnect calls
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub worker_id: String,
}

/// Backing-store connection parameters handed to an authenticated worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthGrant {
    pub database_config: DatabaseConfig,
    pub redis_config: RedisConfig,
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub host: String,
    #[serde(default = "default_pg_port")]
    pub port: u16,
    pub user: String,
    #[serde(default)]
    pub password: String,
    pub dbname: String,
    #[serde(default = "default_sslmode")]
    pub sslmode: String,
}

fn default_pg_port() -> u16 {
    5432
}

fn default_sslmode() -> String {
    "disable".to_string()
}

impl DatabaseConfig {
    pub fn connection_url(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}?sslmode={}",
            self.user, self.password, self.host, self.port, self.dbname, self.sslmode
        )
    }
}

impl std::fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("dbname", &self.dbname)
            .field("sslmode", &self.sslmode)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedisConfig {
    pub host: String,
    #[serde(default = "default_redis_port")]
    pub port: u16,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub db: i64,
    #[serde(default = "default_prefix")]
    pub prefix: String,
}

fn default_redis_port() -> u16 {
    6379
}

fn default_prefix() -> String {
    DEFAULT_QUEUE_PREFIX.to_string()
}

impl RedisConfig {
    pub fn connection_url(&self) -> String {
        if self.password.is_empty() {
            format!("redis://{}:{}/{}", self.host, self.port, self.db)
        } else {
            format!("redis://:{}@{}:{}/{}", self.password, self.host, self.port, self.db)
        }
    }
}

impl std::fmt::Debug for RedisConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("db", &self.db)
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

/// Decrypted credential returned by the control plane
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecryptedCredential {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub private_key: String,
    #[serde(default)]
    pub passphrase: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grant_defaults() {
        let raw = r#"{
            "code": 200,
            "message": "ok",
            "data": {
                "database_config": {"host": "db", "user": "u", "password": "p", "dbname": "ahop"},
                "redis_config": {"host": "cache"}
            }
        }"#;
        let response: ApiResponse<AuthGrant> = serde_json::from_str(raw).unwrap();
        assert!(response.is_ok());

        let grant = response.data.unwrap();
        assert_eq!(grant.database_config.port, 5432);
        assert_eq!(grant.database_config.sslmode, "disable");
        assert_eq!(grant.redis_config.port, 6379);
        assert_eq!(grant.redis_config.db, 0);
        assert_eq!(grant.redis_config.prefix, "ahop:queue");
    }

    #[test]
    fn test_error_envelope_without_data() {
        let response: ApiResponse<AuthGrant> =
            serde_json::from_str(r#"{"code": 401, "message": "invalid signature"}"#).unwrap();
        assert!(!response.is_ok());
        assert!(response.data.is_none());
    }

    #[test]
    fn test_connection_urls() {
        let redis = RedisConfig {
            host: "cache".into(),
            port: 6380,
            password: "pw".into(),
            db: 2,
            prefix: "p".into(),
        };
        assert_eq!(redis.connection_url(), "redis://:pw@cache:6380/2");

        let db = DatabaseConfig {
            host: "db".into(),
            port: 5432,
            user: "u".into(),
            password: "p".into(),
            dbname: "d".into(),
            sslmode: "disable".into(),
        };
        assert_eq!(db.connection_url(), "postgres://u:p@db:5432/d?sslmode=disable");
        assert!(!format!("{:?}", db).contains("\"p\""));
    }

    #[test]
    fn test_decrypt_path() {
        assert_eq!(credential_decrypt_path(9), "/api/v1/worker/credentials/9/decrypt");
    }
}
