use crate::error::{MasterError, Result};
use remedy_core::signature::DEFAULT_MAX_SKEW_SECS;
use remedy_core::wire::{AuthGrant, DatabaseConfig, RedisConfig};
use remedy_core::DEFAULT_QUEUE_PREFIX;
use remedy_queue::QueueConfig;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MasterConfig {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub access_keys: Vec<AccessKeyEntry>,
    pub grant: GrantConfig,
    pub recovery: RecoveryConfig,
    pub queue: QueueConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Accepted clock skew on signed requests
    pub timestamp_skew_secs: i64,
    /// A connection without a heartbeat for this long no longer holds its worker id
    pub connection_timeout_secs: i64,
    pub cleanup_interval_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        AuthConfig {
            timestamp_skew_secs: DEFAULT_MAX_SKEW_SECS,
            connection_timeout_secs: 60,
            cleanup_interval_secs: 30,
        }
    }
}

/// One issued AK/SK pair
#[derive(Clone, Serialize, Deserialize)]
pub struct AccessKeyEntry {
    pub access_key: String,
    pub secret_key: String,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub description: String,
}

fn default_active() -> bool {
    true
}

impl fmt::Debug for AccessKeyEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessKeyEntry")
            .field("access_key", &self.access_key)
            .field("active", &self.active)
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

/// Connection details handed to authenticated workers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrantConfig {
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
}

impl Default for GrantConfig {
    fn default() -> Self {
        GrantConfig {
            database: DatabaseConfig {
                host: "localhost".to_string(),
                port: 5432,
                user: "postgres".to_string(),
                password: String::new(),
                dbname: "ahop".to_string(),
                sslmode: "disable".to_string(),
            },
            redis: RedisConfig {
                host: "localhost".to_string(),
                port: 6379,
                password: String::new(),
                db: 0,
                prefix: DEFAULT_QUEUE_PREFIX.to_string(),
            },
        }
    }
}

impl GrantConfig {
    pub fn to_grant(&self) -> AuthGrant {
        AuthGrant {
            database_config: self.database.clone(),
            redis_config: self.redis.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub interval_secs: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        RecoveryConfig { interval_secs: 120 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

impl Default for MasterConfig {
    fn default() -> Self {
        MasterConfig {
            server: ServerConfig::default(),
            auth: AuthConfig::default(),
            access_keys: Vec::new(),
            grant: GrantConfig::default(),
            recovery: RecoveryConfig::default(),
            queue: QueueConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl MasterConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: MasterConfig = serde_yaml::from_str(&contents)?;
        // workers and the master must agree on key names
        config.queue.prefix = config.grant.redis.prefix.clone();
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.access_keys.is_empty() {
            return Err(MasterError::Config("at least one access key is required".into()));
        }
        if let Some(entry) = self
            .access_keys
            .iter()
            .find(|k| k.access_key.is_empty() || k.secret_key.is_empty())
        {
            return Err(MasterError::Config(format!(
                "access key entry '{}' needs both access_key and secret_key",
                entry.access_key
            )));
        }
        if self.auth.timestamp_skew_secs <= 0 {
            return Err(MasterError::Config("auth.timestamp_skew_secs must be positive".into()));
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    pub fn recovery_interval(&self) -> Duration {
        Duration::from_secs(self.recovery.interval_secs.max(1))
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.auth.cleanup_interval_secs.max(1))
    }
}
