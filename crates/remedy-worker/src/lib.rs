pub mod auth_client;
pub mod config;
pub mod error;
pub mod executor;
pub mod hosts;
pub mod ingest;
pub mod logging;
pub mod store;
pub mod worker;

pub use auth_client::{AuthClient, ControlPlane, InitializationData};
pub use config::WorkerConfig;
pub use error::{ExecutionError, Result, StoreError, WorkerError};
pub use executor::{CommandRunner, Executors, SystemRunner};
pub use hosts::{CredentialDecryptor, HostResolver, LocalDecryptor};
pub use ingest::HostFactIngestor;
pub use worker::{TaskOutcome, Worker, WorkerDeps};
