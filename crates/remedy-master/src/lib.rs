pub mod api;
pub mod auth;
pub mod config;
pub mod connections;
pub mod error;
pub mod master;
pub mod metrics;

pub use auth::AuthService;
pub use config::MasterConfig;
pub use connections::{ConnectionInfo, ConnectionRegistry, ConnectionStatus};
pub use error::{MasterError, Result};
pub use master::Master;
