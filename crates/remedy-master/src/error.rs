use remedy_core::signature::SignatureError;
use remedy_queue::QueueError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MasterError {
    #[error("invalid access key")]
    InvalidAccessKey,

    #[error("missing authentication headers")]
    MissingCredentials,

    #[error("request expired")]
    Expired,

    #[error("signature verification failed")]
    InvalidSignature,

    #[error("worker id '{worker_id}' is already in use (ip: {ip_address})")]
    WorkerIdInUse { worker_id: String, ip_address: String },

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Failed to read configuration: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl MasterError {
    /// HTTP status, also used as the envelope code
    pub fn status_code(&self) -> u16 {
        match self {
            MasterError::InvalidAccessKey
            | MasterError::MissingCredentials
            | MasterError::Expired
            | MasterError::InvalidSignature => 401,
            MasterError::WorkerIdInUse { .. } => 409,
            MasterError::BadRequest(_) => 400,
            _ => 500,
        }
    }
}

impl From<SignatureError> for MasterError {
    fn from(e: SignatureError) -> Self {
        match e {
            SignatureError::StaleTimestamp { .. } => MasterError::Expired,
            SignatureError::Mismatch | SignatureError::InvalidKey => MasterError::InvalidSignature,
        }
    }
}

pub type Result<T> = std::result::Result<T, MasterError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(MasterError::InvalidSignature.status_code(), 401);
        assert_eq!(
            MasterError::WorkerIdInUse {
                worker_id: "w".into(),
                ip_address: "1.2.3.4".into()
            }
            .status_code(),
            409
        );
        assert_eq!(MasterError::BadRequest("x".into()).status_code(), 400);
        assert_eq!(MasterError::Config("x".into()).status_code(), 500);
    }

    #[test]
    fn test_signature_error_mapping() {
        let stale = SignatureError::StaleTimestamp { timestamp: 0, max_skew: 300 };
        assert!(matches!(MasterError::from(stale), MasterError::Expired));
        assert!(matches!(MasterError::from(SignatureError::Mismatch), MasterError::InvalidSignature));
    }
}
