//! HMAC-SHA256 request signing shared by workers and the control plane.
//!
//! A signature is `hex(HMAC-SHA256(secret_key, "{access_key}|{subject}|{timestamp}"))`.
//! The subject is the worker id for the initial handshake and a request-specific string
//! (endpoint path or target id) for every later call.

use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Default accepted clock skew between signer and verifier, in seconds
pub const DEFAULT_MAX_SKEW_SECS: i64 = 300;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SignatureError {
    #[error("timestamp {timestamp} outside allowed skew of {max_skew}s")]
    StaleTimestamp { timestamp: i64, max_skew: i64 },

    #[error("signature mismatch")]
    Mismatch,

    #[error("invalid signing key")]
    InvalidKey,
}

fn signing_payload(access_key: &str, subject: &str, timestamp: i64) -> String {
    format!("{}|{}|{}", access_key, subject, timestamp)
}

fn mac(secret_key: &str, access_key: &str, subject: &str, timestamp: i64) -> Result<HmacSha256, SignatureError> {
    let mut mac = HmacSha256::new_from_slice(secret_key.as_bytes())
        .map_err(|_| SignatureError::InvalidKey)?;
    mac.update(signing_payload(access_key, subject, timestamp).as_bytes());
    Ok(mac)
}

/// Compute the lowercase hex signature
pub fn sign(secret_key: &str, access_key: &str, subject: &str, timestamp: i64) -> Result<String, SignatureError> {
    let mac = mac(secret_key, access_key, subject, timestamp)?;
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Constant-time signature comparison, without any timestamp check
pub fn verify(
    secret_key: &str,
    access_key: &str,
    subject: &str,
    timestamp: i64,
    signature: &str,
) -> Result<(), SignatureError> {
    let expected = hex::decode(signature).map_err(|_| SignatureError::Mismatch)?;
    mac(secret_key, access_key, subject, timestamp)?
        .verify_slice(&expected)
        .map_err(|_| SignatureError::Mismatch)
}

/// Verifier enforcing the replay window before checking the HMAC
#[derive(Debug, Clone, Copy)]
pub struct SignatureVerifier {
    max_skew_secs: i64,
}

impl SignatureVerifier {
    pub fn new(max_skew_secs: i64) -> Self {
        SignatureVerifier { max_skew_secs }
    }

    pub fn max_skew_secs(&self) -> i64 {
        self.max_skew_secs
    }

    pub fn check_timestamp(&self, timestamp: i64, now: i64) -> Result<(), SignatureError> {
        if now.abs_diff(timestamp) > self.max_skew_secs.max(0) as u64 {
            return Err(SignatureError::StaleTimestamp {
                timestamp,
                max_skew: self.max_skew_secs,
            });
        }
        Ok(())
    }

    pub fn verify(
        &self,
        secret_key: &str,
        access_key: &str,
        subject: &str,
        timestamp: i64,
        signature: &str,
    ) -> Result<(), SignatureError> {
        self.verify_at(secret_key, access_key, subject, timestamp, signature, Utc::now().timestamp())
    }

    pub fn verify_at(
        &self,
        secret_key: &str,
        access_key: &str,
        subject: &str,
        timestamp: i64,
        signature: &str,
        now: i64,
    ) -> Result<(), SignatureError> {
        self.check_timestamp(timestamp, now)?;
        verify(secret_key, access_key, subject, timestamp, signature)
    }
}

impl Default for SignatureVerifier {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SKEW_SECS)
    }
}

/// Headers-style credentials for one signed request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedRequest {
    pub access_key: String,
    pub timestamp: i64,
    pub signature: String,
}

/// Worker-side signer holding the AK/SK pair
#[derive(Clone)]
pub struct Signer {
    access_key: String,
    secret_key: String,
}

impl Signer {
    pub fn new(access_key: impl Into<String>, secret_key: impl Into<String>) -> Self {
        Signer {
            access_key: access_key.into(),
            secret_key: secret_key.into(),
        }
    }

    pub fn access_key(&self) -> &str {
        &self.access_key
    }

    /// Sign `subject` with a fresh timestamp
    pub fn sign(&self, subject: &str) -> Result<SignedRequest, SignatureError> {
        self.sign_at(subject, Utc::now().timestamp())
    }

    pub fn sign_at(&self, subject: &str, timestamp: i64) -> Result<SignedRequest, SignatureError> {
        Ok(SignedRequest {
            access_key: self.access_key.clone(),
            timestamp,
            signature: sign(&self.secret_key, &self.access_key, subject, timestamp)?,
        })
    }
}

impl std::fmt::Debug for Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signer")
            .field("access_key", &self.access_key)
            .field("secret_key", &"***")
            .finish()
    }
}
