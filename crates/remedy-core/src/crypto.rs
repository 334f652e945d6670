//! AES-256-GCM decryption of stored host credentials.
//!
//! Stored form is `base64(nonce (12 bytes) || ciphertext || tag (16 bytes))`. The key is
//! the configured secret, zero-padded or truncated to 32 bytes.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use base64::{engine::general_purpose::STANDARD, Engine};
use rand::RngCore;
use thiserror::Error;

const KEY_SIZE: usize = 32;
const NONCE_SIZE: usize = 12;

/// Environment variable holding the credential encryption key
pub const ENCRYPTION_KEY_ENV: &str = "CREDENTIAL_ENCRYPTION_KEY";

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid base64 ciphertext: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("ciphertext too short")]
    TooShort,

    #[error("decryption failed")]
    Decrypt,

    #[error("encryption failed")]
    Encrypt,

    #[error("decrypted value is not valid UTF-8")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// Symmetric cipher for credential fields
#[derive(Clone)]
pub struct CredentialCipher {
    cipher: Aes256Gcm,
}

impl CredentialCipher {
    pub fn new(key: &str) -> Self {
        let key = normalize_key(key.as_bytes());
        CredentialCipher {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key)),
        }
    }

    /// Decrypt a stored credential value. Empty input decrypts to an empty string.
    pub fn decrypt(&self, encoded: &str) -> Result<String, CryptoError> {
        if encoded.is_empty() {
            return Ok(String::new());
        }

        let data = STANDARD.decode(encoded)?;
        if data.len() < NONCE_SIZE {
            return Err(CryptoError::TooShort);
        }

        let (nonce, ciphertext) = data.split_at(NONCE_SIZE);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::Decrypt)?;

        Ok(String::from_utf8(plaintext)?)
    }

    /// Encrypt a value into the stored form with a random nonce
    pub fn encrypt(&self, plaintext: &str) -> Result<String, CryptoError> {
        if plaintext.is_empty() {
            return Ok(String::new());
        }

        let mut nonce = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce);

        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
            .map_err(|_| CryptoError::Encrypt)?;

        let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(out))
    }
}

impl std::fmt::Debug for CredentialCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CredentialCipher(..)")
    }
}

fn normalize_key(key: &[u8]) -> [u8; KEY_SIZE] {
    let mut out = [0u8; KEY_SIZE];
    let len = key.len().min(KEY_SIZE);
    out[..len].copy_from_slice(&key[..len]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_normalization() {
        let short = normalize_key(b"abc");
        assert_eq!(&short[..3], b"abc");
        assert!(short[3..].iter().all(|b| *b == 0));

        let long = normalize_key(&[7u8; 40]);
        assert_eq!(long, [7u8; 32]);
    }

    #[test]
    fn test_decrypts_what_it_encrypts() {
        let cipher = CredentialCipher::new("short-key");
        let stored = cipher.encrypt("p@ssw0rd").unwrap();
        assert_ne!(stored, "p@ssw0rd");
        assert_eq!(cipher.decrypt(&stored).unwrap(), "p@ssw0rd");
    }

    #[test]
    fn test_empty_values() {
        let cipher = CredentialCipher::new("k");
        assert_eq!(cipher.decrypt("").unwrap(), "");
        assert_eq!(cipher.encrypt("").unwrap(), "");
    }

    #[test]
    fn test_wrong_key_rejected() {
        let stored = CredentialCipher::new("key-one").encrypt("secret").unwrap();
        assert!(matches!(
            CredentialCipher::new("key-two").decrypt(&stored),
            Err(CryptoError::Decrypt)
        ));
    }

    #[test]
    fn test_malformed_input() {
        let cipher = CredentialCipher::new("k");
        assert!(matches!(cipher.decrypt("!!!"), Err(CryptoError::Base64(_))));
        assert!(matches!(cipher.decrypt("AAAA"), Err(CryptoError::TooShort)));
    }

    #[test]
    fn test_truncated_key_matches_first_32_bytes() {
        let long_key = "0123456789abcdef0123456789abcdefEXTRA";
        let stored = CredentialCipher::new(long_key).encrypt("v").unwrap();
        let same = CredentialCipher::new("0123456789abcdef0123456789abcdef");
        assert_eq!(same.decrypt(&stored).unwrap(), "v");
    }
}
