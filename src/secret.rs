//! Secret-at-rest codec for persisted tool config (spec.md §6, §3
//! "every sensitive config value is encrypted in persisted form").
//!
//! `aes-gcm` is attested in the pack by `vanyastaff-nebula`'s credential
//! crates; no complete AEAD wrapper was found there to adapt verbatim, so
//! the encrypt/decrypt logic below is original, grounded only on that
//! crate choice (see DESIGN.md).

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;

const PREFIX: &str = "enc:v1:";

#[derive(Debug, Error)]
pub enum SecretError {
    #[error("invalid secret key material: {0}")]
    InvalidKey(String),
    #[error("malformed ciphertext envelope")]
    Malformed,
    #[error("decryption failed")]
    DecryptionFailed,
    #[error("encryption failed")]
    EncryptionFailed,
}

/// A resolved 256-bit key for the secret-at-rest codec.
#[derive(Clone)]
pub struct SecretKey([u8; 32]);

impl SecretKey {
    /// Decodes `PETALFLOW_SECRET_KEY` (base64), hashing it through SHA-256
    /// to normalize to exactly 32 bytes regardless of input length.
    pub fn from_base64(material: &str) -> Result<Self, SecretError> {
        let raw = BASE64.decode(material.trim()).map_err(|e| SecretError::InvalidKey(e.to_string()))?;
        let mut hasher = Sha256::new();
        hasher.update(&raw);
        Ok(Self(hasher.finalize().into()))
    }

    /// Deterministic fallback key derived from host and user identity when
    /// no `PETALFLOW_SECRET_KEY` is configured (spec.md §6). Stable across
    /// process restarts on the same machine/account, not portable across
    /// machines — acceptable for the reference `Store` implementations this
    /// crate ships (spec.md's persistence Non-goal).
    pub fn host_derived() -> Self {
        let hostname = hostname_or_unknown();
        let user = std::env::var("USER").or_else(|_| std::env::var("USERNAME")).unwrap_or_else(|_| "unknown".to_string());
        let mut hasher = Sha256::new();
        hasher.update(b"petalflow-secret-fallback-v1");
        hasher.update(hostname.as_bytes());
        hasher.update(user.as_bytes());
        Self(hasher.finalize().into())
    }

    pub fn resolve_from_env() -> Self {
        match std::env::var("PETALFLOW_SECRET_KEY") {
            Ok(material) if !material.is_empty() => Self::from_base64(&material).unwrap_or_else(|_| Self::host_derived()),
            _ => Self::host_derived(),
        }
    }
}

fn hostname_or_unknown() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "unknown-host".to_string())
}

/// Encrypts `plaintext`, producing `enc:v1:<base64(nonce || ciphertext)>`.
pub fn encrypt(key: &SecretKey, plaintext: &str) -> Result<String, SecretError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key.0));
    let mut nonce_bytes = [0u8; 12];
    rand::rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);
    let ciphertext = cipher.encrypt(nonce, plaintext.as_bytes()).map_err(|_| SecretError::EncryptionFailed)?;

    let mut payload = Vec::with_capacity(nonce_bytes.len() + ciphertext.len());
    payload.extend_from_slice(&nonce_bytes);
    payload.extend_from_slice(&ciphertext);
    Ok(format!("{PREFIX}{}", BASE64.encode(payload)))
}

/// Decrypts a value previously produced by [`encrypt`]. Values without the
/// `enc:v1:` prefix are returned unchanged, so plaintext config written
/// before encryption was enabled still round-trips.
pub fn decrypt(key: &SecretKey, value: &str) -> Result<String, SecretError> {
    let Some(encoded) = value.strip_prefix(PREFIX) else {
        return Ok(value.to_string());
    };
    let payload = BASE64.decode(encoded).map_err(|_| SecretError::Malformed)?;
    if payload.len() < 12 {
        return Err(SecretError::Malformed);
    }
    let (nonce_bytes, ciphertext) = payload.split_at(12);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key.0));
    let nonce = Nonce::from_slice(nonce_bytes);
    let plaintext = cipher.decrypt(nonce, ciphertext).map_err(|_| SecretError::DecryptionFailed)?;
    String::from_utf8(plaintext).map_err(|_| SecretError::Malformed)
}

pub fn is_encrypted(value: &str) -> bool {
    value.starts_with(PREFIX)
}
