// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! License Handling
//!
//! Two concerns live here:
//! - `RevocationListValidator`: a local [`LicenseValidator`] that accepts any
//!   well-formed key whose fingerprint is not on the configured revocation list.
//! - `LicenseSealer`: at-rest protection for accepted keys. Keys are sealed with
//!   ChaCha20-Poly1305 under a key derived from the configured secret and stored
//!   as `base64(nonce || ciphertext)`. The plaintext never reaches the database.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use sha2::{Digest, Sha256};
use std::collections::HashSet;

use crate::domain::license::{LicenseError, LicenseGrant, LicenseValidator};

const MIN_KEY_LEN: usize = 8;
const NONCE_LEN: usize = 12;

/// SHA-256 hex digest of a license key. Safe to log and to list in config.
pub fn fingerprint(key: &str) -> String {
    hex::encode(Sha256::digest(key.trim().as_bytes()))
}

pub struct RevocationListValidator {
    revoked: HashSet<String>,
}

impl RevocationListValidator {
    /// `revoked` holds fingerprints (see [`fingerprint`]), compared case-insensitively.
    pub fn new(revoked: impl IntoIterator<Item = String>) -> Self {
        Self {
            revoked: revoked.into_iter().map(|f| f.trim().to_ascii_lowercase()).collect(),
        }
    }
}

#[async_trait]
impl LicenseValidator for RevocationListValidator {
    async fn validate(&self, key: &str) -> Result<LicenseGrant, LicenseError> {
        let key = key.trim();
        if key.len() < MIN_KEY_LEN {
            return Err(LicenseError::Invalid(format!(
                "key must be at least {} characters",
                MIN_KEY_LEN
            )));
        }
        if key.chars().any(char::is_whitespace) {
            return Err(LicenseError::Invalid("key contains whitespace".to_string()));
        }

        let fingerprint = fingerprint(key);
        if self.revoked.contains(&fingerprint) {
            return Err(LicenseError::Revoked(format!("fingerprint {}", &fingerprint[..12])));
        }

        Ok(LicenseGrant { fingerprint })
    }
}

pub struct LicenseSealer {
    cipher: ChaCha20Poly1305,
}

impl LicenseSealer {
    /// Derive the sealing key from a configured secret.
    pub fn new(secret: &str) -> Self {
        let digest = Sha256::digest(secret.as_bytes());
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(&digest)),
        }
    }

    /// Random per-process key. Sealed values cannot be opened after a restart.
    pub fn ephemeral() -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(&ChaCha20Poly1305::generate_key(&mut OsRng)),
        }
    }

    pub fn seal(&self, plaintext: &str) -> Result<String, LicenseError> {
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| LicenseError::Unavailable("failed to seal license key".to_string()))?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(blob))
    }

    pub fn open(&self, sealed: &str) -> Result<String, LicenseError> {
        let blob = BASE64
            .decode(sealed)
            .map_err(|e| LicenseError::Invalid(format!("sealed license is not base64: {}", e)))?;
        if blob.len() <= NONCE_LEN {
            return Err(LicenseError::Invalid("sealed license is truncated".to_string()));
        }

        let (nonce, ciphertext) = blob.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| LicenseError::Invalid("sealed license failed authentication".to_string()))?;

        String::from_utf8(plaintext).map_err(|e| LicenseError::Invalid(e.to_string()))
    }
}
