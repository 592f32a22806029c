//! Admin secret validation.
//!
//! Secrets are checked against SHA-256 hashes from configuration, so the
//! server never needs the plaintext.

use sha2::{Digest, Sha256};
use std::collections::HashSet;

/// Validates admin shutdown secrets against pre-configured hashes.
#[derive(Debug, Clone, Default)]
pub struct SecretValidator {
    /// SHA-256 hex strings.
    valid_hashes: HashSet<String>,
}

impl SecretValidator {
    pub fn new(hashes: impl IntoIterator<Item = String>) -> Self {
        Self {
            valid_hashes: hashes
                .into_iter()
                .map(|hash| hash.trim().to_ascii_lowercase())
                .filter(|hash| !hash.is_empty())
                .collect(),
        }
    }

    /// A validator that accepts exactly one plaintext secret.
    pub fn from_secret(secret: &str) -> Self {
        Self::new([Self::hash_secret(secret)])
    }

    /// Admin shutdown is disabled when nothing is configured.
    pub fn is_enabled(&self) -> bool {
        !self.valid_hashes.is_empty()
    }

    pub fn secret_count(&self) -> usize {
        self.valid_hashes.len()
    }

    pub fn validate(&self, secret: &str) -> bool {
        if self.valid_hashes.is_empty() {
            return false;
        }
        self.valid_hashes.contains(&Self::hash_secret(secret))
    }

    /// SHA-256 of `secret` as lowercase hex.
    pub fn hash_secret(secret: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(secret.as_bytes());
        hex::encode(hasher.finalize())
    }
}
