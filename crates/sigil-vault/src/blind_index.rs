//! Blind index tokens.
//!
//! A blind index lets the store find a secret by name without decrypting
//! every stored name.  The token is `base64(HMAC-SHA256(salt, lowercase(name)))`
//! where `salt` is a random per-project secret that is itself kept sealed at
//! rest.  Tokens are deterministic for a given salt and name, and reveal
//! nothing about the name without the salt.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};

use crate::crypto;
use crate::error::{Result, VaultError};

/// Length of a per-project blind index salt in bytes.
pub const SALT_LEN: usize = 32;

/// Deterministic search token for a secret name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlindIndexToken(String);

impl BlindIndexToken {
    /// Rehydrate a token read back from storage.
    pub fn from_stored(token: String) -> Self {
        Self(token)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for BlindIndexToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Case folding applied before hashing.
pub fn normalize_name(name: &str) -> String {
    name.to_lowercase()
}

/// Per-project HMAC key for blind indexes.
#[derive(Clone)]
pub struct BlindIndexSalt(Vec<u8>);

impl BlindIndexSalt {
    /// Generate a fresh random salt.
    pub fn generate() -> Result<Self> {
        Ok(Self(crypto::random_bytes(SALT_LEN)?))
    }

    /// Wrap salt bytes recovered from storage.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::DecryptionFailed`] if the length is wrong, which
    /// means the stored salt was opened with the wrong key or is corrupted.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        if bytes.len() != SALT_LEN {
            return Err(VaultError::DecryptionFailed {
                reason: format!(
                    "blind index salt is {} bytes, expected {SALT_LEN}",
                    bytes.len()
                ),
            });
        }
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Compute the token for `name`.
    pub fn token(&self, name: &str) -> BlindIndexToken {
        let mac = crypto::hmac_sha256(&self.0, normalize_name(name).as_bytes());
        BlindIndexToken(BASE64.encode(mac))
    }
}

impl std::fmt::Debug for BlindIndexSalt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("BlindIndexSalt(<redacted>)")
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
