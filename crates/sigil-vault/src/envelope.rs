//! Encryption envelope adapter.
//!
//! The secrets core never calls a cipher directly.  It talks to an
//! [`EnvelopeAdapter`], a stateless contract supplied by whoever manages the
//! keys.  [`AesGcmEnvelope`] is the built-in implementation (AES-256-GCM via
//! `ring`); deployments backed by a KMS provide their own.
//!
//! A [`Sealed`] value records everything needed to open it again besides the
//! key itself: ciphertext, nonce, algorithm tag, key encoding and key id.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};

use crate::crypto;
use crate::error::{Result, VaultError};
use crate::keys::{KeyEncoding, KeyRef};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Cipher used to produce a [`Sealed`] value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EncryptionAlgorithm {
    #[serde(rename = "aes-256-gcm")]
    Aes256Gcm,
}

impl EncryptionAlgorithm {
    /// Convert to the string stored in SQLite.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Aes256Gcm => "aes-256-gcm",
        }
    }

    /// Parse from the string stored in SQLite.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "aes-256-gcm" => Some(Self::Aes256Gcm),
            _ => None,
        }
    }
}

impl std::fmt::Display for EncryptionAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An encrypted blob plus its metadata.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sealed {
    #[serde(with = "b64")]
    pub ciphertext: Vec<u8>,
    #[serde(with = "b64")]
    pub nonce: Vec<u8>,
    pub algorithm: EncryptionAlgorithm,
    pub key_encoding: KeyEncoding,
    /// Id of the [`KeyRef`] the value was sealed under.
    pub key_id: String,
}

impl std::fmt::Debug for Sealed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sealed")
            .field("ciphertext_len", &self.ciphertext.len())
            .field("algorithm", &self.algorithm)
            .field("key_encoding", &self.key_encoding)
            .field("key_id", &self.key_id)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Adapter contract
// ---------------------------------------------------------------------------

/// Encrypts and decrypts values on behalf of the core.
///
/// Implementations must not retain plaintext or keys between calls.
pub trait EnvelopeAdapter: Send + Sync {
    /// Encrypt `plaintext` under `key`.
    fn encrypt(&self, plaintext: &[u8], key: &KeyRef) -> Result<Sealed>;

    /// Decrypt a value previously produced by [`EnvelopeAdapter::encrypt`].
    fn decrypt(&self, sealed: &Sealed, key: &KeyRef) -> Result<Vec<u8>>;

    /// Decrypt and interpret the plaintext as UTF-8.
    fn decrypt_string(&self, sealed: &Sealed, key: &KeyRef) -> Result<String> {
        let bytes = self.decrypt(sealed, key)?;
        String::from_utf8(bytes).map_err(|_| VaultError::DecryptionFailed {
            reason: "plaintext is not valid UTF-8".into(),
        })
    }
}

/// Built-in AES-256-GCM adapter.
#[derive(Debug, Clone, Copy, Default)]
pub struct AesGcmEnvelope;

impl EnvelopeAdapter for AesGcmEnvelope {
    fn encrypt(&self, plaintext: &[u8], key: &KeyRef) -> Result<Sealed> {
        let (nonce, ciphertext) = crypto::encrypt(plaintext, key.material())?;
        Ok(Sealed {
            ciphertext,
            nonce: nonce.to_vec(),
            algorithm: EncryptionAlgorithm::Aes256Gcm,
            key_encoding: key.encoding(),
            key_id: key.id().to_string(),
        })
    }

    fn decrypt(&self, sealed: &Sealed, key: &KeyRef) -> Result<Vec<u8>> {
        if sealed.key_id != key.id() {
            return Err(VaultError::InvalidKey {
                key_id: key.id().to_string(),
                reason: format!("value was sealed under key `{}`", sealed.key_id),
            });
        }

        let nonce: [u8; crypto::NONCE_LEN_BYTES] =
            sealed
                .nonce
                .as_slice()
                .try_into()
                .map_err(|_| VaultError::DecryptionFailed {
                    reason: format!(
                        "stored nonce is {} bytes, expected {}",
                        sealed.nonce.len(),
                        crypto::NONCE_LEN_BYTES
                    ),
                })?;

        match sealed.algorithm {
            EncryptionAlgorithm::Aes256Gcm => {
                crypto::decrypt(&nonce, &sealed.ciphertext, key.material())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Serde helper
// ---------------------------------------------------------------------------

mod b64 {
    use super::{BASE64, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(d)?;
        BASE64.decode(text).map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
