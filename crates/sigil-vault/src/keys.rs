//! Caller-supplied key references.
//!
//! The core never owns long-lived keys.  Each operation receives a [`KeyRef`]
//! from its caller (ultimately from an external key-management collaborator)
//! and hands it down explicitly to the envelope adapter and the blind index.
//! There is no global key cache.

use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};

use crate::crypto::{self, KEY_LEN};
use crate::error::{Result, VaultError};

// ---------------------------------------------------------------------------
// Key encoding
// ---------------------------------------------------------------------------

/// How the key material was encoded when it was handed to the core.
///
/// Recorded on every sealed value so that the matching key can be decoded
/// the same way when the value is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyEncoding {
    Utf8,
    Base64,
    Hex,
}

impl KeyEncoding {
    /// Convert to the string stored in SQLite.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Utf8 => "utf8",
            Self::Base64 => "base64",
            Self::Hex => "hex",
        }
    }

    /// Parse from the string stored in SQLite.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "utf8" => Some(Self::Utf8),
            "base64" => Some(Self::Base64),
            "hex" => Some(Self::Hex),
            _ => None,
        }
    }

    fn decode(&self, encoded: &str) -> std::result::Result<Vec<u8>, String> {
        match self {
            Self::Utf8 => Ok(encoded.as_bytes().to_vec()),
            Self::Base64 => BASE64.decode(encoded.trim()).map_err(|e| e.to_string()),
            Self::Hex => hex::decode(encoded.trim()).map_err(|e| e.to_string()),
        }
    }
}

impl std::fmt::Display for KeyEncoding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// KeyRef
// ---------------------------------------------------------------------------

/// A 256-bit symmetric key plus the identifier it is known by.
///
/// Cloning is cheap (the material is `Arc`-shared).  `Debug` output never
/// contains key bytes.
#[derive(Clone)]
pub struct KeyRef {
    id: String,
    material: Arc<[u8; KEY_LEN]>,
    encoding: KeyEncoding,
}

impl KeyRef {
    /// Wrap raw key bytes.
    pub fn new(id: impl Into<String>, material: [u8; KEY_LEN], encoding: KeyEncoding) -> Self {
        Self {
            id: id.into(),
            material: Arc::new(material),
            encoding,
        }
    }

    /// Decode key material handed over as text.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::InvalidKey`] if the text does not decode to
    /// exactly 32 bytes.
    pub fn from_encoded(
        id: impl Into<String>,
        encoded: &str,
        encoding: KeyEncoding,
    ) -> Result<Self> {
        let id = id.into();
        let bytes = encoding
            .decode(encoded)
            .map_err(|reason| VaultError::InvalidKey {
                key_id: id.clone(),
                reason,
            })?;

        let material: [u8; KEY_LEN] =
            bytes
                .as_slice()
                .try_into()
                .map_err(|_| VaultError::InvalidKey {
                    key_id: id.clone(),
                    reason: format!("key must be {} bytes, got {}", KEY_LEN, bytes.len()),
                })?;

        Ok(Self::new(id, material, encoding))
    }

    /// Generate a fresh random key (tests, local development).
    pub fn generate(id: impl Into<String>) -> Result<Self> {
        let bytes = crypto::random_bytes(KEY_LEN)?;
        let mut material = [0u8; KEY_LEN];
        material.copy_from_slice(&bytes);
        Ok(Self::new(id, material, KeyEncoding::Base64))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn encoding(&self) -> KeyEncoding {
        self.encoding
    }

    /// Raw key bytes, for envelope adapter implementations.
    pub fn material(&self) -> &[u8] {
        self.material.as_slice()
    }
}

impl std::fmt::Debug for KeyRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyRef")
            .field("id", &self.id)
            .field("encoding", &self.encoding)
            .field("material", &"<redacted>")
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_never_prints_material() {
        let key = KeyRef::new("proj-key", [0xAB; KEY_LEN], KeyEncoding::Hex);
        let printed = format!("{key:?}");
        assert!(printed.contains("proj-key"));
        assert!(printed.contains("<redacted>"));
        assert!(!printed.to_lowercase().contains("abab"));
    }

    #[test]
    fn decodes_base64_and_hex() {
        let raw = [7u8; KEY_LEN];

        let b64 = BASE64.encode(raw);
        let key = KeyRef::from_encoded("k", &b64, KeyEncoding::Base64).unwrap();
        assert_eq!(key.material(), raw.as_slice());

        let hexed = hex::encode(raw);
        let key = KeyRef::from_encoded("k", &hexed, KeyEncoding::Hex).unwrap();
        assert_eq!(key.material(), raw.as_slice());
        assert_eq!(key.encoding(), KeyEncoding::Hex);
    }

    #[test]
    fn utf8_key_must_be_exactly_32_bytes() {
        assert!(KeyRef::from_encoded("k", "0123456789abcdef0123456789abcdef", KeyEncoding::Utf8).is_ok());

        let err = KeyRef::from_encoded("k", "too-short", KeyEncoding::Utf8).unwrap_err();
        assert!(matches!(err, VaultError::InvalidKey { .. }));
    }

    #[test]
    fn bad_encoding_rejected() {
        let err = KeyRef::from_encoded("k", "not hex at all", KeyEncoding::Hex).unwrap_err();
        assert!(matches!(err, VaultError::InvalidKey { .. }));
    }

    #[test]
    fn encoding_string_roundtrip() {
        for enc in [KeyEncoding::Utf8, KeyEncoding::Base64, KeyEncoding::Hex] {
            assert_eq!(KeyEncoding::parse(enc.as_str()), Some(enc));
        }
        assert_eq!(KeyEncoding::parse("latin1"), None);
    }
}
