//! Cryptographic layer of the Sigil secrets core.
//!
//! Nothing in this crate touches storage.  It provides the primitives the
//! store composes:
//!
//! - [`crypto`]: AES-256-GCM encryption/decryption and HMAC-SHA256 via `ring`.
//! - [`keys`]: caller-supplied [`KeyRef`]s; passed explicitly, never cached.
//! - [`envelope`]: the [`EnvelopeAdapter`] contract and its AES-256-GCM
//!   implementation.
//! - [`blind_index`]: per-project salts and deterministic name tokens.
//! - [`error`]: Unified error types.
//!
//! # Quick Start
//!
//! ```rust
//! use sigil_vault::{AesGcmEnvelope, BlindIndexSalt, EnvelopeAdapter, KeyRef};
//!
//! # fn example() -> sigil_vault::Result<()> {
//! let key = KeyRef::generate("project-a")?;
//!
//! let sealed = AesGcmEnvelope.encrypt(b"hunter2", &key)?;
//! assert_eq!(AesGcmEnvelope.decrypt_string(&sealed, &key)?, "hunter2");
//!
//! let salt = BlindIndexSalt::generate()?;
//! assert_eq!(salt.token("DB_PASSWORD"), salt.token("db_password"));
//! # Ok(())
//! # }
//! ```

pub mod blind_index;
pub mod crypto;
pub mod envelope;
pub mod error;
pub mod keys;

// Re-export the most commonly used types at the crate root for convenience.
pub use blind_index::{BlindIndexSalt, BlindIndexToken};
pub use envelope::{AesGcmEnvelope, EncryptionAlgorithm, EnvelopeAdapter, Sealed};
pub use error::{Result, VaultError};
pub use keys::{KeyEncoding, KeyRef};
