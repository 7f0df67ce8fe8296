//! Rotation strategies bundled with the binary.

use std::sync::Arc;

use async_trait::async_trait;
use sigil_kernel::{KernelError, RotationRegistry, RotationRequest, RotationStrategy};

/// Strategy id of [`RandomHex`].
pub const RANDOM_HEX: &str = "random-hex";

/// Mints 32 random bytes, hex encoded.
pub struct RandomHex {
    bytes: usize,
}

impl Default for RandomHex {
    fn default() -> Self {
        Self { bytes: 32 }
    }
}

#[async_trait]
impl RotationStrategy for RandomHex {
    async fn rotate(&self, _request: &RotationRequest) -> sigil_kernel::Result<String> {
        let bytes = sigil_vault::crypto::random_bytes(self.bytes).map_err(|e| {
            KernelError::StrategyFailed {
                strategy: RANDOM_HEX.into(),
                reason: e.to_string(),
            }
        })?;
        Ok(hex::encode(bytes))
    }
}

/// A registry holding every bundled strategy.
pub fn builtin_registry() -> RotationRegistry {
    let registry = RotationRegistry::new();
    registry.register(
        RANDOM_HEX,
        "Random 256-bit value, hex encoded",
        Arc::new(RandomHex::default()),
    );
    registry
}
