//! Rotation strategy registry.
//!
//! A rotation strategy is an external collaborator that knows how to mint a
//! fresh value for a secret (issue a new database password, roll an API
//! token, …).  Strategies are registered under a string identifier; the
//! rotation definitions stored by `sigil-store` only carry that identifier.
//!
//! Internally the registry is backed by [`DashMap`] which provides lock-free
//! concurrent reads and fine-grained write locking, making it safe to share
//! across tasks without a global `RwLock`.
//!
//! # Example
//!
//! ```rust
//! # use std::sync::Arc;
//! # use async_trait::async_trait;
//! # use sigil_kernel::registry::{RotationRegistry, RotationRequest, RotationStrategy};
//! struct Static;
//!
//! #[async_trait]
//! impl RotationStrategy for Static {
//!     async fn rotate(&self, _req: &RotationRequest) -> sigil_kernel::Result<String> {
//!         Ok("fresh".into())
//!     }
//! }
//!
//! let registry = RotationRegistry::new();
//! registry.register("static", "Always returns the same value", Arc::new(Static));
//! assert!(registry.get("static").is_ok());
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::{KernelError, Result};

// ---------------------------------------------------------------------------
// Strategy contract
// ---------------------------------------------------------------------------

/// Everything a strategy gets to know about the secret it rotates.
///
/// The current value is deliberately absent: strategies produce new values,
/// they never read old ones.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotationRequest {
    pub rotation_id: String,
    pub secret_id: String,
    pub project: String,
    pub environment: String,
    pub path: String,
    pub requested_at: DateTime<Utc>,
}

/// Produces a new plaintext value for a secret.
#[async_trait]
pub trait RotationStrategy: Send + Sync {
    /// Mint a new value.  Errors are recorded by the caller as failed
    /// rotation outputs; they never leave the secret half-updated.
    async fn rotate(&self, request: &RotationRequest) -> Result<String>;
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Bookkeeping about a registered strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyInfo {
    pub id: String,
    pub description: String,
    pub registered_at: DateTime<Utc>,
    pub last_invoked_at: Option<DateTime<Utc>>,
    pub successes: u64,
    pub failures: u64,
    pub last_error: Option<String>,
}

struct StrategyEntry {
    strategy: Arc<dyn RotationStrategy>,
    info: StrategyInfo,
}

/// Concurrent strategy registry backed by [`DashMap`].
///
/// The registry is cheaply cloneable (`Arc`-backed) and `Send + Sync`.
#[derive(Clone)]
pub struct RotationRegistry {
    inner: Arc<DashMap<String, StrategyEntry>>,
}

impl RotationRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(DashMap::new()),
        }
    }

    /// Register a strategy.
    ///
    /// If a strategy with the same `id` already exists, it is overwritten.
    pub fn register(
        &self,
        id: impl Into<String>,
        description: impl Into<String>,
        strategy: Arc<dyn RotationStrategy>,
    ) {
        let id = id.into();
        tracing::info!(strategy = %id, "rotation strategy registered");

        self.inner.insert(
            id.clone(),
            StrategyEntry {
                strategy,
                info: StrategyInfo {
                    id,
                    description: description.into(),
                    registered_at: Utc::now(),
                    last_invoked_at: None,
                    successes: 0,
                    failures: 0,
                    last_error: None,
                },
            },
        );
    }

    /// Remove a strategy from the registry.
    ///
    /// Returns the removed [`StrategyInfo`] if it existed.
    pub fn unregister(&self, id: &str) -> Option<StrategyInfo> {
        let removed = self.inner.remove(id).map(|(_, entry)| entry.info);
        if removed.is_some() {
            tracing::info!(strategy = %id, "rotation strategy unregistered");
        }
        removed
    }

    /// Look up a strategy for invocation.
    pub fn get(&self, id: &str) -> Result<Arc<dyn RotationStrategy>> {
        self.inner
            .get(id)
            .map(|entry| Arc::clone(&entry.strategy))
            .ok_or_else(|| KernelError::StrategyNotFound {
                strategy: id.to_string(),
            })
    }

    /// Retrieve a copy of a strategy's bookkeeping.
    pub fn info(&self, id: &str) -> Result<StrategyInfo> {
        self.inner
            .get(id)
            .map(|entry| entry.info.clone())
            .ok_or_else(|| KernelError::StrategyNotFound {
                strategy: id.to_string(),
            })
    }

    /// Record a successful invocation.
    pub fn record_success(&self, id: &str) {
        if let Some(mut entry) = self.inner.get_mut(id) {
            entry.info.last_invoked_at = Some(Utc::now());
            entry.info.successes += 1;
            entry.info.last_error = None;
        }
    }

    /// Record a failed invocation with its error message.
    pub fn record_failure(&self, id: &str, error: impl Into<String>) {
        if let Some(mut entry) = self.inner.get_mut(id) {
            let error = error.into();
            tracing::warn!(strategy = %id, error = %error, "rotation strategy failed");
            entry.info.last_invoked_at = Some(Utc::now());
            entry.info.failures += 1;
            entry.info.last_error = Some(error);
        }
    }

    /// Return a snapshot of all registered strategies.
    pub fn list_all(&self) -> Vec<StrategyInfo> {
        let mut all: Vec<StrategyInfo> = self.inner.iter().map(|e| e.info.clone()).collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// Return the total number of registered strategies.
    pub fn count(&self) -> usize {
        self.inner.len()
    }
}

impl Default for RotationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
