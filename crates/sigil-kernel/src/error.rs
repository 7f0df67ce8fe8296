//! Kernel error types.
//!
//! All kernel subsystems surface errors through [`KernelError`], which is the
//! single error type returned by every public API in this crate.  Each variant
//! carries enough context for callers to decide how to handle the failure
//! without inspecting opaque strings.

/// Unified error type for the Sigil kernel.
#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    // -- Rotation strategy errors -------------------------------------------
    /// No strategy is registered under the requested identifier.
    #[error("rotation strategy not found: {strategy}")]
    StrategyNotFound { strategy: String },

    /// The strategy ran but could not produce a new secret value.
    #[error("rotation strategy `{strategy}` failed: {reason}")]
    StrategyFailed { strategy: String, reason: String },

    // -- Generic ------------------------------------------------------------
    /// Catch-all for unexpected internal errors that don't fit a specific
    /// variant.  Prefer a typed variant whenever possible.
    #[error("internal kernel error: {0}")]
    Internal(String),
}

/// Convenience alias used throughout the kernel crate.
pub type Result<T> = std::result::Result<T, KernelError>;
