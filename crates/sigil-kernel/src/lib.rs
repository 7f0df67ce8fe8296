//! Sigil kernel services.
//!
//! This crate provides the process-wide plumbing shared by the secrets core
//! and its hosts:
//!
//! - **[`events`]** -- Publish/subscribe bus for domain events, backed by
//!   [`tokio::sync::broadcast`].  Audit and notification collaborators
//!   subscribe here.
//! - **[`registry`]** -- Concurrent registry of rotation strategies using
//!   [`dashmap::DashMap`], with invocation bookkeeping.
//! - **[`error`]** -- Unified kernel error types via [`thiserror`].
//!
//! All public types are `Send + Sync` and designed for use within a
//! multi-threaded tokio runtime.

pub mod error;
pub mod events;
pub mod registry;

// Re-export the most commonly used types at the crate root for convenience.
pub use error::{KernelError, Result};
pub use events::{DomainEvent, EventBus, EventKind};
pub use registry::{RotationRegistry, RotationRequest, RotationStrategy, StrategyInfo};
