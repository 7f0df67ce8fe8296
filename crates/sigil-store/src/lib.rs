//! # sigil-store
//!
//! Secrets core for Sigil.
//!
//! Stores encrypted secrets for many projects in SQLite, keeps every
//! version, searches names through blind indexes, captures and restores
//! point-in-time snapshots, and holds changes to protected paths until
//! enough reviewers approve them.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │  SecretsCore                                           │
//! │  ApprovalEngine ─┐                                     │
//! │  RotationScheduler ─┤→ SecretStore → BlindIndexEngine  │
//! │  SnapshotManager ──┘   FolderManager   ImportManager   │
//! ├────────────────────────────────────────────────────────┤
//! │  Backend: one IMMEDIATE transaction per mutation,      │
//! │  events published to the EventBus after commit         │
//! ├────────────────────────────────────────────────────────┤
//! │  Database (rusqlite WAL + mmap), versioned migrations  │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! Every operation takes an [`OpContext`]: the authenticated principal with
//! its scope grants, and the key used to seal and open values.  Keys are
//! never stored or cached by the core.
//!
//! ## Quick start
//!
//! ```ignore
//! use sigil_store::{OpContext, Principal, RotationRegistry, Scope, ScopeGrant, SecretType,
//!                   SecretsCore, StoreConfig};
//!
//! let core = SecretsCore::open("data/sigil.db", RotationRegistry::new(), StoreConfig::default()).await?;
//! let alice = Principal::new("alice").with_grant(ScopeGrant::project_wide("billing"));
//! let ctx = OpContext::new(alice, key);
//!
//! core.blind_index().register_key(&ctx, "billing").await?;
//! let scope = Scope::new("billing", "dev", "/")?;
//! core.secrets()
//!     .create_secret(&ctx, &scope, "DB_PASSWORD", SecretType::Shared, "hunter2", vec![])
//!     .await?;
//! ```

pub mod approvals;
pub mod blind_index;
pub mod db;
pub mod error;
pub mod folders;
pub mod imports;
pub mod migration;
pub mod rotation;
pub mod runtime;
pub mod scope;
pub mod secrets;
pub mod snapshots;
mod tx;

// ── re-exports ───────────────────────────────────────────────────────

pub use approvals::{
    AppliedChange, ApprovalEngine, ApprovalPolicy, ApprovalRequest, ChangePreview, EnforcementLevel,
    NewApprovalPolicy, PolicySnapshot, ProposedChange, RequestStatus, SecretChange, SoftRejectRule,
    Submission, Vote, VoteDecision,
};
pub use blind_index::{BlindIndexEngine, IndexHit};
pub use db::Database;
pub use error::{StoreError, StoreResult};
pub use folders::{FolderManager, SecretFolder, SecretFolderVersion};
pub use imports::{ImportManager, SecretImport};
pub use rotation::{
    RotationRegistry, RotationRequest, RotationScheduler, RotationStatus, RotationStrategy,
    SecretRotation, SecretRotationOutput,
};
pub use runtime::{SecretsCore, StoreConfig};
pub use scope::{OpContext, PathPattern, Principal, Scope, ScopeGrant, SecretPath};
pub use secrets::{Secret, SecretStore, SecretType, SecretVersion};
pub use snapshots::{
    RollbackReport, SecretSnapshot, SnapshotDetail, SnapshotFolder, SnapshotManager, SnapshotSecret,
    SnapshotTrigger,
};
