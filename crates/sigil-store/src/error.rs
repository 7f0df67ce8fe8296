//! Error types for the sigil-store crate.
//!
//! All storage operations return [`StoreError`] via [`StoreResult`].
//! Domain failures (`NotFound`, `Conflict`, `VersionMismatch`, …) are
//! surfaced to the caller as-is and never retried inside the core; callers
//! re-read and retry with fresh state.

use thiserror::Error;

/// Alias for `Result<T, StoreError>`.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur in the secrets core.
#[derive(Debug, Error)]
pub enum StoreError {
    // -- Domain errors -------------------------------------------------------
    /// The requested record was not found.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// A uniqueness rule would be violated.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Optimistic concurrency check failed; re-read and retry.
    #[error("{entity} {id} is at version {actual}, expected {expected}")]
    VersionMismatch {
        entity: &'static str,
        id: String,
        expected: i64,
        actual: i64,
    },

    /// The target path is governed by an approval policy; the change must
    /// go through an approval request.
    #[error("changes under this path require approval (policy {policy_id})")]
    ApprovalRequired { policy_id: String },

    /// The reviewer is not on the request's frozen approver list.
    #[error("reviewer {reviewer} is not eligible to vote on request {request_id}")]
    Ineligible { request_id: String, reviewer: String },

    /// The reviewer already voted on this request.
    #[error("reviewer {reviewer} already voted on request {request_id}")]
    AlreadyVoted { request_id: String, reviewer: String },

    /// The request is in a terminal state and accepts no further votes.
    #[error("approval request {request_id} is already {status}")]
    RequestClosed { request_id: String, status: String },

    /// No snapshot with this id exists.
    #[error("snapshot not found: {0}")]
    SnapshotNotFound(String),

    /// The project has no registered blind index key.
    #[error("invalid scope: project {project} has no registered blind index key")]
    InvalidScope { project: String },

    /// The principal holds no grant covering the target scope.
    #[error("principal {principal} has no access to {project}/{environment}{path}")]
    ScopeDenied {
        principal: String,
        project: String,
        environment: String,
        path: String,
    },

    /// The rotation strategy could not produce a new value.
    #[error("rotation {rotation_id} failed: {reason}")]
    RotationFailed { rotation_id: String, reason: String },

    /// An invalid argument was provided to a store operation.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    // -- Underlying errors ---------------------------------------------------
    /// Encryption, decryption or key handling failed.
    #[error("vault error: {0}")]
    Vault(#[from] sigil_vault::VaultError),

    /// SQLite operation failed.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// JSON serialization or deserialization failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// A schema migration failed.
    #[error("migration v{version} failed: {message}")]
    Migration { version: u32, message: String },

    /// A blocking task was cancelled or panicked.
    #[error("background task failed: {0}")]
    TaskJoin(String),
}

impl StoreError {
    /// Whether this is a data-integrity failure of the target state (as
    /// opposed to an infrastructure failure).  Approval application turns
    /// these into a `Stale` request instead of aborting the vote.
    pub fn is_state_conflict(&self) -> bool {
        matches!(
            self,
            Self::NotFound { .. } | Self::Conflict(_) | Self::VersionMismatch { .. }
        )
    }
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::TaskJoin(err.to_string())
    }
}
