//! CLI argument definitions for the `sigil` binary.
//!
//! All `clap` structures live here so that `main.rs` stays focused on
//! dispatching subcommands.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

/// Sigil -- versioned, encrypted configuration secrets.
#[derive(Parser)]
#[command(
    name = "sigil",
    version,
    about = "Sigil -- versioned, encrypted configuration secrets",
    long_about = "Operator CLI for the Sigil secrets core: store and version encrypted \
                  secrets per project and environment, review changes to protected paths, \
                  take snapshots and roll back, and run due rotations."
)]
pub struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, global = true, default_value = "config/sigil.toml")]
    pub config: PathBuf,

    /// Principal the command runs as (overrides SIGIL_ACTOR).
    #[arg(long = "as", global = true)]
    pub actor: Option<String>,

    /// Project to operate on (overrides SIGIL_PROJECT).
    #[arg(long, short, global = true)]
    pub project: Option<String>,

    /// Environment to operate on (overrides SIGIL_ENV).
    #[arg(long = "env", short, global = true)]
    pub environment: Option<String>,

    /// Print results as JSON instead of text.
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Print a freshly generated master key (64 hex characters).
    Keygen,

    /// Register the project's blind index key.
    Init,

    /// Show database and strategy status.
    Status,

    /// Read and write secrets.
    Secret {
        #[command(subcommand)]
        action: SecretAction,
    },

    /// Manage the folder tree.
    Folder {
        #[command(subcommand)]
        action: FolderAction,
    },

    /// Take, inspect and roll back snapshots.
    Snapshot {
        #[command(subcommand)]
        action: SnapshotAction,
    },

    /// Manage approval policies.
    Policy {
        #[command(subcommand)]
        action: PolicyAction,
    },

    /// Review approval requests.
    Request {
        #[command(subcommand)]
        action: RequestAction,
    },

    /// Configure and run secret rotations.
    Rotation {
        #[command(subcommand)]
        action: RotationAction,
    },

    /// Run every rotation that is due, once.
    RotateDue,

    /// Manage folder imports.
    Import {
        #[command(subcommand)]
        action: ImportAction,
    },
}

/// Folder path shared by scoped subcommands.
#[derive(Args, Clone)]
pub struct PathArg {
    /// Folder path, e.g. `/db`.
    #[arg(long, default_value = "/")]
    pub path: String,
}

#[derive(Subcommand)]
pub enum SecretAction {
    /// Create or update a secret.
    ///
    /// Shared secrets under a path covered by an approval policy are
    /// submitted for review instead of written.
    Set {
        name: String,
        value: String,
        #[command(flatten)]
        path: PathArg,
        /// Tag to attach; repeat for several.
        #[arg(long = "tag")]
        tags: Vec<String>,
        /// Write a personal override visible only to the caller.
        #[arg(long)]
        personal: bool,
    },

    /// Print a secret's value.
    Get {
        name: String,
        #[command(flatten)]
        path: PathArg,
        /// Read this version instead of the current one.
        #[arg(long)]
        version: Option<i64>,
    },

    /// List secrets in a folder.
    List {
        #[command(flatten)]
        path: PathArg,
        /// Include secrets imported from other folders.
        #[arg(long)]
        effective: bool,
    },

    /// Show a secret's version history (values are not printed).
    History {
        name: String,
        #[command(flatten)]
        path: PathArg,
    },

    /// Delete a secret.
    Delete {
        name: String,
        #[command(flatten)]
        path: PathArg,
        /// Delete the caller's personal override instead.
        #[arg(long)]
        personal: bool,
    },
}

#[derive(Subcommand)]
pub enum FolderAction {
    /// Create a folder and any missing parents.
    Create {
        #[command(flatten)]
        path: PathArg,
    },

    /// List a folder's children.
    List {
        #[command(flatten)]
        path: PathArg,
    },

    /// Show a folder's structural versions.
    History {
        #[command(flatten)]
        path: PathArg,
    },

    /// Delete a folder and its subtree.
    Delete {
        #[command(flatten)]
        path: PathArg,
    },
}

#[derive(Subcommand)]
pub enum SnapshotAction {
    /// Capture the subtree at a path.
    Create {
        #[command(flatten)]
        path: PathArg,
    },

    /// List snapshots rooted at a path.
    List {
        #[command(flatten)]
        path: PathArg,
    },

    /// Show what a snapshot captured.
    Show { id: String },

    /// Restore a snapshot.
    Rollback { id: String },
}

#[derive(Subcommand)]
pub enum PolicyAction {
    /// Create an approval policy in the current environment.
    Create {
        /// Policy name.
        name: String,
        /// Folder path pattern the policy covers, e.g. `/prod/*`.
        #[arg(long = "secret-path", default_value = "/**")]
        secret_path: String,
        /// Approvals needed before changes apply.
        #[arg(long, default_value_t = 1)]
        approvals: u32,
        /// Eligible reviewer; repeat for several.
        #[arg(long = "approver", required = true)]
        approvers: Vec<String>,
        /// Use soft enforcement with the given reject rule.
        #[arg(long, value_enum)]
        soft: Option<SoftRule>,
    },

    /// List policies of the project.
    List {
        /// Only policies of the current environment.
        #[arg(long)]
        current_env: bool,
    },

    /// Delete a policy.
    Delete { id: String },
}

/// Soft enforcement reject rules, as accepted on the command line.
#[derive(Clone, Copy, ValueEnum)]
pub enum SoftRule {
    /// Rejections never block once approvals reach the threshold.
    ThresholdWins,
    /// Approvals minus rejections must reach the threshold.
    NetApprovals,
}

#[derive(Subcommand)]
pub enum RequestAction {
    /// List approval requests at a path.
    List {
        #[command(flatten)]
        path: PathArg,
        /// Only requests in this status.
        #[arg(long, value_enum)]
        status: Option<StatusFilter>,
    },

    /// Show a request with its proposed values.
    Show { id: String },

    /// Approve a request.
    Approve { id: String },

    /// Reject a request.
    Reject { id: String },

    /// Mark a pending request stale if its targets changed.
    Refresh { id: String },
}

#[derive(Clone, Copy, ValueEnum)]
pub enum StatusFilter {
    Pending,
    Approved,
    Rejected,
    Stale,
}

#[derive(Subcommand)]
pub enum RotationAction {
    /// Rotate a secret on a fixed interval.
    Create {
        /// Name of the shared secret to rotate.
        name: String,
        #[command(flatten)]
        path: PathArg,
        /// Interval between rotations, in seconds.
        #[arg(long)]
        every: u64,
        /// Registered strategy id.
        #[arg(long, default_value = crate::strategies::RANDOM_HEX)]
        strategy: String,
    },

    /// List rotations of a secret.
    List {
        name: String,
        #[command(flatten)]
        path: PathArg,
    },

    /// Run a rotation now.
    Run { id: String },

    /// Show a rotation's outputs.
    Outputs { id: String },

    /// Delete a rotation.
    Delete { id: String },

    /// List registered strategies.
    Strategies,
}

#[derive(Subcommand)]
pub enum ImportAction {
    /// Import another folder's secrets into a folder.
    Add {
        #[command(flatten)]
        path: PathArg,
        /// Environment of the source folder.
        #[arg(long = "from-env")]
        from_env: String,
        /// Path of the source folder.
        #[arg(long = "from-path", default_value = "/")]
        from_path: String,
    },

    /// List a folder's imports in order.
    List {
        #[command(flatten)]
        path: PathArg,
    },

    /// Remove an import.
    Remove { id: String },
}
