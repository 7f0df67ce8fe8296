//! Point-in-time snapshots of a folder subtree, and rollback.
//!
//! A snapshot records, for every live folder under a root and every live
//! secret in those folders, the version that was current.  Capture runs
//! inside one transaction, so it never mixes states from concurrent writes.
//!
//! Rollback never rewrites history.  It appends new versions that copy the
//! captured ones, tombstones secrets created after the snapshot and revives
//! deleted folders.  A `pre_rollback` snapshot is taken first in the same
//! transaction, so a rollback can itself be rolled back.

use std::collections::{HashMap, HashSet};

use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use sigil_kernel::{DomainEvent, EventKind};
use tracing::{info, instrument};
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};
use crate::folders::{self, SecretFolder};
use crate::scope::{OpContext, Scope, SecretPath};
use crate::secrets;
use crate::tx::{Backend, Tx};

// ═══════════════════════════════════════════════════════════════════════
//  Types
// ═══════════════════════════════════════════════════════════════════════

/// Why a snapshot was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotTrigger {
    Manual,
    /// Taken automatically before a rollback.
    PreRollback,
    /// Taken by a host-side schedule.
    Scheduled,
}

impl SnapshotTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::PreRollback => "pre_rollback",
            Self::Scheduled => "scheduled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "manual" => Some(Self::Manual),
            "pre_rollback" => Some(Self::PreRollback),
            "scheduled" => Some(Self::Scheduled),
            _ => None,
        }
    }
}

impl std::fmt::Display for SnapshotTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretSnapshot {
    pub id: String,
    pub project: String,
    pub environment: String,
    /// Root folder of the captured subtree.
    pub folder_id: String,
    pub path: SecretPath,
    pub trigger: SnapshotTrigger,
    pub created_by: String,
    pub created_at: i64,
    pub secret_count: usize,
    pub folder_count: usize,
}

/// Captured version of one secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotSecret {
    pub secret_id: String,
    pub secret_version_id: String,
}

/// Captured version of one folder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotFolder {
    pub folder_id: String,
    pub folder_version_id: String,
    /// Distance below the snapshot root.
    pub depth: i64,
}

/// A snapshot with everything it captured.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotDetail {
    pub snapshot: SecretSnapshot,
    pub secrets: Vec<SnapshotSecret>,
    pub folders: Vec<SnapshotFolder>,
}

/// What a rollback changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackReport {
    pub snapshot_id: String,
    /// The `pre_rollback` snapshot taken before any change.
    pub safety_snapshot_id: String,
    /// Secrets that received a restored version.
    pub restored: Vec<String>,
    /// Secrets created after the snapshot, now tombstoned.
    pub deleted: Vec<String>,
    /// Folders brought back from deletion.
    pub revived_folders: Vec<String>,
    /// Captured secrets already at their captured version.
    pub unchanged: usize,
}

impl RollbackReport {
    /// True when the rollback found nothing to change.
    pub fn is_noop(&self) -> bool {
        self.restored.is_empty() && self.deleted.is_empty() && self.revived_folders.is_empty()
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  SnapshotManager
// ═══════════════════════════════════════════════════════════════════════

/// Takes, lists and rolls back snapshots.
#[derive(Clone)]
pub struct SnapshotManager {
    backend: Backend,
}

impl SnapshotManager {
    pub(crate) fn new(backend: Backend) -> Self {
        Self { backend }
    }

    /// Capture the subtree rooted at `scope.path`.
    #[instrument(skip(self, ctx), fields(actor = %ctx.actor(), scope = %scope))]
    pub async fn snapshot(
        &self,
        ctx: &OpContext,
        scope: &Scope,
        trigger: SnapshotTrigger,
    ) -> StoreResult<SecretSnapshot> {
        ctx.authorize(scope)?;
        let scope = scope.clone();
        self.backend
            .write(ctx, move |tx| {
                let folder = folders::resolve_for_write(tx, &scope)?;
                capture(tx, &folder, trigger)
            })
            .await
    }

    /// Restore the captured state of `snapshot_id`.
    ///
    /// Everything happens in one transaction: on any error (for example a
    /// [`StoreError::Conflict`] because a tombstoned secret's name was
    /// reused elsewhere) nothing changes, the safety snapshot included.
    #[instrument(skip(self, ctx), fields(actor = %ctx.actor()))]
    pub async fn rollback(&self, ctx: &OpContext, snapshot_id: &str) -> StoreResult<RollbackReport> {
        let snapshot_id = snapshot_id.to_string();
        let principal = ctx.principal.clone();

        self.backend
            .write(ctx, move |tx| {
                let detail = load_detail(tx.conn, &snapshot_id)?;
                let header = &detail.snapshot;
                principal.authorize(&Scope {
                    project: header.project.clone(),
                    environment: header.environment.clone(),
                    path: header.path.clone(),
                })?;

                let root = folders::load(tx.conn, &header.folder_id)?;
                let safety = capture(tx, &root, SnapshotTrigger::PreRollback)?;
                let mut report = RollbackReport {
                    snapshot_id: header.id.clone(),
                    safety_snapshot_id: safety.id,
                    ..RollbackReport::default()
                };

                // Tombstone secrets the snapshot does not know about first, so
                // revived secrets and folders can take their names back.
                let captured: HashMap<&str, &str> = detail
                    .secrets
                    .iter()
                    .map(|s| (s.secret_id.as_str(), s.secret_version_id.as_str()))
                    .collect();
                if !root.is_deleted {
                    for (folder, _) in folders::subtree(tx.conn, &root)? {
                        for row in secrets::live_in_folder(tx.conn, &folder.id)? {
                            if !captured.contains_key(row.id.as_str()) {
                                secrets::tombstone(tx, &row, None)?;
                                report.deleted.push(row.id);
                            }
                        }
                    }
                }

                let mut folders_by_depth: Vec<&SnapshotFolder> = detail.folders.iter().collect();
                folders_by_depth.sort_by_key(|f| f.depth);
                for entry in folders_by_depth {
                    let folder = folders::load(tx.conn, &entry.folder_id)?;
                    if folder.is_deleted {
                        folders::revive(tx, &folder)?;
                        report.revived_folders.push(folder.id);
                    }
                }

                for entry in &detail.secrets {
                    let row = secrets::load_row(tx.conn, &entry.secret_id)?;
                    if !row.is_deleted
                        && row.current_version_id.as_deref() == Some(entry.secret_version_id.as_str())
                    {
                        report.unchanged += 1;
                        continue;
                    }
                    let source = secrets::load_version(tx.conn, &entry.secret_version_id)?;
                    secrets::restore(tx, &row, &source)?;
                    report.restored.push(row.id);
                }

                let event = DomainEvent::new(
                    EventKind::SnapshotRolledBack,
                    &header.project,
                    &header.environment,
                    header.path.as_str(),
                    &tx.actor,
                    &header.id,
                )
                .with_detail(serde_json::json!({
                    "safety_snapshot_id": report.safety_snapshot_id,
                    "restored": report.restored.len(),
                    "deleted": report.deleted.len(),
                    "revived_folders": report.revived_folders.len(),
                }));
                tx.emit(event);
                info!(
                    snapshot_id = %header.id,
                    restored = report.restored.len(),
                    deleted = report.deleted.len(),
                    "snapshot rolled back"
                );
                Ok(report)
            })
            .await
    }

    /// Snapshots whose root is the folder at `scope.path`, newest first.
    #[instrument(skip(self, ctx), fields(scope = %scope))]
    pub async fn list_snapshots(
        &self,
        ctx: &OpContext,
        scope: &Scope,
    ) -> StoreResult<Vec<SecretSnapshot>> {
        ctx.authorize(scope)?;
        let scope = scope.clone();
        self.backend
            .read(ctx, move |tx| {
                let Some(folder) = folders::resolve_existing(tx.conn, &scope)? else {
                    return Ok(Vec::new());
                };
                let ids: Vec<String> = {
                    let mut stmt = tx.conn.prepare(
                        "SELECT id FROM secret_snapshots WHERE folder_id = ?1 \
                         ORDER BY created_at DESC, id DESC",
                    )?;
                    stmt.query_map(rusqlite::params![folder.id], |row| row.get(0))?
                        .collect::<Result<Vec<_>, _>>()?
                };
                ids.iter()
                    .map(|id| load_detail(tx.conn, id).map(|d| d.snapshot))
                    .collect()
            })
            .await
    }

    /// A snapshot with its captured entries.
    #[instrument(skip(self, ctx))]
    pub async fn get_snapshot(&self, ctx: &OpContext, snapshot_id: &str) -> StoreResult<SnapshotDetail> {
        let snapshot_id = snapshot_id.to_string();
        let principal = ctx.principal.clone();
        self.backend
            .read(ctx, move |tx| {
                let detail = load_detail(tx.conn, &snapshot_id)?;
                principal.authorize(&Scope {
                    project: detail.snapshot.project.clone(),
                    environment: detail.snapshot.environment.clone(),
                    path: detail.snapshot.path.clone(),
                })?;
                Ok(detail)
            })
            .await
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Transaction-level helpers
// ═══════════════════════════════════════════════════════════════════════

/// Record the current state of `root`'s subtree.
pub(crate) fn capture(
    tx: &mut Tx<'_>,
    root: &SecretFolder,
    trigger: SnapshotTrigger,
) -> StoreResult<SecretSnapshot> {
    let id = Uuid::now_v7().to_string();
    tx.conn.execute(
        "INSERT INTO secret_snapshots (id, project_id, environment, folder_id, path, trigger, created_by, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        rusqlite::params![
            id,
            root.project,
            root.environment,
            root.id,
            root.path.as_str(),
            trigger.as_str(),
            tx.actor,
            tx.now,
        ],
    )?;

    let tree = folders::subtree(tx.conn, root)?;
    let mut seen: HashSet<String> = HashSet::new();
    let mut secret_count = 0;
    for (folder, depth) in &tree {
        tx.conn.execute(
            "INSERT INTO secret_snapshot_folders (snapshot_id, folder_id, folder_version_id, depth) \
             VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![id, folder.id, folder.current_version_id, depth],
        )?;
        for row in secrets::live_in_folder(tx.conn, &folder.id)? {
            let Some(version_id) = row.current_version_id.as_deref() else {
                continue;
            };
            if seen.insert(row.id.clone()) {
                tx.conn.execute(
                    "INSERT INTO secret_snapshot_secrets (snapshot_id, secret_id, secret_version_id) \
                     VALUES (?1, ?2, ?3)",
                    rusqlite::params![id, row.id, version_id],
                )?;
                secret_count += 1;
            }
        }
    }

    let snapshot = SecretSnapshot {
        id,
        project: root.project.clone(),
        environment: root.environment.clone(),
        folder_id: root.id.clone(),
        path: root.path.clone(),
        trigger,
        created_by: tx.actor.clone(),
        created_at: tx.now,
        secret_count,
        folder_count: tree.len(),
    };

    let event = DomainEvent::new(
        EventKind::SnapshotCreated,
        &snapshot.project,
        &snapshot.environment,
        snapshot.path.as_str(),
        &tx.actor,
        &snapshot.id,
    )
    .with_detail(serde_json::json!({
        "trigger": trigger.as_str(),
        "secrets": secret_count,
        "folders": snapshot.folder_count,
    }));
    tx.emit(event);
    info!(snapshot_id = %snapshot.id, trigger = %trigger, secrets = secret_count, "snapshot taken");
    Ok(snapshot)
}

fn load_detail(conn: &Connection, snapshot_id: &str) -> StoreResult<SnapshotDetail> {
    let header = conn
        .query_row(
            "SELECT id, project_id, environment, folder_id, path, trigger, created_by, created_at \
             FROM secret_snapshots WHERE id = ?1",
            rusqlite::params![snapshot_id],
            |row| {
                Ok(SnapshotRow {
                    id: row.get(0)?,
                    project: row.get(1)?,
                    environment: row.get(2)?,
                    folder_id: row.get(3)?,
                    path: row.get(4)?,
                    trigger: row.get(5)?,
                    created_by: row.get(6)?,
                    created_at: row.get(7)?,
                })
            },
        )
        .optional()?
        .ok_or_else(|| StoreError::SnapshotNotFound(snapshot_id.to_string()))?;

    let secrets: Vec<SnapshotSecret> = {
        let mut stmt = conn.prepare(
            "SELECT secret_id, secret_version_id FROM secret_snapshot_secrets \
             WHERE snapshot_id = ?1 ORDER BY secret_id",
        )?;
        stmt.query_map(rusqlite::params![snapshot_id], |row| {
            Ok(SnapshotSecret {
                secret_id: row.get(0)?,
                secret_version_id: row.get(1)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?
    };
    let folders: Vec<SnapshotFolder> = {
        let mut stmt = conn.prepare(
            "SELECT folder_id, folder_version_id, depth FROM secret_snapshot_folders \
             WHERE snapshot_id = ?1 ORDER BY depth, folder_id",
        )?;
        stmt.query_map(rusqlite::params![snapshot_id], |row| {
            Ok(SnapshotFolder {
                folder_id: row.get(0)?,
                folder_version_id: row.get(1)?,
                depth: row.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?
    };

    let snapshot = header.into_snapshot(secrets.len(), folders.len())?;
    Ok(SnapshotDetail {
        snapshot,
        secrets,
        folders,
    })
}

struct SnapshotRow {
    id: String,
    project: String,
    environment: String,
    folder_id: String,
    path: String,
    trigger: String,
    created_by: String,
    created_at: i64,
}

impl SnapshotRow {
    fn into_snapshot(self, secret_count: usize, folder_count: usize) -> StoreResult<SecretSnapshot> {
        let trigger = SnapshotTrigger::parse(&self.trigger).ok_or_else(|| {
            StoreError::InvalidArgument(format!("unknown snapshot trigger `{}`", self.trigger))
        })?;
        Ok(SecretSnapshot {
            id: self.id,
            project: self.project,
            environment: self.environment,
            folder_id: self.folder_id,
            path: SecretPath::parse(&self.path)?,
            trigger,
            created_by: self.created_by,
            created_at: self.created_at,
            secret_count,
            folder_count,
        })
    }
}
