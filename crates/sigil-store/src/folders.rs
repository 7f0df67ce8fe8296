//! Folder tree per (project, environment).
//!
//! Folders form a tree rooted at `/`, created lazily on first write.  Every
//! structural change (child added or removed, folder deleted or revived)
//! appends a [`SecretFolderVersion`] recording the folder's name, its child
//! names and the parent's version at that moment.  Secret writes only bump
//! the folder's `secrets_revision` counter.

use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};
use crate::scope::{OpContext, Scope, SecretPath};
use crate::tx::{Backend, Tx};

/// Name stored for the root folder of every environment.
pub const ROOT_FOLDER_NAME: &str = "root";

// ═══════════════════════════════════════════════════════════════════════
//  Types
// ═══════════════════════════════════════════════════════════════════════

/// A folder in an environment's tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretFolder {
    pub id: String,
    pub project: String,
    pub environment: String,
    /// `None` for the root folder.
    pub parent_id: Option<String>,
    pub name: String,
    pub path: SecretPath,
    /// Id of the newest [`SecretFolderVersion`].
    pub current_version_id: String,
    /// Incremented on every secret write inside this folder.
    pub secrets_revision: i64,
    pub is_deleted: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

impl SecretFolder {
    pub fn scope(&self) -> Scope {
        Scope {
            project: self.project.clone(),
            environment: self.environment.clone(),
            path: self.path.clone(),
        }
    }
}

/// Immutable record of a folder's structure at one point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretFolderVersion {
    pub id: String,
    pub folder_id: String,
    /// 1-based, strictly increasing per folder.
    pub ordinal: i64,
    pub name: String,
    pub parent_version_id: Option<String>,
    /// Names of live child folders, sorted.
    pub children: Vec<String>,
    pub is_deleted: bool,
    pub created_at: i64,
}

// ═══════════════════════════════════════════════════════════════════════
//  FolderManager
// ═══════════════════════════════════════════════════════════════════════

/// Creates, resolves and deletes folders.
#[derive(Clone)]
pub struct FolderManager {
    backend: Backend,
}

impl FolderManager {
    pub(crate) fn new(backend: Backend) -> Self {
        Self { backend }
    }

    /// The environment's root folder, created on first use.
    #[instrument(skip(self, ctx), fields(actor = %ctx.actor()))]
    pub async fn root(
        &self,
        ctx: &OpContext,
        project: &str,
        environment: &str,
    ) -> StoreResult<(SecretFolder, SecretFolderVersion)> {
        let scope = Scope::new(project, environment, "/")?;
        ctx.authorize(&scope)?;

        self.backend
            .write(ctx, move |tx| {
                let root = ensure_root(tx, &scope.project, &scope.environment)?;
                with_current_version(tx.conn, root)
            })
            .await
    }

    /// Create a child folder under the folder whose current version is
    /// `parent_version_id`, or return the existing live child of that name.
    ///
    /// Fails with [`StoreError::VersionMismatch`] when the parent has moved
    /// on since the caller read `parent_version_id`.
    #[instrument(skip(self, ctx), fields(actor = %ctx.actor()))]
    pub async fn upsert_folder(
        &self,
        ctx: &OpContext,
        parent_version_id: &str,
        name: &str,
    ) -> StoreResult<(SecretFolder, SecretFolderVersion)> {
        let parent_version_id = parent_version_id.to_string();
        let name = name.to_string();
        let principal = ctx.principal.clone();

        self.backend
            .write(ctx, move |tx| {
                let version = load_version(tx.conn, &parent_version_id)?;
                let parent = load(tx.conn, &version.folder_id)?;
                if parent.is_deleted {
                    return Err(StoreError::NotFound {
                        entity: "folder",
                        id: parent.id,
                    });
                }
                if parent.current_version_id != version.id {
                    let current = load_version(tx.conn, &parent.current_version_id)?;
                    return Err(StoreError::VersionMismatch {
                        entity: "folder",
                        id: parent.id,
                        expected: version.ordinal,
                        actual: current.ordinal,
                    });
                }

                principal.authorize(&parent.scope().with_path(parent.path.child(&name)?))?;
                let folder = match live_child(tx.conn, &parent, &name)? {
                    Some(existing) => existing,
                    None => create_child(tx, &parent, &name)?,
                };
                with_current_version(tx.conn, folder)
            })
            .await
    }

    /// Create every missing folder along `scope.path` and return the last.
    #[instrument(skip(self, ctx), fields(actor = %ctx.actor(), path = %scope.path))]
    pub async fn ensure_path(&self, ctx: &OpContext, scope: &Scope) -> StoreResult<SecretFolder> {
        ctx.authorize(scope)?;
        let scope = scope.clone();

        self.backend
            .write(ctx, move |tx| {
                let mut folder = ensure_root(tx, &scope.project, &scope.environment)?;
                for segment in scope.path.segments() {
                    folder = match live_child(tx.conn, &folder, segment)? {
                        Some(child) => child,
                        None => create_child(tx, &folder, segment)?,
                    };
                }
                Ok(folder)
            })
            .await
    }

    /// Soft-delete an empty folder.  The root cannot be deleted.
    #[instrument(skip(self, ctx), fields(actor = %ctx.actor(), path = %scope.path))]
    pub async fn delete_folder(&self, ctx: &OpContext, scope: &Scope) -> StoreResult<()> {
        ctx.authorize(scope)?;
        if scope.path.is_root() {
            return Err(StoreError::InvalidArgument(
                "the root folder cannot be deleted".into(),
            ));
        }
        let scope = scope.clone();

        self.backend
            .write(ctx, move |tx| {
                let folder = resolve_existing(tx.conn, &scope)?.ok_or_else(|| not_found(&scope))?;

                let children = child_names(tx.conn, &folder.id)?;
                let secrets: i64 = tx.conn.query_row(
                    "SELECT count(*) FROM secrets WHERE folder_id = ?1 AND is_deleted = 0",
                    rusqlite::params![folder.id],
                    |row| row.get(0),
                )?;
                if !children.is_empty() || secrets > 0 {
                    return Err(StoreError::Conflict(format!(
                        "folder {} is not empty",
                        scope.path
                    )));
                }

                tx.conn.execute(
                    "UPDATE secret_folders SET is_deleted = 1, updated_at = ?2 WHERE id = ?1",
                    rusqlite::params![folder.id, tx.now],
                )?;
                append_version(tx, &folder.id)?;
                if let Some(parent_id) = &folder.parent_id {
                    append_version(tx, parent_id)?;
                }
                info!(folder_id = %folder.id, "folder deleted");
                Ok(())
            })
            .await
    }

    /// Look up the live folder at `scope.path`.
    #[instrument(skip(self, ctx), fields(path = %scope.path))]
    pub async fn get(&self, ctx: &OpContext, scope: &Scope) -> StoreResult<SecretFolder> {
        ctx.authorize(scope)?;
        let scope = scope.clone();
        self.backend
            .read(ctx, move |tx| {
                resolve_existing(tx.conn, &scope)?.ok_or_else(|| not_found(&scope))
            })
            .await
    }

    /// Live child folders of `scope.path`, sorted by name.
    #[instrument(skip(self, ctx), fields(path = %scope.path))]
    pub async fn list_children(
        &self,
        ctx: &OpContext,
        scope: &Scope,
    ) -> StoreResult<Vec<SecretFolder>> {
        ctx.authorize(scope)?;
        let scope = scope.clone();
        self.backend
            .read(ctx, move |tx| {
                let Some(folder) = resolve_existing(tx.conn, &scope)? else {
                    return Ok(Vec::new());
                };
                let mut out = Vec::new();
                for name in child_names(tx.conn, &folder.id)? {
                    if let Some(child) = live_child(tx.conn, &folder, &name)? {
                        out.push(child);
                    }
                }
                Ok(out)
            })
            .await
    }

    /// Structural history of the folder at `scope.path`, oldest first.
    #[instrument(skip(self, ctx), fields(path = %scope.path))]
    pub async fn list_versions(
        &self,
        ctx: &OpContext,
        scope: &Scope,
    ) -> StoreResult<Vec<SecretFolderVersion>> {
        ctx.authorize(scope)?;
        let scope = scope.clone();
        self.backend
            .read(ctx, move |tx| {
                let folder = resolve_existing(tx.conn, &scope)?.ok_or_else(|| not_found(&scope))?;
                let mut stmt = tx.conn.prepare(
                    "SELECT id, folder_id, ordinal, name, parent_version_id, children, is_deleted, created_at \
                     FROM secret_folder_versions WHERE folder_id = ?1 ORDER BY ordinal ASC",
                )?;
                let rows = stmt
                    .query_map(rusqlite::params![folder.id], version_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows.into_iter().map(FolderVersionRow::into_version).collect()
            })
            .await
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Transaction-level helpers
// ═══════════════════════════════════════════════════════════════════════

fn not_found(scope: &Scope) -> StoreError {
    StoreError::NotFound {
        entity: "folder",
        id: scope.to_string(),
    }
}

const FOLDER_COLUMNS: &str = "id, project_id, environment, parent_id, name, current_version_id, \
                              secrets_revision, is_deleted, created_at, updated_at";

/// Load a folder by id, deleted or not.
pub(crate) fn load(conn: &Connection, id: &str) -> StoreResult<SecretFolder> {
    let row = conn
        .query_row(
            &format!("SELECT {FOLDER_COLUMNS} FROM secret_folders WHERE id = ?1"),
            rusqlite::params![id],
            folder_row,
        )
        .optional()?
        .ok_or_else(|| StoreError::NotFound {
            entity: "folder",
            id: id.to_string(),
        })?;
    let path = path_of(conn, &row)?;
    Ok(row.into_folder(path))
}

pub(crate) fn load_version(conn: &Connection, id: &str) -> StoreResult<SecretFolderVersion> {
    conn.query_row(
        "SELECT id, folder_id, ordinal, name, parent_version_id, children, is_deleted, created_at \
         FROM secret_folder_versions WHERE id = ?1",
        rusqlite::params![id],
        version_row,
    )
    .optional()?
    .ok_or_else(|| StoreError::NotFound {
        entity: "folder version",
        id: id.to_string(),
    })?
    .into_version()
}

fn with_current_version(
    conn: &Connection,
    folder: SecretFolder,
) -> StoreResult<(SecretFolder, SecretFolderVersion)> {
    let version = load_version(conn, &folder.current_version_id)?;
    Ok((folder, version))
}

fn find_root(conn: &Connection, project: &str, environment: &str) -> StoreResult<Option<SecretFolder>> {
    let row = conn
        .query_row(
            &format!(
                "SELECT {FOLDER_COLUMNS} FROM secret_folders \
                 WHERE project_id = ?1 AND environment = ?2 AND parent_id IS NULL"
            ),
            rusqlite::params![project, environment],
            folder_row,
        )
        .optional()?;
    Ok(row.map(|r| r.into_folder(SecretPath::root())))
}

/// The root folder of (project, environment), created if missing.
pub(crate) fn ensure_root(tx: &mut Tx<'_>, project: &str, environment: &str) -> StoreResult<SecretFolder> {
    if let Some(root) = find_root(tx.conn, project, environment)? {
        return Ok(root);
    }

    let id = Uuid::now_v7().to_string();
    tx.conn.execute(
        "INSERT INTO secret_folders (id, project_id, environment, parent_id, name, created_at, updated_at) \
         VALUES (?1, ?2, ?3, NULL, ?4, ?5, ?5)",
        rusqlite::params![id, project, environment, ROOT_FOLDER_NAME, tx.now],
    )?;
    append_version(tx, &id)?;
    debug!(project, environment, folder_id = %id, "root folder created");
    load(tx.conn, &id)
}

/// The live child `name` of `parent`, if any.
fn live_child(conn: &Connection, parent: &SecretFolder, name: &str) -> StoreResult<Option<SecretFolder>> {
    let row = conn
        .query_row(
            &format!(
                "SELECT {FOLDER_COLUMNS} FROM secret_folders \
                 WHERE parent_id = ?1 AND name = ?2 AND is_deleted = 0"
            ),
            rusqlite::params![parent.id, name],
            folder_row,
        )
        .optional()?;
    match row {
        Some(row) => {
            let path = parent.path.child(&row.name)?;
            Ok(Some(row.into_folder(path)))
        }
        None => Ok(None),
    }
}

fn create_child(tx: &mut Tx<'_>, parent: &SecretFolder, name: &str) -> StoreResult<SecretFolder> {
    let path = parent.path.child(name)?;
    let id = Uuid::now_v7().to_string();
    tx.conn.execute(
        "INSERT INTO secret_folders (id, project_id, environment, parent_id, name, created_at, updated_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
        rusqlite::params![id, parent.project, parent.environment, parent.id, name, tx.now],
    )?;
    // Parent first, so the child's first version points at the parent
    // version that lists it.
    append_version(tx, &parent.id)?;
    append_version(tx, &id)?;
    info!(folder_id = %id, path = %path, "folder created");
    load(tx.conn, &id)
}

/// Resolve `scope.path` to a live folder without creating anything.
pub(crate) fn resolve_existing(conn: &Connection, scope: &Scope) -> StoreResult<Option<SecretFolder>> {
    let Some(mut folder) = find_root(conn, &scope.project, &scope.environment)? else {
        return Ok(None);
    };
    for segment in scope.path.segments() {
        match live_child(conn, &folder, segment)? {
            Some(child) => folder = child,
            None => return Ok(None),
        }
    }
    Ok(Some(folder))
}

/// Resolve `scope.path` for a write: the root is created on demand, any
/// other missing segment is [`StoreError::NotFound`].
pub(crate) fn resolve_for_write(tx: &mut Tx<'_>, scope: &Scope) -> StoreResult<SecretFolder> {
    ensure_root(tx, &scope.project, &scope.environment)?;
    resolve_existing(tx.conn, scope)?.ok_or_else(|| not_found(scope))
}

/// Names of the live children of `folder_id`, sorted.
fn child_names(conn: &Connection, folder_id: &str) -> StoreResult<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT name FROM secret_folders WHERE parent_id = ?1 AND is_deleted = 0 ORDER BY name",
    )?;
    let names = stmt
        .query_map(rusqlite::params![folder_id], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(names)
}

/// Append a version capturing the folder's current structure.
pub(crate) fn append_version(tx: &mut Tx<'_>, folder_id: &str) -> StoreResult<SecretFolderVersion> {
    let (name, parent_id, is_deleted): (String, Option<String>, bool) = tx.conn.query_row(
        "SELECT name, parent_id, is_deleted FROM secret_folders WHERE id = ?1",
        rusqlite::params![folder_id],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
    )?;
    let parent_version_id: Option<String> = match &parent_id {
        Some(pid) => tx.conn.query_row(
            "SELECT current_version_id FROM secret_folders WHERE id = ?1",
            rusqlite::params![pid],
            |row| row.get(0),
        )?,
        None => None,
    };
    let ordinal: i64 = tx.conn.query_row(
        "SELECT COALESCE(MAX(ordinal), 0) + 1 FROM secret_folder_versions WHERE folder_id = ?1",
        rusqlite::params![folder_id],
        |row| row.get(0),
    )?;
    let children = child_names(tx.conn, folder_id)?;

    let version = SecretFolderVersion {
        id: Uuid::now_v7().to_string(),
        folder_id: folder_id.to_string(),
        ordinal,
        name,
        parent_version_id,
        children,
        is_deleted,
        created_at: tx.now,
    };

    tx.conn.execute(
        "INSERT INTO secret_folder_versions (id, folder_id, ordinal, name, parent_version_id, children, is_deleted, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        rusqlite::params![
            version.id,
            version.folder_id,
            version.ordinal,
            version.name,
            version.parent_version_id,
            serde_json::to_string(&version.children)?,
            version.is_deleted,
            version.created_at,
        ],
    )?;
    tx.conn.execute(
        "UPDATE secret_folders SET current_version_id = ?2, updated_at = ?3 WHERE id = ?1",
        rusqlite::params![folder_id, version.id, tx.now],
    )?;
    Ok(version)
}

/// Record a secret write inside `folder_id`.
pub(crate) fn touch_secrets(tx: &Tx<'_>, folder_id: &str) -> StoreResult<()> {
    tx.conn.execute(
        "UPDATE secret_folders SET secrets_revision = secrets_revision + 1, updated_at = ?2 WHERE id = ?1",
        rusqlite::params![folder_id, tx.now],
    )?;
    Ok(())
}

/// `folder` and all its live descendants with their depth below `folder`,
/// parents before children.
pub(crate) fn subtree(conn: &Connection, folder: &SecretFolder) -> StoreResult<Vec<(SecretFolder, i64)>> {
    let mut out = vec![(folder.clone(), 0)];
    let mut cursor = 0;
    while cursor < out.len() {
        let (parent, depth) = out[cursor].clone();
        for name in child_names(conn, &parent.id)? {
            if let Some(child) = live_child(conn, &parent, &name)? {
                out.push((child, depth + 1));
            }
        }
        cursor += 1;
    }
    Ok(out)
}

/// Bring a soft-deleted folder back.  Fails with [`StoreError::Conflict`]
/// if a live sibling has taken its name, or its parent is itself deleted.
pub(crate) fn revive(tx: &mut Tx<'_>, folder: &SecretFolder) -> StoreResult<()> {
    if !folder.is_deleted {
        return Ok(());
    }
    if let Some(parent_id) = &folder.parent_id {
        let parent = load(tx.conn, parent_id)?;
        if parent.is_deleted {
            return Err(StoreError::Conflict(format!(
                "cannot restore {}: parent folder is deleted",
                folder.path
            )));
        }
        if live_child(tx.conn, &parent, &folder.name)?.is_some() {
            return Err(StoreError::Conflict(format!(
                "cannot restore {}: a folder with that name exists",
                folder.path
            )));
        }
    }

    tx.conn.execute(
        "UPDATE secret_folders SET is_deleted = 0, updated_at = ?2 WHERE id = ?1",
        rusqlite::params![folder.id, tx.now],
    )?;
    append_version(tx, &folder.id)?;
    if let Some(parent_id) = &folder.parent_id {
        append_version(tx, parent_id)?;
    }
    info!(folder_id = %folder.id, "folder restored");
    Ok(())
}

/// Rebuild the path of a folder by walking its ancestors.
fn path_of(conn: &Connection, row: &FolderRow) -> StoreResult<SecretPath> {
    let mut names = Vec::new();
    let mut parent = row.parent_id.clone();
    if parent.is_some() {
        names.push(row.name.clone());
    }
    while let Some(pid) = parent {
        let (name, next): (String, Option<String>) = conn.query_row(
            "SELECT name, parent_id FROM secret_folders WHERE id = ?1",
            rusqlite::params![pid],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )?;
        if next.is_some() {
            names.push(name);
        }
        parent = next;
    }
    names.reverse();
    SecretPath::parse(&names.join("/"))
}

// ═══════════════════════════════════════════════════════════════════════
//  Row types
// ═══════════════════════════════════════════════════════════════════════

struct FolderRow {
    id: String,
    project: String,
    environment: String,
    parent_id: Option<String>,
    name: String,
    current_version_id: Option<String>,
    secrets_revision: i64,
    is_deleted: bool,
    created_at: i64,
    updated_at: i64,
}

impl FolderRow {
    fn into_folder(self, path: SecretPath) -> SecretFolder {
        SecretFolder {
            id: self.id,
            project: self.project,
            environment: self.environment,
            parent_id: self.parent_id,
            name: self.name,
            path,
            current_version_id: self.current_version_id.unwrap_or_default(),
            secrets_revision: self.secrets_revision,
            is_deleted: self.is_deleted,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

fn folder_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<FolderRow> {
    Ok(FolderRow {
        id: row.get(0)?,
        project: row.get(1)?,
        environment: row.get(2)?,
        parent_id: row.get(3)?,
        name: row.get(4)?,
        current_version_id: row.get(5)?,
        secrets_revision: row.get(6)?,
        is_deleted: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

struct FolderVersionRow {
    id: String,
    folder_id: String,
    ordinal: i64,
    name: String,
    parent_version_id: Option<String>,
    children: String,
    is_deleted: bool,
    created_at: i64,
}

impl FolderVersionRow {
    fn into_version(self) -> StoreResult<SecretFolderVersion> {
        Ok(SecretFolderVersion {
            id: self.id,
            folder_id: self.folder_id,
            ordinal: self.ordinal,
            name: self.name,
            parent_version_id: self.parent_version_id,
            children: serde_json::from_str(&self.children)?,
            is_deleted: self.is_deleted,
            created_at: self.created_at,
        })
    }
}

fn version_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<FolderVersionRow> {
    Ok(FolderVersionRow {
        id: row.get(0)?,
        folder_id: row.get(1)?,
        ordinal: row.get(2)?,
        name: row.get(3)?,
        parent_version_id: row.get(4)?,
        children: row.get(5)?,
        is_deleted: row.get(6)?,
        created_at: row.get(7)?,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use sigil_kernel::EventBus;
    use sigil_vault::{AesGcmEnvelope, KeyRef};

    use super::*;
    use crate::db::Database;
    use crate::scope::{Principal, ScopeGrant};

    struct Fixture {
        backend: Backend,
        folders: FolderManager,
        ctx: OpContext,
    }

    async fn fixture() -> Fixture {
        let db = Database::open_in_memory().unwrap();
        db.run_migrations().await.unwrap();
        let backend = Backend::new(db, Arc::new(AesGcmEnvelope), EventBus::new(16));
        let principal = Principal::new("alice").with_grant(ScopeGrant::project_wide("billing"));
        Fixture {
            folders: FolderManager::new(backend.clone()),
            backend,
            ctx: OpContext::new(principal, KeyRef::generate("billing").unwrap()),
        }
    }

    fn dev(path: &str) -> Scope {
        Scope::new("billing", "dev", path).unwrap()
    }

    #[tokio::test]
    async fn subtree_lists_each_level_before_the_next() {
        let fx = fixture().await;
        for path in ["/b/y", "/a/z", "/a/x"] {
            fx.folders.ensure_path(&fx.ctx, &dev(path)).await.unwrap();
        }

        let root = fx.folders.get(&fx.ctx, &dev("/")).await.unwrap();
        let walk = fx
            .backend
            .read(&fx.ctx, move |tx| subtree(tx.conn, &root))
            .await
            .unwrap();

        let listed: Vec<(String, i64)> = walk
            .iter()
            .map(|(folder, depth)| (folder.path.to_string(), *depth))
            .collect();
        let expected: Vec<(String, i64)> = [
            ("/", 0),
            ("/a", 1),
            ("/b", 1),
            ("/a/x", 2),
            ("/a/z", 2),
            ("/b/y", 2),
        ]
        .into_iter()
        .map(|(path, depth)| (path.to_string(), depth))
        .collect();
        assert_eq!(listed, expected);
    }

    #[tokio::test]
    async fn subtree_skips_deleted_folders() {
        let fx = fixture().await;
        fx.folders.ensure_path(&fx.ctx, &dev("/app")).await.unwrap();
        fx.folders.ensure_path(&fx.ctx, &dev("/old")).await.unwrap();
        fx.folders.delete_folder(&fx.ctx, &dev("/old")).await.unwrap();

        let root = fx.folders.get(&fx.ctx, &dev("/")).await.unwrap();
        let walk = fx
            .backend
            .read(&fx.ctx, move |tx| subtree(tx.conn, &root))
            .await
            .unwrap();
        let paths: Vec<String> = walk.iter().map(|(f, _)| f.path.to_string()).collect();
        assert_eq!(paths, vec!["/".to_string(), "/app".to_string()]);
    }

    #[tokio::test]
    async fn revive_restores_folder_and_records_versions() {
        let fx = fixture().await;
        let old = fx.folders.ensure_path(&fx.ctx, &dev("/old")).await.unwrap();
        fx.folders.delete_folder(&fx.ctx, &dev("/old")).await.unwrap();
        assert!(matches!(
            fx.folders.get(&fx.ctx, &dev("/old")).await,
            Err(StoreError::NotFound { .. })
        ));

        let id = old.id.clone();
        fx.backend
            .write(&fx.ctx, move |tx| {
                let deleted = load(tx.conn, &id)?;
                assert!(deleted.is_deleted);
                revive(tx, &deleted)
            })
            .await
            .unwrap();

        let back = fx.folders.get(&fx.ctx, &dev("/old")).await.unwrap();
        assert_eq!(back.id, old.id);
        let versions = fx.folders.list_versions(&fx.ctx, &dev("/old")).await.unwrap();
        let deleted_flags: Vec<bool> = versions.iter().map(|v| v.is_deleted).collect();
        assert_eq!(deleted_flags, vec![false, true, false]);

        let root_versions = fx.folders.list_versions(&fx.ctx, &dev("/")).await.unwrap();
        let last = root_versions.last().unwrap();
        assert_eq!(last.children, vec!["old".to_string()]);
    }

    #[tokio::test]
    async fn revive_refuses_a_taken_name() {
        let fx = fixture().await;
        let old = fx.folders.ensure_path(&fx.ctx, &dev("/old")).await.unwrap();
        fx.folders.delete_folder(&fx.ctx, &dev("/old")).await.unwrap();
        let replacement = fx.folders.ensure_path(&fx.ctx, &dev("/old")).await.unwrap();
        assert_ne!(replacement.id, old.id);

        let id = old.id.clone();
        let err = fx
            .backend
            .write(&fx.ctx, move |tx| {
                let deleted = load(tx.conn, &id)?;
                revive(tx, &deleted)
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn upsert_on_a_stale_parent_version_fails() {
        let fx = fixture().await;
        let (_, root_v1) = fx.folders.root(&fx.ctx, "billing", "dev").await.unwrap();
        let (app, _) = fx.folders.upsert_folder(&fx.ctx, &root_v1.id, "app").await.unwrap();
        assert_eq!(app.path.as_str(), "/app");

        let err = fx
            .folders
            .upsert_folder(&fx.ctx, &root_v1.id, "web")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::VersionMismatch { expected: 1, actual: 2, .. }
        ));
    }
}
