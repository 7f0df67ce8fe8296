//! Read-only secret imports between folders of one project.
//!
//! A folder keeps an ordered list of (environment, path) sources.  Its
//! effective secrets are the sources' secrets, later imports overriding
//! earlier ones by name, overridden in turn by the folder's own secrets.
//! Imports are not followed transitively.

use std::collections::BTreeMap;

use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};
use crate::folders;
use crate::scope::{OpContext, Scope, SecretPath};
use crate::secrets::{self, Secret};
use crate::tx::Backend;

/// One import of a folder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretImport {
    pub id: String,
    /// The importing folder.
    pub folder_id: String,
    /// 1-based order; higher positions override lower ones.
    pub position: i64,
    pub source_environment: String,
    pub source_path: SecretPath,
    pub created_by: String,
    pub created_at: i64,
}

#[derive(Clone)]
pub struct ImportManager {
    backend: Backend,
}

impl ImportManager {
    pub(crate) fn new(backend: Backend) -> Self {
        Self { backend }
    }

    /// Append `source_environment:source_path` to the import list of the
    /// folder at `scope.path`.
    #[instrument(skip(self, ctx), fields(actor = %ctx.actor(), scope = %scope))]
    pub async fn add_import(
        &self,
        ctx: &OpContext,
        scope: &Scope,
        source_environment: &str,
        source_path: &str,
    ) -> StoreResult<SecretImport> {
        let source = Scope::new(scope.project.clone(), source_environment, source_path)?;
        ctx.authorize(scope)?;
        ctx.authorize(&source)?;
        let scope = scope.clone();

        self.backend
            .write(ctx, move |tx| {
                let folder = folders::resolve_for_write(tx, &scope)?;
                let source_folder =
                    folders::resolve_existing(tx.conn, &source)?.ok_or_else(|| StoreError::NotFound {
                        entity: "folder",
                        id: source.to_string(),
                    })?;
                if source_folder.id == folder.id {
                    return Err(StoreError::Conflict(format!("{scope} cannot import itself")));
                }

                let existing: Option<String> = tx
                    .conn
                    .query_row(
                        "SELECT id FROM secret_imports \
                         WHERE folder_id = ?1 AND source_environment = ?2 AND source_path = ?3",
                        rusqlite::params![folder.id, source.environment, source.path.as_str()],
                        |row| row.get(0),
                    )
                    .optional()?;
                if existing.is_some() {
                    return Err(StoreError::Conflict(format!("{scope} already imports {source}")));
                }

                let position: i64 = tx.conn.query_row(
                    "SELECT COALESCE(MAX(position), 0) + 1 FROM secret_imports WHERE folder_id = ?1",
                    rusqlite::params![folder.id],
                    |row| row.get(0),
                )?;
                let id = Uuid::now_v7().to_string();
                tx.conn.execute(
                    "INSERT INTO secret_imports \
                     (id, folder_id, position, source_environment, source_path, created_by, created_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    rusqlite::params![
                        id,
                        folder.id,
                        position,
                        source.environment,
                        source.path.as_str(),
                        tx.actor,
                        tx.now,
                    ],
                )?;
                info!(import_id = %id, source = %source, position, "import added");
                load_import(tx.conn, &id)
            })
            .await
    }

    #[instrument(skip(self, ctx), fields(actor = %ctx.actor()))]
    pub async fn remove_import(&self, ctx: &OpContext, import_id: &str) -> StoreResult<()> {
        let import_id = import_id.to_string();
        let principal = ctx.principal.clone();
        self.backend
            .write(ctx, move |tx| {
                let import = load_import(tx.conn, &import_id)?;
                let folder = folders::load(tx.conn, &import.folder_id)?;
                principal.authorize(&folder.scope())?;
                tx.conn.execute(
                    "DELETE FROM secret_imports WHERE id = ?1",
                    rusqlite::params![import_id],
                )?;
                info!(import_id = %import_id, "import removed");
                Ok(())
            })
            .await
    }

    /// Imports of the folder at `scope.path`, in order.
    pub async fn list_imports(&self, ctx: &OpContext, scope: &Scope) -> StoreResult<Vec<SecretImport>> {
        ctx.authorize(scope)?;
        let scope = scope.clone();
        self.backend
            .read(ctx, move |tx| {
                match folders::resolve_existing(tx.conn, &scope)? {
                    Some(folder) => imports_of(tx.conn, &folder.id),
                    None => Ok(Vec::new()),
                }
            })
            .await
    }

    /// Secrets visible in the folder at `scope.path` once imports are
    /// applied, ordered by name.
    #[instrument(skip(self, ctx), fields(actor = %ctx.actor(), scope = %scope))]
    pub async fn effective_secrets(&self, ctx: &OpContext, scope: &Scope) -> StoreResult<Vec<Secret>> {
        ctx.authorize(scope)?;
        let scope = scope.clone();
        let principal = ctx.principal.clone();

        self.backend
            .read(ctx, move |tx| {
                let Some(folder) = folders::resolve_existing(tx.conn, &scope)? else {
                    return Ok(Vec::new());
                };

                let mut merged: BTreeMap<String, Secret> = BTreeMap::new();
                for import in imports_of(tx.conn, &folder.id)? {
                    let source = Scope {
                        project: folder.project.clone(),
                        environment: import.source_environment.clone(),
                        path: import.source_path.clone(),
                    };
                    principal.authorize(&source)?;
                    let Some(source_folder) = folders::resolve_existing(tx.conn, &source)? else {
                        debug!(import_id = %import.id, "import source no longer exists");
                        continue;
                    };
                    merged.extend(secrets::visible_by_name(tx, &source_folder)?);
                }
                merged.extend(secrets::visible_by_name(tx, &folder)?);
                Ok(merged.into_values().collect())
            })
            .await
    }
}

fn imports_of(conn: &Connection, folder_id: &str) -> StoreResult<Vec<SecretImport>> {
    let ids: Vec<String> = {
        let mut stmt = conn.prepare("SELECT id FROM secret_imports WHERE folder_id = ?1 ORDER BY position")?;
        stmt.query_map(rusqlite::params![folder_id], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?
    };
    ids.iter().map(|id| load_import(conn, id)).collect()
}

fn load_import(conn: &Connection, import_id: &str) -> StoreResult<SecretImport> {
    let row = conn
        .query_row(
            "SELECT id, folder_id, position, source_environment, source_path, created_by, created_at \
             FROM secret_imports WHERE id = ?1",
            rusqlite::params![import_id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, i64>(6)?,
                ))
            },
        )
        .optional()?
        .ok_or_else(|| StoreError::NotFound {
            entity: "import",
            id: import_id.to_string(),
        })?;

    let (id, folder_id, position, source_environment, source_path, created_by, created_at) = row;
    Ok(SecretImport {
        id,
        folder_id,
        position,
        source_environment,
        source_path: SecretPath::parse(&source_path)?,
        created_by,
        created_at,
    })
}
