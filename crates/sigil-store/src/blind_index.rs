//! Per-project blind index keys and name lookup.
//!
//! Each project gets one random salt, stored sealed under the project key
//! in `secret_blind_indexes`.  Every live secret has one row in
//! `secret_index_entries` mapping its token to its id.  Tokens are not
//! unique: a lookup returns candidates and the caller confirms each one by
//! opening the sealed name.

use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use sigil_vault::{BlindIndexSalt, BlindIndexToken};
use tracing::{info, instrument};

use crate::error::{StoreError, StoreResult};
use crate::folders;
use crate::scope::{OpContext, Scope};
use crate::secrets::SecretType;
use crate::tx::{Backend, Tx, sealed_from_columns};

/// A secret found through its blind index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexHit {
    pub secret_id: String,
    pub secret_type: SecretType,
}

/// Registers project index keys and computes and searches tokens.
#[derive(Clone)]
pub struct BlindIndexEngine {
    backend: Backend,
}

impl BlindIndexEngine {
    pub(crate) fn new(backend: Backend) -> Self {
        Self { backend }
    }

    /// Create the project's blind index salt, sealed under `ctx.key`.
    ///
    /// Returns `false` when the project already has one; the existing salt
    /// is kept so stored tokens stay valid.
    #[instrument(skip(self, ctx), fields(actor = %ctx.actor()))]
    pub async fn register_key(&self, ctx: &OpContext, project: &str) -> StoreResult<bool> {
        ctx.principal.authorize_project(project)?;
        let project = project.to_string();

        self.backend
            .write(ctx, move |tx| {
                let exists: Option<String> = tx
                    .conn
                    .query_row(
                        "SELECT project_id FROM secret_blind_indexes WHERE project_id = ?1",
                        rusqlite::params![project],
                        |row| row.get(0),
                    )
                    .optional()?;
                if exists.is_some() {
                    return Ok(false);
                }

                let salt = BlindIndexSalt::generate()?;
                let sealed = tx.seal(salt.as_bytes())?;
                tx.conn.execute(
                    "INSERT INTO secret_blind_indexes \
                     (project_id, salt_ciphertext, salt_nonce, algorithm, key_encoding, key_id, created_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    rusqlite::params![
                        project,
                        sealed.ciphertext,
                        sealed.nonce,
                        sealed.algorithm.as_str(),
                        sealed.key_encoding.as_str(),
                        sealed.key_id,
                        tx.now,
                    ],
                )?;
                info!(project = %project, "blind index key registered");
                Ok(true)
            })
            .await
    }

    /// Compute the token for `name` in `scope`'s project.
    ///
    /// Fails with [`StoreError::InvalidScope`] if the project has no key.
    #[instrument(skip(self, ctx, name), fields(actor = %ctx.actor()))]
    pub async fn index(
        &self,
        ctx: &OpContext,
        scope: &Scope,
        name: &str,
    ) -> StoreResult<BlindIndexToken> {
        ctx.authorize(scope)?;
        let project = scope.project.clone();
        let name = name.to_string();
        self.backend
            .read(ctx, move |tx| name_token(tx, &project, &name))
            .await
    }

    /// Find a live secret in `scope` whose token is `token`.
    ///
    /// Shared secrets win over the caller's personal secret; other
    /// principals' personal secrets are never returned.
    #[instrument(skip(self, ctx, token), fields(actor = %ctx.actor()))]
    pub async fn search(
        &self,
        ctx: &OpContext,
        scope: &Scope,
        token: &BlindIndexToken,
    ) -> StoreResult<Option<IndexHit>> {
        ctx.authorize(scope)?;
        let scope = scope.clone();
        let token = token.clone();

        self.backend
            .read(ctx, move |tx| {
                project_salt(tx, &scope.project)?;
                let Some(folder) = folders::resolve_existing(tx.conn, &scope)? else {
                    return Ok(None);
                };
                let hits = candidates(tx.conn, &folder.id, &token)?;
                let shared = hits.iter().find(|c| c.secret_type == SecretType::Shared);
                let personal = hits.iter().find(|c| {
                    c.secret_type == SecretType::Personal
                        && c.owner.as_deref() == Some(tx.actor.as_str())
                });
                Ok(shared.or(personal).map(|c| IndexHit {
                    secret_id: c.secret_id.clone(),
                    secret_type: c.secret_type,
                }))
            })
            .await
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Transaction-level helpers
// ═══════════════════════════════════════════════════════════════════════

/// An index entry sharing a token, not yet confirmed by name.
#[derive(Debug, Clone)]
pub(crate) struct Candidate {
    pub secret_id: String,
    pub secret_type: SecretType,
    pub owner: Option<String>,
}

/// Open the project's salt with the caller's key.
pub(crate) fn project_salt(tx: &Tx<'_>, project: &str) -> StoreResult<BlindIndexSalt> {
    let row: Option<(Vec<u8>, Vec<u8>, String, String, String)> = tx
        .conn
        .query_row(
            "SELECT salt_ciphertext, salt_nonce, algorithm, key_encoding, key_id \
             FROM secret_blind_indexes WHERE project_id = ?1",
            rusqlite::params![project],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
        )
        .optional()?;
    let (ciphertext, nonce, algorithm, encoding, key_id) =
        row.ok_or_else(|| StoreError::InvalidScope {
            project: project.to_string(),
        })?;

    let sealed = sealed_from_columns(ciphertext, nonce, &algorithm, &encoding, key_id)?;
    Ok(BlindIndexSalt::from_bytes(tx.open(&sealed)?)?)
}

pub(crate) fn name_token(tx: &Tx<'_>, project: &str, name: &str) -> StoreResult<BlindIndexToken> {
    Ok(project_salt(tx, project)?.token(name))
}

/// Live index entries in `folder_id` carrying `token`.
pub(crate) fn candidates(
    conn: &Connection,
    folder_id: &str,
    token: &BlindIndexToken,
) -> StoreResult<Vec<Candidate>> {
    let mut stmt = conn.prepare(
        "SELECT secret_id, type, owner_id FROM secret_index_entries \
         WHERE folder_id = ?1 AND token = ?2 ORDER BY secret_id",
    )?;
    let rows = stmt
        .query_map(rusqlite::params![folder_id, token.as_str()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|(secret_id, kind, owner)| {
            let secret_type = SecretType::parse(&kind).ok_or_else(|| {
                StoreError::InvalidArgument(format!("unknown secret type `{kind}`"))
            })?;
            Ok(Candidate {
                secret_id,
                secret_type,
                owner,
            })
        })
        .collect()
}

/// Insert or replace the index entry of a live secret.
#[allow(clippy::too_many_arguments)]
pub(crate) fn put_entry(
    conn: &Connection,
    secret_id: &str,
    project: &str,
    environment: &str,
    folder_id: &str,
    secret_type: SecretType,
    owner: Option<&str>,
    token: &BlindIndexToken,
) -> StoreResult<()> {
    conn.execute(
        "INSERT OR REPLACE INTO secret_index_entries \
         (secret_id, project_id, environment, folder_id, type, owner_id, token) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        rusqlite::params![
            secret_id,
            project,
            environment,
            folder_id,
            secret_type.as_str(),
            owner,
            token.as_str(),
        ],
    )?;
    Ok(())
}

/// Drop the index entry of a secret that is no longer live.
pub(crate) fn remove_entry(conn: &Connection, secret_id: &str) -> StoreResult<()> {
    conn.execute(
        "DELETE FROM secret_index_entries WHERE secret_id = ?1",
        rusqlite::params![secret_id],
    )?;
    Ok(())
}
