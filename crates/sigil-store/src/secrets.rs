//! Versioned, encrypted secrets.
//!
//! A secret is an identity row plus an append-only chain of
//! [`SecretVersion`]s.  Names and values are sealed with the caller's key;
//! lookups by name go through the blind index.  Deleting a secret appends a
//! deletion marker version instead of removing anything, so the full
//! history stays readable.
//!
//! Writes to shared secrets under a path covered by an approval policy are
//! refused with [`StoreError::ApprovalRequired`]; such changes go through
//! [`crate::approvals::ApprovalEngine::submit`].

use std::collections::BTreeMap;

use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use sigil_kernel::{DomainEvent, EventKind};
use sigil_vault::{BlindIndexToken, EnvelopeAdapter, Sealed};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::approvals;
use crate::blind_index;
use crate::error::{StoreError, StoreResult};
use crate::folders::{self, SecretFolder};
use crate::scope::{OpContext, Principal, Scope, SecretPath, validate_secret_name};
use crate::tx::{Backend, Tx, sealed_from_columns};

// ═══════════════════════════════════════════════════════════════════════
//  Types
// ═══════════════════════════════════════════════════════════════════════

/// Whether a secret is visible to the whole scope or to one principal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecretType {
    Shared,
    /// Owned by one principal; overrides a shared secret of the same name
    /// for that principal only.
    Personal,
}

impl SecretType {
    /// Convert to the string stored in SQLite.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Shared => "shared",
            Self::Personal => "personal",
        }
    }

    /// Parse from the string stored in SQLite.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "shared" => Some(Self::Shared),
            "personal" => Some(Self::Personal),
            _ => None,
        }
    }
}

impl std::fmt::Display for SecretType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One immutable version of a secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretVersion {
    pub id: String,
    pub secret_id: String,
    /// 1-based, strictly increasing per secret.
    pub ordinal: i64,
    /// Sealed value; `None` only for deletion markers.
    pub value: Option<Sealed>,
    pub blind_index: BlindIndexToken,
    pub tags: Vec<String>,
    pub is_deletion_marker: bool,
    /// Principal that authored this version.
    pub author: String,
    pub created_at: i64,
}

/// A secret with its decrypted name and current version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Secret {
    pub id: String,
    pub project: String,
    pub environment: String,
    pub folder_id: String,
    pub path: SecretPath,
    pub name: String,
    pub secret_type: SecretType,
    /// Owning principal of a personal secret.
    pub owner: Option<String>,
    pub version: SecretVersion,
    pub is_deleted: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Secret {
    pub fn scope(&self) -> Scope {
        Scope {
            project: self.project.clone(),
            environment: self.environment.clone(),
            path: self.path.clone(),
        }
    }
}

/// Deduplicate tags, keeping first occurrence order and dropping blanks.
pub fn normalize_tags(tags: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for tag in tags {
        let tag = tag.trim().to_string();
        if !tag.is_empty() && !out.contains(&tag) {
            out.push(tag);
        }
    }
    out
}

// ═══════════════════════════════════════════════════════════════════════
//  SecretStore
// ═══════════════════════════════════════════════════════════════════════

/// Create, update, delete and read secrets.
#[derive(Clone)]
pub struct SecretStore {
    backend: Backend,
}

impl SecretStore {
    pub(crate) fn new(backend: Backend) -> Self {
        Self { backend }
    }

    /// Create a secret in the folder at `scope.path`.
    ///
    /// Fails with [`StoreError::Conflict`] if a live secret of the same
    /// type (and owner, for personal secrets) already has this name,
    /// compared case-insensitively.
    #[instrument(skip(self, ctx, name, value, tags), fields(actor = %ctx.actor(), scope = %scope))]
    pub async fn create_secret(
        &self,
        ctx: &OpContext,
        scope: &Scope,
        name: &str,
        secret_type: SecretType,
        value: &str,
        tags: Vec<String>,
    ) -> StoreResult<Secret> {
        ctx.authorize(scope)?;
        validate_secret_name(name)?;
        let scope = scope.clone();
        let name = name.to_string();
        let value = value.to_string();

        self.backend
            .write(ctx, move |tx| {
                let folder = folders::resolve_for_write(tx, &scope)?;
                if secret_type == SecretType::Shared {
                    require_no_policy(tx.conn, &folder, &[scope.path.secret_path(&name)])?;
                }
                let owner = owner_for(secret_type, &tx.actor);
                let sealed = tx.seal(value.as_bytes())?;
                insert(tx, &folder, &name, secret_type, owner.as_deref(), sealed, normalize_tags(tags))
            })
            .await
    }

    /// Append a new version with `new_value`.
    ///
    /// `expected_version` must equal the secret's latest ordinal, otherwise
    /// [`StoreError::VersionMismatch`].  `tags: None` keeps the previous
    /// version's tags.
    #[instrument(skip(self, ctx, new_value, tags), fields(actor = %ctx.actor()))]
    pub async fn update_secret(
        &self,
        ctx: &OpContext,
        secret_id: &str,
        new_value: &str,
        expected_version: i64,
        tags: Option<Vec<String>>,
    ) -> StoreResult<SecretVersion> {
        let secret_id = secret_id.to_string();
        let new_value = new_value.to_string();
        let principal = ctx.principal.clone();

        self.backend
            .write(ctx, move |tx| {
                let row = load_visible(tx, &principal, &secret_id)?;
                guard_policy(tx, &row)?;
                let sealed = tx.seal(new_value.as_bytes())?;
                append(tx, &row, sealed, tags.map(normalize_tags), expected_version)
            })
            .await
    }

    /// Mark a secret deleted by appending a deletion marker version.
    ///
    /// With `expected_version` set, fails on a concurrent change like
    /// [`SecretStore::update_secret`].
    #[instrument(skip(self, ctx), fields(actor = %ctx.actor()))]
    pub async fn delete_secret(
        &self,
        ctx: &OpContext,
        secret_id: &str,
        expected_version: Option<i64>,
    ) -> StoreResult<SecretVersion> {
        let secret_id = secret_id.to_string();
        let principal = ctx.principal.clone();

        self.backend
            .write(ctx, move |tx| {
                let row = load_visible(tx, &principal, &secret_id)?;
                guard_policy(tx, &row)?;
                tombstone(tx, &row, expected_version)
            })
            .await
    }

    /// Load a secret by id, including deleted ones.
    #[instrument(skip(self, ctx))]
    pub async fn get(&self, ctx: &OpContext, secret_id: &str) -> StoreResult<Secret> {
        let secret_id = secret_id.to_string();
        let principal = ctx.principal.clone();
        self.backend
            .read(ctx, move |tx| {
                let row = load_visible(tx, &principal, &secret_id)?;
                hydrate(tx, row)
            })
            .await
    }

    /// Find the live secret of `secret_type` named `name` in `scope`.
    #[instrument(skip(self, ctx, name), fields(scope = %scope))]
    pub async fn get_by_name(
        &self,
        ctx: &OpContext,
        scope: &Scope,
        name: &str,
        secret_type: SecretType,
    ) -> StoreResult<Secret> {
        ctx.authorize(scope)?;
        let scope = scope.clone();
        let name = name.to_string();

        self.backend
            .read(ctx, move |tx| {
                let owner = owner_for(secret_type, &tx.actor);
                let folder = folders::resolve_existing(tx.conn, &scope)?;
                let found = match &folder {
                    Some(folder) => find_live(tx, folder, &name, secret_type, owner.as_deref())?,
                    None => None,
                };
                match found {
                    Some(row) => hydrate(tx, row),
                    None => Err(StoreError::NotFound {
                        entity: "secret",
                        id: format!("{scope} ({secret_type})"),
                    }),
                }
            })
            .await
    }

    /// The value the caller sees for `name`: their personal secret if one
    /// exists, otherwise the shared one.
    #[instrument(skip(self, ctx, name), fields(scope = %scope))]
    pub async fn resolve(&self, ctx: &OpContext, scope: &Scope, name: &str) -> StoreResult<Secret> {
        ctx.authorize(scope)?;
        let scope = scope.clone();
        let name = name.to_string();

        self.backend
            .read(ctx, move |tx| {
                let Some(folder) = folders::resolve_existing(tx.conn, &scope)? else {
                    return Err(StoreError::NotFound {
                        entity: "secret",
                        id: scope.to_string(),
                    });
                };
                match resolve_in_folder(tx, &folder, &name)? {
                    Some(row) => hydrate(tx, row),
                    None => Err(StoreError::NotFound {
                        entity: "secret",
                        id: scope.to_string(),
                    }),
                }
            })
            .await
    }

    /// Every version of a secret, oldest first, deletion markers included.
    #[instrument(skip(self, ctx))]
    pub async fn list_versions(
        &self,
        ctx: &OpContext,
        secret_id: &str,
    ) -> StoreResult<Vec<SecretVersion>> {
        let secret_id = secret_id.to_string();
        let principal = ctx.principal.clone();
        self.backend
            .read(ctx, move |tx| {
                load_visible(tx, &principal, &secret_id)?;
                versions_of(tx.conn, &secret_id)
            })
            .await
    }

    /// One version of a secret by ordinal.
    #[instrument(skip(self, ctx))]
    pub async fn get_version(
        &self,
        ctx: &OpContext,
        secret_id: &str,
        ordinal: i64,
    ) -> StoreResult<SecretVersion> {
        let secret_id = secret_id.to_string();
        let principal = ctx.principal.clone();
        self.backend
            .read(ctx, move |tx| {
                load_visible(tx, &principal, &secret_id)?;
                let id: Option<String> = tx
                    .conn
                    .query_row(
                        "SELECT id FROM secret_versions WHERE secret_id = ?1 AND ordinal = ?2",
                        rusqlite::params![secret_id, ordinal],
                        |row| row.get(0),
                    )
                    .optional()?;
                let id = id.ok_or_else(|| StoreError::NotFound {
                    entity: "secret version",
                    id: format!("{secret_id}@{ordinal}"),
                })?;
                load_version(tx.conn, &id)
            })
            .await
    }

    /// Live secrets visible to the caller in the folder at `scope.path`,
    /// sorted by name.  An absent folder lists as empty.
    #[instrument(skip(self, ctx), fields(scope = %scope))]
    pub async fn list_secrets(&self, ctx: &OpContext, scope: &Scope) -> StoreResult<Vec<Secret>> {
        ctx.authorize(scope)?;
        let scope = scope.clone();

        self.backend
            .read(ctx, move |tx| {
                let Some(folder) = folders::resolve_existing(tx.conn, &scope)? else {
                    return Ok(Vec::new());
                };
                let mut out = Vec::new();
                for row in live_in_folder(tx.conn, &folder.id)? {
                    if row.visible_to(&tx.actor) {
                        out.push(hydrate(tx, row)?);
                    }
                }
                out.sort_by(|a, b| a.name.cmp(&b.name).then(a.secret_type.as_str().cmp(b.secret_type.as_str())));
                Ok(out)
            })
            .await
    }

    /// Decrypt a version's value with the caller's key.
    ///
    /// Fails with [`StoreError::InvalidArgument`] for deletion markers.
    pub fn reveal(&self, ctx: &OpContext, version: &SecretVersion) -> StoreResult<String> {
        let sealed = version.value.as_ref().ok_or_else(|| {
            StoreError::InvalidArgument(format!(
                "version {} of secret {} is a deletion marker",
                version.ordinal, version.secret_id
            ))
        })?;
        Ok(self.backend.envelope.decrypt_string(sealed, &ctx.key)?)
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Transaction-level operations
// ═══════════════════════════════════════════════════════════════════════

fn owner_for(secret_type: SecretType, actor: &str) -> Option<String> {
    match secret_type {
        SecretType::Shared => None,
        SecretType::Personal => Some(actor.to_string()),
    }
}

/// Refuse a direct write to a shared secret under an approval policy.
fn require_no_policy(conn: &Connection, folder: &SecretFolder, secret_paths: &[String]) -> StoreResult<()> {
    match approvals::covering_policy(conn, &folder.project, &folder.environment, &folder.path, secret_paths)? {
        Some(policy) => Err(StoreError::ApprovalRequired {
            policy_id: policy.id,
        }),
        None => Ok(()),
    }
}

fn guard_policy(tx: &Tx<'_>, row: &SecretRow) -> StoreResult<()> {
    if row.secret_type != SecretType::Shared {
        return Ok(());
    }
    let folder = folders::load(tx.conn, &row.folder_id)?;
    let name = open_name(tx, row)?;
    require_no_policy(tx.conn, &folder, &[folder.path.secret_path(&name)])
}

/// Load a secret the principal may see: scope granted, and for personal
/// secrets, owned by the principal.  Anything else is `NotFound`.
pub(crate) fn load_visible(tx: &Tx<'_>, principal: &Principal, secret_id: &str) -> StoreResult<SecretRow> {
    let row = load_row(tx.conn, secret_id)?;
    if !row.visible_to(&principal.id) {
        return Err(StoreError::NotFound {
            entity: "secret",
            id: secret_id.to_string(),
        });
    }
    let folder = folders::load(tx.conn, &row.folder_id)?;
    principal.authorize(&folder.scope())?;
    Ok(row)
}

const SECRET_COLUMNS: &str = "id, project_id, environment, folder_id, type, owner_id, name_sealed, \
                              current_version_id, latest_ordinal, is_deleted, created_at, updated_at";

pub(crate) fn load_row(conn: &Connection, secret_id: &str) -> StoreResult<SecretRow> {
    conn.query_row(
        &format!("SELECT {SECRET_COLUMNS} FROM secrets WHERE id = ?1"),
        rusqlite::params![secret_id],
        secret_row,
    )
    .optional()?
    .ok_or_else(|| StoreError::NotFound {
        entity: "secret",
        id: secret_id.to_string(),
    })?
}

/// Live secrets in a folder, both types, all owners.
pub(crate) fn live_in_folder(conn: &Connection, folder_id: &str) -> StoreResult<Vec<SecretRow>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {SECRET_COLUMNS} FROM secrets WHERE folder_id = ?1 AND is_deleted = 0 ORDER BY id"
    ))?;
    let rows = stmt
        .query_map(rusqlite::params![folder_id], secret_row)?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter().collect()
}

pub(crate) fn open_name(tx: &Tx<'_>, row: &SecretRow) -> StoreResult<String> {
    let sealed: Sealed = serde_json::from_str(&row.name_sealed)?;
    tx.open_string(&sealed)
}

/// Find the live secret called `name` (case-insensitive) among index
/// candidates, confirming each by its decrypted name.
pub(crate) fn find_live(
    tx: &Tx<'_>,
    folder: &SecretFolder,
    name: &str,
    secret_type: SecretType,
    owner: Option<&str>,
) -> StoreResult<Option<SecretRow>> {
    let token = blind_index::name_token(tx, &folder.project, name)?;
    let wanted = name.to_lowercase();
    for candidate in blind_index::candidates(tx.conn, &folder.id, &token)? {
        if candidate.secret_type != secret_type || candidate.owner.as_deref() != owner {
            continue;
        }
        let row = load_row(tx.conn, &candidate.secret_id)?;
        if open_name(tx, &row)?.to_lowercase() == wanted {
            return Ok(Some(row));
        }
    }
    Ok(None)
}

/// The caller's personal secret `name`, else the shared one.
pub(crate) fn resolve_in_folder(
    tx: &Tx<'_>,
    folder: &SecretFolder,
    name: &str,
) -> StoreResult<Option<SecretRow>> {
    let actor = tx.actor.clone();
    if let Some(row) = find_live(tx, folder, name, SecretType::Personal, Some(&actor))? {
        return Ok(Some(row));
    }
    find_live(tx, folder, name, SecretType::Shared, None)
}

/// Create the identity row, first version and index entry of a secret.
pub(crate) fn insert(
    tx: &mut Tx<'_>,
    folder: &SecretFolder,
    name: &str,
    secret_type: SecretType,
    owner: Option<&str>,
    value: Sealed,
    tags: Vec<String>,
) -> StoreResult<Secret> {
    validate_secret_name(name)?;
    if find_live(tx, folder, name, secret_type, owner)?.is_some() {
        return Err(StoreError::Conflict(format!(
            "a {secret_type} secret with this name already exists in {}",
            folder.path
        )));
    }

    let token = blind_index::name_token(tx, &folder.project, name)?;
    let name_sealed = serde_json::to_string(&tx.seal(name.as_bytes())?)?;
    let id = Uuid::now_v7().to_string();

    tx.conn.execute(
        "INSERT INTO secrets (id, project_id, environment, folder_id, type, owner_id, name_sealed, created_at, updated_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
        rusqlite::params![
            id,
            folder.project,
            folder.environment,
            folder.id,
            secret_type.as_str(),
            owner,
            name_sealed,
            tx.now,
        ],
    )?;
    let version = push_version(tx, &id, 1, Some(&value), &token, &tags, false)?;
    blind_index::put_entry(
        tx.conn,
        &id,
        &folder.project,
        &folder.environment,
        &folder.id,
        secret_type,
        owner,
        &token,
    )?;
    folders::touch_secrets(tx, &folder.id)?;

    let event = DomainEvent::new(
        EventKind::SecretCreated,
        &folder.project,
        &folder.environment,
        folder.path.as_str(),
        &tx.actor,
        &id,
    )
    .with_detail(serde_json::json!({
        "version": 1,
        "version_id": version.id,
        "type": secret_type.as_str(),
    }));
    tx.emit(event);
    info!(secret_id = %id, folder_id = %folder.id, "secret created");

    Ok(Secret {
        id,
        project: folder.project.clone(),
        environment: folder.environment.clone(),
        folder_id: folder.id.clone(),
        path: folder.path.clone(),
        name: name.to_string(),
        secret_type,
        owner: owner.map(str::to_string),
        version,
        is_deleted: false,
        created_at: tx.now,
        updated_at: tx.now,
    })
}

fn check_expected(row: &SecretRow, expected: i64) -> StoreResult<()> {
    if row.latest_ordinal != expected {
        return Err(StoreError::VersionMismatch {
            entity: "secret",
            id: row.id.clone(),
            expected,
            actual: row.latest_ordinal,
        });
    }
    Ok(())
}

fn require_live(row: &SecretRow) -> StoreResult<()> {
    if row.is_deleted {
        return Err(StoreError::NotFound {
            entity: "secret",
            id: row.id.clone(),
        });
    }
    Ok(())
}

/// Append a value version to a live secret.
pub(crate) fn append(
    tx: &mut Tx<'_>,
    row: &SecretRow,
    value: Sealed,
    tags: Option<Vec<String>>,
    expected: i64,
) -> StoreResult<SecretVersion> {
    require_live(row)?;
    check_expected(row, expected)?;
    let current = current_version(tx.conn, row)?;
    let tags = tags.unwrap_or_else(|| current.tags.clone());

    let version = push_version(
        tx,
        &row.id,
        row.latest_ordinal + 1,
        Some(&value),
        &current.blind_index,
        &tags,
        false,
    )?;
    folders::touch_secrets(tx, &row.folder_id)?;
    emit_for(tx, row, EventKind::SecretUpdated, &version, serde_json::Value::Null)?;
    debug!(secret_id = %row.id, version = version.ordinal, "secret updated");
    Ok(version)
}

/// Append a deletion marker and drop the secret from the index.
pub(crate) fn tombstone(
    tx: &mut Tx<'_>,
    row: &SecretRow,
    expected: Option<i64>,
) -> StoreResult<SecretVersion> {
    require_live(row)?;
    if let Some(expected) = expected {
        check_expected(row, expected)?;
    }
    let current = current_version(tx.conn, row)?;

    let version = push_version(
        tx,
        &row.id,
        row.latest_ordinal + 1,
        None,
        &current.blind_index,
        &current.tags,
        true,
    )?;
    tx.conn.execute(
        "UPDATE secrets SET is_deleted = 1 WHERE id = ?1",
        rusqlite::params![row.id],
    )?;
    blind_index::remove_entry(tx.conn, &row.id)?;
    folders::touch_secrets(tx, &row.folder_id)?;
    emit_for(tx, row, EventKind::SecretDeleted, &version, serde_json::Value::Null)?;
    info!(secret_id = %row.id, "secret deleted");
    Ok(version)
}

/// Append a copy of `source` as the newest version, reviving the secret if
/// it was deleted.  Fails with [`StoreError::Conflict`] if the name has
/// since been taken by another live secret.
pub(crate) fn restore(
    tx: &mut Tx<'_>,
    row: &SecretRow,
    source: &SecretVersion,
) -> StoreResult<SecretVersion> {
    let value = source.value.clone().ok_or_else(|| {
        StoreError::InvalidArgument(format!(
            "cannot restore deletion marker {} of secret {}",
            source.ordinal, row.id
        ))
    })?;

    if row.is_deleted {
        let folder = folders::load(tx.conn, &row.folder_id)?;
        let name = open_name(tx, row)?;
        if find_live(tx, &folder, &name, row.secret_type, row.owner.as_deref())?.is_some() {
            return Err(StoreError::Conflict(format!(
                "cannot restore secret {}: its name is in use in {}",
                row.id, folder.path
            )));
        }
        blind_index::put_entry(
            tx.conn,
            &row.id,
            &row.project,
            &row.environment,
            &row.folder_id,
            row.secret_type,
            row.owner.as_deref(),
            &source.blind_index,
        )?;
        tx.conn.execute(
            "UPDATE secrets SET is_deleted = 0 WHERE id = ?1",
            rusqlite::params![row.id],
        )?;
    }

    let version = push_version(
        tx,
        &row.id,
        row.latest_ordinal + 1,
        Some(&value),
        &source.blind_index,
        &source.tags,
        false,
    )?;
    folders::touch_secrets(tx, &row.folder_id)?;
    emit_for(
        tx,
        row,
        EventKind::SecretUpdated,
        &version,
        serde_json::json!({ "restored_from": source.ordinal }),
    )?;
    Ok(version)
}

/// Insert a version row and move the secret's pointer to it.
fn push_version(
    tx: &Tx<'_>,
    secret_id: &str,
    ordinal: i64,
    value: Option<&Sealed>,
    token: &BlindIndexToken,
    tags: &[String],
    is_deletion_marker: bool,
) -> StoreResult<SecretVersion> {
    let version = SecretVersion {
        id: Uuid::now_v7().to_string(),
        secret_id: secret_id.to_string(),
        ordinal,
        value: value.cloned(),
        blind_index: token.clone(),
        tags: tags.to_vec(),
        is_deletion_marker,
        author: tx.actor.clone(),
        created_at: tx.now,
    };

    tx.conn.execute(
        "INSERT INTO secret_versions \
         (id, secret_id, ordinal, ciphertext, nonce, algorithm, key_encoding, key_id, blind_index, tags, is_deletion_marker, author, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        rusqlite::params![
            version.id,
            version.secret_id,
            version.ordinal,
            value.map(|v| v.ciphertext.clone()),
            value.map(|v| v.nonce.clone()),
            value.map(|v| v.algorithm.as_str()),
            value.map(|v| v.key_encoding.as_str()),
            value.map(|v| v.key_id.clone()),
            version.blind_index.as_str(),
            serde_json::to_string(&version.tags)?,
            version.is_deletion_marker,
            version.author,
            version.created_at,
        ],
    )?;
    tx.conn.execute(
        "UPDATE secrets SET current_version_id = ?2, latest_ordinal = ?3, updated_at = ?4 WHERE id = ?1",
        rusqlite::params![secret_id, version.id, ordinal, tx.now],
    )?;
    Ok(version)
}

fn emit_for(
    tx: &mut Tx<'_>,
    row: &SecretRow,
    kind: EventKind,
    version: &SecretVersion,
    extra: serde_json::Value,
) -> StoreResult<()> {
    let folder = folders::load(tx.conn, &row.folder_id)?;
    let mut detail = serde_json::json!({
        "version": version.ordinal,
        "version_id": version.id,
        "type": row.secret_type.as_str(),
    });
    if let (Some(target), serde_json::Value::Object(extra)) = (detail.as_object_mut(), extra) {
        target.extend(extra);
    }
    let event = DomainEvent::new(
        kind,
        &row.project,
        &row.environment,
        folder.path.as_str(),
        &tx.actor,
        &row.id,
    )
    .with_detail(detail);
    tx.emit(event);
    Ok(())
}

fn current_version(conn: &Connection, row: &SecretRow) -> StoreResult<SecretVersion> {
    let id = row.current_version_id.as_deref().ok_or_else(|| StoreError::NotFound {
        entity: "secret version",
        id: row.id.clone(),
    })?;
    load_version(conn, id)
}

const VERSION_COLUMNS: &str = "id, secret_id, ordinal, ciphertext, nonce, algorithm, key_encoding, key_id, \
                               blind_index, tags, is_deletion_marker, author, created_at";

pub(crate) fn load_version(conn: &Connection, version_id: &str) -> StoreResult<SecretVersion> {
    conn.query_row(
        &format!("SELECT {VERSION_COLUMNS} FROM secret_versions WHERE id = ?1"),
        rusqlite::params![version_id],
        version_row,
    )
    .optional()?
    .ok_or_else(|| StoreError::NotFound {
        entity: "secret version",
        id: version_id.to_string(),
    })?
    .into_version()
}

fn versions_of(conn: &Connection, secret_id: &str) -> StoreResult<Vec<SecretVersion>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {VERSION_COLUMNS} FROM secret_versions WHERE secret_id = ?1 ORDER BY ordinal ASC"
    ))?;
    let rows = stmt
        .query_map(rusqlite::params![secret_id], version_row)?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter().map(VersionRow::into_version).collect()
}

/// Decrypt the name and attach the current version and folder path.
pub(crate) fn hydrate(tx: &Tx<'_>, row: SecretRow) -> StoreResult<Secret> {
    let name = open_name(tx, &row)?;
    let version = current_version(tx.conn, &row)?;
    let folder = folders::load(tx.conn, &row.folder_id)?;
    Ok(Secret {
        id: row.id,
        project: row.project,
        environment: row.environment,
        folder_id: row.folder_id,
        path: folder.path,
        name,
        secret_type: row.secret_type,
        owner: row.owner,
        version,
        is_deleted: row.is_deleted,
        created_at: row.created_at,
        updated_at: row.updated_at,
    })
}

/// Live secrets in a folder keyed by lowercase name, as the caller sees
/// them: personal overrides shared.
pub(crate) fn visible_by_name(
    tx: &Tx<'_>,
    folder: &SecretFolder,
) -> StoreResult<BTreeMap<String, Secret>> {
    let mut out: BTreeMap<String, Secret> = BTreeMap::new();
    for row in live_in_folder(tx.conn, &folder.id)? {
        if !row.visible_to(&tx.actor) {
            continue;
        }
        let secret = hydrate(tx, row)?;
        let key = secret.name.to_lowercase();
        let replace = match out.get(&key) {
            Some(existing) => {
                existing.secret_type == SecretType::Shared && secret.secret_type == SecretType::Personal
            }
            None => true,
        };
        if replace {
            out.insert(key, secret);
        }
    }
    Ok(out)
}

// ═══════════════════════════════════════════════════════════════════════
//  Row types
// ═══════════════════════════════════════════════════════════════════════

pub(crate) struct SecretRow {
    pub id: String,
    pub project: String,
    pub environment: String,
    pub folder_id: String,
    pub secret_type: SecretType,
    pub owner: Option<String>,
    pub name_sealed: String,
    pub current_version_id: Option<String>,
    pub latest_ordinal: i64,
    pub is_deleted: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

impl SecretRow {
    fn visible_to(&self, principal: &str) -> bool {
        match self.secret_type {
            SecretType::Shared => true,
            SecretType::Personal => self.owner.as_deref() == Some(principal),
        }
    }
}

fn secret_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoreResult<SecretRow>> {
    let kind: String = row.get(4)?;
    let Some(secret_type) = SecretType::parse(&kind) else {
        return Ok(Err(StoreError::InvalidArgument(format!(
            "unknown secret type `{kind}`"
        ))));
    };
    Ok(Ok(SecretRow {
        id: row.get(0)?,
        project: row.get(1)?,
        environment: row.get(2)?,
        folder_id: row.get(3)?,
        secret_type,
        owner: row.get(5)?,
        name_sealed: row.get(6)?,
        current_version_id: row.get(7)?,
        latest_ordinal: row.get(8)?,
        is_deleted: row.get(9)?,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
    }))
}

struct VersionRow {
    id: String,
    secret_id: String,
    ordinal: i64,
    ciphertext: Option<Vec<u8>>,
    nonce: Option<Vec<u8>>,
    algorithm: Option<String>,
    key_encoding: Option<String>,
    key_id: Option<String>,
    blind_index: String,
    tags: String,
    is_deletion_marker: bool,
    author: String,
    created_at: i64,
}

impl VersionRow {
    fn into_version(self) -> StoreResult<SecretVersion> {
        let value = match (self.ciphertext, self.nonce, self.algorithm, self.key_encoding, self.key_id) {
            (Some(ciphertext), Some(nonce), Some(algorithm), Some(encoding), Some(key_id)) => Some(
                sealed_from_columns(ciphertext, nonce, &algorithm, &encoding, key_id)?,
            ),
            _ => None,
        };
        Ok(SecretVersion {
            id: self.id,
            secret_id: self.secret_id,
            ordinal: self.ordinal,
            value,
            blind_index: BlindIndexToken::from_stored(self.blind_index),
            tags: serde_json::from_str(&self.tags)?,
            is_deletion_marker: self.is_deletion_marker,
            author: self.author,
            created_at: self.created_at,
        })
    }
}

fn version_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<VersionRow> {
    Ok(VersionRow {
        id: row.get(0)?,
        secret_id: row.get(1)?,
        ordinal: row.get(2)?,
        ciphertext: row.get(3)?,
        nonce: row.get(4)?,
        algorithm: row.get(5)?,
        key_encoding: row.get(6)?,
        key_id: row.get(7)?,
        blind_index: row.get(8)?,
        tags: row.get(9)?,
        is_deletion_marker: row.get(10)?,
        author: row.get(11)?,
        created_at: row.get(12)?,
    })
}

// ═══════════════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_type_roundtrip() {
        for t in [SecretType::Shared, SecretType::Personal] {
            assert_eq!(SecretType::parse(t.as_str()), Some(t));
        }
        assert_eq!(SecretType::parse("team"), None);
    }

    #[test]
    fn tags_are_deduplicated_in_order() {
        let tags = normalize_tags(vec![
            "db".to_string(),
            " prod ".to_string(),
            "db".to_string(),
            "".to_string(),
        ]);
        assert_eq!(tags, vec!["db", "prod"]);
    }
}
