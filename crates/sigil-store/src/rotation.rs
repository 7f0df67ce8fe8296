//! Single-shot secret rotation.
//!
//! A [`SecretRotation`] ties a secret to a strategy registered in the
//! kernel's [`RotationRegistry`].  [`RotationScheduler::rotate_now`] asks
//! the strategy for a new value under a timeout and appends it as a new
//! version, guarded by the version observed before the call.  Every run
//! leaves one row in the append-only output log, success or not; failures
//! are recorded rather than returned and never touch the secret.

use std::time::Duration;

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use uuid::Uuid;

pub use sigil_kernel::{RotationRegistry, RotationRequest, RotationStrategy};
use sigil_kernel::{DomainEvent, EventKind};

use crate::error::{StoreError, StoreResult};
use crate::folders;
use crate::scope::OpContext;
use crate::secrets::{self, SecretRow};
use crate::tx::{Backend, Tx};

/// Default bound on a single strategy call.
pub const DEFAULT_STRATEGY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationStatus {
    Success,
    Failed,
}

impl RotationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(Self::Success),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Rotation definition for one secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretRotation {
    pub id: String,
    pub secret_id: String,
    /// Identifier of the strategy in the registry.
    pub strategy: String,
    pub interval_secs: i64,
    /// Time of the last successful rotation.
    pub last_rotated_at: Option<i64>,
    pub last_status: Option<RotationStatus>,
    pub created_by: String,
    pub created_at: i64,
}

impl SecretRotation {
    /// Whether the rotation should run at `now`.  A rotation that never
    /// succeeded is always due.
    pub fn is_due(&self, now: i64) -> bool {
        match self.last_rotated_at {
            Some(last) => last
                .checked_add(self.interval_secs)
                .is_some_and(|next| next <= now),
            None => true,
        }
    }
}

/// One entry of the rotation output log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretRotationOutput {
    pub id: String,
    pub rotation_id: String,
    /// The version written by a successful run.
    pub secret_version_id: Option<String>,
    pub status: RotationStatus,
    pub error: Option<String>,
    pub created_at: i64,
}

/// Runs rotations and keeps their output log.
#[derive(Clone)]
pub struct RotationScheduler {
    backend: Backend,
    registry: RotationRegistry,
    timeout: Duration,
}

impl RotationScheduler {
    pub(crate) fn new(backend: Backend, registry: RotationRegistry, timeout: Duration) -> Self {
        Self {
            backend,
            registry,
            timeout,
        }
    }

    pub fn registry(&self) -> &RotationRegistry {
        &self.registry
    }

    #[instrument(skip(self, ctx), fields(actor = %ctx.actor()))]
    pub async fn create_rotation(
        &self,
        ctx: &OpContext,
        secret_id: &str,
        interval: Duration,
        strategy: &str,
    ) -> StoreResult<SecretRotation> {
        let interval_secs = i64::try_from(interval.as_secs()).unwrap_or(i64::MAX);
        if interval_secs == 0 {
            return Err(StoreError::InvalidArgument(
                "rotation interval must be at least one second".into(),
            ));
        }
        self.registry
            .get(strategy)
            .map_err(|e| StoreError::InvalidArgument(e.to_string()))?;

        let secret_id = secret_id.to_string();
        let strategy = strategy.to_string();
        let principal = ctx.principal.clone();

        self.backend
            .write(ctx, move |tx| {
                let row = secrets::load_visible(tx, &principal, &secret_id)?;
                if row.is_deleted {
                    return Err(StoreError::NotFound {
                        entity: "secret",
                        id: secret_id,
                    });
                }
                let id = Uuid::now_v7().to_string();
                tx.conn.execute(
                    "INSERT INTO secret_rotations (id, secret_id, strategy, interval_secs, created_by, created_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    rusqlite::params![id, secret_id, strategy, interval_secs, tx.actor, tx.now],
                )?;
                info!(rotation_id = %id, secret_id = %secret_id, strategy = %strategy, "rotation created");
                load_rotation(tx.conn, &id)
            })
            .await
    }

    /// Remove a rotation and its output log.
    #[instrument(skip(self, ctx), fields(actor = %ctx.actor()))]
    pub async fn delete_rotation(&self, ctx: &OpContext, rotation_id: &str) -> StoreResult<()> {
        let rotation_id = rotation_id.to_string();
        let principal = ctx.principal.clone();
        self.backend
            .write(ctx, move |tx| {
                let rotation = load_rotation(tx.conn, &rotation_id)?;
                secrets::load_visible(tx, &principal, &rotation.secret_id)?;
                tx.conn.execute(
                    "DELETE FROM secret_rotations WHERE id = ?1",
                    rusqlite::params![rotation_id],
                )?;
                info!(rotation_id = %rotation_id, "rotation deleted");
                Ok(())
            })
            .await
    }

    pub async fn get_rotation(&self, ctx: &OpContext, rotation_id: &str) -> StoreResult<SecretRotation> {
        let rotation_id = rotation_id.to_string();
        let principal = ctx.principal.clone();
        self.backend
            .read(ctx, move |tx| {
                let rotation = load_rotation(tx.conn, &rotation_id)?;
                secrets::load_visible(tx, &principal, &rotation.secret_id)?;
                Ok(rotation)
            })
            .await
    }

    /// Rotations defined for a secret.
    pub async fn list_rotations(&self, ctx: &OpContext, secret_id: &str) -> StoreResult<Vec<SecretRotation>> {
        let secret_id = secret_id.to_string();
        let principal = ctx.principal.clone();
        self.backend
            .read(ctx, move |tx| {
                secrets::load_visible(tx, &principal, &secret_id)?;
                let ids: Vec<String> = {
                    let mut stmt = tx.conn.prepare(
                        "SELECT id FROM secret_rotations WHERE secret_id = ?1 ORDER BY created_at, id",
                    )?;
                    stmt.query_map(rusqlite::params![secret_id], |row| row.get(0))?
                        .collect::<Result<Vec<_>, _>>()?
                };
                ids.iter().map(|id| load_rotation(tx.conn, id)).collect()
            })
            .await
    }

    /// Run a rotation once.
    ///
    /// Returns `Err` only when the rotation does not exist or the caller may
    /// not touch its secret.  A failing strategy, a timeout or a concurrent
    /// update yields `Ok` with a [`RotationStatus::Failed`] output.
    #[instrument(skip(self, ctx), fields(actor = %ctx.actor()))]
    pub async fn rotate_now(&self, ctx: &OpContext, rotation_id: &str) -> StoreResult<SecretRotationOutput> {
        let (rotation, target) = {
            let rotation_id = rotation_id.to_string();
            let principal = ctx.principal.clone();
            self.backend
                .read(ctx, move |tx| {
                    let rotation = load_rotation(tx.conn, &rotation_id)?;
                    let row = secrets::load_visible(tx, &principal, &rotation.secret_id)?;
                    let target = if row.is_deleted {
                        None
                    } else {
                        let folder = folders::load(tx.conn, &row.folder_id)?;
                        Some((row, folder.path.as_str().to_string()))
                    };
                    Ok((rotation, target))
                })
                .await?
        };

        let Some((row, path)) = target else {
            return self
                .record_failure(ctx, &rotation, "secret has been deleted".into())
                .await;
        };
        let strategy = match self.registry.get(&rotation.strategy) {
            Ok(strategy) => strategy,
            Err(err) => return self.record_failure(ctx, &rotation, err.to_string()).await,
        };

        let request = RotationRequest {
            rotation_id: rotation.id.clone(),
            secret_id: row.id.clone(),
            project: row.project.clone(),
            environment: row.environment.clone(),
            path,
            requested_at: Utc::now(),
        };
        let value = match tokio::time::timeout(self.timeout, strategy.rotate(&request)).await {
            Ok(Ok(value)) => value,
            Ok(Err(err)) => return self.record_failure(ctx, &rotation, err.to_string()).await,
            Err(_) => {
                let reason = format!("strategy timed out after {}s", self.timeout.as_secs_f64());
                return self.record_failure(ctx, &rotation, reason).await;
            }
        };

        let observed = row.latest_ordinal;
        let rotation_for_tx = rotation.clone();
        let output = self
            .backend
            .write(ctx, move |tx| {
                let current = secrets::load_row(tx.conn, &row.id)?;
                let sealed = tx.seal(value.as_bytes())?;
                let appended = tx.savepoint(|tx| secrets::append(tx, &current, sealed, None, observed));
                match appended {
                    Ok(version) => {
                        let output = insert_output(
                            tx,
                            &rotation_for_tx,
                            &current,
                            RotationStatus::Success,
                            Some(&version.id),
                            None,
                        )?;
                        info!(
                            rotation_id = %rotation_for_tx.id,
                            version = version.ordinal,
                            "secret rotated"
                        );
                        Ok(output)
                    }
                    Err(err) if err.is_state_conflict() => {
                        let failure = rotation_failed(&rotation_for_tx, err.to_string());
                        warn!(%failure, "rotation lost a race with a concurrent write");
                        insert_output(
                            tx,
                            &rotation_for_tx,
                            &current,
                            RotationStatus::Failed,
                            None,
                            Some(&failure.to_string()),
                        )
                    }
                    Err(err) => Err(err),
                }
            })
            .await?;

        match output.status {
            RotationStatus::Success => self.registry.record_success(&rotation.strategy),
            RotationStatus::Failed => self
                .registry
                .record_failure(&rotation.strategy, output.error.clone().unwrap_or_default()),
        }
        Ok(output)
    }

    /// The output log of a rotation, oldest first.
    pub async fn list_outputs(
        &self,
        ctx: &OpContext,
        rotation_id: &str,
    ) -> StoreResult<Vec<SecretRotationOutput>> {
        let rotation_id = rotation_id.to_string();
        let principal = ctx.principal.clone();
        self.backend
            .read(ctx, move |tx| {
                let rotation = load_rotation(tx.conn, &rotation_id)?;
                secrets::load_visible(tx, &principal, &rotation.secret_id)?;
                let mut stmt = tx.conn.prepare(
                    "SELECT id, rotation_id, secret_version_id, status, error, created_at \
                     FROM secret_rotation_outputs WHERE rotation_id = ?1 ORDER BY created_at, id",
                )?;
                let rows = stmt
                    .query_map(rusqlite::params![rotation_id], |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, Option<String>>(2)?,
                            row.get::<_, String>(3)?,
                            row.get::<_, Option<String>>(4)?,
                            row.get::<_, i64>(5)?,
                        ))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                rows.into_iter()
                    .map(|(id, rotation_id, secret_version_id, status, error, created_at)| {
                        Ok(SecretRotationOutput {
                            id,
                            rotation_id,
                            secret_version_id,
                            status: parse_status(&status)?,
                            error,
                            created_at,
                        })
                    })
                    .collect()
            })
            .await
    }

    /// Rotations due at `now` whose secrets the caller can see.
    pub async fn due_rotations(&self, ctx: &OpContext, now: i64) -> StoreResult<Vec<SecretRotation>> {
        let principal = ctx.principal.clone();
        self.backend
            .read(ctx, move |tx| {
                let ids: Vec<String> = {
                    let mut stmt = tx.conn.prepare(
                        "SELECT r.id FROM secret_rotations r JOIN secrets s ON s.id = r.secret_id \
                         WHERE s.is_deleted = 0 \
                           AND (r.last_rotated_at IS NULL OR r.interval_secs <= ?1 - r.last_rotated_at) \
                         ORDER BY r.created_at, r.id",
                    )?;
                    stmt.query_map(rusqlite::params![now], |row| row.get(0))?
                        .collect::<Result<Vec<_>, _>>()?
                };
                let mut due = Vec::new();
                for id in ids {
                    let rotation = load_rotation(tx.conn, &id)?;
                    if secrets::load_visible(tx, &principal, &rotation.secret_id).is_ok() {
                        due.push(rotation);
                    }
                }
                Ok(due)
            })
            .await
    }

    /// Run every due rotation once, sequentially.
    #[instrument(skip(self, ctx), fields(actor = %ctx.actor()))]
    pub async fn rotate_due(&self, ctx: &OpContext) -> StoreResult<Vec<SecretRotationOutput>> {
        let due = self.due_rotations(ctx, Utc::now().timestamp()).await?;
        let mut outputs = Vec::with_capacity(due.len());
        for rotation in due {
            match self.rotate_now(ctx, &rotation.id).await {
                Ok(output) => outputs.push(output),
                Err(err) => warn!(rotation_id = %rotation.id, %err, "rotation skipped"),
            }
        }
        info!(count = outputs.len(), "due rotations processed");
        Ok(outputs)
    }

    async fn record_failure(
        &self,
        ctx: &OpContext,
        rotation: &SecretRotation,
        reason: String,
    ) -> StoreResult<SecretRotationOutput> {
        let failure = rotation_failed(rotation, reason);
        warn!(%failure, "rotation failed");
        let message = failure.to_string();
        self.registry.record_failure(&rotation.strategy, message.clone());
        let rotation = rotation.clone();
        self.backend
            .write(ctx, move |tx| {
                let row = secrets::load_row(tx.conn, &rotation.secret_id)?;
                insert_output(tx, &rotation, &row, RotationStatus::Failed, None, Some(&message))
            })
            .await
    }
}

/// Failures stop at the scheduler: they are recorded as outputs, never
/// returned to the caller.
fn rotation_failed(rotation: &SecretRotation, reason: String) -> StoreError {
    StoreError::RotationFailed {
        rotation_id: rotation.id.clone(),
        reason,
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Helpers
// ═══════════════════════════════════════════════════════════════════════

/// Append an output row, update the rotation's last run and queue the
/// matching event.
fn insert_output(
    tx: &mut Tx<'_>,
    rotation: &SecretRotation,
    secret: &SecretRow,
    status: RotationStatus,
    secret_version_id: Option<&str>,
    error: Option<&str>,
) -> StoreResult<SecretRotationOutput> {
    let id = Uuid::now_v7().to_string();
    tx.conn.execute(
        "INSERT INTO secret_rotation_outputs (id, rotation_id, secret_version_id, status, error, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        rusqlite::params![id, rotation.id, secret_version_id, status.as_str(), error, tx.now],
    )?;
    match status {
        RotationStatus::Success => tx.conn.execute(
            "UPDATE secret_rotations SET last_rotated_at = ?2, last_status = ?3 WHERE id = ?1",
            rusqlite::params![rotation.id, tx.now, status.as_str()],
        )?,
        RotationStatus::Failed => tx.conn.execute(
            "UPDATE secret_rotations SET last_status = ?2 WHERE id = ?1",
            rusqlite::params![rotation.id, status.as_str()],
        )?,
    };

    let folder = folders::load(tx.conn, &secret.folder_id)?;
    let kind = match status {
        RotationStatus::Success => EventKind::RotationCompleted,
        RotationStatus::Failed => EventKind::RotationFailed,
    };
    let event = DomainEvent::new(
        kind,
        &secret.project,
        &secret.environment,
        folder.path.as_str(),
        &tx.actor,
        &id,
    )
    .with_detail(serde_json::json!({
        "rotation_id": rotation.id,
        "secret_id": secret.id,
        "strategy": rotation.strategy,
        "secret_version_id": secret_version_id,
        "error": error,
    }));
    tx.emit(event);
    if status == RotationStatus::Failed {
        warn!(rotation_id = %rotation.id, error = error.unwrap_or_default(), "rotation failed");
    }

    Ok(SecretRotationOutput {
        id,
        rotation_id: rotation.id.clone(),
        secret_version_id: secret_version_id.map(str::to_string),
        status,
        error: error.map(str::to_string),
        created_at: tx.now,
    })
}

fn parse_status(s: &str) -> StoreResult<RotationStatus> {
    RotationStatus::parse(s)
        .ok_or_else(|| StoreError::InvalidArgument(format!("unknown rotation status `{s}`")))
}

fn load_rotation(conn: &Connection, rotation_id: &str) -> StoreResult<SecretRotation> {
    let row = conn
        .query_row(
            "SELECT id, secret_id, strategy, interval_secs, last_rotated_at, last_status, created_by, created_at \
             FROM secret_rotations WHERE id = ?1",
            rusqlite::params![rotation_id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, Option<i64>>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, i64>(7)?,
                ))
            },
        )
        .optional()?
        .ok_or_else(|| StoreError::NotFound {
            entity: "rotation",
            id: rotation_id.to_string(),
        })?;

    let (id, secret_id, strategy, interval_secs, last_rotated_at, last_status, created_by, created_at) = row;
    Ok(SecretRotation {
        id,
        secret_id,
        strategy,
        interval_secs,
        last_rotated_at,
        last_status: last_status.as_deref().map(parse_status).transpose()?,
        created_by,
        created_at,
    })
}
