//! Subcommand implementations.

use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::json;
use sigil_store::{
    AppliedChange, NewApprovalPolicy, RequestStatus, Secret, SecretChange, SecretType, SnapshotTrigger,
    SoftRejectRule, StoreError, Submission, VoteDecision,
};

use crate::Session;
use crate::cli::{
    Commands, FolderAction, ImportAction, PolicyAction, RequestAction, RotationAction, SecretAction,
    SnapshotAction, SoftRule, StatusFilter,
};

pub async fn dispatch(session: &Session, command: Commands) -> Result<()> {
    match command {
        Commands::Keygen => keygen(),
        Commands::Init => cmd_init(session).await,
        Commands::Status => cmd_status(session).await,
        Commands::Secret { action } => cmd_secret(session, action).await,
        Commands::Folder { action } => cmd_folder(session, action).await,
        Commands::Snapshot { action } => cmd_snapshot(session, action).await,
        Commands::Policy { action } => cmd_policy(session, action).await,
        Commands::Request { action } => cmd_request(session, action).await,
        Commands::Rotation { action } => cmd_rotation(session, action).await,
        Commands::RotateDue => cmd_rotate_due(session).await,
        Commands::Import { action } => cmd_import(session, action).await,
    }
}

// ---------------------------------------------------------------------------
// Subcommand: keygen / init / status
// ---------------------------------------------------------------------------

pub fn keygen() -> Result<()> {
    let bytes = sigil_vault::crypto::random_bytes(sigil_vault::crypto::KEY_LEN)
        .context("failed to generate a master key")?;
    println!("{}", hex::encode(bytes));
    Ok(())
}

async fn cmd_init(s: &Session) -> Result<()> {
    let created = s.core.blind_index().register_key(&s.ctx, &s.project).await?;
    s.emit(&json!({ "project": s.project, "created": created }), |_| {
        if created {
            println!("Registered blind index key for project {}", s.project);
        } else {
            println!("Project {} already has a blind index key", s.project);
        }
    })
}

async fn cmd_status(s: &Session) -> Result<()> {
    let schema_version = s.core.database().schema_version().await?;
    let strategies = s.core.rotations().registry().list_all();

    let status = json!({
        "database": s.config.database.path.display().to_string(),
        "schema_version": schema_version,
        "actor": s.ctx.actor(),
        "project": s.project,
        "environment": s.environment,
        "strategies": strategies.iter().map(|i| i.id.clone()).collect::<Vec<_>>(),
    });
    s.emit(&status, |_| {
        println!("Sigil Status");
        println!("============");
        println!();
        println!("  Database:       {}", s.config.database.path.display());
        println!("  Schema version: {schema_version}");
        println!("  Actor:          {}", s.ctx.actor());
        println!("  Scope:          {}/{}", s.project, s.environment);
        println!("  Strategies:     {}", strategies.len());
        for info in &strategies {
            println!("    - {:<16} {}", info.id, info.description);
        }
    })
}

// ---------------------------------------------------------------------------
// Subcommand: secret
// ---------------------------------------------------------------------------

async fn cmd_secret(s: &Session, action: SecretAction) -> Result<()> {
    let secrets = s.core.secrets();
    match action {
        SecretAction::Set { name, value, path, tags, personal } => {
            let scope = s.scope(&path.path)?;
            let tags_update = (!tags.is_empty()).then(|| tags.clone());

            if personal {
                let existing = find(secrets.get_by_name(&s.ctx, &scope, &name, SecretType::Personal).await)?;
                let written = match existing {
                    Some(secret) => {
                        let version = secrets
                            .update_secret(&s.ctx, &secret.id, &value, secret.version.ordinal, tags_update)
                            .await?;
                        AppliedChange::Updated(version)
                    }
                    None => AppliedChange::Created(
                        secrets
                            .create_secret(&s.ctx, &scope, &name, SecretType::Personal, &value, tags)
                            .await?,
                    ),
                };
                return print_applied(s, &[written]);
            }

            let change = match find(secrets.get_by_name(&s.ctx, &scope, &name, SecretType::Shared).await)? {
                Some(secret) => SecretChange::Update {
                    secret_id: secret.id,
                    value,
                    expected_version: secret.version.ordinal,
                    tags: tags_update,
                },
                None => SecretChange::Create { name, value, tags },
            };
            submit(s, &scope, change).await
        }

        SecretAction::Get { name, path, version } => {
            let scope = s.scope(&path.path)?;
            let secret = secrets.resolve(&s.ctx, &scope, &name).await?;
            let version = match version {
                Some(ordinal) => secrets.get_version(&s.ctx, &secret.id, ordinal).await?,
                None => secret.version.clone(),
            };
            let value = secrets.reveal(&s.ctx, &version)?;
            s.emit(
                &json!({ "name": secret.name, "version": version.ordinal, "value": value }),
                |_| println!("{value}"),
            )
        }

        SecretAction::List { path, effective } => {
            let scope = s.scope(&path.path)?;
            let listed = if effective {
                s.core.imports().effective_secrets(&s.ctx, &scope).await?
            } else {
                secrets.list_secrets(&s.ctx, &scope).await?
            };
            s.emit(&listed, |listed| {
                if listed.is_empty() {
                    println!("No secrets in {scope}");
                }
                for secret in listed {
                    print_secret_line(secret);
                }
            })
        }

        SecretAction::History { name, path } => {
            let scope = s.scope(&path.path)?;
            let secret = secrets.resolve(&s.ctx, &scope, &name).await?;
            let versions = secrets.list_versions(&s.ctx, &secret.id).await?;
            s.emit(&versions, |versions| {
                for v in versions {
                    let marker = if v.is_deletion_marker { " (deleted)" } else { "" };
                    println!(
                        "  v{:<4} {}  {:<12} [{}]{marker}",
                        v.ordinal,
                        format_time(v.created_at),
                        v.author,
                        v.tags.join(", "),
                    );
                }
            })
        }

        SecretAction::Delete { name, path, personal } => {
            let scope = s.scope(&path.path)?;
            let secret_type = if personal { SecretType::Personal } else { SecretType::Shared };
            let secret = secrets.get_by_name(&s.ctx, &scope, &name, secret_type).await?;
            if personal {
                let marker = secrets
                    .delete_secret(&s.ctx, &secret.id, Some(secret.version.ordinal))
                    .await?;
                return print_applied(s, &[AppliedChange::Deleted(marker)]);
            }
            let change = SecretChange::Delete {
                secret_id: secret.id,
                expected_version: secret.version.ordinal,
            };
            submit(s, &scope, change).await
        }
    }
}

/// Turn a by-name miss into `None`.
fn find(result: Result<Secret, StoreError>) -> Result<Option<Secret>> {
    match result {
        Ok(secret) => Ok(Some(secret)),
        Err(StoreError::NotFound { .. }) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn submit(s: &Session, scope: &sigil_store::Scope, change: SecretChange) -> Result<()> {
    match s.core.approvals().submit(&s.ctx, scope, vec![change]).await? {
        Submission::Applied(applied) => print_applied(s, &applied),
        Submission::Deferred(request) => s.emit(&request, |request| {
            println!(
                "Change needs review under policy '{}': request {} ({} of {} approvals)",
                request.policy.name,
                request.id,
                request.approvals(),
                request.policy.approvals_required,
            );
        }),
    }
}

fn print_applied(s: &Session, applied: &[AppliedChange]) -> Result<()> {
    s.emit(&applied, |applied| {
        for change in applied.iter() {
            match change {
                AppliedChange::Created(secret) => {
                    println!("Created {} ({}) at v{}", secret.name, secret.id, secret.version.ordinal)
                }
                AppliedChange::Updated(version) => {
                    println!("Updated {} to v{}", version.secret_id, version.ordinal)
                }
                AppliedChange::Deleted(version) => {
                    println!("Deleted {} at v{}", version.secret_id, version.ordinal)
                }
            }
        }
    })
}

fn print_secret_line(secret: &Secret) {
    let owner = secret
        .owner
        .as_deref()
        .map(|o| format!(" owner={o}"))
        .unwrap_or_default();
    println!(
        "  {:<32} {:<8} v{:<4} {}{owner}",
        secret.name,
        secret.secret_type,
        secret.version.ordinal,
        secret.version.tags.join(","),
    );
}

// ---------------------------------------------------------------------------
// Subcommand: folder
// ---------------------------------------------------------------------------

async fn cmd_folder(s: &Session, action: FolderAction) -> Result<()> {
    let folders = s.core.folders();
    match action {
        FolderAction::Create { path } => {
            let folder = folders.ensure_path(&s.ctx, &s.scope(&path.path)?).await?;
            s.emit(&folder, |f| println!("Folder {} ready ({})", f.path, f.id))
        }
        FolderAction::List { path } => {
            let children = folders.list_children(&s.ctx, &s.scope(&path.path)?).await?;
            s.emit(&children, |children| {
                for child in children {
                    println!("  {}/", child.path);
                }
            })
        }
        FolderAction::History { path } => {
            let versions = folders.list_versions(&s.ctx, &s.scope(&path.path)?).await?;
            s.emit(&versions, |versions| {
                for v in versions {
                    let marker = if v.is_deleted { " (deleted)" } else { "" };
                    println!(
                        "  v{:<4} {}  children: [{}]{marker}",
                        v.ordinal,
                        format_time(v.created_at),
                        v.children.join(", "),
                    );
                }
            })
        }
        FolderAction::Delete { path } => {
            let scope = s.scope(&path.path)?;
            folders.delete_folder(&s.ctx, &scope).await?;
            s.emit(&json!({ "deleted": scope.path }), |_| println!("Deleted {scope}"))
        }
    }
}

// ---------------------------------------------------------------------------
// Subcommand: snapshot
// ---------------------------------------------------------------------------

async fn cmd_snapshot(s: &Session, action: SnapshotAction) -> Result<()> {
    let snapshots = s.core.snapshots();
    match action {
        SnapshotAction::Create { path } => {
            let snapshot = snapshots
                .snapshot(&s.ctx, &s.scope(&path.path)?, SnapshotTrigger::Manual)
                .await?;
            s.emit(&snapshot, |snap| {
                println!(
                    "Snapshot {} captured {} secret(s) in {} folder(s)",
                    snap.id, snap.secret_count, snap.folder_count
                )
            })
        }
        SnapshotAction::List { path } => {
            let listed = snapshots.list_snapshots(&s.ctx, &s.scope(&path.path)?).await?;
            s.emit(&listed, |listed| {
                for snap in listed {
                    println!(
                        "  {}  {}  {:<12} {:<12} {} secret(s)",
                        snap.id,
                        format_time(snap.created_at),
                        snap.trigger,
                        snap.created_by,
                        snap.secret_count,
                    );
                }
            })
        }
        SnapshotAction::Show { id } => {
            let detail = snapshots.get_snapshot(&s.ctx, &id).await?;
            s.emit(&detail, |d| {
                println!("Snapshot {} of {}/{}{}", d.snapshot.id, d.snapshot.project, d.snapshot.environment, d.snapshot.path);
                println!("  Folders:");
                for f in &d.folders {
                    println!("    depth {} {} @ {}", f.depth, f.folder_id, f.folder_version_id);
                }
                println!("  Secrets:");
                for secret in &d.secrets {
                    println!("    {} @ {}", secret.secret_id, secret.secret_version_id);
                }
            })
        }
        SnapshotAction::Rollback { id } => {
            let report = snapshots.rollback(&s.ctx, &id).await?;
            s.emit(&report, |r| {
                if r.is_noop() {
                    println!("Nothing to roll back; state already matches {}", r.snapshot_id);
                } else {
                    println!(
                        "Rolled back to {}: {} restored, {} deleted, {} folder(s) revived",
                        r.snapshot_id,
                        r.restored.len(),
                        r.deleted.len(),
                        r.revived_folders.len(),
                    );
                }
                println!("Safety snapshot: {}", r.safety_snapshot_id);
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Subcommand: policy
// ---------------------------------------------------------------------------

async fn cmd_policy(s: &Session, action: PolicyAction) -> Result<()> {
    let approvals = s.core.approvals();
    match action {
        PolicyAction::Create { name, secret_path, approvals: threshold, approvers, soft } => {
            let mut policy =
                NewApprovalPolicy::new(name, s.environment.clone(), secret_path, threshold, approvers);
            if let Some(rule) = soft {
                policy = policy.soft(match rule {
                    SoftRule::ThresholdWins => SoftRejectRule::ThresholdWins,
                    SoftRule::NetApprovals => SoftRejectRule::NetApprovals,
                });
            }
            let created = approvals.create_policy(&s.ctx, &s.project, policy).await?;
            s.emit(&created, |p| println!("Policy {} ({}) covers {}", p.name, p.id, p.secret_path.as_str()))
        }
        PolicyAction::List { current_env } => {
            let environment = current_env.then_some(s.environment.as_str());
            let policies = approvals.list_policies(&s.ctx, &s.project, environment).await?;
            s.emit(&policies, |policies| {
                for p in policies {
                    println!(
                        "  {}  {:<16} {:<6} {:<16} {}-of-{} {}",
                        p.id,
                        p.name,
                        p.environment,
                        p.secret_path.as_str(),
                        p.approvals_required,
                        p.approvers.len(),
                        p.enforcement.as_str(),
                    );
                }
            })
        }
        PolicyAction::Delete { id } => {
            approvals.delete_policy(&s.ctx, &id).await?;
            s.emit(&json!({ "deleted": id }), |_| println!("Deleted policy {id}"))
        }
    }
}

// ---------------------------------------------------------------------------
// Subcommand: request
// ---------------------------------------------------------------------------

async fn cmd_request(s: &Session, action: RequestAction) -> Result<()> {
    let approvals = s.core.approvals();
    match action {
        RequestAction::List { path, status } => {
            let status = status.map(|f| match f {
                StatusFilter::Pending => RequestStatus::Pending,
                StatusFilter::Approved => RequestStatus::Approved,
                StatusFilter::Rejected => RequestStatus::Rejected,
                StatusFilter::Stale => RequestStatus::Stale,
            });
            let requests = approvals.list_requests(&s.ctx, &s.scope(&path.path)?, status).await?;
            s.emit(&requests, |requests| {
                for r in requests {
                    println!(
                        "  {}  {:<8} by {:<12} {} change(s), {}+ / {}-",
                        r.id,
                        r.status,
                        r.requested_by,
                        r.changes.len(),
                        r.approvals(),
                        r.rejections(),
                    );
                }
            })
        }
        RequestAction::Show { id } => {
            let request = approvals.get_request(&s.ctx, &id).await?;
            let preview = approvals.preview(&s.ctx, &id).await?;
            s.emit(&json!({ "request": request, "changes": preview }), |_| {
                println!("Request {} [{}] on {}", request.id, request.status, request.path);
                println!(
                    "  Policy: {} ({}-of-{}, {})",
                    request.policy.name,
                    request.policy.approvals_required,
                    request.policy.approvers.len(),
                    request.policy.enforcement.as_str(),
                );
                for change in &preview {
                    match &change.value {
                        Some(value) => println!("  {} = {value}", change.name),
                        None => println!("  {} (delete)", change.name),
                    }
                }
                for vote in &request.votes {
                    println!("  {} voted {}", vote.reviewer, vote.decision.as_str());
                }
                if let Some(resolution) = &request.resolution {
                    println!("  Resolution: {resolution}");
                }
            })
        }
        RequestAction::Approve { id } => vote(s, &id, VoteDecision::Approve).await,
        RequestAction::Reject { id } => vote(s, &id, VoteDecision::Reject).await,
        RequestAction::Refresh { id } => {
            let request = approvals.refresh(&s.ctx, &id).await?;
            s.emit(&request, |r| println!("Request {} is {}", r.id, r.status))
        }
    }
}

async fn vote(s: &Session, request_id: &str, decision: VoteDecision) -> Result<()> {
    let request = s.core.approvals().cast_vote(&s.ctx, request_id, decision).await?;
    s.emit(&request, |r| {
        println!(
            "Recorded {} on {}: now {} ({}+ / {}-)",
            decision.as_str(),
            r.id,
            r.status,
            r.approvals(),
            r.rejections(),
        );
        if let Some(resolution) = &r.resolution {
            println!("  {resolution}");
        }
    })
}

// ---------------------------------------------------------------------------
// Subcommand: rotation
// ---------------------------------------------------------------------------

async fn cmd_rotation(s: &Session, action: RotationAction) -> Result<()> {
    let rotations = s.core.rotations();
    match action {
        RotationAction::Create { name, path, every, strategy } => {
            let scope = s.scope(&path.path)?;
            let secret = s
                .core
                .secrets()
                .get_by_name(&s.ctx, &scope, &name, SecretType::Shared)
                .await?;
            let rotation = rotations
                .create_rotation(&s.ctx, &secret.id, Duration::from_secs(every), &strategy)
                .await?;
            s.emit(&rotation, |r| {
                println!("Rotation {} runs {} every {}s", r.id, r.strategy, r.interval_secs)
            })
        }
        RotationAction::List { name, path } => {
            let scope = s.scope(&path.path)?;
            let secret = s
                .core
                .secrets()
                .get_by_name(&s.ctx, &scope, &name, SecretType::Shared)
                .await?;
            let listed = rotations.list_rotations(&s.ctx, &secret.id).await?;
            s.emit(&listed, |listed| {
                for r in listed {
                    let last = r.last_rotated_at.map(format_time).unwrap_or_else(|| "never".into());
                    let status = r.last_status.as_ref().map(|st| st.as_str()).unwrap_or("-");
                    println!(
                        "  {}  {:<12} every {:>6}s  last: {last} ({status})",
                        r.id, r.strategy, r.interval_secs
                    );
                }
            })
        }
        RotationAction::Run { id } => {
            let output = rotations.rotate_now(&s.ctx, &id).await?;
            print_outputs(s, &[output])
        }
        RotationAction::Outputs { id } => {
            let outputs = rotations.list_outputs(&s.ctx, &id).await?;
            print_outputs(s, &outputs)
        }
        RotationAction::Delete { id } => {
            rotations.delete_rotation(&s.ctx, &id).await?;
            s.emit(&json!({ "deleted": id }), |_| println!("Deleted rotation {id}"))
        }
        RotationAction::Strategies => {
            let strategies = rotations.registry().list_all();
            s.emit(&strategies, |strategies| {
                for info in strategies {
                    println!(
                        "  {:<16} {}  ({} ok, {} failed)",
                        info.id, info.description, info.successes, info.failures
                    );
                }
            })
        }
    }
}

async fn cmd_rotate_due(s: &Session) -> Result<()> {
    let outputs = s.core.rotations().rotate_due(&s.ctx).await?;
    if outputs.is_empty() && !s.json {
        println!("No rotations due");
        return Ok(());
    }
    print_outputs(s, &outputs)
}

fn print_outputs(s: &Session, outputs: &[sigil_store::SecretRotationOutput]) -> Result<()> {
    s.emit(&outputs, |outputs| {
        for o in outputs.iter() {
            match &o.error {
                Some(error) => println!("  {} {}: {error}", o.rotation_id, o.status.as_str()),
                None => println!(
                    "  {} {}: version {}",
                    o.rotation_id,
                    o.status.as_str(),
                    o.secret_version_id.as_deref().unwrap_or("-"),
                ),
            }
        }
    })
}

// ---------------------------------------------------------------------------
// Subcommand: import
// ---------------------------------------------------------------------------

async fn cmd_import(s: &Session, action: ImportAction) -> Result<()> {
    let imports = s.core.imports();
    match action {
        ImportAction::Add { path, from_env, from_path } => {
            let import = imports
                .add_import(&s.ctx, &s.scope(&path.path)?, &from_env, &from_path)
                .await?;
            s.emit(&import, |i| {
                println!(
                    "Import {} #{} reads {}:{}",
                    i.id, i.position, i.source_environment, i.source_path
                )
            })
        }
        ImportAction::List { path } => {
            let listed = imports.list_imports(&s.ctx, &s.scope(&path.path)?).await?;
            s.emit(&listed, |listed| {
                for i in listed {
                    println!("  #{} {}:{}  ({})", i.position, i.source_environment, i.source_path, i.id);
                }
            })
        }
        ImportAction::Remove { id } => {
            imports.remove_import(&s.ctx, &id).await?;
            s.emit(&json!({ "deleted": id }), |_| println!("Removed import {id}"))
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Render a unix timestamp in UTC.
fn format_time(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| ts.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_time_renders_utc() {
        assert_eq!(format_time(0), "1970-01-01 00:00:00");
        assert_eq!(format_time(1_700_000_000), "2023-11-14 22:13:20");
    }

    #[test]
    fn find_maps_not_found_to_none() {
        let miss = find(Err(StoreError::NotFound {
            entity: "secret",
            id: "DB_PASSWORD".into(),
        }))
        .unwrap();
        assert!(miss.is_none());

        let other = find(Err(StoreError::InvalidArgument("bad".into())));
        assert!(other.is_err());
    }
}
