//! Change approval: policies, requests and votes.
//!
//! An [`ApprovalPolicy`] covers a path glob in one environment.  A change
//! set submitted to a covered folder is not applied; it is stored as an
//! [`ApprovalRequest`] with its values already sealed and a frozen copy of
//! the policy.  Later policy edits do not affect requests in flight.
//!
//! Votes are recorded one per reviewer.  When the threshold is met the
//! change set is applied in the same transaction as the deciding vote.  If
//! the target secrets moved on since submission the request becomes
//! [`RequestStatus::Stale`] instead of overwriting newer data.
//!
//! Hard enforcement rejects on the first rejection.  Soft enforcement lets
//! approvals win; [`SoftRejectRule`] decides whether rejections cancel
//! approvals, and an unreachable threshold rejects the request in either
//! case.

use std::cmp::Reverse;

use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use sigil_kernel::{DomainEvent, EventKind};
use sigil_vault::{BlindIndexToken, Sealed};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::blind_index;
use crate::error::{StoreError, StoreResult};
use crate::folders::{self, SecretFolder};
use crate::scope::{OpContext, PathPattern, Principal, Scope, SecretPath, validate_secret_name};
use crate::secrets::{self, Secret, SecretType, SecretVersion, normalize_tags};
use crate::tx::{Backend, Tx};

// ═══════════════════════════════════════════════════════════════════════
//  Policy types
// ═══════════════════════════════════════════════════════════════════════

/// How strictly a policy treats rejections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnforcementLevel {
    /// Any rejection rejects the request.
    Hard,
    /// Rejections are recorded; see [`SoftRejectRule`].
    Soft,
}

impl EnforcementLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hard => "hard",
            Self::Soft => "soft",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "hard" => Some(Self::Hard),
            "soft" => Some(Self::Soft),
            _ => None,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Hard => 1,
            Self::Soft => 0,
        }
    }
}

/// Precedence between approvals and rejections under soft enforcement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SoftRejectRule {
    /// The request is approved once approvals reach the threshold,
    /// whatever the number of rejections.
    ThresholdWins,
    /// Each rejection cancels one approval.
    NetApprovals,
}

impl SoftRejectRule {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ThresholdWins => "threshold_wins",
            Self::NetApprovals => "net_approvals",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "threshold_wins" => Some(Self::ThresholdWins),
            "net_approvals" => Some(Self::NetApprovals),
            _ => None,
        }
    }
}

/// A persisted approval policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalPolicy {
    pub id: String,
    pub project: String,
    pub environment: String,
    pub name: String,
    /// Glob matched against folder paths and secret paths.
    pub secret_path: PathPattern,
    pub approvals_required: u32,
    pub approvers: Vec<String>,
    pub enforcement: EnforcementLevel,
    pub soft_reject_rule: SoftRejectRule,
    /// Under soft enforcement, note in the resolution that the request was
    /// approved despite rejections.
    pub flag_overridden_rejections: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

impl ApprovalPolicy {
    fn freeze(&self) -> PolicySnapshot {
        PolicySnapshot {
            policy_id: self.id.clone(),
            name: self.name.clone(),
            approvals_required: self.approvals_required,
            approvers: self.approvers.clone(),
            enforcement: self.enforcement,
            soft_reject_rule: self.soft_reject_rule,
            flag_overridden_rejections: self.flag_overridden_rejections,
        }
    }
}

/// Input for creating or replacing a policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewApprovalPolicy {
    pub name: String,
    pub environment: String,
    pub secret_path: String,
    pub approvals_required: u32,
    pub approvers: Vec<String>,
    pub enforcement: EnforcementLevel,
    pub soft_reject_rule: SoftRejectRule,
    pub flag_overridden_rejections: bool,
}

impl NewApprovalPolicy {
    /// A hard-enforced policy.
    pub fn new(
        name: impl Into<String>,
        environment: impl Into<String>,
        secret_path: impl Into<String>,
        approvals_required: u32,
        approvers: Vec<String>,
    ) -> Self {
        Self {
            name: name.into(),
            environment: environment.into(),
            secret_path: secret_path.into(),
            approvals_required,
            approvers,
            enforcement: EnforcementLevel::Hard,
            soft_reject_rule: SoftRejectRule::ThresholdWins,
            flag_overridden_rejections: true,
        }
    }

    #[must_use]
    pub fn soft(mut self, rule: SoftRejectRule) -> Self {
        self.enforcement = EnforcementLevel::Soft;
        self.soft_reject_rule = rule;
        self
    }

    fn validate(&self) -> StoreResult<(PathPattern, Vec<String>)> {
        if self.name.trim().is_empty() {
            return Err(StoreError::InvalidArgument("policy name is empty".into()));
        }
        if self.environment.is_empty() {
            return Err(StoreError::InvalidArgument("policy environment is empty".into()));
        }
        let pattern = PathPattern::parse(&self.secret_path)?;
        let approvers = normalize_tags(self.approvers.iter().cloned());
        if self.approvals_required == 0 {
            return Err(StoreError::InvalidArgument(
                "approvals_required must be at least 1".into(),
            ));
        }
        if self.approvals_required as usize > approvers.len() {
            return Err(StoreError::InvalidArgument(format!(
                "approvals_required ({}) exceeds the number of approvers ({})",
                self.approvals_required,
                approvers.len()
            )));
        }
        Ok((pattern, approvers))
    }
}

/// The policy as it was when a request was submitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicySnapshot {
    pub policy_id: String,
    pub name: String,
    pub approvals_required: u32,
    pub approvers: Vec<String>,
    pub enforcement: EnforcementLevel,
    pub soft_reject_rule: SoftRejectRule,
    pub flag_overridden_rejections: bool,
}

// ═══════════════════════════════════════════════════════════════════════
//  Request types
// ═══════════════════════════════════════════════════════════════════════

/// A proposed change to a shared secret, with plaintext values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum SecretChange {
    Create {
        name: String,
        value: String,
        tags: Vec<String>,
    },
    Update {
        secret_id: String,
        value: String,
        expected_version: i64,
        /// `None` keeps the current tags.
        tags: Option<Vec<String>>,
    },
    Delete {
        secret_id: String,
        expected_version: i64,
    },
}

/// A change as persisted in a request: values sealed, base versions pinned.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum StoredChange {
    Create {
        name: Sealed,
        token: BlindIndexToken,
        value: Sealed,
        tags: Vec<String>,
    },
    Update {
        secret_id: String,
        base_version: i64,
        value: Sealed,
        tags: Option<Vec<String>>,
    },
    Delete {
        secret_id: String,
        base_version: i64,
    },
}

impl StoredChange {
    fn summary(&self) -> ProposedChange {
        match self {
            Self::Create { token, .. } => ProposedChange::Create {
                blind_index: token.clone(),
            },
            Self::Update {
                secret_id,
                base_version,
                ..
            } => ProposedChange::Update {
                secret_id: secret_id.clone(),
                base_version: *base_version,
            },
            Self::Delete {
                secret_id,
                base_version,
            } => ProposedChange::Delete {
                secret_id: secret_id.clone(),
                base_version: *base_version,
            },
        }
    }
}

/// What a request proposes, without any secret material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ProposedChange {
    Create { blind_index: BlindIndexToken },
    Update { secret_id: String, base_version: i64 },
    Delete { secret_id: String, base_version: i64 },
}

/// A proposed change opened with a reviewer's key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangePreview {
    pub change: ProposedChange,
    pub name: String,
    /// Proposed value; `None` for deletions.
    pub value: Option<String>,
}

/// Lifecycle of an approval request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    /// Threshold met and the change set applied.
    Approved,
    Rejected,
    /// The target changed after submission; nothing was applied.
    Stale,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Stale => "stale",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            "stale" => Some(Self::Stale),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoteDecision {
    Approve,
    Reject,
}

impl VoteDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approve => "approve",
            Self::Reject => "reject",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "approve" => Some(Self::Approve),
            "reject" => Some(Self::Reject),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    pub reviewer: String,
    pub decision: VoteDecision,
    pub created_at: i64,
}

/// A change set awaiting (or past) review.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: String,
    pub project: String,
    pub environment: String,
    pub folder_id: String,
    pub path: SecretPath,
    pub policy: PolicySnapshot,
    pub changes: Vec<ProposedChange>,
    pub status: RequestStatus,
    pub requested_by: String,
    pub votes: Vec<Vote>,
    /// Why the request ended the way it did, when there is something to say.
    pub resolution: Option<String>,
    pub created_at: i64,
    pub resolved_at: Option<i64>,
}

impl ApprovalRequest {
    pub fn approvals(&self) -> usize {
        self.count(VoteDecision::Approve)
    }

    pub fn rejections(&self) -> usize {
        self.count(VoteDecision::Reject)
    }

    fn count(&self, decision: VoteDecision) -> usize {
        self.votes.iter().filter(|v| v.decision == decision).count()
    }
}

/// One applied change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum AppliedChange {
    Created(Secret),
    Updated(SecretVersion),
    Deleted(SecretVersion),
}

/// Result of [`ApprovalEngine::submit`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "result", rename_all = "snake_case")]
pub enum Submission {
    /// No policy covers the target; the changes are committed.
    Applied(Vec<AppliedChange>),
    /// A policy covers the target; the changes await review.
    Deferred(ApprovalRequest),
}

// ═══════════════════════════════════════════════════════════════════════
//  Vote evaluation
// ═══════════════════════════════════════════════════════════════════════

/// What the votes cast so far imply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Verdict {
    Apply,
    Reject(String),
    Wait,
}

pub(crate) fn evaluate(policy: &PolicySnapshot, approvals: usize, rejections: usize) -> Verdict {
    let threshold = policy.approvals_required as usize;
    let remaining = policy
        .approvers
        .len()
        .saturating_sub(approvals + rejections);

    match policy.enforcement {
        EnforcementLevel::Hard => {
            if rejections > 0 {
                Verdict::Reject("rejected by a reviewer".into())
            } else if approvals >= threshold {
                Verdict::Apply
            } else {
                Verdict::Wait
            }
        }
        EnforcementLevel::Soft => {
            let effective = match policy.soft_reject_rule {
                SoftRejectRule::ThresholdWins => approvals,
                SoftRejectRule::NetApprovals => approvals.saturating_sub(rejections),
            };
            if effective >= threshold {
                Verdict::Apply
            } else if effective + remaining < threshold {
                Verdict::Reject("the approval threshold can no longer be reached".into())
            } else {
                Verdict::Wait
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  ApprovalEngine
// ═══════════════════════════════════════════════════════════════════════

/// Manages policies and drives requests through review.
#[derive(Clone)]
pub struct ApprovalEngine {
    backend: Backend,
}

impl ApprovalEngine {
    pub(crate) fn new(backend: Backend) -> Self {
        Self { backend }
    }

    // ── policies ─────────────────────────────────────────────────────

    #[instrument(skip(self, ctx, policy), fields(actor = %ctx.actor(), name = %policy.name))]
    pub async fn create_policy(
        &self,
        ctx: &OpContext,
        project: &str,
        policy: NewApprovalPolicy,
    ) -> StoreResult<ApprovalPolicy> {
        ctx.principal.authorize_project(project)?;
        let (pattern, approvers) = policy.validate()?;
        let project = project.to_string();

        self.backend
            .write(ctx, move |tx| {
                ensure_name_free(tx.conn, &project, &policy.name, None)?;
                let id = Uuid::now_v7().to_string();
                tx.conn.execute(
                    "INSERT INTO secret_approval_policies \
                     (id, project_id, environment, secret_path, name, approvals_required, enforcement, \
                      soft_reject_rule, flag_overridden_rejections, created_at, updated_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)",
                    rusqlite::params![
                        id,
                        project,
                        policy.environment,
                        pattern.as_str(),
                        policy.name,
                        policy.approvals_required,
                        policy.enforcement.as_str(),
                        policy.soft_reject_rule.as_str(),
                        policy.flag_overridden_rejections,
                        tx.now,
                    ],
                )?;
                write_approvers(tx.conn, &id, &approvers)?;
                info!(policy_id = %id, "approval policy created");
                load_policy(tx.conn, &id)
            })
            .await
    }

    /// Replace a policy's settings.  Requests already submitted keep the
    /// copy they were created with.
    #[instrument(skip(self, ctx, policy), fields(actor = %ctx.actor()))]
    pub async fn update_policy(
        &self,
        ctx: &OpContext,
        policy_id: &str,
        policy: NewApprovalPolicy,
    ) -> StoreResult<ApprovalPolicy> {
        let (pattern, approvers) = policy.validate()?;
        let policy_id = policy_id.to_string();
        let principal = ctx.principal.clone();

        self.backend
            .write(ctx, move |tx| {
                let existing = load_policy(tx.conn, &policy_id)?;
                principal.authorize_project(&existing.project)?;
                ensure_name_free(tx.conn, &existing.project, &policy.name, Some(&policy_id))?;
                tx.conn.execute(
                    "UPDATE secret_approval_policies SET environment = ?2, secret_path = ?3, name = ?4, \
                     approvals_required = ?5, enforcement = ?6, soft_reject_rule = ?7, \
                     flag_overridden_rejections = ?8, updated_at = ?9 WHERE id = ?1",
                    rusqlite::params![
                        policy_id,
                        policy.environment,
                        pattern.as_str(),
                        policy.name,
                        policy.approvals_required,
                        policy.enforcement.as_str(),
                        policy.soft_reject_rule.as_str(),
                        policy.flag_overridden_rejections,
                        tx.now,
                    ],
                )?;
                tx.conn.execute(
                    "DELETE FROM sap_approvers WHERE policy_id = ?1",
                    rusqlite::params![policy_id],
                )?;
                write_approvers(tx.conn, &policy_id, &approvers)?;
                info!(policy_id = %policy_id, "approval policy updated");
                load_policy(tx.conn, &policy_id)
            })
            .await
    }

    #[instrument(skip(self, ctx), fields(actor = %ctx.actor()))]
    pub async fn delete_policy(&self, ctx: &OpContext, policy_id: &str) -> StoreResult<()> {
        let policy_id = policy_id.to_string();
        let principal = ctx.principal.clone();
        self.backend
            .write(ctx, move |tx| {
                let existing = load_policy(tx.conn, &policy_id)?;
                principal.authorize_project(&existing.project)?;
                tx.conn.execute(
                    "DELETE FROM secret_approval_policies WHERE id = ?1",
                    rusqlite::params![policy_id],
                )?;
                info!(policy_id = %policy_id, "approval policy deleted");
                Ok(())
            })
            .await
    }

    #[instrument(skip(self, ctx))]
    pub async fn get_policy(&self, ctx: &OpContext, policy_id: &str) -> StoreResult<ApprovalPolicy> {
        let policy_id = policy_id.to_string();
        let principal = ctx.principal.clone();
        self.backend
            .read(ctx, move |tx| {
                let policy = load_policy(tx.conn, &policy_id)?;
                principal.authorize_project(&policy.project)?;
                Ok(policy)
            })
            .await
    }

    /// Policies of a project, optionally narrowed to one environment.
    #[instrument(skip(self, ctx))]
    pub async fn list_policies(
        &self,
        ctx: &OpContext,
        project: &str,
        environment: Option<&str>,
    ) -> StoreResult<Vec<ApprovalPolicy>> {
        ctx.principal.authorize_project(project)?;
        let project = project.to_string();
        let environment = environment.map(str::to_string);
        self.backend
            .read(ctx, move |tx| {
                let ids: Vec<String> = {
                    let mut stmt = tx.conn.prepare(
                        "SELECT id FROM secret_approval_policies \
                         WHERE project_id = ?1 AND (?2 IS NULL OR environment = ?2) ORDER BY name",
                    )?;
                    stmt.query_map(rusqlite::params![project, environment], |row| row.get(0))?
                        .collect::<Result<Vec<_>, _>>()?
                };
                ids.iter().map(|id| load_policy(tx.conn, id)).collect()
            })
            .await
    }

    /// The most restrictive policy covering the folder at `scope.path`, or
    /// the secret `name` inside it.
    #[instrument(skip(self, ctx, name), fields(scope = %scope))]
    pub async fn covering_policy(
        &self,
        ctx: &OpContext,
        scope: &Scope,
        name: Option<&str>,
    ) -> StoreResult<Option<ApprovalPolicy>> {
        ctx.authorize(scope)?;
        let scope = scope.clone();
        let secret_paths: Vec<String> = name.map(|n| scope.path.secret_path(n)).into_iter().collect();
        self.backend
            .read(ctx, move |tx| {
                covering_policy(tx.conn, &scope.project, &scope.environment, &scope.path, &secret_paths)
            })
            .await
    }

    // ── requests ─────────────────────────────────────────────────────

    /// Apply `changes` to the folder at `scope.path`, or hold them for
    /// review if an approval policy covers the folder or any target secret.
    ///
    /// Changes are validated up front: a stale `expected_version` fails
    /// with [`StoreError::VersionMismatch`] and a taken name with
    /// [`StoreError::Conflict`] before any request is created.
    #[instrument(skip(self, ctx, changes), fields(actor = %ctx.actor(), scope = %scope, changes = changes.len()))]
    pub async fn submit(
        &self,
        ctx: &OpContext,
        scope: &Scope,
        changes: Vec<SecretChange>,
    ) -> StoreResult<Submission> {
        ctx.authorize(scope)?;
        if changes.is_empty() {
            return Err(StoreError::InvalidArgument("change set is empty".into()));
        }
        let scope = scope.clone();
        let principal = ctx.principal.clone();

        self.backend
            .write(ctx, move |tx| {
                let folder = folders::resolve_for_write(tx, &scope)?;
                let (stored, paths) = seal_changes(tx, &principal, &folder, changes)?;

                let policy = covering_policy(
                    tx.conn,
                    &folder.project,
                    &folder.environment,
                    &folder.path,
                    &paths,
                )?;
                let Some(policy) = policy else {
                    let applied = apply_stored(tx, &folder, &stored)?;
                    debug!(applied = applied.len(), "change set applied without review");
                    return Ok(Submission::Applied(applied));
                };

                let request = insert_request(tx, &folder, &policy, &stored)?;
                Ok(Submission::Deferred(request))
            })
            .await
    }

    /// Record the caller's vote and resolve the request if the votes now
    /// decide it.
    #[instrument(skip(self, ctx), fields(actor = %ctx.actor(), decision = decision.as_str()))]
    pub async fn cast_vote(
        &self,
        ctx: &OpContext,
        request_id: &str,
        decision: VoteDecision,
    ) -> StoreResult<ApprovalRequest> {
        let request_id = request_id.to_string();
        let principal = ctx.principal.clone();

        self.backend
            .write(ctx, move |tx| {
                let request = load_request(tx.conn, &request_id)?;
                principal.authorize(&request_scope(&request))?;

                if request.status.is_terminal() {
                    return Err(StoreError::RequestClosed {
                        request_id,
                        status: request.status.to_string(),
                    });
                }
                if !request.policy.approvers.iter().any(|a| a == &principal.id) {
                    return Err(StoreError::Ineligible {
                        request_id,
                        reviewer: principal.id.clone(),
                    });
                }
                if request.votes.iter().any(|v| v.reviewer == principal.id) {
                    return Err(StoreError::AlreadyVoted {
                        request_id,
                        reviewer: principal.id.clone(),
                    });
                }

                tx.conn.execute(
                    "INSERT INTO sar_reviewers (request_id, reviewer_id, decision, created_at) \
                     VALUES (?1, ?2, ?3, ?4)",
                    rusqlite::params![request_id, principal.id, decision.as_str(), tx.now],
                )?;
                let approvals = request.approvals() + usize::from(decision == VoteDecision::Approve);
                let rejections = request.rejections() + usize::from(decision == VoteDecision::Reject);

                match evaluate(&request.policy, approvals, rejections) {
                    Verdict::Wait => {}
                    Verdict::Reject(reason) => {
                        resolve(tx, &request, RequestStatus::Rejected, Some(reason))?;
                    }
                    Verdict::Apply => {
                        let stored = load_changes(tx.conn, &request.id)?;
                        let requester = request.requested_by.clone();
                        let outcome = tx.savepoint(|tx| {
                            let folder = folders::load(tx.conn, &request.folder_id)?;
                            if folder.is_deleted {
                                return Err(StoreError::NotFound {
                                    entity: "folder",
                                    id: folder.id,
                                });
                            }
                            let reviewer = std::mem::replace(&mut tx.actor, requester);
                            let applied = apply_stored(tx, &folder, &stored);
                            tx.actor = reviewer;
                            applied
                        });
                        match outcome {
                            Ok(_) => {
                                let note = (request.policy.enforcement == EnforcementLevel::Soft
                                    && request.policy.flag_overridden_rejections
                                    && rejections > 0)
                                    .then(|| format!("approved over {rejections} rejection(s)"));
                                resolve(tx, &request, RequestStatus::Approved, note)?;
                            }
                            Err(err) if err.is_state_conflict() => {
                                warn!(request_id = %request.id, %err, "approved request is stale");
                                resolve(tx, &request, RequestStatus::Stale, Some(err.to_string()))?;
                            }
                            Err(err) => return Err(err),
                        }
                    }
                }

                load_request(tx.conn, &request_id)
            })
            .await
    }

    /// Re-check a pending request against current state and mark it
    /// [`RequestStatus::Stale`] if a target has moved on.
    #[instrument(skip(self, ctx), fields(actor = %ctx.actor()))]
    pub async fn refresh(&self, ctx: &OpContext, request_id: &str) -> StoreResult<ApprovalRequest> {
        let request_id = request_id.to_string();
        let principal = ctx.principal.clone();

        self.backend
            .write(ctx, move |tx| {
                let request = load_request(tx.conn, &request_id)?;
                principal.authorize(&request_scope(&request))?;
                if request.status != RequestStatus::Pending {
                    return Ok(request);
                }

                let folder = folders::load(tx.conn, &request.folder_id)?;
                for change in load_changes(tx.conn, &request.id)? {
                    if let Err(err) = check_still_applicable(tx, &folder, &change) {
                        if !err.is_state_conflict() {
                            return Err(err);
                        }
                        resolve(tx, &request, RequestStatus::Stale, Some(err.to_string()))?;
                        break;
                    }
                }
                load_request(tx.conn, &request_id)
            })
            .await
    }

    #[instrument(skip(self, ctx))]
    pub async fn get_request(&self, ctx: &OpContext, request_id: &str) -> StoreResult<ApprovalRequest> {
        let request_id = request_id.to_string();
        let principal = ctx.principal.clone();
        self.backend
            .read(ctx, move |tx| {
                let request = load_request(tx.conn, &request_id)?;
                principal.authorize(&request_scope(&request))?;
                Ok(request)
            })
            .await
    }

    /// Requests in `scope`'s project and environment, newest first.
    #[instrument(skip(self, ctx), fields(scope = %scope))]
    pub async fn list_requests(
        &self,
        ctx: &OpContext,
        scope: &Scope,
        status: Option<RequestStatus>,
    ) -> StoreResult<Vec<ApprovalRequest>> {
        ctx.authorize(scope)?;
        let scope = scope.clone();
        let principal = ctx.principal.clone();
        self.backend
            .read(ctx, move |tx| {
                let ids: Vec<String> = {
                    let mut stmt = tx.conn.prepare(
                        "SELECT id FROM secret_approval_requests \
                         WHERE project_id = ?1 AND environment = ?2 AND (?3 IS NULL OR status = ?3) \
                         ORDER BY created_at DESC, id DESC",
                    )?;
                    stmt.query_map(
                        rusqlite::params![scope.project, scope.environment, status.map(|s| s.as_str())],
                        |row| row.get(0),
                    )?
                    .collect::<Result<Vec<_>, _>>()?
                };
                let mut out = Vec::new();
                for id in ids {
                    let request = load_request(tx.conn, &id)?;
                    if principal.authorize(&request_scope(&request)).is_ok() {
                        out.push(request);
                    }
                }
                Ok(out)
            })
            .await
    }

    /// Open a request's proposed names and values with the caller's key.
    #[instrument(skip(self, ctx), fields(actor = %ctx.actor()))]
    pub async fn preview(&self, ctx: &OpContext, request_id: &str) -> StoreResult<Vec<ChangePreview>> {
        let request_id = request_id.to_string();
        let principal = ctx.principal.clone();
        self.backend
            .read(ctx, move |tx| {
                let request = load_request(tx.conn, &request_id)?;
                principal.authorize(&request_scope(&request))?;
                load_changes(tx.conn, &request.id)?
                    .iter()
                    .map(|change| -> StoreResult<ChangePreview> {
                        let (name, value) = match change {
                            StoredChange::Create { name, value, .. } => {
                                (tx.open_string(name)?, Some(tx.open_string(value)?))
                            }
                            StoredChange::Update { secret_id, value, .. } => {
                                let row = secrets::load_row(tx.conn, secret_id)?;
                                (secrets::open_name(tx, &row)?, Some(tx.open_string(value)?))
                            }
                            StoredChange::Delete { secret_id, .. } => {
                                let row = secrets::load_row(tx.conn, secret_id)?;
                                (secrets::open_name(tx, &row)?, None)
                            }
                        };
                        Ok(ChangePreview {
                            change: change.summary(),
                            name,
                            value,
                        })
                    })
                    .collect()
            })
            .await
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Transaction-level helpers
// ═══════════════════════════════════════════════════════════════════════

/// The most restrictive policy in (project, environment) matching the
/// folder path or any of `secret_paths`: hard before soft, then the higher
/// threshold, then the oldest policy.
pub(crate) fn covering_policy(
    conn: &Connection,
    project: &str,
    environment: &str,
    folder_path: &SecretPath,
    secret_paths: &[String],
) -> StoreResult<Option<ApprovalPolicy>> {
    let ids: Vec<String> = {
        let mut stmt = conn.prepare(
            "SELECT id FROM secret_approval_policies WHERE project_id = ?1 AND environment = ?2",
        )?;
        stmt.query_map(rusqlite::params![project, environment], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?
    };

    let mut matching = Vec::new();
    for id in ids {
        let policy = load_policy(conn, &id)?;
        let covers = policy.secret_path.matches(folder_path.as_str())
            || secret_paths.iter().any(|p| policy.secret_path.matches(p));
        if covers {
            matching.push(policy);
        }
    }
    matching.sort_by_key(|p| {
        (
            Reverse(p.enforcement.rank()),
            Reverse(p.approvals_required),
            p.created_at,
            p.id.clone(),
        )
    });
    Ok(matching.into_iter().next())
}

fn ensure_name_free(
    conn: &Connection,
    project: &str,
    name: &str,
    except: Option<&str>,
) -> StoreResult<()> {
    let clash: Option<String> = conn
        .query_row(
            "SELECT id FROM secret_approval_policies \
             WHERE project_id = ?1 AND name = ?2 AND (?3 IS NULL OR id != ?3)",
            rusqlite::params![project, name, except],
            |row| row.get(0),
        )
        .optional()?;
    match clash {
        Some(_) => Err(StoreError::Conflict(format!(
            "approval policy `{name}` already exists"
        ))),
        None => Ok(()),
    }
}

fn write_approvers(conn: &Connection, policy_id: &str, approvers: &[String]) -> StoreResult<()> {
    for approver in approvers {
        conn.execute(
            "INSERT INTO sap_approvers (policy_id, approver_id) VALUES (?1, ?2)",
            rusqlite::params![policy_id, approver],
        )?;
    }
    Ok(())
}

fn load_policy(conn: &Connection, policy_id: &str) -> StoreResult<ApprovalPolicy> {
    let row = conn
        .query_row(
            "SELECT id, project_id, environment, secret_path, name, approvals_required, enforcement, \
             soft_reject_rule, flag_overridden_rejections, created_at, updated_at \
             FROM secret_approval_policies WHERE id = ?1",
            rusqlite::params![policy_id],
            |row| {
                Ok(PolicyRow {
                    id: row.get(0)?,
                    project: row.get(1)?,
                    environment: row.get(2)?,
                    secret_path: row.get(3)?,
                    name: row.get(4)?,
                    approvals_required: row.get(5)?,
                    enforcement: row.get(6)?,
                    soft_reject_rule: row.get(7)?,
                    flag_overridden_rejections: row.get(8)?,
                    created_at: row.get(9)?,
                    updated_at: row.get(10)?,
                })
            },
        )
        .optional()?
        .ok_or_else(|| StoreError::NotFound {
            entity: "approval policy",
            id: policy_id.to_string(),
        })?;

    let approvers: Vec<String> = {
        let mut stmt = conn.prepare(
            "SELECT approver_id FROM sap_approvers WHERE policy_id = ?1 ORDER BY approver_id",
        )?;
        stmt.query_map(rusqlite::params![policy_id], |r| r.get(0))?
            .collect::<Result<Vec<_>, _>>()?
    };
    row.into_policy(approvers)
}

/// Validate each change against current state and seal its values.
/// Returns the sealed changes and the full secret path each one targets.
fn seal_changes(
    tx: &mut Tx<'_>,
    principal: &Principal,
    folder: &SecretFolder,
    changes: Vec<SecretChange>,
) -> StoreResult<(Vec<StoredChange>, Vec<String>)> {
    let mut stored = Vec::with_capacity(changes.len());
    let mut paths = Vec::with_capacity(changes.len());

    for change in changes {
        match change {
            SecretChange::Create { name, value, tags } => {
                validate_secret_name(&name)?;
                if secrets::find_live(tx, folder, &name, SecretType::Shared, None)?.is_some() {
                    return Err(StoreError::Conflict(format!(
                        "a shared secret with this name already exists in {}",
                        folder.path
                    )));
                }
                paths.push(folder.path.secret_path(&name));
                stored.push(StoredChange::Create {
                    token: blind_index::name_token(tx, &folder.project, &name)?,
                    name: tx.seal(name.as_bytes())?,
                    value: tx.seal(value.as_bytes())?,
                    tags: normalize_tags(tags),
                });
            }
            SecretChange::Update {
                secret_id,
                value,
                expected_version,
                tags,
            } => {
                let name = target_name(tx, principal, folder, &secret_id, expected_version)?;
                paths.push(folder.path.secret_path(&name));
                stored.push(StoredChange::Update {
                    secret_id,
                    base_version: expected_version,
                    value: tx.seal(value.as_bytes())?,
                    tags: tags.map(normalize_tags),
                });
            }
            SecretChange::Delete {
                secret_id,
                expected_version,
            } => {
                let name = target_name(tx, principal, folder, &secret_id, expected_version)?;
                paths.push(folder.path.secret_path(&name));
                stored.push(StoredChange::Delete {
                    secret_id,
                    base_version: expected_version,
                });
            }
        }
    }
    Ok((stored, paths))
}

/// Check an update/delete target: visible, shared, live, in `folder`, and
/// at `expected_version`.  Returns its name.
fn target_name(
    tx: &Tx<'_>,
    principal: &Principal,
    folder: &SecretFolder,
    secret_id: &str,
    expected_version: i64,
) -> StoreResult<String> {
    let row = secrets::load_visible(tx, principal, secret_id)?;
    if row.folder_id != folder.id {
        return Err(StoreError::InvalidArgument(format!(
            "secret {secret_id} is not in {}",
            folder.path
        )));
    }
    if row.secret_type != SecretType::Shared {
        return Err(StoreError::InvalidArgument(format!(
            "secret {secret_id} is personal; change sets only carry shared secrets"
        )));
    }
    if row.is_deleted {
        return Err(StoreError::NotFound {
            entity: "secret",
            id: secret_id.to_string(),
        });
    }
    if row.latest_ordinal != expected_version {
        return Err(StoreError::VersionMismatch {
            entity: "secret",
            id: secret_id.to_string(),
            expected: expected_version,
            actual: row.latest_ordinal,
        });
    }
    secrets::open_name(tx, &row)
}

/// Apply sealed changes in order.  Fails on the first change whose target
/// moved on; the caller decides whether that aborts or goes stale.
fn apply_stored(
    tx: &mut Tx<'_>,
    folder: &SecretFolder,
    changes: &[StoredChange],
) -> StoreResult<Vec<AppliedChange>> {
    let mut applied = Vec::with_capacity(changes.len());
    for change in changes {
        let outcome = match change {
            StoredChange::Create {
                name, value, tags, ..
            } => {
                let name = tx.open_string(name)?;
                AppliedChange::Created(secrets::insert(
                    tx,
                    folder,
                    &name,
                    SecretType::Shared,
                    None,
                    value.clone(),
                    tags.clone(),
                )?)
            }
            StoredChange::Update {
                secret_id,
                base_version,
                value,
                tags,
            } => {
                let row = secrets::load_row(tx.conn, secret_id)?;
                AppliedChange::Updated(secrets::append(
                    tx,
                    &row,
                    value.clone(),
                    tags.clone(),
                    *base_version,
                )?)
            }
            StoredChange::Delete {
                secret_id,
                base_version,
            } => {
                let row = secrets::load_row(tx.conn, secret_id)?;
                AppliedChange::Deleted(secrets::tombstone(tx, &row, Some(*base_version))?)
            }
        };
        applied.push(outcome);
    }
    Ok(applied)
}

/// Fail with a state error if `change` could no longer be applied.
fn check_still_applicable(tx: &Tx<'_>, folder: &SecretFolder, change: &StoredChange) -> StoreResult<()> {
    match change {
        StoredChange::Create { name, .. } => {
            if folder.is_deleted {
                return Err(StoreError::NotFound {
                    entity: "folder",
                    id: folder.id.clone(),
                });
            }
            let name = tx.open_string(name)?;
            if secrets::find_live(tx, folder, &name, SecretType::Shared, None)?.is_some() {
                return Err(StoreError::Conflict(format!(
                    "a shared secret with this name now exists in {}",
                    folder.path
                )));
            }
            Ok(())
        }
        StoredChange::Update {
            secret_id,
            base_version,
            ..
        }
        | StoredChange::Delete {
            secret_id,
            base_version,
        } => {
            let row = secrets::load_row(tx.conn, secret_id)?;
            if row.is_deleted {
                return Err(StoreError::NotFound {
                    entity: "secret",
                    id: secret_id.clone(),
                });
            }
            if row.latest_ordinal != *base_version {
                return Err(StoreError::VersionMismatch {
                    entity: "secret",
                    id: secret_id.clone(),
                    expected: *base_version,
                    actual: row.latest_ordinal,
                });
            }
            Ok(())
        }
    }
}

fn insert_request(
    tx: &mut Tx<'_>,
    folder: &SecretFolder,
    policy: &ApprovalPolicy,
    changes: &[StoredChange],
) -> StoreResult<ApprovalRequest> {
    let id = Uuid::now_v7().to_string();
    let frozen = policy.freeze();
    tx.conn.execute(
        "INSERT INTO secret_approval_requests \
         (id, project_id, environment, folder_id, path, policy_id, policy_snapshot, changes, status, requested_by, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        rusqlite::params![
            id,
            folder.project,
            folder.environment,
            folder.id,
            folder.path.as_str(),
            policy.id,
            serde_json::to_string(&frozen)?,
            serde_json::to_string(changes)?,
            RequestStatus::Pending.as_str(),
            tx.actor,
            tx.now,
        ],
    )?;

    let event = DomainEvent::new(
        EventKind::ApprovalRequestCreated,
        &folder.project,
        &folder.environment,
        folder.path.as_str(),
        &tx.actor,
        &id,
    )
    .with_detail(serde_json::json!({
        "policy_id": policy.id,
        "approvals_required": policy.approvals_required,
        "changes": changes.len(),
    }));
    tx.emit(event);
    info!(request_id = %id, policy_id = %policy.id, "approval request created");
    load_request(tx.conn, &id)
}

fn resolve(
    tx: &mut Tx<'_>,
    request: &ApprovalRequest,
    status: RequestStatus,
    resolution: Option<String>,
) -> StoreResult<()> {
    tx.conn.execute(
        "UPDATE secret_approval_requests SET status = ?2, resolution = ?3, resolved_at = ?4 WHERE id = ?1",
        rusqlite::params![request.id, status.as_str(), resolution, tx.now],
    )?;
    let event = DomainEvent::new(
        EventKind::ApprovalRequestResolved,
        &request.project,
        &request.environment,
        request.path.as_str(),
        &tx.actor,
        &request.id,
    )
    .with_detail(serde_json::json!({
        "status": status.as_str(),
        "resolution": resolution,
    }));
    tx.emit(event);
    info!(request_id = %request.id, status = %status, "approval request resolved");
    Ok(())
}

fn request_scope(request: &ApprovalRequest) -> Scope {
    Scope {
        project: request.project.clone(),
        environment: request.environment.clone(),
        path: request.path.clone(),
    }
}

fn load_changes(conn: &Connection, request_id: &str) -> StoreResult<Vec<StoredChange>> {
    let json: String = conn.query_row(
        "SELECT changes FROM secret_approval_requests WHERE id = ?1",
        rusqlite::params![request_id],
        |row| row.get(0),
    )?;
    Ok(serde_json::from_str(&json)?)
}

fn load_request(conn: &Connection, request_id: &str) -> StoreResult<ApprovalRequest> {
    let row = conn
        .query_row(
            "SELECT id, project_id, environment, folder_id, path, policy_snapshot, changes, status, \
             requested_by, resolution, created_at, resolved_at \
             FROM secret_approval_requests WHERE id = ?1",
            rusqlite::params![request_id],
            |row| {
                Ok(RequestRow {
                    id: row.get(0)?,
                    project: row.get(1)?,
                    environment: row.get(2)?,
                    folder_id: row.get(3)?,
                    path: row.get(4)?,
                    policy: row.get(5)?,
                    changes: row.get(6)?,
                    status: row.get(7)?,
                    requested_by: row.get(8)?,
                    resolution: row.get(9)?,
                    created_at: row.get(10)?,
                    resolved_at: row.get(11)?,
                })
            },
        )
        .optional()?
        .ok_or_else(|| StoreError::NotFound {
            entity: "approval request",
            id: request_id.to_string(),
        })?;

    let votes: Vec<(String, String, i64)> = {
        let mut stmt = conn.prepare(
            "SELECT reviewer_id, decision, created_at FROM sar_reviewers \
             WHERE request_id = ?1 ORDER BY created_at, reviewer_id",
        )?;
        stmt.query_map(rusqlite::params![request_id], |r| {
            Ok((r.get(0)?, r.get(1)?, r.get(2)?))
        })?
        .collect::<Result<Vec<_>, _>>()?
    };
    let votes = votes
        .into_iter()
        .map(|(reviewer, decision, created_at)| {
            let decision = VoteDecision::parse(&decision).ok_or_else(|| {
                StoreError::InvalidArgument(format!("unknown vote decision `{decision}`"))
            })?;
            Ok(Vote {
                reviewer,
                decision,
                created_at,
            })
        })
        .collect::<StoreResult<Vec<_>>>()?;

    row.into_request(votes)
}

// ═══════════════════════════════════════════════════════════════════════
//  Row types
// ═══════════════════════════════════════════════════════════════════════

struct PolicyRow {
    id: String,
    project: String,
    environment: String,
    secret_path: String,
    name: String,
    approvals_required: u32,
    enforcement: String,
    soft_reject_rule: String,
    flag_overridden_rejections: bool,
    created_at: i64,
    updated_at: i64,
}

impl PolicyRow {
    fn into_policy(self, approvers: Vec<String>) -> StoreResult<ApprovalPolicy> {
        let enforcement = EnforcementLevel::parse(&self.enforcement).ok_or_else(|| {
            StoreError::InvalidArgument(format!("unknown enforcement `{}`", self.enforcement))
        })?;
        let soft_reject_rule = SoftRejectRule::parse(&self.soft_reject_rule).ok_or_else(|| {
            StoreError::InvalidArgument(format!("unknown soft reject rule `{}`", self.soft_reject_rule))
        })?;
        Ok(ApprovalPolicy {
            id: self.id,
            project: self.project,
            environment: self.environment,
            name: self.name,
            secret_path: PathPattern::parse(&self.secret_path)?,
            approvals_required: self.approvals_required,
            approvers,
            enforcement,
            soft_reject_rule,
            flag_overridden_rejections: self.flag_overridden_rejections,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

struct RequestRow {
    id: String,
    project: String,
    environment: String,
    folder_id: String,
    path: String,
    policy: String,
    changes: String,
    status: String,
    requested_by: String,
    resolution: Option<String>,
    created_at: i64,
    resolved_at: Option<i64>,
}

impl RequestRow {
    fn into_request(self, votes: Vec<Vote>) -> StoreResult<ApprovalRequest> {
        let status = RequestStatus::parse(&self.status).ok_or_else(|| {
            StoreError::InvalidArgument(format!("unknown request status `{}`", self.status))
        })?;
        let changes: Vec<StoredChange> = serde_json::from_str(&self.changes)?;
        Ok(ApprovalRequest {
            id: self.id,
            project: self.project,
            environment: self.environment,
            folder_id: self.folder_id,
            path: SecretPath::parse(&self.path)?,
            policy: serde_json::from_str(&self.policy)?,
            changes: changes.iter().map(StoredChange::summary).collect(),
            status,
            requested_by: self.requested_by,
            votes,
            resolution: self.resolution,
            created_at: self.created_at,
            resolved_at: self.resolved_at,
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(enforcement: EnforcementLevel, rule: SoftRejectRule, threshold: u32) -> PolicySnapshot {
        PolicySnapshot {
            policy_id: "p".into(),
            name: "prod".into(),
            approvals_required: threshold,
            approvers: vec!["a".into(), "b".into(), "c".into()],
            enforcement,
            soft_reject_rule: rule,
            flag_overridden_rejections: true,
        }
    }

    #[test]
    fn hard_rejects_on_first_rejection() {
        let p = policy(EnforcementLevel::Hard, SoftRejectRule::ThresholdWins, 2);
        assert_eq!(evaluate(&p, 1, 0), Verdict::Wait);
        assert!(matches!(evaluate(&p, 1, 1), Verdict::Reject(_)));
        assert_eq!(evaluate(&p, 2, 0), Verdict::Apply);
    }

    #[test]
    fn soft_threshold_wins_over_rejections() {
        let p = policy(EnforcementLevel::Soft, SoftRejectRule::ThresholdWins, 2);
        assert_eq!(evaluate(&p, 0, 1), Verdict::Wait);
        assert_eq!(evaluate(&p, 2, 1), Verdict::Apply);
    }

    #[test]
    fn soft_net_approvals_cancel_out() {
        let p = policy(EnforcementLevel::Soft, SoftRejectRule::NetApprovals, 1);
        assert_eq!(evaluate(&p, 1, 0), Verdict::Apply);
        // One approval cancelled by one rejection, one voter left.
        assert_eq!(evaluate(&p, 1, 1), Verdict::Wait);
        assert!(matches!(evaluate(&p, 1, 2), Verdict::Reject(_)));
    }

    #[test]
    fn soft_unreachable_threshold_rejects() {
        let p = policy(EnforcementLevel::Soft, SoftRejectRule::ThresholdWins, 3);
        assert!(matches!(evaluate(&p, 0, 1), Verdict::Reject(_)));
    }

    #[test]
    fn policy_validation() {
        let ok = NewApprovalPolicy::new("prod", "prod", "/**", 2, vec!["a".into(), "b".into()]);
        assert!(ok.validate().is_ok());

        let too_many = NewApprovalPolicy::new("prod", "prod", "/**", 3, vec!["a".into(), "a".into()]);
        assert!(too_many.validate().is_err());

        let zero = NewApprovalPolicy::new("prod", "prod", "/**", 0, vec!["a".into()]);
        assert!(zero.validate().is_err());

        let relative = NewApprovalPolicy::new("prod", "prod", "prod/*", 1, vec!["a".into()]);
        assert!(relative.validate().is_err());
    }

    #[test]
    fn status_terminality() {
        assert!(!RequestStatus::Pending.is_terminal());
        for s in [RequestStatus::Approved, RequestStatus::Rejected, RequestStatus::Stale] {
            assert!(s.is_terminal());
            assert_eq!(RequestStatus::parse(s.as_str()), Some(s));
        }
    }
}
