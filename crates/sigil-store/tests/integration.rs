//! Integration tests for the sigil-store crate.
//!
//! These tests drive the assembled [`SecretsCore`] through its public
//! engines: secret versioning, blind-index lookup, personal overrides,
//! approvals, snapshots and rollback, rotation and imports.  Most run
//! against an in-memory database; the lifecycle test uses a real file
//! (via tempfile).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sigil_kernel::{EventKind, KernelError};
use sigil_store::{
    ApprovalPolicy, EnforcementLevel, NewApprovalPolicy, OpContext, Principal, RequestStatus,
    RotationRegistry, RotationRequest, RotationStatus, RotationStrategy, Scope, ScopeGrant,
    SecretChange, SecretType, SecretsCore, SoftRejectRule, SnapshotTrigger, StoreConfig,
    StoreError, Submission, VoteDecision,
};
use sigil_vault::KeyRef;

const PROJECT: &str = "billing";

// ═══════════════════════════════════════════════════════════════════════
//  Helpers
// ═══════════════════════════════════════════════════════════════════════

struct Fixture {
    core: SecretsCore,
    key: KeyRef,
}

impl Fixture {
    async fn new() -> Self {
        Self::with_registry(RotationRegistry::new(), StoreConfig::default()).await
    }

    async fn with_registry(registry: RotationRegistry, config: StoreConfig) -> Self {
        let core = SecretsCore::open_in_memory(registry, config).await.unwrap();
        let key = KeyRef::generate(PROJECT).unwrap();
        let fixture = Self { core, key };
        fixture
            .core
            .blind_index()
            .register_key(&fixture.ctx("admin"), PROJECT)
            .await
            .unwrap();
        fixture
    }

    /// Context for a principal with access to the whole project.
    fn ctx(&self, id: &str) -> OpContext {
        OpContext::new(
            Principal::new(id).with_grant(ScopeGrant::project_wide(PROJECT)),
            self.key.clone(),
        )
    }

    async fn value_of(&self, ctx: &OpContext, scope: &Scope, name: &str) -> String {
        let secret = self.core.secrets().resolve(ctx, scope, name).await.unwrap();
        self.core.secrets().reveal(ctx, &secret.version).unwrap()
    }

    async fn prod_policy(&self, policy: NewApprovalPolicy) -> ApprovalPolicy {
        self.core
            .approvals()
            .create_policy(&self.ctx("admin"), PROJECT, policy)
            .await
            .unwrap()
    }
}

fn scope(environment: &str, path: &str) -> Scope {
    Scope::new(PROJECT, environment, path).unwrap()
}

fn reviewers() -> Vec<String> {
    vec!["bob".into(), "dave".into(), "erin".into()]
}

// ═══════════════════════════════════════════════════════════════════════
//  Database lifecycle
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn secrets_survive_reopening_the_database() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("sigil.db");
    let key = KeyRef::generate(PROJECT).unwrap();
    let ctx = OpContext::new(
        Principal::new("alice").with_grant(ScopeGrant::project_wide(PROJECT)),
        key,
    );
    let root = scope("dev", "/");

    {
        let core = SecretsCore::open(db_path.clone(), RotationRegistry::new(), StoreConfig::default())
            .await
            .unwrap();
        core.blind_index().register_key(&ctx, PROJECT).await.unwrap();
        core.secrets()
            .create_secret(&ctx, &root, "API_TOKEN", SecretType::Shared, "t0k3n", vec![])
            .await
            .unwrap();
    }

    let core = SecretsCore::open(db_path, RotationRegistry::new(), StoreConfig::default())
        .await
        .unwrap();
    let secret = core
        .secrets()
        .get_by_name(&ctx, &root, "API_TOKEN", SecretType::Shared)
        .await
        .unwrap();
    assert_eq!(core.secrets().reveal(&ctx, &secret.version).unwrap(), "t0k3n");
}

// ═══════════════════════════════════════════════════════════════════════
//  Secret store
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn update_appends_versions_in_order() {
    let fx = Fixture::new().await;
    let alice = fx.ctx("alice");
    let prod = scope("prod", "/");
    let store = fx.core.secrets();

    let created = store
        .create_secret(&alice, &prod, "DB_PASSWORD", SecretType::Shared, "x", vec!["db".into()])
        .await
        .unwrap();
    assert_eq!(created.version.ordinal, 1);

    let v2 = store
        .update_secret(&alice, &created.id, "y", 1, None)
        .await
        .unwrap();
    assert_eq!(v2.ordinal, 2);
    assert_eq!(v2.tags, vec!["db".to_string()]);

    let versions = store.list_versions(&alice, &created.id).await.unwrap();
    let values: Vec<String> = versions
        .iter()
        .map(|v| store.reveal(&alice, v).unwrap())
        .collect();
    assert_eq!(values, vec!["x", "y"]);
    assert_eq!(versions[0].author, "alice");

    let current = store
        .get_by_name(&alice, &prod, "DB_PASSWORD", SecretType::Shared)
        .await
        .unwrap();
    assert_eq!(current.version.id, v2.id);
    assert_eq!(store.reveal(&alice, &current.version).unwrap(), "y");

    let first = store.get_version(&alice, &created.id, 1).await.unwrap();
    assert_eq!(store.reveal(&alice, &first).unwrap(), "x");
}

#[tokio::test]
async fn concurrent_updates_with_same_expected_version() {
    let fx = Fixture::new().await;
    let alice = fx.ctx("alice");
    let bob = fx.ctx("bob");
    let store = fx.core.secrets();
    let secret = store
        .create_secret(&alice, &scope("dev", "/"), "COUNTER", SecretType::Shared, "0", vec![])
        .await
        .unwrap();

    let (a, b) = tokio::join!(
        store.update_secret(&alice, &secret.id, "alice", 1, None),
        store.update_secret(&bob, &secret.id, "bob", 1, None),
    );

    let outcomes = [a, b];
    assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
    let mismatch = outcomes.into_iter().find_map(Result::err).unwrap();
    assert!(matches!(
        mismatch,
        StoreError::VersionMismatch { expected: 1, actual: 2, .. }
    ));
    assert_eq!(store.list_versions(&alice, &secret.id).await.unwrap().len(), 2);
}

#[tokio::test]
async fn names_are_unique_case_insensitively() {
    let fx = Fixture::new().await;
    let alice = fx.ctx("alice");
    let dev = scope("dev", "/");
    let store = fx.core.secrets();

    store
        .create_secret(&alice, &dev, "DB_PASSWORD", SecretType::Shared, "x", vec![])
        .await
        .unwrap();
    let err = store
        .create_secret(&alice, &dev, "db_password", SecretType::Shared, "y", vec![])
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Conflict(_)));

    // Same name in another environment is a different scope.
    store
        .create_secret(&alice, &scope("staging", "/"), "DB_PASSWORD", SecretType::Shared, "z", vec![])
        .await
        .unwrap();
}

#[tokio::test]
async fn deleted_secret_frees_its_name() {
    let fx = Fixture::new().await;
    let alice = fx.ctx("alice");
    let dev = scope("dev", "/");
    let store = fx.core.secrets();

    let secret = store
        .create_secret(&alice, &dev, "OLD_KEY", SecretType::Shared, "v", vec![])
        .await
        .unwrap();
    let marker = store.delete_secret(&alice, &secret.id, Some(1)).await.unwrap();
    assert!(marker.is_deletion_marker);
    assert!(marker.value.is_none());
    assert_eq!(marker.ordinal, 2);

    let err = store
        .get_by_name(&alice, &dev, "OLD_KEY", SecretType::Shared)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::NotFound { .. }));

    let err = store
        .update_secret(&alice, &secret.id, "again", 2, None)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::NotFound { .. }));

    // History stays readable and the name is reusable.
    assert!(store.get(&alice, &secret.id).await.unwrap().is_deleted);
    let fresh = store
        .create_secret(&alice, &dev, "OLD_KEY", SecretType::Shared, "new", vec![])
        .await
        .unwrap();
    assert_ne!(fresh.id, secret.id);
}

#[tokio::test]
async fn personal_secret_overrides_shared_for_its_owner_only() {
    let fx = Fixture::new().await;
    let alice = fx.ctx("alice");
    let bob = fx.ctx("bob");
    let dev = scope("dev", "/");
    let store = fx.core.secrets();

    store
        .create_secret(&alice, &dev, "DB_PASSWORD", SecretType::Shared, "shared", vec![])
        .await
        .unwrap();
    let personal = store
        .create_secret(&alice, &dev, "DB_PASSWORD", SecretType::Personal, "mine", vec![])
        .await
        .unwrap();
    assert_eq!(personal.owner.as_deref(), Some("alice"));

    assert_eq!(fx.value_of(&alice, &dev, "DB_PASSWORD").await, "mine");
    assert_eq!(fx.value_of(&bob, &dev, "DB_PASSWORD").await, "shared");

    // Bob cannot see or touch Alice's personal secret.
    let err = store.get(&bob, &personal.id).await.unwrap_err();
    assert!(matches!(err, StoreError::NotFound { .. }));
    let err = store
        .update_secret(&bob, &personal.id, "stolen", 1, None)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::NotFound { .. }));

    // Bob may hold his own personal value of the same name.
    store
        .create_secret(&bob, &dev, "DB_PASSWORD", SecretType::Personal, "bobs", vec![])
        .await
        .unwrap();
    assert_eq!(fx.value_of(&bob, &dev, "DB_PASSWORD").await, "bobs");

    let listed = store.list_secrets(&alice, &dev).await.unwrap();
    assert_eq!(listed.len(), 2, "alice sees the shared and her personal secret");
}

#[tokio::test]
async fn writes_emit_events_after_commit() {
    let fx = Fixture::new().await;
    let alice = fx.ctx("alice");
    let mut events = fx.core.events().subscribe();

    let secret = fx
        .core
        .secrets()
        .create_secret(&alice, &scope("dev", "/"), "API_URL", SecretType::Shared, "u", vec![])
        .await
        .unwrap();
    let event = events.try_recv().unwrap();
    assert_eq!(event.kind, EventKind::SecretCreated);
    assert_eq!(event.entity_id, secret.id);
    assert_eq!(event.actor, "alice");

    // A failed write publishes nothing.
    let _ = fx
        .core
        .secrets()
        .update_secret(&alice, &secret.id, "u2", 7, None)
        .await
        .unwrap_err();
    assert!(events.try_recv().is_err());
}

// ═══════════════════════════════════════════════════════════════════════
//  Scopes and blind index
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn project_without_index_key_is_invalid_scope() {
    let fx = Fixture::new().await;
    let ctx = OpContext::new(
        Principal::new("alice").with_grant(ScopeGrant::project_wide("payroll")),
        fx.key.clone(),
    );
    let err = fx
        .core
        .secrets()
        .create_secret(
            &ctx,
            &Scope::new("payroll", "dev", "/").unwrap(),
            "X",
            SecretType::Shared,
            "v",
            vec![],
        )
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::InvalidScope { .. }));
}

#[tokio::test]
async fn grants_limit_environment_and_path() {
    let fx = Fixture::new().await;
    let narrow = OpContext::new(
        Principal::new("intern").with_grant(ScopeGrant::new(PROJECT, "dev", "/app/**").unwrap()),
        fx.key.clone(),
    );
    fx.core
        .folders()
        .ensure_path(&fx.ctx("admin"), &scope("dev", "/app/db"))
        .await
        .unwrap();

    fx.core
        .secrets()
        .create_secret(&narrow, &scope("dev", "/app/db"), "URL", SecretType::Shared, "v", vec![])
        .await
        .unwrap();

    for denied in [scope("prod", "/app"), scope("dev", "/"), scope("dev", "/other")] {
        let err = fx
            .core
            .secrets()
            .create_secret(&narrow, &denied, "URL", SecretType::Shared, "v", vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ScopeDenied { .. }), "{denied}");
    }
}

#[tokio::test]
async fn blind_index_search_finds_secret_by_token() {
    let fx = Fixture::new().await;
    let alice = fx.ctx("alice");
    let dev = scope("dev", "/");

    assert!(!fx.core.blind_index().register_key(&alice, PROJECT).await.unwrap());

    let secret = fx
        .core
        .secrets()
        .create_secret(&alice, &dev, "STRIPE_KEY", SecretType::Shared, "sk", vec![])
        .await
        .unwrap();
    let token = fx.core.blind_index().index(&alice, &dev, "stripe_key").await.unwrap();
    assert_eq!(token, secret.version.blind_index);

    let hit = fx.core.blind_index().search(&alice, &dev, &token).await.unwrap().unwrap();
    assert_eq!(hit.secret_id, secret.id);

    let other = fx.core.blind_index().index(&alice, &dev, "OTHER").await.unwrap();
    assert!(fx.core.blind_index().search(&alice, &dev, &other).await.unwrap().is_none());
}

// ═══════════════════════════════════════════════════════════════════════
//  Folders
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn folder_versions_track_structure_only() {
    let fx = Fixture::new().await;
    let alice = fx.ctx("alice");
    let folders = fx.core.folders();

    let (root, root_v1) = folders.root(&alice, PROJECT, "dev").await.unwrap();
    assert_eq!(root_v1.ordinal, 1);

    let (app, _) = folders.upsert_folder(&alice, &root_v1.id, "app").await.unwrap();
    // The parent moved on, so the old version id is stale.
    let err = folders.upsert_folder(&alice, &root_v1.id, "web").await.unwrap_err();
    assert!(matches!(err, StoreError::VersionMismatch { .. }));

    let (_, root_v2) = folders.root(&alice, PROJECT, "dev").await.unwrap();
    assert_eq!(root_v2.children, vec!["app".to_string()]);
    let (again, _) = folders.upsert_folder(&alice, &root_v2.id, "app").await.unwrap();
    assert_eq!(again.id, app.id);

    // Secret writes bump only the owning folder's revision.
    fx.core
        .secrets()
        .create_secret(&alice, &scope("dev", "/app"), "K", SecretType::Shared, "v", vec![])
        .await
        .unwrap();
    let app_now = folders.get(&alice, &scope("dev", "/app")).await.unwrap();
    assert_eq!(app_now.current_version_id, app.current_version_id);
    assert_eq!(app_now.secrets_revision, app.secrets_revision + 1);
    let root_now = folders.get(&alice, &scope("dev", "/")).await.unwrap();
    assert_eq!(root_now.current_version_id, root_v2.id);
    assert_eq!(root_now.secrets_revision, root.secrets_revision);

    let err = folders.delete_folder(&alice, &scope("dev", "/app")).await.unwrap_err();
    assert!(matches!(err, StoreError::Conflict(_)));

    let err = fx
        .core
        .secrets()
        .create_secret(&alice, &scope("dev", "/missing"), "K", SecretType::Shared, "v", vec![])
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::NotFound { .. }));
}

// ═══════════════════════════════════════════════════════════════════════
//  Approvals
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn protected_update_waits_for_two_of_three_reviewers() {
    let fx = Fixture::new().await;
    let alice = fx.ctx("alice");
    let prod = scope("prod", "/prod");
    fx.core.folders().ensure_path(&alice, &prod).await.unwrap();
    let secret = fx
        .core
        .secrets()
        .create_secret(&alice, &prod, "DB_PASSWORD", SecretType::Shared, "x", vec![])
        .await
        .unwrap();

    let policy = fx
        .prod_policy(NewApprovalPolicy::new("prod-gate", "prod", "/prod/*", 2, reviewers()))
        .await;

    // Direct writes are refused once a policy covers the path.
    let err = fx
        .core
        .secrets()
        .update_secret(&alice, &secret.id, "sneaky", 1, None)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::ApprovalRequired { ref policy_id } if *policy_id == policy.id));

    let submission = fx
        .core
        .approvals()
        .submit(
            &alice,
            &prod,
            vec![SecretChange::Update {
                secret_id: secret.id.clone(),
                value: "y".into(),
                expected_version: 1,
                tags: None,
            }],
        )
        .await
        .unwrap();
    let Submission::Deferred(request) = submission else {
        panic!("expected a deferred submission");
    };
    assert_eq!(request.status, RequestStatus::Pending);
    assert_eq!(request.policy.approvals_required, 2);
    assert_eq!(fx.value_of(&alice, &prod, "DB_PASSWORD").await, "x");

    let approvals = fx.core.approvals();
    let preview = approvals.preview(&fx.ctx("bob"), &request.id).await.unwrap();
    assert_eq!(preview[0].name, "DB_PASSWORD");
    assert_eq!(preview[0].value.as_deref(), Some("y"));

    let err = approvals
        .cast_vote(&fx.ctx("carol"), &request.id, VoteDecision::Approve)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Ineligible { .. }));

    let after_one = approvals
        .cast_vote(&fx.ctx("bob"), &request.id, VoteDecision::Approve)
        .await
        .unwrap();
    assert_eq!(after_one.status, RequestStatus::Pending);
    let err = approvals
        .cast_vote(&fx.ctx("bob"), &request.id, VoteDecision::Approve)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::AlreadyVoted { .. }));

    let decided = approvals
        .cast_vote(&fx.ctx("dave"), &request.id, VoteDecision::Approve)
        .await
        .unwrap();
    assert_eq!(decided.status, RequestStatus::Approved);
    assert_eq!(decided.approvals(), 2);

    let versions = fx.core.secrets().list_versions(&alice, &secret.id).await.unwrap();
    assert_eq!(versions.len(), 2, "the approved change bumps the version exactly once");
    assert_eq!(versions[1].author, "alice");
    assert_eq!(fx.value_of(&alice, &prod, "DB_PASSWORD").await, "y");

    let err = approvals
        .cast_vote(&fx.ctx("erin"), &request.id, VoteDecision::Approve)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::RequestClosed { .. }));
}

#[tokio::test]
async fn hard_rejection_closes_request_without_applying() {
    let fx = Fixture::new().await;
    let alice = fx.ctx("alice");
    let prod = scope("prod", "/");
    fx.prod_policy(NewApprovalPolicy::new("all-prod", "prod", "/**", 2, reviewers()))
        .await;

    let Submission::Deferred(request) = fx
        .core
        .approvals()
        .submit(
            &alice,
            &prod,
            vec![SecretChange::Create {
                name: "NEW_KEY".into(),
                value: "v".into(),
                tags: vec![],
            }],
        )
        .await
        .unwrap()
    else {
        panic!("expected a deferred submission");
    };

    let rejected = fx
        .core
        .approvals()
        .cast_vote(&fx.ctx("erin"), &request.id, VoteDecision::Reject)
        .await
        .unwrap();
    assert_eq!(rejected.status, RequestStatus::Rejected);
    assert!(rejected.resolved_at.is_some());

    let err = fx
        .core
        .secrets()
        .get_by_name(&alice, &prod, "NEW_KEY", SecretType::Shared)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::NotFound { .. }));
}

#[tokio::test]
async fn soft_policy_lets_threshold_win_over_rejection() {
    let fx = Fixture::new().await;
    let alice = fx.ctx("alice");
    let prod = scope("prod", "/");
    let policy = fx
        .prod_policy(
            NewApprovalPolicy::new("soft-prod", "prod", "/**", 1, vec!["bob".into(), "dave".into()])
                .soft(SoftRejectRule::ThresholdWins),
        )
        .await;
    assert_eq!(policy.enforcement, EnforcementLevel::Soft);

    let Submission::Deferred(request) = fx
        .core
        .approvals()
        .submit(
            &alice,
            &prod,
            vec![SecretChange::Create {
                name: "FEATURE_FLAG".into(),
                value: "on".into(),
                tags: vec![],
            }],
        )
        .await
        .unwrap()
    else {
        panic!("expected a deferred submission");
    };

    let pending = fx
        .core
        .approvals()
        .cast_vote(&fx.ctx("bob"), &request.id, VoteDecision::Reject)
        .await
        .unwrap();
    assert_eq!(pending.status, RequestStatus::Pending);

    let approved = fx
        .core
        .approvals()
        .cast_vote(&fx.ctx("dave"), &request.id, VoteDecision::Approve)
        .await
        .unwrap();
    assert_eq!(approved.status, RequestStatus::Approved);
    assert_eq!(approved.resolution.as_deref(), Some("approved over 1 rejection(s)"));
    assert_eq!(fx.value_of(&alice, &prod, "FEATURE_FLAG").await, "on");
}

#[tokio::test]
async fn request_goes_stale_when_target_moves() {
    let fx = Fixture::new().await;
    let alice = fx.ctx("alice");
    let prod = scope("prod", "/");
    let secret = fx
        .core
        .secrets()
        .create_secret(&alice, &prod, "DB_PASSWORD", SecretType::Shared, "x", vec![])
        .await
        .unwrap();
    fx.prod_policy(NewApprovalPolicy::new("one-approver", "prod", "/**", 1, reviewers()))
        .await;

    let approvals = fx.core.approvals();
    let mut requests = Vec::new();
    for value in ["a", "b", "c"] {
        let change = SecretChange::Update {
            secret_id: secret.id.clone(),
            value: value.into(),
            expected_version: 1,
            tags: None,
        };
        match approvals.submit(&alice, &prod, vec![change]).await.unwrap() {
            Submission::Deferred(request) => requests.push(request),
            Submission::Applied(_) => panic!("expected a deferred submission"),
        }
    }

    let first = approvals
        .cast_vote(&fx.ctx("bob"), &requests[0].id, VoteDecision::Approve)
        .await
        .unwrap();
    assert_eq!(first.status, RequestStatus::Approved);

    let refreshed = approvals.refresh(&alice, &requests[1].id).await.unwrap();
    assert_eq!(refreshed.status, RequestStatus::Stale);

    let third = approvals
        .cast_vote(&fx.ctx("bob"), &requests[2].id, VoteDecision::Approve)
        .await
        .unwrap();
    assert_eq!(third.status, RequestStatus::Stale);
    assert!(third.resolution.unwrap().contains("expected 1"));
    assert_eq!(third.votes.len(), 1, "the deciding vote is kept for audit");

    assert_eq!(fx.value_of(&alice, &prod, "DB_PASSWORD").await, "a");
    let stale = approvals
        .list_requests(&alice, &prod, Some(RequestStatus::Stale))
        .await
        .unwrap();
    assert_eq!(stale.len(), 2);
}

#[tokio::test]
async fn uncovered_submission_applies_immediately() {
    let fx = Fixture::new().await;
    let alice = fx.ctx("alice");
    fx.prod_policy(NewApprovalPolicy::new("prod-only", "prod", "/**", 1, reviewers()))
        .await;

    let submission = fx
        .core
        .approvals()
        .submit(
            &alice,
            &scope("dev", "/"),
            vec![SecretChange::Create {
                name: "LOG_LEVEL".into(),
                value: "debug".into(),
                tags: vec![],
            }],
        )
        .await
        .unwrap();
    assert!(matches!(submission, Submission::Applied(ref changes) if changes.len() == 1));
    assert_eq!(fx.value_of(&alice, &scope("dev", "/"), "LOG_LEVEL").await, "debug");
}

#[tokio::test]
async fn policy_threshold_cannot_exceed_approvers() {
    let fx = Fixture::new().await;
    let err = fx
        .core
        .approvals()
        .create_policy(
            &fx.ctx("admin"),
            PROJECT,
            NewApprovalPolicy::new("too-strict", "prod", "/**", 4, reviewers()),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::InvalidArgument(_)));
}

// ═══════════════════════════════════════════════════════════════════════
//  Snapshots
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn rollback_right_after_snapshot_changes_nothing() {
    let fx = Fixture::new().await;
    let alice = fx.ctx("alice");
    let root = scope("dev", "/");
    fx.core.folders().ensure_path(&alice, &scope("dev", "/app")).await.unwrap();
    for (path, name) in [("/", "A"), ("/app", "B")] {
        fx.core
            .secrets()
            .create_secret(&alice, &scope("dev", path), name, SecretType::Shared, "v", vec![])
            .await
            .unwrap();
    }

    let snapshot = fx
        .core
        .snapshots()
        .snapshot(&alice, &root, SnapshotTrigger::Manual)
        .await
        .unwrap();
    assert_eq!(snapshot.secret_count, 2);
    assert_eq!(snapshot.folder_count, 2);

    let report = fx.core.snapshots().rollback(&alice, &snapshot.id).await.unwrap();
    assert!(report.is_noop());
    assert_eq!(report.unchanged, 2);
    assert_ne!(report.safety_snapshot_id, snapshot.id);
}

#[tokio::test]
async fn rollback_restores_values_and_removes_newcomers() {
    let fx = Fixture::new().await;
    let alice = fx.ctx("alice");
    let dev = scope("dev", "/");
    let store = fx.core.secrets();

    let kept = store
        .create_secret(&alice, &dev, "KEPT", SecretType::Shared, "k1", vec![])
        .await
        .unwrap();
    let removed = store
        .create_secret(&alice, &dev, "REMOVED", SecretType::Shared, "r1", vec![])
        .await
        .unwrap();
    let snapshot = fx
        .core
        .snapshots()
        .snapshot(&alice, &dev, SnapshotTrigger::Manual)
        .await
        .unwrap();

    store.update_secret(&alice, &kept.id, "k2", 1, None).await.unwrap();
    store.delete_secret(&alice, &removed.id, None).await.unwrap();
    let newcomer = store
        .create_secret(&alice, &dev, "NEWCOMER", SecretType::Shared, "n", vec![])
        .await
        .unwrap();

    let report = fx.core.snapshots().rollback(&alice, &snapshot.id).await.unwrap();
    assert_eq!(report.deleted, vec![newcomer.id.clone()]);
    assert_eq!(report.restored.len(), 2);

    assert_eq!(fx.value_of(&alice, &dev, "KEPT").await, "k1");
    assert_eq!(fx.value_of(&alice, &dev, "REMOVED").await, "r1");
    let err = store.resolve(&alice, &dev, "NEWCOMER").await.unwrap_err();
    assert!(matches!(err, StoreError::NotFound { .. }));

    // History is appended, never rewritten.
    let versions = store.list_versions(&alice, &kept.id).await.unwrap();
    assert_eq!(versions.iter().map(|v| v.ordinal).collect::<Vec<_>>(), vec![1, 2, 3]);

    // The safety snapshot undoes the rollback.
    let undo = fx
        .core
        .snapshots()
        .rollback(&alice, &report.safety_snapshot_id)
        .await
        .unwrap();
    assert!(undo.restored.contains(&newcomer.id));
    assert_eq!(fx.value_of(&alice, &dev, "KEPT").await, "k2");

    let listed = fx.core.snapshots().list_snapshots(&alice, &dev).await.unwrap();
    assert_eq!(listed.len(), 3);
}

#[tokio::test]
async fn rollback_of_unknown_snapshot_fails() {
    let fx = Fixture::new().await;
    let err = fx
        .core
        .snapshots()
        .rollback(&fx.ctx("alice"), "does-not-exist")
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::SnapshotNotFound(_)));
}

// ═══════════════════════════════════════════════════════════════════════
//  Rotation
// ═══════════════════════════════════════════════════════════════════════

struct Fixed(&'static str);

#[async_trait]
impl RotationStrategy for Fixed {
    async fn rotate(&self, _request: &RotationRequest) -> sigil_kernel::Result<String> {
        Ok(self.0.to_string())
    }
}

struct Broken;

#[async_trait]
impl RotationStrategy for Broken {
    async fn rotate(&self, _request: &RotationRequest) -> sigil_kernel::Result<String> {
        Err(KernelError::StrategyFailed {
            strategy: "broken".into(),
            reason: "upstream refused".into(),
        })
    }
}

struct Slow;

#[async_trait]
impl RotationStrategy for Slow {
    async fn rotate(&self, _request: &RotationRequest) -> sigil_kernel::Result<String> {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok("too late".into())
    }
}

async fn rotation_fixture() -> Fixture {
    let registry = RotationRegistry::new();
    registry.register("fixed", "Always the same value", Arc::new(Fixed("rotated")));
    registry.register("broken", "Always fails", Arc::new(Broken));
    registry.register("slow", "Never answers in time", Arc::new(Slow));
    let config = StoreConfig {
        strategy_timeout: Duration::from_millis(50),
        ..StoreConfig::default()
    };
    Fixture::with_registry(registry, config).await
}

#[tokio::test]
async fn rotation_appends_a_version() {
    let fx = rotation_fixture().await;
    let alice = fx.ctx("alice");
    let dev = scope("dev", "/");
    let secret = fx
        .core
        .secrets()
        .create_secret(&alice, &dev, "DB_PASSWORD", SecretType::Shared, "old", vec![])
        .await
        .unwrap();
    let rotation = fx
        .core
        .rotations()
        .create_rotation(&alice, &secret.id, Duration::from_secs(3600), "fixed")
        .await
        .unwrap();
    let mut events = fx.core.events().subscribe();

    let output = fx.core.rotations().rotate_now(&alice, &rotation.id).await.unwrap();
    assert_eq!(output.status, RotationStatus::Success);
    assert_eq!(fx.value_of(&alice, &dev, "DB_PASSWORD").await, "rotated");

    let kinds: Vec<EventKind> = std::iter::from_fn(|| events.try_recv().ok())
        .map(|e| e.kind)
        .collect();
    assert_eq!(kinds, vec![EventKind::SecretUpdated, EventKind::RotationCompleted]);

    // Just rotated, so nothing is due.
    assert!(fx.core.rotations().rotate_due(&alice).await.unwrap().is_empty());
    assert_eq!(fx.core.rotations().registry().info("fixed").unwrap().successes, 1);
}

#[tokio::test]
async fn longest_interval_is_not_due_after_a_rotation() {
    let fx = rotation_fixture().await;
    let alice = fx.ctx("alice");
    let dev = scope("dev", "/");
    let secret = fx
        .core
        .secrets()
        .create_secret(&alice, &dev, "SIGNING_KEY", SecretType::Shared, "old", vec![])
        .await
        .unwrap();
    let rotations = fx.core.rotations();
    let rotation = rotations
        .create_rotation(&alice, &secret.id, Duration::from_secs(u64::MAX), "fixed")
        .await
        .unwrap();
    assert_eq!(rotation.interval_secs, i64::MAX);
    assert!(rotations.due_rotations(&alice, 0).await.unwrap().len() == 1);

    rotations.rotate_now(&alice, &rotation.id).await.unwrap();
    let rotated = rotations.get_rotation(&alice, &rotation.id).await.unwrap();
    let later = rotated.last_rotated_at.unwrap() + 1_000_000;

    assert!(!rotated.is_due(later));
    assert!(rotations.due_rotations(&alice, later).await.unwrap().is_empty());
}

#[tokio::test]
async fn failed_rotation_is_recorded_and_leaves_secret_untouched() {
    let fx = rotation_fixture().await;
    let alice = fx.ctx("alice");
    let dev = scope("dev", "/");
    let secret = fx
        .core
        .secrets()
        .create_secret(&alice, &dev, "API_KEY", SecretType::Shared, "old", vec![])
        .await
        .unwrap();

    let rotations = fx.core.rotations();
    let broken = rotations
        .create_rotation(&alice, &secret.id, Duration::from_secs(60), "broken")
        .await
        .unwrap();
    let slow = rotations
        .create_rotation(&alice, &secret.id, Duration::from_secs(60), "slow")
        .await
        .unwrap();
    let mut events = fx.core.events().subscribe();

    let failed = rotations.rotate_now(&alice, &broken.id).await.unwrap();
    assert_eq!(failed.status, RotationStatus::Failed);
    let reason = failed.error.unwrap();
    assert!(reason.starts_with(&format!("rotation {} failed:", broken.id)));
    assert!(reason.contains("upstream refused"));
    assert_eq!(events.try_recv().unwrap().kind, EventKind::RotationFailed);

    let timed_out = rotations.rotate_now(&alice, &slow.id).await.unwrap();
    assert_eq!(timed_out.status, RotationStatus::Failed);
    assert!(timed_out.error.unwrap().contains("timed out"));

    assert_eq!(fx.value_of(&alice, &dev, "API_KEY").await, "old");
    assert_eq!(
        fx.core.secrets().list_versions(&alice, &secret.id).await.unwrap().len(),
        1
    );
    assert_eq!(rotations.list_outputs(&alice, &broken.id).await.unwrap().len(), 1);

    let err = rotations
        .create_rotation(&alice, &secret.id, Duration::from_secs(60), "unknown")
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::InvalidArgument(_)));
}

// ═══════════════════════════════════════════════════════════════════════
//  Imports
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn local_secrets_override_imported_ones() {
    let fx = Fixture::new().await;
    let alice = fx.ctx("alice");
    let shared = scope("shared", "/");
    let prod = scope("prod", "/");
    let store = fx.core.secrets();

    store
        .create_secret(&alice, &shared, "API_URL", SecretType::Shared, "https://api", vec![])
        .await
        .unwrap();
    store
        .create_secret(&alice, &shared, "LOG_LEVEL", SecretType::Shared, "debug", vec![])
        .await
        .unwrap();
    store
        .create_secret(&alice, &prod, "LOG_LEVEL", SecretType::Shared, "warn", vec![])
        .await
        .unwrap();

    let imports = fx.core.imports();
    let import = imports.add_import(&alice, &prod, "shared", "/").await.unwrap();
    assert_eq!(import.position, 1);
    let err = imports.add_import(&alice, &prod, "shared", "/").await.unwrap_err();
    assert!(matches!(err, StoreError::Conflict(_)));
    let err = imports.add_import(&alice, &prod, "prod", "/").await.unwrap_err();
    assert!(matches!(err, StoreError::Conflict(_)));

    let effective = imports.effective_secrets(&alice, &prod).await.unwrap();
    let resolved: Vec<(String, String)> = effective
        .iter()
        .map(|s| (s.name.clone(), store.reveal(&alice, &s.version).unwrap()))
        .collect();
    assert_eq!(
        resolved,
        vec![
            ("API_URL".to_string(), "https://api".to_string()),
            ("LOG_LEVEL".to_string(), "warn".to_string()),
        ]
    );

    imports.remove_import(&alice, &import.id).await.unwrap();
    assert!(imports.list_imports(&alice, &prod).await.unwrap().is_empty());
}
