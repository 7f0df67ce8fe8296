//! Integration tests for the sigil-kernel crate.
//!
//! These tests exercise the event bus and the rotation strategy registry
//! together, the way the secrets core drives them.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sigil_kernel::{
    DomainEvent, EventBus, EventKind, KernelError, RotationRegistry, RotationRequest,
    RotationStrategy,
};

struct Counting {
    calls: AtomicU32,
}

#[async_trait]
impl RotationStrategy for Counting {
    async fn rotate(&self, request: &RotationRequest) -> sigil_kernel::Result<String> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("{}-v{n}", request.secret_id))
    }
}

struct Refusing;

#[async_trait]
impl RotationStrategy for Refusing {
    async fn rotate(&self, _request: &RotationRequest) -> sigil_kernel::Result<String> {
        Err(KernelError::StrategyFailed {
            strategy: "refusing".into(),
            reason: "credentials revoked upstream".into(),
        })
    }
}

fn request(secret_id: &str) -> RotationRequest {
    RotationRequest {
        rotation_id: "rot".into(),
        secret_id: secret_id.into(),
        project: "proj".into(),
        environment: "prod".into(),
        path: "/".into(),
        requested_at: Utc::now(),
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Registry + bus
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn strategies_are_shared_across_tasks() {
    let registry = RotationRegistry::new();
    let strategy = Arc::new(Counting {
        calls: AtomicU32::new(0),
    });
    registry.register("counting", "Counts invocations", strategy.clone());

    let mut handles = Vec::new();
    for i in 0..8 {
        let registry = registry.clone();
        handles.push(tokio::spawn(async move {
            let s = registry.get("counting").unwrap();
            let value = s.rotate(&request(&format!("s{i}"))).await.unwrap();
            registry.record_success("counting");
            value
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    assert_eq!(strategy.calls.load(Ordering::SeqCst), 8);
    assert_eq!(registry.info("counting").unwrap().successes, 8);
}

#[tokio::test]
async fn failing_strategy_is_reported_on_the_bus() {
    let registry = RotationRegistry::new();
    registry.register("refusing", "Always fails", Arc::new(Refusing));
    let bus = EventBus::new(8);
    let mut rx = bus.subscribe();

    let strategy = registry.get("refusing").unwrap();
    let err = strategy.rotate(&request("s1")).await.unwrap_err();
    registry.record_failure("refusing", err.to_string());
    bus.publish(
        DomainEvent::new(EventKind::RotationFailed, "proj", "prod", "/", "scheduler", "out-1")
            .with_detail(serde_json::json!({ "reason": err.to_string() })),
    );

    let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("event in time")
        .expect("event");
    assert_eq!(event.kind, EventKind::RotationFailed);
    assert!(
        event.detail["reason"]
            .as_str()
            .unwrap()
            .contains("credentials revoked")
    );
    assert_eq!(registry.info("refusing").unwrap().failures, 1);
}

#[tokio::test]
async fn lagging_subscriber_reports_missed_events() {
    let bus = EventBus::new(2);
    let mut rx = bus.subscribe();

    for _ in 0..5 {
        bus.publish(DomainEvent::new(
            EventKind::SecretUpdated,
            "proj",
            "prod",
            "/",
            "writer",
            "v",
        ));
    }

    match rx.recv().await {
        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => assert_eq!(n, 3),
        other => panic!("expected lag, got {other:?}"),
    }
}
