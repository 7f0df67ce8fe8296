//! Domain event bus.
//!
//! Every committed mutation in the secrets core is announced as a
//! [`DomainEvent`] on an [`EventBus`] built on top of
//! [`tokio::sync::broadcast`].  Audit and notification collaborators subscribe
//! to the bus; the core never waits for them.
//!
//! Events are wrapped in [`Arc`] so that broadcasting to multiple subscribers
//! does not require cloning the payload.
//!
//! # Usage
//!
//! ```rust,no_run
//! # use sigil_kernel::events::{DomainEvent, EventBus, EventKind};
//! # async fn example() {
//! let bus = EventBus::new(256);
//! let mut rx = bus.subscribe();
//!
//! bus.publish(DomainEvent::new(
//!     EventKind::SecretCreated,
//!     "proj-a",
//!     "prod",
//!     "/",
//!     "user-1",
//!     "0192f0c4-secret",
//! ));
//!
//! let event = rx.recv().await.unwrap();
//! assert_eq!(event.kind, EventKind::SecretCreated);
//! # }
//! ```

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Event types
// ---------------------------------------------------------------------------

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "secret.created")]
    SecretCreated,
    #[serde(rename = "secret.updated")]
    SecretUpdated,
    #[serde(rename = "secret.deleted")]
    SecretDeleted,
    #[serde(rename = "approval_request.created")]
    ApprovalRequestCreated,
    #[serde(rename = "approval_request.resolved")]
    ApprovalRequestResolved,
    #[serde(rename = "rotation.completed")]
    RotationCompleted,
    #[serde(rename = "rotation.failed")]
    RotationFailed,
    #[serde(rename = "snapshot.created")]
    SnapshotCreated,
    #[serde(rename = "snapshot.rolled_back")]
    SnapshotRolledBack,
}

impl EventKind {
    /// Dotted event name used by downstream consumers.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SecretCreated => "secret.created",
            Self::SecretUpdated => "secret.updated",
            Self::SecretDeleted => "secret.deleted",
            Self::ApprovalRequestCreated => "approval_request.created",
            Self::ApprovalRequestResolved => "approval_request.resolved",
            Self::RotationCompleted => "rotation.completed",
            Self::RotationFailed => "rotation.failed",
            Self::SnapshotCreated => "snapshot.created",
            Self::SnapshotRolledBack => "snapshot.rolled_back",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A timestamped record of a committed change.
///
/// Carries scope, actor and the affected entity id.  Never carries secret
/// names or values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainEvent {
    /// Unique identifier of this event (UUID v7, time ordered).
    pub id: Uuid,
    pub kind: EventKind,
    pub project: String,
    pub environment: String,
    /// Folder path the change happened under.
    pub path: String,
    /// Principal that caused the change.
    pub actor: String,
    /// Id of the affected entity (secret version, request, rotation output…).
    pub entity_id: String,
    /// Free-form structured details (ordinals, status, failure reasons).
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub detail: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl DomainEvent {
    /// Build an event stamped with the current time.
    pub fn new(
        kind: EventKind,
        project: impl Into<String>,
        environment: impl Into<String>,
        path: impl Into<String>,
        actor: impl Into<String>,
        entity_id: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            kind,
            project: project.into(),
            environment: environment.into(),
            path: path.into(),
            actor: actor.into(),
            entity_id: entity_id.into(),
            detail: serde_json::Value::Null,
            timestamp: Utc::now(),
        }
    }

    /// Attach structured details to the event.
    #[must_use]
    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = detail;
        self
    }
}

// ---------------------------------------------------------------------------
// Event bus
// ---------------------------------------------------------------------------

/// Publish/subscribe event bus backed by [`tokio::sync::broadcast`].
///
/// The bus is cheaply cloneable (`Arc`-backed) and `Send + Sync`.  Subscribers
/// receive [`Arc<DomainEvent>`] references, avoiding per-subscriber cloning of
/// the event payload.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<EventBusInner>,
}

struct EventBusInner {
    sender: broadcast::Sender<Arc<DomainEvent>>,
}

impl EventBus {
    /// Create a new bus with the given channel capacity.
    ///
    /// If a subscriber falls behind by more than `capacity` events, it will
    /// receive a [`broadcast::error::RecvError::Lagged`] error indicating how
    /// many events were missed.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            inner: Arc::new(EventBusInner { sender }),
        }
    }

    /// Publish an event to all current subscribers.
    ///
    /// Returns the number of receivers that will observe this event.  With no
    /// active subscribers the event is dropped.
    pub fn publish(&self, event: DomainEvent) -> usize {
        let kind = event.kind;
        match self.inner.sender.send(Arc::new(event)) {
            Ok(n) => {
                tracing::trace!(kind = %kind, receivers = n, "domain event published");
                n
            }
            Err(_) => {
                tracing::trace!(kind = %kind, "domain event published but no active receivers");
                0
            }
        }
    }

    /// Publish a batch of events in order.
    pub fn publish_all(&self, events: impl IntoIterator<Item = DomainEvent>) {
        for event in events {
            self.publish(event);
        }
    }

    /// Create a new subscriber that will receive all future events.
    ///
    /// Events published *before* this call are **not** replayed.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<DomainEvent>> {
        tracing::trace!("new event subscriber created");
        self.inner.sender.subscribe()
    }

    /// Return the current number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.inner.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
