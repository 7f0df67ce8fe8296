//! Audit trail: logs every domain event published by the core.

use std::sync::Arc;

use sigil_kernel::{DomainEvent, EventBus};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Handle to the background audit task.
pub struct AuditTrail {
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<usize>,
}

impl AuditTrail {
    /// Subscribe to `bus` and start logging.
    pub fn spawn(bus: &EventBus) -> Self {
        let mut rx = bus.subscribe();
        let (shutdown, mut stop) = oneshot::channel();

        let handle = tokio::spawn(async move {
            let mut logged = 0usize;
            loop {
                tokio::select! {
                    received = rx.recv() => match received {
                        Ok(event) => {
                            log_event(&event);
                            logged += 1;
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "audit trail lagged behind the event bus");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = &mut stop => {
                        while let Ok(event) = rx.try_recv() {
                            log_event(&event);
                            logged += 1;
                        }
                        break;
                    }
                }
            }
            logged
        });

        Self { shutdown, handle }
    }

    /// Log whatever is still queued, stop, and return the number of events
    /// logged over the task's lifetime.
    pub async fn finish(self) -> usize {
        let _ = self.shutdown.send(());
        self.handle.await.unwrap_or(0)
    }
}

fn log_event(event: &Arc<DomainEvent>) {
    info!(
        target: "sigil::audit",
        event_id = %event.id,
        kind = %event.kind,
        project = %event.project,
        environment = %event.environment,
        path = %event.path,
        actor = %event.actor,
        entity_id = %event.entity_id,
        detail = %event.detail,
        "domain event"
    );
}
