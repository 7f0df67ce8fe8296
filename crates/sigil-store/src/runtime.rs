//! The assembled secrets core.
//!
//! [`SecretsCore`] wires one [`Database`], one envelope adapter and one
//! [`EventBus`] into every engine.  Engines are cheap clones sharing that
//! backend; hand them out freely.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use sigil_kernel::{EventBus, RotationRegistry};
use sigil_vault::{AesGcmEnvelope, EnvelopeAdapter};
use tracing::info;

use crate::approvals::ApprovalEngine;
use crate::blind_index::BlindIndexEngine;
use crate::db::Database;
use crate::error::StoreResult;
use crate::folders::FolderManager;
use crate::imports::ImportManager;
use crate::rotation::{DEFAULT_STRATEGY_TIMEOUT, RotationScheduler};
use crate::secrets::SecretStore;
use crate::snapshots::SnapshotManager;
use crate::tx::Backend;

/// Store-side tunables.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Upper bound on one rotation strategy call.
    pub strategy_timeout: Duration,
    /// Capacity of the domain event channel.
    pub event_capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            strategy_timeout: DEFAULT_STRATEGY_TIMEOUT,
            event_capacity: 1024,
        }
    }
}

#[derive(Clone)]
pub struct SecretsCore {
    db: Database,
    bus: EventBus,
    blind_index: BlindIndexEngine,
    secrets: SecretStore,
    folders: FolderManager,
    snapshots: SnapshotManager,
    approvals: ApprovalEngine,
    rotations: RotationScheduler,
    imports: ImportManager,
}

impl SecretsCore {
    /// Assemble the core over an already migrated database.
    pub fn new(
        db: Database,
        envelope: Arc<dyn EnvelopeAdapter>,
        registry: RotationRegistry,
        config: StoreConfig,
    ) -> Self {
        let bus = EventBus::new(config.event_capacity);
        let backend = Backend::new(db.clone(), envelope, bus.clone());
        Self {
            db,
            bus,
            blind_index: BlindIndexEngine::new(backend.clone()),
            secrets: SecretStore::new(backend.clone()),
            folders: FolderManager::new(backend.clone()),
            snapshots: SnapshotManager::new(backend.clone()),
            approvals: ApprovalEngine::new(backend.clone()),
            rotations: RotationScheduler::new(backend.clone(), registry, config.strategy_timeout),
            imports: ImportManager::new(backend),
        }
    }

    /// Open and migrate the database at `path`, using AES-256-GCM.
    pub async fn open(
        path: impl AsRef<Path> + Send + 'static,
        registry: RotationRegistry,
        config: StoreConfig,
    ) -> StoreResult<Self> {
        let db = Database::open_and_migrate(path).await?;
        info!("secrets core ready");
        Ok(Self::new(db, Arc::new(AesGcmEnvelope), registry, config))
    }

    /// A migrated in-memory core, using AES-256-GCM.
    pub async fn open_in_memory(registry: RotationRegistry, config: StoreConfig) -> StoreResult<Self> {
        let db = Database::open_in_memory()?;
        db.run_migrations().await?;
        Ok(Self::new(db, Arc::new(AesGcmEnvelope), registry, config))
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Bus carrying every committed domain event.
    pub fn events(&self) -> &EventBus {
        &self.bus
    }

    pub fn blind_index(&self) -> &BlindIndexEngine {
        &self.blind_index
    }

    pub fn secrets(&self) -> &SecretStore {
        &self.secrets
    }

    pub fn folders(&self) -> &FolderManager {
        &self.folders
    }

    pub fn snapshots(&self) -> &SnapshotManager {
        &self.snapshots
    }

    pub fn approvals(&self) -> &ApprovalEngine {
        &self.approvals
    }

    pub fn rotations(&self) -> &RotationScheduler {
        &self.rotations
    }

    pub fn imports(&self) -> &ImportManager {
        &self.imports
    }
}
