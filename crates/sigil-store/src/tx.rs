//! Transaction plumbing shared by the engines.
//!
//! Each engine holds a [`Backend`] and runs its writes through
//! [`Backend::write`].  The closure gets a [`Tx`], which bundles the open
//! SQLite transaction with the caller's key, the envelope adapter and an
//! event buffer.  Buffered events are published only after the commit
//! succeeds, so subscribers never observe a change that was rolled back.

use std::sync::Arc;

use rusqlite::Connection;
use sigil_kernel::{DomainEvent, EventBus};
use sigil_vault::{EncryptionAlgorithm, EnvelopeAdapter, KeyEncoding, KeyRef, Sealed, VaultError};

use crate::db::Database;
use crate::error::StoreResult;
use crate::scope::OpContext;

/// An open transaction plus everything needed to seal and open values.
pub(crate) struct Tx<'a> {
    pub conn: &'a Connection,
    envelope: &'a dyn EnvelopeAdapter,
    key: &'a KeyRef,
    /// Principal recorded as author of new versions and as event actor.
    pub actor: String,
    /// Unix timestamp shared by every row written in this transaction.
    pub now: i64,
    events: Vec<DomainEvent>,
}

impl<'a> Tx<'a> {
    pub fn new(
        conn: &'a Connection,
        envelope: &'a dyn EnvelopeAdapter,
        key: &'a KeyRef,
        actor: String,
    ) -> Self {
        Self {
            conn,
            envelope,
            key,
            actor,
            now: chrono::Utc::now().timestamp(),
            events: Vec::new(),
        }
    }

    pub fn seal(&self, plaintext: &[u8]) -> StoreResult<Sealed> {
        Ok(self.envelope.encrypt(plaintext, self.key)?)
    }

    pub fn open(&self, sealed: &Sealed) -> StoreResult<Vec<u8>> {
        Ok(self.envelope.decrypt(sealed, self.key)?)
    }

    pub fn open_string(&self, sealed: &Sealed) -> StoreResult<String> {
        Ok(self.envelope.decrypt_string(sealed, self.key)?)
    }

    /// Queue an event for publication after commit.
    pub fn emit(&mut self, event: DomainEvent) {
        self.events.push(event);
    }

    /// Run `f` under a savepoint.  On error the savepoint is rolled back and
    /// the events `f` queued are discarded; the outer transaction stays open.
    pub fn savepoint<T>(&mut self, f: impl FnOnce(&mut Self) -> StoreResult<T>) -> StoreResult<T> {
        self.conn.execute_batch("SAVEPOINT nested")?;
        let mark = self.events.len();
        match f(self) {
            Ok(out) => {
                self.conn.execute_batch("RELEASE nested")?;
                Ok(out)
            }
            Err(err) => {
                self.conn
                    .execute_batch("ROLLBACK TO nested; RELEASE nested")?;
                self.events.truncate(mark);
                Err(err)
            }
        }
    }

    fn into_events(self) -> Vec<DomainEvent> {
        self.events
    }
}

/// Database, envelope adapter and event bus, shared by every engine.
#[derive(Clone)]
pub(crate) struct Backend {
    pub db: Database,
    pub envelope: Arc<dyn EnvelopeAdapter>,
    pub bus: EventBus,
}

impl Backend {
    pub fn new(db: Database, envelope: Arc<dyn EnvelopeAdapter>, bus: EventBus) -> Self {
        Self { db, envelope, bus }
    }

    /// Run `f` in one immediate transaction as `ctx`, then publish the
    /// events it queued.
    pub async fn write<F, T>(&self, ctx: &OpContext, f: F) -> StoreResult<T>
    where
        F: FnOnce(&mut Tx<'_>) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let envelope = Arc::clone(&self.envelope);
        let key = ctx.key.clone();
        let actor = ctx.actor().to_string();

        let (out, events) = self
            .db
            .write(move |conn| {
                let mut tx = Tx::new(conn, envelope.as_ref(), &key, actor);
                let out = f(&mut tx)?;
                Ok((out, tx.into_events()))
            })
            .await?;

        self.bus.publish_all(events);
        Ok(out)
    }

    /// Run `f` in one read transaction as `ctx`.  Queued events are dropped.
    pub async fn read<F, T>(&self, ctx: &OpContext, f: F) -> StoreResult<T>
    where
        F: FnOnce(&mut Tx<'_>) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let envelope = Arc::clone(&self.envelope);
        let key = ctx.key.clone();
        let actor = ctx.actor().to_string();

        self.db
            .read(move |conn| {
                let mut tx = Tx::new(conn, envelope.as_ref(), &key, actor);
                f(&mut tx)
            })
            .await
    }
}

/// Rebuild a [`Sealed`] value from its stored columns.
pub(crate) fn sealed_from_columns(
    ciphertext: Vec<u8>,
    nonce: Vec<u8>,
    algorithm: &str,
    key_encoding: &str,
    key_id: String,
) -> StoreResult<Sealed> {
    let algorithm = EncryptionAlgorithm::parse(algorithm).ok_or_else(|| VaultError::Unsupported {
        what: "encryption algorithm",
        value: algorithm.to_string(),
    })?;
    let key_encoding = KeyEncoding::parse(key_encoding).ok_or_else(|| VaultError::Unsupported {
        what: "key encoding",
        value: key_encoding.to_string(),
    })?;
    Ok(Sealed {
        ciphertext,
        nonce,
        algorithm,
        key_encoding,
        key_id,
    })
}

#[cfg(test)]
mod tests {
    use sigil_kernel::EventKind;
    use sigil_vault::AesGcmEnvelope;
    use tokio::sync::broadcast::error::TryRecvError;

    use super::*;
    use crate::error::StoreError;
    use crate::scope::{Principal, ScopeGrant};

    async fn backend() -> Backend {
        let db = Database::open_in_memory().unwrap();
        db.run_migrations().await.unwrap();
        Backend::new(db, Arc::new(AesGcmEnvelope), EventBus::new(16))
    }

    fn alice() -> OpContext {
        let principal = Principal::new("alice").with_grant(ScopeGrant::project_wide("billing"));
        OpContext::new(principal, KeyRef::generate("billing").unwrap())
    }

    fn add_root(tx: &mut Tx<'_>, environment: &str) -> StoreResult<()> {
        let id = format!("{environment}-root");
        tx.conn.execute(
            "INSERT INTO secret_folders (id, project_id, environment, parent_id, name, created_at, updated_at) \
             VALUES (?1, 'billing', ?2, NULL, 'root', ?3, ?3)",
            rusqlite::params![id, environment, tx.now],
        )?;
        let event = DomainEvent::new(
            EventKind::SecretCreated,
            "billing",
            environment,
            "/",
            tx.actor.clone(),
            id,
        );
        tx.emit(event);
        Ok(())
    }

    async fn roots(backend: &Backend, ctx: &OpContext) -> i64 {
        backend
            .read(ctx, |tx| {
                Ok(tx
                    .conn
                    .query_row("SELECT COUNT(*) FROM secret_folders", [], |row| row.get(0))?)
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn committed_write_publishes_its_events() {
        let backend = backend().await;
        let mut rx = backend.bus.subscribe();
        let ctx = alice();

        backend.write(&ctx, |tx| add_root(tx, "dev")).await.unwrap();

        let event = rx.try_recv().unwrap();
        assert_eq!(event.kind, EventKind::SecretCreated);
        assert_eq!(event.actor, "alice");
        assert_eq!(roots(&backend, &ctx).await, 1);
    }

    #[tokio::test]
    async fn failed_write_publishes_nothing() {
        let backend = backend().await;
        let mut rx = backend.bus.subscribe();
        let ctx = alice();

        let result: StoreResult<()> = backend
            .write(&ctx, |tx| {
                add_root(tx, "dev")?;
                Err(StoreError::InvalidArgument("stop".into()))
            })
            .await;

        assert!(matches!(result, Err(StoreError::InvalidArgument(_))));
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
        assert_eq!(roots(&backend, &ctx).await, 0);
    }

    #[tokio::test]
    async fn failed_savepoint_keeps_the_outer_work() {
        let backend = backend().await;
        let mut rx = backend.bus.subscribe();
        let ctx = alice();

        backend
            .write(&ctx, |tx| {
                add_root(tx, "dev")?;
                let nested: StoreResult<()> = tx.savepoint(|tx| {
                    add_root(tx, "prod")?;
                    Err(StoreError::Conflict("prod taken".into()))
                });
                assert!(nested.is_err());
                Ok(())
            })
            .await
            .unwrap();

        let event = rx.try_recv().unwrap();
        assert_eq!(event.environment, "dev");
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
        assert_eq!(roots(&backend, &ctx).await, 1);
    }
}
