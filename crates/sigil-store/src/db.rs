//! SQLite handle for the secrets core.
//!
//! One connection, guarded by a mutex and driven from the blocking pool.
//! Mutations run through [`Database::write`] as a single `BEGIN IMMEDIATE`
//! transaction, so version rows, index entries and pointer columns land
//! together or not at all.  [`Database::read`] gives a closure one
//! consistent view for multi-query reads such as snapshot walks.

use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::{Connection, Transaction, TransactionBehavior};
use tracing::{debug, info};

use crate::error::{StoreError, StoreResult};
use crate::migration;

/// Cloneable handle to the store's SQLite connection.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) the database file at `path`.  Blocking.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "opening secrets database");
        Self::from_connection(Connection::open(path)?)
    }

    /// A private in-memory database.
    pub fn open_in_memory() -> StoreResult<Self> {
        debug!("opening in-memory secrets database");
        Self::from_connection(Connection::open_in_memory()?)
    }

    /// Open `path` on the blocking pool and migrate it.
    pub async fn open_and_migrate(path: impl AsRef<Path> + Send + 'static) -> StoreResult<Self> {
        let db = tokio::task::spawn_blocking(move || Self::open(path)).await??;
        db.run_migrations().await?;
        Ok(db)
    }

    pub async fn run_migrations(&self) -> StoreResult<()> {
        self.with_conn(migration::run_all).await
    }

    /// Latest applied schema version.
    pub async fn schema_version(&self) -> StoreResult<u32> {
        self.with_conn(|conn| migration::current_version(conn)).await
    }

    /// Run `f` inside an immediate (write-locking) transaction.
    ///
    /// Commits when `f` returns `Ok`; any error drops the transaction,
    /// which rolls it back.
    pub async fn write<F, T>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&Transaction<'_>) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let out = f(&tx)?;
            tx.commit()?;
            Ok(out)
        })
        .await
    }

    /// Run `f` inside a deferred transaction that is never committed.
    pub async fn read<F, T>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&Transaction<'_>) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Deferred)?;
            f(&tx)
        })
        .await
    }

    async fn with_conn<F, T>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&mut Connection) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|e| StoreError::TaskJoin(format!("connection mutex poisoned: {e}")))?;
            f(&mut conn)
        })
        .await?
    }

    fn from_connection(conn: Connection) -> StoreResult<Self> {
        configure(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

/// Connection settings the store relies on.
fn configure(conn: &Connection) -> StoreResult<()> {
    // Readers never block the single writer.
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "mmap_size", 268_435_456_i64)?;
    // ~62 MiB page cache (negative means KiB).
    conn.pragma_update(None, "cache_size", -64_000_i32)?;
    conn.pragma_update(None, "temp_store", "MEMORY")?;
    // Versions, index entries and snapshot rows reference their parents.
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.pragma_update(None, "busy_timeout", 5_000_i32)?;
    debug!("connection configured (WAL, foreign keys on)");
    Ok(())
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    async fn migrated() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.run_migrations().await.unwrap();
        db
    }

    fn insert_root(tx: &Transaction<'_>, id: &str, environment: &str) -> StoreResult<()> {
        tx.execute(
            "INSERT INTO secret_folders (id, project_id, environment, parent_id, name, created_at, updated_at) \
             VALUES (?1, 'billing', ?2, NULL, 'root', 0, 0)",
            rusqlite::params![id, environment],
        )?;
        Ok(())
    }

    async fn root_ids(db: &Database) -> Vec<String> {
        db.read(|tx| {
            let mut stmt = tx.prepare("SELECT id FROM secret_folders ORDER BY id")?;
            let ids = stmt
                .query_map([], |row| row.get(0))?
                .collect::<Result<Vec<String>, _>>()?;
            Ok(ids)
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn failed_write_leaves_nothing_behind() {
        let db = migrated().await;

        let result: StoreResult<()> = db
            .write(|tx| {
                insert_root(tx, "dev-root", "dev")?;
                Err(StoreError::Conflict("abort after insert".into()))
            })
            .await;
        assert!(matches!(result, Err(StoreError::Conflict(_))));
        assert!(root_ids(&db).await.is_empty());

        db.write(|tx| insert_root(tx, "prod-root", "prod")).await.unwrap();
        assert_eq!(root_ids(&db).await, vec!["prod-root".to_string()]);
    }

    #[tokio::test]
    async fn read_does_not_commit() {
        let db = migrated().await;
        db.read(|tx| insert_root(tx, "dev-root", "dev")).await.unwrap();
        assert!(root_ids(&db).await.is_empty());
    }

    #[tokio::test]
    async fn foreign_keys_are_enforced() {
        let db = migrated().await;
        let orphan = db
            .write(|tx| {
                tx.execute(
                    "INSERT INTO secret_folders (id, project_id, environment, parent_id, name, created_at, updated_at) \
                     VALUES ('child', 'billing', 'dev', 'no-such-parent', 'app', 0, 0)",
                    [],
                )?;
                Ok(())
            })
            .await;
        assert!(matches!(orphan, Err(StoreError::Sqlite(_))));
    }

    #[tokio::test]
    async fn reopened_file_keeps_schema_and_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sigil.db");

        let db = Database::open_and_migrate(path.clone()).await.unwrap();
        db.write(|tx| insert_root(tx, "dev-root", "dev")).await.unwrap();
        drop(db);

        let reopened = Database::open_and_migrate(path).await.unwrap();
        assert_eq!(reopened.schema_version().await.unwrap(), migration::latest_version());
        assert_eq!(root_ids(&reopened).await, vec!["dev-root".to_string()]);
    }
}
