//! Versioned schema for the secrets core.
//!
//! Each [`Migration`] is applied at most once, in version order, inside its
//! own transaction together with its `_migrations` bookkeeping row.  A
//! failing migration leaves the schema at the previous version.

use rusqlite::Connection;
use tracing::{debug, info};

use crate::error::{StoreError, StoreResult};

struct Migration {
    /// Strictly increasing across [`MIGRATIONS`].
    version: u32,
    description: &'static str,
    /// One or more `;`-separated statements.
    sql: &'static str,
}

/// Append only; applied migrations are never edited.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "secrets core: folders, secrets, versions, blind indexes, snapshots",
        sql: r#"
            CREATE TABLE secret_blind_indexes (
                project_id      TEXT PRIMARY KEY,
                salt_ciphertext BLOB NOT NULL,
                salt_nonce      BLOB NOT NULL,
                algorithm       TEXT NOT NULL CHECK(algorithm IN ('aes-256-gcm')),
                key_encoding    TEXT NOT NULL CHECK(key_encoding IN ('utf8','base64','hex')),
                key_id          TEXT NOT NULL,
                created_at      INTEGER NOT NULL
            );

            CREATE TABLE secret_folders (
                id                 TEXT PRIMARY KEY,
                project_id         TEXT NOT NULL,
                environment        TEXT NOT NULL,
                parent_id          TEXT REFERENCES secret_folders(id),
                name               TEXT NOT NULL,
                current_version_id TEXT,
                secrets_revision   INTEGER NOT NULL DEFAULT 0,
                is_deleted         INTEGER NOT NULL DEFAULT 0,
                created_at         INTEGER NOT NULL,
                updated_at         INTEGER NOT NULL
            );
            CREATE UNIQUE INDEX idx_folders_root
                ON secret_folders(project_id, environment) WHERE parent_id IS NULL;
            CREATE UNIQUE INDEX idx_folders_live_child
                ON secret_folders(parent_id, name) WHERE is_deleted = 0;

            CREATE TABLE secret_folder_versions (
                id                TEXT PRIMARY KEY,
                folder_id         TEXT NOT NULL REFERENCES secret_folders(id),
                ordinal           INTEGER NOT NULL,
                name              TEXT NOT NULL,
                parent_version_id TEXT REFERENCES secret_folder_versions(id),
                children          TEXT NOT NULL DEFAULT '[]',
                is_deleted        INTEGER NOT NULL DEFAULT 0,
                created_at        INTEGER NOT NULL,
                UNIQUE(folder_id, ordinal)
            );

            CREATE TABLE secrets (
                id                 TEXT PRIMARY KEY,
                project_id         TEXT NOT NULL,
                environment        TEXT NOT NULL,
                folder_id          TEXT NOT NULL REFERENCES secret_folders(id),
                type               TEXT NOT NULL CHECK(type IN ('shared','personal')),
                owner_id           TEXT,
                name_sealed        TEXT NOT NULL,
                current_version_id TEXT,
                latest_ordinal     INTEGER NOT NULL DEFAULT 0,
                is_deleted         INTEGER NOT NULL DEFAULT 0,
                created_at         INTEGER NOT NULL,
                updated_at         INTEGER NOT NULL,
                CHECK((type = 'personal') = (owner_id IS NOT NULL))
            );
            CREATE INDEX idx_secrets_folder ON secrets(folder_id, is_deleted);

            CREATE TABLE secret_versions (
                id                 TEXT PRIMARY KEY,
                secret_id          TEXT NOT NULL REFERENCES secrets(id),
                ordinal            INTEGER NOT NULL,
                ciphertext         BLOB,
                nonce              BLOB,
                algorithm          TEXT CHECK(algorithm IN ('aes-256-gcm')),
                key_encoding       TEXT CHECK(key_encoding IN ('utf8','base64','hex')),
                key_id             TEXT,
                blind_index        TEXT NOT NULL,
                tags               TEXT NOT NULL DEFAULT '[]',
                is_deletion_marker INTEGER NOT NULL DEFAULT 0,
                author             TEXT NOT NULL,
                created_at         INTEGER NOT NULL,
                UNIQUE(secret_id, ordinal),
                CHECK(is_deletion_marker = 1 OR ciphertext IS NOT NULL)
            );

            CREATE TABLE secret_index_entries (
                secret_id   TEXT PRIMARY KEY REFERENCES secrets(id),
                project_id  TEXT NOT NULL,
                environment TEXT NOT NULL,
                folder_id   TEXT NOT NULL,
                type        TEXT NOT NULL,
                owner_id    TEXT,
                token       TEXT NOT NULL
            );
            CREATE INDEX idx_index_entries_lookup
                ON secret_index_entries(project_id, environment, folder_id, token);

            CREATE TABLE secret_snapshots (
                id          TEXT PRIMARY KEY,
                project_id  TEXT NOT NULL,
                environment TEXT NOT NULL,
                folder_id   TEXT NOT NULL REFERENCES secret_folders(id),
                path        TEXT NOT NULL,
                trigger     TEXT NOT NULL CHECK(trigger IN ('manual','pre_rollback','scheduled')),
                created_by  TEXT NOT NULL,
                created_at  INTEGER NOT NULL
            );
            CREATE INDEX idx_snapshots_scope ON secret_snapshots(project_id, environment, created_at);

            CREATE TABLE secret_snapshot_secrets (
                snapshot_id       TEXT NOT NULL REFERENCES secret_snapshots(id) ON DELETE CASCADE,
                secret_id         TEXT NOT NULL REFERENCES secrets(id),
                secret_version_id TEXT NOT NULL REFERENCES secret_versions(id),
                PRIMARY KEY (snapshot_id, secret_id)
            );

            CREATE TABLE secret_snapshot_folders (
                snapshot_id       TEXT NOT NULL REFERENCES secret_snapshots(id) ON DELETE CASCADE,
                folder_id         TEXT NOT NULL REFERENCES secret_folders(id),
                folder_version_id TEXT NOT NULL REFERENCES secret_folder_versions(id),
                depth             INTEGER NOT NULL,
                PRIMARY KEY (snapshot_id, folder_id)
            );
        "#,
    },
    Migration {
        version: 2,
        description: "approval policies and change requests",
        sql: r#"
            CREATE TABLE secret_approval_policies (
                id                         TEXT PRIMARY KEY,
                project_id                 TEXT NOT NULL,
                environment                TEXT NOT NULL,
                secret_path                TEXT NOT NULL,
                name                       TEXT NOT NULL,
                approvals_required         INTEGER NOT NULL CHECK(approvals_required >= 1),
                enforcement                TEXT NOT NULL CHECK(enforcement IN ('hard','soft')),
                soft_reject_rule           TEXT NOT NULL CHECK(soft_reject_rule IN ('threshold_wins','net_approvals')),
                flag_overridden_rejections INTEGER NOT NULL DEFAULT 1,
                created_at                 INTEGER NOT NULL,
                updated_at                 INTEGER NOT NULL,
                UNIQUE(project_id, name)
            );
            CREATE INDEX idx_policies_scope ON secret_approval_policies(project_id, environment);

            CREATE TABLE sap_approvers (
                policy_id   TEXT NOT NULL REFERENCES secret_approval_policies(id) ON DELETE CASCADE,
                approver_id TEXT NOT NULL,
                PRIMARY KEY (policy_id, approver_id)
            );

            CREATE TABLE secret_approval_requests (
                id              TEXT PRIMARY KEY,
                project_id      TEXT NOT NULL,
                environment     TEXT NOT NULL,
                folder_id       TEXT NOT NULL REFERENCES secret_folders(id),
                path            TEXT NOT NULL,
                policy_id       TEXT NOT NULL,
                policy_snapshot TEXT NOT NULL,
                changes         TEXT NOT NULL,
                status          TEXT NOT NULL CHECK(status IN ('pending','approved','rejected','stale')),
                requested_by    TEXT NOT NULL,
                resolution      TEXT,
                created_at      INTEGER NOT NULL,
                resolved_at     INTEGER
            );
            CREATE INDEX idx_requests_scope ON secret_approval_requests(project_id, environment, status);

            CREATE TABLE sar_reviewers (
                request_id  TEXT NOT NULL REFERENCES secret_approval_requests(id) ON DELETE CASCADE,
                reviewer_id TEXT NOT NULL,
                decision    TEXT NOT NULL CHECK(decision IN ('approve','reject')),
                created_at  INTEGER NOT NULL,
                PRIMARY KEY (request_id, reviewer_id)
            );
        "#,
    },
    Migration {
        version: 3,
        description: "secret rotation schedules and outputs",
        sql: r#"
            CREATE TABLE secret_rotations (
                id              TEXT PRIMARY KEY,
                secret_id       TEXT NOT NULL REFERENCES secrets(id),
                strategy        TEXT NOT NULL,
                interval_secs   INTEGER NOT NULL CHECK(interval_secs > 0),
                last_rotated_at INTEGER,
                last_status     TEXT CHECK(last_status IN ('success','failed')),
                created_by      TEXT NOT NULL,
                created_at      INTEGER NOT NULL
            );
            CREATE INDEX idx_rotations_secret ON secret_rotations(secret_id);

            CREATE TABLE secret_rotation_outputs (
                id                TEXT PRIMARY KEY,
                rotation_id       TEXT NOT NULL REFERENCES secret_rotations(id) ON DELETE CASCADE,
                secret_version_id TEXT REFERENCES secret_versions(id),
                status            TEXT NOT NULL CHECK(status IN ('success','failed')),
                error             TEXT,
                created_at        INTEGER NOT NULL
            );
            CREATE INDEX idx_rotation_outputs ON secret_rotation_outputs(rotation_id, created_at);
        "#,
    },
    Migration {
        version: 4,
        description: "secret imports between folders",
        sql: r#"
            CREATE TABLE secret_imports (
                id                 TEXT PRIMARY KEY,
                folder_id          TEXT NOT NULL REFERENCES secret_folders(id),
                position           INTEGER NOT NULL,
                source_environment TEXT NOT NULL,
                source_path        TEXT NOT NULL,
                created_by         TEXT NOT NULL,
                created_at         INTEGER NOT NULL,
                UNIQUE(folder_id, source_environment, source_path)
            );
        "#,
    },
    Migration {
        version: 5,
        description: "blind index lookups by folder and token",
        sql: r#"
            DROP INDEX idx_index_entries_lookup;
            CREATE INDEX idx_index_entries_token
                ON secret_index_entries(folder_id, token);
        "#,
    },
];

// ── public API ───────────────────────────────────────────────────────

/// Bring the schema at `conn` up to the latest version.
///
/// Synchronous; [`Database::run_migrations`](crate::db::Database::run_migrations)
/// calls it on the blocking pool.
pub fn run_all(conn: &mut Connection) -> StoreResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version     INTEGER PRIMARY KEY,
            description TEXT NOT NULL,
            applied_at  INTEGER NOT NULL
        );",
    )
    .map_err(|e| migration_error(0, "create _migrations", e))?;

    let from = current_version(conn)?;
    let mut applied = 0usize;
    for migration in MIGRATIONS.iter().filter(|m| m.version > from) {
        apply(conn, migration)?;
        applied += 1;
    }

    if applied == 0 {
        debug!(version = from, "schema up to date");
    } else {
        info!(from, to = latest_version(), applied, "schema migrated");
    }
    Ok(())
}

/// Highest applied version, 0 on an empty database.
pub fn current_version(conn: &Connection) -> StoreResult<u32> {
    conn.query_row("SELECT COALESCE(MAX(version), 0) FROM _migrations", [], |row| row.get(0))
        .map_err(|e| migration_error(0, "read current version", e))
}

/// Version the schema reaches once every migration is applied.
pub fn latest_version() -> u32 {
    MIGRATIONS.last().map_or(0, |m| m.version)
}

// ── internals ────────────────────────────────────────────────────────

/// Apply one migration; the transaction rolls back on drop if any step fails.
fn apply(conn: &mut Connection, migration: &Migration) -> StoreResult<()> {
    let version = migration.version;
    debug!(version, description = migration.description, "applying migration");

    let tx = conn
        .transaction()
        .map_err(|e| migration_error(version, "begin", e))?;
    tx.execute_batch(migration.sql)
        .map_err(|e| migration_error(version, "execute", e))?;
    tx.execute(
        "INSERT INTO _migrations (version, description, applied_at) VALUES (?1, ?2, ?3)",
        rusqlite::params![version, migration.description, chrono::Utc::now().timestamp()],
    )
    .map_err(|e| migration_error(version, "record", e))?;
    tx.commit().map_err(|e| migration_error(version, "commit", e))
}

fn migration_error(version: u32, step: &str, err: rusqlite::Error) -> StoreError {
    StoreError::Migration {
        version,
        message: format!("{step}: {err}"),
    }
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn setup_conn() -> Connection {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.pragma_update(None, "foreign_keys", "ON").unwrap();
        run_all(&mut conn).unwrap();
        conn
    }

    #[test]
    fn versions_strictly_increase() {
        assert!(MIGRATIONS.windows(2).all(|w| w[1].version > w[0].version));
        assert_eq!(latest_version(), 5);
    }

    #[test]
    fn fresh_database_reaches_latest_version() {
        let conn = setup_conn();
        assert_eq!(current_version(&conn).unwrap(), latest_version());
    }

    #[test]
    fn rerunning_applies_nothing() {
        let mut conn = setup_conn();
        run_all(&mut conn).unwrap();

        let rows: i64 = conn
            .query_row("SELECT count(*) FROM _migrations", [], |row| row.get(0))
            .unwrap();
        assert_eq!(rows, i64::from(latest_version()));
    }

    #[test]
    fn failed_migration_leaves_no_trace() {
        let mut conn = setup_conn();
        let broken = Migration {
            version: 99,
            description: "half applied",
            sql: "CREATE TABLE half_applied (id TEXT); INSERT INTO missing_table VALUES (1);",
        };

        let err = apply(&mut conn, &broken).unwrap_err();
        assert!(matches!(err, StoreError::Migration { version: 99, .. }));
        assert_eq!(current_version(&conn).unwrap(), latest_version());
        let leftover: i64 = conn
            .query_row(
                "SELECT count(*) FROM sqlite_master WHERE name = 'half_applied'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(leftover, 0);
    }

    #[test]
    fn token_lookup_uses_folder_token_index() {
        let conn = setup_conn();
        let plan: Vec<String> = {
            let mut stmt = conn
                .prepare(
                    "EXPLAIN QUERY PLAN SELECT secret_id, type, owner_id FROM secret_index_entries \
                     WHERE folder_id = ?1 AND token = ?2",
                )
                .unwrap();
            stmt.query_map(["root", "tok"], |row| row.get::<_, String>(3))
                .unwrap()
                .map(|r| r.unwrap())
                .collect()
        };
        assert!(
            plan.iter().any(|step| step.contains("idx_index_entries_token")),
            "plan: {plan:?}"
        );
    }

    #[test]
    fn migrations_create_all_tables() {
        let conn = setup_conn();

        let tables: Vec<String> = {
            let mut stmt = conn
                .prepare(
                    "SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE '\\_%' ESCAPE '\\' ORDER BY name",
                )
                .unwrap();
            stmt.query_map([], |row| row.get(0))
                .unwrap()
                .map(|r| r.unwrap())
                .collect()
        };

        for expected in [
            "secret_blind_indexes",
            "secret_folders",
            "secret_folder_versions",
            "secrets",
            "secret_versions",
            "secret_index_entries",
            "secret_snapshots",
            "secret_snapshot_secrets",
            "secret_snapshot_folders",
            "secret_approval_policies",
            "sap_approvers",
            "secret_approval_requests",
            "sar_reviewers",
            "secret_rotations",
            "secret_rotation_outputs",
            "secret_imports",
        ] {
            assert!(tables.contains(&expected.to_string()), "missing {expected}");
        }
    }

    #[test]
    fn only_one_root_folder_per_environment() {
        let conn = setup_conn();

        conn.execute(
            "INSERT INTO secret_folders (id, project_id, environment, parent_id, name, created_at, updated_at) \
             VALUES ('r1', 'p', 'dev', NULL, 'root', 0, 0)",
            [],
        )
        .unwrap();
        let dup = conn.execute(
            "INSERT INTO secret_folders (id, project_id, environment, parent_id, name, created_at, updated_at) \
             VALUES ('r2', 'p', 'dev', NULL, 'root', 0, 0)",
            [],
        );
        assert!(dup.is_err());
    }

    #[test]
    fn deleted_folder_name_can_be_reused() {
        let conn = setup_conn();

        conn.execute_batch(
            "INSERT INTO secret_folders (id, project_id, environment, parent_id, name, created_at, updated_at) \
                 VALUES ('root', 'p', 'dev', NULL, 'root', 0, 0);
             INSERT INTO secret_folders (id, project_id, environment, parent_id, name, is_deleted, created_at, updated_at) \
                 VALUES ('a1', 'p', 'dev', 'root', 'app', 1, 0, 0);
             INSERT INTO secret_folders (id, project_id, environment, parent_id, name, created_at, updated_at) \
                 VALUES ('a2', 'p', 'dev', 'root', 'app', 0, 0);",
        )
        .unwrap();

        let live_dup = conn.execute(
            "INSERT INTO secret_folders (id, project_id, environment, parent_id, name, created_at, updated_at) \
             VALUES ('a3', 'p', 'dev', 'root', 'app', 0, 0)",
            [],
        );
        assert!(live_dup.is_err());
    }

    #[test]
    fn version_without_ciphertext_must_be_marker() {
        let conn = setup_conn();

        conn.execute_batch(
            "INSERT INTO secret_folders (id, project_id, environment, parent_id, name, created_at, updated_at) \
                 VALUES ('root', 'p', 'dev', NULL, 'root', 0, 0);
             INSERT INTO secrets (id, project_id, environment, folder_id, type, owner_id, name_sealed, created_at, updated_at) \
                 VALUES ('s1', 'p', 'dev', 'root', 'shared', NULL, '{}', 0, 0);",
        )
        .unwrap();

        let bad = conn.execute(
            "INSERT INTO secret_versions (id, secret_id, ordinal, blind_index, author, created_at) \
             VALUES ('v1', 's1', 1, 'tok', 'alice', 0)",
            [],
        );
        assert!(bad.is_err());

        conn.execute(
            "INSERT INTO secret_versions (id, secret_id, ordinal, blind_index, is_deletion_marker, author, created_at) \
             VALUES ('v1', 's1', 1, 'tok', 1, 'alice', 0)",
            [],
        )
        .unwrap();
    }

    #[test]
    fn personal_secret_requires_owner() {
        let conn = setup_conn();

        conn.execute(
            "INSERT INTO secret_folders (id, project_id, environment, parent_id, name, created_at, updated_at) \
             VALUES ('root', 'p', 'dev', NULL, 'root', 0, 0)",
            [],
        )
        .unwrap();
        let bad = conn.execute(
            "INSERT INTO secrets (id, project_id, environment, folder_id, type, owner_id, name_sealed, created_at, updated_at) \
             VALUES ('s1', 'p', 'dev', 'root', 'personal', NULL, '{}', 0, 0)",
            [],
        );
        assert!(bad.is_err());
    }
}
