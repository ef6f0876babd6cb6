//! Embedded forward-only schema migrations.

use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tracing::debug;

use crate::error::{CompassError, Result};

/// One schema step. Versions are applied in ascending order exactly once.
#[derive(Debug, Clone, Copy)]
pub struct Migration {
    pub version: i64,
    pub name: &'static str,
    pub sql: &'static str,
}

pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "create_assets",
        sql: r#"
            CREATE TABLE users (
                id TEXT PRIMARY KEY,
                email TEXT NOT NULL UNIQUE,
                provider TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE assets (
                id TEXT PRIMARY KEY,
                urn TEXT NOT NULL UNIQUE,
                type TEXT NOT NULL,
                service TEXT NOT NULL,
                name TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                data TEXT NOT NULL DEFAULT '{}',
                url TEXT NOT NULL DEFAULT '',
                labels TEXT NOT NULL DEFAULT '{}',
                version TEXT NOT NULL,
                updated_by TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                refreshed_at TEXT,
                is_deleted INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX idx_assets_type_service ON assets(type, service);
            CREATE INDEX idx_assets_service_updated_at ON assets(service, updated_at);
            CREATE INDEX idx_assets_name ON assets(name);

            CREATE TABLE assets_versions (
                asset_id TEXT NOT NULL REFERENCES assets(id) ON DELETE CASCADE,
                urn TEXT NOT NULL,
                type TEXT NOT NULL,
                service TEXT NOT NULL,
                name TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                data TEXT NOT NULL DEFAULT '{}',
                url TEXT NOT NULL DEFAULT '',
                labels TEXT NOT NULL DEFAULT '{}',
                owners TEXT NOT NULL DEFAULT '[]',
                version TEXT NOT NULL,
                updated_by TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                refreshed_at TEXT,
                is_deleted INTEGER NOT NULL DEFAULT 0,
                changelog TEXT NOT NULL DEFAULT '[]',
                PRIMARY KEY (asset_id, version)
            );

            CREATE TABLE asset_owners (
                asset_id TEXT NOT NULL REFERENCES assets(id) ON DELETE CASCADE,
                user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                created_at TEXT NOT NULL,
                PRIMARY KEY (asset_id, user_id)
            );
            CREATE INDEX idx_asset_owners_user ON asset_owners(user_id);
        "#,
    },
    Migration {
        version: 2,
        name: "create_probes_and_lineage",
        sql: r#"
            CREATE TABLE asset_probes (
                id TEXT PRIMARY KEY,
                asset_urn TEXT NOT NULL REFERENCES assets(urn) ON DELETE CASCADE,
                status TEXT NOT NULL DEFAULT '',
                status_reason TEXT NOT NULL DEFAULT '',
                metadata TEXT,
                timestamp TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX idx_asset_probes_urn_timestamp ON asset_probes(asset_urn, timestamp);

            CREATE TABLE lineage_graph (
                source TEXT NOT NULL,
                target TEXT NOT NULL,
                prop TEXT NOT NULL DEFAULT '{}',
                PRIMARY KEY (source, target)
            );
            CREATE INDEX idx_lineage_graph_target ON lineage_graph(target);
        "#,
    },
    Migration {
        version: 3,
        name: "create_jobs_queue",
        sql: r#"
            CREATE TABLE jobs_queue (
                id TEXT PRIMARY KEY,
                type TEXT NOT NULL,
                payload BLOB NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                run_at TEXT NOT NULL,
                attempts_done INTEGER NOT NULL DEFAULT 0,
                last_attempt_at TEXT,
                last_error TEXT,
                locked_until TEXT
            );
            CREATE INDEX idx_jobs_queue_run_at ON jobs_queue(run_at);
            CREATE INDEX idx_jobs_queue_type_run_at ON jobs_queue(type, run_at);

            CREATE TABLE dead_jobs (
                id TEXT PRIMARY KEY,
                type TEXT NOT NULL,
                payload BLOB NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                run_at TEXT NOT NULL,
                attempts_done INTEGER NOT NULL DEFAULT 0,
                last_attempt_at TEXT,
                last_error TEXT
            );
        "#,
    },
];

fn ensure_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL
        )",
    )
    .map_err(|e| CompassError::Database {
        message: format!("Failed to create schema_migrations: {}", e),
        source: Some(e),
    })
}

pub(crate) fn current_version(conn: &Connection) -> Result<i64> {
    ensure_table(conn)?;
    let version: Option<i64> = conn
        .query_row("SELECT MAX(version) FROM schema_migrations", [], |row| row.get(0))
        .optional()?
        .flatten();
    Ok(version.unwrap_or(0))
}

/// Apply every migration newer than the recorded version.
pub(crate) fn apply(conn: &mut Connection) -> Result<usize> {
    let current = current_version(conn)?;
    let mut applied = 0;

    for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute_batch(migration.sql)
            .map_err(|e| CompassError::Database {
                message: format!(
                    "Failed to apply migration {} ({}): {}",
                    migration.version, migration.name, e
                ),
                source: Some(e),
            })?;
        tx.execute(
            "INSERT INTO schema_migrations (version, name, applied_at) VALUES (?1, ?2, ?3)",
            params![
                migration.version,
                migration.name,
                super::format_ts(&chrono::Utc::now())
            ],
        )?;
        tx.commit()?;
        debug!(version = migration.version, name = migration.name, "Applied migration");
        applied += 1;
    }

    Ok(applied)
}
