//! SQLite primary store.
//!
//! The relational store is the authority for assets, their version
//! history, owners, probes and lineage. It also backs the durable job
//! queue. Every repository shares one [`Database`] handle; blocking SQLite
//! calls run on the blocking thread pool through [`Database::run`].

mod asset_repo;
mod filter;
mod job_queue;
mod lineage_repo;
mod migrations;
mod user_repo;

pub use asset_repo::SqliteAssetRepository;
pub use job_queue::SqliteJobQueue;
pub use lineage_repo::SqliteLineageRepository;
pub use migrations::{Migration, MIGRATIONS};
pub use user_repo::SqliteUserRepository;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;
use tracing::{debug, info};

use crate::config::StoreConfig;
use crate::error::{CompassError, Result};

/// Shared handle to the SQLite database.
#[derive(Clone)]
pub struct Database {
    path: PathBuf,
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) the database at `path` and apply pending migrations.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let db = Self::open_without_migrations(path)?;
        db.migrate()?;
        Ok(db)
    }

    /// Open the database without touching its schema.
    pub fn open_without_migrations(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| CompassError::Io {
                    message: format!("Failed to create directory {}", parent.display()),
                    source: Some(e),
                })?;
            }
        }

        let conn = Connection::open(&path).map_err(|e| CompassError::Database {
            message: format!("Failed to open database {}: {}", path.display(), e),
            source: Some(e),
        })?;
        Self::configure_connection(&conn)?;

        debug!(path = %path.display(), "Opened database");
        Ok(Self {
            path,
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Configure connection with optimal settings.
    fn configure_connection(conn: &Connection) -> Result<()> {
        conn.busy_timeout(StoreConfig::BUSY_TIMEOUT)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            PRAGMA foreign_keys=ON;
            PRAGMA temp_store=MEMORY;
            ",
        )
        .map_err(|e| CompassError::Database {
            message: format!("Failed to set pragmas: {}", e),
            source: Some(e),
        })?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Apply pending migrations, returning how many ran.
    pub fn migrate(&self) -> Result<usize> {
        let mut conn = self.lock()?;
        let applied = migrations::apply(&mut conn)?;
        if applied > 0 {
            info!(applied, path = %self.path.display(), "Applied database migrations");
        }
        Ok(applied)
    }

    /// Latest applied migration version, zero for a fresh database.
    pub fn schema_version(&self) -> Result<i64> {
        let conn = self.lock()?;
        migrations::current_version(&conn)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| CompassError::database("Failed to acquire connection lock"))
    }

    /// Run `f` against the connection on the blocking thread pool.
    pub(crate) async fn run<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|_| CompassError::database("Failed to acquire connection lock"))?;
            f(&mut conn)
        })
        .await
        .map_err(|e| CompassError::Other(format!("Database task failed: {}", e)))?
    }
}

/// Fixed-width UTC timestamp so that text order is chronological.
pub(crate) fn format_ts(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })
}

pub(crate) fn parse_opt_ts(raw: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    raw.as_deref().map(parse_ts).transpose()
}

/// Decode a JSON text column.
pub(crate) fn parse_json<T: serde::de::DeserializeOwned>(raw: &str) -> rusqlite::Result<T> {
    serde_json::from_str(raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}

/// `?, ?, ?` with `n` placeholders.
pub(crate) fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

/// True when `err` is a unique or primary key violation.
pub(crate) fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                || e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
    )
}

pub(crate) fn is_foreign_key_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_FOREIGNKEY
    )
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::Database;
    use tempfile::TempDir;

    /// A migrated database in a temporary directory.
    pub fn temp_db() -> (TempDir, Database) {
        let dir = TempDir::new().unwrap();
        let db = Database::open(dir.path().join("compass.db")).unwrap();
        (dir, db)
    }
}
