//! SQLite persistence for documents, jobs, vector chunks and queued tasks.
//!
//! Every repository function takes a `Database` and runs its statements
//! under the handle's connection lock.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;

pub mod chunk_repo;
pub mod document_repo;
pub mod error;
pub mod job_repo;
pub mod migrations;
pub mod task_repo;

pub use error::DatabaseError;

/// Shared handle to one SQLite connection. Clones refer to the same
/// connection, so a multi-statement closure passed to `with_conn` sees no
/// interleaved writes from other workers.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Opens or creates the file, creating parent directories, and migrates it.
    pub fn open(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| DatabaseError::Io {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON; PRAGMA busy_timeout=5000;",
        )?;

        migrations::run_all(&conn)?;

        log::info!("Database opened at {}", path.display());

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Fresh migrated database that lives as long as the handle.
    pub fn open_in_memory() -> Result<Self, DatabaseError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;

        migrations::run_all(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Runs `f` while holding the connection lock.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, DatabaseError>
    where
        F: FnOnce(&Connection) -> Result<T, DatabaseError>,
    {
        let conn = self.conn.lock().map_err(|_| DatabaseError::LockPoisoned)?;
        f(&conn)
    }
}

/// Returns the canonical database path: `~/.docflow/data/docflow.db`.
pub fn default_database_path() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".docflow").join("data").join("docflow.db"))
}

/// Formats a timestamp for storage. Fixed precision keeps the stored
/// strings ordered the same way as the instants they represent.
pub fn format_timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parses a stored timestamp.
pub fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, DatabaseError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| DatabaseError::UnknownValue {
            kind: "timestamp",
            value: s.to_string(),
        })
}

pub(crate) fn parse_optional_timestamp(
    s: Option<String>,
) -> Result<Option<DateTime<Utc>>, DatabaseError> {
    s.as_deref().map(parse_timestamp).transpose()
}
