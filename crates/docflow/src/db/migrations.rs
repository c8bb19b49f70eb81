//! Schema migrations for the docflow tables.
//!
//! Versions are recorded in `_migrations`; anything newer than the highest
//! recorded version is applied in order. Column additions are skipped when
//! the column is already there.

use rusqlite::Connection;

use super::error::DatabaseError;

struct Migration {
    version: u32,
    description: &'static str,
    sql: &'static str,
    kind: MigrationKind,
}

enum MigrationKind {
    Standard,
    /// `ALTER TABLE ... ADD COLUMN`, skipped when the column exists.
    AddColumn {
        table: &'static str,
        column: &'static str,
    },
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "create_documents_table",
        sql: include_str!("sql/001_create_documents.sql"),
        kind: MigrationKind::Standard,
    },
    Migration {
        version: 2,
        description: "create_document_jobs_table",
        sql: include_str!("sql/002_create_document_jobs.sql"),
        kind: MigrationKind::Standard,
    },
    Migration {
        version: 3,
        description: "create_vector_chunks_table",
        sql: include_str!("sql/003_create_vector_chunks.sql"),
        kind: MigrationKind::Standard,
    },
    Migration {
        version: 4,
        description: "create_tasks_table",
        sql: include_str!("sql/004_create_tasks.sql"),
        kind: MigrationKind::Standard,
    },
    Migration {
        version: 5,
        description: "add_delete_marker_version_to_documents",
        sql: include_str!("sql/005_add_delete_marker_version.sql"),
        kind: MigrationKind::AddColumn {
            table: "documents",
            column: "delete_marker_version_id",
        },
    },
];

const TRACKING_TABLE: &str = "CREATE TABLE IF NOT EXISTS _migrations (
    version INTEGER PRIMARY KEY,
    description TEXT NOT NULL,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);";

/// Highest migration version recorded, 0 for a fresh database.
pub fn schema_version(conn: &Connection) -> Result<u32, DatabaseError> {
    Ok(conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM _migrations",
        [],
        |r| r.get(0),
    )?)
}

/// Applies every migration newer than the recorded schema version and
/// returns how many ran.
pub fn run_all(conn: &Connection) -> Result<usize, DatabaseError> {
    conn.execute_batch(TRACKING_TABLE)?;
    let current = schema_version(conn)?;

    let mut applied = 0;
    for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
        apply(conn, migration)?;
        applied += 1;
    }

    if applied > 0 {
        log::info!(
            "Applied {} migration(s), schema now at v{}",
            applied,
            schema_version(conn)?
        );
    }
    Ok(applied)
}

/// Schema change and its `_migrations` row commit together.
fn apply(conn: &Connection, migration: &Migration) -> Result<(), DatabaseError> {
    let failed = |e: rusqlite::Error| DatabaseError::Migration {
        version: migration.version,
        reason: e.to_string(),
    };
    let tx = conn.unchecked_transaction().map_err(failed)?;

    let needed = match &migration.kind {
        MigrationKind::Standard => true,
        MigrationKind::AddColumn { table, column } => !column_exists(&tx, table, column)?,
    };
    if needed {
        log::info!(
            "Running migration v{}: {}",
            migration.version,
            migration.description
        );
        tx.execute_batch(migration.sql).map_err(failed)?;
    } else {
        log::debug!(
            "Migration v{} already reflected in the schema, recording it",
            migration.version
        );
    }

    tx.execute(
        "INSERT INTO _migrations (version, description) VALUES (?1, ?2)",
        rusqlite::params![migration.version, migration.description],
    )?;
    tx.commit().map_err(failed)
}

fn column_exists(conn: &Connection, table: &str, column: &str) -> Result<bool, DatabaseError> {
    // PRAGMA arguments cannot be bound as parameters.
    if table.is_empty() || !table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(DatabaseError::Migration {
            version: 0,
            reason: format!("refusing to inspect table '{}'", table),
        });
    }
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let mut names = stmt.query_map([], |row| row.get::<_, String>(1))?;
    names.try_fold(false, |found, name| -> Result<bool, DatabaseError> {
        Ok(found || name? == column)
    })
}
