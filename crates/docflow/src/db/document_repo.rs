//! Document repository: CRUD operations for the `documents` table.

use rusqlite::{params, OptionalExtension, Row};

use super::{Database, DatabaseError};

/// A raw document row from the database.
#[derive(Debug, Clone)]
pub struct DocumentRow {
    pub id: String,
    pub user_id: String,
    pub filename: String,
    pub checksum: String,
    pub size_bytes: u64,
    pub mime_type: Option<String>,
    pub storage_key: Option<String>,
    pub storage_status: String,
    pub version_id: Option<String>,
    pub is_deleted: bool,
    pub deleted_at: Option<String>,
    pub delete_marker_version_id: Option<String>,
    pub error_message: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl DocumentRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            user_id: row.get("user_id")?,
            filename: row.get("filename")?,
            checksum: row.get("checksum")?,
            size_bytes: row.get("size_bytes")?,
            mime_type: row.get("mime_type")?,
            storage_key: row.get("storage_key")?,
            storage_status: row.get("storage_status")?,
            version_id: row.get("version_id")?,
            is_deleted: row.get("is_deleted")?,
            deleted_at: row.get("deleted_at")?,
            delete_marker_version_id: row.get("delete_marker_version_id")?,
            error_message: row.get("error_message")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

/// Inserts a new document row.
pub fn insert(db: &Database, doc: &DocumentRow) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO documents (id, user_id, filename, checksum, size_bytes, mime_type,
             storage_key, storage_status, version_id, is_deleted, deleted_at,
             delete_marker_version_id, error_message, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                doc.id,
                doc.user_id,
                doc.filename,
                doc.checksum,
                doc.size_bytes,
                doc.mime_type,
                doc.storage_key,
                doc.storage_status,
                doc.version_id,
                doc.is_deleted,
                doc.deleted_at,
                doc.delete_marker_version_id,
                doc.error_message,
                doc.created_at,
                doc.updated_at,
            ],
        )?;
        Ok(())
    })
}

/// Finds a document by its ID.
pub fn find_by_id(db: &Database, id: &str) -> Result<Option<DocumentRow>, DatabaseError> {
    db.with_conn(|conn| {
        let row = conn
            .query_row(
                "SELECT * FROM documents WHERE id = ?1",
                params![id],
                DocumentRow::from_row,
            )
            .optional()?;
        Ok(row)
    })
}

/// Finds a live (not soft-deleted) document of a user by content checksum.
pub fn find_by_checksum_and_user(
    db: &Database,
    checksum: &str,
    user_id: &str,
) -> Result<Option<DocumentRow>, DatabaseError> {
    db.with_conn(|conn| {
        let row = conn
            .query_row(
                "SELECT * FROM documents
                 WHERE checksum = ?1 AND user_id = ?2 AND is_deleted = 0
                 ORDER BY created_at DESC LIMIT 1",
                params![checksum, user_id],
                DocumentRow::from_row,
            )
            .optional()?;
        Ok(row)
    })
}

/// Updates the storage status and error message of a document.
pub fn update_status(
    db: &Database,
    id: &str,
    status: &str,
    error_message: Option<&str>,
    updated_at: &str,
) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE documents SET storage_status = ?2, error_message = ?3, updated_at = ?4
             WHERE id = ?1",
            params![id, status, error_message, updated_at],
        )?;
        Ok(changed == 1)
    })
}

/// Records a confirmed object-store write.
pub fn mark_active(
    db: &Database,
    id: &str,
    storage_key: &str,
    version_id: &str,
    updated_at: &str,
) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE documents SET storage_status = 'ACTIVE', storage_key = ?2, version_id = ?3,
             error_message = NULL, updated_at = ?4
             WHERE id = ?1",
            params![id, storage_key, version_id, updated_at],
        )?;
        Ok(changed == 1)
    })
}

/// Flags a document as soft-deleted.
pub fn soft_delete(
    db: &Database,
    id: &str,
    delete_marker_version_id: &str,
    deleted_at: &str,
) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE documents SET storage_status = 'DELETED', is_deleted = 1, deleted_at = ?3,
             delete_marker_version_id = ?2, updated_at = ?3
             WHERE id = ?1",
            params![id, delete_marker_version_id, deleted_at],
        )?;
        Ok(changed == 1)
    })
}

/// Clears the soft-delete flags and records the version now current.
pub fn restore(
    db: &Database,
    id: &str,
    version_id: Option<&str>,
    updated_at: &str,
) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE documents SET storage_status = 'ACTIVE', is_deleted = 0, deleted_at = NULL,
             delete_marker_version_id = NULL, version_id = COALESCE(?2, version_id),
             updated_at = ?3
             WHERE id = ?1",
            params![id, version_id, updated_at],
        )?;
        Ok(changed == 1)
    })
}

/// Removes a document row. Jobs and vector chunks cascade.
pub fn delete(db: &Database, id: &str) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute("DELETE FROM documents WHERE id = ?1", params![id])?;
        Ok(changed == 1)
    })
}

/// Soft-deleted documents whose `deleted_at` is older than `cutoff` and that
/// have no job awaiting retry or still inside its timeout at `now`. Oldest
/// first. A PENDING or RUNNING job past its timeout was abandoned and does
/// not hold the document back.
pub fn find_expired_soft_deleted(
    db: &Database,
    cutoff: &str,
    now: &str,
    limit: u64,
) -> Result<Vec<DocumentRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM documents d
             WHERE d.is_deleted = 1 AND d.deleted_at IS NOT NULL AND d.deleted_at < ?1
               AND NOT EXISTS (
                   SELECT 1 FROM document_jobs j
                   WHERE j.document_id = d.id
                     AND (j.status = 'RETRYING'
                          OR (j.status IN ('PENDING', 'RUNNING')
                              AND julianday(COALESCE(j.started_at, j.created_at))
                                  + j.timeout_secs / 86400.0 >= julianday(?3)))
               )
             ORDER BY d.deleted_at ASC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![cutoff, limit as i64, now], DocumentRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}
