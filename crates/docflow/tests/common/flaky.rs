//! A document store that fails selected writes on demand.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use docflow::db::DatabaseError;
use docflow::documents::{Document, DocumentStore, NewDocument, SqliteDocumentStore, StorageStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DocOp {
    MarkActive,
    SoftDelete,
    Restore,
    PermanentDelete,
}

/// Delegates to SQLite, returning `SQLITE_BUSY` for armed operations.
pub struct FlakyDocumentStore {
    inner: SqliteDocumentStore,
    faults: Mutex<HashMap<DocOp, u32>>,
}

impl FlakyDocumentStore {
    pub fn new(inner: SqliteDocumentStore) -> Self {
        Self {
            inner,
            faults: Mutex::new(HashMap::new()),
        }
    }

    /// The next `times` calls of `op` fail with a transient error.
    pub fn fail_next(&self, op: DocOp, times: u32) {
        self.faults.lock().unwrap().insert(op, times);
    }

    fn trip(&self, op: DocOp) -> Result<(), DatabaseError> {
        let mut faults = self.faults.lock().unwrap();
        match faults.get_mut(&op) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Err(DatabaseError::Sqlite(rusqlite::Error::SqliteFailure(
                    rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
                    Some("database is locked".to_string()),
                )))
            }
            _ => Ok(()),
        }
    }
}

impl DocumentStore for FlakyDocumentStore {
    fn get_by_id(&self, id: &str) -> Result<Option<Document>, DatabaseError> {
        self.inner.get_by_id(id)
    }

    fn get_by_checksum_and_user(
        &self,
        checksum: &str,
        user_id: &str,
    ) -> Result<Option<Document>, DatabaseError> {
        self.inner.get_by_checksum_and_user(checksum, user_id)
    }

    fn create(&self, doc: &NewDocument) -> Result<Document, DatabaseError> {
        self.inner.create(doc)
    }

    fn update_status(
        &self,
        id: &str,
        status: StorageStatus,
        error: Option<&str>,
    ) -> Result<bool, DatabaseError> {
        self.inner.update_status(id, status, error)
    }

    fn mark_active(
        &self,
        id: &str,
        storage_key: &str,
        version_id: &str,
    ) -> Result<bool, DatabaseError> {
        self.trip(DocOp::MarkActive)?;
        self.inner.mark_active(id, storage_key, version_id)
    }

    fn soft_delete(
        &self,
        id: &str,
        delete_marker_version_id: &str,
        deleted_at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        self.trip(DocOp::SoftDelete)?;
        self.inner.soft_delete(id, delete_marker_version_id, deleted_at)
    }

    fn restore(&self, id: &str, version_id: Option<&str>) -> Result<bool, DatabaseError> {
        self.trip(DocOp::Restore)?;
        self.inner.restore(id, version_id)
    }

    fn permanent_delete(&self, id: &str) -> Result<bool, DatabaseError> {
        self.trip(DocOp::PermanentDelete)?;
        self.inner.permanent_delete(id)
    }

    fn get_expired_soft_deleted(
        &self,
        cutoff: DateTime<Utc>,
        limit: u64,
    ) -> Result<Vec<Document>, DatabaseError> {
        self.inner.get_expired_soft_deleted(cutoff, limit)
    }
}
