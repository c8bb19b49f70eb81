//! Document metadata store.

use chrono::{DateTime, Utc};

use crate::db::document_repo::{self, DocumentRow};
use crate::db::{format_timestamp, Database, DatabaseError};
use crate::jobs::truncate_error;

use super::model::{Document, NewDocument, StorageStatus};

/// Persistence for `Document` records. Stage executors hold this as a trait
/// object so tests can substitute a store that fails on demand.
pub trait DocumentStore: Send + Sync {
    fn get_by_id(&self, id: &str) -> Result<Option<Document>, DatabaseError>;

    /// A live (not soft-deleted) document of `user_id` with this checksum.
    fn get_by_checksum_and_user(
        &self,
        checksum: &str,
        user_id: &str,
    ) -> Result<Option<Document>, DatabaseError>;

    /// Inserts a document in UPLOADING state.
    fn create(&self, doc: &NewDocument) -> Result<Document, DatabaseError>;

    fn update_status(
        &self,
        id: &str,
        status: StorageStatus,
        error: Option<&str>,
    ) -> Result<bool, DatabaseError>;

    /// Records a confirmed object-store write: ACTIVE with key and version.
    fn mark_active(
        &self,
        id: &str,
        storage_key: &str,
        version_id: &str,
    ) -> Result<bool, DatabaseError>;

    fn soft_delete(
        &self,
        id: &str,
        delete_marker_version_id: &str,
        deleted_at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    fn restore(&self, id: &str, version_id: Option<&str>) -> Result<bool, DatabaseError>;

    fn permanent_delete(&self, id: &str) -> Result<bool, DatabaseError>;

    /// Soft-deleted before `cutoff`, with no unfinished job. Oldest first.
    fn get_expired_soft_deleted(
        &self,
        cutoff: DateTime<Utc>,
        limit: u64,
    ) -> Result<Vec<Document>, DatabaseError>;
}

/// SQLite-backed document store.
#[derive(Clone)]
pub struct SqliteDocumentStore {
    db: Database,
}

impl SqliteDocumentStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

fn to_document(row: Option<DocumentRow>) -> Result<Option<Document>, DatabaseError> {
    row.map(Document::try_from).transpose()
}

impl DocumentStore for SqliteDocumentStore {
    fn get_by_id(&self, id: &str) -> Result<Option<Document>, DatabaseError> {
        to_document(document_repo::find_by_id(&self.db, id)?)
    }

    fn get_by_checksum_and_user(
        &self,
        checksum: &str,
        user_id: &str,
    ) -> Result<Option<Document>, DatabaseError> {
        to_document(document_repo::find_by_checksum_and_user(
            &self.db, checksum, user_id,
        )?)
    }

    fn create(&self, doc: &NewDocument) -> Result<Document, DatabaseError> {
        let now = format_timestamp(Utc::now());
        let row = DocumentRow {
            id: doc.id.clone(),
            user_id: doc.user_id.clone(),
            filename: doc.filename.clone(),
            checksum: doc.checksum.clone(),
            size_bytes: doc.size_bytes,
            mime_type: doc.mime_type.clone(),
            storage_key: None,
            storage_status: StorageStatus::Uploading.as_str().to_string(),
            version_id: None,
            is_deleted: false,
            deleted_at: None,
            delete_marker_version_id: None,
            error_message: None,
            created_at: now.clone(),
            updated_at: now,
        };
        document_repo::insert(&self.db, &row)?;
        Document::try_from(row)
    }

    fn update_status(
        &self,
        id: &str,
        status: StorageStatus,
        error: Option<&str>,
    ) -> Result<bool, DatabaseError> {
        let error = error.map(truncate_error);
        document_repo::update_status(
            &self.db,
            id,
            status.as_str(),
            error.as_deref(),
            &format_timestamp(Utc::now()),
        )
    }

    fn mark_active(
        &self,
        id: &str,
        storage_key: &str,
        version_id: &str,
    ) -> Result<bool, DatabaseError> {
        document_repo::mark_active(
            &self.db,
            id,
            storage_key,
            version_id,
            &format_timestamp(Utc::now()),
        )
    }

    fn soft_delete(
        &self,
        id: &str,
        delete_marker_version_id: &str,
        deleted_at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        document_repo::soft_delete(
            &self.db,
            id,
            delete_marker_version_id,
            &format_timestamp(deleted_at),
        )
    }

    fn restore(&self, id: &str, version_id: Option<&str>) -> Result<bool, DatabaseError> {
        document_repo::restore(&self.db, id, version_id, &format_timestamp(Utc::now()))
    }

    fn permanent_delete(&self, id: &str) -> Result<bool, DatabaseError> {
        document_repo::delete(&self.db, id)
    }

    fn get_expired_soft_deleted(
        &self,
        cutoff: DateTime<Utc>,
        limit: u64,
    ) -> Result<Vec<Document>, DatabaseError> {
        let rows = document_repo::find_expired_soft_deleted(
            &self.db,
            &format_timestamp(cutoff),
            &format_timestamp(Utc::now()),
            limit,
        )?;
        rows.into_iter().map(Document::try_from).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SqliteDocumentStore {
        SqliteDocumentStore::new(Database::open_in_memory().unwrap())
    }

    fn new_doc(id: &str) -> NewDocument {
        NewDocument {
            id: id.to_string(),
            user_id: "user-1".to_string(),
            filename: "notes.md".to_string(),
            checksum: "beef".to_string(),
            size_bytes: 10,
            mime_type: Some("text/markdown".to_string()),
        }
    }

    #[test]
    fn test_create_starts_uploading_without_key() {
        let store = store();
        let doc = store.create(&new_doc("d1")).unwrap();
        assert_eq!(doc.storage_status, StorageStatus::Uploading);
        assert!(doc.storage_key.is_none());
        assert!(doc.object_key().starts_with("uploads/"));
        assert!(doc.object_key().ends_with(".md"));
    }

    #[test]
    fn test_lifecycle_through_store() {
        let store = store();
        store.create(&new_doc("d1")).unwrap();
        assert!(store.mark_active("d1", "uploads/k.md", "v1").unwrap());

        let deleted_at = Utc::now();
        assert!(store.soft_delete("d1", "m1", deleted_at).unwrap());
        let doc = store.get_by_id("d1").unwrap().unwrap();
        assert_eq!(doc.storage_status, StorageStatus::Deleted);
        assert_eq!(
            doc.deleted_at.map(|d| d.timestamp_micros()),
            Some(deleted_at.timestamp_micros())
        );

        let expired = store
            .get_expired_soft_deleted(deleted_at + chrono::Duration::seconds(1), 10)
            .unwrap();
        assert_eq!(expired.len(), 1);
        assert!(store
            .get_expired_soft_deleted(deleted_at - chrono::Duration::seconds(1), 10)
            .unwrap()
            .is_empty());

        assert!(store.restore("d1", None).unwrap());
        assert_eq!(
            store.get_by_id("d1").unwrap().unwrap().storage_status,
            StorageStatus::Active
        );

        assert!(store.permanent_delete("d1").unwrap());
        assert!(store.get_by_id("d1").unwrap().is_none());
    }

    #[test]
    fn test_update_status_truncates_error() {
        let store = store();
        store.create(&new_doc("d1")).unwrap();
        let long = "x".repeat(900);
        store
            .update_status("d1", StorageStatus::Corrupted, Some(&long))
            .unwrap();
        let doc = store.get_by_id("d1").unwrap().unwrap();
        assert_eq!(doc.storage_status, StorageStatus::Corrupted);
        assert_eq!(doc.error_message.unwrap().len(), 500);
    }
}
