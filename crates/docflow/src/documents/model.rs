use std::fmt;

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};

use crate::db::document_repo::DocumentRow;
use crate::db::{parse_optional_timestamp, parse_timestamp, DatabaseError};

/// Where a document's bytes stand in the object store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StorageStatus {
    Uploading,
    Active,
    Deleted,
    Archived,
    Corrupted,
}

impl StorageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageStatus::Uploading => "UPLOADING",
            StorageStatus::Active => "ACTIVE",
            StorageStatus::Deleted => "DELETED",
            StorageStatus::Archived => "ARCHIVED",
            StorageStatus::Corrupted => "CORRUPTED",
        }
    }

    pub fn from_db(s: &str) -> Result<Self, DatabaseError> {
        match s {
            "UPLOADING" => Ok(StorageStatus::Uploading),
            "ACTIVE" => Ok(StorageStatus::Active),
            "DELETED" => Ok(StorageStatus::Deleted),
            "ARCHIVED" => Ok(StorageStatus::Archived),
            "CORRUPTED" => Ok(StorageStatus::Corrupted),
            other => Err(DatabaseError::UnknownValue {
                kind: "storage status",
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for StorageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub user_id: String,
    pub filename: String,
    pub checksum: String,
    pub size_bytes: u64,
    pub mime_type: Option<String>,
    pub storage_key: Option<String>,
    pub storage_status: StorageStatus,
    pub version_id: Option<String>,
    pub is_deleted: bool,
    pub deleted_at: Option<DateTime<Utc>>,
    pub delete_marker_version_id: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Document {
    /// File extension of the original filename, lowercased.
    pub fn extension(&self) -> Option<String> {
        file_extension(&self.filename)
    }

    /// The key this document's bytes live under. Falls back to the key
    /// derived from its id and creation date before the first upload lands.
    pub fn object_key(&self) -> String {
        self.storage_key
            .clone()
            .unwrap_or_else(|| storage_key_for(&self.id, &self.filename, self.created_at))
    }
}

impl TryFrom<DocumentRow> for Document {
    type Error = DatabaseError;

    fn try_from(row: DocumentRow) -> Result<Self, Self::Error> {
        Ok(Self {
            storage_status: StorageStatus::from_db(&row.storage_status)?,
            deleted_at: parse_optional_timestamp(row.deleted_at)?,
            created_at: parse_timestamp(&row.created_at)?,
            updated_at: parse_timestamp(&row.updated_at)?,
            id: row.id,
            user_id: row.user_id,
            filename: row.filename,
            checksum: row.checksum,
            size_bytes: row.size_bytes,
            mime_type: row.mime_type,
            storage_key: row.storage_key,
            version_id: row.version_id,
            is_deleted: row.is_deleted,
            delete_marker_version_id: row.delete_marker_version_id,
            error_message: row.error_message,
        })
    }
}

/// Fields supplied when a document row is first created.
#[derive(Debug, Clone)]
pub struct NewDocument {
    pub id: String,
    pub user_id: String,
    pub filename: String,
    pub checksum: String,
    pub size_bytes: u64,
    pub mime_type: Option<String>,
}

/// Derives `uploads/YYYY/MM/DD/<id>.<ext>` for a document.
pub fn storage_key_for(document_id: &str, filename: &str, created_at: DateTime<Utc>) -> String {
    let stem: String = document_id.chars().filter(|c| *c != '-').collect();
    let mut key = format!(
        "uploads/{:04}/{:02}/{:02}/{}",
        created_at.year(),
        created_at.month(),
        created_at.day(),
        stem
    );
    if let Some(ext) = file_extension(filename) {
        key.push('.');
        key.push_str(&ext);
    }
    key
}

pub fn file_extension(filename: &str) -> Option<String> {
    std::path::Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .filter(|e| !e.is_empty())
        .map(|e| e.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_storage_key_layout() {
        let at = Utc.with_ymd_and_hms(2026, 3, 7, 12, 0, 0).unwrap();
        assert_eq!(
            storage_key_for("0b6c-11ee", "Report.PDF", at),
            "uploads/2026/03/07/0b6c11ee.pdf"
        );
        assert_eq!(storage_key_for("abc", "README", at), "uploads/2026/03/07/abc");
    }

    #[test]
    fn test_status_strings() {
        for status in [
            StorageStatus::Uploading,
            StorageStatus::Active,
            StorageStatus::Deleted,
            StorageStatus::Archived,
            StorageStatus::Corrupted,
        ] {
            assert_eq!(StorageStatus::from_db(status.as_str()).unwrap(), status);
        }
        assert!(StorageStatus::from_db("GONE").is_err());
    }

    #[test]
    fn test_file_extension() {
        assert_eq!(file_extension("a.tar.GZ").as_deref(), Some("gz"));
        assert_eq!(file_extension("noext"), None);
        assert_eq!(file_extension("trailing."), None);
    }
}
