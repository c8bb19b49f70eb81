//! Versioned object storage.
//!
//! Objects are addressed by key and keep every written version. A soft
//! delete appends a delete-marker version; restore removes that marker so the
//! previous content version becomes current again.

pub mod fs;
pub mod memory;
pub mod signer;
pub mod staging;

use std::collections::BTreeMap;
use std::io::Read;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::StorageError;

pub use fs::FsObjectStore;
pub use memory::{MemoryObjectStore, StoreOp};
pub use signer::{PresignedUrl, UrlSigner};
pub use staging::StagingArea;

/// Descriptive metadata stored with a content version.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectMetadata {
    pub file_id: String,
    pub user_id: String,
    pub original_filename: String,
    pub checksum: String,
    pub uploaded_at: Option<DateTime<Utc>>,
}

impl ObjectMetadata {
    pub fn to_map(&self) -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        map.insert("file-id".to_string(), self.file_id.clone());
        map.insert("user-id".to_string(), self.user_id.clone());
        map.insert(
            "original-filename".to_string(),
            self.original_filename.clone(),
        );
        map.insert("checksum".to_string(), self.checksum.clone());
        if let Some(at) = self.uploaded_at {
            map.insert("upload-time".to_string(), at.to_rfc3339());
        }
        map
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutReceipt {
    pub etag: String,
    pub version_id: String,
}

/// One entry in an object's version history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectVersion {
    pub version_id: String,
    pub is_delete_marker: bool,
    pub last_modified: DateTime<Utc>,
    pub size: u64,
    pub etag: Option<String>,
    pub checksum: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SoftDeleteOutcome {
    Deleted {
        marker_version_id: String,
        deleted_at: DateTime<Utc>,
    },
    /// The latest version was already a delete marker; nothing was written.
    AlreadyDeleted {
        marker_version_id: String,
        deleted_at: DateTime<Utc>,
    },
}

impl SoftDeleteOutcome {
    pub fn marker_version_id(&self) -> &str {
        match self {
            SoftDeleteOutcome::Deleted {
                marker_version_id, ..
            }
            | SoftDeleteOutcome::AlreadyDeleted {
                marker_version_id, ..
            } => marker_version_id,
        }
    }

    pub fn deleted_at(&self) -> DateTime<Utc> {
        match self {
            SoftDeleteOutcome::Deleted { deleted_at, .. }
            | SoftDeleteOutcome::AlreadyDeleted { deleted_at, .. } => *deleted_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionTarget {
    All,
    Version(String),
}

/// Versioned blob storage.
pub trait ObjectStore: Send + Sync {
    /// Writes a new content version.
    fn upload(
        &self,
        key: &str,
        bytes: &[u8],
        content_type: &str,
        metadata: &ObjectMetadata,
    ) -> Result<PutReceipt, StorageError>;

    /// Appends a delete marker. Content versions are kept.
    fn soft_delete(&self, key: &str) -> Result<SoftDeleteOutcome, StorageError>;

    /// Removes the delete marker `version_id`. Rejected unless that marker is
    /// both the latest version and the latest marker. Returns the version that
    /// is current afterwards.
    fn restore(&self, key: &str, version_id: &str) -> Result<ObjectVersion, StorageError>;

    /// Irreversibly removes versions. Returns how many were removed.
    fn permanent_delete(&self, key: &str, target: &VersionTarget)
        -> Result<usize, StorageError>;

    fn latest_version(&self, key: &str) -> Result<Option<ObjectVersion>, StorageError>;

    fn latest_delete_marker_version(
        &self,
        key: &str,
    ) -> Result<Option<ObjectVersion>, StorageError>;

    /// Reader over the current content version.
    fn stream(&self, key: &str) -> Result<Box<dyn Read + Send>, StorageError>;

    /// Signed GET URL for the current content version.
    fn presign(&self, key: &str, ttl: Duration) -> Result<PresignedUrl, StorageError>;

    /// Keys under `prefix` whose latest version is live content. Sorted.
    fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError>;
}

/// Lowercase hex SHA-256 of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Rejects keys that could escape the store root or address nothing.
pub fn validate_key(key: &str) -> Result<(), StorageError> {
    let reason = if key.is_empty() {
        Some("key is empty")
    } else if key.starts_with('/') {
        Some("key must be relative")
    } else if key.contains('\\') {
        Some("backslashes are not allowed")
    } else if key.split('/').any(|seg| seg == ".." || seg == ".") {
        Some("dot segments are not allowed")
    } else if key.len() > 1024 {
        Some("key is longer than 1024 bytes")
    } else {
        None
    };

    match reason {
        Some(reason) => Err(StorageError::InvalidKey {
            key: key.to_string(),
            reason: reason.to_string(),
        }),
        None => Ok(()),
    }
}

/// Version ids sort by creation time: microsecond timestamp then a random tail.
pub(crate) fn new_version_id(now: DateTime<Utc>) -> String {
    format!(
        "{:016x}{}",
        now.timestamp_micros(),
        &uuid::Uuid::new_v4().simple().to_string()[..16]
    )
}
