//! Filesystem-backed versioned object store.
//!
//! Layout under the root directory:
//!
//! ```text
//! objects/<hex(key)>/versions.json   ordered version manifest, oldest first
//! objects/<hex(key)>/<version>.bin   content of one version
//! ```

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StorageError;

use super::{
    new_version_id, sha256_hex, validate_key, ObjectMetadata, ObjectStore, ObjectVersion,
    PresignedUrl, PutReceipt, SoftDeleteOutcome, UrlSigner, VersionTarget,
};

const MANIFEST: &str = "versions.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Manifest {
    key: String,
    versions: Vec<VersionEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct VersionEntry {
    version_id: String,
    is_delete_marker: bool,
    last_modified: DateTime<Utc>,
    size: u64,
    etag: Option<String>,
    checksum: Option<String>,
    content_type: Option<String>,
    #[serde(default)]
    metadata: Option<ObjectMetadata>,
}

impl VersionEntry {
    fn view(&self) -> ObjectVersion {
        ObjectVersion {
            version_id: self.version_id.clone(),
            is_delete_marker: self.is_delete_marker,
            last_modified: self.last_modified,
            size: self.size,
            etag: self.etag.clone(),
            checksum: self.checksum.clone(),
        }
    }
}

pub struct FsObjectStore {
    root: PathBuf,
    signer: UrlSigner,
    max_object_bytes: u64,
    // Serializes manifest read-modify-write within this process.
    lock: Mutex<()>,
}

impl FsObjectStore {
    pub fn new<P: AsRef<Path>>(root: P, signer: UrlSigner, max_object_bytes: u64) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            signer,
            max_object_bytes,
            lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn objects_dir(&self) -> PathBuf {
        self.root.join("objects")
    }

    fn object_dir(&self, key: &str) -> PathBuf {
        self.objects_dir().join(hex::encode(key.as_bytes()))
    }

    fn guard(&self) -> Result<std::sync::MutexGuard<'_, ()>, StorageError> {
        self.lock
            .lock()
            .map_err(|_| StorageError::Unavailable("object store lock poisoned".to_string()))
    }

    fn ensure_directory(&self, path: &Path) -> Result<(), StorageError> {
        if !path.exists() {
            fs::create_dir_all(path).map_err(|e| io_error(path, e))?;
        }
        Ok(())
    }

    fn load_manifest(&self, key: &str) -> Result<Option<Manifest>, StorageError> {
        let path = self.object_dir(key).join(MANIFEST);
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_error(&path, e)),
        };
        serde_json::from_slice(&raw)
            .map(Some)
            .map_err(|source| StorageError::Manifest { path, source })
    }

    /// Writes the manifest to a temp file and renames it into place.
    fn save_manifest(&self, manifest: &Manifest) -> Result<(), StorageError> {
        let dir = self.object_dir(&manifest.key);
        self.ensure_directory(&dir)?;
        let path = dir.join(MANIFEST);
        let tmp = dir.join(format!("{}.{}.tmp", MANIFEST, uuid::Uuid::new_v4().simple()));
        let raw = serde_json::to_vec_pretty(manifest).map_err(|source| StorageError::Manifest {
            path: path.clone(),
            source,
        })?;
        fs::write(&tmp, raw).map_err(|e| io_error(&tmp, e))?;
        fs::rename(&tmp, &path).map_err(|e| io_error(&path, e))?;
        Ok(())
    }

    fn require_manifest(&self, key: &str) -> Result<Manifest, StorageError> {
        validate_key(key)?;
        self.load_manifest(key)?.ok_or_else(|| StorageError::NotFound {
            key: key.to_string(),
        })
    }

    fn blob_path(&self, key: &str, version_id: &str) -> PathBuf {
        self.object_dir(key).join(format!("{}.bin", version_id))
    }

    fn write_blob(&self, path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::AlreadyExists => StorageError::FileExists(path.to_path_buf()),
                _ => io_error(path, e),
            })?;
        file.write_all(bytes).map_err(|e| io_error(path, e))?;
        file.sync_all().map_err(|e| io_error(path, e))
    }

    fn remove_blob(&self, key: &str, entry: &VersionEntry) -> Result<(), StorageError> {
        if entry.is_delete_marker {
            return Ok(());
        }
        let path = self.blob_path(key, &entry.version_id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(&path, e)),
        }
    }
}

fn io_error(path: &Path, source: std::io::Error) -> StorageError {
    if source.kind() == std::io::ErrorKind::PermissionDenied {
        return StorageError::AccessDenied {
            key: path.display().to_string(),
        };
    }
    StorageError::Io {
        path: path.to_path_buf(),
        source,
    }
}

impl ObjectStore for FsObjectStore {
    fn upload(
        &self,
        key: &str,
        bytes: &[u8],
        content_type: &str,
        metadata: &ObjectMetadata,
    ) -> Result<PutReceipt, StorageError> {
        validate_key(key)?;
        let size = bytes.len() as u64;
        if size > self.max_object_bytes {
            return Err(StorageError::TooLarge {
                size,
                limit: self.max_object_bytes,
            });
        }

        let _guard = self.guard()?;
        let mut manifest = self.load_manifest(key)?.unwrap_or_else(|| Manifest {
            key: key.to_string(),
            versions: Vec::new(),
        });

        let now = Utc::now();
        let version_id = new_version_id(now);
        let checksum = sha256_hex(bytes);
        let etag = format!("\"{}\"", &checksum[..32]);

        self.ensure_directory(&self.object_dir(key))?;
        self.write_blob(&self.blob_path(key, &version_id), bytes)?;

        manifest.versions.push(VersionEntry {
            version_id: version_id.clone(),
            is_delete_marker: false,
            last_modified: now,
            size,
            etag: Some(etag.clone()),
            checksum: Some(checksum),
            content_type: Some(content_type.to_string()),
            metadata: Some(metadata.clone()),
        });
        self.save_manifest(&manifest)?;

        log::debug!("Stored {} ({} bytes) as version {}", key, size, version_id);
        Ok(PutReceipt { etag, version_id })
    }

    fn soft_delete(&self, key: &str) -> Result<SoftDeleteOutcome, StorageError> {
        let _guard = self.guard()?;
        let mut manifest = self.require_manifest(key)?;

        if let Some(last) = manifest.versions.last() {
            if last.is_delete_marker {
                return Ok(SoftDeleteOutcome::AlreadyDeleted {
                    marker_version_id: last.version_id.clone(),
                    deleted_at: last.last_modified,
                });
            }
        } else {
            return Err(StorageError::NotFound {
                key: key.to_string(),
            });
        }

        let now = Utc::now();
        let marker_version_id = new_version_id(now);
        manifest.versions.push(VersionEntry {
            version_id: marker_version_id.clone(),
            is_delete_marker: true,
            last_modified: now,
            size: 0,
            etag: None,
            checksum: None,
            content_type: None,
            metadata: None,
        });
        self.save_manifest(&manifest)?;

        Ok(SoftDeleteOutcome::Deleted {
            marker_version_id,
            deleted_at: now,
        })
    }

    fn restore(&self, key: &str, version_id: &str) -> Result<ObjectVersion, StorageError> {
        let _guard = self.guard()?;
        let mut manifest = self.require_manifest(key)?;

        let latest = manifest.versions.last().map(|v| v.version_id.as_str());
        let marker = manifest
            .versions
            .iter()
            .rev()
            .find(|v| v.is_delete_marker)
            .map(|v| v.version_id.as_str());

        if latest != Some(version_id) || marker != Some(version_id) {
            return Err(StorageError::RestoreRejected {
                key: key.to_string(),
                reason: format!(
                    "version '{}' is not the current delete marker (latest: {:?}, marker: {:?})",
                    version_id, latest, marker
                ),
            });
        }

        manifest.versions.pop();
        self.save_manifest(&manifest)?;

        manifest
            .versions
            .last()
            .map(VersionEntry::view)
            .ok_or_else(|| StorageError::NotFound {
                key: key.to_string(),
            })
    }

    fn permanent_delete(
        &self,
        key: &str,
        target: &VersionTarget,
    ) -> Result<usize, StorageError> {
        let _guard = self.guard()?;
        let mut manifest = self.require_manifest(key)?;

        match target {
            VersionTarget::All => {
                for entry in &manifest.versions {
                    self.remove_blob(key, entry)?;
                }
                let removed = manifest.versions.len();
                let dir = self.object_dir(key);
                fs::remove_dir_all(&dir).map_err(|e| io_error(&dir, e))?;
                Ok(removed)
            }
            VersionTarget::Version(version_id) => {
                let idx = manifest
                    .versions
                    .iter()
                    .position(|v| &v.version_id == version_id)
                    .ok_or_else(|| StorageError::VersionNotFound {
                        key: key.to_string(),
                        version_id: version_id.clone(),
                    })?;
                let entry = manifest.versions.remove(idx);
                self.remove_blob(key, &entry)?;
                if manifest.versions.is_empty() {
                    let dir = self.object_dir(key);
                    fs::remove_dir_all(&dir).map_err(|e| io_error(&dir, e))?;
                } else {
                    self.save_manifest(&manifest)?;
                }
                Ok(1)
            }
        }
    }

    fn latest_version(&self, key: &str) -> Result<Option<ObjectVersion>, StorageError> {
        validate_key(key)?;
        Ok(self
            .load_manifest(key)?
            .and_then(|m| m.versions.last().map(VersionEntry::view)))
    }

    fn latest_delete_marker_version(
        &self,
        key: &str,
    ) -> Result<Option<ObjectVersion>, StorageError> {
        validate_key(key)?;
        Ok(self.load_manifest(key)?.and_then(|m| {
            m.versions
                .iter()
                .rev()
                .find(|v| v.is_delete_marker)
                .map(VersionEntry::view)
        }))
    }

    fn stream(&self, key: &str) -> Result<Box<dyn Read + Send>, StorageError> {
        let manifest = self.require_manifest(key)?;
        let current = manifest
            .versions
            .last()
            .filter(|v| !v.is_delete_marker)
            .ok_or_else(|| StorageError::NotFound {
                key: key.to_string(),
            })?;
        let path = self.blob_path(key, &current.version_id);
        let file = File::open(&path).map_err(|e| io_error(&path, e))?;
        Ok(Box::new(file))
    }

    fn presign(&self, key: &str, ttl: Duration) -> Result<PresignedUrl, StorageError> {
        match self.latest_version(key)? {
            Some(v) if !v.is_delete_marker => self.signer.sign(key, ttl, Utc::now()),
            _ => Err(StorageError::NotFound {
                key: key.to_string(),
            }),
        }
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let dir = self.objects_dir();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_error(&dir, e)),
        };

        let mut keys = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| io_error(&dir, e))?;
            let Some(key) = entry
                .file_name()
                .to_str()
                .and_then(|name| hex::decode(name).ok())
                .and_then(|raw| String::from_utf8(raw).ok())
            else {
                continue;
            };
            if !key.starts_with(prefix) {
                continue;
            }
            if let Some(manifest) = self.load_manifest(&key)? {
                if manifest.versions.last().is_some_and(|v| !v.is_delete_marker) {
                    keys.push(key);
                }
            }
        }
        keys.sort();
        Ok(keys)
    }
}
