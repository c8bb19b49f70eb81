//! In-memory versioned object store with call counters and fault injection.

use std::collections::{BTreeMap, HashMap};
use std::io::{Cursor, Read};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;

use crate::error::StorageError;

use super::{
    new_version_id, sha256_hex, validate_key, ObjectMetadata, ObjectStore, ObjectVersion,
    PresignedUrl, PutReceipt, SoftDeleteOutcome, UrlSigner, VersionTarget,
};

/// Operations that can be counted and made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Upload,
    SoftDelete,
    Restore,
    PermanentDelete,
    Stream,
}

#[derive(Debug, Clone)]
struct MemVersion {
    info: ObjectVersion,
    bytes: Vec<u8>,
}

#[derive(Default)]
struct State {
    objects: BTreeMap<String, Vec<MemVersion>>,
    calls: HashMap<StoreOp, usize>,
    faults: HashMap<StoreOp, u32>,
}

pub struct MemoryObjectStore {
    state: Mutex<State>,
    signer: UrlSigner,
}

impl Default for MemoryObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            signer: UrlSigner::new("memory", "memory://objects"),
        }
    }

    /// The next `times` calls of `op` fail with [`StorageError::Unavailable`].
    pub fn inject_failure(&self, op: StoreOp, times: u32) {
        if let Ok(mut state) = self.state.lock() {
            state.faults.insert(op, times);
        }
    }

    pub fn calls(&self, op: StoreOp) -> usize {
        self.state
            .lock()
            .map(|s| s.calls.get(&op).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    pub fn version_count(&self, key: &str) -> usize {
        self.state
            .lock()
            .map(|s| s.objects.get(key).map_or(0, Vec::len))
            .unwrap_or(0)
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, StorageError> {
        self.state
            .lock()
            .map_err(|_| StorageError::Unavailable("memory store lock poisoned".to_string()))
    }

    /// Counts the call and consumes one injected fault if armed.
    fn enter(&self, op: StoreOp) -> Result<MutexGuard<'_, State>, StorageError> {
        let mut state = self.lock()?;
        *state.calls.entry(op).or_insert(0) += 1;
        if let Some(remaining) = state.faults.get_mut(&op) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(StorageError::Unavailable(format!("injected {:?} failure", op)));
            }
        }
        Ok(state)
    }
}

fn not_found(key: &str) -> StorageError {
    StorageError::NotFound {
        key: key.to_string(),
    }
}

impl ObjectStore for MemoryObjectStore {
    fn upload(
        &self,
        key: &str,
        bytes: &[u8],
        _content_type: &str,
        _metadata: &ObjectMetadata,
    ) -> Result<PutReceipt, StorageError> {
        validate_key(key)?;
        let mut state = self.enter(StoreOp::Upload)?;
        let now = Utc::now();
        let checksum = sha256_hex(bytes);
        let etag = format!("\"{}\"", &checksum[..32]);
        let version_id = new_version_id(now);

        state
            .objects
            .entry(key.to_string())
            .or_default()
            .push(MemVersion {
                info: ObjectVersion {
                    version_id: version_id.clone(),
                    is_delete_marker: false,
                    last_modified: now,
                    size: bytes.len() as u64,
                    etag: Some(etag.clone()),
                    checksum: Some(checksum),
                },
                bytes: bytes.to_vec(),
            });
        Ok(PutReceipt { etag, version_id })
    }

    fn soft_delete(&self, key: &str) -> Result<SoftDeleteOutcome, StorageError> {
        validate_key(key)?;
        let mut state = self.enter(StoreOp::SoftDelete)?;
        let versions = state
            .objects
            .get_mut(key)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| not_found(key))?;

        if let Some(last) = versions.last().filter(|v| v.info.is_delete_marker) {
            return Ok(SoftDeleteOutcome::AlreadyDeleted {
                marker_version_id: last.info.version_id.clone(),
                deleted_at: last.info.last_modified,
            });
        }

        let now = Utc::now();
        let marker_version_id = new_version_id(now);
        versions.push(MemVersion {
            info: ObjectVersion {
                version_id: marker_version_id.clone(),
                is_delete_marker: true,
                last_modified: now,
                size: 0,
                etag: None,
                checksum: None,
            },
            bytes: Vec::new(),
        });
        Ok(SoftDeleteOutcome::Deleted {
            marker_version_id,
            deleted_at: now,
        })
    }

    fn restore(&self, key: &str, version_id: &str) -> Result<ObjectVersion, StorageError> {
        validate_key(key)?;
        let mut state = self.enter(StoreOp::Restore)?;
        let versions = state.objects.get_mut(key).ok_or_else(|| not_found(key))?;

        let latest = versions.last().map(|v| v.info.version_id.clone());
        let marker = versions
            .iter()
            .rev()
            .find(|v| v.info.is_delete_marker)
            .map(|v| v.info.version_id.clone());
        if latest.as_deref() != Some(version_id) || marker.as_deref() != Some(version_id) {
            return Err(StorageError::RestoreRejected {
                key: key.to_string(),
                reason: format!("version '{}' is not the current delete marker", version_id),
            });
        }

        versions.pop();
        versions
            .last()
            .map(|v| v.info.clone())
            .ok_or_else(|| not_found(key))
    }

    fn permanent_delete(
        &self,
        key: &str,
        target: &VersionTarget,
    ) -> Result<usize, StorageError> {
        validate_key(key)?;
        let mut state = self.enter(StoreOp::PermanentDelete)?;
        match target {
            VersionTarget::All => state
                .objects
                .remove(key)
                .filter(|v| !v.is_empty())
                .map(|v| v.len())
                .ok_or_else(|| not_found(key)),
            VersionTarget::Version(version_id) => {
                let versions = state.objects.get_mut(key).ok_or_else(|| not_found(key))?;
                let idx = versions
                    .iter()
                    .position(|v| &v.info.version_id == version_id)
                    .ok_or_else(|| StorageError::VersionNotFound {
                        key: key.to_string(),
                        version_id: version_id.clone(),
                    })?;
                versions.remove(idx);
                if versions.is_empty() {
                    state.objects.remove(key);
                }
                Ok(1)
            }
        }
    }

    fn latest_version(&self, key: &str) -> Result<Option<ObjectVersion>, StorageError> {
        let state = self.lock()?;
        Ok(state
            .objects
            .get(key)
            .and_then(|v| v.last())
            .map(|v| v.info.clone()))
    }

    fn latest_delete_marker_version(
        &self,
        key: &str,
    ) -> Result<Option<ObjectVersion>, StorageError> {
        let state = self.lock()?;
        Ok(state.objects.get(key).and_then(|versions| {
            versions
                .iter()
                .rev()
                .find(|v| v.info.is_delete_marker)
                .map(|v| v.info.clone())
        }))
    }

    fn stream(&self, key: &str) -> Result<Box<dyn Read + Send>, StorageError> {
        let state = self.enter(StoreOp::Stream)?;
        let current = state
            .objects
            .get(key)
            .and_then(|v| v.last())
            .filter(|v| !v.info.is_delete_marker)
            .ok_or_else(|| not_found(key))?;
        Ok(Box::new(Cursor::new(current.bytes.clone())))
    }

    fn presign(&self, key: &str, ttl: Duration) -> Result<PresignedUrl, StorageError> {
        match self.latest_version(key)? {
            Some(v) if !v.is_delete_marker => self.signer.sign(key, ttl, Utc::now()),
            _ => Err(not_found(key)),
        }
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let state = self.lock()?;
        Ok(state
            .objects
            .iter()
            .filter(|(k, v)| {
                k.starts_with(prefix) && v.last().is_some_and(|v| !v.info.is_delete_marker)
            })
            .map(|(k, _)| k.clone())
            .collect())
    }
}
