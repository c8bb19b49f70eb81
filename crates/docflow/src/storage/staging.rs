//! Holding area for submitted bytes until the Upload stage has written them
//! to the object store. Tasks carry only identifiers; the bytes wait here.

use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::StorageError;

#[derive(Debug, Clone)]
pub struct StagingArea {
    directory: PathBuf,
}

impl StagingArea {
    pub fn new<P: AsRef<Path>>(directory: P) -> Self {
        Self {
            directory: directory.as_ref().to_path_buf(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Stores `content` for `document_id`. Creation is exclusive, so a second
    /// submission under the same id fails instead of replacing the first.
    pub fn stage(&self, document_id: &str, content: &[u8]) -> Result<PathBuf, StorageError> {
        let path = self.path_for(document_id)?;
        self.ensure_directory()?;

        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::AlreadyExists => StorageError::FileExists(path.clone()),
                _ => StorageError::Io {
                    path: path.clone(),
                    source: e,
                },
            })?;
        file.write_all(content).map_err(|e| StorageError::Io {
            path: path.clone(),
            source: e,
        })?;
        Ok(path)
    }

    pub fn read(&self, document_id: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.path_for(document_id)?;
        std::fs::read(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => StorageError::NotFound {
                key: format!("staging/{}", document_id),
            },
            _ => StorageError::Io { path, source: e },
        })
    }

    pub fn exists(&self, document_id: &str) -> bool {
        self.path_for(document_id)
            .map(|p| p.exists())
            .unwrap_or(false)
    }

    /// Removes staged bytes. Missing files are not an error.
    pub fn remove(&self, document_id: &str) -> Result<(), StorageError> {
        let path = self.path_for(document_id)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::Io { path, source: e }),
        }
    }

    fn ensure_directory(&self) -> Result<(), StorageError> {
        if !self.directory.exists() {
            std::fs::create_dir_all(&self.directory).map_err(|e| StorageError::Io {
                path: self.directory.clone(),
                source: e,
            })?;
        }
        Ok(())
    }

    fn path_for(&self, document_id: &str) -> Result<PathBuf, StorageError> {
        let valid = !document_id.is_empty()
            && document_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(StorageError::InvalidKey {
                key: document_id.to_string(),
                reason: "staging ids are limited to [A-Za-z0-9_-]".to_string(),
            });
        }
        Ok(self.directory.join(format!("{}.bin", document_id)))
    }
}
