use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DocflowError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Processing error: {0}")]
    Process(#[from] ProcessError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Vector index error: {0}")]
    Vector(#[from] VectorError),

    #[error("Job error: {0}")]
    Job(#[from] crate::jobs::JobError),

    #[error("Stage error: {0}")]
    Stage(#[from] crate::pipeline::StageError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Config validation failed: {message}")]
    Validation { message: String },
}

/// Failures of the text extraction and chunking collaborators.
#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("Unsupported document format: {0}")]
    UnsupportedFormat(String),

    #[error("Failed to process PDF: {0}")]
    PdfProcessing(String),

    #[error("Failed to process DOCX: {0}")]
    DocxProcessing(String),

    #[error("Text extraction failed: {0}")]
    TextExtraction(String),

    #[error("Extracted text is empty")]
    EmptyText,

    #[error("Extracted text is {size} bytes, above the {limit} byte ceiling")]
    TextTooLarge { size: usize, limit: usize },

    #[error("Chunking produced no chunks")]
    NoChunks,
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Object not found: {key}")]
    NotFound { key: String },

    #[error("Version '{version_id}' of object '{key}' not found")]
    VersionNotFound { key: String, version_id: String },

    #[error("Access denied for object '{key}'")]
    AccessDenied { key: String },

    #[error("Invalid object key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("Restore of '{key}' rejected: {reason}")]
    RestoreRejected { key: String, reason: String },

    #[error("Object is {size} bytes, above the {limit} byte limit")]
    TooLarge { size: u64, limit: u64 },

    #[error("Presigned URL rejected: {0}")]
    InvalidSignature(String),

    #[error("Object store unavailable: {0}")]
    Unavailable(String),

    #[error("IO error for path '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt version manifest '{path}': {source}")]
    Manifest {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("File already exists: {0}")]
    FileExists(PathBuf),
}

impl StorageError {
    /// Connectivity and I/O failures may succeed on a later attempt;
    /// everything else describes the request itself.
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Unavailable(_) | StorageError::Io { .. })
    }
}

/// Failures of the vector index collaborator.
#[derive(Error, Debug)]
pub enum VectorError {
    #[error("Vector service unavailable: {0}")]
    Unavailable(String),

    #[error("Vector service rejected the request: {0}")]
    Rejected(String),
}

impl VectorError {
    pub fn is_transient(&self) -> bool {
        matches!(self, VectorError::Unavailable(_))
    }
}

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Queue database error: {0}")]
    Database(#[from] crate::db::DatabaseError),

    #[error("Invalid task payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("Unknown task kind '{0}'")]
    UnknownKind(String),

    #[error("Task '{0}' not found")]
    NotFound(String),
}

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Failed to spawn worker: {0}")]
    SpawnFailed(String),

    #[error("Worker channel closed unexpectedly")]
    ChannelClosed,
}

pub type Result<T> = std::result::Result<T, DocflowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_error_transience() {
        assert!(StorageError::Unavailable("connection reset".into()).is_transient());
        assert!(StorageError::Io {
            path: PathBuf::from("/tmp/x"),
            source: std::io::Error::other("disk"),
        }
        .is_transient());
        assert!(!StorageError::AccessDenied { key: "k".into() }.is_transient());
        assert!(!StorageError::NotFound { key: "k".into() }.is_transient());
    }

    #[test]
    fn test_error_messages() {
        let err = DocflowError::from(ConfigError::Validation {
            message: "worker_count must be > 0".into(),
        });
        assert_eq!(
            err.to_string(),
            "Configuration error: Config validation failed: worker_count must be > 0"
        );
    }
}
