use std::time::Duration;

use thiserror::Error;

use crate::db::DatabaseError;
use crate::error::{ProcessError, StorageError, VectorError};
use crate::jobs::JobError;

/// How the orchestrator reacts to a stage failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Job goes RETRYING and the task is redelivered after a backoff.
    Retryable,
    /// Job goes FAILURE and the chain stops.
    Terminal,
    /// Job goes TIMEOUT and the chain stops.
    Timeout,
}

/// Errors returned by stage logic and lifecycle operations.
#[derive(Error, Debug)]
pub enum StageError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("{resource} '{id}' not found")]
    NotFound { resource: &'static str, id: String },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Business rule violated: {0}")]
    BusinessRule(String),

    #[error("{service} failed: {message}")]
    ExternalService {
        service: &'static str,
        message: String,
    },

    #[error("Database error: {0}")]
    Database(DatabaseError),

    #[error("Soft deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),
}

impl StageError {
    pub fn class(&self) -> FailureClass {
        match self {
            StageError::ExternalService { .. } | StageError::Database(_) => {
                FailureClass::Retryable
            }
            StageError::DeadlineExceeded(_) => FailureClass::Timeout,
            StageError::Validation(_)
            | StageError::NotFound { .. }
            | StageError::Conflict(_)
            | StageError::BusinessRule(_) => FailureClass::Terminal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class() == FailureClass::Retryable
    }

    pub fn not_found(resource: &'static str, id: impl Into<String>) -> Self {
        StageError::NotFound {
            resource,
            id: id.into(),
        }
    }
}

impl From<DatabaseError> for StageError {
    fn from(e: DatabaseError) -> Self {
        if e.is_constraint_violation() {
            StageError::Conflict(e.to_string())
        } else {
            StageError::Database(e)
        }
    }
}

impl From<StorageError> for StageError {
    fn from(e: StorageError) -> Self {
        if e.is_transient() {
            return StageError::ExternalService {
                service: "object store",
                message: e.to_string(),
            };
        }
        match e {
            StorageError::NotFound { key } => StageError::not_found("object", key),
            StorageError::VersionNotFound { key, version_id } => {
                StageError::not_found("object version", format!("{}@{}", key, version_id))
            }
            StorageError::FileExists(path) => {
                StageError::Conflict(format!("{} already exists", path.display()))
            }
            StorageError::AccessDenied { .. } | StorageError::Manifest { .. } => {
                StageError::BusinessRule(e.to_string())
            }
            other => StageError::Validation(other.to_string()),
        }
    }
}

impl From<ProcessError> for StageError {
    fn from(e: ProcessError) -> Self {
        StageError::Validation(e.to_string())
    }
}

impl From<VectorError> for StageError {
    fn from(e: VectorError) -> Self {
        match e {
            VectorError::Unavailable(message) => StageError::ExternalService {
                service: "vector index",
                message,
            },
            VectorError::Rejected(message) => StageError::Validation(message),
        }
    }
}

impl From<JobError> for StageError {
    fn from(e: JobError) -> Self {
        match e {
            JobError::NotFound(id) => StageError::not_found("job", id),
            JobError::Database(db) => db.into(),
            other @ (JobError::NotRetryable { .. }
            | JobError::InvalidTransition { .. }
            | JobError::AlreadyRunning { .. }) => StageError::Conflict(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for StageError {
    fn from(e: serde_json::Error) -> Self {
        StageError::Validation(format!("malformed stage data: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{JobStatus, JobType};

    fn busy() -> DatabaseError {
        DatabaseError::Sqlite(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        ))
    }

    #[test]
    fn test_database_errors() {
        assert_eq!(StageError::from(busy()).class(), FailureClass::Retryable);

        let unique = DatabaseError::Sqlite(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE),
            None,
        ));
        assert!(matches!(StageError::from(unique), StageError::Conflict(_)));
    }

    #[test]
    fn test_storage_errors() {
        let transient = StageError::from(StorageError::Unavailable("reset".into()));
        assert!(transient.is_retryable());

        let missing = StageError::from(StorageError::NotFound { key: "k".into() });
        assert_eq!(missing.class(), FailureClass::Terminal);

        let denied = StageError::from(StorageError::AccessDenied { key: "k".into() });
        assert_eq!(denied.class(), FailureClass::Terminal);

        let rejected = StageError::from(StorageError::RestoreRejected {
            key: "k".into(),
            reason: "stale".into(),
        });
        assert!(matches!(rejected, StageError::Validation(_)));
    }

    #[test]
    fn test_job_errors_are_conflicts() {
        let err = StageError::from(JobError::AlreadyRunning {
            document_id: "d".into(),
            job_type: JobType::ChunkText,
        });
        assert!(matches!(err, StageError::Conflict(_)));

        let err = StageError::from(JobError::NotRetryable {
            job_id: "j".into(),
            status: JobStatus::Running,
        });
        assert_eq!(err.class(), FailureClass::Terminal);
        assert!(StageError::from(JobError::Database(busy())).is_retryable());
    }

    #[test]
    fn test_deadline_and_vector_errors() {
        assert_eq!(
            StageError::DeadlineExceeded(Duration::from_secs(1)).class(),
            FailureClass::Timeout
        );
        assert!(StageError::from(VectorError::Unavailable("down".into())).is_retryable());
        assert!(!StageError::from(VectorError::Rejected("dims".into())).is_retryable());
        assert!(!StageError::from(ProcessError::EmptyText).is_retryable());
    }
}
