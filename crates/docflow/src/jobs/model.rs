//! Job status, job type and the `DocumentJob` record.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::db::job_repo::JobRow;
use crate::db::{parse_optional_timestamp, parse_timestamp, DatabaseError};

/// Longest error string stored on a job or document.
pub const MAX_ERROR_LEN: usize = 500;

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Running,
    Success,
    Failure,
    Retrying,
    Timeout,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Running => "RUNNING",
            JobStatus::Success => "SUCCESS",
            JobStatus::Failure => "FAILURE",
            JobStatus::Retrying => "RETRYING",
            JobStatus::Timeout => "TIMEOUT",
            JobStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn from_db(s: &str) -> Result<Self, DatabaseError> {
        match s {
            "PENDING" => Ok(JobStatus::Pending),
            "RUNNING" => Ok(JobStatus::Running),
            "SUCCESS" => Ok(JobStatus::Success),
            "FAILURE" => Ok(JobStatus::Failure),
            "RETRYING" => Ok(JobStatus::Retrying),
            "TIMEOUT" => Ok(JobStatus::Timeout),
            "CANCELLED" => Ok(JobStatus::Cancelled),
            other => Err(DatabaseError::UnknownValue {
                kind: "job status",
                value: other.to_string(),
            }),
        }
    }

    /// Terminal rows are never mutated again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Success | JobStatus::Failure | JobStatus::Timeout | JobStatus::Cancelled
        )
    }

    /// Terminal without success: a later attempt gets a fresh row.
    pub fn is_failed_terminal(&self) -> bool {
        self.is_terminal() && *self != JobStatus::Success
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of work a job tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobType {
    UploadDocument,
    ValidateFile,
    ExtractText,
    ChunkText,
    EmbedChunks,
    ParsePdf,
    Ocr,
    ClassifyContent,
    GeneratePreview,
    ConvertToWeb,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::UploadDocument => "UPLOAD_DOCUMENT",
            JobType::ValidateFile => "VALIDATE_FILE",
            JobType::ExtractText => "EXTRACT_TEXT",
            JobType::ChunkText => "CHUNK_TEXT",
            JobType::EmbedChunks => "EMBED_CHUNKS",
            JobType::ParsePdf => "PARSE_PDF",
            JobType::Ocr => "OCR",
            JobType::ClassifyContent => "CLASSIFY_CONTENT",
            JobType::GeneratePreview => "GENERATE_PREVIEW",
            JobType::ConvertToWeb => "CONVERT_TO_WEB",
        }
    }

    pub fn from_db(s: &str) -> Result<Self, DatabaseError> {
        match s {
            "UPLOAD_DOCUMENT" => Ok(JobType::UploadDocument),
            "VALIDATE_FILE" => Ok(JobType::ValidateFile),
            "EXTRACT_TEXT" => Ok(JobType::ExtractText),
            "CHUNK_TEXT" => Ok(JobType::ChunkText),
            "EMBED_CHUNKS" => Ok(JobType::EmbedChunks),
            "PARSE_PDF" => Ok(JobType::ParsePdf),
            "OCR" => Ok(JobType::Ocr),
            "CLASSIFY_CONTENT" => Ok(JobType::ClassifyContent),
            "GENERATE_PREVIEW" => Ok(JobType::GeneratePreview),
            "CONVERT_TO_WEB" => Ok(JobType::ConvertToWeb),
            other => Err(DatabaseError::UnknownValue {
                kind: "job type",
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Correlation fields stamped on a job when it is created.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobContext {
    pub user_id: String,
    pub trace_id: Option<String>,
    pub task_id: Option<String>,
    pub chain_id: Option<String>,
    pub stage_order: u32,
    pub parent_job_id: Option<String>,
    pub triggered_by: Option<String>,
    pub input_data: Option<Value>,
}

/// A persisted record of one stage's execution for one document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentJob {
    pub id: String,
    pub document_id: String,
    pub user_id: String,
    pub job_type: JobType,
    pub status: JobStatus,
    pub trace_id: Option<String>,
    pub task_id: Option<String>,
    pub chain_id: Option<String>,
    pub stage_order: u32,
    pub parent_job_id: Option<String>,
    pub retry_of_job_id: Option<String>,
    pub attempt_count: u32,
    pub max_retries: u32,
    pub timeout_secs: u64,
    pub triggered_by: Option<String>,
    pub is_idempotent: bool,
    pub input_data: Option<Value>,
    pub output_data: Option<Value>,
    pub error_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DocumentJob {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether a transient failure of this job would leave it RETRYING rather
    /// than FAILURE: it is in flight and its retry budget is not spent.
    pub fn is_retryable(&self) -> bool {
        matches!(self.status, JobStatus::Running | JobStatus::Retrying)
            && self.attempt_count < self.max_retries
    }

    /// An in-flight job that outlived its timeout. RUNNING counts from its
    /// start; PENDING counts from creation, since its worker never started it.
    pub fn is_timed_out(&self, now: DateTime<Utc>) -> bool {
        let since = match self.status {
            JobStatus::Running => self.started_at,
            JobStatus::Pending => Some(self.created_at),
            _ => None,
        };
        since.is_some_and(|t| now - t > Duration::seconds(self.timeout_secs as i64))
    }

    pub fn retries_remaining(&self) -> u32 {
        self.max_retries.saturating_sub(self.attempt_count)
    }
}

impl TryFrom<JobRow> for DocumentJob {
    type Error = DatabaseError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(Self {
            job_type: JobType::from_db(&row.job_type)?,
            status: JobStatus::from_db(&row.status)?,
            input_data: row
                .input_data
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            output_data: row
                .output_data
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            started_at: parse_optional_timestamp(row.started_at)?,
            finished_at: parse_optional_timestamp(row.finished_at)?,
            created_at: parse_timestamp(&row.created_at)?,
            updated_at: parse_timestamp(&row.updated_at)?,
            id: row.id,
            document_id: row.document_id,
            user_id: row.user_id,
            trace_id: row.trace_id,
            task_id: row.task_id,
            chain_id: row.chain_id,
            stage_order: row.stage_order,
            parent_job_id: row.parent_job_id,
            retry_of_job_id: row.retry_of_job_id,
            attempt_count: row.attempt_count,
            max_retries: row.max_retries,
            timeout_secs: row.timeout_secs,
            triggered_by: row.triggered_by,
            is_idempotent: row.is_idempotent,
            error_message: row.error_message,
        })
    }
}

/// Cuts an error string to `MAX_ERROR_LEN` characters.
pub fn truncate_error(message: &str) -> String {
    match message.char_indices().nth(MAX_ERROR_LEN) {
        Some((idx, _)) => message[..idx].to_string(),
        None => message.to_string(),
    }
}
