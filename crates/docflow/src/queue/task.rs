use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::db::task_repo::TaskRow;
use crate::db::{parse_optional_timestamp, parse_timestamp, DatabaseError};
use crate::error::QueueError;
use crate::pipeline::{ChainContext, Stage, UploadSpec};

/// What a task asks a worker to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    RunStage(Stage),
    SoftDelete,
    Restore,
    PermanentDelete,
    RetentionSweep,
}

impl TaskKind {
    pub fn name(&self) -> String {
        match self {
            TaskKind::RunStage(stage) => format!("run_stage:{}", stage),
            TaskKind::SoftDelete => "soft_delete".to_string(),
            TaskKind::Restore => "restore".to_string(),
            TaskKind::PermanentDelete => "permanent_delete".to_string(),
            TaskKind::RetentionSweep => "retention_sweep".to_string(),
        }
    }

    pub fn parse(name: &str) -> Result<Self, QueueError> {
        if let Some(stage) = name.strip_prefix("run_stage:") {
            return Stage::from_name(stage)
                .map(TaskKind::RunStage)
                .ok_or_else(|| QueueError::UnknownKind(name.to_string()));
        }
        match name {
            "soft_delete" => Ok(TaskKind::SoftDelete),
            "restore" => Ok(TaskKind::Restore),
            "permanent_delete" => Ok(TaskKind::PermanentDelete),
            "retention_sweep" => Ok(TaskKind::RetentionSweep),
            other => Err(QueueError::UnknownKind(other.to_string())),
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Revoked,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "QUEUED",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Succeeded => "SUCCEEDED",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Revoked => "REVOKED",
        }
    }

    pub fn from_db(s: &str) -> Result<Self, DatabaseError> {
        match s {
            "QUEUED" => Ok(TaskStatus::Queued),
            "RUNNING" => Ok(TaskStatus::Running),
            "SUCCEEDED" => Ok(TaskStatus::Succeeded),
            "FAILED" => Ok(TaskStatus::Failed),
            "REVOKED" => Ok(TaskStatus::Revoked),
            other => Err(DatabaseError::UnknownValue {
                kind: "task status",
                value: other.to_string(),
            }),
        }
    }

    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Revoked
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Correlation headers carried by every task.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskHeaders {
    pub trace_id: Option<String>,
    pub chain_id: Option<String>,
    pub parent_task_id: Option<String>,
}

impl TaskHeaders {
    pub fn for_chain(ctx: &ChainContext, parent_task_id: Option<&str>) -> Self {
        Self {
            trace_id: Some(ctx.trace_id.clone()),
            chain_id: Some(ctx.chain_id.clone()),
            parent_task_id: parent_task_id.map(str::to_string),
        }
    }
}

/// Payload of a `RunStage` task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagePayload {
    pub context: ChainContext,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload: Option<UploadSpec>,
}

/// Payload of the document lifecycle tasks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentPayload {
    pub document_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    pub id: String,
    pub kind: TaskKind,
    pub payload: Value,
    pub headers: TaskHeaders,
    pub status: TaskStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub available_at: DateTime<Utc>,
    pub leased_until: Option<DateTime<Utc>>,
    pub worker_id: Option<String>,
    pub last_error: Option<String>,
    pub result: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// The current delivery is the last one the queue will make.
    pub fn is_final_attempt(&self) -> bool {
        self.attempts >= self.max_attempts
    }

    pub fn payload_as<T: serde::de::DeserializeOwned>(&self) -> Result<T, QueueError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

impl TryFrom<TaskRow> for Task {
    type Error = QueueError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        Ok(Self {
            kind: TaskKind::parse(&row.kind)?,
            payload: serde_json::from_str(&row.payload)?,
            headers: TaskHeaders {
                trace_id: row.trace_id,
                chain_id: row.chain_id,
                parent_task_id: row.parent_task_id,
            },
            status: TaskStatus::from_db(&row.status)?,
            attempts: row.attempts,
            max_attempts: row.max_attempts,
            available_at: parse_timestamp(&row.available_at)?,
            leased_until: parse_optional_timestamp(row.leased_until)?,
            worker_id: row.worker_id,
            last_error: row.last_error,
            result: row.result.as_deref().map(serde_json::from_str).transpose()?,
            created_at: parse_timestamp(&row.created_at)?,
            updated_at: parse_timestamp(&row.updated_at)?,
            id: row.id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names() {
        let kinds = [
            TaskKind::RunStage(Stage::ChunkText),
            TaskKind::SoftDelete,
            TaskKind::Restore,
            TaskKind::PermanentDelete,
            TaskKind::RetentionSweep,
        ];
        for kind in kinds {
            assert_eq!(TaskKind::parse(&kind.name()).unwrap(), kind);
        }
        assert_eq!(
            TaskKind::RunStage(Stage::EmbedChunks).name(),
            "run_stage:embed_chunks"
        );
        assert!(matches!(
            TaskKind::parse("run_stage:ocr"),
            Err(QueueError::UnknownKind(_))
        ));
        assert!(TaskKind::parse("reindex").is_err());
    }

    #[test]
    fn test_document_payload_omits_missing_version() {
        let payload = DocumentPayload {
            document_id: "d".into(),
            version_id: None,
        };
        assert_eq!(
            serde_json::to_string(&payload).unwrap(),
            r#"{"document_id":"d"}"#
        );
    }
}
