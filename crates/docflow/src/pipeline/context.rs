use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::jobs::JobContext;

/// Identifiers carried from one stage to the next. Stages re-read their
/// inputs from the stores; nothing else travels with the task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainContext {
    pub document_id: String,
    pub user_id: String,
    pub trace_id: String,
    pub chain_id: String,
    #[serde(default)]
    pub parent_job_id: Option<String>,
    #[serde(default)]
    pub stage_order: u32,
    #[serde(default)]
    pub triggered_by: Option<String>,
}

impl ChainContext {
    /// Starts a new chain. A missing trace id gets a fresh one.
    pub fn new(
        document_id: impl Into<String>,
        user_id: impl Into<String>,
        trace_id: Option<String>,
    ) -> Self {
        Self {
            document_id: document_id.into(),
            user_id: user_id.into(),
            trace_id: trace_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            chain_id: Uuid::new_v4().to_string(),
            parent_job_id: None,
            stage_order: 0,
            triggered_by: None,
        }
    }

    pub fn triggered_by(mut self, source: impl Into<String>) -> Self {
        self.triggered_by = Some(source.into());
        self
    }

    /// Context for the stage after the one that produced `job_id`.
    pub fn advance(&self, document_id: &str, job_id: &str) -> Self {
        Self {
            document_id: document_id.to_string(),
            parent_job_id: Some(job_id.to_string()),
            stage_order: self.stage_order + 1,
            ..self.clone()
        }
    }

    pub fn job_context(&self, task_id: Option<&str>, input: Option<serde_json::Value>) -> JobContext {
        JobContext {
            user_id: self.user_id.clone(),
            trace_id: Some(self.trace_id.clone()),
            task_id: task_id.map(str::to_string),
            chain_id: Some(self.chain_id.clone()),
            stage_order: self.stage_order,
            parent_job_id: self.parent_job_id.clone(),
            triggered_by: self.triggered_by.clone(),
            input_data: input,
        }
    }
}
