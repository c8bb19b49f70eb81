use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tracing::{error, info, info_span, warn};
use uuid::Uuid;

use crate::error::{QueueError, Result};
use crate::jobs::DocumentJob;
use crate::queue::{
    DocumentPayload, StagePayload, Task, TaskHandler, TaskHeaders, TaskKind, TaskOutcome,
    TaskQueue,
};
use crate::retention::{schedule_retention_sweep, RetentionPolicy, SweepReport};

use super::context::ChainContext;
use super::descriptor::{Stage, PIPELINE};
use super::error::StageError;
use super::executor::{StageDeps, StageExecutor, StageFailure, StageRun};
use super::lifecycle;
use super::stages::UploadSpec;

/// A file handed in for ingestion.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub user_id: String,
    pub filename: String,
    pub content: Vec<u8>,
    pub mime_type: Option<String>,
    pub trace_id: Option<String>,
}

/// Identifiers of an accepted submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub document_id: String,
    pub trace_id: String,
    pub chain_id: String,
    pub task_id: String,
}

/// Result of an in-process walk of the pipeline.
#[derive(Debug, Clone)]
pub struct PipelineRun {
    pub document_id: String,
    pub trace_id: String,
    pub stages: Vec<StageRun>,
}

/// Walks the stage chain and runs queued tasks.
pub struct Orchestrator {
    executor: StageExecutor,
    queue: TaskQueue,
    retention: RetentionPolicy,
}

impl Orchestrator {
    pub fn new(deps: StageDeps, queue: TaskQueue, retention: RetentionPolicy) -> Self {
        Self {
            executor: StageExecutor::new(deps),
            queue,
            retention,
        }
    }

    pub fn deps(&self) -> &StageDeps {
        self.executor.deps()
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    /// Stages the bytes and enqueues the Upload stage of a new chain.
    pub fn submit_upload(&self, request: UploadRequest) -> Result<Submission> {
        if request.filename.trim().is_empty() {
            return Err(StageError::Validation("filename is empty".to_string()).into());
        }
        if request.content.is_empty() {
            return Err(StageError::Validation("file is empty".to_string()).into());
        }

        let document_id = Uuid::new_v4().to_string();
        self.deps().staging.stage(&document_id, &request.content)?;

        let ctx = ChainContext::new(&document_id, &request.user_id, request.trace_id)
            .triggered_by("upload");
        let payload = StagePayload {
            context: ctx.clone(),
            upload: Some(UploadSpec {
                filename: request.filename,
                mime_type: request.mime_type,
            }),
        };
        let task = match self.queue.enqueue(
            TaskKind::RunStage(Stage::Upload),
            &payload,
            TaskHeaders::for_chain(&ctx, None),
        ) {
            Ok(task) => task,
            Err(e) => {
                let _ = self.deps().staging.remove(&document_id);
                return Err(e.into());
            }
        };

        info!(document_id = %document_id, trace_id = %ctx.trace_id, "Upload submitted");
        Ok(Submission {
            document_id,
            trace_id: ctx.trace_id,
            chain_id: ctx.chain_id,
            task_id: task.id,
        })
    }

    /// Enqueues a fresh chain for an existing document. Stages that already
    /// succeeded return their stored output, so only missing work runs.
    pub fn start_pipeline(
        &self,
        document_id: &str,
        user_id: &str,
        trace_id: Option<String>,
    ) -> Result<Submission> {
        let doc = self
            .deps()
            .documents
            .get_by_id(document_id)?
            .filter(|d| d.user_id == user_id)
            .ok_or_else(|| StageError::not_found("document", document_id))?;
        if doc.is_deleted {
            return Err(StageError::BusinessRule(format!("document '{}' is deleted", doc.id)).into());
        }

        let ctx = ChainContext::new(&doc.id, user_id, trace_id).triggered_by("start_pipeline");
        let payload = StagePayload {
            context: ctx.clone(),
            upload: None,
        };
        let task = self.queue.enqueue(
            TaskKind::RunStage(Stage::Upload),
            &payload,
            TaskHeaders::for_chain(&ctx, None),
        )?;

        Ok(Submission {
            document_id: doc.id,
            trace_id: ctx.trace_id,
            chain_id: ctx.chain_id,
            task_id: task.id,
        })
    }

    /// Runs every stage in order in the calling thread, stopping at the first
    /// failure.
    pub fn run_pipeline(
        &self,
        ctx: ChainContext,
        upload: Option<&UploadSpec>,
    ) -> std::result::Result<PipelineRun, StageFailure> {
        let _span = info_span!("pipeline",
            document_id = %ctx.document_id,
            trace_id = %ctx.trace_id,
            chain_id = %ctx.chain_id,
        )
        .entered();

        let trace_id = ctx.trace_id.clone();
        let mut ctx = ctx;
        let mut runs: Vec<StageRun> = Vec::with_capacity(PIPELINE.len());
        for stage in PIPELINE {
            let run = self.executor.run(stage, &ctx, None, upload)?;
            ctx = ctx.advance(&run.document_id, &run.job.id);
            runs.push(run);
        }

        Ok(PipelineRun {
            document_id: ctx.document_id,
            trace_id,
            stages: runs,
        })
    }

    /// Runs one delivered task and decides how the queue should settle it.
    pub fn execute_task(&self, task: &Task) -> TaskOutcome {
        let result = match task.kind {
            TaskKind::RunStage(stage) => return self.execute_stage(task, stage),
            TaskKind::SoftDelete => task
                .payload_as::<DocumentPayload>()
                .map_err(payload_error)
                .and_then(|p| {
                    lifecycle::soft_delete(self.deps(), &p.document_id, task.is_final_attempt())
                }),
            TaskKind::Restore => task
                .payload_as::<DocumentPayload>()
                .map_err(payload_error)
                .and_then(|p| {
                    let version_id = p.version_id.ok_or_else(|| {
                        StageError::Validation("restore requires a version id".to_string())
                    })?;
                    lifecycle::restore(
                        self.deps(),
                        &p.document_id,
                        &version_id,
                        task.is_final_attempt(),
                    )
                }),
            TaskKind::PermanentDelete => task
                .payload_as::<DocumentPayload>()
                .map_err(payload_error)
                .and_then(|p| {
                    lifecycle::permanent_delete(
                        self.deps(),
                        &p.document_id,
                        task.is_final_attempt(),
                    )
                }),
            TaskKind::RetentionSweep => {
                return match self.schedule_retention_sweep() {
                    Ok(report) => TaskOutcome::Succeeded(json!(report)),
                    Err(e) => TaskOutcome::Retry(e.to_string()),
                };
            }
        };

        match result {
            Ok(output) => TaskOutcome::Succeeded(output),
            Err(e) if e.is_retryable() => TaskOutcome::Retry(e.to_string()),
            Err(e) => TaskOutcome::Failed(e.to_string()),
        }
    }

    fn execute_stage(&self, task: &Task, stage: Stage) -> TaskOutcome {
        let payload: StagePayload = match task.payload_as() {
            Ok(p) => p,
            Err(e) => return TaskOutcome::Failed(e.to_string()),
        };

        let run = match self.executor.run(
            stage,
            &payload.context,
            Some(&task.id),
            payload.upload.as_ref(),
        ) {
            Ok(run) => run,
            Err(failure) if failure.should_retry() => return TaskOutcome::Retry(failure.to_string()),
            Err(failure) => {
                warn!(task_id = %task.id, stage = %stage, "Chain stopped: {}", failure);
                return TaskOutcome::Failed(failure.to_string());
            }
        };

        if let Some(next) = stage.next() {
            let ctx = payload.context.advance(&run.document_id, &run.job.id);
            let next_payload = StagePayload {
                context: ctx.clone(),
                upload: None,
            };
            // The stage is recorded as SUCCESS, so a redelivery only re-enqueues.
            if let Err(e) = self.queue.enqueue(
                TaskKind::RunStage(next),
                &next_payload,
                TaskHeaders::for_chain(&ctx, Some(&task.id)),
            ) {
                error!(task_id = %task.id, "Failed to enqueue {}: {}", next, e);
                return TaskOutcome::Retry(e.to_string());
            }
        }

        TaskOutcome::Succeeded(json!({
            "document_id": run.document_id,
            "job_id": run.job.id,
            "stage": stage,
            "cached": run.cached,
        }))
    }

    pub fn soft_delete_document(&self, document_id: &str, trace_id: Option<String>) -> Result<Task> {
        self.enqueue_lifecycle(TaskKind::SoftDelete, document_id, None, trace_id)
    }

    pub fn restore_document(
        &self,
        document_id: &str,
        version_id: &str,
        trace_id: Option<String>,
    ) -> Result<Task> {
        self.enqueue_lifecycle(
            TaskKind::Restore,
            document_id,
            Some(version_id.to_string()),
            trace_id,
        )
    }

    pub fn permanent_delete_document(
        &self,
        document_id: &str,
        trace_id: Option<String>,
    ) -> Result<Task> {
        self.enqueue_lifecycle(TaskKind::PermanentDelete, document_id, None, trace_id)
    }

    fn enqueue_lifecycle(
        &self,
        kind: TaskKind,
        document_id: &str,
        version_id: Option<String>,
        trace_id: Option<String>,
    ) -> Result<Task> {
        let payload = DocumentPayload {
            document_id: document_id.to_string(),
            version_id,
        };
        let headers = TaskHeaders {
            trace_id: Some(trace_id.unwrap_or_else(|| Uuid::new_v4().to_string())),
            chain_id: None,
            parent_task_id: None,
        };
        Ok(self.queue.enqueue(kind, &payload, headers)?)
    }

    pub fn schedule_retention_sweep(&self) -> Result<SweepReport> {
        schedule_retention_sweep(
            self.deps().documents.as_ref(),
            &self.queue,
            &self.retention,
            Utc::now(),
        )
    }

    /// Jobs of a document, newest first, with the total count.
    pub fn jobs_for_document(
        &self,
        document_id: &str,
        limit: u64,
        offset: u64,
    ) -> Result<(Vec<DocumentJob>, u64)> {
        Ok(self.deps().jobs.jobs_for_document(document_id, limit, offset)?)
    }

    /// Every job stamped with `trace_id`, oldest first.
    pub fn jobs_for_trace(&self, trace_id: &str) -> Result<Vec<DocumentJob>> {
        Ok(self.deps().jobs.jobs_for_trace(trace_id)?)
    }

    /// Operator cancellation of a job that has not finished.
    pub fn cancel_job(&self, job_id: &str) -> Result<DocumentJob> {
        Ok(self.deps().jobs.mark_cancelled(job_id)?)
    }

    /// Claims and runs queued tasks in the calling thread until none is
    /// deliverable. Returns how many were processed.
    pub fn drain(&self, worker_id: &str, lease: Duration) -> Result<usize> {
        Ok(self.queue.drain(self, worker_id, lease)?)
    }
}

impl TaskHandler for Orchestrator {
    fn handle(&self, task: &Task) -> TaskOutcome {
        self.execute_task(task)
    }
}

fn payload_error(e: QueueError) -> StageError {
    StageError::Validation(e.to_string())
}

