use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, info_span, warn};

use crate::config::Config;
use crate::db::Database;
use crate::documents::{DocumentStore, SqliteDocumentStore};
use crate::jobs::{DocumentJob, JobClaim, JobContext, JobDefaults, JobError, JobStatus, JobStore};
use crate::processing::{
    Chunker, ExtractorRegistry, HashingVectorIndex, ParagraphChunker, TextExtractor, VectorIndex,
};
use crate::storage::{FsObjectStore, ObjectStore, StagingArea, UrlSigner};

use super::context::ChainContext;
use super::descriptor::Stage;
use super::error::{FailureClass, StageError};
use super::stages::{self, Deadline, UploadSpec};

/// Shared handles every stage and lifecycle operation works against.
#[derive(Clone)]
pub struct StageDeps {
    pub db: Database,
    pub jobs: JobStore,
    pub documents: Arc<dyn DocumentStore>,
    pub objects: Arc<dyn ObjectStore>,
    pub staging: StagingArea,
    pub extractor: Arc<dyn TextExtractor>,
    pub chunker: Arc<dyn Chunker>,
    pub vectors: Arc<dyn VectorIndex>,
    pub soft_deadline: Duration,
}

impl StageDeps {
    /// Production wiring: filesystem object store, local extraction, chunking
    /// and vector index, all built from config.
    pub fn from_config(config: &Config, db: Database) -> Self {
        let storage = &config.storage;
        let pipeline = &config.pipeline;
        let signer = UrlSigner::new(storage.presign_secret.as_bytes(), &storage.public_base_url);
        let objects = FsObjectStore::new(&storage.root, signer, storage.max_object_bytes);

        Self {
            jobs: JobStore::new(
                db.clone(),
                JobDefaults {
                    max_retries: pipeline.max_retries,
                    timeout_secs: pipeline.job_timeout_secs,
                },
            ),
            documents: Arc::new(SqliteDocumentStore::new(db.clone())),
            objects: Arc::new(objects),
            staging: StagingArea::new(storage.root.join("staging")),
            extractor: Arc::new(ExtractorRegistry::new(pipeline.max_text_bytes)),
            chunker: Arc::new(ParagraphChunker::new(
                pipeline.chunk_size,
                pipeline.chunk_overlap,
                pipeline.min_chunk_size,
            )),
            vectors: Arc::new(HashingVectorIndex::default()),
            soft_deadline: Duration::from_secs(pipeline.soft_deadline_secs),
            db,
        }
    }
}

/// A finished stage.
#[derive(Debug, Clone)]
pub struct StageRun {
    /// The document the stage ran for. Differs from the submitted id when an
    /// upload was recognised as a duplicate.
    pub document_id: String,
    pub job: DocumentJob,
    pub output: Value,
    /// Output came from an earlier SUCCESS job; no work was done.
    pub cached: bool,
}

/// A failed stage, with the job as it was left.
#[derive(Error, Debug)]
#[error("{error}")]
pub struct StageFailure {
    pub job: Option<DocumentJob>,
    pub error: StageError,
}

impl StageFailure {
    fn without_job(error: StageError) -> Self {
        Self { job: None, error }
    }

    /// Whether the task should be redelivered. A job that was settled decides;
    /// otherwise the error class does.
    pub fn should_retry(&self) -> bool {
        match &self.job {
            Some(job) => job.status == JobStatus::Retrying,
            None => self.error.is_retryable(),
        }
    }
}

/// Runs one stage under the job state machine.
pub struct StageExecutor {
    deps: StageDeps,
}

impl StageExecutor {
    pub fn new(deps: StageDeps) -> Self {
        Self { deps }
    }

    pub fn deps(&self) -> &StageDeps {
        &self.deps
    }

    pub fn run(
        &self,
        stage: Stage,
        ctx: &ChainContext,
        task_id: Option<&str>,
        upload: Option<&UploadSpec>,
    ) -> Result<StageRun, StageFailure> {
        let _span = info_span!("stage",
            stage = %stage,
            document_id = %ctx.document_id,
            trace_id = %ctx.trace_id,
        )
        .entered();

        let document_id = if stage == Stage::Upload {
            stages::prepare_upload(&self.deps, ctx, upload).map_err(StageFailure::without_job)?
        } else {
            ctx.document_id.clone()
        };

        let input = upload.map(serde_json::to_value).transpose().ok().flatten();
        let job_ctx = ctx.job_context(task_id, input);
        let job = match self.claim(&document_id, stage, &job_ctx, task_id)? {
            Claimed::Cached(job) => {
                debug!(job_id = %job.id, "Stage already succeeded, reusing output");
                if stage == Stage::Upload {
                    self.discard_staged(&ctx.document_id);
                }
                return Ok(StageRun {
                    document_id,
                    output: job.output_data.clone().unwrap_or(Value::Null),
                    job,
                    cached: true,
                });
            }
            Claimed::Ready(job) => job,
        };

        let job = match self.deps.jobs.mark_running(&job.id) {
            Ok(job) => job,
            Err(e @ JobError::AlreadyRunning { .. }) => {
                // The losing row would otherwise stay PENDING and block later claims.
                let settled = self.deps.jobs.mark_failure(&job.id, &e.to_string()).ok();
                warn!(job_id = %job.id, "Duplicate attempt lost the race: {}", e);
                return Err(StageFailure {
                    job: settled,
                    error: e.into(),
                });
            }
            Err(e) => return Err(StageFailure::without_job(e.into())),
        };

        info!(job_id = %job.id, attempt = job.attempt_count + 1, "Running stage");
        let deadline = Deadline::start(self.deps.soft_deadline);
        let result = match stage {
            Stage::Upload => stages::upload(&self.deps, ctx, &document_id, &deadline),
            Stage::ExtractText => stages::extract_text(&self.deps, &document_id, &deadline),
            Stage::ChunkText => stages::chunk_text(&self.deps, &document_id, &deadline),
            Stage::EmbedChunks => stages::embed_chunks(&self.deps, &document_id, &deadline),
        };

        match result {
            Ok(output) => {
                let job = self
                    .deps
                    .jobs
                    .mark_success(&job.id, &output)
                    .map_err(|e| StageFailure::without_job(e.into()))?;
                if stage == Stage::Upload {
                    self.discard_staged(&ctx.document_id);
                }
                info!(job_id = %job.id, "Stage succeeded");
                Ok(StageRun {
                    document_id,
                    job,
                    output,
                    cached: false,
                })
            }
            Err(error) => Err(self.settle(&job, error)),
        }
    }

    fn claim(
        &self,
        document_id: &str,
        stage: Stage,
        job_ctx: &JobContext,
        task_id: Option<&str>,
    ) -> Result<Claimed, StageFailure> {
        match self
            .deps
            .jobs
            .find_or_create(document_id, stage.job_type(), job_ctx)
        {
            Ok(JobClaim::Succeeded(job)) => Ok(Claimed::Cached(job)),
            Ok(JobClaim::Ready(job)) => Ok(Claimed::Ready(job)),
            // A redelivered task finds the PENDING job it created before crashing.
            Err(JobError::NotRetryable {
                job_id,
                status: JobStatus::Pending,
            }) if task_id.is_some() => {
                let job = self
                    .deps
                    .jobs
                    .get(&job_id)
                    .map_err(|e| StageFailure::without_job(e.into()))?
                    .filter(|job| job.task_id.as_deref() == task_id)
                    .ok_or_else(|| {
                        StageFailure::without_job(StageError::Conflict(format!(
                            "job '{}' is pending for another task",
                            job_id
                        )))
                    })?;
                Ok(Claimed::Ready(job))
            }
            Err(e) => Err(StageFailure::without_job(e.into())),
        }
    }

    /// Moves the job to the status matching the error class.
    fn settle(&self, job: &DocumentJob, error: StageError) -> StageFailure {
        let message = error.to_string();
        let settled = match error.class() {
            FailureClass::Retryable => self.deps.jobs.mark_retrying(&job.id, &message),
            FailureClass::Terminal => self.deps.jobs.mark_failure(&job.id, &message),
            FailureClass::Timeout => self.deps.jobs.mark_timeout(&job.id, &message),
        };

        match settled {
            Ok(job) => {
                warn!(job_id = %job.id, status = %job.status, "Stage failed: {}", message);
                StageFailure {
                    job: Some(job),
                    error,
                }
            }
            Err(e) => {
                warn!(job_id = %job.id, "Could not record stage failure ({}): {}", e, message);
                StageFailure::without_job(error)
            }
        }
    }

    fn discard_staged(&self, staged_id: &str) {
        if let Err(e) = self.deps.staging.remove(staged_id) {
            warn!("Failed to remove staged upload {}: {}", staged_id, e);
        }
    }
}

enum Claimed {
    Cached(DocumentJob),
    Ready(DocumentJob),
}
