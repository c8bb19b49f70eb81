//! Job store: atomic state transitions for `DocumentJob` records.
//!
//! Every transition is a single conditional UPDATE on the `status` column.
//! The "one RUNNING job per (document, type)" rule is a partial unique
//! index, so a losing racer sees a constraint violation, not a silent
//! overwrite.

use chrono::Utc;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::db::job_repo::{self, JobRow, RetryRecord, StatusChange};
use crate::db::{format_timestamp, Database, DatabaseError};

use super::model::{truncate_error, DocumentJob, JobContext, JobStatus, JobType};

#[derive(Error, Debug)]
pub enum JobError {
    #[error("Job '{0}' not found")]
    NotFound(String),

    #[error("Job '{job_id}' is {status} and not in a retryable state")]
    NotRetryable { job_id: String, status: JobStatus },

    #[error("Job '{job_id}' cannot move to {to}: it is no longer {expected}")]
    InvalidTransition {
        job_id: String,
        to: JobStatus,
        expected: String,
    },

    #[error("Another {job_type} job is already running for document '{document_id}'")]
    AlreadyRunning {
        document_id: String,
        job_type: JobType,
    },

    #[error("Job database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Result of `find_or_create`.
#[derive(Debug, Clone, PartialEq)]
pub enum JobClaim {
    /// The latest job of this type already succeeded; reuse its output.
    Succeeded(DocumentJob),
    /// A PENDING or RETRYING job ready for `mark_running`.
    Ready(DocumentJob),
}

/// Defaults applied to newly created jobs.
#[derive(Debug, Clone, Copy)]
pub struct JobDefaults {
    pub max_retries: u32,
    pub timeout_secs: u64,
}

impl Default for JobDefaults {
    fn default() -> Self {
        Self {
            max_retries: 3,
            timeout_secs: 600,
        }
    }
}

#[derive(Clone)]
pub struct JobStore {
    db: Database,
    defaults: JobDefaults,
}

impl JobStore {
    pub fn new(db: Database, defaults: JobDefaults) -> Self {
        Self { db, defaults }
    }

    /// Looks up the latest job of `job_type` for the document and decides
    /// whether the caller may run it.
    ///
    /// - none: a new PENDING job
    /// - SUCCESS: [`JobClaim::Succeeded`], nothing is created
    /// - FAILURE / TIMEOUT / CANCELLED: a new PENDING job with `retry_of_job_id`
    /// - RETRYING: the same job, stamped with the caller's task id
    /// - RUNNING past its timeout: marked TIMEOUT, then superseded
    /// - RUNNING or PENDING otherwise: [`JobError::NotRetryable`]
    pub fn find_or_create(
        &self,
        document_id: &str,
        job_type: JobType,
        ctx: &JobContext,
    ) -> Result<JobClaim, JobError> {
        let now = Utc::now();
        let now_str = format_timestamp(now);
        let defaults = self.defaults;

        let row = self.db.with_conn(|conn| {
            let latest = job_repo::find_latest_with(conn, document_id, job_type.as_str())?;

            let latest = match latest {
                Some(row) => Some(DocumentJob::try_from(row)?),
                None => None,
            };

            let retry_of = match latest {
                None => None,
                Some(job) if job.status == JobStatus::Success => {
                    return Ok(ClaimRow::Succeeded(job));
                }
                Some(job) if job.status == JobStatus::Retrying => {
                    job_repo::compare_and_set_status_with(
                        conn,
                        &job.id,
                        &[JobStatus::Retrying.as_str()],
                        JobStatus::Retrying.as_str(),
                        &StatusChange {
                            task_id: ctx.task_id.clone(),
                            ..Default::default()
                        },
                        &now_str,
                    )?;
                    return Ok(ClaimRow::Reused(job.id));
                }
                Some(job) if job.status.is_failed_terminal() => Some(job.id),
                Some(job) if job.is_timed_out(now) => {
                    let reason = if job.status == JobStatus::Pending {
                        "job was never started within its timeout"
                    } else {
                        "job exceeded its timeout"
                    };
                    let timed_out = job_repo::compare_and_set_status_with(
                        conn,
                        &job.id,
                        &[job.status.as_str()],
                        JobStatus::Timeout.as_str(),
                        &StatusChange {
                            finished_at: Some(now_str.clone()),
                            error_message: Some(reason.to_string()),
                            ..Default::default()
                        },
                        &now_str,
                    )?;
                    if !timed_out {
                        return Ok(ClaimRow::Blocked(job.id, job.status));
                    }
                    log::warn!(
                        "Job {} ({}) for document {} timed out; superseding",
                        job.id,
                        job_type,
                        document_id
                    );
                    Some(job.id)
                }
                Some(job) => return Ok(ClaimRow::Blocked(job.id, job.status)),
            };

            let new_row = JobRow {
                id: Uuid::new_v4().to_string(),
                document_id: document_id.to_string(),
                user_id: ctx.user_id.clone(),
                job_type: job_type.as_str().to_string(),
                status: JobStatus::Pending.as_str().to_string(),
                trace_id: ctx.trace_id.clone(),
                task_id: ctx.task_id.clone(),
                chain_id: ctx.chain_id.clone(),
                stage_order: ctx.stage_order,
                parent_job_id: ctx.parent_job_id.clone(),
                retry_of_job_id: retry_of,
                attempt_count: 0,
                max_retries: defaults.max_retries,
                timeout_secs: defaults.timeout_secs,
                triggered_by: ctx.triggered_by.clone(),
                is_idempotent: true,
                input_data: ctx
                    .input_data
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                output_data: None,
                error_message: None,
                started_at: None,
                finished_at: None,
                created_at: now_str.clone(),
                updated_at: now_str.clone(),
            };
            job_repo::insert_with(conn, &new_row)?;
            Ok(ClaimRow::Created(new_row))
        })?;

        match row {
            ClaimRow::Succeeded(job) => Ok(JobClaim::Succeeded(job)),
            ClaimRow::Created(row) => Ok(JobClaim::Ready(DocumentJob::try_from(row)?)),
            ClaimRow::Reused(id) => Ok(JobClaim::Ready(self.require(&id)?)),
            ClaimRow::Blocked(job_id, status) => Err(JobError::NotRetryable { job_id, status }),
        }
    }

    /// PENDING | RETRYING → RUNNING, stamping `started_at`.
    pub fn mark_running(&self, job_id: &str) -> Result<DocumentJob, JobError> {
        let now = format_timestamp(Utc::now());
        let change = StatusChange {
            started_at: Some(now.clone()),
            ..Default::default()
        };
        let moved = job_repo::compare_and_set_status(
            &self.db,
            job_id,
            &[JobStatus::Pending.as_str(), JobStatus::Retrying.as_str()],
            JobStatus::Running.as_str(),
            &change,
            &now,
        );

        match moved {
            Ok(true) => self.require(job_id),
            Ok(false) => Err(self.invalid_transition(job_id, JobStatus::Running, "PENDING or RETRYING")),
            Err(e) if e.is_constraint_violation() => {
                let job = self.require(job_id)?;
                Err(JobError::AlreadyRunning {
                    document_id: job.document_id,
                    job_type: job.job_type,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// RUNNING → SUCCESS with the stage output.
    pub fn mark_success(&self, job_id: &str, output: &Value) -> Result<DocumentJob, JobError> {
        let now = format_timestamp(Utc::now());
        let change = StatusChange {
            finished_at: Some(now.clone()),
            output_data: Some(serde_json::to_string(output).map_err(DatabaseError::from)?),
            ..Default::default()
        };
        self.transition(job_id, &[JobStatus::Running], JobStatus::Success, change, &now)
    }

    /// Any non-terminal status → FAILURE.
    pub fn mark_failure(&self, job_id: &str, error: &str) -> Result<DocumentJob, JobError> {
        let now = format_timestamp(Utc::now());
        let change = StatusChange {
            finished_at: Some(now.clone()),
            error_message: Some(truncate_error(error)),
            ..Default::default()
        };
        self.transition(
            job_id,
            &[JobStatus::Pending, JobStatus::Running, JobStatus::Retrying],
            JobStatus::Failure,
            change,
            &now,
        )
    }

    /// RUNNING → RETRYING, incrementing the attempt count. When the retry
    /// budget is already spent the job becomes FAILURE instead; the returned
    /// job tells the caller which one happened.
    pub fn mark_retrying(&self, job_id: &str, error: &str) -> Result<DocumentJob, JobError> {
        let now = format_timestamp(Utc::now());
        match job_repo::record_retry(&self.db, job_id, &truncate_error(error), &now)? {
            RetryRecord::Retrying | RetryRecord::Exhausted => self.require(job_id),
            RetryRecord::NotRunning => {
                Err(self.invalid_transition(job_id, JobStatus::Retrying, "RUNNING"))
            }
        }
    }

    /// RUNNING → TIMEOUT.
    pub fn mark_timeout(&self, job_id: &str, error: &str) -> Result<DocumentJob, JobError> {
        let now = format_timestamp(Utc::now());
        let change = StatusChange {
            finished_at: Some(now.clone()),
            error_message: Some(truncate_error(error)),
            ..Default::default()
        };
        self.transition(job_id, &[JobStatus::Running], JobStatus::Timeout, change, &now)
    }

    /// Any non-terminal status → CANCELLED (operator action).
    pub fn mark_cancelled(&self, job_id: &str) -> Result<DocumentJob, JobError> {
        let now = format_timestamp(Utc::now());
        let change = StatusChange {
            finished_at: Some(now.clone()),
            error_message: Some("cancelled".to_string()),
            ..Default::default()
        };
        self.transition(
            job_id,
            &[JobStatus::Pending, JobStatus::Running, JobStatus::Retrying],
            JobStatus::Cancelled,
            change,
            &now,
        )
    }

    pub fn get(&self, job_id: &str) -> Result<Option<DocumentJob>, JobError> {
        job_repo::find_by_id(&self.db, job_id)?
            .map(DocumentJob::try_from)
            .transpose()
            .map_err(JobError::from)
    }

    pub fn latest(
        &self,
        document_id: &str,
        job_type: JobType,
    ) -> Result<Option<DocumentJob>, JobError> {
        job_repo::find_latest(&self.db, document_id, job_type.as_str())?
            .map(DocumentJob::try_from)
            .transpose()
            .map_err(JobError::from)
    }

    /// The newest SUCCESS job of a type; stages read their input from it.
    pub fn latest_successful(
        &self,
        document_id: &str,
        job_type: JobType,
    ) -> Result<Option<DocumentJob>, JobError> {
        job_repo::find_latest_with_status(
            &self.db,
            document_id,
            job_type.as_str(),
            JobStatus::Success.as_str(),
        )?
        .map(DocumentJob::try_from)
        .transpose()
        .map_err(JobError::from)
    }

    /// A document's jobs, newest first, with the total count.
    pub fn jobs_for_document(
        &self,
        document_id: &str,
        limit: u64,
        offset: u64,
    ) -> Result<(Vec<DocumentJob>, u64), JobError> {
        let (rows, total) = job_repo::list_by_document(&self.db, document_id, limit, offset)?;
        let jobs = rows
            .into_iter()
            .map(DocumentJob::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        Ok((jobs, total))
    }

    /// Every job of a trace in execution order, across chains.
    pub fn jobs_for_trace(&self, trace_id: &str) -> Result<Vec<DocumentJob>, JobError> {
        job_repo::list_by_trace(&self.db, trace_id)?
            .into_iter()
            .map(DocumentJob::try_from)
            .collect::<Result<Vec<_>, _>>()
            .map_err(JobError::from)
    }

    pub fn delete_for_document(&self, document_id: &str) -> Result<usize, JobError> {
        Ok(job_repo::delete_by_document(&self.db, document_id)?)
    }

    pub fn has_active_jobs(&self, document_id: &str) -> Result<bool, JobError> {
        Ok(job_repo::count_active_for_document(&self.db, document_id)? > 0)
    }

    fn transition(
        &self,
        job_id: &str,
        from: &[JobStatus],
        to: JobStatus,
        change: StatusChange,
        now: &str,
    ) -> Result<DocumentJob, JobError> {
        let from_strs: Vec<&str> = from.iter().map(|s| s.as_str()).collect();
        if job_repo::compare_and_set_status(&self.db, job_id, &from_strs, to.as_str(), &change, now)?
        {
            self.require(job_id)
        } else {
            Err(self.invalid_transition(job_id, to, &from_strs.join(" or ")))
        }
    }

    fn require(&self, job_id: &str) -> Result<DocumentJob, JobError> {
        self.get(job_id)?
            .ok_or_else(|| JobError::NotFound(job_id.to_string()))
    }

    fn invalid_transition(&self, job_id: &str, to: JobStatus, expected: &str) -> JobError {
        match self.get(job_id) {
            Ok(Some(_)) => JobError::InvalidTransition {
                job_id: job_id.to_string(),
                to,
                expected: expected.to_string(),
            },
            Ok(None) => JobError::NotFound(job_id.to_string()),
            Err(e) => e,
        }
    }
}

enum ClaimRow {
    Succeeded(DocumentJob),
    Created(JobRow),
    Reused(String),
    Blocked(String, JobStatus),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::document_repo::{self, DocumentRow};
    use serde_json::json;

    fn test_store() -> JobStore {
        let db = Database::open_in_memory().unwrap();
        document_repo::insert(
            &db,
            &DocumentRow {
                id: "doc-1".into(),
                user_id: "user-1".into(),
                filename: "a.txt".into(),
                checksum: "abc".into(),
                size_bytes: 3,
                mime_type: None,
                storage_key: None,
                storage_status: "ACTIVE".into(),
                version_id: None,
                is_deleted: false,
                deleted_at: None,
                delete_marker_version_id: None,
                error_message: None,
                created_at: "2026-01-01T00:00:00.000000Z".into(),
                updated_at: "2026-01-01T00:00:00.000000Z".into(),
            },
        )
        .unwrap();
        JobStore::new(
            db,
            JobDefaults {
                max_retries: 2,
                timeout_secs: 600,
            },
        )
    }

    fn ctx() -> JobContext {
        JobContext {
            user_id: "user-1".into(),
            trace_id: Some("trace-1".into()),
            task_id: Some("task-1".into()),
            chain_id: Some("chain-1".into()),
            stage_order: 2,
            ..Default::default()
        }
    }

    fn ready(claim: JobClaim) -> DocumentJob {
        match claim {
            JobClaim::Ready(job) => job,
            JobClaim::Succeeded(job) => panic!("unexpected success short-circuit: {:?}", job.id),
        }
    }

    #[test]
    fn test_find_or_create_new_job() {
        let store = test_store();
        let job = ready(
            store
                .find_or_create("doc-1", JobType::ExtractText, &ctx())
                .unwrap(),
        );
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.trace_id.as_deref(), Some("trace-1"));
        assert_eq!(job.stage_order, 2);
        assert_eq!(job.max_retries, 2);
        assert!(job.retry_of_job_id.is_none());
    }

    #[test]
    fn test_pending_job_blocks_second_claim() {
        let store = test_store();
        store
            .find_or_create("doc-1", JobType::ExtractText, &ctx())
            .unwrap();
        let err = store
            .find_or_create("doc-1", JobType::ExtractText, &ctx())
            .unwrap_err();
        assert!(matches!(err, JobError::NotRetryable { status: JobStatus::Pending, .. }));
    }

    #[test]
    fn test_success_short_circuits() {
        let store = test_store();
        let job = ready(store.find_or_create("doc-1", JobType::ChunkText, &ctx()).unwrap());
        store.mark_running(&job.id).unwrap();
        store.mark_success(&job.id, &json!({"chunks": 3})).unwrap();

        match store.find_or_create("doc-1", JobType::ChunkText, &ctx()).unwrap() {
            JobClaim::Succeeded(done) => {
                assert_eq!(done.id, job.id);
                assert_eq!(done.output_data, Some(json!({"chunks": 3})));
                assert!(done.finished_at.is_some());
            }
            JobClaim::Ready(_) => panic!("expected short-circuit"),
        }
    }

    #[test]
    fn test_failed_job_is_superseded_by_new_row() {
        let store = test_store();
        let first = ready(store.find_or_create("doc-1", JobType::ExtractText, &ctx()).unwrap());
        store.mark_running(&first.id).unwrap();
        store.mark_failure(&first.id, "bad input").unwrap();

        let second = ready(store.find_or_create("doc-1", JobType::ExtractText, &ctx()).unwrap());
        assert_ne!(second.id, first.id);
        assert_eq!(second.retry_of_job_id.as_deref(), Some(first.id.as_str()));

        // The failed row is untouched.
        let old = store.get(&first.id).unwrap().unwrap();
        assert_eq!(old.status, JobStatus::Failure);
        assert_eq!(old.error_message.as_deref(), Some("bad input"));
    }

    #[test]
    fn test_latest_successful_skips_newer_failures() {
        let store = test_store();
        let good = ready(store.find_or_create("doc-1", JobType::ExtractText, &ctx()).unwrap());
        store.mark_running(&good.id).unwrap();
        store.mark_success(&good.id, &json!({"text": "hi"})).unwrap();
        assert!(store
            .latest_successful("doc-1", JobType::ChunkText)
            .unwrap()
            .is_none());

        let found = store
            .latest_successful("doc-1", JobType::ExtractText)
            .unwrap()
            .unwrap();
        assert_eq!(found.id, good.id);
        assert_eq!(found.output_data, Some(json!({"text": "hi"})));
    }

    #[test]
    fn test_retrying_job_is_reused() {
        let store = test_store();
        let job = ready(store.find_or_create("doc-1", JobType::EmbedChunks, &ctx()).unwrap());
        store.mark_running(&job.id).unwrap();
        store.mark_retrying(&job.id, "vector store down").unwrap();

        let mut redelivery = ctx();
        redelivery.task_id = Some("task-2".into());
        let reused = ready(
            store
                .find_or_create("doc-1", JobType::EmbedChunks, &redelivery)
                .unwrap(),
        );
        assert_eq!(reused.id, job.id);
        assert_eq!(reused.status, JobStatus::Retrying);
        assert_eq!(reused.task_id.as_deref(), Some("task-2"));
        assert_eq!(reused.attempt_count, 1);
    }

    #[test]
    fn test_running_job_blocks_claim() {
        let store = test_store();
        let job = ready(store.find_or_create("doc-1", JobType::ExtractText, &ctx()).unwrap());
        store.mark_running(&job.id).unwrap();
        let err = store
            .find_or_create("doc-1", JobType::ExtractText, &ctx())
            .unwrap_err();
        assert!(matches!(err, JobError::NotRetryable { status: JobStatus::Running, .. }));
    }

    #[test]
    fn test_timed_out_running_job_is_superseded() {
        let store = JobStore::new(
            test_store().db,
            JobDefaults {
                max_retries: 2,
                timeout_secs: 0,
            },
        );
        let job = ready(store.find_or_create("doc-1", JobType::ExtractText, &ctx()).unwrap());
        store.mark_running(&job.id).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));

        let fresh = ready(store.find_or_create("doc-1", JobType::ExtractText, &ctx()).unwrap());
        assert_eq!(fresh.retry_of_job_id.as_deref(), Some(job.id.as_str()));
        assert_eq!(store.get(&job.id).unwrap().unwrap().status, JobStatus::Timeout);
    }

    #[test]
    fn test_abandoned_pending_job_is_superseded() {
        let store = JobStore::new(
            test_store().db,
            JobDefaults {
                max_retries: 2,
                timeout_secs: 0,
            },
        );
        let orphan = ready(store.find_or_create("doc-1", JobType::ExtractText, &ctx()).unwrap());
        std::thread::sleep(std::time::Duration::from_millis(20));

        let fresh = ready(store.find_or_create("doc-1", JobType::ExtractText, &ctx()).unwrap());
        assert_ne!(fresh.id, orphan.id);
        assert_eq!(fresh.retry_of_job_id.as_deref(), Some(orphan.id.as_str()));
        let orphan = store.get(&orphan.id).unwrap().unwrap();
        assert_eq!(orphan.status, JobStatus::Timeout);
        assert!(orphan.finished_at.is_some());
    }

    #[test]
    fn test_retry_budget_boundary() {
        let store = test_store();
        let job = ready(store.find_or_create("doc-1", JobType::EmbedChunks, &ctx()).unwrap());

        // max_retries = 2: two transient failures are retried...
        for attempt in 1..=2 {
            store.mark_running(&job.id).unwrap();
            let after = store.mark_retrying(&job.id, "timeout").unwrap();
            assert_eq!(after.status, JobStatus::Retrying);
            assert_eq!(after.attempt_count, attempt);
        }

        // ...the third exhausts the budget.
        store.mark_running(&job.id).unwrap();
        let last = store.mark_retrying(&job.id, "timeout").unwrap();
        assert_eq!(last.status, JobStatus::Failure);
        assert_eq!(last.attempt_count, 2);
        assert!(last.is_terminal());

        // Terminal rows reject further transitions.
        assert!(matches!(
            store.mark_running(&job.id).unwrap_err(),
            JobError::InvalidTransition { .. }
        ));
    }

    #[test]
    fn test_second_running_job_is_rejected_by_index() {
        let store = test_store();
        let first = ready(store.find_or_create("doc-1", JobType::ChunkText, &ctx()).unwrap());
        store.mark_running(&first.id).unwrap();

        // Simulate a racing worker that inserted its own PENDING row.
        let db = store.db.clone();
        job_repo::insert(
            &db,
            &JobRow {
                id: "racer".into(),
                document_id: "doc-1".into(),
                user_id: "user-1".into(),
                job_type: "CHUNK_TEXT".into(),
                status: "PENDING".into(),
                trace_id: None,
                task_id: None,
                chain_id: None,
                stage_order: 3,
                parent_job_id: None,
                retry_of_job_id: None,
                attempt_count: 0,
                max_retries: 2,
                timeout_secs: 600,
                triggered_by: None,
                is_idempotent: true,
                input_data: None,
                output_data: None,
                error_message: None,
                started_at: None,
                finished_at: None,
                created_at: format_timestamp(Utc::now()),
                updated_at: format_timestamp(Utc::now()),
            },
        )
        .unwrap();

        let err = store.mark_running("racer").unwrap_err();
        assert!(matches!(err, JobError::AlreadyRunning { .. }));
    }

    #[test]
    fn test_cancel_and_timeout_transitions() {
        let store = test_store();
        let job = ready(store.find_or_create("doc-1", JobType::ExtractText, &ctx()).unwrap());
        assert_eq!(store.mark_cancelled(&job.id).unwrap().status, JobStatus::Cancelled);
        assert!(store.mark_timeout(&job.id, "late").is_err());

        let next = ready(store.find_or_create("doc-1", JobType::ExtractText, &ctx()).unwrap());
        store.mark_running(&next.id).unwrap();
        let timed = store.mark_timeout(&next.id, "soft deadline").unwrap();
        assert_eq!(timed.status, JobStatus::Timeout);
        assert_eq!(timed.error_message.as_deref(), Some("soft deadline"));
    }

    #[test]
    fn test_jobs_for_trace_and_document() {
        let store = test_store();
        let upload = ready(store.find_or_create("doc-1", JobType::UploadDocument, &ctx()).unwrap());
        store.mark_running(&upload.id).unwrap();
        store.mark_success(&upload.id, &json!({})).unwrap();
        store.find_or_create("doc-1", JobType::ExtractText, &ctx()).unwrap();

        let trace = store.jobs_for_trace("trace-1").unwrap();
        assert_eq!(trace.len(), 2);
        assert_eq!(trace[0].job_type, JobType::UploadDocument);

        let (jobs, total) = store.jobs_for_document("doc-1", 10, 0).unwrap();
        assert_eq!(total, 2);
        assert_eq!(jobs[0].job_type, JobType::ExtractText);
        assert!(store.has_active_jobs("doc-1").unwrap());

        assert_eq!(store.delete_for_document("doc-1").unwrap(), 2);
        assert!(!store.has_active_jobs("doc-1").unwrap());
    }
}
