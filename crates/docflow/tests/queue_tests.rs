//! Chains driven through the task queue: submission, redelivery, lifecycle
//! tasks, retention sweeps and the worker pool.

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;

use common::flaky::DocOp;
use common::{TestHarness, LEASE, MAX_RETRIES, SAMPLE_TEXT};

use docflow::jobs::{JobStatus, JobType};
use docflow::pipeline::{ChainContext, UploadRequest};
use docflow::queue::{PoolSettings, TaskHandler, TaskStatus, WorkerPool};
use docflow::storage::StoreOp;
use docflow::{ObjectStore, StorageStatus};

fn request(content: &[u8]) -> UploadRequest {
    UploadRequest {
        user_id: "user-1".to_string(),
        filename: "report.txt".to_string(),
        content: content.to_vec(),
        mime_type: None,
        trace_id: None,
    }
}

/// Submits and drains a new upload, returning its document id.
fn upload_and_drain(h: &TestHarness, content: &[u8]) -> String {
    let submission = h.orchestrator.submit_upload(request(content)).unwrap();
    h.orchestrator.drain("test-worker", LEASE).unwrap();
    submission.document_id
}

#[test]
fn test_submitted_upload_runs_every_stage() {
    let h = TestHarness::new();
    let submission = h
        .orchestrator
        .submit_upload(UploadRequest {
            trace_id: Some("trace-42".to_string()),
            ..request(SAMPLE_TEXT.as_bytes())
        })
        .unwrap();
    assert_eq!(submission.trace_id, "trace-42");
    let queue = h.orchestrator.queue();
    assert_eq!(queue.count(TaskStatus::Queued).unwrap(), 1);

    let processed = h.orchestrator.drain("test-worker", LEASE).unwrap();

    assert_eq!(processed, 4);
    assert_eq!(queue.count(TaskStatus::Succeeded).unwrap(), 4);
    assert_eq!(queue.count(TaskStatus::Queued).unwrap(), 0);

    let first = queue.get(&submission.task_id).unwrap().unwrap();
    let result = first.result.unwrap();
    assert_eq!(result["stage"], "upload");
    assert_eq!(result["document_id"], submission.document_id.as_str());
    assert_eq!(result["cached"], false);
    assert_eq!(first.headers.chain_id.as_deref(), Some(submission.chain_id.as_str()));

    let jobs = h.orchestrator.jobs_for_trace("trace-42").unwrap();
    assert_eq!(jobs.len(), 4);
    assert!(jobs.iter().all(|j| j.status == JobStatus::Success));
    assert!(jobs
        .iter()
        .all(|j| j.triggered_by.as_deref() == Some("upload") && j.task_id.is_some()));
    assert_eq!(
        h.document(&submission.document_id).storage_status,
        StorageStatus::Active
    );
}

#[test]
fn test_submit_rejects_empty_input() {
    let h = TestHarness::new();
    assert!(h.orchestrator.submit_upload(request(b"")).is_err());
    assert!(h
        .orchestrator
        .submit_upload(UploadRequest {
            filename: "  ".to_string(),
            ..request(b"data")
        })
        .is_err());
    assert_eq!(h.orchestrator.queue().count(TaskStatus::Queued).unwrap(), 0);
}

#[test]
fn test_transient_failure_is_redelivered() {
    let h = TestHarness::new();
    h.vectors.inject_failure(2);

    let document_id = upload_and_drain(&h, SAMPLE_TEXT.as_bytes());

    let queue = h.orchestrator.queue();
    assert_eq!(queue.count(TaskStatus::Succeeded).unwrap(), 4);
    assert_eq!(queue.count(TaskStatus::Failed).unwrap(), 0);

    let embed = h
        .deps()
        .jobs
        .latest(&document_id, JobType::EmbedChunks)
        .unwrap()
        .unwrap();
    assert_eq!(embed.status, JobStatus::Success);
    assert_eq!(embed.attempt_count, 2);
    assert!(embed.retry_of_job_id.is_none());
}

#[test]
fn test_exhausted_retries_stop_the_chain() {
    let h = TestHarness::new();
    h.vectors.inject_failure(MAX_RETRIES + 5);

    let document_id = upload_and_drain(&h, SAMPLE_TEXT.as_bytes());

    let queue = h.orchestrator.queue();
    assert_eq!(queue.count(TaskStatus::Succeeded).unwrap(), 3);
    assert_eq!(queue.count(TaskStatus::Failed).unwrap(), 1);

    let embed = h
        .deps()
        .jobs
        .latest(&document_id, JobType::EmbedChunks)
        .unwrap()
        .unwrap();
    assert_eq!(embed.status, JobStatus::Failure);
    assert_eq!(embed.attempt_count, MAX_RETRIES);
    assert!(embed.error_message.unwrap().contains("vector index"));
}

#[test]
fn test_start_pipeline_only_runs_missing_work() {
    let h = TestHarness::new();
    let document_id = upload_and_drain(&h, SAMPLE_TEXT.as_bytes());
    let embed_calls = h.vectors.embed_calls();

    let submission = h
        .orchestrator
        .start_pipeline(&document_id, "user-1", None)
        .unwrap();
    assert_eq!(h.orchestrator.drain("test-worker", LEASE).unwrap(), 4);

    assert_eq!(h.vectors.embed_calls(), embed_calls);
    assert_eq!(h.objects.calls(StoreOp::Upload), 1);
    let task = h.orchestrator.queue().get(&submission.task_id).unwrap().unwrap();
    assert_eq!(task.result.unwrap()["cached"], true);

    assert!(h
        .orchestrator
        .start_pipeline(&document_id, "someone-else", None)
        .is_err());
}

#[test]
fn test_revoked_task_is_not_delivered() {
    let h = TestHarness::new();
    let submission = h
        .orchestrator
        .submit_upload(request(SAMPLE_TEXT.as_bytes()))
        .unwrap();

    assert!(h.orchestrator.queue().revoke(&submission.task_id).unwrap());
    assert_eq!(h.orchestrator.drain("test-worker", LEASE).unwrap(), 0);
    assert_eq!(
        h.orchestrator.queue().status(&submission.task_id).unwrap(),
        TaskStatus::Revoked
    );
    assert!(h
        .deps()
        .documents
        .get_by_id(&submission.document_id)
        .unwrap()
        .is_none());
}

#[test]
fn test_soft_delete_and_restore_tasks() {
    let h = TestHarness::new();
    let document_id = upload_and_drain(&h, SAMPLE_TEXT.as_bytes());

    let task = h.orchestrator.soft_delete_document(&document_id, None).unwrap();
    assert_eq!(h.orchestrator.drain("test-worker", LEASE).unwrap(), 1);
    let settled = h.orchestrator.queue().get(&task.id).unwrap().unwrap();
    assert_eq!(settled.status, TaskStatus::Succeeded);
    let marker = settled.result.unwrap()["delete_marker_version_id"]
        .as_str()
        .unwrap()
        .to_string();
    assert!(h.document(&document_id).is_deleted);

    h.orchestrator
        .restore_document(&document_id, &marker, None)
        .unwrap();
    assert_eq!(h.orchestrator.drain("test-worker", LEASE).unwrap(), 1);
    let doc = h.document(&document_id);
    assert!(!doc.is_deleted);
    assert_eq!(doc.storage_status, StorageStatus::Active);
}

#[test]
fn test_invalid_restore_fails_without_retry() {
    let h = TestHarness::new();
    let document_id = upload_and_drain(&h, SAMPLE_TEXT.as_bytes());
    h.orchestrator.soft_delete_document(&document_id, None).unwrap();
    h.orchestrator.drain("test-worker", LEASE).unwrap();

    let task = h
        .orchestrator
        .restore_document(&document_id, "bogus-version", None)
        .unwrap();
    assert_eq!(h.orchestrator.drain("test-worker", LEASE).unwrap(), 1);

    let settled = h.orchestrator.queue().get(&task.id).unwrap().unwrap();
    assert_eq!(settled.status, TaskStatus::Failed);
    assert_eq!(settled.attempts, 1);
    assert!(h.document(&document_id).is_deleted);
}

#[test]
fn test_soft_delete_task_compensates_on_last_delivery() {
    let h = TestHarness::new();
    let document_id = upload_and_drain(&h, SAMPLE_TEXT.as_bytes());
    let key = h.document(&document_id).storage_key.unwrap();
    h.documents.fail_next(DocOp::SoftDelete, MAX_RETRIES + 1);

    let task = h.orchestrator.soft_delete_document(&document_id, None).unwrap();
    assert_eq!(
        h.orchestrator.drain("test-worker", LEASE).unwrap(),
        (MAX_RETRIES + 1) as usize
    );

    let settled = h.orchestrator.queue().get(&task.id).unwrap().unwrap();
    assert_eq!(settled.status, TaskStatus::Failed);
    assert_eq!(settled.attempts, MAX_RETRIES + 1);
    // One marker written, reused by the retries, removed on the last one.
    assert_eq!(h.objects.calls(StoreOp::Restore), 1);
    assert!(!h.objects.latest_version(&key).unwrap().unwrap().is_delete_marker);
    assert!(!h.document(&document_id).is_deleted);
}

#[test]
fn test_retention_sweep_removes_expired_documents() {
    let h = TestHarness::new();
    let expired_id = upload_and_drain(&h, SAMPLE_TEXT.as_bytes());
    let recent_id = upload_and_drain(&h, b"A short memo about the offsite agenda.");
    let live_id = upload_and_drain(&h, b"Minutes of the budget review meeting.");

    for id in [&expired_id, &recent_id] {
        h.orchestrator.soft_delete_document(id, None).unwrap();
    }
    h.orchestrator.drain("test-worker", LEASE).unwrap();

    // Backdate the first deletion past the retention window.
    let doc = h.document(&expired_id);
    h.deps()
        .documents
        .soft_delete(
            &expired_id,
            doc.delete_marker_version_id.as_deref().unwrap(),
            Utc::now() - chrono::Duration::days(40),
        )
        .unwrap();
    let key = doc.storage_key.unwrap();

    let report = h.orchestrator.schedule_retention_sweep().unwrap();
    assert_eq!(report.scheduled_count, 1);
    assert_eq!(report.expired_docs[0].document_id, expired_id);

    assert_eq!(h.orchestrator.drain("test-worker", LEASE).unwrap(), 1);
    assert!(h.deps().documents.get_by_id(&expired_id).unwrap().is_none());
    assert_eq!(h.objects.version_count(&key), 0);
    assert_eq!(h.vectors.point_count(&expired_id), 0);
    assert!(h.document(&recent_id).is_deleted);
    assert!(!h.document(&live_id).is_deleted);

    let report = h.orchestrator.schedule_retention_sweep().unwrap();
    assert_eq!(report.scheduled_count, 0);
}

#[test]
fn test_cancelled_job_is_superseded() {
    let h = TestHarness::new();
    h.vectors.inject_failure(1);
    let (ctx, spec) = h.stage("user-1", "report.txt", SAMPLE_TEXT.as_bytes());
    let document_id = ctx.document_id.clone();

    let failure = h.orchestrator.run_pipeline(ctx, Some(&spec)).unwrap_err();
    let retrying = failure.job.unwrap();
    assert_eq!(retrying.status, JobStatus::Retrying);

    let cancelled = h.orchestrator.cancel_job(&retrying.id).unwrap();
    assert_eq!(cancelled.status, JobStatus::Cancelled);
    assert!(h.orchestrator.cancel_job(&retrying.id).is_err());

    let run = h
        .orchestrator
        .run_pipeline(ChainContext::new(&document_id, "user-1", None), None)
        .unwrap();
    assert_eq!(
        run.stages[3].job.retry_of_job_id.as_deref(),
        Some(retrying.id.as_str())
    );
}

#[test]
fn test_worker_pool_processes_chain() {
    let h = TestHarness::new();
    let handler: Arc<dyn TaskHandler> = h.orchestrator.clone();
    let pool = WorkerPool::start(
        h.orchestrator.queue().clone(),
        handler,
        PoolSettings {
            worker_count: 2,
            lease: Duration::from_secs(60),
            poll_interval: Duration::from_millis(10),
        },
    )
    .unwrap();

    let submission = h
        .orchestrator
        .submit_upload(request(SAMPLE_TEXT.as_bytes()))
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(20);
    let mut succeeded = 0;
    while succeeded < 4 && Instant::now() < deadline {
        if let Some(report) = pool.recv_report_timeout(Duration::from_millis(100)) {
            assert_eq!(report.status, TaskStatus::Succeeded);
            succeeded += 1;
        }
    }
    pool.shutdown();
    pool.wait();

    assert_eq!(succeeded, 4);
    let doc = h.document(&submission.document_id);
    assert_eq!(doc.storage_status, StorageStatus::Active);
    let key = doc.storage_key.unwrap();
    assert!(h.objects.latest_version(&key).unwrap().is_some());
}
