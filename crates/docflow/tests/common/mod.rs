//! Shared test utilities for docflow integration tests.
//!
//! `TestHarness` wires an `Orchestrator` over an in-memory database, an
//! in-memory object store and a temporary staging directory. The concrete
//! stores are kept alongside so tests can inject faults and inspect calls.

#![allow(dead_code)]

pub mod capture;
pub mod flaky;

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use docflow::db::Database;
use docflow::jobs::{JobDefaults, JobStore};
use docflow::pipeline::{ChainContext, Orchestrator, PipelineRun, StageDeps, UploadSpec};
use docflow::processing::{ExtractorRegistry, HashingVectorIndex, ParagraphChunker};
use docflow::queue::{RetryPolicy, TaskQueue};
use docflow::retention::RetentionPolicy;
use docflow::storage::{MemoryObjectStore, StagingArea};
use docflow::SqliteDocumentStore;

pub use flaky::FlakyDocumentStore;

/// Retries allowed per job and per task in the harness.
pub const MAX_RETRIES: u32 = 3;

/// Lease taken by in-thread drains.
pub const LEASE: Duration = Duration::from_secs(60);

pub const SAMPLE_TEXT: &str = "Quarterly report\n\n\
Revenue grew in every region during the third quarter, led by strong demand for \
the new subscription tiers.\n\n\
Operating costs stayed flat while headcount increased slightly in engineering.";

/// Isolated environment for one test.
pub struct TestHarness {
    /// Holds the staging directory alive for the harness lifetime.
    temp_dir: TempDir,
    pub db: Database,
    pub documents: Arc<FlakyDocumentStore>,
    pub objects: Arc<MemoryObjectStore>,
    pub vectors: Arc<HashingVectorIndex>,
    pub orchestrator: Arc<Orchestrator>,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_soft_deadline(Duration::from_secs(300))
    }

    pub fn with_soft_deadline(soft_deadline: Duration) -> Self {
        Self::build(soft_deadline, 600)
    }

    /// Jobs lapse `timeout_secs` after they were created or started.
    pub fn with_job_timeout(timeout_secs: u64) -> Self {
        Self::build(Duration::from_secs(300), timeout_secs)
    }

    fn build(soft_deadline: Duration, timeout_secs: u64) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let db = Database::open_in_memory().expect("Failed to open in-memory database");

        let documents = Arc::new(FlakyDocumentStore::new(SqliteDocumentStore::new(db.clone())));
        let objects = Arc::new(MemoryObjectStore::new());
        let vectors = Arc::new(HashingVectorIndex::default());

        let deps = StageDeps {
            db: db.clone(),
            jobs: JobStore::new(
                db.clone(),
                JobDefaults {
                    max_retries: MAX_RETRIES,
                    timeout_secs,
                },
            ),
            documents: documents.clone(),
            objects: objects.clone(),
            staging: StagingArea::new(temp_dir.path().join("staging")),
            extractor: Arc::new(ExtractorRegistry::new(1024 * 1024)),
            chunker: Arc::new(ParagraphChunker::new(120, 20, 10)),
            vectors: vectors.clone(),
            soft_deadline,
        };

        // Zero backoff so a drain redelivers retried tasks immediately.
        let queue = TaskQueue::new(
            db.clone(),
            RetryPolicy {
                max_retries: MAX_RETRIES,
                base_delay: Duration::ZERO,
                max_delay: Duration::ZERO,
            },
        );
        let orchestrator = Arc::new(Orchestrator::new(deps, queue, RetentionPolicy::default()));

        Self {
            temp_dir,
            db,
            documents,
            objects,
            vectors,
            orchestrator,
        }
    }

    pub fn deps(&self) -> &StageDeps {
        self.orchestrator.deps()
    }

    /// Stages `content` under a fresh id and returns the chain context and
    /// upload spec for it.
    pub fn stage(&self, user_id: &str, filename: &str, content: &[u8]) -> (ChainContext, UploadSpec) {
        let staged_id = uuid::Uuid::new_v4().to_string();
        self.deps()
            .staging
            .stage(&staged_id, content)
            .expect("Failed to stage upload");
        let ctx = ChainContext::new(staged_id, user_id, None).triggered_by("test");
        let spec = UploadSpec {
            filename: filename.to_string(),
            mime_type: None,
        };
        (ctx, spec)
    }

    /// Runs the whole pipeline in-process for a new upload.
    pub fn ingest(&self, user_id: &str, filename: &str, content: &[u8]) -> PipelineRun {
        let (ctx, spec) = self.stage(user_id, filename, content);
        self.orchestrator
            .run_pipeline(ctx, Some(&spec))
            .expect("Pipeline failed")
    }

    pub fn document(&self, document_id: &str) -> docflow::Document {
        use docflow::DocumentStore;
        self.documents
            .get_by_id(document_id)
            .expect("Failed to load document")
            .expect("Document not found")
    }

    pub fn read_object(&self, key: &str) -> Vec<u8> {
        use docflow::ObjectStore;
        use std::io::Read;
        let mut bytes = Vec::new();
        self.objects
            .stream(key)
            .expect("Failed to open object")
            .read_to_end(&mut bytes)
            .expect("Failed to read object");
        bytes
    }
}
