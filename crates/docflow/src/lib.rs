pub mod config;
pub mod db;
pub mod documents;
pub mod error;
pub mod jobs;
pub mod pipeline;
pub mod processing;
pub mod queue;
pub mod retention;
pub mod storage;
pub mod telemetry;

pub use config::{load_config, resolve_config, Config};
pub use db::Database;
pub use documents::{Document, DocumentStore, SqliteDocumentStore, StorageStatus};
pub use error::{
    ConfigError, DocflowError, ProcessError, QueueError, Result, StorageError, VectorError,
    WorkerError,
};
pub use jobs::{DocumentJob, JobError, JobStatus, JobStore, JobType};
pub use pipeline::{
    ChainContext, Orchestrator, Stage, StageDeps, StageError, Submission, UploadRequest,
};
pub use queue::{TaskQueue, WorkerPool};
pub use retention::{schedule_retention_sweep, RetentionPolicy, RetentionScheduler, SweepReport};
pub use storage::{FsObjectStore, MemoryObjectStore, ObjectStore};
