//! The four-stage document pipeline and the document lifecycle operations.

pub mod context;
pub mod descriptor;
pub mod error;
pub mod executor;
pub mod lifecycle;
pub mod orchestrator;
pub mod stages;

pub use context::ChainContext;
pub use descriptor::{Stage, PIPELINE};
pub use error::{FailureClass, StageError};
pub use executor::{StageDeps, StageExecutor, StageFailure, StageRun};
pub use orchestrator::{Orchestrator, PipelineRun, Submission, UploadRequest};
pub use stages::{Deadline, UploadSpec};
