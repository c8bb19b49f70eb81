pub mod model;
pub mod store;

pub use model::{truncate_error, DocumentJob, JobContext, JobStatus, JobType, MAX_ERROR_LEN};
pub use store::{JobClaim, JobDefaults, JobError, JobStore};
