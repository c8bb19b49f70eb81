//! Task queue: durable at-least-once delivery of pipeline and lifecycle work.

pub mod pool;
pub mod retry;
pub mod store;
pub mod task;

pub use pool::{PoolSettings, TaskHandler, TaskReport, WorkerPool};
pub use retry::RetryPolicy;
pub use store::{TaskOutcome, TaskQueue};
pub use task::{DocumentPayload, StagePayload, Task, TaskHeaders, TaskKind, TaskStatus};
