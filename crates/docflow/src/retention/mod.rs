//! Retention expiry: soft-deleted documents past the retention window are
//! handed to independent permanent-delete tasks.

pub mod scheduler;

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info};
use uuid::Uuid;

use crate::documents::DocumentStore;
use crate::error::Result;
use crate::queue::{DocumentPayload, TaskHeaders, TaskKind, TaskQueue};

pub use scheduler::RetentionScheduler;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// How long a soft-deleted document is kept.
    pub window: Duration,
    /// Most documents scheduled per sweep.
    pub batch_limit: u64,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(30 * 24 * 60 * 60),
            batch_limit: 100,
        }
    }
}

impl RetentionPolicy {
    pub fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        chrono::Duration::from_std(self.window)
            .ok()
            .and_then(|window| now.checked_sub_signed(window))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpiredDocument {
    pub document_id: String,
    pub user_id: String,
    pub storage_key: Option<String>,
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub scheduled_count: usize,
    pub expired_docs: Vec<ExpiredDocument>,
}

/// Finds documents soft-deleted before the retention cutoff with no
/// unfinished job, and enqueues one permanent-delete task for each. A
/// document whose task cannot be enqueued is skipped and picked up by the
/// next sweep.
pub fn schedule_retention_sweep(
    documents: &dyn DocumentStore,
    queue: &TaskQueue,
    policy: &RetentionPolicy,
    now: DateTime<Utc>,
) -> Result<SweepReport> {
    let cutoff = policy.cutoff(now);
    let expired = documents.get_expired_soft_deleted(cutoff, policy.batch_limit)?;
    let sweep_id = Uuid::new_v4().to_string();

    let mut report = SweepReport::default();
    for doc in expired {
        let payload = DocumentPayload {
            document_id: doc.id.clone(),
            version_id: None,
        };
        let headers = TaskHeaders {
            trace_id: Some(sweep_id.clone()),
            chain_id: None,
            parent_task_id: None,
        };
        match queue.enqueue(TaskKind::PermanentDelete, &payload, headers) {
            Ok(_) => {
                report.scheduled_count += 1;
                report.expired_docs.push(ExpiredDocument {
                    document_id: doc.id,
                    user_id: doc.user_id,
                    storage_key: doc.storage_key,
                    deleted_at: doc.deleted_at,
                });
            }
            Err(e) => error!(document_id = %doc.id, "Failed to schedule permanent delete: {}", e),
        }
    }

    info!(
        sweep_id = %sweep_id,
        scheduled = report.scheduled_count,
        cutoff = %cutoff,
        "Retention sweep finished"
    );
    Ok(report)
}
