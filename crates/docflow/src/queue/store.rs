//! Durable task queue over the `tasks` table.
//!
//! Delivery is at-least-once: a claimed task carries a lease, and a task whose
//! lease lapses before it is acknowledged becomes claimable again.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::db::task_repo::{self, TaskRow};
use crate::db::{format_timestamp, Database};
use crate::error::QueueError;
use crate::jobs::truncate_error;

use super::pool::TaskHandler;
use super::retry::RetryPolicy;
use super::task::{Task, TaskHeaders, TaskKind, TaskStatus};

/// How a worker finished a task.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Succeeded(Value),
    /// Transient failure; redeliver after a backoff while attempts remain.
    Retry(String),
    Failed(String),
}

#[derive(Clone)]
pub struct TaskQueue {
    db: Database,
    policy: RetryPolicy,
}

impl TaskQueue {
    pub fn new(db: Database, policy: RetryPolicy) -> Self {
        Self { db, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn enqueue<P: Serialize>(
        &self,
        kind: TaskKind,
        payload: &P,
        headers: TaskHeaders,
    ) -> Result<Task, QueueError> {
        let now = format_timestamp(Utc::now());
        let row = TaskRow {
            id: Uuid::new_v4().to_string(),
            kind: kind.name(),
            payload: serde_json::to_string(payload)?,
            trace_id: headers.trace_id,
            chain_id: headers.chain_id,
            parent_task_id: headers.parent_task_id,
            status: TaskStatus::Queued.as_str().to_string(),
            attempts: 0,
            max_attempts: self.policy.max_attempts(),
            available_at: now.clone(),
            leased_until: None,
            worker_id: None,
            last_error: None,
            result: None,
            created_at: now.clone(),
            updated_at: now,
        };
        task_repo::insert(&self.db, &row)?;
        log::debug!("Enqueued task {} ({})", row.id, row.kind);
        Task::try_from(row)
    }

    /// Leases the next deliverable task for `lease`. Tasks whose lease lapsed
    /// on their final attempt are failed first.
    pub fn claim(&self, worker_id: &str, lease: Duration) -> Result<Option<Task>, QueueError> {
        let now = Utc::now();
        let now_str = format_timestamp(now);
        let expired = task_repo::fail_expired_leases(&self.db, &now_str)?;
        if expired > 0 {
            log::warn!("Failed {} task(s) whose final lease expired", expired);
        }

        let leased_until = format_timestamp(after(now, lease));
        task_repo::claim_next(&self.db, worker_id, &now_str, &leased_until)?
            .map(Task::try_from)
            .transpose()
    }

    /// Acknowledges a completed task. False when it was no longer leased.
    pub fn ack(&self, task_id: &str, result: Option<&Value>) -> Result<bool, QueueError> {
        let result = result.map(serde_json::to_string).transpose()?;
        let now = format_timestamp(Utc::now());
        Ok(task_repo::complete(&self.db, task_id, result.as_deref(), &now)?)
    }

    /// Requeues a leased task, deliverable after `delay`.
    pub fn retry(&self, task_id: &str, delay: Duration, error: &str) -> Result<bool, QueueError> {
        let now = Utc::now();
        Ok(task_repo::reschedule(
            &self.db,
            task_id,
            &format_timestamp(after(now, delay)),
            &truncate_error(error),
            &format_timestamp(now),
        )?)
    }

    pub fn fail(&self, task_id: &str, error: &str) -> Result<bool, QueueError> {
        let now = format_timestamp(Utc::now());
        Ok(task_repo::fail(&self.db, task_id, &truncate_error(error), &now)?)
    }

    /// Cancels a task that has not settled. A running body is not interrupted;
    /// its acknowledgement is simply discarded.
    pub fn revoke(&self, task_id: &str) -> Result<bool, QueueError> {
        let now = format_timestamp(Utc::now());
        Ok(task_repo::revoke(&self.db, task_id, &now)?)
    }

    pub fn status(&self, task_id: &str) -> Result<TaskStatus, QueueError> {
        self.get(task_id)?
            .map(|t| t.status)
            .ok_or_else(|| QueueError::NotFound(task_id.to_string()))
    }

    pub fn get(&self, task_id: &str) -> Result<Option<Task>, QueueError> {
        task_repo::find_by_id(&self.db, task_id)?
            .map(Task::try_from)
            .transpose()
    }

    pub fn count(&self, status: TaskStatus) -> Result<u64, QueueError> {
        Ok(task_repo::count_by_status(&self.db, status.as_str())?)
    }

    /// Applies a worker's outcome: ack, requeue with backoff, or fail once the
    /// attempts are spent.
    pub fn settle(&self, task: &Task, outcome: &TaskOutcome) -> Result<TaskStatus, QueueError> {
        let (settled, status) = match outcome {
            TaskOutcome::Succeeded(result) => {
                (self.ack(&task.id, Some(result))?, TaskStatus::Succeeded)
            }
            TaskOutcome::Retry(error) if !task.is_final_attempt() => {
                let delay = self.policy.delay(task.attempts);
                log::info!(
                    "Task {} ({}) attempt {}/{} failed, retrying in {:?}: {}",
                    task.id,
                    task.kind,
                    task.attempts,
                    task.max_attempts,
                    delay,
                    error
                );
                (self.retry(&task.id, delay, error)?, TaskStatus::Queued)
            }
            TaskOutcome::Retry(error) | TaskOutcome::Failed(error) => {
                log::warn!("Task {} ({}) failed: {}", task.id, task.kind, error);
                (self.fail(&task.id, error)?, TaskStatus::Failed)
            }
        };

        if settled {
            Ok(status)
        } else {
            // Revoked or redelivered elsewhere while this worker held it.
            self.status(&task.id)
        }
    }
}

impl TaskQueue {
    /// Claims and runs deliverable tasks on the calling thread, each leased
    /// for `lease`, until none is left. Returns how many were settled.
    pub fn drain(
        &self,
        handler: &dyn TaskHandler,
        worker_id: &str,
        lease: Duration,
    ) -> Result<usize, QueueError> {
        let mut processed = 0;
        while let Some(task) = self.claim(worker_id, lease)? {
            let outcome = handler.handle(&task);
            self.settle(&task, &outcome)?;
            processed += 1;
        }
        Ok(processed)
    }
}

/// `now + delay`, saturating at a century out.
fn after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    let century = chrono::Duration::days(36_500);
    let delay = chrono::Duration::from_std(delay).map_or(century, |d| d.min(century));
    now + delay
}
