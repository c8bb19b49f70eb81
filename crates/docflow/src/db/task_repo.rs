//! Task repository: the durable backing table of the task queue.

use rusqlite::{params, OptionalExtension, Row};

use super::{Database, DatabaseError};

/// A raw task row from the database.
#[derive(Debug, Clone)]
pub struct TaskRow {
    pub id: String,
    pub kind: String,
    pub payload: String,
    pub trace_id: Option<String>,
    pub chain_id: Option<String>,
    pub parent_task_id: Option<String>,
    pub status: String,
    pub attempts: u32,
    pub max_attempts: u32,
    pub available_at: String,
    pub leased_until: Option<String>,
    pub worker_id: Option<String>,
    pub last_error: Option<String>,
    pub result: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl TaskRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            kind: row.get("kind")?,
            payload: row.get("payload")?,
            trace_id: row.get("trace_id")?,
            chain_id: row.get("chain_id")?,
            parent_task_id: row.get("parent_task_id")?,
            status: row.get("status")?,
            attempts: row.get("attempts")?,
            max_attempts: row.get("max_attempts")?,
            available_at: row.get("available_at")?,
            leased_until: row.get("leased_until")?,
            worker_id: row.get("worker_id")?,
            last_error: row.get("last_error")?,
            result: row.get("result")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

/// Inserts a new task row.
pub fn insert(db: &Database, task: &TaskRow) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO tasks (id, kind, payload, trace_id, chain_id, parent_task_id, status,
             attempts, max_attempts, available_at, leased_until, worker_id, last_error, result,
             created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            params![
                task.id,
                task.kind,
                task.payload,
                task.trace_id,
                task.chain_id,
                task.parent_task_id,
                task.status,
                task.attempts,
                task.max_attempts,
                task.available_at,
                task.leased_until,
                task.worker_id,
                task.last_error,
                task.result,
                task.created_at,
                task.updated_at,
            ],
        )?;
        Ok(())
    })
}

/// Finds a task by its ID.
pub fn find_by_id(db: &Database, id: &str) -> Result<Option<TaskRow>, DatabaseError> {
    db.with_conn(|conn| {
        let row = conn
            .query_row(
                "SELECT * FROM tasks WHERE id = ?1",
                params![id],
                TaskRow::from_row,
            )
            .optional()?;
        Ok(row)
    })
}

/// Fails tasks whose lease lapsed on their final attempt so they are not
/// redelivered forever. Returns the number of tasks failed.
pub fn fail_expired_leases(db: &Database, now: &str) -> Result<usize, DatabaseError> {
    db.with_conn(|conn| {
        let failed = conn.execute(
            "UPDATE tasks SET status = 'FAILED', leased_until = NULL,
             last_error = 'lease expired on final attempt', updated_at = ?1
             WHERE status = 'RUNNING' AND leased_until < ?1 AND attempts >= max_attempts",
            params![now],
        )?;
        Ok(failed)
    })
}

/// Leases the next deliverable task: a queued task whose `available_at` has
/// passed, or a running task whose lease expired (redelivery).
pub fn claim_next(
    db: &Database,
    worker_id: &str,
    now: &str,
    leased_until: &str,
) -> Result<Option<TaskRow>, DatabaseError> {
    db.with_conn(|conn| {
        let row = conn
            .query_row(
                "UPDATE tasks SET status = 'RUNNING', attempts = attempts + 1, worker_id = ?1,
                 leased_until = ?3, updated_at = ?2
                 WHERE id = (
                     SELECT id FROM tasks
                     WHERE (status = 'QUEUED' AND available_at <= ?2)
                        OR (status = 'RUNNING' AND leased_until < ?2 AND attempts < max_attempts)
                     ORDER BY available_at ASC, rowid ASC
                     LIMIT 1
                 )
                 RETURNING *",
                params![worker_id, now, leased_until],
                TaskRow::from_row,
            )
            .optional()?;
        Ok(row)
    })
}

/// Marks a leased task as succeeded. False when the task was no longer
/// running (revoked or already settled).
pub fn complete(
    db: &Database,
    id: &str,
    result: Option<&str>,
    now: &str,
) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE tasks SET status = 'SUCCEEDED', result = ?2, leased_until = NULL,
             updated_at = ?3
             WHERE id = ?1 AND status = 'RUNNING'",
            params![id, result, now],
        )?;
        Ok(changed == 1)
    })
}

/// Puts a leased task back on the queue, deliverable at `available_at`.
pub fn reschedule(
    db: &Database,
    id: &str,
    available_at: &str,
    error: &str,
    now: &str,
) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE tasks SET status = 'QUEUED', available_at = ?2, last_error = ?3,
             leased_until = NULL, worker_id = NULL, updated_at = ?4
             WHERE id = ?1 AND status = 'RUNNING'",
            params![id, available_at, error, now],
        )?;
        Ok(changed == 1)
    })
}

/// Marks a leased task as permanently failed.
pub fn fail(db: &Database, id: &str, error: &str, now: &str) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE tasks SET status = 'FAILED', last_error = ?2, leased_until = NULL,
             updated_at = ?3
             WHERE id = ?1 AND status = 'RUNNING'",
            params![id, error, now],
        )?;
        Ok(changed == 1)
    })
}

/// Revokes a task that has not settled yet.
pub fn revoke(db: &Database, id: &str, now: &str) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE tasks SET status = 'REVOKED', leased_until = NULL, updated_at = ?2
             WHERE id = ?1 AND status IN ('QUEUED', 'RUNNING')",
            params![id, now],
        )?;
        Ok(changed == 1)
    })
}

/// Counts tasks with the given status.
pub fn count_by_status(db: &Database, status: &str) -> Result<u64, DatabaseError> {
    db.with_conn(|conn| {
        let count: u64 = conn.query_row(
            "SELECT COUNT(*) FROM tasks WHERE status = ?1",
            params![status],
            |r| r.get(0),
        )?;
        Ok(count)
    })
}
