//! Job repository: CRUD and conditional status updates for `document_jobs`.

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{Database, DatabaseError};

/// A raw job row from the database.
#[derive(Debug, Clone)]
pub struct JobRow {
    pub id: String,
    pub document_id: String,
    pub user_id: String,
    pub job_type: String,
    pub status: String,
    pub trace_id: Option<String>,
    pub task_id: Option<String>,
    pub chain_id: Option<String>,
    pub stage_order: u32,
    pub parent_job_id: Option<String>,
    pub retry_of_job_id: Option<String>,
    pub attempt_count: u32,
    pub max_retries: u32,
    pub timeout_secs: u64,
    pub triggered_by: Option<String>,
    pub is_idempotent: bool,
    pub input_data: Option<String>,
    pub output_data: Option<String>,
    pub error_message: Option<String>,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl JobRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            document_id: row.get("document_id")?,
            user_id: row.get("user_id")?,
            job_type: row.get("job_type")?,
            status: row.get("status")?,
            trace_id: row.get("trace_id")?,
            task_id: row.get("task_id")?,
            chain_id: row.get("chain_id")?,
            stage_order: row.get("stage_order")?,
            parent_job_id: row.get("parent_job_id")?,
            retry_of_job_id: row.get("retry_of_job_id")?,
            attempt_count: row.get("attempt_count")?,
            max_retries: row.get("max_retries")?,
            timeout_secs: row.get("timeout_secs")?,
            triggered_by: row.get("triggered_by")?,
            is_idempotent: row.get("is_idempotent")?,
            input_data: row.get("input_data")?,
            output_data: row.get("output_data")?,
            error_message: row.get("error_message")?,
            started_at: row.get("started_at")?,
            finished_at: row.get("finished_at")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

/// Column changes applied together with a status compare-and-swap.
/// `None` leaves the stored value untouched.
#[derive(Debug, Default, Clone)]
pub struct StatusChange {
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
    pub output_data: Option<String>,
    pub error_message: Option<String>,
    pub task_id: Option<String>,
}

/// Inserts a new job row.
pub fn insert(db: &Database, job: &JobRow) -> Result<(), DatabaseError> {
    db.with_conn(|conn| insert_with(conn, job))
}

pub(crate) fn insert_with(conn: &Connection, job: &JobRow) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO document_jobs (id, document_id, user_id, job_type, status, trace_id,
         task_id, chain_id, stage_order, parent_job_id, retry_of_job_id, attempt_count,
         max_retries, timeout_secs, triggered_by, is_idempotent, input_data, output_data,
         error_message, started_at, finished_at, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                 ?17, ?18, ?19, ?20, ?21, ?22, ?23)",
        params![
            job.id,
            job.document_id,
            job.user_id,
            job.job_type,
            job.status,
            job.trace_id,
            job.task_id,
            job.chain_id,
            job.stage_order,
            job.parent_job_id,
            job.retry_of_job_id,
            job.attempt_count,
            job.max_retries,
            job.timeout_secs,
            job.triggered_by,
            job.is_idempotent,
            job.input_data,
            job.output_data,
            job.error_message,
            job.started_at,
            job.finished_at,
            job.created_at,
            job.updated_at,
        ],
    )?;
    Ok(())
}

/// Finds a job by its ID.
pub fn find_by_id(db: &Database, id: &str) -> Result<Option<JobRow>, DatabaseError> {
    db.with_conn(|conn| {
        let row = conn
            .query_row(
                "SELECT * FROM document_jobs WHERE id = ?1",
                params![id],
                JobRow::from_row,
            )
            .optional()?;
        Ok(row)
    })
}

/// Finds the most recently created job of a type for a document.
pub fn find_latest(
    db: &Database,
    document_id: &str,
    job_type: &str,
) -> Result<Option<JobRow>, DatabaseError> {
    db.with_conn(|conn| find_latest_with(conn, document_id, job_type))
}

pub(crate) fn find_latest_with(
    conn: &Connection,
    document_id: &str,
    job_type: &str,
) -> Result<Option<JobRow>, DatabaseError> {
    let row = conn
        .query_row(
            "SELECT * FROM document_jobs WHERE document_id = ?1 AND job_type = ?2
             ORDER BY created_at DESC, rowid DESC LIMIT 1",
            params![document_id, job_type],
            JobRow::from_row,
        )
        .optional()?;
    Ok(row)
}

/// The newest job of a type with the given status.
pub fn find_latest_with_status(
    db: &Database,
    document_id: &str,
    job_type: &str,
    status: &str,
) -> Result<Option<JobRow>, DatabaseError> {
    db.with_conn(|conn| {
        let row = conn
            .query_row(
                "SELECT * FROM document_jobs
                 WHERE document_id = ?1 AND job_type = ?2 AND status = ?3
                 ORDER BY created_at DESC, rowid DESC LIMIT 1",
                params![document_id, job_type, status],
                JobRow::from_row,
            )
            .optional()?;
        Ok(row)
    })
}

/// Lists a document's jobs, newest first, returning (rows, total_count).
pub fn list_by_document(
    db: &Database,
    document_id: &str,
    limit: u64,
    offset: u64,
) -> Result<(Vec<JobRow>, u64), DatabaseError> {
    db.with_conn(|conn| {
        let total: u64 = conn.query_row(
            "SELECT COUNT(*) FROM document_jobs WHERE document_id = ?1",
            params![document_id],
            |r| r.get(0),
        )?;

        let mut stmt = conn.prepare(
            "SELECT * FROM document_jobs WHERE document_id = ?1
             ORDER BY created_at DESC, rowid DESC LIMIT ?2 OFFSET ?3",
        )?;
        let rows = stmt
            .query_map(
                params![document_id, limit as i64, offset as i64],
                JobRow::from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;

        Ok((rows, total))
    })
}

/// Lists every job sharing a trace id in execution order.
pub fn list_by_trace(db: &Database, trace_id: &str) -> Result<Vec<JobRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM document_jobs WHERE trace_id = ?1
             ORDER BY created_at ASC, rowid ASC",
        )?;
        let rows = stmt
            .query_map(params![trace_id], JobRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Deletes every job of a document. Returns the number of rows removed.
pub fn delete_by_document(db: &Database, document_id: &str) -> Result<usize, DatabaseError> {
    db.with_conn(|conn| {
        let removed = conn.execute(
            "DELETE FROM document_jobs WHERE document_id = ?1",
            params![document_id],
        )?;
        Ok(removed)
    })
}

/// Counts jobs of a document that have not reached a terminal status.
pub fn count_active_for_document(
    db: &Database,
    document_id: &str,
) -> Result<u64, DatabaseError> {
    db.with_conn(|conn| {
        let count: u64 = conn.query_row(
            "SELECT COUNT(*) FROM document_jobs
             WHERE document_id = ?1 AND status IN ('PENDING', 'RUNNING', 'RETRYING')",
            params![document_id],
            |r| r.get(0),
        )?;
        Ok(count)
    })
}

/// Atomically moves a job from one of `from` to `to`, applying `change`.
/// Returns false when the job was not in any of the expected statuses.
pub fn compare_and_set_status(
    db: &Database,
    id: &str,
    from: &[&str],
    to: &str,
    change: &StatusChange,
    updated_at: &str,
) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| compare_and_set_status_with(conn, id, from, to, change, updated_at))
}

pub(crate) fn compare_and_set_status_with(
    conn: &Connection,
    id: &str,
    from: &[&str],
    to: &str,
    change: &StatusChange,
    updated_at: &str,
) -> Result<bool, DatabaseError> {
    if from.is_empty() {
        return Ok(false);
    }

    let mut param_values: Vec<Box<dyn rusqlite::types::ToSql>> = vec![
        Box::new(id.to_string()),
        Box::new(to.to_string()),
        Box::new(change.started_at.clone()),
        Box::new(change.finished_at.clone()),
        Box::new(change.output_data.clone()),
        Box::new(change.error_message.clone()),
        Box::new(change.task_id.clone()),
        Box::new(updated_at.to_string()),
    ];

    let mut placeholders = Vec::with_capacity(from.len());
    for status in from {
        param_values.push(Box::new(status.to_string()));
        placeholders.push(format!("?{}", param_values.len()));
    }

    let sql = format!(
        "UPDATE document_jobs SET status = ?2,
         started_at = COALESCE(?3, started_at),
         finished_at = COALESCE(?4, finished_at),
         output_data = COALESCE(?5, output_data),
         error_message = COALESCE(?6, error_message),
         task_id = COALESCE(?7, task_id),
         updated_at = ?8
         WHERE id = ?1 AND status IN ({})",
        placeholders.join(", ")
    );

    let params_ref: Vec<&dyn rusqlite::types::ToSql> =
        param_values.iter().map(|p| p.as_ref()).collect();
    let changed = conn.execute(&sql, params_ref.as_slice())?;
    Ok(changed == 1)
}

/// Outcome of recording a transient failure against a RUNNING job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryRecord {
    /// Moved to RETRYING with the attempt counter incremented.
    Retrying,
    /// Budget exhausted; moved to FAILURE.
    Exhausted,
    /// The job was not RUNNING.
    NotRunning,
}

/// Records a transient failure: RUNNING → RETRYING while attempts remain,
/// RUNNING → FAILURE once they are spent. Both branches are single
/// conditional updates.
pub fn record_retry(
    db: &Database,
    id: &str,
    error_message: &str,
    now: &str,
) -> Result<RetryRecord, DatabaseError> {
    db.with_conn(|conn| {
        let retried = conn.execute(
            "UPDATE document_jobs SET status = 'RETRYING', attempt_count = attempt_count + 1,
             error_message = ?2, updated_at = ?3
             WHERE id = ?1 AND status = 'RUNNING' AND attempt_count < max_retries",
            params![id, error_message, now],
        )?;
        if retried == 1 {
            return Ok(RetryRecord::Retrying);
        }

        let failed = conn.execute(
            "UPDATE document_jobs SET status = 'FAILURE', error_message = ?2,
             finished_at = ?3, updated_at = ?3
             WHERE id = ?1 AND status = 'RUNNING'",
            params![id, error_message, now],
        )?;
        Ok(if failed == 1 {
            RetryRecord::Exhausted
        } else {
            RetryRecord::NotRunning
        })
    })
}
