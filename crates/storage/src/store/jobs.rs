#![forbid(unsafe_code)]

use super::*;
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, params_from_iter};
use serde_json::Value as JsonValue;
use tt_core::{JobId, JobKind, JobStatus, Lifecycle, TargetId};

const MAX_JOB_INPUT_LEN: usize = 256_000;
const MAX_JOB_RESULT_LEN: usize = 1_024_000;
const MAX_JOB_ERROR_LEN: usize = 4_000;
const MAX_CANCEL_REASON_LEN: usize = 400;
const MAX_JOB_RUNNER_LEN: usize = 128;
const MAX_LIST_LIMIT: usize = 500;

const JOB_COLUMNS: &str = "id, revision, kind, target_id, status, input_json, partial, result_json, \
     error, cancel_reason, runner, created_at_ms, updated_at_ms, completed_at_ms";

fn normalize_runner_id(raw: &str) -> Result<String, StoreError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(StoreError::InvalidInput("runner_id must not be empty"));
    }
    if trimmed.len() > MAX_JOB_RUNNER_LEN {
        return Err(StoreError::InvalidInput("runner_id is too long"));
    }
    Ok(trimmed.to_string())
}

fn normalize_error(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return "job failed".to_string();
    }
    trimmed.chars().take(MAX_JOB_ERROR_LEN).collect()
}

fn normalize_reason(raw: Option<&str>) -> Option<String> {
    raw.map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.chars().take(MAX_CANCEL_REASON_LEN).collect())
}

struct RawJobRow {
    id: String,
    revision: i64,
    kind: String,
    target_id: String,
    status: String,
    input_json: String,
    partial: Option<String>,
    result_json: Option<String>,
    error: Option<String>,
    cancel_reason: Option<String>,
    runner: Option<String>,
    created_at_ms: i64,
    updated_at_ms: i64,
    completed_at_ms: Option<i64>,
}

fn read_raw_job(row: &rusqlite::Row<'_>) -> Result<RawJobRow, rusqlite::Error> {
    Ok(RawJobRow {
        id: row.get(0)?,
        revision: row.get(1)?,
        kind: row.get(2)?,
        target_id: row.get(3)?,
        status: row.get(4)?,
        input_json: row.get(5)?,
        partial: row.get(6)?,
        result_json: row.get(7)?,
        error: row.get(8)?,
        cancel_reason: row.get(9)?,
        runner: row.get(10)?,
        created_at_ms: row.get(11)?,
        updated_at_ms: row.get(12)?,
        completed_at_ms: row.get(13)?,
    })
}

impl RawJobRow {
    fn into_row(self) -> Result<JobRow, StoreError> {
        let status = JobStatus::parse(&self.status)
            .ok_or_else(|| StoreError::Corrupt(format!("job {} has status {}", self.id, self.status)))?;
        let result = self
            .result_json
            .as_deref()
            .map(serde_json::from_str::<JsonValue>)
            .transpose()?;
        Ok(JobRow {
            id: JobId::try_new(self.id)?,
            revision: self.revision,
            kind: JobKind::parse(&self.kind)?,
            target_id: TargetId::try_new(self.target_id)?,
            status,
            input: serde_json::from_str(&self.input_json)?,
            partial: self.partial,
            result,
            error: self.error,
            cancel_reason: self.cancel_reason,
            runner: self.runner,
            created_at_ms: self.created_at_ms,
            updated_at_ms: self.updated_at_ms,
            completed_at_ms: self.completed_at_ms,
        })
    }
}

fn load_job(conn: &Connection, id: &JobId) -> Result<Option<JobRow>, StoreError> {
    let raw = conn
        .query_row(
            &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id=?1"),
            params![id.as_str()],
            read_raw_job,
        )
        .optional()?;
    raw.map(RawJobRow::into_row).transpose()
}

/// Fields written when a job reaches a terminal status.
struct Settle {
    status: JobStatus,
    result_json: Option<String>,
    error: Option<String>,
    cancel_reason: Option<String>,
}

impl SqliteStore {
    pub fn job_create(&mut self, request: JobCreateRequest) -> Result<JobRow, StoreError> {
        if !request.input.is_object() {
            return Err(StoreError::InvalidInput("job.input must be a JSON object"));
        }
        let input_json = serde_json::to_string(&request.input)?;
        if input_json.len() > MAX_JOB_INPUT_LEN {
            return Err(StoreError::InvalidInput("job.input is too large"));
        }

        let now_ms = now_ms();
        let tx = self.conn.transaction()?;
        let seq = next_counter_tx(&tx, "job_seq")?;
        let id = JobId::from_seq(seq);

        tx.execute(
            r#"
            INSERT INTO jobs(
              id, revision, kind, target_id, status, input_json, partial, result_json,
              error, cancel_reason, runner, created_at_ms, updated_at_ms, completed_at_ms
            )
            VALUES (?1, 0, ?2, ?3, ?4, ?5, NULL, NULL, NULL, NULL, NULL, ?6, ?6, NULL)
            "#,
            params![
                id.as_str(),
                request.kind.as_str(),
                request.target_id.as_str(),
                JobStatus::Pending.as_str(),
                input_json,
                now_ms,
            ],
        )?;
        tx.commit()?;

        Ok(JobRow {
            id,
            revision: 0,
            kind: request.kind,
            target_id: request.target_id,
            status: JobStatus::Pending,
            input: request.input,
            partial: None,
            result: None,
            error: None,
            cancel_reason: None,
            runner: None,
            created_at_ms: now_ms,
            updated_at_ms: now_ms,
            completed_at_ms: None,
        })
    }

    pub fn job_get(&self, id: &JobId) -> Result<Option<JobRow>, StoreError> {
        load_job(&self.conn, id)
    }

    /// Oldest first.
    pub fn jobs_list(&self, request: JobsListRequest) -> Result<JobsListResult, StoreError> {
        let limit = request.limit.clamp(1, MAX_LIST_LIMIT);

        let mut clauses = Vec::<String>::new();
        let mut args = Vec::<SqlValue>::new();
        if !request.statuses.is_empty() {
            let placeholders = vec!["?"; request.statuses.len()].join(", ");
            clauses.push(format!("status IN ({placeholders})"));
            args.extend(
                request
                    .statuses
                    .iter()
                    .map(|status| SqlValue::Text(status.as_str().to_string())),
            );
        }
        if let Some(kind) = request.kind {
            clauses.push("kind = ?".to_string());
            args.push(SqlValue::Text(kind.as_str().to_string()));
        }
        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", clauses.join(" AND "))
        };
        args.push(SqlValue::Integer((limit + 1) as i64));

        let mut stmt = self.conn.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs{where_sql} ORDER BY seq ASC LIMIT ?"
        ))?;
        let mut rows = stmt.query(params_from_iter(args))?;
        let mut jobs = Vec::new();
        while let Some(row) = rows.next()? {
            jobs.push(read_raw_job(row)?.into_row()?);
        }

        let has_more = jobs.len() > limit;
        jobs.truncate(limit);
        Ok(JobsListResult { jobs, has_more })
    }

    /// `pending -> running`, or an idempotent `running -> running` re-claim when allowed.
    pub fn job_claim(&mut self, request: JobClaimRequest) -> Result<JobClaimResult, StoreError> {
        let runner_id = normalize_runner_id(&request.runner_id)?;
        let now_ms = now_ms();
        let tx = self.conn.transaction()?;

        let Some(current) = load_job(&tx, &request.id)? else {
            return Err(StoreError::UnknownId);
        };
        let reclaimed = match current.status {
            JobStatus::Pending => false,
            JobStatus::Running if request.allow_running => true,
            status => {
                return Err(StoreError::JobNotClaimable {
                    job_id: request.id,
                    status,
                });
            }
        };
        current.status.validate_transition(JobStatus::Running)?;

        let next_rev = current.revision + 1;
        let changed = tx.execute(
            r#"
            UPDATE jobs
            SET revision=?2, status=?3, runner=?4, updated_at_ms=?5
            WHERE id=?1 AND revision=?6
            "#,
            params![
                request.id.as_str(),
                next_rev,
                JobStatus::Running.as_str(),
                runner_id,
                now_ms,
                current.revision,
            ],
        )?;
        if changed != 1 {
            return Err(StoreError::RevisionMismatch {
                expected: current.revision,
            });
        }
        let job = load_job(&tx, &request.id)?.ok_or(StoreError::UnknownId)?;
        tx.commit()?;
        Ok(JobClaimResult { job, reclaimed })
    }

    /// Overwrites the partial content of a running job. Returns whether a write happened.
    pub fn job_write_progress(&mut self, id: &JobId, partial: &str) -> Result<bool, StoreError> {
        let changed = self.conn.execute(
            r#"
            UPDATE jobs
            SET revision=revision+1, partial=?2, updated_at_ms=?3
            WHERE id=?1 AND status=?4
            "#,
            params![id.as_str(), partial, now_ms(), JobStatus::Running.as_str()],
        )?;
        Ok(changed == 1)
    }

    pub fn job_complete(&mut self, id: &JobId, result: &JsonValue) -> Result<JobRow, StoreError> {
        let result_json = serde_json::to_string(result)?;
        if result_json.len() > MAX_JOB_RESULT_LEN {
            return Err(StoreError::InvalidInput("job.result is too large"));
        }
        self.settle_job(
            id,
            Settle {
                status: JobStatus::Completed,
                result_json: Some(result_json),
                error: None,
                cancel_reason: None,
            },
        )
    }

    pub fn job_fail(&mut self, id: &JobId, error: &str) -> Result<JobRow, StoreError> {
        self.settle_job(
            id,
            Settle {
                status: JobStatus::Failed,
                result_json: None,
                error: Some(normalize_error(error)),
                cancel_reason: None,
            },
        )
    }

    pub fn job_cancel(&mut self, id: &JobId, reason: Option<&str>) -> Result<JobRow, StoreError> {
        self.settle_job(
            id,
            Settle {
                status: JobStatus::Cancelled,
                result_json: None,
                error: None,
                cancel_reason: normalize_reason(reason),
            },
        )
    }

    /// Deletes terminal jobs last touched before `older_than_ms`.
    pub fn jobs_purge_terminal(&mut self, older_than_ms: i64) -> Result<usize, StoreError> {
        let purged = self.conn.execute(
            "DELETE FROM jobs WHERE status IN (?1, ?2, ?3) AND updated_at_ms < ?4",
            params![
                JobStatus::Completed.as_str(),
                JobStatus::Failed.as_str(),
                JobStatus::Cancelled.as_str(),
                older_than_ms,
            ],
        )?;
        Ok(purged)
    }

    fn settle_job(&mut self, id: &JobId, settle: Settle) -> Result<JobRow, StoreError> {
        let now_ms = now_ms();
        let tx = self.conn.transaction()?;

        let Some(current) = load_job(&tx, id)? else {
            return Err(StoreError::UnknownId);
        };
        // Terminal records are immutable; repeating the same terminal status is a no-op.
        if current.status == settle.status {
            return Ok(current);
        }
        current.status.validate_transition(settle.status)?;

        let next_rev = current.revision + 1;
        let changed = tx.execute(
            r#"
            UPDATE jobs
            SET revision=?2, status=?3, result_json=?4, error=?5, cancel_reason=?6,
                updated_at_ms=?7, completed_at_ms=?7
            WHERE id=?1 AND revision=?8
            "#,
            params![
                id.as_str(),
                next_rev,
                settle.status.as_str(),
                settle.result_json,
                settle.error,
                settle.cancel_reason,
                now_ms,
                current.revision,
            ],
        )?;
        if changed != 1 {
            return Err(StoreError::RevisionMismatch {
                expected: current.revision,
            });
        }
        let job = load_job(&tx, id)?.ok_or(StoreError::UnknownId)?;
        tx.commit()?;
        Ok(job)
    }
}
