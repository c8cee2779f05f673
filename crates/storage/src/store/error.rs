#![forbid(unsafe_code)]

use tt_core::{IdError, JobId, JobStatus, TransitionError};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("sqlite: {0}")]
    Sql(#[from] rusqlite::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("time format: {0}")]
    TimeFormat(#[from] time::error::Format),
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),
    #[error("invalid id: {0}")]
    Id(#[from] IdError),
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error("unknown id")]
    UnknownId,
    #[error("revision mismatch (expected={expected})")]
    RevisionMismatch { expected: i64 },
    #[error("item already exists (id={0})")]
    ItemExists(String),
    #[error("job not claimable (job_id={job_id}, status={status})")]
    JobNotClaimable { job_id: JobId, status: JobStatus },
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Rejections caused by the record's current state rather than by I/O.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Self::Transition(_) | Self::JobNotClaimable { .. } | Self::ItemExists(_)
        )
    }
}
