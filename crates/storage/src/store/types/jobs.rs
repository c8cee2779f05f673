#![forbid(unsafe_code)]

use serde_json::Value as JsonValue;
use tt_core::{JobId, JobKind, JobStatus, TargetId};

#[derive(Clone, Debug, PartialEq)]
pub struct JobRow {
    pub id: JobId,
    pub revision: i64,
    pub kind: JobKind,
    pub target_id: TargetId,
    pub status: JobStatus,
    pub input: JsonValue,
    pub partial: Option<String>,
    pub result: Option<JsonValue>,
    pub error: Option<String>,
    pub cancel_reason: Option<String>,
    pub runner: Option<String>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
    pub completed_at_ms: Option<i64>,
}

impl JobRow {
    pub fn is_terminal(&self) -> bool {
        !self.status.is_active()
    }
}

#[derive(Clone, Debug)]
pub struct JobCreateRequest {
    pub kind: JobKind,
    pub target_id: TargetId,
    pub input: JsonValue,
}

#[derive(Clone, Debug)]
pub struct JobsListRequest {
    /// Empty means every status.
    pub statuses: Vec<JobStatus>,
    pub kind: Option<JobKind>,
    pub limit: usize,
}

impl JobsListRequest {
    pub fn active(limit: usize) -> Self {
        Self {
            statuses: vec![JobStatus::Pending, JobStatus::Running],
            kind: None,
            limit,
        }
    }
}

#[derive(Clone, Debug)]
pub struct JobsListResult {
    pub jobs: Vec<JobRow>,
    pub has_more: bool,
}

#[derive(Clone, Debug)]
pub struct JobClaimRequest {
    pub id: JobId,
    pub runner_id: String,
    /// Re-claim a job already `running` (a host restarted mid-execution).
    pub allow_running: bool,
}

#[derive(Clone, Debug)]
pub struct JobClaimResult {
    pub job: JobRow,
    pub reclaimed: bool,
}
