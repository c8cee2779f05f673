#![forbid(unsafe_code)]

//! Request/response surface of a job host: create, read, list, cancel.

use crate::cancellation::SessionRegistry;
use crate::error::{RuntimeError, RuntimeResult};
use crate::executor::JobExecutor;
use crate::store::SharedStore;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::{debug, info};
use tt_core::{JobId, JobKind, JobStatus, TargetId};
use tt_storage::{JobCreateRequest, JobRow, JobsListRequest, StoreError};

const LIST_LIMIT: usize = 500;
const CANCEL_REASON: &str = "cancelled by request";

/// What a poller sees of a job.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusView {
    pub job_id: JobId,
    pub kind: JobKind,
    pub target_id: TargetId,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<JsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partial: Option<String>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

impl From<JobRow> for JobStatusView {
    fn from(row: JobRow) -> Self {
        Self {
            job_id: row.id,
            kind: row.kind,
            target_id: row.target_id,
            status: row.status,
            result: row.result,
            error: row.error,
            partial: row.partial,
            created_at_ms: row.created_at_ms,
            updated_at_ms: row.updated_at_ms,
        }
    }
}

#[async_trait]
pub trait JobApi: Send + Sync {
    async fn create(
        &self,
        kind: JobKind,
        target_id: &TargetId,
        input: JsonValue,
    ) -> RuntimeResult<JobId>;

    /// `None` when the job is unknown to the host.
    async fn status(&self, job_id: &JobId) -> RuntimeResult<Option<JobStatusView>>;

    /// Oldest first. An empty filter lists every status.
    async fn list(&self, statuses: &[JobStatus]) -> RuntimeResult<Vec<JobStatusView>>;

    /// Best-effort. Returns whether the job is now `cancelled`.
    async fn cancel(&self, job_id: &JobId) -> RuntimeResult<bool>;
}

/// In-process host backed by the store. With an executor attached, every created job starts
/// executing right away; without one, jobs wait for an out-of-process runner.
#[derive(Clone, Debug)]
pub struct LocalJobHost {
    store: SharedStore,
    executor: Option<JobExecutor>,
    sessions: SessionRegistry,
}

impl LocalJobHost {
    pub fn new(store: SharedStore) -> Self {
        Self {
            store,
            executor: None,
            sessions: SessionRegistry::new(),
        }
    }

    pub fn with_executor(executor: JobExecutor) -> Self {
        Self {
            store: executor.store().clone(),
            sessions: executor.sessions().clone(),
            executor: Some(executor),
        }
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }
}

#[async_trait]
impl JobApi for LocalJobHost {
    async fn create(
        &self,
        kind: JobKind,
        target_id: &TargetId,
        input: JsonValue,
    ) -> RuntimeResult<JobId> {
        if !input.is_object() {
            return Err(RuntimeError::InvalidRequest(
                "job input must be a JSON object".to_string(),
            ));
        }
        let job = self.store.with(|store| {
            store.job_create(JobCreateRequest {
                kind,
                target_id: target_id.clone(),
                input,
            })
        })?;
        info!(job_id = %job.id, kind = %kind, target_id = %target_id, "job created");

        if let Some(executor) = self.executor.as_ref() {
            drop(executor.spawn(job.id.clone()));
        }
        Ok(job.id)
    }

    async fn status(&self, job_id: &JobId) -> RuntimeResult<Option<JobStatusView>> {
        let job_id = job_id.clone();
        let job = self.store.run(move |store| store.job_get(&job_id)).await?;
        Ok(job.map(JobStatusView::from))
    }

    async fn list(&self, statuses: &[JobStatus]) -> RuntimeResult<Vec<JobStatusView>> {
        let listed = self.store.with(|store| {
            store.jobs_list(JobsListRequest {
                statuses: statuses.to_vec(),
                kind: None,
                limit: LIST_LIMIT,
            })
        })?;
        if listed.has_more {
            debug!(limit = LIST_LIMIT, "job list truncated");
        }
        Ok(listed.jobs.into_iter().map(JobStatusView::from).collect())
    }

    async fn cancel(&self, job_id: &JobId) -> RuntimeResult<bool> {
        if let Some(executor) = self.executor.as_ref() {
            return executor.cancel(job_id, Some(CANCEL_REASON));
        }
        let cancelled = match self
            .store
            .with(|store| store.job_cancel(job_id, Some(CANCEL_REASON)))
        {
            Ok(row) => row.status == JobStatus::Cancelled,
            Err(RuntimeError::Store(StoreError::UnknownId | StoreError::Transition(_))) => false,
            Err(err) => return Err(err),
        };
        self.sessions.cancel(job_id);
        Ok(cancelled)
    }
}
