#![forbid(unsafe_code)]

use crate::api::{JobApi, JobStatusView, LocalJobHost};
use crate::error::{RuntimeError, RuntimeResult};
use crate::provider::{CompletionProvider, CompletionRequest, ProviderEvent, ProviderStream};
use crate::store::SharedStore;
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tt_core::{JobId, JobKind, JobStatus, TargetId};
use tt_storage::JobClaimRequest;

#[derive(Clone, Debug)]
pub enum Step {
    Emit(ProviderEvent),
    Sleep(Duration),
    /// Blocks until the request is cancelled.
    Hang,
}

pub fn delta(text: &str) -> Step {
    Step::Emit(ProviderEvent::Delta(text.to_string()))
}

pub fn done() -> Step {
    Step::Emit(ProviderEvent::Done)
}

/// Plays one queued script per `stream` call.
#[derive(Clone, Default)]
pub struct ScriptedProvider {
    scripts: Arc<Mutex<VecDeque<Vec<Step>>>>,
    requests: Arc<Mutex<Vec<CompletionRequest>>>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, steps: Vec<Step>) -> &Self {
        self.scripts.lock().expect("scripts lock").push_back(steps);
        self
    }

    pub fn reply(&self, text: &str) -> &Self {
        self.push(vec![delta(text), done()])
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().expect("requests lock").clone()
    }
}

#[async_trait]
impl CompletionProvider for ScriptedProvider {
    async fn stream(
        &self,
        request: CompletionRequest,
        cancel: CancellationToken,
    ) -> RuntimeResult<ProviderStream> {
        self.requests.lock().expect("requests lock").push(request);
        let steps = self
            .scripts
            .lock()
            .expect("scripts lock")
            .pop_front()
            .ok_or_else(|| RuntimeError::Provider("no scripted response".to_string()))?;

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            for step in steps {
                match step {
                    Step::Emit(event) => {
                        if tx.send(event).await.is_err() {
                            return;
                        }
                    }
                    Step::Sleep(duration) => {
                        tokio::select! {
                            _ = cancel.cancelled() => return,
                            _ = tokio::time::sleep(duration) => {}
                        }
                    }
                    Step::Hang => {
                        cancel.cancelled().await;
                        return;
                    }
                }
            }
        });
        Ok(rx)
    }
}

/// A `LocalJobHost` without executor whose status reads can be made to fail, and whose
/// jobs are settled by the test through the store.
#[derive(Clone)]
pub struct ManualJobApi {
    pub host: LocalJobHost,
    pub store: SharedStore,
    status_failures: Arc<AtomicUsize>,
    create_failures: Arc<AtomicUsize>,
    cancel_delay: Arc<Mutex<Duration>>,
    pub cancel_calls: Arc<Mutex<Vec<JobId>>>,
}

impl ManualJobApi {
    pub fn new() -> Self {
        let store = SharedStore::in_memory().expect("in-memory store");
        Self {
            host: LocalJobHost::new(store.clone()),
            store,
            status_failures: Arc::new(AtomicUsize::new(0)),
            create_failures: Arc::new(AtomicUsize::new(0)),
            cancel_delay: Arc::new(Mutex::new(Duration::ZERO)),
            cancel_calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn fail_next_status_reads(&self, count: usize) {
        self.status_failures.store(count, Ordering::SeqCst);
    }

    pub fn fail_next_creates(&self, count: usize) {
        self.create_failures.store(count, Ordering::SeqCst);
    }

    /// Every later cancel request answers only after `delay`.
    pub fn delay_cancels(&self, delay: Duration) {
        *self.cancel_delay.lock().expect("delay lock") = delay;
    }

    pub fn cancelled(&self) -> Vec<JobId> {
        self.cancel_calls.lock().expect("cancel lock").clone()
    }

    pub fn claim(&self, job_id: &JobId) {
        self.store
            .with(|store| {
                store.job_claim(JobClaimRequest {
                    id: job_id.clone(),
                    runner_id: "test".to_string(),
                    allow_running: false,
                })
            })
            .expect("claim job");
    }

    pub fn complete(&self, job_id: &JobId, result: JsonValue) {
        self.store
            .with(|store| store.job_complete(job_id, &result))
            .expect("complete job");
    }

    pub fn fail(&self, job_id: &JobId, error: &str) {
        self.store
            .with(|store| store.job_fail(job_id, error))
            .expect("fail job");
    }

    pub fn only_job(&self) -> JobId {
        let jobs = self
            .store
            .with(|store| store.jobs_list(tt_storage::JobsListRequest::active(10)))
            .expect("list jobs")
            .jobs;
        assert_eq!(jobs.len(), 1, "expected exactly one active job");
        jobs[0].id.clone()
    }

    pub fn job_status(&self, job_id: &JobId) -> JobStatus {
        self.store
            .with(|store| store.job_get(job_id))
            .expect("read job")
            .expect("job exists")
            .status
    }
}

fn take_failure(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl JobApi for ManualJobApi {
    async fn create(
        &self,
        kind: JobKind,
        target_id: &TargetId,
        input: JsonValue,
    ) -> RuntimeResult<JobId> {
        if take_failure(&self.create_failures) {
            return Err(RuntimeError::Transport("connection refused".to_string()));
        }
        self.host.create(kind, target_id, input).await
    }

    async fn status(&self, job_id: &JobId) -> RuntimeResult<Option<JobStatusView>> {
        if take_failure(&self.status_failures) {
            return Err(RuntimeError::Transport("connection reset".to_string()));
        }
        self.host.status(job_id).await
    }

    async fn list(&self, statuses: &[JobStatus]) -> RuntimeResult<Vec<JobStatusView>> {
        self.host.list(statuses).await
    }

    async fn cancel(&self, job_id: &JobId) -> RuntimeResult<bool> {
        self.cancel_calls
            .lock()
            .expect("cancel lock")
            .push(job_id.clone());
        let delay = *self.cancel_delay.lock().expect("delay lock");
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.host.cancel(job_id).await
    }
}

pub fn target(raw: &str) -> TargetId {
    TargetId::try_new(raw).expect("valid target id")
}
