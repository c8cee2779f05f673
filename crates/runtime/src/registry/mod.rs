#![forbid(unsafe_code)]

//! Client-resident registry of in-flight operations.
//!
//! One operation per `"{kind}:{target}"` id: starting an id that is still in flight aborts the
//! previous entry first. Each entry is driven by its own task (create the job, then poll it)
//! and every task carries the entry's generation, so a superseded or aborted task can never
//! write into the entry that replaced it. Readers go through a cached [`RegistrySnapshot`]
//! that is rebuilt only after the map changed.

mod snapshot;


pub use snapshot::RegistrySnapshot;

use crate::api::JobApi;
use crate::config::RuntimeConfig;
use crate::error::{RuntimeError, RuntimeResult};
use crate::listeners::{Listeners, Subscription};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tt_core::{JobId, JobKind, JobStatus, OperationId, OperationStatus, TargetId, now_ms};
use tt_storage::OperationState;

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationMeta {
    pub kind: JobKind,
    pub target_id: TargetId,
    pub started_at_ms: i64,
    pub job_id: Option<JobId>,
    /// Free-form caller context, carried untouched.
    pub context: Option<JsonValue>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationErrorKind {
    /// The job ran and failed (provider or parse error).
    Provider,
    /// No terminal status within the poll budget.
    Timeout,
    /// The job disappeared from its host.
    NotFound,
    /// The job could not be created.
    Request,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct OperationError {
    pub kind: OperationErrorKind,
    pub message: String,
}

impl OperationError {
    pub fn new(kind: OperationErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for OperationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    pub id: OperationId,
    pub status: OperationStatus,
    pub meta: OperationMeta,
    pub result: Option<JsonValue>,
    pub error: Option<OperationError>,
}

impl Operation {
    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }
}

pub type OperationCallback = Box<dyn FnOnce(&Operation) + Send>;

pub struct StartRequest {
    pub kind: JobKind,
    pub target_id: TargetId,
    pub input: JsonValue,
    pub context: Option<JsonValue>,
    on_complete: Option<OperationCallback>,
    on_error: Option<OperationCallback>,
}

impl StartRequest {
    pub fn new(kind: JobKind, target_id: TargetId, input: JsonValue) -> Self {
        Self {
            kind,
            target_id,
            input,
            context: None,
            on_complete: None,
            on_error: None,
        }
    }

    pub fn with_context(mut self, context: JsonValue) -> Self {
        self.context = Some(context);
        self
    }

    pub fn on_complete(mut self, callback: impl FnOnce(&Operation) + Send + 'static) -> Self {
        self.on_complete = Some(Box::new(callback));
        self
    }

    pub fn on_error(mut self, callback: impl FnOnce(&Operation) + Send + 'static) -> Self {
        self.on_error = Some(Box::new(callback));
        self
    }
}

impl fmt::Debug for StartRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StartRequest")
            .field("kind", &self.kind)
            .field("target_id", &self.target_id)
            .field("context", &self.context)
            .field("on_complete", &self.on_complete.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish_non_exhaustive()
    }
}

/// Saves a completed job's result durably. Runs before the caller's completion callback.
#[async_trait]
pub trait CompletionPersister: Send + Sync {
    async fn persist(&self, operation: &Operation, result: &JsonValue) -> RuntimeResult<()>;
}

/// Keeps the in-progress state next to the target's domain data.
#[async_trait]
pub trait OperationStateSink: Send + Sync {
    async fn record(&self, target_id: &TargetId, state: OperationState) -> RuntimeResult<()>;

    /// Drops the state only while it still belongs to `job_id`.
    async fn clear(&self, target_id: &TargetId, job_id: &JobId) -> RuntimeResult<()>;
}

/// Emitted on every registry change. `status == None` means the entry was removed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegistryChange {
    pub operation_id: OperationId,
    pub status: Option<OperationStatus>,
}

struct Entry {
    operation: Operation,
    generation: u64,
    abort: CancellationToken,
    on_complete: Option<OperationCallback>,
    on_error: Option<OperationCallback>,
}

#[derive(Default)]
struct State {
    entries: HashMap<OperationId, Entry>,
    next_generation: u64,
    snapshot: Option<Arc<RegistrySnapshot>>,
}

impl State {
    fn bump_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    /// The entry, only while it still belongs to `generation` and is in flight.
    fn live_mut(&mut self, id: &OperationId, generation: u64) -> Option<&mut Entry> {
        self.entries
            .get_mut(id)
            .filter(|entry| entry.generation == generation && entry.operation.is_active())
    }
}

struct Inner {
    api: Arc<dyn JobApi>,
    config: RuntimeConfig,
    state: Mutex<State>,
    persisters: Mutex<HashMap<JobKind, Arc<dyn CompletionPersister>>>,
    state_sink: Mutex<Option<Arc<dyn OperationStateSink>>>,
    listeners: Listeners<RegistryChange>,
    initialized: AtomicBool,
}

/// Explicit service object: construct once per process and share by cloning.
/// `start` and `abort` spawn tasks and must run inside a Tokio runtime.
#[derive(Clone)]
pub struct OperationRegistry {
    inner: Arc<Inner>,
}

impl fmt::Debug for OperationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationRegistry")
            .field("config", &self.inner.config)
            .field("operations", &self.snapshot().len())
            .finish_non_exhaustive()
    }
}

impl OperationRegistry {
    pub fn new(api: Arc<dyn JobApi>, config: RuntimeConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                api,
                config,
                state: Mutex::new(State::default()),
                persisters: Mutex::new(HashMap::new()),
                state_sink: Mutex::new(None),
                listeners: Listeners::new(),
                initialized: AtomicBool::new(false),
            }),
        }
    }

    /// Replaces the persister previously registered for `kind`.
    pub fn register_persister(&self, kind: JobKind, persister: Arc<dyn CompletionPersister>) {
        self.inner
            .persisters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(kind, persister);
    }

    pub fn set_state_sink(&self, sink: Arc<dyn OperationStateSink>) {
        *self
            .inner
            .state_sink
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(sink);
    }

    pub fn subscribe(&self, listener: impl Fn(&RegistryChange) + Send + Sync + 'static) -> Subscription {
        self.inner.listeners.subscribe(listener)
    }

    /// Submits a job for `request.target_id` and starts tracking it. Returns without waiting.
    pub fn start(&self, request: StartRequest) -> RuntimeResult<OperationId> {
        if !request.input.is_object() {
            return Err(RuntimeError::InvalidRequest(
                "operation input must be a JSON object".to_string(),
            ));
        }
        let StartRequest {
            kind,
            target_id,
            input,
            context,
            on_complete,
            on_error,
        } = request;
        let id = OperationId::for_target(kind, &target_id);

        let abort = CancellationToken::new();
        let (generation, superseded) = {
            let mut state = self.lock_state();
            let superseded = take_for_abort(&mut state, &id);
            let generation = state.bump_generation();
            state.entries.insert(
                id.clone(),
                Entry {
                    operation: Operation {
                        id: id.clone(),
                        status: OperationStatus::Pending,
                        meta: OperationMeta {
                            kind,
                            target_id: target_id.clone(),
                            started_at_ms: now_ms(),
                            job_id: None,
                            context,
                        },
                        result: None,
                        error: None,
                    },
                    generation,
                    abort: abort.clone(),
                    on_complete,
                    on_error,
                },
            );
            state.snapshot = None;
            (generation, superseded)
        };

        if let Some(aborted) = superseded {
            info!(operation_id = %id, "superseding in-flight operation");
            self.notify(&id, Some(OperationStatus::Aborted));
            self.after_abort(aborted);
        }
        self.notify(&id, Some(OperationStatus::Pending));
        info!(operation_id = %id, kind = %kind, target_id = %target_id, "operation started");

        let registry = self.clone();
        let task_id = id.clone();
        tokio::spawn(async move {
            registry
                .drive(task_id, generation, kind, target_id, input, abort)
                .await;
        });
        Ok(id)
    }

    /// Marks an in-flight operation `aborted`, tears down its local task and sends a
    /// best-effort cancel for its job. Returns `false` when nothing was in flight.
    pub fn abort(&self, id: &OperationId) -> bool {
        let aborted = {
            let mut state = self.lock_state();
            let aborted = take_for_abort(&mut state, id);
            if aborted.is_some() {
                state.snapshot = None;
            }
            aborted
        };
        let Some(aborted) = aborted else {
            return false;
        };
        info!(operation_id = %id, "operation aborted");
        self.notify(id, Some(OperationStatus::Aborted));
        self.after_abort(aborted);
        true
    }

    pub fn get(&self, id: &OperationId) -> Option<Operation> {
        self.snapshot().get(id).cloned()
    }

    pub fn is_active(&self, id: &OperationId) -> bool {
        self.snapshot().is_active(id)
    }

    pub fn has_active_of_type(&self, kind: JobKind) -> bool {
        self.snapshot().has_active_of_type(kind)
    }

    pub fn active_ids_of_type(&self, kind: JobKind) -> BTreeSet<TargetId> {
        self.snapshot().active_ids_of_type(kind).clone()
    }

    /// Cached view; the same `Arc` is returned until the registry changes.
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        let mut state = self.lock_state();
        if let Some(snapshot) = state.snapshot.as_ref() {
            return Arc::clone(snapshot);
        }
        let snapshot = Arc::new(RegistrySnapshot::build(
            state.entries.values().map(|entry| &entry.operation),
        ));
        state.snapshot = Some(Arc::clone(&snapshot));
        snapshot
    }

    /// Reattaches to every job still `pending`/`running` on the host. Runs its recovery once;
    /// later calls return `Ok(0)`. A failed listing re-arms it.
    pub async fn initialize(&self) -> RuntimeResult<usize> {
        if self.inner.initialized.swap(true, Ordering::SeqCst) {
            return Ok(0);
        }
        let jobs = match self
            .inner
            .api
            .list(&[JobStatus::Pending, JobStatus::Running])
            .await
        {
            Ok(jobs) => jobs,
            Err(err) => {
                self.inner.initialized.store(false, Ordering::SeqCst);
                return Err(err);
            }
        };

        let mut recovered = 0;
        // Newest first, so the latest job wins when one target has several.
        for view in jobs.into_iter().rev() {
            let id = OperationId::for_target(view.kind, &view.target_id);
            let abort = CancellationToken::new();
            let generation = {
                let mut state = self.lock_state();
                if state
                    .entries
                    .get(&id)
                    .is_some_and(|entry| entry.operation.is_active())
                {
                    continue;
                }
                let generation = state.bump_generation();
                state.entries.insert(
                    id.clone(),
                    Entry {
                        operation: Operation {
                            id: id.clone(),
                            status: view.status.into(),
                            meta: OperationMeta {
                                kind: view.kind,
                                target_id: view.target_id.clone(),
                                started_at_ms: view.created_at_ms,
                                job_id: Some(view.job_id.clone()),
                                context: None,
                            },
                            result: None,
                            error: None,
                        },
                        generation,
                        abort: abort.clone(),
                        on_complete: None,
                        on_error: None,
                    },
                );
                state.snapshot = None;
                generation
            };
            recovered += 1;
            info!(operation_id = %id, job_id = %view.job_id, "reattached to job");
            self.notify(&id, Some(view.status.into()));

            let registry = self.clone();
            let job_id = view.job_id;
            tokio::spawn(async move {
                registry.poll(id, generation, job_id, abort).await;
            });
        }
        Ok(recovered)
    }

    async fn drive(
        &self,
        id: OperationId,
        generation: u64,
        kind: JobKind,
        target_id: TargetId,
        input: JsonValue,
        abort: CancellationToken,
    ) {
        let job_id = match self.inner.api.create(kind, &target_id, input).await {
            Ok(job_id) => job_id,
            Err(err) => {
                warn!(operation_id = %id, error = %err, "job creation failed");
                let error = OperationError::new(OperationErrorKind::Request, err.to_string());
                self.finish_failed(&id, generation, error).await;
                return;
            }
        };

        let bound = {
            let mut state = self.lock_state();
            match state.live_mut(&id, generation) {
                Some(entry) => {
                    entry.operation.meta.job_id = Some(job_id.clone());
                    let started_at = entry.operation.meta.started_at_ms;
                    state.snapshot = None;
                    Some(started_at)
                }
                None => None,
            }
        };
        let Some(started_at) = bound else {
            // Aborted or superseded while the create request was in flight.
            debug!(operation_id = %id, job_id = %job_id, "cancelling job of aborted operation");
            self.cancel_remote(&job_id).await;
            return;
        };
        debug!(operation_id = %id, job_id = %job_id, "job bound to operation");
        self.notify(&id, Some(OperationStatus::Pending));
        self.record_state(
            &target_id,
            OperationState {
                job_id: job_id.clone(),
                status: OperationStatus::Pending,
                started_at,
            },
        )
        .await;

        self.poll(id, generation, job_id, abort).await;
    }

    async fn poll(&self, id: OperationId, generation: u64, job_id: JobId, abort: CancellationToken) {
        let deadline = Instant::now() + self.inner.config.max_poll_duration();
        let mut ticker = tokio::time::interval(self.inner.config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = abort.cancelled() => return,
                _ = ticker.tick() => {}
            }
            if Instant::now() >= deadline {
                let error = OperationError::new(
                    OperationErrorKind::Timeout,
                    format!(
                        "no result after {}s",
                        self.inner.config.max_poll_duration().as_secs()
                    ),
                );
                self.finish_failed(&id, generation, error).await;
                return;
            }

            let view = tokio::select! {
                _ = abort.cancelled() => return,
                view = self.inner.api.status(&job_id) => view,
            };
            let view = match view {
                Ok(Some(view)) => view,
                Ok(None) => {
                    let error = OperationError::new(
                        OperationErrorKind::NotFound,
                        format!("job {job_id} no longer exists"),
                    );
                    self.finish_failed(&id, generation, error).await;
                    return;
                }
                Err(err) => {
                    warn!(operation_id = %id, job_id = %job_id, error = %err, "poll failed; retrying");
                    continue;
                }
            };
            debug!(operation_id = %id, job_id = %job_id, status = %view.status, "poll");

            match view.status {
                JobStatus::Pending => {}
                JobStatus::Running => self.mark_running(&id, generation, &job_id).await,
                JobStatus::Completed => {
                    let result = view.result.unwrap_or(JsonValue::Null);
                    self.finish_completed(&id, generation, result).await;
                    return;
                }
                JobStatus::Failed => {
                    let message = view
                        .error
                        .filter(|error| !error.trim().is_empty())
                        .unwrap_or_else(|| "job failed".to_string());
                    let error = OperationError::new(OperationErrorKind::Provider, message);
                    self.finish_failed(&id, generation, error).await;
                    return;
                }
                JobStatus::Cancelled => {
                    self.finish_cancelled(&id, generation).await;
                    return;
                }
            }
        }
    }

    async fn mark_running(&self, id: &OperationId, generation: u64, job_id: &JobId) {
        let changed = {
            let mut state = self.lock_state();
            match state.live_mut(id, generation) {
                Some(entry) if entry.operation.status != OperationStatus::Running => {
                    entry.operation.status = OperationStatus::Running;
                    let target = entry.operation.meta.target_id.clone();
                    let started_at = entry.operation.meta.started_at_ms;
                    state.snapshot = None;
                    Some((target, started_at))
                }
                _ => None,
            }
        };
        let Some((target_id, started_at)) = changed else {
            return;
        };
        self.notify(id, Some(OperationStatus::Running));
        self.record_state(
            &target_id,
            OperationState {
                job_id: job_id.clone(),
                status: OperationStatus::Running,
                started_at,
            },
        )
        .await;
    }

    async fn finish_completed(&self, id: &OperationId, generation: u64, result: JsonValue) {
        let Some(operation) = self.live_operation(id, generation) else {
            return;
        };

        // Durable persistence first, so the result survives an unreachable caller callback.
        let persister = self
            .inner
            .persisters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&operation.meta.kind)
            .cloned();
        if let Some(persister) = persister {
            if let Err(err) = persister.persist(&operation, &result).await {
                warn!(operation_id = %id, error = %err, "completion persister failed");
            }
        }

        let settled = {
            let mut state = self.lock_state();
            match state.live_mut(id, generation) {
                Some(entry) => {
                    entry.operation.status = OperationStatus::Completed;
                    entry.operation.result = Some(result);
                    entry.on_error = None;
                    let callback = entry.on_complete.take();
                    let operation = entry.operation.clone();
                    state.snapshot = None;
                    Some((operation, callback))
                }
                None => None,
            }
        };
        let Some((operation, callback)) = settled else {
            return;
        };
        info!(operation_id = %id, "operation completed");
        self.notify(id, Some(OperationStatus::Completed));
        if let Some(callback) = callback {
            callback(&operation);
        }
        self.clear_state(&operation.meta.target_id, operation.meta.job_id.as_ref())
            .await;
        self.schedule_cleanup(id.clone(), generation);
    }

    async fn finish_failed(&self, id: &OperationId, generation: u64, error: OperationError) {
        let settled = {
            let mut state = self.lock_state();
            match state.live_mut(id, generation) {
                Some(entry) => {
                    entry.operation.status = OperationStatus::Failed;
                    entry.operation.error = Some(error);
                    entry.on_complete = None;
                    let callback = entry.on_error.take();
                    let operation = entry.operation.clone();
                    state.snapshot = None;
                    Some((operation, callback))
                }
                None => None,
            }
        };
        let Some((operation, callback)) = settled else {
            return;
        };
        if let Some(error) = operation.error.as_ref() {
            warn!(operation_id = %id, error_kind = ?error.kind, error = %error, "operation failed");
        }
        self.notify(id, Some(OperationStatus::Failed));
        if let Some(callback) = callback {
            callback(&operation);
        }
        self.clear_state(&operation.meta.target_id, operation.meta.job_id.as_ref())
            .await;
        self.schedule_cleanup(id.clone(), generation);
    }

    /// Cancelled on the host (possibly by another process). Not an error: no callbacks fire.
    async fn finish_cancelled(&self, id: &OperationId, generation: u64) {
        let settled = {
            let mut state = self.lock_state();
            match state.live_mut(id, generation) {
                Some(entry) => {
                    entry.operation.status = OperationStatus::Cancelled;
                    entry.on_complete = None;
                    entry.on_error = None;
                    let meta = entry.operation.meta.clone();
                    state.snapshot = None;
                    Some(meta)
                }
                None => None,
            }
        };
        let Some(meta) = settled else {
            return;
        };
        info!(operation_id = %id, "operation cancelled by host");
        self.notify(id, Some(OperationStatus::Cancelled));
        self.clear_state(&meta.target_id, meta.job_id.as_ref()).await;
        self.schedule_cleanup(id.clone(), generation);
    }

    fn after_abort(&self, aborted: Aborted) {
        let registry = self.clone();
        tokio::spawn(async move {
            if let Some(job_id) = aborted.job_id.as_ref() {
                registry.cancel_remote(job_id).await;
            }
            registry
                .clear_state(&aborted.target_id, aborted.job_id.as_ref())
                .await;
        });
        self.schedule_cleanup(aborted.id, aborted.generation);
    }

    async fn cancel_remote(&self, job_id: &JobId) {
        match self.inner.api.cancel(job_id).await {
            Ok(cancelled) => debug!(job_id = %job_id, cancelled, "remote cancel sent"),
            Err(err) => warn!(job_id = %job_id, error = %err, "remote cancel failed"),
        }
    }

    fn schedule_cleanup(&self, id: OperationId, generation: u64) {
        let registry = self.clone();
        let delay = self.inner.config.cleanup_delay();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let removed = {
                let mut state = registry.lock_state();
                let owned = state
                    .entries
                    .get(&id)
                    .is_some_and(|entry| entry.generation == generation && !entry.operation.is_active());
                if owned {
                    state.entries.remove(&id);
                    state.snapshot = None;
                }
                owned
            };
            if removed {
                debug!(operation_id = %id, "operation removed");
                registry.notify(&id, None);
            }
        });
    }

    fn state_sink(&self) -> Option<Arc<dyn OperationStateSink>> {
        self.inner
            .state_sink
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn record_state(&self, target_id: &TargetId, state: OperationState) {
        let Some(sink) = self.state_sink() else {
            return;
        };
        if let Err(err) = sink.record(target_id, state).await {
            warn!(target_id = %target_id, error = %err, "operation state write failed");
        }
    }

    /// Operations that never got a job wrote no state, so there is nothing to clear.
    async fn clear_state(&self, target_id: &TargetId, job_id: Option<&JobId>) {
        let (Some(sink), Some(job_id)) = (self.state_sink(), job_id) else {
            return;
        };
        if let Err(err) = sink.clear(target_id, job_id).await {
            warn!(target_id = %target_id, job_id = %job_id, error = %err, "operation state clear failed");
        }
    }

    fn live_operation(&self, id: &OperationId, generation: u64) -> Option<Operation> {
        self.lock_state()
            .live_mut(id, generation)
            .map(|entry| entry.operation.clone())
    }

    fn notify(&self, id: &OperationId, status: Option<OperationStatus>) {
        self.inner.listeners.notify(&RegistryChange {
            operation_id: id.clone(),
            status,
        });
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct Aborted {
    id: OperationId,
    generation: u64,
    job_id: Option<JobId>,
    target_id: TargetId,
}

/// Flips an in-flight entry to `aborted`, fires its local abort signal and drops its callbacks.
fn take_for_abort(state: &mut State, id: &OperationId) -> Option<Aborted> {
    let entry = state
        .entries
        .get_mut(id)
        .filter(|entry| entry.operation.is_active())?;
    entry.operation.status = OperationStatus::Aborted;
    entry.abort.cancel();
    entry.on_complete = None;
    entry.on_error = None;
    Some(Aborted {
        id: id.clone(),
        generation: entry.generation,
        job_id: entry.operation.meta.job_id.clone(),
        target_id: entry.operation.meta.target_id.clone(),
    })
}
