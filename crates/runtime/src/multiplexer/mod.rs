#![forbid(unsafe_code)]

//! Per-stream live state merged from two channels: push events from a locally consumed
//! provider stream, and periodic durable snapshots of job-backed streams.

mod merge;

#[cfg(test)]
mod tests;

use crate::api::JobApi;
use crate::buffer::{BufferedWriter, StreamPlaceholderSink, with_interruption_marker};
use crate::config::RuntimeConfig;
use crate::error::RuntimeError;
use crate::listeners::{Listeners, Subscription};
use crate::provider::{CompletionProvider, CompletionRequest, ProviderEvent};
use crate::store::SharedStore;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tt_core::{JobId, StreamId, StreamStatus, ToolCall, ToolCallStatus, now_ms};
use tt_storage::{StreamMessageInput, StreamSnapshot};

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamState {
    pub stream_id: StreamId,
    pub status: StreamStatus,
    /// Everything received so far.
    pub content: String,
    /// Suffix of `content` not yet written to durable storage.
    pub streaming_buffer: String,
    pub tool_calls: Vec<ToolCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at_ms: i64,
    pub updated_at_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at_ms: Option<i64>,
    /// Durable revision at which a direct run began. Snapshots older than this are earlier turns.
    #[serde(skip)]
    begun_at_revision: Option<i64>,
    /// Message id a direct run's final content is stored under.
    #[serde(skip)]
    final_message_id: Option<String>,
}

impl StreamState {
    fn new(stream_id: StreamId, job_id: Option<JobId>, status: StreamStatus) -> Self {
        let now = now_ms();
        Self {
            stream_id,
            status,
            content: String::new(),
            streaming_buffer: String::new(),
            tool_calls: Vec::new(),
            job_id,
            error: None,
            started_at_ms: now,
            updated_at_ms: now,
            completed_at_ms: None,
            begun_at_revision: None,
            final_message_id: None,
        }
    }

    /// Binds a direct run to the durable record it writes.
    fn anchor(&mut self, begun_at_revision: i64, final_message_id: String) {
        self.begun_at_revision = Some(begun_at_revision);
        self.final_message_id = Some(final_message_id);
    }

    pub fn is_live(&self) -> bool {
        merge::is_live(self.status)
    }
}

#[derive(Clone, Debug)]
pub enum StreamSource {
    /// Consume a provider stream in this process.
    Direct(CompletionRequest),
    /// Follow a job that streams into durable storage elsewhere.
    Job(JobId),
}

#[derive(Clone, Debug)]
pub struct StreamRequest {
    pub stream_id: StreamId,
    pub source: StreamSource,
}

struct StreamEntry {
    state: StreamState,
    generation: u64,
    stop: CancellationToken,
}

#[derive(Default)]
struct MuxState {
    next_generation: u64,
    streams: HashMap<StreamId, StreamEntry>,
}

struct MuxInner {
    store: SharedStore,
    api: Arc<dyn JobApi>,
    provider: Arc<dyn CompletionProvider>,
    config: RuntimeConfig,
    state: Mutex<MuxState>,
    listeners: Mutex<HashMap<StreamId, Listeners<StreamState>>>,
    activity: Listeners<StreamState>,
}

impl MuxInner {
    fn prune_listeners(&self, stream_id: &StreamId) {
        let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        if listeners.get(stream_id).is_some_and(|slot| slot.is_empty()) {
            listeners.remove(stream_id);
        }
    }
}

/// Which run an update belongs to; public merge calls target whatever run is current.
#[derive(Clone, Copy)]
enum Run {
    Current,
    Generation(u64),
}

enum DirectEnd {
    Done,
    Failed(String),
    Stopped,
}

#[derive(Clone)]
pub struct StreamMultiplexer {
    inner: Arc<MuxInner>,
}

impl StreamMultiplexer {
    pub fn new(
        store: SharedStore,
        api: Arc<dyn JobApi>,
        provider: Arc<dyn CompletionProvider>,
        config: RuntimeConfig,
    ) -> Self {
        Self {
            inner: Arc::new(MuxInner {
                store,
                api,
                provider,
                config,
                state: Mutex::new(MuxState::default()),
                listeners: Mutex::new(HashMap::new()),
                activity: Listeners::new(),
            }),
        }
    }

    /// Starts following a stream. A stream that is already live is returned as is.
    pub fn start_stream(&self, request: StreamRequest) -> StreamState {
        let StreamRequest { stream_id, source } = request;
        let (state, generation, stop) = {
            let mut mux = self.lock();
            if let Some(entry) = mux.streams.get(&stream_id).filter(|entry| entry.state.is_live()) {
                return entry.state.clone();
            }
            mux.next_generation += 1;
            let generation = mux.next_generation;
            let (job_id, status) = match &source {
                StreamSource::Direct(_) => (None, StreamStatus::Streaming),
                StreamSource::Job(job_id) => (Some(job_id.clone()), StreamStatus::Pending),
            };
            let state = StreamState::new(stream_id.clone(), job_id, status);
            let stop = CancellationToken::new();
            mux.streams.insert(
                stream_id.clone(),
                StreamEntry {
                    state: state.clone(),
                    generation,
                    stop: stop.clone(),
                },
            );
            (state, generation, stop)
        };
        tracing::debug!(stream_id = %stream_id, generation, "stream started");
        self.notify(&state);

        let mux = self.clone();
        match source {
            StreamSource::Direct(completion) => {
                tokio::spawn(async move {
                    mux.run_direct(stream_id, generation, completion, stop).await;
                });
            }
            StreamSource::Job(job_id) => {
                tokio::spawn(async move {
                    mux.run_job(stream_id, generation, job_id, stop).await;
                });
            }
        }
        state
    }

    /// Stops a live stream and freezes its content. The backing job, if any, is asked to
    /// cancel on a best-effort basis.
    pub fn stop_stream(&self, stream_id: &StreamId) -> bool {
        let (state, generation, job_id) = {
            let mut mux = self.lock();
            let Some(entry) = mux.streams.get_mut(stream_id) else {
                return false;
            };
            if !entry.state.is_live() {
                return false;
            }
            entry.stop.cancel();
            let now = now_ms();
            entry.state.status = StreamStatus::Aborted;
            entry.state.updated_at_ms = now;
            entry.state.completed_at_ms = Some(now);
            (
                entry.state.clone(),
                entry.generation,
                entry.state.job_id.clone(),
            )
        };
        tracing::info!(stream_id = %stream_id, "stream stopped");
        self.notify(&state);
        self.schedule_removal(stream_id.clone(), generation);

        if let Some(job_id) = job_id {
            let api = Arc::clone(&self.inner.api);
            tokio::spawn(async move {
                if let Err(err) = api.cancel(&job_id).await {
                    tracing::warn!(job_id = %job_id, error = %err, "job cancel after stream stop failed");
                }
            });
        }
        true
    }

    pub fn get(&self, stream_id: &StreamId) -> Option<StreamState> {
        self.lock()
            .streams
            .get(stream_id)
            .map(|entry| entry.state.clone())
    }

    pub fn streams(&self) -> Vec<StreamState> {
        self.lock()
            .streams
            .values()
            .map(|entry| entry.state.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Merges one push event into the current run of `stream_id`. Returns whether anything changed.
    pub fn apply_push_event(&self, stream_id: &StreamId, event: &ProviderEvent) -> bool {
        self.update(stream_id, Run::Current, |state| merge::absorb_event(state, event))
    }

    /// Merges a durable snapshot. Applying the same snapshot twice changes nothing the second time.
    pub fn apply_snapshot(&self, snapshot: &StreamSnapshot) -> bool {
        self.update(&snapshot.stream_id, Run::Current, |state| {
            merge::apply_snapshot(state, snapshot)
        })
    }

    /// The per-stream listener slot is dropped once its last subscriber leaves.
    pub fn subscribe(
        &self,
        stream_id: &StreamId,
        callback: impl Fn(&StreamState) + Send + Sync + 'static,
    ) -> Subscription {
        let subscription = self
            .inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(stream_id.clone())
            .or_default()
            .subscribe(callback);
        let inner = Arc::downgrade(&self.inner);
        let stream_id = stream_id.clone();
        subscription.and_then(move || {
            if let Some(inner) = inner.upgrade() {
                inner.prune_listeners(&stream_id);
            }
        })
    }

    /// Called on every change of any stream.
    pub fn subscribe_to_activity(
        &self,
        callback: impl Fn(&StreamState) + Send + Sync + 'static,
    ) -> Subscription {
        self.inner.activity.subscribe(callback)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MuxState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self, state: &StreamState) {
        let listeners = self
            .inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&state.stream_id)
            .cloned();
        if let Some(listeners) = listeners {
            listeners.notify(state);
        }
        self.inner.activity.notify(state);
    }

    fn update(
        &self,
        stream_id: &StreamId,
        run: Run,
        apply: impl FnOnce(&mut StreamState) -> bool,
    ) -> bool {
        let (state, settled) = {
            let mut mux = self.lock();
            let Some(entry) = mux.streams.get_mut(stream_id) else {
                return false;
            };
            if let Run::Generation(generation) = run {
                if entry.generation != generation {
                    return false;
                }
            }
            let was_live = entry.state.is_live();
            if !apply(&mut entry.state) {
                return false;
            }
            let now = now_ms();
            entry.state.updated_at_ms = now;
            let settled = was_live && !entry.state.is_live();
            if settled {
                entry.state.completed_at_ms = Some(now);
                entry.stop.cancel();
            }
            (entry.state.clone(), settled.then_some(entry.generation))
        };
        self.notify(&state);
        if let Some(generation) = settled {
            tracing::info!(
                stream_id = %stream_id,
                status = %state.status,
                "stream settled"
            );
            self.schedule_removal(stream_id.clone(), generation);
        }
        true
    }

    fn is_current(&self, stream_id: &StreamId, generation: u64) -> bool {
        self.lock()
            .streams
            .get(stream_id)
            .is_some_and(|entry| entry.generation == generation && entry.state.is_live())
    }

    fn anchor(&self, stream_id: &StreamId, generation: u64, revision: i64, message_id: String) {
        let mut mux = self.lock();
        if let Some(entry) = mux
            .streams
            .get_mut(stream_id)
            .filter(|entry| entry.generation == generation)
        {
            entry.state.anchor(revision, message_id);
        }
    }

    fn schedule_removal(&self, stream_id: StreamId, generation: u64) {
        let mux = self.clone();
        let retention = self.inner.config.stream_retention();
        tokio::spawn(async move {
            tokio::time::sleep(retention).await;
            let released = {
                let mut state = mux.lock();
                let owned = state
                    .streams
                    .get(&stream_id)
                    .is_some_and(|entry| entry.generation == generation);
                if owned {
                    state.streams.remove(&stream_id);
                }
                owned
            };
            if released {
                mux.inner.prune_listeners(&stream_id);
                tracing::debug!(stream_id = %stream_id, "stream state released");
            }
        });
    }

    async fn run_direct(
        self,
        stream_id: StreamId,
        generation: u64,
        request: CompletionRequest,
        stop: CancellationToken,
    ) {
        let store = self.inner.store.clone();
        let message_id = format!("{}:{}", stream_id.as_str(), now_ms());
        let begin_id = stream_id.clone();
        match store
            .run(move |store| store.stream_begin(&begin_id, None))
            .await
        {
            Ok(begun) => self.anchor(&stream_id, generation, begun.revision, message_id.clone()),
            Err(err) => {
                tracing::warn!(stream_id = %stream_id, error = %err, "stream begin failed");
            }
        }
        let run = Run::Generation(generation);
        let mut writer = BufferedWriter::new(
            StreamPlaceholderSink::new(store, stream_id.clone()),
            self.inner.config.stream_flush_interval(),
        );

        let end = match self.inner.provider.stream(request, stop.clone()).await {
            Ok(mut events) => {
                let mut flush_timer = tokio::time::interval_at(
                    Instant::now() + self.inner.config.stream_flush_interval(),
                    self.inner.config.stream_flush_interval(),
                );
                flush_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        biased;
                        _ = stop.cancelled() => break DirectEnd::Stopped,
                        _ = flush_timer.tick() => {
                            match writer.flush_if_due().await {
                                Ok(true) => {
                                    self.update(&stream_id, run, clear_buffer);
                                }
                                Ok(false) => {}
                                Err(err) => {
                                    tracing::warn!(stream_id = %stream_id, error = %err, "stream flush failed");
                                }
                            }
                        }
                        event = events.recv() => match event {
                            Some(ProviderEvent::Done) => break DirectEnd::Done,
                            Some(ProviderEvent::Error(message)) => break DirectEnd::Failed(message),
                            Some(event) => {
                                match &event {
                                    ProviderEvent::Delta(delta) => writer.append(delta),
                                    ProviderEvent::ToolStart { id, name } => {
                                        writer.record_tool_call(ToolCall::started(id, name));
                                    }
                                    ProviderEvent::ToolComplete { id, output } => {
                                        let name = writer
                                            .tool_calls()
                                            .iter()
                                            .find(|call| &call.id == id)
                                            .map(|call| call.name.clone())
                                            .unwrap_or_default();
                                        writer.record_tool_call(ToolCall {
                                            id: id.clone(),
                                            name,
                                            status: ToolCallStatus::Completed,
                                            output: output.clone(),
                                        });
                                    }
                                    ProviderEvent::Done | ProviderEvent::Error(_) => {}
                                }
                                self.update(&stream_id, run, |state| merge::absorb_event(state, &event));
                            }
                            None => {
                                break DirectEnd::Failed(
                                    RuntimeError::Provider("stream closed before completion".to_string())
                                        .to_string(),
                                );
                            }
                        },
                    }
                }
            }
            Err(err) => DirectEnd::Failed(err.to_string()),
        };

        // The last partial content always reaches durable storage.
        if let Err(err) = writer.flush().await {
            tracing::warn!(stream_id = %stream_id, error = %err, "final stream flush failed");
        }
        self.update(&stream_id, run, clear_buffer);

        let content = match &end {
            DirectEnd::Failed(reason) => with_interruption_marker(&writer.content(), reason),
            DirectEnd::Done | DirectEnd::Stopped => writer.content(),
        };
        let final_message = (!content.is_empty() || !writer.tool_calls().is_empty()).then(|| {
            let mut message = StreamMessageInput::assistant(message_id, content);
            message.tool_calls = writer.tool_calls().to_vec();
            message
        });
        if let Err(err) = self
            .inner
            .store
            .run({
                let stream_id = stream_id.clone();
                move |store| store.stream_finish(&stream_id, final_message)
            })
            .await
        {
            tracing::warn!(stream_id = %stream_id, error = %err, "stream finish failed");
        }

        match end {
            DirectEnd::Done => {
                self.update(&stream_id, run, |state| {
                    merge::absorb_event(state, &ProviderEvent::Done)
                });
            }
            DirectEnd::Failed(reason) => {
                tracing::warn!(stream_id = %stream_id, error = %reason, "direct stream failed");
                self.update(&stream_id, run, |state| {
                    merge::absorb_event(state, &ProviderEvent::Error(reason))
                });
            }
            DirectEnd::Stopped => {}
        }
    }

    async fn run_job(
        self,
        stream_id: StreamId,
        generation: u64,
        job_id: JobId,
        stop: CancellationToken,
    ) {
        let run = Run::Generation(generation);
        let deadline = Instant::now() + self.inner.config.max_poll_duration();
        let mut ticker = tokio::time::interval(self.inner.config.stream_poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => return,
                _ = ticker.tick() => {}
            }
            if Instant::now() >= deadline {
                let timeout = RuntimeError::Timeout(self.inner.config.max_poll_duration()).to_string();
                self.update(&stream_id, run, |state| {
                    merge::absorb_event(state, &ProviderEvent::Error(timeout))
                });
                return;
            }

            let view = tokio::select! {
                biased;
                _ = stop.cancelled() => return,
                view = self.inner.api.status(&job_id) => view,
            };
            let view = match view {
                Ok(Some(view)) => view,
                Ok(None) => {
                    let missing = RuntimeError::NotFound(format!("job {job_id}")).to_string();
                    self.update(&stream_id, run, |state| {
                        merge::absorb_event(state, &ProviderEvent::Error(missing))
                    });
                    return;
                }
                Err(err) => {
                    tracing::debug!(stream_id = %stream_id, job_id = %job_id, error = %err, "job status read failed; retrying");
                    continue;
                }
            };
            let snapshot_id = stream_id.clone();
            let snapshot = match self
                .inner
                .store
                .run(move |store| store.stream_snapshot(&snapshot_id))
                .await
            {
                Ok(snapshot) => snapshot,
                Err(err) => {
                    tracing::warn!(stream_id = %stream_id, error = %err, "stream snapshot read failed");
                    None
                }
            };
            self.update(&stream_id, run, |state| {
                merge::reconcile_job(state, snapshot.as_ref(), &view)
            });
            if !self.is_current(&stream_id, generation) {
                return;
            }
        }
    }
}

fn clear_buffer(state: &mut StreamState) -> bool {
    if state.streaming_buffer.is_empty() {
        return false;
    }
    state.streaming_buffer.clear();
    true
}

impl std::fmt::Debug for StreamMultiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamMultiplexer")
            .field("streams", &self.len())
            .finish()
    }
}
