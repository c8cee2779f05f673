#![forbid(unsafe_code)]

//! Server-side execution of one job.
//!
//! Per invocation: claim the job (`pending -> running`), re-check it before the provider call
//! and on every validity tick, stream provider output through a throttled [`BufferedWriter`],
//! flush once more unconditionally, parse the result and settle the job. Every error path ends
//! in a terminal job status. Cancellation ends the run without writing `failed`.

mod handlers;


pub use handlers::{
    ChatReplyHandler, HandlerTable, JobHandler, SolutionEvaluationHandler,
    TopicRegenerationHandler, extract_json_object,
};

use crate::buffer::{BufferedWriter, ContentSink, JobProgressSink, with_interruption_marker};
use crate::cancellation::{Session, SessionRegistry};
use crate::config::RuntimeConfig;
use crate::error::{RuntimeError, RuntimeResult};
use crate::provider::{CompletionProvider, CompletionRequest, ProviderEvent, ProviderStream};
use crate::store::SharedStore;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use tt_core::{JobId, JobStatus, StreamId, ToolCall, ToolCallStatus};
use tt_storage::{JobClaimRequest, JobRow, StoreError, StreamMessageInput};

const DEFAULT_RUNNER_ID: &str = "local";

#[derive(Clone, Debug, PartialEq)]
pub enum ExecutionOutcome {
    Completed(JsonValue),
    Failed { error: String },
    Cancelled,
    /// The job was deleted before or during the run.
    Missing,
    /// The job is in a status this executor does not own (already settled, or claimed elsewhere).
    Skipped { status: JobStatus },
}

enum Validity {
    Valid,
    Missing,
    Cancelled,
    Settled(JobStatus),
}

enum StreamEnd {
    Done,
    Failed(RuntimeError),
    Stopped(Validity),
}

#[derive(Clone)]
pub struct JobExecutor {
    store: SharedStore,
    provider: Arc<dyn CompletionProvider>,
    handlers: Arc<HandlerTable>,
    sessions: SessionRegistry,
    runner_id: Arc<str>,
    validity_interval: Duration,
    flush_interval: Duration,
}

impl std::fmt::Debug for JobExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobExecutor")
            .field("runner_id", &self.runner_id)
            .field("handlers", &self.handlers)
            .field("validity_interval", &self.validity_interval)
            .field("flush_interval", &self.flush_interval)
            .finish_non_exhaustive()
    }
}

impl JobExecutor {
    pub fn new(
        store: SharedStore,
        provider: Arc<dyn CompletionProvider>,
        config: &RuntimeConfig,
    ) -> Self {
        Self {
            store,
            provider,
            handlers: Arc::new(HandlerTable::with_builtin()),
            sessions: SessionRegistry::new(),
            runner_id: Arc::from(DEFAULT_RUNNER_ID),
            validity_interval: config.validity_check_interval(),
            flush_interval: config.progress_flush_interval(),
        }
    }

    pub fn with_handlers(mut self, handlers: HandlerTable) -> Self {
        self.handlers = Arc::new(handlers);
        self
    }

    pub fn with_sessions(mut self, sessions: SessionRegistry) -> Self {
        self.sessions = sessions;
        self
    }

    pub fn with_runner_id(mut self, runner_id: impl Into<String>) -> Self {
        self.runner_id = Arc::from(runner_id.into());
        self
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub async fn execute(&self, job_id: &JobId) -> ExecutionOutcome {
        self.run(job_id, false).await
    }

    /// Re-executes a job left `running` by a host that went away.
    pub async fn execute_reclaim(&self, job_id: &JobId) -> ExecutionOutcome {
        self.run(job_id, true).await
    }

    pub fn spawn(&self, job_id: JobId) -> JoinHandle<ExecutionOutcome> {
        let executor = self.clone();
        tokio::spawn(async move { executor.execute(&job_id).await })
    }

    /// Durable cancel plus teardown of the live session, if this process runs one.
    /// Returns whether the job ended up `cancelled`.
    pub fn cancel(&self, job_id: &JobId, reason: Option<&str>) -> RuntimeResult<bool> {
        let cancelled = match self.store.with(|store| store.job_cancel(job_id, reason)) {
            Ok(row) => row.status == JobStatus::Cancelled,
            Err(RuntimeError::Store(StoreError::UnknownId | StoreError::Transition(_))) => false,
            Err(err) => return Err(err),
        };
        if self.sessions.cancel(job_id) {
            debug!(job_id = %job_id, "live session cancelled");
        }
        Ok(cancelled)
    }

    async fn run(&self, job_id: &JobId, allow_running: bool) -> ExecutionOutcome {
        let session = self.sessions.register(job_id);
        let outcome = self.run_session(job_id, allow_running, &session).await;
        self.sessions.unregister(job_id, &session);

        match &outcome {
            ExecutionOutcome::Completed(_) => info!(job_id = %job_id, "job completed"),
            ExecutionOutcome::Failed { error } => error!(job_id = %job_id, error = %error, "job failed"),
            ExecutionOutcome::Cancelled => info!(job_id = %job_id, "job cancelled"),
            ExecutionOutcome::Missing => info!(job_id = %job_id, "job no longer exists"),
            ExecutionOutcome::Skipped { status } => {
                debug!(job_id = %job_id, status = %status, "job skipped")
            }
        }
        outcome
    }

    async fn run_session(
        &self,
        job_id: &JobId,
        allow_running: bool,
        session: &Session,
    ) -> ExecutionOutcome {
        let claim = self.store.with(|store| {
            store.job_claim(JobClaimRequest {
                id: job_id.clone(),
                runner_id: self.runner_id.to_string(),
                allow_running,
            })
        });
        let job = match claim {
            Ok(claim) => {
                if claim.reclaimed {
                    info!(job_id = %job_id, "re-claimed interrupted job");
                }
                claim.job
            }
            Err(RuntimeError::Store(StoreError::UnknownId)) => return ExecutionOutcome::Missing,
            Err(RuntimeError::Store(StoreError::JobNotClaimable { status, .. })) => {
                return match status {
                    JobStatus::Cancelled => ExecutionOutcome::Cancelled,
                    status => ExecutionOutcome::Skipped { status },
                };
            }
            Err(RuntimeError::Store(StoreError::RevisionMismatch { .. })) => {
                return self.settled_outcome(job_id);
            }
            Err(err) => return self.fail(job_id, None, "", &[], err),
        };
        info!(
            job_id = %job_id,
            kind = %job.kind,
            target_id = %job.target_id,
            "job started"
        );

        let stream_id = match stream_id_from_input(&job.input) {
            Ok(stream_id) => stream_id,
            Err(err) => return self.fail(job_id, None, "", &[], err),
        };
        let stream = stream_id.as_ref();

        let (handler, request) = match self.prepare(&job, stream) {
            Ok(prepared) => prepared,
            Err(err) => return self.fail(job_id, stream, "", &[], err),
        };

        match self.check_validity(job_id).await {
            Ok(Validity::Valid) => {}
            Ok(stopped) => return self.stop(job_id, stream, "", &[], stopped),
            Err(err) => return self.fail(job_id, stream, "", &[], err),
        }

        let events = match self.provider.stream(request, session.token.clone()).await {
            Ok(events) => events,
            Err(err) => return self.fail(job_id, stream, "", &[], err),
        };

        let sink = JobProgressSink::new(self.store.clone(), job_id.clone()).mirror_to(stream_id.clone());
        let mut writer = BufferedWriter::new(sink, self.flush_interval);
        let end = self.pump(job_id, session, events, &mut writer).await;
        if !matches!(end, StreamEnd::Done | StreamEnd::Failed(_)) {
            session.token.cancel();
        }
        if let Err(err) = writer.flush().await {
            warn!(job_id = %job_id, error = %err, "final progress flush failed");
        }

        let content = writer.content();
        let tool_calls = writer.tool_calls().to_vec();
        match end {
            StreamEnd::Done => match handler.parse_result(&content) {
                Ok(result) => self.complete(job_id, stream, &content, &tool_calls, result),
                Err(err) => self.fail(job_id, stream, &content, &tool_calls, err),
            },
            StreamEnd::Failed(err) => self.fail(job_id, stream, &content, &tool_calls, err),
            StreamEnd::Stopped(validity) => self.stop(job_id, stream, &content, &tool_calls, validity),
        }
    }

    fn prepare(
        &self,
        job: &JobRow,
        stream_id: Option<&StreamId>,
    ) -> RuntimeResult<(Arc<dyn JobHandler>, CompletionRequest)> {
        let handler = self.handlers.get(job.kind)?;
        let request = handler.build_request(&job.input)?;
        if let Some(stream_id) = stream_id {
            self.store
                .with(|store| store.stream_begin(stream_id, Some(&job.id)))?;
        }
        Ok((handler, request))
    }

    async fn pump<S: ContentSink>(
        &self,
        job_id: &JobId,
        session: &Session,
        mut events: ProviderStream,
        writer: &mut BufferedWriter<S>,
    ) -> StreamEnd {
        let mut validity = tokio::time::interval(self.validity_interval);
        validity.set_missed_tick_behavior(MissedTickBehavior::Delay);
        validity.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = session.token.cancelled() => return StreamEnd::Stopped(Validity::Cancelled),
                _ = validity.tick() => match self.check_validity(job_id).await {
                    Ok(Validity::Valid) => {
                        debug!(job_id = %job_id, "validity check passed");
                        if let Err(err) = writer.flush_if_due().await {
                            warn!(job_id = %job_id, error = %err, "progress flush failed");
                        }
                    }
                    Ok(stopped) => return StreamEnd::Stopped(stopped),
                    Err(err) => warn!(job_id = %job_id, error = %err, "validity check failed"),
                },
                event = events.recv() => match event {
                    Some(ProviderEvent::Delta(delta)) => {
                        writer.append(&delta);
                        if let Err(err) = writer.flush_if_due().await {
                            warn!(job_id = %job_id, error = %err, "progress flush failed");
                        }
                    }
                    Some(ProviderEvent::ToolStart { id, name }) => {
                        writer.record_tool_call(ToolCall::started(id, name));
                    }
                    Some(ProviderEvent::ToolComplete { id, output }) => {
                        let name = writer
                            .tool_calls()
                            .iter()
                            .find(|call| call.id == id)
                            .map(|call| call.name.clone())
                            .unwrap_or_default();
                        writer.record_tool_call(ToolCall {
                            id,
                            name,
                            status: ToolCallStatus::Completed,
                            output,
                        });
                    }
                    Some(ProviderEvent::Done) => return StreamEnd::Done,
                    Some(ProviderEvent::Error(message)) => {
                        return StreamEnd::Failed(RuntimeError::Provider(message));
                    }
                    None => {
                        return StreamEnd::Failed(RuntimeError::Provider(
                            "stream closed before completion".to_string(),
                        ));
                    }
                },
            }
        }
    }

    async fn check_validity(&self, job_id: &JobId) -> RuntimeResult<Validity> {
        let job_id = job_id.clone();
        let job = self.store.run(move |store| store.job_get(&job_id)).await?;
        Ok(match job.map(|job| job.status) {
            None => Validity::Missing,
            Some(JobStatus::Running) => Validity::Valid,
            Some(JobStatus::Cancelled) => Validity::Cancelled,
            Some(status) => Validity::Settled(status),
        })
    }

    fn complete(
        &self,
        job_id: &JobId,
        stream_id: Option<&StreamId>,
        content: &str,
        tool_calls: &[ToolCall],
        result: JsonValue,
    ) -> ExecutionOutcome {
        if let Some(stream_id) = stream_id {
            self.finish_stream(stream_id, job_id, content.to_string(), tool_calls);
        }
        match self.store.with(|store| store.job_complete(job_id, &result)) {
            Ok(_) => ExecutionOutcome::Completed(result),
            Err(RuntimeError::Store(StoreError::UnknownId)) => ExecutionOutcome::Missing,
            Err(RuntimeError::Store(StoreError::Transition(_))) => self.settled_outcome(job_id),
            Err(err) => self.fail(job_id, None, content, tool_calls, err),
        }
    }

    fn fail(
        &self,
        job_id: &JobId,
        stream_id: Option<&StreamId>,
        partial: &str,
        tool_calls: &[ToolCall],
        err: RuntimeError,
    ) -> ExecutionOutcome {
        let message = err.to_string();
        if let Some(stream_id) = stream_id {
            let marked = with_interruption_marker(partial, &message);
            self.finish_stream(stream_id, job_id, marked, tool_calls);
        }
        match self.store.with(|store| store.job_fail(job_id, &message)) {
            Ok(row) => ExecutionOutcome::Failed {
                error: row.error.unwrap_or(message),
            },
            Err(RuntimeError::Store(StoreError::UnknownId)) => ExecutionOutcome::Missing,
            Err(RuntimeError::Store(StoreError::Transition(_))) => self.settled_outcome(job_id),
            Err(store_err) => {
                error!(job_id = %job_id, error = %store_err, "could not record job failure");
                ExecutionOutcome::Failed { error: message }
            }
        }
    }

    fn stop(
        &self,
        job_id: &JobId,
        stream_id: Option<&StreamId>,
        partial: &str,
        tool_calls: &[ToolCall],
        validity: Validity,
    ) -> ExecutionOutcome {
        if let Some(stream_id) = stream_id {
            self.finish_stream(stream_id, job_id, partial.to_string(), tool_calls);
        }
        match validity {
            Validity::Missing => ExecutionOutcome::Missing,
            Validity::Settled(status) => ExecutionOutcome::Skipped { status },
            Validity::Valid | Validity::Cancelled => ExecutionOutcome::Cancelled,
        }
    }

    fn finish_stream(
        &self,
        stream_id: &StreamId,
        job_id: &JobId,
        content: String,
        tool_calls: &[ToolCall],
    ) {
        let final_message = (!content.trim().is_empty()).then(|| {
            let mut message =
                StreamMessageInput::assistant(stream_id.final_message_id(job_id), content);
            message.tool_calls = tool_calls.to_vec();
            message
        });
        if let Err(err) = self
            .store
            .with(move |store| store.stream_finish(stream_id, final_message))
        {
            warn!(stream_id = %stream_id, job_id = %job_id, error = %err, "stream finish failed");
        }
    }

    fn settled_outcome(&self, job_id: &JobId) -> ExecutionOutcome {
        match self.store.with(|store| store.job_get(job_id)) {
            Ok(None) => ExecutionOutcome::Missing,
            Ok(Some(job)) if job.status == JobStatus::Cancelled => ExecutionOutcome::Cancelled,
            Ok(Some(job)) => ExecutionOutcome::Skipped { status: job.status },
            Err(err) => ExecutionOutcome::Failed {
                error: err.to_string(),
            },
        }
    }
}

/// Optional `input.streamId`: the stream this job mirrors its output into.
pub fn stream_id_from_input(input: &JsonValue) -> RuntimeResult<Option<StreamId>> {
    match input.get("streamId") {
        None | Some(JsonValue::Null) => Ok(None),
        Some(JsonValue::String(raw)) => Ok(Some(StreamId::try_new(raw.clone())?)),
        Some(_) => Err(RuntimeError::InvalidRequest(
            "input.streamId must be a string".to_string(),
        )),
    }
}
