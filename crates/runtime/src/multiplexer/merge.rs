#![forbid(unsafe_code)]

//! Conflict-resistant merge of push events and durable snapshots into one [`StreamState`].
//!
//! Content only ever grows while a stream is live; a longer candidate wins regardless of which
//! channel delivered it or in what order. Terminal states are frozen. Re-applying an
//! observation that is already reflected reports no change.

use super::StreamState;
use crate::api::JobStatusView;
use crate::buffer::with_interruption_marker;
use crate::provider::ProviderEvent;
use tt_core::{JobStatus, StreamStatus, ToolCall, ToolCallStatus, merge_tool_call};
use tt_storage::{StreamMessage, StreamSnapshot};

pub(super) fn is_live(status: StreamStatus) -> bool {
    matches!(status, StreamStatus::Pending | StreamStatus::Streaming)
}

fn grow_content(state: &mut StreamState, candidate: &str) -> bool {
    if candidate.len() <= state.content.len() {
        return false;
    }
    state.content = candidate.to_string();
    true
}

fn merge_calls(state: &mut StreamState, calls: &[ToolCall]) -> bool {
    let mut changed = false;
    for call in calls {
        let settled = state.tool_calls.iter().any(|existing| {
            existing.id == call.id && existing.status == ToolCallStatus::Completed
        });
        // A lagging snapshot must not reopen a finished call.
        if settled && call.status == ToolCallStatus::Running {
            continue;
        }
        changed |= merge_tool_call(&mut state.tool_calls, call.clone());
    }
    changed
}

fn mark_streaming(state: &mut StreamState) -> bool {
    if state.status == StreamStatus::Pending {
        state.status = StreamStatus::Streaming;
        return true;
    }
    false
}

pub(super) fn absorb_event(state: &mut StreamState, event: &ProviderEvent) -> bool {
    if !is_live(state.status) {
        return false;
    }
    match event {
        ProviderEvent::Delta(delta) => {
            if delta.is_empty() {
                return false;
            }
            state.content.push_str(delta);
            state.streaming_buffer.push_str(delta);
            mark_streaming(state);
            true
        }
        ProviderEvent::ToolStart { id, name } => {
            let changed = merge_tool_call(&mut state.tool_calls, ToolCall::started(id, name));
            mark_streaming(state) || changed
        }
        ProviderEvent::ToolComplete { id, output } => {
            let name = state
                .tool_calls
                .iter()
                .find(|call| &call.id == id)
                .map(|call| call.name.clone())
                .unwrap_or_default();
            merge_tool_call(
                &mut state.tool_calls,
                ToolCall {
                    id: id.clone(),
                    name,
                    status: ToolCallStatus::Completed,
                    output: output.clone(),
                },
            )
        }
        ProviderEvent::Done => {
            state.status = StreamStatus::Completed;
            true
        }
        ProviderEvent::Error(message) => {
            state.content = with_interruption_marker(&state.content, message);
            state.error = Some(message.clone());
            state.status = StreamStatus::Error;
            true
        }
    }
}

/// Whether `snapshot` describes this stream's current run. Job-backed runs match by job id.
/// Direct runs match by revision: anything older than the run's own begin is an earlier turn,
/// and before the run has begun durably no snapshot can be its own.
fn owns(state: &StreamState, snapshot: &StreamSnapshot) -> bool {
    match (state.job_id.as_ref(), state.begun_at_revision) {
        (Some(job_id), _) => snapshot.job_id.as_ref() == Some(job_id),
        (None, Some(begun)) => snapshot.revision >= begun,
        (None, None) => false,
    }
}

/// Takes content and tool calls from the in-progress placeholder. Never finishes the stream.
pub(super) fn absorb_snapshot(state: &mut StreamState, snapshot: &StreamSnapshot) -> bool {
    if !is_live(state.status) || !owns(state, snapshot) {
        return false;
    }
    let mut changed = false;
    if let Some(placeholder) = snapshot.placeholder() {
        changed |= grow_content(state, &placeholder.content);
        changed |= merge_calls(state, &placeholder.tool_calls);
    }
    if snapshot.is_streaming || snapshot.placeholder().is_some() {
        changed |= mark_streaming(state);
    }
    changed
}

/// The message a finished run left behind.
fn final_message<'a>(state: &StreamState, snapshot: &'a StreamSnapshot) -> Option<&'a StreamMessage> {
    match state.job_id.as_ref() {
        Some(job_id) => {
            let message_id = snapshot.stream_id.final_message_id(job_id);
            snapshot
                .messages
                .iter()
                .find(|message| message.message_id == message_id)
        }
        None => {
            let message_id = state.final_message_id.as_deref()?;
            snapshot
                .messages
                .iter()
                .find(|message| message.message_id == message_id)
        }
    }
}

fn take_final(state: &mut StreamState, message: Option<&StreamMessage>) {
    if let Some(message) = message {
        grow_content(state, &message.content);
        merge_calls(state, &message.tool_calls);
    }
}

/// Placeholder gone plus the "not streaming" marker means the run is over.
pub(super) fn apply_snapshot(state: &mut StreamState, snapshot: &StreamSnapshot) -> bool {
    let mut changed = absorb_snapshot(state, snapshot);
    if !is_live(state.status) || !owns(state, snapshot) {
        return changed;
    }
    if !snapshot.is_streaming && snapshot.placeholder().is_none() {
        take_final(state, final_message(state, snapshot));
        state.streaming_buffer.clear();
        state.status = StreamStatus::Completed;
        changed = true;
    }
    changed
}

/// Job-backed streams take their terminal status from the job, so a failed job never shows
/// up as a completed stream.
pub(super) fn reconcile_job(
    state: &mut StreamState,
    snapshot: Option<&StreamSnapshot>,
    view: &JobStatusView,
) -> bool {
    if !is_live(state.status) {
        return false;
    }
    let mut changed = snapshot.is_some_and(|snapshot| absorb_snapshot(state, snapshot));
    if let Some(partial) = view.partial.as_deref() {
        changed |= grow_content(state, partial);
    }
    let final_message = snapshot.and_then(|snapshot| final_message(state, snapshot).cloned());

    match view.status {
        JobStatus::Pending => changed,
        JobStatus::Running => mark_streaming(state) || changed,
        JobStatus::Completed => {
            take_final(state, final_message.as_ref());
            state.status = StreamStatus::Completed;
            true
        }
        JobStatus::Failed => {
            let error = view
                .error
                .clone()
                .filter(|error| !error.trim().is_empty())
                .unwrap_or_else(|| "job failed".to_string());
            match final_message {
                Some(message) if message.content.len() >= state.content.len() => {
                    state.content = message.content;
                }
                _ => {}
            }
            state.content = with_interruption_marker(&state.content, &error);
            state.error = Some(error);
            state.status = StreamStatus::Error;
            true
        }
        JobStatus::Cancelled => {
            take_final(state, final_message.as_ref());
            state.status = StreamStatus::Aborted;
            true
        }
    }
}
