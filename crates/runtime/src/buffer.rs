#![forbid(unsafe_code)]

//! Throttled persistence of incrementally produced content.
//!
//! A [`BufferedWriter`] accumulates deltas and writes the full content to its sink no more
//! often than its minimum interval (`flush_if_due`), plus one unconditional `flush` at the end.
//! Flushing with nothing pending performs no write.

use crate::error::RuntimeResult;
use crate::store::SharedStore;
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::Instant;
use tt_core::{JobId, StreamId, ToolCall, merge_tool_call};
use tt_storage::StreamMessageInput;

/// Appends the interruption marker that tells a truncated answer apart from a complete one.
pub fn with_interruption_marker(content: &str, reason: &str) -> String {
    let marker = format!("[interrupted: {}]", reason.trim());
    if content.ends_with(&marker) {
        return content.to_string();
    }
    if content.trim().is_empty() {
        return marker;
    }
    format!("{content}\n\n{marker}")
}

/// Destination of a full-content overwrite.
#[async_trait]
pub trait ContentSink: Send + Sync {
    async fn write(&self, content: &str, tool_calls: &[ToolCall]) -> RuntimeResult<()>;
}

#[derive(Debug)]
pub struct BufferedWriter<S> {
    sink: S,
    flushed: String,
    buffer: String,
    tool_calls: Vec<ToolCall>,
    tools_dirty: bool,
    min_interval: Duration,
    last_flush: Instant,
    writes: u64,
}

impl<S: ContentSink> BufferedWriter<S> {
    pub fn new(sink: S, min_interval: Duration) -> Self {
        Self {
            sink,
            flushed: String::new(),
            buffer: String::new(),
            tool_calls: Vec::new(),
            tools_dirty: false,
            min_interval,
            last_flush: Instant::now(),
            writes: 0,
        }
    }

    pub fn append(&mut self, delta: &str) {
        self.buffer.push_str(delta);
    }

    pub fn record_tool_call(&mut self, call: ToolCall) {
        if merge_tool_call(&mut self.tool_calls, call) {
            self.tools_dirty = true;
        }
    }

    pub fn content(&self) -> String {
        format!("{}{}", self.flushed, self.buffer)
    }

    pub fn tool_calls(&self) -> &[ToolCall] {
        &self.tool_calls
    }

    pub fn has_pending(&self) -> bool {
        !self.buffer.is_empty() || self.tools_dirty
    }

    pub fn writes(&self) -> u64 {
        self.writes
    }

    pub fn is_due(&self) -> bool {
        self.has_pending() && self.last_flush.elapsed() >= self.min_interval
    }

    pub async fn flush_if_due(&mut self) -> RuntimeResult<bool> {
        if !self.is_due() {
            return Ok(false);
        }
        self.flush().await
    }

    /// Unconditional flush. On a sink error the pending content stays buffered.
    pub async fn flush(&mut self) -> RuntimeResult<bool> {
        if !self.has_pending() {
            return Ok(false);
        }
        let content = self.content();
        self.sink.write(&content, &self.tool_calls).await?;
        self.flushed = content;
        self.buffer.clear();
        self.tools_dirty = false;
        self.last_flush = Instant::now();
        self.writes += 1;
        Ok(true)
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }
}

/// Writes partial job content; optionally mirrors it into the stream placeholder message.
#[derive(Clone, Debug)]
pub struct JobProgressSink {
    store: SharedStore,
    job_id: JobId,
    mirror: Option<StreamId>,
}

impl JobProgressSink {
    pub fn new(store: SharedStore, job_id: JobId) -> Self {
        Self {
            store,
            job_id,
            mirror: None,
        }
    }

    pub fn mirror_to(mut self, stream_id: Option<StreamId>) -> Self {
        self.mirror = stream_id;
        self
    }
}

#[async_trait]
impl ContentSink for JobProgressSink {
    async fn write(&self, content: &str, tool_calls: &[ToolCall]) -> RuntimeResult<()> {
        let job_id = self.job_id.clone();
        let partial = content.to_string();
        let written = self
            .store
            .run(move |store| store.job_write_progress(&job_id, &partial))
            .await?;
        if !written {
            tracing::debug!(job_id = %self.job_id, "progress skipped; job no longer running");
            return Ok(());
        }
        if let Some(stream_id) = self.mirror.as_ref() {
            write_placeholder(&self.store, stream_id, content, tool_calls).await?;
        }
        Ok(())
    }
}

/// Writes locally streamed content into the stream's in-progress placeholder message.
#[derive(Clone, Debug)]
pub struct StreamPlaceholderSink {
    store: SharedStore,
    stream_id: StreamId,
}

impl StreamPlaceholderSink {
    pub fn new(store: SharedStore, stream_id: StreamId) -> Self {
        Self { store, stream_id }
    }
}

#[async_trait]
impl ContentSink for StreamPlaceholderSink {
    async fn write(&self, content: &str, tool_calls: &[ToolCall]) -> RuntimeResult<()> {
        write_placeholder(&self.store, &self.stream_id, content, tool_calls).await
    }
}

async fn write_placeholder(
    store: &SharedStore,
    stream_id: &StreamId,
    content: &str,
    tool_calls: &[ToolCall],
) -> RuntimeResult<()> {
    let mut message = StreamMessageInput::assistant(stream_id.placeholder_message_id(), content);
    message.tool_calls = tool_calls.to_vec();
    let stream_id = stream_id.clone();
    store
        .run(move |store| store.stream_upsert_message(&stream_id, message))
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RuntimeError;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct RecordingSink {
        writes: Arc<Mutex<Vec<String>>>,
        fail: Arc<Mutex<bool>>,
    }

    #[async_trait]
    impl ContentSink for RecordingSink {
        async fn write(&self, content: &str, _tool_calls: &[ToolCall]) -> RuntimeResult<()> {
            if *self.fail.lock().expect("lock") {
                return Err(RuntimeError::Transport("disk full".to_string()));
            }
            self.writes.lock().expect("lock").push(content.to_string());
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn append_then_flush_writes_once() {
        let sink = RecordingSink::default();
        let mut writer = BufferedWriter::new(sink.clone(), Duration::from_millis(500));
        writer.append("a");
        writer.append("b");
        assert!(writer.flush().await.expect("flush"));
        assert!(!writer.flush().await.expect("empty flush"));
        assert_eq!(*sink.writes.lock().expect("lock"), vec!["ab".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_flush_is_a_noop() {
        let sink = RecordingSink::default();
        let mut writer = BufferedWriter::new(sink.clone(), Duration::from_millis(500));
        assert!(!writer.flush().await.expect("flush"));
        assert!(sink.writes.lock().expect("lock").is_empty());
        assert_eq!(writer.writes(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn flush_if_due_respects_interval() {
        let sink = RecordingSink::default();
        let mut writer = BufferedWriter::new(sink.clone(), Duration::from_millis(500));
        writer.append("a");
        assert!(!writer.flush_if_due().await.expect("too early"));

        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(writer.flush_if_due().await.expect("due"));

        writer.append("b");
        tokio::time::advance(Duration::from_millis(100)).await;
        assert!(!writer.flush_if_due().await.expect("throttled"));
        assert!(writer.flush().await.expect("final flush"));

        assert_eq!(
            *sink.writes.lock().expect("lock"),
            vec!["a".to_string(), "ab".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failed_write_keeps_buffer() {
        let sink = RecordingSink::default();
        *sink.fail.lock().expect("lock") = true;
        let mut writer = BufferedWriter::new(sink.clone(), Duration::from_millis(10));
        writer.append("x");
        assert!(writer.flush().await.is_err());
        assert!(writer.has_pending());

        *sink.fail.lock().expect("lock") = false;
        assert!(writer.flush().await.expect("retry"));
        assert_eq!(*sink.writes.lock().expect("lock"), vec!["x".to_string()]);
    }

    #[test]
    fn interruption_marker_is_appended_once() {
        let marked = with_interruption_marker("partial", "rate limited");
        assert_eq!(marked, "partial\n\n[interrupted: rate limited]");
        assert_eq!(with_interruption_marker(&marked, "rate limited"), marked);
        assert_eq!(with_interruption_marker("", "boom"), "[interrupted: boom]");
    }

    #[tokio::test(start_paused = true)]
    async fn tool_calls_count_as_pending() {
        let sink = RecordingSink::default();
        let mut writer = BufferedWriter::new(sink.clone(), Duration::from_millis(10));
        writer.record_tool_call(ToolCall::started("t1", "search"));
        assert!(writer.flush().await.expect("flush tools"));
        writer.record_tool_call(ToolCall::started("t1", "search"));
        assert!(!writer.has_pending());
    }
}
