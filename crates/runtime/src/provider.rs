#![forbid(unsafe_code)]

use crate::error::{RuntimeError, RuntimeResult};
use async_trait::async_trait;
use serde::Deserialize;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const EVENT_CHANNEL_CAPACITY: usize = 256;
const MAX_STDERR_TAIL: usize = 2_000;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProviderEvent {
    Delta(String),
    ToolStart { id: String, name: String },
    ToolComplete { id: String, output: Option<String> },
    Done,
    Error(String),
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CompletionRequest {
    pub prompt: String,
    pub system: Option<String>,
    /// Ask the provider for a single JSON object.
    pub json_output: bool,
}

impl CompletionRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Self::default()
        }
    }
}

/// Provider events drained by one consumer. The channel closing without `Done` means the
/// producer stopped (cancelled or crashed).
pub type ProviderStream = mpsc::Receiver<ProviderEvent>;

#[async_trait]
pub trait CompletionProvider: Send + Sync {
    async fn stream(
        &self,
        request: CompletionRequest,
        cancel: CancellationToken,
    ) -> RuntimeResult<ProviderStream>;

    /// Drains the stream into a single response.
    async fn complete(
        &self,
        request: CompletionRequest,
        cancel: CancellationToken,
    ) -> RuntimeResult<String> {
        let mut events = self.stream(request, cancel.clone()).await?;
        let mut out = String::new();
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => return Err(RuntimeError::Cancelled),
                event = events.recv() => event,
            };
            match event {
                Some(ProviderEvent::Delta(delta)) => out.push_str(&delta),
                Some(ProviderEvent::ToolStart { .. } | ProviderEvent::ToolComplete { .. }) => {}
                Some(ProviderEvent::Error(message)) => return Err(RuntimeError::Provider(message)),
                Some(ProviderEvent::Done) | None => return Ok(out),
            }
        }
    }
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireEvent {
    Delta {
        text: String,
    },
    ToolStart {
        id: String,
        name: String,
    },
    ToolComplete {
        id: String,
        #[serde(default)]
        output: Option<String>,
    },
    Done,
    Error {
        message: String,
    },
}

/// Maps one stdout line to an event: a JSON event object, or plain text as a delta.
pub fn parse_event_line(line: &str) -> ProviderEvent {
    let trimmed = line.trim_start();
    let wire = if trimmed.starts_with('{') {
        serde_json::from_str::<WireEvent>(trimmed).ok()
    } else {
        None
    };
    match wire {
        Some(WireEvent::Delta { text }) => ProviderEvent::Delta(text),
        Some(WireEvent::ToolStart { id, name }) => ProviderEvent::ToolStart { id, name },
        Some(WireEvent::ToolComplete { id, output }) => ProviderEvent::ToolComplete { id, output },
        Some(WireEvent::Done) => ProviderEvent::Done,
        Some(WireEvent::Error { message }) => ProviderEvent::Error(message),
        None => ProviderEvent::Delta(format!("{line}\n")),
    }
}

/// Runs a configured CLI per request: the prompt goes to stdin, stdout lines become events.
/// Cancellation kills the child.
#[derive(Clone, Debug)]
pub struct CommandProvider {
    program: String,
    args: Vec<String>,
}

impl CommandProvider {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    fn command(&self, request: &CompletionRequest) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        if let Some(system) = request.system.as_deref() {
            cmd.env("TT_SYSTEM_PROMPT", system);
        }
        if request.json_output {
            cmd.env("TT_OUTPUT_FORMAT", "json");
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl CompletionProvider for CommandProvider {
    async fn stream(
        &self,
        request: CompletionRequest,
        cancel: CancellationToken,
    ) -> RuntimeResult<ProviderStream> {
        let mut child = self.command(&request).spawn().map_err(|err| {
            RuntimeError::Provider(format!("failed to spawn {}: {err}", self.program))
        })?;

        if let Some(mut stdin) = child.stdin.take() {
            match stdin.write_all(request.prompt.as_bytes()).await {
                Ok(()) => {}
                // The child may exit without reading its input; its exit status decides the outcome.
                Err(err) if err.kind() == std::io::ErrorKind::BrokenPipe => {
                    debug!(program = %self.program, "provider closed stdin early");
                }
                Err(err) => {
                    return Err(RuntimeError::Provider(format!(
                        "write provider stdin failed: {err}"
                    )));
                }
            }
        }
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RuntimeError::Internal("provider stdout not captured".to_string()))?;
        let stderr = child.stderr.take();

        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            if let Some(mut stderr) = stderr {
                let _ = stderr.read_to_string(&mut buf).await;
            }
            buf
        });

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let program = self.program.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            let mut saw_terminal = false;
            loop {
                let line = tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!(program = %program, "provider cancelled; killing child");
                        let _ = child.kill().await;
                        return;
                    }
                    line = lines.next_line() => line,
                };
                match line {
                    Ok(Some(line)) => {
                        let event = parse_event_line(&line);
                        saw_terminal = matches!(event, ProviderEvent::Done | ProviderEvent::Error(_));
                        if tx.send(event).await.is_err() || saw_terminal {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        let _ = tx
                            .send(ProviderEvent::Error(format!("read provider stdout failed: {err}")))
                            .await;
                        saw_terminal = true;
                        break;
                    }
                }
            }

            if saw_terminal {
                return;
            }
            let status = child.wait().await;
            let event = match status {
                Ok(status) if status.success() => ProviderEvent::Done,
                Ok(status) => {
                    let stderr = stderr_task.await.unwrap_or_default();
                    let tail: String = stderr
                        .trim()
                        .chars()
                        .rev()
                        .take(MAX_STDERR_TAIL)
                        .collect::<Vec<_>>()
                        .into_iter()
                        .rev()
                        .collect();
                    warn!(program = %program, %status, "provider exited unsuccessfully");
                    if tail.is_empty() {
                        ProviderEvent::Error(format!("provider exited with {status}"))
                    } else {
                        ProviderEvent::Error(format!("provider exited with {status}: {tail}"))
                    }
                }
                Err(err) => ProviderEvent::Error(format!("wait for provider failed: {err}")),
            };
            let _ = tx.send(event).await;
        });

        Ok(rx)
    }
}
