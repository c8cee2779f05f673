#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::ids::IdError;
use crate::state::{Lifecycle, TransitionTable};

/// Closed set of AI operation kinds a job can perform.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobKind {
    TopicRegeneration,
    ChatReply,
    SolutionEvaluation,
}

impl JobKind {
    pub const ALL: [JobKind; 3] = [
        JobKind::TopicRegeneration,
        JobKind::ChatReply,
        JobKind::SolutionEvaluation,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            JobKind::TopicRegeneration => "topic-regeneration",
            JobKind::ChatReply => "chat-reply",
            JobKind::SolutionEvaluation => "solution-evaluation",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, IdError> {
        let raw = raw.trim();
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(raw))
            .ok_or_else(|| IdError::UnknownKind(raw.to_string()))
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Pending,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        Self::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(raw))
    }

    pub fn is_active(self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Running)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Lifecycle for JobStatus {
    const KIND: &'static str = "job";
    const TABLE: TransitionTable<'static, Self> = TransitionTable::new(&[
        (
            JobStatus::Pending,
            &[JobStatus::Running, JobStatus::Failed, JobStatus::Cancelled],
        ),
        (
            JobStatus::Running,
            &[JobStatus::Completed, JobStatus::Failed, JobStatus::Cancelled],
        ),
    ]);
}

/// Client-side mirror of [`JobStatus`] with the extra local `aborted` outcome.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Aborted,
}

impl OperationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationStatus::Pending => "pending",
            OperationStatus::Running => "running",
            OperationStatus::Completed => "completed",
            OperationStatus::Failed => "failed",
            OperationStatus::Cancelled => "cancelled",
            OperationStatus::Aborted => "aborted",
        }
    }

    pub fn is_active(self) -> bool {
        matches!(self, OperationStatus::Pending | OperationStatus::Running)
    }
}

impl From<JobStatus> for OperationStatus {
    fn from(value: JobStatus) -> Self {
        match value {
            JobStatus::Pending => OperationStatus::Pending,
            JobStatus::Running => OperationStatus::Running,
            JobStatus::Completed => OperationStatus::Completed,
            JobStatus::Failed => OperationStatus::Failed,
            JobStatus::Cancelled => OperationStatus::Cancelled,
        }
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Lifecycle for OperationStatus {
    const KIND: &'static str = "operation";
    const TABLE: TransitionTable<'static, Self> = TransitionTable::new(&[
        (
            OperationStatus::Pending,
            &[
                OperationStatus::Running,
                OperationStatus::Completed,
                OperationStatus::Failed,
                OperationStatus::Cancelled,
                OperationStatus::Aborted,
            ],
        ),
        (
            OperationStatus::Running,
            &[
                OperationStatus::Completed,
                OperationStatus::Failed,
                OperationStatus::Cancelled,
                OperationStatus::Aborted,
            ],
        ),
    ]);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamStatus {
    Pending,
    Streaming,
    Completed,
    Error,
    Aborted,
}

impl StreamStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            StreamStatus::Pending => "pending",
            StreamStatus::Streaming => "streaming",
            StreamStatus::Completed => "completed",
            StreamStatus::Error => "error",
            StreamStatus::Aborted => "aborted",
        }
    }
}

impl fmt::Display for StreamStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Lifecycle for StreamStatus {
    const KIND: &'static str = "stream";
    const TABLE: TransitionTable<'static, Self> = TransitionTable::new(&[
        (
            StreamStatus::Pending,
            &[
                StreamStatus::Streaming,
                StreamStatus::Completed,
                StreamStatus::Error,
                StreamStatus::Aborted,
            ],
        ),
        (
            StreamStatus::Streaming,
            &[
                StreamStatus::Completed,
                StreamStatus::Error,
                StreamStatus::Aborted,
            ],
        ),
    ]);
}

/// Lifecycle of a domain item (a learning topic, an exercise). `completed` is terminal and
/// cannot be reached directly from `skipped`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemLifecycle {
    Active,
    Completed,
    Skipped,
}

impl ItemLifecycle {
    pub fn as_str(self) -> &'static str {
        match self {
            ItemLifecycle::Active => "active",
            ItemLifecycle::Completed => "completed",
            ItemLifecycle::Skipped => "skipped",
        }
    }
}

impl fmt::Display for ItemLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Lifecycle for ItemLifecycle {
    const KIND: &'static str = "item";
    const TABLE: TransitionTable<'static, Self> = TransitionTable::new(&[
        (
            ItemLifecycle::Active,
            &[ItemLifecycle::Completed, ItemLifecycle::Skipped],
        ),
        (ItemLifecycle::Skipped, &[ItemLifecycle::Active]),
    ]);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolCallStatus {
    Running,
    Completed,
}

/// A provider tool invocation observed while streaming, kept in arrival order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub status: ToolCallStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

impl ToolCall {
    pub fn started(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            status: ToolCallStatus::Running,
            output: None,
        }
    }
}

/// Upserts by id so replayed tool events never duplicate an entry.
pub fn merge_tool_call(calls: &mut Vec<ToolCall>, call: ToolCall) -> bool {
    match calls.iter_mut().find(|existing| existing.id == call.id) {
        Some(existing) if *existing == call => false,
        Some(existing) => {
            *existing = call;
            true
        }
        None => {
            calls.push(call);
            true
        }
    }
}
