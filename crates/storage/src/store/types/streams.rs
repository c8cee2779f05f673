#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use tt_core::{JobId, StreamId, ToolCall};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

impl MessageRole {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::System => "system",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "user" => Some(MessageRole::User),
            "assistant" => Some(MessageRole::Assistant),
            "system" => Some(MessageRole::System),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamMessage {
    pub message_id: String,
    pub role: MessageRole,
    pub content: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    pub updated_at_ms: i64,
}

#[derive(Clone, Debug)]
pub struct StreamMessageInput {
    pub message_id: String,
    pub role: MessageRole,
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
}

impl StreamMessageInput {
    pub fn assistant(message_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            role: MessageRole::Assistant,
            content: content.into(),
            tool_calls: Vec::new(),
        }
    }
}

/// Durable view of one logical stream; the ground truth the multiplexer polls.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamSnapshot {
    pub stream_id: StreamId,
    pub is_streaming: bool,
    pub job_id: Option<JobId>,
    pub revision: i64,
    pub messages: Vec<StreamMessage>,
}

impl StreamSnapshot {
    pub fn placeholder(&self) -> Option<&StreamMessage> {
        let placeholder_id = self.stream_id.placeholder_message_id();
        self.messages
            .iter()
            .find(|message| message.message_id == placeholder_id)
    }

    pub fn last_assistant(&self) -> Option<&StreamMessage> {
        self.messages
            .iter()
            .rev()
            .find(|message| message.role == MessageRole::Assistant)
    }
}
