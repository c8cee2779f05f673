#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::model::JobKind;

const MAX_TARGET_ID_LEN: usize = 128;
const MAX_STREAM_ID_LEN: usize = 256;

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum IdError {
    #[error("{field} must not be empty")]
    Empty { field: &'static str },
    #[error("{field} is too long")]
    TooLong { field: &'static str },
    #[error("{field} must start with an ASCII letter or digit")]
    InvalidFirstChar { field: &'static str },
    #[error("{field} contains invalid character {ch:?} at index {index}")]
    InvalidChar {
        field: &'static str,
        ch: char,
        index: usize,
    },
    #[error("job id must look like JOB-<digits>")]
    InvalidJobId,
    #[error("operation id must look like <kind>:<target>")]
    InvalidOperationId,
    #[error("unknown job kind {0:?}")]
    UnknownKind(String),
}

/// Durable job identity. Ids are allocated by the store as `JOB-###`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct JobId(String);

impl JobId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    pub fn try_new(value: impl Into<String>) -> Result<Self, IdError> {
        let value = value.into();
        let value = value.trim();
        let Some(digits) = value.strip_prefix("JOB-") else {
            return Err(IdError::InvalidJobId);
        };
        if digits.len() < 3 || !digits.chars().all(|c| c.is_ascii_digit()) {
            return Err(IdError::InvalidJobId);
        }
        Ok(Self(value.to_string()))
    }

    pub fn from_seq(seq: i64) -> Self {
        Self(format!("JOB-{seq:03}"))
    }
}

impl TryFrom<String> for JobId {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::try_new(value)
    }
}

impl From<JobId> for String {
    fn from(value: JobId) -> Self {
        value.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Domain entity a job acts on (a thread, a topic, an evaluation).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TargetId(String);

impl TargetId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    pub fn try_new(value: impl Into<String>) -> Result<Self, IdError> {
        let value = value.into();
        validate_slug("target id", &value, MAX_TARGET_ID_LEN)?;
        Ok(Self(value))
    }
}

impl TryFrom<String> for TargetId {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::try_new(value)
    }
}

impl From<TargetId> for String {
    fn from(value: TargetId) -> Self {
        value.0
    }
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Client-side operation identity, `"{kind}:{target}"`. One active operation per target.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct OperationId(String);

impl OperationId {
    pub fn for_target(kind: JobKind, target: &TargetId) -> Self {
        Self(format!("{}:{}", kind.as_str(), target.as_str()))
    }

    pub fn parse(value: &str) -> Result<(JobKind, TargetId), IdError> {
        let (kind, target) = value
            .split_once(':')
            .ok_or(IdError::InvalidOperationId)?;
        let kind = JobKind::parse(kind)?;
        let target = TargetId::try_new(target)?;
        Ok((kind, target))
    }

    pub fn try_new(value: impl Into<String>) -> Result<Self, IdError> {
        let value = value.into();
        Self::parse(&value)?;
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn kind(&self) -> Option<JobKind> {
        Self::parse(&self.0).ok().map(|(kind, _)| kind)
    }
}

impl TryFrom<String> for OperationId {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::try_new(value)
    }
}

impl From<OperationId> for String {
    fn from(value: OperationId) -> Self {
        value.0
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One logical conversation or evaluation stream.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StreamId(String);

impl StreamId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn try_new(value: impl Into<String>) -> Result<Self, IdError> {
        let value = value.into();
        validate_slug("stream id", &value, MAX_STREAM_ID_LEN)?;
        Ok(Self(value))
    }

    /// Message id of the in-progress assistant message while the stream is live.
    pub fn placeholder_message_id(&self) -> String {
        format!("{}:streaming", self.0)
    }

    /// Message id of the assistant message a job leaves behind when it finishes the stream.
    pub fn final_message_id(&self, job_id: &JobId) -> String {
        format!("{}:{}", self.0, job_id.as_str())
    }
}

impl TryFrom<String> for StreamId {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::try_new(value)
    }
}

impl From<StreamId> for String {
    fn from(value: StreamId) -> Self {
        value.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn validate_slug(field: &'static str, value: &str, max_len: usize) -> Result<(), IdError> {
    if value.is_empty() {
        return Err(IdError::Empty { field });
    }
    if value.len() > max_len {
        return Err(IdError::TooLong { field });
    }
    let Some(first) = value.chars().next() else {
        return Err(IdError::Empty { field });
    };
    if !first.is_ascii_alphanumeric() {
        return Err(IdError::InvalidFirstChar { field });
    }
    for (index, ch) in value.chars().enumerate().skip(1) {
        if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '/' | '-') {
            continue;
        }
        return Err(IdError::InvalidChar { field, ch, index });
    }
    Ok(())
}
