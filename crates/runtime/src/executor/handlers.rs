#![forbid(unsafe_code)]

use crate::error::{RuntimeError, RuntimeResult};
use crate::provider::CompletionRequest;
use serde_json::{Map as JsonMap, Value as JsonValue, json};
use std::collections::BTreeMap;
use std::sync::Arc;
use tt_core::JobKind;

const TOPIC_SYSTEM_PROMPT: &str = "Regenerate the learning topic. Reply with one JSON object of the form {\"learningTopic\": {...}}.";
const CHAT_SYSTEM_PROMPT: &str = "You are a patient tutor. Answer the last user message.";
const EVALUATION_SYSTEM_PROMPT: &str = "Evaluate the submitted solution. Reply with one JSON object of the form {\"score\": <number>, \"feedback\": <string>}.";

/// Per-kind request construction and result validation.
pub trait JobHandler: Send + Sync {
    fn kind(&self) -> JobKind;

    fn build_request(&self, input: &JsonValue) -> RuntimeResult<CompletionRequest>;

    /// Turns raw provider output into the job result. Malformed output is an error, never a default.
    fn parse_result(&self, output: &str) -> RuntimeResult<JsonValue>;
}

/// Lookup table from job kind to handler. Kinds without a handler are rejected.
#[derive(Clone, Default)]
pub struct HandlerTable {
    handlers: BTreeMap<JobKind, Arc<dyn JobHandler>>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtin() -> Self {
        let mut table = Self::new();
        table.register(Arc::new(TopicRegenerationHandler));
        table.register(Arc::new(ChatReplyHandler));
        table.register(Arc::new(SolutionEvaluationHandler));
        table
    }

    /// Replaces any handler previously registered for the same kind.
    pub fn register(&mut self, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(handler.kind(), handler);
    }

    pub fn get(&self, kind: JobKind) -> RuntimeResult<Arc<dyn JobHandler>> {
        self.handlers.get(&kind).cloned().ok_or_else(|| {
            RuntimeError::InvalidRequest(format!("no handler registered for job kind {kind}"))
        })
    }

    pub fn kinds(&self) -> Vec<JobKind> {
        self.handlers.keys().copied().collect()
    }
}

impl std::fmt::Debug for HandlerTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerTable")
            .field("kinds", &self.kinds())
            .finish()
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct TopicRegenerationHandler;

impl JobHandler for TopicRegenerationHandler {
    fn kind(&self) -> JobKind {
        JobKind::TopicRegeneration
    }

    fn build_request(&self, input: &JsonValue) -> RuntimeResult<CompletionRequest> {
        let mut request = CompletionRequest::new(prompt_with_context(input)?);
        request.system = Some(TOPIC_SYSTEM_PROMPT.to_string());
        request.json_output = true;
        Ok(request)
    }

    fn parse_result(&self, output: &str) -> RuntimeResult<JsonValue> {
        let object = extract_json_object(output)?;
        match object.get("learningTopic") {
            Some(JsonValue::Object(topic)) => Ok(json!({ "learningTopic": topic })),
            Some(_) => Err(RuntimeError::Parse(
                "learningTopic must be an object".to_string(),
            )),
            None => Err(RuntimeError::Parse(
                "response has no learningTopic".to_string(),
            )),
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ChatReplyHandler;

impl JobHandler for ChatReplyHandler {
    fn kind(&self) -> JobKind {
        JobKind::ChatReply
    }

    fn build_request(&self, input: &JsonValue) -> RuntimeResult<CompletionRequest> {
        let message = required_str(input, "prompt")?;
        let mut prompt = String::new();
        if let Some(history) = input.get("history").and_then(JsonValue::as_array) {
            for turn in history {
                let role = turn.get("role").and_then(JsonValue::as_str).unwrap_or("user");
                let content = turn.get("content").and_then(JsonValue::as_str).unwrap_or("");
                if content.trim().is_empty() {
                    continue;
                }
                prompt.push_str(&format!("{role}: {}\n\n", content.trim()));
            }
        }
        prompt.push_str(&format!("user: {message}"));

        let mut request = CompletionRequest::new(prompt);
        request.system = Some(CHAT_SYSTEM_PROMPT.to_string());
        Ok(request)
    }

    fn parse_result(&self, output: &str) -> RuntimeResult<JsonValue> {
        let reply = output.trim();
        if reply.is_empty() {
            return Err(RuntimeError::Parse("empty reply".to_string()));
        }
        Ok(json!({ "reply": reply }))
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SolutionEvaluationHandler;

impl JobHandler for SolutionEvaluationHandler {
    fn kind(&self) -> JobKind {
        JobKind::SolutionEvaluation
    }

    fn build_request(&self, input: &JsonValue) -> RuntimeResult<CompletionRequest> {
        let solution = required_str(input, "solution")?;
        let mut prompt = prompt_with_context(input)?;
        prompt.push_str(&format!("\n\nSolution:\n{solution}"));
        let mut request = CompletionRequest::new(prompt);
        request.system = Some(EVALUATION_SYSTEM_PROMPT.to_string());
        request.json_output = true;
        Ok(request)
    }

    fn parse_result(&self, output: &str) -> RuntimeResult<JsonValue> {
        let object = extract_json_object(output)?;
        let score = object
            .get("score")
            .and_then(JsonValue::as_f64)
            .ok_or_else(|| RuntimeError::Parse("score must be a number".to_string()))?;
        let feedback = object
            .get("feedback")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| RuntimeError::Parse("feedback must be a string".to_string()))?;
        Ok(json!({ "score": score, "feedback": feedback }))
    }
}

fn required_str<'a>(input: &'a JsonValue, key: &str) -> RuntimeResult<&'a str> {
    input
        .get(key)
        .and_then(JsonValue::as_str)
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| RuntimeError::InvalidRequest(format!("input.{key} must be a non-empty string")))
}

fn prompt_with_context(input: &JsonValue) -> RuntimeResult<String> {
    let mut prompt = required_str(input, "prompt")?.to_string();
    if let Some(context) = input.get("context").filter(|v| !v.is_null()) {
        let rendered = serde_json::to_string_pretty(context)
            .map_err(|err| RuntimeError::InvalidRequest(format!("input.context: {err}")))?;
        prompt.push_str("\n\nContext:\n");
        prompt.push_str(&rendered);
    }
    Ok(prompt)
}

/// Parses the outermost `{ ... }` span of `output`, tolerating prose or code fences around it.
pub fn extract_json_object(output: &str) -> RuntimeResult<JsonMap<String, JsonValue>> {
    let (Some(start), Some(end)) = (output.find('{'), output.rfind('}')) else {
        return Err(RuntimeError::Parse("response contains no JSON object".to_string()));
    };
    if end < start {
        return Err(RuntimeError::Parse("response contains no JSON object".to_string()));
    }
    match serde_json::from_str::<JsonValue>(&output[start..=end]) {
        Ok(JsonValue::Object(object)) => Ok(object),
        Ok(_) => Err(RuntimeError::Parse("response is not a JSON object".to_string())),
        Err(err) => Err(RuntimeError::Parse(format!("invalid JSON in response: {err}"))),
    }
}
