#![forbid(unsafe_code)]

pub mod ids;
pub mod model;
pub mod state;

pub use ids::{IdError, JobId, OperationId, StreamId, TargetId};
pub use model::{
    ItemLifecycle, JobKind, JobStatus, OperationStatus, StreamStatus, ToolCall, ToolCallStatus,
    merge_tool_call,
};
pub use state::{
    Lifecycle, StateTransition, StatefulItem, TransitionError, TransitionTable, current_state,
    prune_settled, validate_transition,
};

pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
        .min(i64::MAX as u128) as i64
}
