#![forbid(unsafe_code)]

//! Orchestration runtime: job execution, the client-side operation registry and the stream
//! multiplexer, wired together over a shared store.

mod api;
mod buffer;
mod cancellation;
mod config;
mod error;
mod executor;
mod listeners;
mod multiplexer;
mod persist;
mod provider;
mod registry;
mod store;

#[cfg(test)]
mod testing;

pub use api::{JobApi, JobStatusView, LocalJobHost};
pub use buffer::{
    BufferedWriter, ContentSink, JobProgressSink, StreamPlaceholderSink, with_interruption_marker,
};
pub use cancellation::{Session, SessionRegistry};
pub use config::RuntimeConfig;
pub use error::{RuntimeError, RuntimeResult};
pub use executor::{
    ChatReplyHandler, ExecutionOutcome, HandlerTable, JobExecutor, JobHandler,
    SolutionEvaluationHandler, TopicRegenerationHandler, extract_json_object, stream_id_from_input,
};
pub use listeners::{Listeners, Subscription};
pub use multiplexer::{StreamMultiplexer, StreamRequest, StreamSource, StreamState};
pub use persist::{ItemOperationStateSink, ItemResultPersister};
pub use provider::{
    CommandProvider, CompletionProvider, CompletionRequest, ProviderEvent, ProviderStream,
    parse_event_line,
};
pub use registry::{
    CompletionPersister, Operation, OperationCallback, OperationError, OperationErrorKind,
    OperationMeta, OperationRegistry, OperationStateSink, RegistryChange, RegistrySnapshot,
    StartRequest,
};
pub use store::SharedStore;
