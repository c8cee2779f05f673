#![forbid(unsafe_code)]

use tt_core::{JobId, StreamId, ToolCall};
use tt_storage::{MessageRole, SqliteStore, StreamMessageInput};

fn stream(raw: &str) -> StreamId {
    StreamId::try_new(raw).expect("stream id")
}

#[test]
fn unknown_stream_has_no_snapshot() {
    let store = SqliteStore::open_in_memory().expect("open");
    assert!(
        store
            .stream_snapshot(&stream("thread-1"))
            .expect("snapshot")
            .is_none()
    );
}

#[test]
fn placeholder_is_updated_in_place_then_replaced_on_finish() {
    let mut store = SqliteStore::open_in_memory().expect("open");
    let id = stream("thread-1");
    let job = JobId::from_seq(3);

    store
        .stream_upsert_message(
            &id,
            StreamMessageInput {
                message_id: "m1".to_string(),
                role: MessageRole::User,
                content: "why borrowck?".to_string(),
                tool_calls: Vec::new(),
            },
        )
        .expect("user message");
    let begun = store.stream_begin(&id, Some(&job)).expect("begin");
    assert!(begun.is_streaming);
    assert_eq!(begun.job_id, Some(job.clone()));

    let placeholder = id.placeholder_message_id();
    store
        .stream_upsert_message(&id, StreamMessageInput::assistant(&placeholder, "Because"))
        .expect("first chunk");
    let mut chunk = StreamMessageInput::assistant(&placeholder, "Because aliasing");
    chunk.tool_calls.push(ToolCall::started("t1", "search"));
    let revision = store.stream_upsert_message(&id, chunk).expect("second chunk");

    let live = store.stream_snapshot(&id).expect("snapshot").expect("exists");
    assert_eq!(live.revision, revision);
    assert_eq!(live.messages.len(), 2);
    let current = live.placeholder().expect("placeholder");
    assert_eq!(current.content, "Because aliasing");
    assert_eq!(current.tool_calls.len(), 1);

    let finished = store
        .stream_finish(
            &id,
            Some(StreamMessageInput::assistant("m2", "Because aliasing and mutation")),
        )
        .expect("finish");
    assert!(!finished.is_streaming);
    assert!(finished.placeholder().is_none());
    assert_eq!(finished.job_id, Some(job));
    let ids: Vec<&str> = finished
        .messages
        .iter()
        .map(|message| message.message_id.as_str())
        .collect();
    assert_eq!(ids, vec!["m1", "m2"]);
    assert_eq!(
        finished.last_assistant().expect("assistant").content,
        "Because aliasing and mutation"
    );
}

#[test]
fn begin_keeps_existing_job_binding() {
    let mut store = SqliteStore::open_in_memory().expect("open");
    let id = stream("eval-1");
    store
        .stream_begin(&id, Some(&JobId::from_seq(1)))
        .expect("begin");
    let again = store.stream_begin(&id, None).expect("begin again");
    assert_eq!(again.job_id, Some(JobId::from_seq(1)));
}
