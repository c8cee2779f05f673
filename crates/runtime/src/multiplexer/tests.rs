use super::*;
use crate::testing::{ManualJobApi, ScriptedProvider, Step, delta, done, target};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tt_core::JobKind;
use tt_storage::{MessageRole, StreamMessage};

fn stream(raw: &str) -> StreamId {
    StreamId::try_new(raw).expect("stream id")
}

fn mux_with(provider: &ScriptedProvider, api: &ManualJobApi) -> StreamMultiplexer {
    StreamMultiplexer::new(
        api.store.clone(),
        Arc::new(api.clone()),
        Arc::new(provider.clone()),
        RuntimeConfig::default(),
    )
}

fn durable(api: &ManualJobApi, stream_id: &StreamId) -> StreamSnapshot {
    api.store
        .with(|store| store.stream_snapshot(stream_id))
        .expect("snapshot")
        .expect("stream exists")
}

async fn create_stream_job(api: &ManualJobApi, stream_id: &StreamId) -> JobId {
    use crate::api::JobApi;
    api.host
        .create(
            JobKind::ChatReply,
            &target("topic-1"),
            json!({"prompt": "hi", "streamId": stream_id.as_str()}),
        )
        .await
        .expect("create job")
}

fn message(id: String, content: &str) -> StreamMessage {
    StreamMessage {
        message_id: id,
        role: MessageRole::Assistant,
        content: content.to_string(),
        tool_calls: Vec::new(),
        updated_at_ms: 0,
    }
}

fn live_state(job_id: Option<JobId>) -> StreamState {
    StreamState::new(stream("thread-1"), job_id, StreamStatus::Pending)
}

/// A direct run of `thread-1` that began durably at `revision`.
fn direct_state(revision: i64) -> StreamState {
    let mut state = live_state(None);
    state.anchor(revision, "thread-1:200".to_string());
    state
}

fn listener_slots(mux: &StreamMultiplexer) -> usize {
    mux.inner
        .listeners
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .len()
}

#[tokio::test(start_paused = true)]
async fn direct_stream_flushes_on_a_timer_and_finishes_durably() {
    let provider = ScriptedProvider::new();
    provider.push(vec![
        delta("Hel"),
        Step::Sleep(Duration::from_millis(300)),
        delta("lo"),
        done(),
    ]);
    let api = ManualJobApi::new();
    let mux = mux_with(&provider, &api);
    let stream_id = stream("thread-1");

    let started = mux.start_stream(StreamRequest {
        stream_id: stream_id.clone(),
        source: StreamSource::Direct(CompletionRequest::new("say hello")),
    });
    assert_eq!(started.status, StreamStatus::Streaming);

    tokio::time::sleep(Duration::from_millis(270)).await;
    let state = mux.get(&stream_id).expect("state");
    assert_eq!(state.content, "Hel");
    assert!(state.streaming_buffer.is_empty());
    let snapshot = durable(&api, &stream_id);
    assert!(snapshot.is_streaming);
    assert_eq!(snapshot.placeholder().map(|m| m.content.as_str()), Some("Hel"));

    tokio::time::sleep(Duration::from_millis(200)).await;
    let state = mux.get(&stream_id).expect("state");
    assert_eq!(state.status, StreamStatus::Completed);
    assert_eq!(state.content, "Hello");
    assert!(state.completed_at_ms.is_some());

    let snapshot = durable(&api, &stream_id);
    assert!(!snapshot.is_streaming);
    assert!(snapshot.placeholder().is_none());
    assert_eq!(
        snapshot.last_assistant().map(|m| m.content.as_str()),
        Some("Hello")
    );
}

#[tokio::test(start_paused = true)]
async fn direct_stream_error_keeps_partial_content_with_marker() {
    let provider = ScriptedProvider::new();
    provider.push(vec![
        delta("Partial"),
        Step::Emit(ProviderEvent::Error("overloaded".to_string())),
    ]);
    let api = ManualJobApi::new();
    let mux = mux_with(&provider, &api);
    let stream_id = stream("thread-2");

    mux.start_stream(StreamRequest {
        stream_id: stream_id.clone(),
        source: StreamSource::Direct(CompletionRequest::new("go")),
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let state = mux.get(&stream_id).expect("state");
    assert_eq!(state.status, StreamStatus::Error);
    assert_eq!(state.error.as_deref(), Some("overloaded"));
    assert_eq!(state.content, "Partial\n\n[interrupted: overloaded]");

    let last = durable(&api, &stream_id)
        .last_assistant()
        .cloned()
        .expect("final message");
    assert_eq!(last.content, state.content);
}

#[tokio::test(start_paused = true)]
async fn stopping_a_direct_stream_freezes_content_and_persists_it() {
    let provider = ScriptedProvider::new();
    provider.push(vec![delta("So far"), Step::Hang]);
    let api = ManualJobApi::new();
    let mux = mux_with(&provider, &api);
    let stream_id = stream("thread-3");

    mux.start_stream(StreamRequest {
        stream_id: stream_id.clone(),
        source: StreamSource::Direct(CompletionRequest::new("go")),
    });
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert!(mux.stop_stream(&stream_id));
    assert!(!mux.stop_stream(&stream_id));
    assert!(!mux.apply_push_event(&stream_id, &ProviderEvent::Delta("late".to_string())));

    tokio::time::sleep(Duration::from_millis(10)).await;
    let state = mux.get(&stream_id).expect("state");
    assert_eq!(state.status, StreamStatus::Aborted);
    assert_eq!(state.content, "So far");

    let snapshot = durable(&api, &stream_id);
    assert!(!snapshot.is_streaming);
    assert_eq!(
        snapshot.last_assistant().map(|m| m.content.as_str()),
        Some("So far")
    );
    assert!(api.cancelled().is_empty());
}

#[tokio::test(start_paused = true)]
async fn job_stream_follows_durable_progress_until_the_job_completes() {
    let provider = ScriptedProvider::new();
    let api = ManualJobApi::new();
    let mux = mux_with(&provider, &api);
    let stream_id = stream("thread-4");
    let job_id = create_stream_job(&api, &stream_id).await;

    let started = mux.start_stream(StreamRequest {
        stream_id: stream_id.clone(),
        source: StreamSource::Job(job_id.clone()),
    });
    assert_eq!(started.status, StreamStatus::Pending);
    assert_eq!(started.job_id.as_ref(), Some(&job_id));

    api.claim(&job_id);
    api.store
        .with(|store| {
            store.stream_begin(&stream_id, Some(&job_id))?;
            store.stream_upsert_message(
                &stream_id,
                StreamMessageInput::assistant(stream_id.placeholder_message_id(), "Partial"),
            )
        })
        .expect("write placeholder");

    tokio::time::sleep(Duration::from_millis(1_100)).await;
    let state = mux.get(&stream_id).expect("state");
    assert_eq!(state.status, StreamStatus::Streaming);
    assert_eq!(state.content, "Partial");

    api.store
        .with(|store| {
            store.stream_finish(
                &stream_id,
                Some(StreamMessageInput::assistant(
                    stream_id.final_message_id(&job_id),
                    "Partial answer",
                )),
            )
        })
        .expect("finish stream");
    api.complete(&job_id, json!({"reply": "Partial answer"}));

    tokio::time::sleep(Duration::from_millis(1_000)).await;
    let state = mux.get(&stream_id).expect("state");
    assert_eq!(state.status, StreamStatus::Completed);
    assert_eq!(state.content, "Partial answer");
}

#[tokio::test(start_paused = true)]
async fn failed_job_surfaces_as_stream_error_with_a_single_marker() {
    let provider = ScriptedProvider::new();
    let api = ManualJobApi::new();
    let mux = mux_with(&provider, &api);
    let stream_id = stream("thread-5");
    let job_id = create_stream_job(&api, &stream_id).await;
    mux.start_stream(StreamRequest {
        stream_id: stream_id.clone(),
        source: StreamSource::Job(job_id.clone()),
    });

    api.claim(&job_id);
    api.store
        .with(|store| {
            store.stream_begin(&stream_id, Some(&job_id))?;
            store.stream_finish(
                &stream_id,
                Some(StreamMessageInput::assistant(
                    stream_id.final_message_id(&job_id),
                    "Partial\n\n[interrupted: provider: boom]",
                )),
            )
        })
        .expect("write stream");
    api.fail(&job_id, "provider: boom");

    tokio::time::sleep(Duration::from_millis(1_100)).await;
    let state = mux.get(&stream_id).expect("state");
    assert_eq!(state.status, StreamStatus::Error);
    assert_eq!(state.error.as_deref(), Some("provider: boom"));
    assert_eq!(state.content, "Partial\n\n[interrupted: provider: boom]");
}

#[tokio::test(start_paused = true)]
async fn stopping_a_job_stream_cancels_the_job() {
    let provider = ScriptedProvider::new();
    let api = ManualJobApi::new();
    let mux = mux_with(&provider, &api);
    let stream_id = stream("thread-6");
    let job_id = create_stream_job(&api, &stream_id).await;
    mux.start_stream(StreamRequest {
        stream_id: stream_id.clone(),
        source: StreamSource::Job(job_id.clone()),
    });

    assert!(mux.stop_stream(&stream_id));
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(api.cancelled(), vec![job_id.clone()]);
    assert_eq!(api.job_status(&job_id), tt_core::JobStatus::Cancelled);
    assert_eq!(
        mux.get(&stream_id).map(|state| state.status),
        Some(StreamStatus::Aborted)
    );
}

#[tokio::test(start_paused = true)]
async fn starting_a_live_stream_again_returns_the_existing_state() {
    let provider = ScriptedProvider::new();
    let api = ManualJobApi::new();
    let mux = mux_with(&provider, &api);
    let stream_id = stream("thread-7");
    let job_id = create_stream_job(&api, &stream_id).await;

    let first = mux.start_stream(StreamRequest {
        stream_id: stream_id.clone(),
        source: StreamSource::Job(job_id),
    });
    let second = mux.start_stream(StreamRequest {
        stream_id: stream_id.clone(),
        source: StreamSource::Direct(CompletionRequest::new("ignored")),
    });
    assert_eq!(first, second);
    assert_eq!(mux.len(), 1);
    assert!(provider.requests().is_empty());
}

#[tokio::test(start_paused = true)]
async fn reapplying_a_snapshot_does_not_notify_twice() {
    let provider = ScriptedProvider::new();
    let api = ManualJobApi::new();
    let mux = mux_with(&provider, &api);
    let stream_id = stream("thread-8");
    let job_id = create_stream_job(&api, &stream_id).await;
    mux.start_stream(StreamRequest {
        stream_id: stream_id.clone(),
        source: StreamSource::Job(job_id.clone()),
    });

    let notified = Arc::new(AtomicUsize::new(0));
    let subscription = {
        let notified = Arc::clone(&notified);
        mux.subscribe(&stream_id, move |_| {
            notified.fetch_add(1, Ordering::SeqCst);
        })
    };
    let snapshot = StreamSnapshot {
        stream_id: stream_id.clone(),
        is_streaming: true,
        job_id: Some(job_id),
        revision: 3,
        messages: vec![message(stream_id.placeholder_message_id(), "abc")],
    };

    assert!(mux.apply_snapshot(&snapshot));
    assert!(!mux.apply_snapshot(&snapshot));
    assert_eq!(notified.load(Ordering::SeqCst), 1);
    assert_eq!(mux.get(&stream_id).map(|s| s.content), Some("abc".to_string()));
    subscription.unsubscribe();
}

#[tokio::test(start_paused = true)]
async fn settled_streams_are_released_after_retention() {
    let provider = ScriptedProvider::new();
    provider.reply("done");
    let api = ManualJobApi::new();
    let mux = mux_with(&provider, &api);
    let stream_id = stream("thread-9");

    let seen = Arc::new(Mutex::new(Vec::new()));
    let activity = {
        let seen = Arc::clone(&seen);
        mux.subscribe_to_activity(move |state| {
            seen.lock().expect("seen lock").push(state.status);
        })
    };
    mux.start_stream(StreamRequest {
        stream_id: stream_id.clone(),
        source: StreamSource::Direct(CompletionRequest::new("go")),
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(
        mux.get(&stream_id).map(|s| s.status),
        Some(StreamStatus::Completed)
    );
    assert_eq!(
        seen.lock().expect("seen lock").last(),
        Some(&StreamStatus::Completed)
    );

    tokio::time::sleep(RuntimeConfig::default().stream_retention()).await;
    assert!(mux.get(&stream_id).is_none());
    assert!(mux.is_empty());
    activity.unsubscribe();
}

#[tokio::test(start_paused = true)]
async fn previous_turn_snapshot_does_not_finish_a_new_direct_run() {
    let provider = ScriptedProvider::new();
    provider.reply("an old and long previous answer");
    provider.push(vec![delta("Hi"), Step::Hang]);
    let api = ManualJobApi::new();
    let mux = mux_with(&provider, &api);
    let stream_id = stream("thread-10");
    let direct = || StreamRequest {
        stream_id: stream_id.clone(),
        source: StreamSource::Direct(CompletionRequest::new("go")),
    };

    mux.start_stream(direct());
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(
        mux.get(&stream_id).map(|s| s.status),
        Some(StreamStatus::Completed)
    );
    let previous_turn = durable(&api, &stream_id);

    mux.start_stream(direct());
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(!mux.apply_snapshot(&previous_turn));
    let state = mux.get(&stream_id).expect("state");
    assert_eq!(state.status, StreamStatus::Streaming);
    assert_eq!(state.content, "Hi");

    assert!(mux.stop_stream(&stream_id));
}

#[test]
fn direct_run_only_finishes_with_its_own_message() {
    let mut state = direct_state(5);
    let earlier = StreamSnapshot {
        stream_id: stream("thread-1"),
        is_streaming: false,
        job_id: None,
        revision: 4,
        messages: vec![message("thread-1:100".to_string(), "an old and long previous answer")],
    };
    assert!(!merge::apply_snapshot(&mut state, &earlier));
    assert_eq!(state.status, StreamStatus::Pending);

    let unanchored = &mut live_state(None);
    assert!(!merge::apply_snapshot(unanchored, &earlier));

    let finished = StreamSnapshot {
        revision: 7,
        messages: vec![
            message("thread-1:100".to_string(), "an old and long previous answer"),
            message("thread-1:200".to_string(), "new"),
        ],
        ..earlier
    };
    assert!(merge::apply_snapshot(&mut state, &finished));
    assert_eq!(state.status, StreamStatus::Completed);
    assert_eq!(state.content, "new");
}

#[tokio::test(start_paused = true)]
async fn listener_slots_do_not_outlive_their_subscribers() {
    let provider = ScriptedProvider::new();
    let api = ManualJobApi::new();
    let mux = mux_with(&provider, &api);

    let mut subscriptions = Vec::new();
    for n in 0..3 {
        provider.reply("done");
        let stream_id = stream(&format!("thread-2{n}"));
        subscriptions.push(mux.subscribe(&stream_id, |_| {}));
        mux.start_stream(StreamRequest {
            stream_id,
            source: StreamSource::Direct(CompletionRequest::new("go")),
        });
    }
    let kept = mux.subscribe(&stream("thread-20"), |_| {});
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(listener_slots(&mux), 3);

    for subscription in subscriptions {
        subscription.unsubscribe();
    }
    assert_eq!(listener_slots(&mux), 1);

    tokio::time::sleep(RuntimeConfig::default().stream_retention()).await;
    assert!(mux.is_empty());
    assert_eq!(listener_slots(&mux), 1);
    kept.unsubscribe();
    assert_eq!(listener_slots(&mux), 0);
}

#[test]
fn shorter_snapshots_never_shrink_content() {
    let mut state = direct_state(1);
    assert!(merge::absorb_event(
        &mut state,
        &ProviderEvent::Delta("abcdef".to_string())
    ));
    let lagging = StreamSnapshot {
        stream_id: stream("thread-1"),
        is_streaming: true,
        job_id: None,
        revision: 1,
        messages: vec![message(stream("thread-1").placeholder_message_id(), "abc")],
    };
    assert!(!merge::apply_snapshot(&mut state, &lagging));
    assert_eq!(state.content, "abcdef");
}

#[test]
fn snapshots_of_another_job_are_ignored() {
    let mut state = live_state(Some(JobId::from_seq(2)));
    let earlier_turn = StreamSnapshot {
        stream_id: stream("thread-1"),
        is_streaming: false,
        job_id: Some(JobId::from_seq(1)),
        revision: 9,
        messages: vec![message(
            stream("thread-1").final_message_id(&JobId::from_seq(1)),
            "old answer",
        )],
    };
    assert!(!merge::apply_snapshot(&mut state, &earlier_turn));
    assert_eq!(state.status, StreamStatus::Pending);
    assert!(state.content.is_empty());
}

#[test]
fn finished_snapshot_completes_and_terminal_state_is_frozen() {
    let job_id = JobId::from_seq(5);
    let mut state = live_state(Some(job_id.clone()));
    let finished = StreamSnapshot {
        stream_id: stream("thread-1"),
        is_streaming: false,
        job_id: Some(job_id.clone()),
        revision: 4,
        messages: vec![message(stream("thread-1").final_message_id(&job_id), "answer")],
    };
    assert!(merge::apply_snapshot(&mut state, &finished));
    assert_eq!(state.status, StreamStatus::Completed);
    assert_eq!(state.content, "answer");

    assert!(!merge::apply_snapshot(&mut state, &finished));
    assert!(!merge::absorb_event(
        &mut state,
        &ProviderEvent::Delta("more".to_string())
    ));
    assert_eq!(state.content, "answer");
}

#[test]
fn lagging_snapshot_does_not_reopen_finished_tool_calls() {
    let mut state = direct_state(1);
    merge::absorb_event(
        &mut state,
        &ProviderEvent::ToolStart {
            id: "t1".to_string(),
            name: "search".to_string(),
        },
    );
    merge::absorb_event(
        &mut state,
        &ProviderEvent::ToolComplete {
            id: "t1".to_string(),
            output: None,
        },
    );
    let mut placeholder = message(stream("thread-1").placeholder_message_id(), "");
    placeholder.tool_calls = vec![ToolCall::started("t1", "search")];
    let lagging = StreamSnapshot {
        stream_id: stream("thread-1"),
        is_streaming: true,
        job_id: None,
        revision: 2,
        messages: vec![placeholder],
    };
    assert!(!merge::absorb_snapshot(&mut state, &lagging));
    assert_eq!(state.tool_calls[0].status, ToolCallStatus::Completed);
    assert_eq!(state.tool_calls[0].name, "search");
}
