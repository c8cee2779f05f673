use super::*;
use crate::model::{ItemLifecycle, JobStatus, OperationStatus, StreamStatus};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Light {
    Red,
    Green,
    Yellow,
    Off,
}

impl fmt::Display for Light {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Light::Red => "red",
            Light::Green => "green",
            Light::Yellow => "yellow",
            Light::Off => "off",
        };
        f.write_str(s)
    }
}

const LIGHTS: [Light; 4] = [Light::Red, Light::Green, Light::Yellow, Light::Off];

const LIGHT_TABLE: TransitionTable<'static, Light> = TransitionTable::new(&[
    (Light::Red, &[Light::Green, Light::Off]),
    (Light::Green, &[Light::Yellow, Light::Off]),
    (Light::Yellow, &[Light::Red, Light::Off]),
]);

#[test]
fn self_transition_is_always_allowed() {
    for state in LIGHTS {
        assert!(validate_transition(state, state, &LIGHT_TABLE, "light").is_ok());
    }
    for state in JobStatus::ALL {
        assert!(state.validate_transition(state).is_ok(), "{state}");
    }
}

#[test]
fn transition_fails_iff_target_not_in_table() {
    for from in LIGHTS {
        for to in LIGHTS {
            let listed = LIGHT_TABLE.allowed(from).contains(&to);
            let result = validate_transition(from, to, &LIGHT_TABLE, "light");
            assert_eq!(
                result.is_err(),
                !listed && from != to,
                "{from} -> {to}: {result:?}"
            );
        }
    }
}

#[test]
fn error_message_lists_allowed_targets() {
    let err = validate_transition(Light::Red, Light::Yellow, &LIGHT_TABLE, "light").unwrap_err();
    assert_eq!(
        err.to_string(),
        "invalid light transition red -> yellow (allowed: green, off)"
    );
}

#[test]
fn error_message_names_terminal_state() {
    let err = validate_transition(Light::Off, Light::Red, &LIGHT_TABLE, "light").unwrap_err();
    assert!(matches!(err, TransitionError::Terminal { .. }));
    assert!(err.to_string().contains("terminal state"), "{err}");

    let err = JobStatus::Completed
        .validate_transition(JobStatus::Running)
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "invalid job transition completed -> running: completed is a terminal state"
    );
}

#[test]
fn job_status_moves_forward_only() {
    assert!(
        JobStatus::Pending
            .validate_transition(JobStatus::Running)
            .is_ok()
    );
    assert!(
        JobStatus::Running
            .validate_transition(JobStatus::Completed)
            .is_ok()
    );
    assert!(
        JobStatus::Running
            .validate_transition(JobStatus::Pending)
            .is_err()
    );
    assert!(
        JobStatus::Pending
            .validate_transition(JobStatus::Completed)
            .is_err()
    );
    for terminal in [JobStatus::Completed, JobStatus::Failed, JobStatus::Cancelled] {
        assert!(terminal.is_terminal());
    }
    assert!(!JobStatus::Running.is_terminal());
}

#[test]
fn operation_and_stream_terminal_states() {
    assert!(OperationStatus::Aborted.is_terminal());
    assert!(
        OperationStatus::Running
            .validate_transition(OperationStatus::Aborted)
            .is_ok()
    );
    assert!(
        OperationStatus::Aborted
            .validate_transition(OperationStatus::Completed)
            .is_err()
    );
    assert!(StreamStatus::Error.is_terminal());
    assert!(
        StreamStatus::Streaming
            .validate_transition(StreamStatus::Pending)
            .is_err()
    );
}

#[test]
fn item_lifecycle_completed_unreachable_from_skipped() {
    assert!(
        ItemLifecycle::Active
            .validate_transition(ItemLifecycle::Skipped)
            .is_ok()
    );
    assert!(
        ItemLifecycle::Skipped
            .validate_transition(ItemLifecycle::Completed)
            .is_err()
    );
    assert!(
        ItemLifecycle::Skipped
            .validate_transition(ItemLifecycle::Active)
            .is_ok()
    );
    assert!(ItemLifecycle::Completed.is_terminal());
}

#[test]
fn current_state_reads_last_entry_and_rejects_empty_history() {
    let history = vec![
        StateTransition::new(ItemLifecycle::Active, 1),
        StateTransition::new(ItemLifecycle::Skipped, 2).with_source("user"),
    ];
    assert_eq!(
        current_state(&history, "item").unwrap(),
        ItemLifecycle::Skipped
    );

    let empty: Vec<StateTransition<ItemLifecycle>> = Vec::new();
    assert_eq!(
        current_state(&empty, "item").unwrap_err(),
        TransitionError::EmptyHistory {
            item_kind: "item".to_string()
        }
    );
}

#[test]
fn stateful_item_appends_history() {
    let mut item = StatefulItem::new("topic", StateTransition::new(ItemLifecycle::Active, 10));
    assert!(
        item.transition(StateTransition::new(ItemLifecycle::Skipped, 11).with_note("later"))
            .unwrap()
    );
    assert!(
        !item
            .transition(StateTransition::new(ItemLifecycle::Skipped, 12))
            .unwrap()
    );
    assert!(
        item.transition(StateTransition::new(ItemLifecycle::Completed, 13))
            .is_err()
    );

    assert_eq!(item.current_state(), ItemLifecycle::Skipped);
    assert_eq!(item.history().len(), 2);
    assert_eq!(item.history()[1].note.as_deref(), Some("later"));
}

#[test]
fn stateful_item_rejects_empty_history_on_deserialize() {
    let raw = r#"{"data":"x","stateHistory":[]}"#;
    let parsed = serde_json::from_str::<StatefulItem<String, ItemLifecycle>>(raw);
    assert!(parsed.is_err());

    let raw = r#"{"data":"x","stateHistory":[{"state":"active","timestampMs":5}]}"#;
    let parsed = serde_json::from_str::<StatefulItem<String, ItemLifecycle>>(raw).unwrap();
    assert_eq!(parsed.current_state(), ItemLifecycle::Active);
}

#[test]
fn prune_settled_drops_only_old_terminal_items() {
    let mut done = StatefulItem::new(1, StateTransition::new(ItemLifecycle::Active, 1));
    done.transition(StateTransition::new(ItemLifecycle::Completed, 5))
        .unwrap();
    let mut recent = StatefulItem::new(2, StateTransition::new(ItemLifecycle::Active, 1));
    recent
        .transition(StateTransition::new(ItemLifecycle::Completed, 50))
        .unwrap();
    let active = StatefulItem::new(3, StateTransition::new(ItemLifecycle::Active, 1));

    let mut items = vec![done, recent, active];
    assert_eq!(prune_settled(&mut items, 20), 1);
    let left = items.iter().map(|item| item.data).collect::<Vec<_>>();
    assert_eq!(left, vec![2, 3]);
}
