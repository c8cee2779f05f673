#![forbid(unsafe_code)]

//! Validated state transitions shared by job status, operation status, stream status and
//! domain item lifecycles.
//!
//! A transition `current -> target` is legal when `current == target` (idempotent) or when
//! `target` is listed for `current` in the table. A state with no outgoing edges is terminal.

use serde::{Deserialize, Serialize};
use std::fmt;

#[cfg(test)]
mod tests;

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error("invalid {item_kind} transition {from} -> {to}: {from} is a terminal state")]
    Terminal {
        item_kind: String,
        from: String,
        to: String,
    },
    #[error("invalid {item_kind} transition {from} -> {to} (allowed: {})", allowed.join(", "))]
    NotAllowed {
        item_kind: String,
        from: String,
        to: String,
        allowed: Vec<String>,
    },
    #[error("{item_kind} has an empty state history")]
    EmptyHistory { item_kind: String },
}

/// Static edge list: `(from, allowed targets)`. States missing from the list have no edges.
#[derive(Clone, Copy, Debug)]
pub struct TransitionTable<'a, S: 'a> {
    edges: &'a [(S, &'a [S])],
}

impl<'a, S: Copy + Eq> TransitionTable<'a, S> {
    pub const fn new(edges: &'a [(S, &'a [S])]) -> Self {
        Self { edges }
    }

    pub fn allowed(&self, from: S) -> &'a [S] {
        self.edges
            .iter()
            .find(|(state, _)| *state == from)
            .map(|(_, targets)| *targets)
            .unwrap_or(&[])
    }

    pub fn is_terminal(&self, state: S) -> bool {
        self.allowed(state).is_empty()
    }
}

pub fn validate_transition<S>(
    current: S,
    target: S,
    table: &TransitionTable<'_, S>,
    item_kind: &str,
) -> Result<(), TransitionError>
where
    S: Copy + Eq + fmt::Display,
{
    if current == target {
        return Ok(());
    }
    let allowed = table.allowed(current);
    if allowed.contains(&target) {
        return Ok(());
    }
    if allowed.is_empty() {
        return Err(TransitionError::Terminal {
            item_kind: item_kind.to_string(),
            from: current.to_string(),
            to: target.to_string(),
        });
    }
    Err(TransitionError::NotAllowed {
        item_kind: item_kind.to_string(),
        from: current.to_string(),
        to: target.to_string(),
        allowed: allowed.iter().map(ToString::to_string).collect(),
    })
}

pub fn current_state<S: Copy>(
    history: &[StateTransition<S>],
    item_kind: &str,
) -> Result<S, TransitionError> {
    history
        .last()
        .map(|entry| entry.state)
        .ok_or_else(|| TransitionError::EmptyHistory {
            item_kind: item_kind.to_string(),
        })
}

/// A status enum with a fixed transition table.
pub trait Lifecycle: Copy + Eq + fmt::Display + 'static {
    const KIND: &'static str;
    const TABLE: TransitionTable<'static, Self>;

    fn is_terminal(self) -> bool {
        Self::TABLE.is_terminal(self)
    }

    fn validate_transition(self, target: Self) -> Result<(), TransitionError> {
        validate_transition(self, target, &Self::TABLE, Self::KIND)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateTransition<S> {
    pub state: S,
    pub timestamp_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl<S> StateTransition<S> {
    pub fn new(state: S, timestamp_ms: i64) -> Self {
        Self {
            state,
            timestamp_ms,
            source: None,
            note: None,
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }
}

/// Domain data plus an append-only, never-empty state history.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(
    rename_all = "camelCase",
    try_from = "RawStatefulItem<D, S>",
    bound(deserialize = "D: Deserialize<'de>, S: Lifecycle + Deserialize<'de>")
)]
pub struct StatefulItem<D, S> {
    pub data: D,
    state_history: Vec<StateTransition<S>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawStatefulItem<D, S> {
    data: D,
    state_history: Vec<StateTransition<S>>,
}

impl<D, S: Lifecycle> TryFrom<RawStatefulItem<D, S>> for StatefulItem<D, S> {
    type Error = TransitionError;

    fn try_from(raw: RawStatefulItem<D, S>) -> Result<Self, Self::Error> {
        Self::from_parts(raw.data, raw.state_history)
    }
}

impl<D, S: Lifecycle> StatefulItem<D, S> {
    pub fn new(data: D, initial: StateTransition<S>) -> Self {
        Self {
            data,
            state_history: vec![initial],
        }
    }

    /// Rebuilds an item from persisted parts; rejects an empty history.
    pub fn from_parts(
        data: D,
        state_history: Vec<StateTransition<S>>,
    ) -> Result<Self, TransitionError> {
        current_state(&state_history, S::KIND)?;
        Ok(Self {
            data,
            state_history,
        })
    }

    pub fn current_state(&self) -> S {
        // Constructors guarantee at least one entry.
        self.state_history[self.state_history.len() - 1].state
    }

    pub fn history(&self) -> &[StateTransition<S>] {
        &self.state_history
    }

    pub fn last_transition(&self) -> &StateTransition<S> {
        &self.state_history[self.state_history.len() - 1]
    }

    /// Validates and appends. Returns `false` for an accepted self-transition (nothing appended).
    pub fn transition(&mut self, next: StateTransition<S>) -> Result<bool, TransitionError> {
        let current = self.current_state();
        current.validate_transition(next.state)?;
        if current == next.state {
            return Ok(false);
        }
        self.state_history.push(next);
        Ok(true)
    }
}

/// Bulk retention: drops items that are terminal and whose last transition is older than `cutoff_ms`.
pub fn prune_settled<D, S: Lifecycle>(items: &mut Vec<StatefulItem<D, S>>, cutoff_ms: i64) -> usize {
    let before = items.len();
    items.retain(|item| {
        !(item.current_state().is_terminal() && item.last_transition().timestamp_ms < cutoff_ms)
    });
    before - items.len()
}
