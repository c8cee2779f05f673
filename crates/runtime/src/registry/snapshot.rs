#![forbid(unsafe_code)]

use super::Operation;
use std::collections::{BTreeMap, BTreeSet};
use tt_core::{JobKind, OperationId, TargetId};

static NO_TARGETS: BTreeSet<TargetId> = BTreeSet::new();

/// Immutable view of the registry with the derived "active" indexes precomputed.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RegistrySnapshot {
    operations: BTreeMap<OperationId, Operation>,
    active: BTreeSet<OperationId>,
    active_by_kind: BTreeMap<JobKind, BTreeSet<TargetId>>,
}

impl RegistrySnapshot {
    pub(super) fn build<'a>(operations: impl Iterator<Item = &'a Operation>) -> Self {
        let mut snapshot = Self::default();
        for operation in operations {
            if operation.is_active() {
                snapshot.active.insert(operation.id.clone());
                snapshot
                    .active_by_kind
                    .entry(operation.meta.kind)
                    .or_default()
                    .insert(operation.meta.target_id.clone());
            }
            snapshot
                .operations
                .insert(operation.id.clone(), operation.clone());
        }
        snapshot
    }

    pub fn get(&self, id: &OperationId) -> Option<&Operation> {
        self.operations.get(id)
    }

    pub fn is_active(&self, id: &OperationId) -> bool {
        self.active.contains(id)
    }

    pub fn has_active_of_type(&self, kind: JobKind) -> bool {
        self.active_by_kind.contains_key(&kind)
    }

    pub fn active_ids_of_type(&self, kind: JobKind) -> &BTreeSet<TargetId> {
        self.active_by_kind.get(&kind).unwrap_or(&NO_TARGETS)
    }

    pub fn operations(&self) -> impl Iterator<Item = &Operation> {
        self.operations.values()
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}
