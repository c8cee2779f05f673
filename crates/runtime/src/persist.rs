#![forbid(unsafe_code)]

//! Item-store side effects of the operation registry.

use crate::error::{RuntimeError, RuntimeResult};
use crate::registry::{CompletionPersister, Operation, OperationStateSink};
use async_trait::async_trait;
use serde_json::{Map, Value as JsonValue};
use std::sync::Arc;
use tt_core::{JobId, TargetId, now_ms};
use tt_storage::{FileItemStore, OperationState, StoreError};

/// Shallow-merges a completed job's result object into the target item's data. Keys present in
/// the result replace the item's keys; everything else is kept.
#[derive(Clone, Debug)]
pub struct ItemResultPersister {
    items: Arc<FileItemStore>,
}

impl ItemResultPersister {
    pub fn new(items: Arc<FileItemStore>) -> Self {
        Self { items }
    }
}

#[async_trait]
impl CompletionPersister for ItemResultPersister {
    async fn persist(&self, operation: &Operation, result: &JsonValue) -> RuntimeResult<()> {
        let target_id = &operation.meta.target_id;
        let Some(fields) = result.as_object() else {
            return Err(RuntimeError::InvalidRequest(format!(
                "result for {target_id} is not a JSON object"
            )));
        };
        let item = self
            .items
            .get(target_id)?
            .ok_or_else(|| RuntimeError::NotFound(format!("item {target_id}")))?;

        let mut data = match item.data {
            JsonValue::Object(existing) => existing,
            _ => Map::new(),
        };
        for (key, value) in fields {
            data.insert(key.clone(), value.clone());
        }
        self.items
            .update_data(target_id, JsonValue::Object(data), now_ms())?;
        tracing::info!(
            operation_id = %operation.id,
            target_id = %target_id,
            "operation result persisted"
        );
        Ok(())
    }
}

/// Writes `operationState` next to the item's data. Targets without an item are skipped.
/// A clear only lands while the stored state still names the clearing job.
#[derive(Clone, Debug)]
pub struct ItemOperationStateSink {
    items: Arc<FileItemStore>,
}

impl ItemOperationStateSink {
    pub fn new(items: Arc<FileItemStore>) -> Self {
        Self { items }
    }
}

#[async_trait]
impl OperationStateSink for ItemOperationStateSink {
    async fn record(&self, target_id: &TargetId, state: OperationState) -> RuntimeResult<()> {
        skip_unknown(target_id, self.items.set_operation_state(target_id, Some(state)))
    }

    async fn clear(&self, target_id: &TargetId, job_id: &JobId) -> RuntimeResult<()> {
        let cleared = self.items.clear_operation_state(target_id, job_id);
        if let Ok(false) = cleared {
            tracing::debug!(target_id = %target_id, job_id = %job_id, "operation state owned by another job");
        }
        skip_unknown(target_id, cleared.map(|_| ()))
    }
}

fn skip_unknown(target_id: &TargetId, written: Result<(), StoreError>) -> RuntimeResult<()> {
    match written {
        Ok(()) => Ok(()),
        Err(StoreError::UnknownId) => {
            tracing::debug!(target_id = %target_id, "no item for operation state");
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}
