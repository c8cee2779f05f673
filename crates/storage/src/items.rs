#![forbid(unsafe_code)]

//! File-backed item store: `index.json` plus one `items/{id}.json` per item.
//!
//! Item metadata carries the lifecycle history and, while a background job works on the item,
//! an `operationState` so a reloaded client can show in-progress status without re-deriving it.

use crate::StoreError;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use time::OffsetDateTime;
use time::macros::format_description;
use tt_core::{
    ItemLifecycle, JobId, OperationStatus, StateTransition, StatefulItem, TargetId, prune_settled,
};

const INDEX_FILE: &str = "index.json";
const ITEMS_DIR: &str = "items";
const MAX_TITLE_LEN: usize = 200;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationState {
    pub job_id: JobId,
    pub status: OperationStatus,
    pub started_at: i64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexEntry {
    pub id: TargetId,
    #[serde(rename = "type")]
    pub item_type: String,
    pub date_key: String,
    pub status: ItemLifecycle,
    pub title: String,
    pub updated_at: i64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemMetadata {
    pub id: TargetId,
    #[serde(rename = "type")]
    pub item_type: String,
    pub title: String,
    pub date_key: String,
    pub created_at: i64,
    pub updated_at: i64,
    pub state_history: Vec<StateTransition<ItemLifecycle>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_state: Option<OperationState>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ItemFile {
    pub metadata: ItemMetadata,
    pub data: JsonValue,
}

impl ItemFile {
    pub fn status(&self) -> Option<ItemLifecycle> {
        self.metadata.state_history.last().map(|entry| entry.state)
    }

    fn index_entry(&self) -> Result<IndexEntry, StoreError> {
        let status = tt_core::current_state(&self.metadata.state_history, "item")?;
        Ok(IndexEntry {
            id: self.metadata.id.clone(),
            item_type: self.metadata.item_type.clone(),
            date_key: self.metadata.date_key.clone(),
            status,
            title: self.metadata.title.clone(),
            updated_at: self.metadata.updated_at,
        })
    }

    fn into_stateful(self) -> Result<StatefulItem<(ItemMetadata, JsonValue), ItemLifecycle>, StoreError> {
        let history = self.metadata.state_history.clone();
        Ok(StatefulItem::from_parts((self.metadata, self.data), history)?)
    }

    fn from_stateful(item: StatefulItem<(ItemMetadata, JsonValue), ItemLifecycle>) -> Self {
        let history = item.history().to_vec();
        let (mut metadata, data) = item.data;
        metadata.state_history = history;
        Self { metadata, data }
    }
}

#[derive(Clone, Debug)]
pub struct NewItem {
    pub id: TargetId,
    pub item_type: String,
    pub title: String,
    pub data: JsonValue,
}

/// Single-writer store; writes are serialized by an internal lock and land via temp file + rename.
#[derive(Debug)]
pub struct FileItemStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl FileItemStore {
    pub fn open(root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(root.join(ITEMS_DIR))?;
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn list_index(&self) -> Result<Vec<IndexEntry>, StoreError> {
        let path = self.root.join(INDEX_FILE);
        match std::fs::read(&path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(err) => Err(err.into()),
        }
    }

    pub fn get(&self, id: &TargetId) -> Result<Option<ItemFile>, StoreError> {
        match std::fs::read(self.item_path(id)) {
            Ok(bytes) => {
                let item: ItemFile = serde_json::from_slice(&bytes)?;
                tt_core::current_state(&item.metadata.state_history, "item")?;
                Ok(Some(item))
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    pub fn create(&self, request: NewItem, now_ms: i64) -> Result<ItemFile, StoreError> {
        let title = request.title.trim();
        if title.is_empty() {
            return Err(StoreError::InvalidInput("item.title must not be empty"));
        }
        let item_type = request.item_type.trim();
        if item_type.is_empty() {
            return Err(StoreError::InvalidInput("item.type must not be empty"));
        }

        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if self.item_path(&request.id).exists() {
            return Err(StoreError::ItemExists(request.id.into_string()));
        }
        let item = ItemFile {
            metadata: ItemMetadata {
                id: request.id,
                item_type: item_type.to_string(),
                title: title.chars().take(MAX_TITLE_LEN).collect(),
                date_key: date_key(now_ms)?,
                created_at: now_ms,
                updated_at: now_ms,
                state_history: vec![
                    StateTransition::new(ItemLifecycle::Active, now_ms).with_source("create"),
                ],
                operation_state: None,
            },
            data: request.data,
        };
        self.write_item_locked(&item)?;
        Ok(item)
    }

    pub fn update_data(&self, id: &TargetId, data: JsonValue, now_ms: i64) -> Result<ItemFile, StoreError> {
        self.modify(id, |item| {
            item.data = data;
            item.metadata.updated_at = now_ms;
            Ok(true)
        })
    }

    /// Validated lifecycle change. Returns `false` for an accepted self-transition.
    pub fn transition(
        &self,
        id: &TargetId,
        next: StateTransition<ItemLifecycle>,
    ) -> Result<bool, StoreError> {
        let mut appended = false;
        self.modify(id, |item| {
            let updated_at = next.timestamp_ms;
            let mut stateful = item.clone().into_stateful()?;
            appended = stateful.transition(next)?;
            if appended {
                *item = ItemFile::from_stateful(stateful);
                item.metadata.updated_at = updated_at;
            }
            Ok(appended)
        })?;
        Ok(appended)
    }

    /// Writes or clears the `operationState` stored next to the item's data.
    pub fn set_operation_state(
        &self,
        id: &TargetId,
        state: Option<OperationState>,
    ) -> Result<(), StoreError> {
        self.modify(id, |item| {
            if item.metadata.operation_state == state {
                return Ok(false);
            }
            item.metadata.operation_state = state;
            Ok(true)
        })?;
        Ok(())
    }

    /// Clears `operationState` only while it still belongs to `job_id`, so a late clear from a
    /// superseded job leaves its successor's state alone. Returns whether anything was cleared.
    pub fn clear_operation_state(&self, id: &TargetId, job_id: &JobId) -> Result<bool, StoreError> {
        let mut cleared = false;
        self.modify(id, |item| {
            let owned = item
                .metadata
                .operation_state
                .as_ref()
                .is_some_and(|state| &state.job_id == job_id);
            if owned {
                item.metadata.operation_state = None;
                cleared = true;
            }
            Ok(owned)
        })?;
        Ok(cleared)
    }

    /// Bulk retention: removes terminal items whose last transition is older than `cutoff_ms`.
    pub fn prune(&self, cutoff_ms: i64) -> Result<usize, StoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut items = Vec::new();
        for entry in self.list_index()? {
            if let Some(item) = self.get(&entry.id)? {
                items.push(item.into_stateful()?);
            }
        }
        let before: Vec<TargetId> = items.iter().map(|item| item.data.0.id.clone()).collect();
        let removed = prune_settled(&mut items, cutoff_ms);
        if removed == 0 {
            return Ok(0);
        }

        let kept: Vec<TargetId> = items.iter().map(|item| item.data.0.id.clone()).collect();
        for id in before.iter().filter(|id| !kept.contains(id)) {
            match std::fs::remove_file(self.item_path(id)) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        let mut index = self.list_index()?;
        index.retain(|entry| kept.contains(&entry.id));
        write_json_atomic(&self.root.join(INDEX_FILE), &index)?;
        Ok(removed)
    }

    fn modify<F>(&self, id: &TargetId, apply: F) -> Result<ItemFile, StoreError>
    where
        F: FnOnce(&mut ItemFile) -> Result<bool, StoreError>,
    {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(mut item) = self.get(id)? else {
            return Err(StoreError::UnknownId);
        };
        if apply(&mut item)? {
            self.write_item_locked(&item)?;
        }
        Ok(item)
    }

    fn write_item_locked(&self, item: &ItemFile) -> Result<(), StoreError> {
        write_json_atomic(&self.item_path(&item.metadata.id), item)?;

        let entry = item.index_entry()?;
        let mut index = self.list_index()?;
        match index.iter_mut().find(|existing| existing.id == entry.id) {
            Some(existing) => *existing = entry,
            None => index.push(entry),
        }
        write_json_atomic(&self.root.join(INDEX_FILE), &index)
    }

    fn item_path(&self, id: &TargetId) -> PathBuf {
        // Target ids may contain '/', which must not create nested directories.
        let file_name = id.as_str().replace('/', "__");
        self.root.join(ITEMS_DIR).join(format!("{file_name}.json"))
    }
}

fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// `YYYY-MM-DD` (UTC) used to bucket items in the index.
pub fn date_key(ts_ms: i64) -> Result<String, StoreError> {
    let nanos = i128::from(ts_ms) * 1_000_000;
    let at = OffsetDateTime::from_unix_timestamp_nanos(nanos).unwrap_or(OffsetDateTime::UNIX_EPOCH);
    Ok(at.format(format_description!("[year]-[month]-[day]"))?)
}
