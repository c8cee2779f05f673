#![forbid(unsafe_code)]

use crate::error::{RuntimeError, RuntimeResult};
use std::sync::{Arc, Mutex, PoisonError};
use tt_storage::{SqliteStore, StoreError};

/// Process-wide handle to the single-writer store. Every call holds the lock for one
/// store operation, which serializes writes per record.
///
/// `with` runs on the calling thread and suits one-off calls. Loops that touch the store on
/// every tick go through `run`, which moves the SQLite I/O onto the blocking pool.
#[derive(Clone, Debug)]
pub struct SharedStore {
    inner: Arc<Mutex<SqliteStore>>,
}

impl SharedStore {
    pub fn new(store: SqliteStore) -> Self {
        Self {
            inner: Arc::new(Mutex::new(store)),
        }
    }

    pub fn in_memory() -> RuntimeResult<Self> {
        Ok(Self::new(SqliteStore::open_in_memory()?))
    }

    pub fn with<T>(
        &self,
        op: impl FnOnce(&mut SqliteStore) -> Result<T, StoreError>,
    ) -> RuntimeResult<T> {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(op(&mut guard)?)
    }

    pub async fn run<T, F>(&self, op: F) -> RuntimeResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut SqliteStore) -> Result<T, StoreError> + Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.with(op))
            .await
            .map_err(|err| RuntimeError::Internal(format!("store task failed: {err}")))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tt_core::{JobKind, TargetId};
    use tt_storage::JobCreateRequest;

    #[tokio::test]
    async fn blocking_runs_see_the_same_store() {
        let store = SharedStore::in_memory().expect("store");
        let created = store
            .run(|store| {
                store.job_create(JobCreateRequest {
                    kind: JobKind::ChatReply,
                    target_id: TargetId::try_new("topic-1").expect("target"),
                    input: json!({"prompt": "hi"}),
                })
            })
            .await
            .expect("create on the blocking pool");

        let read = store
            .with(|store| store.job_get(&created.id))
            .expect("read")
            .expect("job exists");
        assert_eq!(read.id, created.id);
    }
}
