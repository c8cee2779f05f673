#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio_util::sync::CancellationToken;
use tt_core::JobId;

/// A registered AI session. `generation` tells a stale handle apart from its replacement.
#[derive(Clone, Debug)]
pub struct Session {
    pub token: CancellationToken,
    generation: u64,
}

#[derive(Debug, Default)]
struct Sessions {
    next_generation: u64,
    live: HashMap<JobId, Session>,
}

/// Process-wide map of live AI sessions keyed by job id, so a cancel request can tear a
/// session down out-of-band.
#[derive(Clone, Debug, Default)]
pub struct SessionRegistry {
    inner: Arc<Mutex<Sessions>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a fresh session. A previous session for the same job is cancelled.
    pub fn register(&self, job_id: &JobId) -> Session {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.next_generation += 1;
        let session = Session {
            token: CancellationToken::new(),
            generation: inner.next_generation,
        };
        if let Some(previous) = inner.live.insert(job_id.clone(), session.clone()) {
            previous.token.cancel();
        }
        session
    }

    pub fn cancel(&self, job_id: &JobId) -> bool {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        match inner.live.get(job_id) {
            Some(session) => {
                session.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Removes the entry only while it still belongs to `session`.
    pub fn unregister(&self, job_id: &JobId, session: &Session) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if inner
            .live
            .get(job_id)
            .is_some_and(|current| current.generation == session.generation)
        {
            inner.live.remove(job_id);
        }
    }

    pub fn is_registered(&self, job_id: &JobId) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .live
            .contains_key(job_id)
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .live
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_reaches_registered_session() {
        let sessions = SessionRegistry::new();
        let job = JobId::from_seq(1);
        assert!(!sessions.cancel(&job));

        let session = sessions.register(&job);
        assert!(sessions.cancel(&job));
        assert!(session.token.is_cancelled());

        sessions.unregister(&job, &session);
        assert!(sessions.is_empty());
    }

    #[test]
    fn stale_unregister_keeps_replacement() {
        let sessions = SessionRegistry::new();
        let job = JobId::from_seq(1);
        let first = sessions.register(&job);
        let second = sessions.register(&job);
        assert!(first.token.is_cancelled());
        assert!(!second.token.is_cancelled());

        sessions.unregister(&job, &first);
        assert!(sessions.is_registered(&job));
        sessions.unregister(&job, &second);
        assert!(!sessions.is_registered(&job));
    }
}
