#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex, PoisonError, Weak};

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct ListenerSet<T> {
    next_id: u64,
    callbacks: Vec<(u64, Callback<T>)>,
}

/// Callback fan-out. Callbacks run outside the lock, so they may subscribe or unsubscribe.
pub struct Listeners<T> {
    inner: Arc<Mutex<ListenerSet<T>>>,
}

impl<T> Clone for Listeners<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for Listeners<T> {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(ListenerSet {
                next_id: 0,
                callbacks: Vec::new(),
            })),
        }
    }
}

impl<T: 'static> Listeners<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, callback: impl Fn(&T) + Send + Sync + 'static) -> Subscription {
        let id = {
            let mut set = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            set.next_id += 1;
            let id = set.next_id;
            set.callbacks.push((id, Arc::new(callback)));
            id
        };
        let weak: Weak<Mutex<ListenerSet<T>>> = Arc::downgrade(&self.inner);
        Subscription {
            remove: Some(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .callbacks
                        .retain(|(existing, _)| *existing != id);
                }
            })),
        }
    }

    pub fn notify(&self, value: &T) {
        let callbacks: Vec<Callback<T>> = self
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .callbacks
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect();
        for callback in callbacks {
            callback(value);
        }
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .callbacks
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Returned by `subscribe`. Dropping it keeps the listener; call [`Subscription::unsubscribe`].
#[must_use = "keep the subscription to unsubscribe later"]
pub struct Subscription {
    remove: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn unsubscribe(mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }

    /// Runs `after` once the listener has been removed.
    pub(crate) fn and_then(mut self, after: impl FnOnce() + Send + Sync + 'static) -> Self {
        let remove = self.remove.take();
        Self {
            remove: Some(Box::new(move || {
                if let Some(remove) = remove {
                    remove();
                }
                after();
            })),
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.remove.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn notify_reaches_every_listener_until_unsubscribed() {
        let listeners = Listeners::<u32>::new();
        let total = Arc::new(AtomicUsize::new(0));

        let first = {
            let total = Arc::clone(&total);
            listeners.subscribe(move |v| {
                total.fetch_add(*v as usize, Ordering::SeqCst);
            })
        };
        let second = {
            let total = Arc::clone(&total);
            listeners.subscribe(move |v| {
                total.fetch_add(*v as usize * 10, Ordering::SeqCst);
            })
        };

        listeners.notify(&1);
        assert_eq!(total.load(Ordering::SeqCst), 11);

        first.unsubscribe();
        listeners.notify(&1);
        assert_eq!(total.load(Ordering::SeqCst), 21);
        assert_eq!(listeners.len(), 1);

        drop(listeners);
        second.unsubscribe();
    }

    #[test]
    fn chained_cleanup_runs_after_removal() {
        let listeners = Listeners::<u32>::new();
        let seen = Arc::new(AtomicUsize::new(usize::MAX));
        let subscription = {
            let listeners = listeners.clone();
            let seen = Arc::clone(&seen);
            listeners.subscribe(|_| {}).and_then(move || {
                seen.store(listeners.len(), Ordering::SeqCst);
            })
        };

        assert_eq!(listeners.len(), 1);
        subscription.unsubscribe();
        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }
}
