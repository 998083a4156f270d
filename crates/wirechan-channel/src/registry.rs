use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque registration token returned by listener/handler registration.
///
/// Removal is by token, so registering the same closure twice yields two
/// independent registrations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl ListenerId {
    pub(crate) fn next() -> Self {
        ListenerId(NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Insertion-ordered listener list with removal by token.
pub(crate) struct Listeners<F> {
    entries: Vec<(ListenerId, F)>,
}

impl<F> Listeners<F> {
    pub(crate) fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub(crate) fn add(&mut self, listener: F) -> ListenerId {
        let id = ListenerId::next();
        self.entries.push((id, listener));
        id
    }

    /// Remove the registration with this token. Returns false if absent.
    pub(crate) fn remove(&mut self, id: ListenerId) -> bool {
        match self.entries.iter().position(|(entry_id, _)| *entry_id == id) {
            Some(idx) => {
                self.entries.remove(idx);
                true
            }
            None => false,
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<F: Clone> Listeners<F> {
    /// Clone out the current listeners so callbacks run without holding the
    /// registry lock (a listener may add or remove listeners re-entrantly).
    pub(crate) fn snapshot(&self) -> Vec<F> {
        self.entries
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect()
    }
}

/// Lock a registry mutex, recovering the data if a panicking listener
/// poisoned it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
