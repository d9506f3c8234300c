//! # Observer Lists
//!
//! Explicit subscription lists for object and manager events.
//!
//! Callbacks run synchronously on whichever thread raised the event (the
//! link reader for inbound packets, the writer for transaction timeouts,
//! the caller for local updates). The list lock is only held while copying
//! the subscriber handles, never while a callback runs, so a callback may
//! subscribe, unsubscribe or touch the object that notified it.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Handle returned by every `add_*_observer` call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

static NEXT_SUBSCRIPTION: AtomicU64 = AtomicU64::new(1);

impl SubscriptionId {
    fn next() -> Self {
        SubscriptionId(NEXT_SUBSCRIPTION.fetch_add(1, Ordering::Relaxed))
    }
}

/// Ordered list of callbacks of one event kind
pub struct ObserverList<F: ?Sized> {
    observers: Mutex<Vec<(SubscriptionId, Arc<F>)>>,
}

impl<F: ?Sized> Default for ObserverList<F> {
    fn default() -> Self {
        Self {
            observers: Mutex::new(Vec::new()),
        }
    }
}

impl<F: ?Sized> std::fmt::Debug for ObserverList<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserverList")
            .field("len", &self.len())
            .finish()
    }
}

impl<F: ?Sized> ObserverList<F> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, observer: Arc<F>) -> SubscriptionId {
        let id = SubscriptionId::next();
        self.observers.lock().push((id, observer));
        id
    }

    /// Returns true if the subscription was present
    pub fn remove(&self, id: SubscriptionId) -> bool {
        let mut observers = self.observers.lock();
        let before = observers.len();
        observers.retain(|(sub, _)| *sub != id);
        observers.len() != before
    }

    pub fn len(&self) -> usize {
        self.observers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the current subscribers, in subscription order
    ///
    /// Callers invoke the returned handles after the list lock is released.
    pub fn snapshot(&self) -> Vec<Arc<F>> {
        self.observers
            .lock()
            .iter()
            .map(|(_, observer)| observer.clone())
            .collect()
    }
}
