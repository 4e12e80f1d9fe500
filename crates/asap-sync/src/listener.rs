//! Listener registry keyed by id.
//!
//! Components hold a registry instead of references back to their
//! observers; observers unregister with the id they were given.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

/// Handle returned by [`ListenerRegistry::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ListenerId(u64);

/// Set of listeners of one kind.
pub struct ListenerRegistry<L: ?Sized> {
    next_id: AtomicU64,
    listeners: RwLock<BTreeMap<ListenerId, Arc<L>>>,
}

impl<L: ?Sized> ListenerRegistry<L> {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(0),
            listeners: RwLock::new(BTreeMap::new()),
        }
    }

    /// Add a listener.
    pub fn register(&self, listener: Arc<L>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, listener);
        id
    }

    /// Remove a listener. Returns whether it was registered.
    pub fn unregister(&self, id: ListenerId) -> bool {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .is_some()
    }

    /// Listeners in registration order.
    ///
    /// Callbacks run on this copy so a listener may unregister itself.
    pub fn snapshot(&self) -> Vec<Arc<L>> {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Number of registered listeners.
    pub fn len(&self) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether no listener is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<L: ?Sized> Default for ListenerRegistry<L> {
    fn default() -> Self {
        Self::new()
    }
}
