//! Named event dispatch.
//!
//! An [`Emitter`] maps event names to the listeners registered for them.
//! Listeners for one name run in registration order. Dispatch works on a
//! snapshot of the listener list, so a listener may register or remove
//! listeners (including for the name being dispatched) without deadlocking;
//! such changes take effect from the next emit.

use dashmap::DashMap;
use std::fmt;
use std::sync::Arc;
use tracing::trace;

/// A registered callback
pub type Listener<A> = Arc<dyn Fn(&A) + Send + Sync>;

/// Registry of named listeners taking `&A`
pub struct Emitter<A> {
    listeners: DashMap<String, Vec<Listener<A>>>,
}

impl<A> Emitter<A> {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            listeners: DashMap::new(),
        }
    }

    /// Register `listener` for `name`, after any existing ones
    pub fn on<F>(&self, name: &str, listener: F)
    where
        F: Fn(&A) + Send + Sync + 'static,
    {
        self.listeners
            .entry(name.to_string())
            .or_default()
            .push(Arc::new(listener));
    }

    /// Remove every listener for `name`, returning how many were removed
    pub fn off(&self, name: &str) -> usize {
        self.listeners
            .remove(name)
            .map(|(_, removed)| removed.len())
            .unwrap_or(0)
    }

    /// Invoke the listeners for `name` in registration order.
    ///
    /// Returns the number of listeners invoked.
    pub fn emit(&self, name: &str, args: &A) -> usize {
        // Clone the list so no map guard is held while user code runs
        let snapshot: Vec<Listener<A>> = match self.listeners.get(name) {
            Some(entry) => entry.value().clone(),
            None => return 0,
        };

        trace!("Dispatching {} to {} listener(s)", name, snapshot.len());
        for listener in &snapshot {
            listener(args);
        }
        snapshot.len()
    }

    /// Drop every listener
    pub fn clear(&self) {
        self.listeners.clear();
    }

    /// Number of listeners registered for `name`
    pub fn listener_count(&self, name: &str) -> usize {
        self.listeners.get(name).map(|entry| entry.len()).unwrap_or(0)
    }
}

impl<A> Default for Emitter<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A> fmt::Debug for Emitter<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<String> = self.listeners.iter().map(|e| e.key().clone()).collect();
        names.sort();
        f.debug_struct("Emitter").field("events", &names).finish()
    }
}
