use std::collections::HashMap;
use std::hash::Hash;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};

use tracing::warn;

/// An event that can be routed by kind.
pub trait BusEvent {
    type Kind: Copy + Eq + Hash + std::fmt::Debug;

    fn kind(&self) -> Self::Kind;
}

pub type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Publish/subscribe registry with per-kind listener lists.
///
/// Delivery is best-effort: a panicking listener is logged and skipped,
/// and the remaining listeners still run.
pub struct EventBus<E: BusEvent> {
    listeners: RwLock<HashMap<E::Kind, Vec<Listener<E>>>>,
}

impl<E: BusEvent> EventBus<E> {
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(HashMap::new()),
        }
    }

    /// Register a listener for one event kind.
    pub fn on(&self, kind: E::Kind, listener: impl Fn(&E) + Send + Sync + 'static) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(kind)
            .or_default()
            .push(Arc::new(listener));
    }

    /// Deliver an event to every listener registered for its kind.
    pub fn emit(&self, event: &E) {
        // Snapshot so listeners may register further listeners.
        let listeners: Vec<Listener<E>> = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&event.kind())
            .cloned()
            .unwrap_or_default();

        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                warn!(kind = ?event.kind(), "Event listener panicked");
            }
        }
    }

    pub fn listener_count(&self, kind: E::Kind) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .map_or(0, Vec::len)
    }
}

impl<E: BusEvent> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}
