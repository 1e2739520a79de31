//! Per-context handler storage.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::event::EventKind;

/// At most one handler per event kind.
///
/// Lookups hand out an `Arc`, so a dispatch that already fetched its handler
/// keeps running the old one when it is replaced concurrently.
pub struct HandlerRegistry<F> {
    slots: RwLock<[Option<Arc<F>>; EventKind::COUNT]>,
}

impl<F> HandlerRegistry<F> {
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(std::array::from_fn(|_| None)),
        }
    }

    /// Install a handler, replacing any previous one for `kind`.
    pub fn set(&self, kind: EventKind, handler: F) {
        let previous = self.slots.write()[kind.index()].replace(Arc::new(handler));
        // Released outside the lock; a handler's drop may call back into its runtime.
        drop(previous);
    }

    pub fn get(&self, kind: EventKind) -> Option<Arc<F>> {
        self.slots.read()[kind.index()].clone()
    }

    pub fn clear(&self, kind: EventKind) {
        let previous = self.slots.write()[kind.index()].take();
        drop(previous);
    }

    /// Release every handler. Used on destroy and reinitialise.
    pub fn clear_all(&self) {
        let previous = std::mem::replace(&mut *self.slots.write(), std::array::from_fn(|_| None));
        drop(previous);
    }

    pub fn len(&self) -> usize {
        self.slots.read().iter().filter(|slot| slot.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<F> Default for HandlerRegistry<F> {
    fn default() -> Self {
        Self::new()
    }
}
