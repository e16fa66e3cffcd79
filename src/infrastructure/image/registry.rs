//! Slot expectation tracking for the staleness guard.

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::trace;

use crate::domain::entities::{ImageId, SlotId};

/// Records which key each slot currently waits for.
///
/// Only the latest expectation per slot is kept. The registry never owns the
/// slots themselves; retired slots must be removed with [`Self::forget`].
#[derive(Debug, Default)]
pub struct ConsumerRegistry {
    expected: Mutex<HashMap<SlotId, ImageId>>,
}

impl ConsumerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that `slot` now waits for `id`, replacing any earlier expectation.
    pub fn expect(&self, slot: SlotId, id: ImageId) {
        trace!(%slot, id = %id, "Slot expectation updated");
        self.expected.lock().insert(slot, id);
    }

    /// Returns true if `slot` no longer waits for `id`.
    #[must_use]
    pub fn is_stale(&self, slot: SlotId, id: &ImageId) -> bool {
        self.expected.lock().get(&slot) != Some(id)
    }

    /// Drops a retired slot, returning the key it was waiting for.
    pub fn forget(&self, slot: SlotId) -> Option<ImageId> {
        self.expected.lock().remove(&slot)
    }

    /// Number of tracked slots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.expected.lock().len()
    }

    /// Returns true if no slot is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
