use parking_lot::RwLock;
use std::sync::Arc;

// a shared slot holding the currently published value. readers keep the Arc
// they loaded, so a swap never changes a value under them
pub struct SnapshotCell<T> {
    slot: Arc<RwLock<Option<Arc<T>>>>,
}

impl<T> SnapshotCell<T> {
    pub fn empty() -> SnapshotCell<T> {
        SnapshotCell {
            slot: Arc::new(RwLock::new(None)),
        }
    }

    pub fn load(&self) -> Option<Arc<T>> {
        self.slot.read().clone()
    }

    // swaps `value` in, returning the snapshot it replaced
    pub fn publish(&self, value: T) -> Option<Arc<T>> {
        let next = Arc::new(value);
        let mut slot = self.slot.write();
        slot.replace(next)
    }

    // empties the slot; readers holding the old value keep it
    pub fn clear(&self) -> Option<Arc<T>> {
        self.slot.write().take()
    }

    pub fn is_published(&self) -> bool {
        self.slot.read().is_some()
    }
}

impl<T> Clone for SnapshotCell<T> {
    fn clone(&self) -> Self {
        SnapshotCell {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<T> Default for SnapshotCell<T> {
    fn default() -> Self {
        SnapshotCell::empty()
    }
}
