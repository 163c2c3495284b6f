//! Per-device notification channels: frame phases and memory statistics.

use std::sync::{Arc, Weak};
use parking_lot::RwLock;
use zenith_core::collections::SmallVec;
use crate::id::ObjectId;
use crate::memory::MemoryStatisticsBuilder;

/// Receives the frame phases of one device, in order, once per frame.
pub trait FrameEventHandler: Send + Sync {
    fn on_frame_begin(&self) {}

    fn on_frame_compile(&self) {}

    fn on_frame_end(&self) {}
}

pub trait MemoryStatisticsHandler: Send + Sync {
    fn report_memory_usage(&self, builder: &mut MemoryStatisticsBuilder);
}

/// Weak subscriber list keyed by object id.
///
/// Notification works on a snapshot so handlers may subscribe or unsubscribe
/// while being notified.
pub(crate) struct Subscribers<T: ?Sized> {
    entries: RwLock<Vec<(ObjectId, Weak<T>)>>,
}

impl<T: ?Sized> Default for Subscribers<T> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
        }
    }
}

impl<T: ?Sized> Subscribers<T> {
    /// Returns `false` if `id` is already subscribed.
    pub fn subscribe(&self, id: ObjectId, subscriber: Weak<T>) -> bool {
        let mut entries = self.entries.write();
        if entries.iter().any(|(existing, _)| *existing == id) {
            return false;
        }
        entries.push((id, subscriber));
        true
    }

    pub fn unsubscribe(&self, id: ObjectId) -> bool {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|(existing, _)| *existing != id);
        entries.len() != before
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        self.entries.read().iter().any(|(existing, _)| *existing == id)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Live subscribers in subscription order. Dead entries are skipped.
    pub fn snapshot(&self) -> SmallVec<[Arc<T>; 8]> {
        self.entries.read().iter().filter_map(|(_, s)| s.upgrade()).collect()
    }
}
