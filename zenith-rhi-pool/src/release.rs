//! Fence-gated deferred release.
//!
//! Objects the GPU may still read are queued with the fence value of the frame that
//! last touched them and released once the device reports that value as completed.

use std::collections::VecDeque;
use zenith_core::log;
use crate::rhi_assert;

pub trait DeferRelease: Send + 'static {
    /// Bytes returned to the allocator when released, for statistics.
    fn size_in_bytes(&self) -> u64 {
        0
    }

    fn release(self: Box<Self>);
}

/// Keeps `T` alive until the release queue drops it.
pub struct DeferredDrop<T: Send + 'static>(pub T);

impl<T: Send + 'static> DeferRelease for DeferredDrop<T> {
    fn release(self: Box<Self>) {
        drop(self);
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LastFreedStats {
    pub object_count: usize,
    pub bytes: u64,
    /// Completed fence value the last collection ran against.
    pub completed_fence_value: u64,
}

struct PendingRelease {
    fence_value: u64,
    object: Box<dyn DeferRelease>,
}

#[derive(Default)]
pub struct ReleaseQueue {
    pending: VecDeque<PendingRelease>,
    last_freed: LastFreedStats,
}

impl ReleaseQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `object` until `fence_value` completes. Values must be queued in
    /// non-decreasing order.
    pub fn queue_for_release(&mut self, fence_value: u64, object: Box<dyn DeferRelease>) {
        if let Some(back) = self.pending.back() {
            rhi_assert!(
                back.fence_value <= fence_value,
                "release queued for fence {} after fence {}",
                fence_value,
                back.fence_value
            );
        }
        self.pending.push_back(PendingRelease { fence_value, object });
    }

    /// Releases everything whose fence value is `<= completed_fence_value`.
    pub fn collect(&mut self, completed_fence_value: u64) -> LastFreedStats {
        let mut stats = LastFreedStats {
            completed_fence_value,
            ..Default::default()
        };
        while self.pending.front().is_some_and(|p| p.fence_value <= completed_fence_value) {
            if let Some(entry) = self.pending.pop_front() {
                stats.object_count += 1;
                stats.bytes += entry.object.size_in_bytes();
                entry.object.release();
            }
        }
        if stats.object_count > 0 {
            log::trace!(
                "released {} deferred objects ({} bytes) up to fence {}",
                stats.object_count,
                stats.bytes,
                completed_fence_value
            );
        }
        self.last_freed = stats;
        stats
    }

    pub fn release_all(&mut self) -> LastFreedStats {
        self.collect(u64::MAX)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn pending_bytes(&self) -> u64 {
        self.pending.iter().map(|p| p.object.size_in_bytes()).sum()
    }

    #[inline]
    pub fn last_freed(&self) -> &LastFreedStats {
        &self.last_freed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Tracked {
        bytes: u64,
        released: Arc<AtomicUsize>,
    }

    impl DeferRelease for Tracked {
        fn size_in_bytes(&self) -> u64 {
            self.bytes
        }

        fn release(self: Box<Self>) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn releases_only_completed_fences() {
        let released = Arc::new(AtomicUsize::new(0));
        let mut queue = ReleaseQueue::new();
        for fence in [1, 1, 2, 3] {
            queue.queue_for_release(fence, Box::new(Tracked { bytes: 10, released: released.clone() }));
        }

        assert_eq!(queue.collect(0).object_count, 0);
        let stats = queue.collect(1);
        assert_eq!(stats.object_count, 2);
        assert_eq!(stats.bytes, 20);
        assert_eq!(released.load(Ordering::SeqCst), 2);
        assert_eq!(queue.pending_bytes(), 20);

        queue.release_all();
        assert!(queue.is_empty());
        assert_eq!(released.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn deferred_drop_keeps_value_alive_until_release() {
        let value = Arc::new(5u32);
        let mut queue = ReleaseQueue::new();
        queue.queue_for_release(4, Box::new(DeferredDrop(value.clone())));
        queue.collect(3);
        assert_eq!(Arc::strong_count(&value), 2);
        queue.collect(4);
        assert_eq!(Arc::strong_count(&value), 1);
        assert_eq!(queue.last_freed().object_count, 1);
    }
}
