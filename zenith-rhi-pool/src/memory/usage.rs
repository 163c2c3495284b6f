//! Per-pool memory accounting.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Residency of a heap: CPU-visible or GPU-local.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum HeapMemoryLevel {
    Host,
    #[default]
    Device,
}

impl HeapMemoryLevel {
    pub const COUNT: usize = 2;
    pub const ALL: [HeapMemoryLevel; Self::COUNT] = [HeapMemoryLevel::Host, HeapMemoryLevel::Device];

    #[inline]
    pub fn index(self) -> usize {
        match self {
            HeapMemoryLevel::Host => 0,
            HeapMemoryLevel::Device => 1,
        }
    }
}

/// Counters of a single heap level. Updated concurrently, read through [`snapshot`](Self::snapshot).
#[derive(Debug, Default)]
pub struct HeapMemoryUsage {
    budget_in_bytes: AtomicU64,
    total_resident_in_bytes: AtomicU64,
    used_resident_in_bytes: AtomicU64,
    unique_allocation_bytes: AtomicU64,
    fragmentation_bits: AtomicU32,
}

impl HeapMemoryUsage {
    #[inline]
    pub fn budget_in_bytes(&self) -> u64 {
        self.budget_in_bytes.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set_budget_in_bytes(&self, budget: u64) {
        self.budget_in_bytes.store(budget, Ordering::Relaxed);
    }

    /// Atomically checks the budget and accounts `size_in_bytes` as used. A zero
    /// budget is unlimited.
    pub fn try_reserve(&self, size_in_bytes: u64) -> bool {
        let budget = self.budget_in_bytes();
        self.used_resident_in_bytes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                let next = used.saturating_add(size_in_bytes);
                (budget == 0 || next <= budget).then_some(next)
            })
            .is_ok()
    }

    pub fn release_used(&self, size_in_bytes: u64) {
        saturating_sub(&self.used_resident_in_bytes, size_in_bytes);
    }

    pub fn add_resident(&self, size_in_bytes: u64) {
        self.total_resident_in_bytes.fetch_add(size_in_bytes, Ordering::AcqRel);
        self.unique_allocation_bytes.fetch_add(size_in_bytes, Ordering::AcqRel);
    }

    pub fn remove_resident(&self, size_in_bytes: u64) {
        saturating_sub(&self.total_resident_in_bytes, size_in_bytes);
        saturating_sub(&self.unique_allocation_bytes, size_in_bytes);
    }

    #[inline]
    pub fn used_resident_in_bytes(&self) -> u64 {
        self.used_resident_in_bytes.load(Ordering::Acquire)
    }

    #[inline]
    pub fn total_resident_in_bytes(&self) -> u64 {
        self.total_resident_in_bytes.load(Ordering::Acquire)
    }

    pub fn set_fragmentation(&self, fragmentation: f32) {
        self.fragmentation_bits.store(fragmentation.to_bits(), Ordering::Relaxed);
    }

    pub fn fragmentation(&self) -> f32 {
        f32::from_bits(self.fragmentation_bits.load(Ordering::Relaxed))
    }

    pub fn reset(&self) {
        self.budget_in_bytes.store(0, Ordering::Relaxed);
        self.total_resident_in_bytes.store(0, Ordering::Release);
        self.used_resident_in_bytes.store(0, Ordering::Release);
        self.unique_allocation_bytes.store(0, Ordering::Release);
        self.fragmentation_bits.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> HeapMemoryUsageSnapshot {
        HeapMemoryUsageSnapshot {
            budget_in_bytes: self.budget_in_bytes(),
            total_resident_in_bytes: self.total_resident_in_bytes(),
            used_resident_in_bytes: self.used_resident_in_bytes(),
            unique_allocation_bytes: self.unique_allocation_bytes.load(Ordering::Acquire),
            fragmentation: self.fragmentation(),
        }
    }
}

fn saturating_sub(counter: &AtomicU64, value: u64) {
    let _ = counter.fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
        Some(current.saturating_sub(value))
    });
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct HeapMemoryUsageSnapshot {
    pub budget_in_bytes: u64,
    pub total_resident_in_bytes: u64,
    pub used_resident_in_bytes: u64,
    pub unique_allocation_bytes: u64,
    pub fragmentation: f32,
}

/// Memory counters of a pool: one [`HeapMemoryUsage`] per level plus the per-frame
/// transfer counters, which `OnFrameBegin` overwrites with zero.
#[derive(Debug, Default)]
pub struct PoolMemoryUsage {
    heaps: [HeapMemoryUsage; HeapMemoryLevel::COUNT],
    transfer_pull_bytes: AtomicU64,
    transfer_push_bytes: AtomicU64,
}

impl PoolMemoryUsage {
    #[inline]
    pub fn heap(&self, level: HeapMemoryLevel) -> &HeapMemoryUsage {
        &self.heaps[level.index()]
    }

    pub fn add_transfer_pull(&self, bytes: u64) {
        self.transfer_pull_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_transfer_push(&self, bytes: u64) {
        self.transfer_push_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn reset_transfer_counters(&self) {
        self.transfer_pull_bytes.store(0, Ordering::Relaxed);
        self.transfer_push_bytes.store(0, Ordering::Relaxed);
    }

    pub fn reset(&self) {
        for heap in &self.heaps {
            heap.reset();
        }
        self.reset_transfer_counters();
    }

    pub fn snapshot(&self) -> PoolMemoryUsageSnapshot {
        PoolMemoryUsageSnapshot {
            heaps: [self.heaps[0].snapshot(), self.heaps[1].snapshot()],
            transfer_pull_bytes: self.transfer_pull_bytes.load(Ordering::Relaxed),
            transfer_push_bytes: self.transfer_push_bytes.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PoolMemoryUsageSnapshot {
    pub heaps: [HeapMemoryUsageSnapshot; HeapMemoryLevel::COUNT],
    pub transfer_pull_bytes: u64,
    pub transfer_push_bytes: u64,
}

impl PoolMemoryUsageSnapshot {
    #[inline]
    pub fn heap(&self, level: HeapMemoryLevel) -> &HeapMemoryUsageSnapshot {
        &self.heaps[level.index()]
    }
}
