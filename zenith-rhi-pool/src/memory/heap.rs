//! Page-based sub-allocator backing every pool.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use parking_lot::Mutex;
use zenith_core::log;
use crate::device_mask::DeviceIndex;
use crate::memory::{
    AllocationRecords, AllocationTrackingMode, GpuAddress, HeapMemoryLevel, MemoryPage, MemoryView,
    PoolMemoryUsage,
};
use crate::release::DeferRelease;
use crate::utility::align_up;
use crate::{rhi_assert, RhiError, RhiResult};

/// First address handed out on every device; zero stays an invalid address.
const ADDRESS_SPACE_BASE: GpuAddress = 0x1_0000;

/// Device-wide address space and physical capacity per heap level.
///
/// Page reservations fail with `OutOfMemory` once a level's capacity is committed.
#[derive(Debug)]
pub struct DeviceAddressSpace {
    device_index: DeviceIndex,
    next_address: AtomicU64,
    capacity: [u64; HeapMemoryLevel::COUNT],
    committed: [AtomicU64; HeapMemoryLevel::COUNT],
}

impl DeviceAddressSpace {
    pub fn new(device_index: DeviceIndex, host_capacity: u64, device_capacity: u64) -> Self {
        Self {
            device_index,
            next_address: AtomicU64::new(ADDRESS_SPACE_BASE),
            capacity: [host_capacity, device_capacity],
            committed: Default::default(),
        }
    }

    #[inline]
    pub fn device_index(&self) -> DeviceIndex { self.device_index }

    pub fn committed_bytes(&self, level: HeapMemoryLevel) -> u64 {
        self.committed[level.index()].load(Ordering::Acquire)
    }

    pub fn capacity(&self, level: HeapMemoryLevel) -> u64 {
        self.capacity[level.index()]
    }

    /// Commits a new page of `size` bytes, `alignment` applying to its base address.
    pub fn allocate_page(&self, level: HeapMemoryLevel, size: u64, alignment: u64) -> RhiResult<Arc<MemoryPage>> {
        let alignment = alignment.max(1);
        let span = align_up(size.max(1), alignment)
            .and_then(|span| span.checked_add(alignment))
            .ok_or(RhiError::OutOfMemory)?;
        let capacity = self.capacity(level);
        self.committed[level.index()]
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |committed| {
                let next = committed.checked_add(size)?;
                (capacity == 0 || next <= capacity).then_some(next)
            })
            .map_err(|_| {
                log::warn!(
                    "device {} out of {:?} memory: {} bytes requested, {} of {} committed",
                    self.device_index,
                    level,
                    size,
                    self.committed_bytes(level),
                    capacity,
                );
                RhiError::OutOfMemory
            })?;

        let page = self
            .next_address
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |next| next.checked_add(span))
            .ok()
            .and_then(|base| align_up(base, alignment))
            .ok_or(RhiError::OutOfMemory)
            .and_then(|base| MemoryPage::new(self.device_index, level, base, size));
        match page {
            Ok(page) => Ok(Arc::new(page)),
            Err(error) => {
                log::warn!("device {} could not back a {:?} page of {} bytes", self.device_index, level, size);
                self.uncommit(level, size);
                Err(error)
            }
        }
    }

    pub fn free_page(&self, page: &MemoryPage) {
        self.uncommit(page.level(), page.size());
    }

    fn uncommit(&self, level: HeapMemoryLevel, size: u64) {
        let _ = self.committed[level.index()]
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| Some(c.saturating_sub(size)));
    }
}

#[derive(Clone, Debug)]
pub struct HeapAllocatorDescriptor {
    pub level: HeapMemoryLevel,
    /// Size of a regular page; larger requests get a dedicated page.
    pub page_size: u64,
    /// Minimum alignment of every sub-allocation.
    pub alignment: u64,
    pub tracking: Option<AllocationTrackingMode>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct FreeBlock {
    offset: u64,
    size: u64,
}

struct HeapPage {
    page: Arc<MemoryPage>,
    size: u64,
    /// Sorted by offset, never adjacent.
    free_blocks: Vec<FreeBlock>,
}

impl HeapPage {
    fn try_allocate(&mut self, size: u64, alignment: u64) -> Option<u64> {
        let (index, aligned) = self.free_blocks.iter().enumerate().find_map(|(i, block)| {
            let aligned = align_up(block.offset, alignment)?;
            (aligned.checked_add(size)? <= block.offset + block.size).then_some((i, aligned))
        })?;

        let block = self.free_blocks.remove(index);
        let tail_offset = aligned + size;
        let tail_size = block.offset + block.size - tail_offset;
        if tail_size > 0 {
            self.free_blocks.insert(index, FreeBlock { offset: tail_offset, size: tail_size });
        }
        if aligned > block.offset {
            self.free_blocks.insert(index, FreeBlock { offset: block.offset, size: aligned - block.offset });
        }
        Some(aligned)
    }

    /// Returns `false` if the range overlaps memory that is already free.
    fn free(&mut self, offset: u64, size: u64) -> bool {
        let index = self.free_blocks.partition_point(|b| b.offset < offset);
        let overlaps_prev = index > 0 && {
            let prev = self.free_blocks[index - 1];
            prev.offset + prev.size > offset
        };
        let overlaps_next = self.free_blocks.get(index).is_some_and(|next| offset + size > next.offset);
        if overlaps_prev || overlaps_next {
            return false;
        }

        self.free_blocks.insert(index, FreeBlock { offset, size });
        if index + 1 < self.free_blocks.len() {
            let next = self.free_blocks[index + 1];
            if offset + size == next.offset {
                self.free_blocks[index].size += next.size;
                self.free_blocks.remove(index + 1);
            }
        }
        if index > 0 {
            let prev = self.free_blocks[index - 1];
            if prev.offset + prev.size == offset {
                self.free_blocks[index - 1].size += self.free_blocks[index].size;
                self.free_blocks.remove(index);
            }
        }
        true
    }

    fn is_empty(&self) -> bool {
        self.free_blocks.len() == 1 && self.free_blocks[0].size == self.size
    }
}

/// First-fit, coalescing sub-allocator over pages of one heap level.
///
/// Physical residency (pages) is reported to the pool's [`PoolMemoryUsage`]; budget
/// accounting of individual allocations is the pool's business.
pub struct HeapAllocator {
    name: String,
    descriptor: HeapAllocatorDescriptor,
    address_space: Arc<DeviceAddressSpace>,
    memory_usage: Arc<PoolMemoryUsage>,
    pages: Mutex<Vec<HeapPage>>,
    records: Option<AllocationRecords>,
}

impl HeapAllocator {
    pub fn new(
        name: &str,
        descriptor: HeapAllocatorDescriptor,
        address_space: Arc<DeviceAddressSpace>,
        memory_usage: Arc<PoolMemoryUsage>,
    ) -> Self {
        let records = descriptor
            .tracking
            .map(|mode| AllocationRecords::new(format!("{name}.records"), mode));
        Self {
            name: name.to_owned(),
            descriptor,
            address_space,
            memory_usage,
            pages: Mutex::new(Vec::new()),
            records,
        }
    }

    #[inline]
    pub fn name(&self) -> &str { &self.name }

    #[inline]
    pub fn level(&self) -> HeapMemoryLevel { self.descriptor.level }

    #[inline]
    pub fn records(&self) -> Option<&AllocationRecords> { self.records.as_ref() }

    #[profiling::function]
    pub fn allocate(self: &Arc<Self>, size: u64, alignment: u64) -> RhiResult<HeapAllocation> {
        if size == 0 {
            return Err(RhiError::InvalidArgument);
        }
        let alignment = alignment.max(self.descriptor.alignment).max(1);
        if !alignment.is_power_of_two() {
            return Err(RhiError::InvalidArgument);
        }

        let mut pages = self.pages.lock();
        let found = pages
            .iter_mut()
            .find_map(|page| page.try_allocate(size, alignment).map(|offset| (page.page.clone(), offset)));

        let (page, offset) = match found {
            Some(found) => found,
            None => {
                let page_size = self
                    .descriptor
                    .page_size
                    .max(align_up(size, alignment).ok_or(RhiError::OutOfMemory)?);
                let page = self.address_space.allocate_page(self.descriptor.level, page_size, alignment)?;
                self.memory_usage.heap(self.descriptor.level).add_resident(page_size);
                log::trace!("[{}] new {:?} page of {} bytes at {:#x}", self.name, self.descriptor.level, page_size, page.base_address());

                let mut heap_page = HeapPage {
                    page: page.clone(),
                    size: page_size,
                    free_blocks: vec![FreeBlock { offset: 0, size: page_size }],
                };
                let offset = heap_page
                    .try_allocate(size, alignment)
                    .ok_or(RhiError::OutOfMemory)?;
                pages.push(heap_page);
                (page, offset)
            }
        };
        drop(pages);

        let view = MemoryView::new(page, offset, size);
        if let Some(records) = &self.records {
            if let Err(error) = records.register_allocation(view.gpu_address(), size, size, alignment) {
                rhi_assert!(false, "[{}] {}", self.name, error);
            }
        }

        Ok(HeapAllocation {
            view,
            allocator: self.clone(),
        })
    }

    /// Returns the range of `view` to its page.
    pub fn deallocate(&self, view: &MemoryView) {
        if let Some(records) = &self.records {
            if let Err(error) = records.unregister_allocation(view.gpu_address()) {
                rhi_assert!(false, "[{}] {}", self.name, error);
            }
        }

        let mut pages = self.pages.lock();
        let Some(page) = pages.iter_mut().find(|p| Arc::ptr_eq(&p.page, view.page())) else {
            rhi_assert!(false, "[{}] deallocating {:#x} from a page this heap does not own", self.name, view.gpu_address());
            return;
        };
        let freed = page.free(view.offset(), view.size());
        rhi_assert!(freed, "[{}] double free of {:#x} ({} bytes)", self.name, view.gpu_address(), view.size());
    }

    /// `1 - largest free block / total free bytes`, zero when nothing is free.
    pub fn compute_fragmentation(&self) -> f32 {
        let pages = self.pages.lock();
        let (total, largest) = pages
            .iter()
            .flat_map(|p| p.free_blocks.iter())
            .fold((0u64, 0u64), |(total, largest), b| (total + b.size, largest.max(b.size)));
        let fragmentation = if total == 0 { 0.0 } else { 1.0 - largest as f32 / total as f32 };
        self.memory_usage.heap(self.descriptor.level).set_fragmentation(fragmentation);
        fragmentation
    }

    pub fn page_count(&self) -> usize {
        self.pages.lock().len()
    }

    /// Frees pages without any live sub-allocation.
    pub fn release_empty_pages(&self) -> usize {
        let mut pages = self.pages.lock();
        let before = pages.len();
        pages.retain(|p| {
            if p.is_empty() {
                self.address_space.free_page(&p.page);
                self.memory_usage.heap(self.descriptor.level).remove_resident(p.size);
                false
            } else {
                true
            }
        });
        before - pages.len()
    }

    /// Returns every page to the address space without touching the pool counters,
    /// for heaps retired after their pool already reset its accounting.
    pub(crate) fn release_pages_unaccounted(&self) {
        let mut pages = self.pages.lock();
        for page in pages.drain(..) {
            self.address_space.free_page(&page.page);
        }
    }

    /// Drops every page regardless of live allocations.
    pub fn clear(&self) {
        let mut pages = self.pages.lock();
        for page in pages.drain(..) {
            self.address_space.free_page(&page.page);
            self.memory_usage.heap(self.descriptor.level).remove_resident(page.size);
        }
        if let Some(records) = &self.records {
            records.clear();
        }
    }
}

/// A live sub-allocation. Hand it to [`HeapAllocation::free`] or to a release queue.
pub struct HeapAllocation {
    view: MemoryView,
    allocator: Arc<HeapAllocator>,
}

impl HeapAllocation {
    #[inline]
    pub fn view(&self) -> &MemoryView { &self.view }

    #[inline]
    pub fn size(&self) -> u64 { self.view.size() }

    #[inline]
    pub fn gpu_address(&self) -> GpuAddress { self.view.gpu_address() }

    pub fn free(self) {
        self.allocator.deallocate(&self.view);
    }
}

impl std::fmt::Debug for HeapAllocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeapAllocation")
            .field("heap", &self.allocator.name)
            .field("address", &format_args!("{:#x}", self.view.gpu_address()))
            .field("size", &self.view.size())
            .finish()
    }
}

impl DeferRelease for HeapAllocation {
    fn size_in_bytes(&self) -> u64 {
        self.view.size()
    }

    fn release(self: Box<Self>) {
        self.free();
    }
}

/// Keeps a heap's pages committed until the GPU is done with the frame its pool
/// was shut down in.
pub(crate) struct RetiredHeap(pub Arc<HeapAllocator>);

impl DeferRelease for RetiredHeap {
    fn release(self: Box<Self>) {
        log::trace!("[{}] retired with {} page(s)", self.0.name, self.0.page_count());
        self.0.release_pages_unaccounted();
    }
}
