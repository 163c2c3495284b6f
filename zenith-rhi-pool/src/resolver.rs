//! Staging helper of device-resident buffer pools.

use std::sync::Arc;
use parking_lot::{Mutex, RwLock};
use zenith_core::log;
use zenith_rhi_derive::DeviceObject;
use crate::buffer::Buffer;
use crate::device::{Device, DeviceObject};
use crate::id::ObjectId;
use crate::memory::{
    HeapAllocation, HeapAllocator, HeapAllocatorDescriptor, HeapMemoryLevel, MemoryView, PoolMemoryUsage,
    RetiredHeap,
};
use crate::queue::HardwareQueueClass;
use crate::{RhiError, RhiResult};

const STAGING_PAGE_SIZE: u64 = 64 * 1024;
const STAGING_ALIGNMENT: u64 = 16;

struct StagingCopy {
    buffer_id: ObjectId,
    staging: HeapAllocation,
    destination: MemoryView,
}

/// Maps device-resident buffers through host staging memory.
///
/// `map_buffer` reads the current contents back into a staging block (counted as
/// transfer-pull bytes of the owning pool). `unmap_buffer` queues the staging block for
/// upload, and the queued copies run on a copy command list when the frame compiles.
#[DeviceObject]
pub struct BufferPoolResolver {
    name: String,
    pool_usage: Arc<PoolMemoryUsage>,
    staging_usage: Arc<PoolMemoryUsage>,
    staging_heap: RwLock<Option<Arc<HeapAllocator>>>,
    mapped: Mutex<Vec<StagingCopy>>,
    pending: Mutex<Vec<StagingCopy>>,
}

impl BufferPoolResolver {
    pub fn new(name: impl Into<String>, pool_usage: Arc<PoolMemoryUsage>) -> Self {
        Self {
            name: name.into(),
            pool_usage,
            staging_usage: Arc::new(PoolMemoryUsage::default()),
            staging_heap: RwLock::new(None),
            mapped: Mutex::new(Vec::new()),
            pending: Mutex::new(Vec::new()),
            device: Default::default(),
        }
    }

    #[inline]
    pub fn name(&self) -> &str { &self.name }

    /// Staging memory, accounted apart from the pool budget.
    #[inline]
    pub fn staging_memory_usage(&self) -> &Arc<PoolMemoryUsage> { &self.staging_usage }

    pub fn init(&self, device: &Arc<Device>) -> RhiResult {
        if self.is_initialized() {
            return Err(RhiError::InvalidOperation);
        }
        let heap = HeapAllocator::new(
            &format!("{}.staging", self.name),
            HeapAllocatorDescriptor {
                level: HeapMemoryLevel::Host,
                page_size: STAGING_PAGE_SIZE,
                alignment: STAGING_ALIGNMENT,
                tracking: device.descriptor().allocation_tracking,
            },
            device.address_space().clone(),
            self.staging_usage.clone(),
        );
        *self.staging_heap.write() = Some(Arc::new(heap));
        self.device.bind(device);
        Ok(())
    }

    fn staging_heap(&self) -> RhiResult<Arc<HeapAllocator>> {
        self.staging_heap.read().clone().ok_or(RhiError::InvalidOperation)
    }

    /// Returns a staging view holding the current contents of `byte_offset..byte_offset + byte_count`.
    #[profiling::function]
    pub fn map_buffer(&self, buffer: &Buffer, byte_offset: u64, byte_count: u64) -> RhiResult<MemoryView> {
        let end = byte_offset.checked_add(byte_count).ok_or(RhiError::InvalidArgument)?;
        let destination = buffer
            .memory_view()
            .ok_or(RhiError::InvalidOperation)?
            .slice(byte_offset..end)?;
        let staging = self.staging_heap()?.allocate(byte_count, STAGING_ALIGNMENT)?;
        let view = match staging.view().copy_from(&destination).and_then(|_| staging.view().slice(..)) {
            Ok(view) => view,
            Err(error) => {
                staging.free();
                return Err(error);
            }
        };
        self.pool_usage.add_transfer_pull(byte_count);

        self.mapped.lock().push(StagingCopy {
            buffer_id: buffer.base().id(),
            staging,
            destination,
        });
        log::trace!("[{}] mapped '{}' through {} staging bytes", self.name, buffer.name(), byte_count);
        Ok(view)
    }

    /// Queues the most recently mapped range of `buffer` for upload at the next frame
    /// compile. One unmap balances one map.
    pub fn unmap_buffer(&self, buffer: &Buffer) -> RhiResult {
        let buffer_id = buffer.base().id();
        let mut mapped = self.mapped.lock();
        let Some(index) = mapped.iter().rposition(|c| c.buffer_id == buffer_id) else {
            log::error!("[{}] unmap of '{}' which has no mapped range", self.name, buffer.name());
            return Err(RhiError::InvalidOperation);
        };
        let copy = mapped.remove(index);
        drop(mapped);

        self.pending.lock().push(copy);
        Ok(())
    }

    /// Mapped ranges of `buffer` not yet unmapped.
    pub fn mapped_range_count(&self, buffer: &Buffer) -> usize {
        let buffer_id = buffer.base().id();
        self.mapped.lock().iter().filter(|c| c.buffer_id == buffer_id).count()
    }

    pub fn mapped_count(&self) -> usize {
        self.mapped.lock().len()
    }

    pub fn pending_copy_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Records and executes the queued staging copies. Returns the number of copies.
    ///
    /// The staging blocks are released whether or not the copies succeed.
    #[profiling::function]
    pub fn compile(&self) -> RhiResult<usize> {
        let pending = std::mem::take(&mut *self.pending.lock());
        if pending.is_empty() {
            return Ok(0);
        }
        let Some(device) = self.device() else {
            log::error!("[{}] {} staging copies queued on an uninitialized resolver", self.name, pending.len());
            self.release_staging(pending);
            return Err(RhiError::InvalidOperation);
        };

        let count = pending.len();
        let result = Self::execute_copies(&device, &pending);
        self.release_staging(pending);
        let bytes = result.inspect_err(|error| {
            log::error!("[{}] staging upload of {} copies failed: {}", self.name, count, error);
        })?;

        self.pool_usage.add_transfer_push(bytes);
        log::trace!("[{}] uploaded {} staging copies ({} bytes)", self.name, count, bytes);
        Ok(count)
    }

    fn execute_copies(device: &Device, copies: &[StagingCopy]) -> RhiResult<u64> {
        let mut command_list = device.command_list_allocator().allocate(HardwareQueueClass::Copy);
        let recorded = command_list.begin().and_then(|_| {
            let mut bytes = 0;
            for copy in copies {
                command_list.copy_buffer(copy.staging.view(), &copy.destination)?;
                bytes += copy.staging.size();
            }
            command_list.close()?;
            Ok(bytes)
        });
        match recorded {
            Ok(bytes) => device.execute_command_list(command_list).map(|_| bytes),
            Err(error) => {
                device.command_list_allocator().retire(command_list, device.current_fence_value());
                Err(error)
            }
        }
    }

    /// Drops any staging state of `buffer`, which is shutting down.
    pub fn on_buffer_shutdown(&self, buffer: &Buffer) {
        let buffer_id = buffer.base().id();
        let mut dropped = Vec::new();
        for list in [&self.mapped, &self.pending] {
            let mut list = list.lock();
            let (mine, others): (Vec<_>, Vec<_>) =
                std::mem::take(&mut *list).into_iter().partition(|c| c.buffer_id == buffer_id);
            *list = others;
            dropped.extend(mine);
        }
        if !dropped.is_empty() {
            log::debug!("[{}] discarded {} staging range(s) of '{}'", self.name, dropped.len(), buffer.name());
        }
        self.release_staging(dropped);
    }

    fn release_staging(&self, copies: Vec<StagingCopy>) {
        let device = self.device();
        for copy in copies {
            match &device {
                Some(device) => device.queue_for_release(Box::new(copy.staging)),
                None => copy.staging.free(),
            }
        }
    }

    pub fn shutdown(&self) {
        let mut copies = std::mem::take(&mut *self.mapped.lock());
        copies.append(&mut self.pending.lock());
        self.release_staging(copies);
        if let Some(heap) = self.staging_heap.write().take() {
            match self.device() {
                Some(device) => device.queue_for_release(Box::new(RetiredHeap(heap))),
                None => heap.release_pages_unaccounted(),
            }
        }
        self.staging_usage.reset();
        self.device.unbind();
    }
}
