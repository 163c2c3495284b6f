//! Device-local buffer pool: heap sub-allocation, orphaning, mapping and streaming.

use std::sync::Arc;
use derive_builder::Builder;
use parking_lot::RwLock;
use zenith_core::log;
use crate::buffer::{Buffer, BufferBindFlags, BufferDescriptor};
use crate::device::{Device, DeviceObject};
use crate::events::{FrameEventHandler, MemoryStatisticsHandler};
use crate::memory::{
    HeapAllocation, HeapAllocator, HeapAllocatorDescriptor, HeapMemoryLevel, MemoryStatisticsBuilder, MemoryView,
    RetiredHeap,
};
use crate::resolver::BufferPoolResolver;
use crate::resource::DeviceResource;
use crate::resource_pool::{DevicePool, ResourcePool, ResourcePoolDescriptor};
use crate::upload::UploadHandle;
use crate::utility::{align_up, normalize_range_u64};
use crate::{RhiError, RhiResult};

pub const DEFAULT_BUFFER_PAGE_SIZE: u64 = 1024 * 1024;
pub const DEFAULT_BUFFER_ALIGNMENT: u64 = 16;

#[derive(Clone, Debug, Builder)]
#[builder(setter(into))]
pub struct BufferPoolDescriptor {
    #[builder(default)]
    pub heap_memory_level: HeapMemoryLevel,
    /// Zero for unlimited.
    #[builder(default)]
    pub budget_in_bytes: u64,
    /// Binds every buffer of the pool may use. Empty allows any.
    #[builder(default)]
    pub bind_flags: BufferBindFlags,
    #[builder(default = "DEFAULT_BUFFER_PAGE_SIZE")]
    pub page_size: u64,
    #[builder(default = "DEFAULT_BUFFER_ALIGNMENT")]
    pub alignment: u64,
}

impl Default for BufferPoolDescriptor {
    fn default() -> Self {
        Self {
            heap_memory_level: HeapMemoryLevel::Device,
            budget_in_bytes: 0,
            bind_flags: BufferBindFlags::empty(),
            page_size: DEFAULT_BUFFER_PAGE_SIZE,
            alignment: DEFAULT_BUFFER_ALIGNMENT,
        }
    }
}

impl BufferPoolDescriptor {
    pub fn resource_pool_descriptor(&self) -> ResourcePoolDescriptor {
        ResourcePoolDescriptor {
            heap_memory_level: self.heap_memory_level,
            budget_in_bytes: self.budget_in_bytes,
        }
    }
}

pub struct BufferInitRequest<'a> {
    pub buffer: &'a Arc<Buffer>,
    pub descriptor: BufferDescriptor,
    /// Copied into the buffer at init: directly on host heaps, streamed on device heaps.
    pub initial_data: Option<&'a [u8]>,
}

impl<'a> BufferInitRequest<'a> {
    pub fn new(buffer: &'a Arc<Buffer>, descriptor: BufferDescriptor) -> Self {
        Self {
            buffer,
            descriptor,
            initial_data: None,
        }
    }

    pub fn with_initial_data(mut self, data: &'a [u8]) -> Self {
        self.initial_data = Some(data);
        self
    }
}

pub struct BufferMapRequest<'a> {
    pub buffer: &'a Buffer,
    pub byte_offset: u64,
    pub byte_count: u64,
}

impl<'a> BufferMapRequest<'a> {
    pub fn new(buffer: &'a Buffer, byte_offset: u64, byte_count: u64) -> Self {
        Self {
            buffer,
            byte_offset,
            byte_count,
        }
    }
}

#[derive(Debug)]
pub struct BufferMapResponse {
    /// CPU access to the mapped range, valid until the matching unmap.
    pub data: MemoryView,
}

pub struct BufferStreamRequest<'a> {
    pub buffer: &'a Buffer,
    pub byte_offset: u64,
    pub source_data: Vec<u8>,
}

impl<'a> BufferStreamRequest<'a> {
    pub fn new(buffer: &'a Buffer, byte_offset: u64, source_data: impl Into<Vec<u8>>) -> Self {
        Self {
            buffer,
            byte_offset,
            source_data: source_data.into(),
        }
    }
}

/// Buffer pool of one device.
///
/// Host-level pools hand out CPU-visible memory that can be mapped and orphaned.
/// Device-level pools map through a [`BufferPoolResolver`] and fill buffers through
/// the device upload queue.
pub struct BufferPool {
    pool: ResourcePool,
    descriptor: RwLock<BufferPoolDescriptor>,
    heap: RwLock<Option<Arc<HeapAllocator>>>,
    resolver: RwLock<Option<Arc<BufferPoolResolver>>>,
}

impl BufferPool {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            pool: ResourcePool::new(name),
            descriptor: RwLock::new(BufferPoolDescriptor::default()),
            heap: RwLock::new(None),
            resolver: RwLock::new(None),
        })
    }

    #[inline]
    pub fn resource_pool(&self) -> &ResourcePool { &self.pool }

    pub fn name(&self) -> String {
        self.pool.name()
    }

    pub fn descriptor(&self) -> BufferPoolDescriptor {
        self.descriptor.read().clone()
    }

    pub fn resolver(&self) -> Option<Arc<BufferPoolResolver>> {
        self.resolver.read().clone()
    }

    pub fn heap(&self) -> Option<Arc<HeapAllocator>> {
        self.heap.read().clone()
    }

    pub fn is_initialized(&self) -> bool {
        self.pool.is_initialized()
    }

    pub fn init(self: &Arc<Self>, device: &Arc<Device>, descriptor: &BufferPoolDescriptor) -> RhiResult {
        if descriptor.alignment == 0 || !descriptor.alignment.is_power_of_two() {
            log::error!("buffer pool '{}' alignment {} is not a power of two", self.name(), descriptor.alignment);
            return Err(RhiError::InvalidArgument);
        }

        self.pool.init(self, device, &descriptor.resource_pool_descriptor(), |device| {
            let name = self.name();
            let heap = HeapAllocator::new(
                &format!("{name}.heap"),
                HeapAllocatorDescriptor {
                    level: descriptor.heap_memory_level,
                    page_size: descriptor.page_size,
                    alignment: descriptor.alignment,
                    tracking: device.descriptor().allocation_tracking,
                },
                device.address_space().clone(),
                self.pool.memory_usage().clone(),
            );

            let resolver = match descriptor.heap_memory_level {
                HeapMemoryLevel::Device => {
                    let resolver = BufferPoolResolver::new(format!("{name}.resolver"), self.pool.memory_usage().clone());
                    resolver.init(device)?;
                    Some(Arc::new(resolver))
                }
                HeapMemoryLevel::Host => None,
            };

            *self.descriptor.write() = descriptor.clone();
            *self.heap.write() = Some(Arc::new(heap));
            *self.resolver.write() = resolver;
            Ok(())
        })
    }

    fn validate_buffer(&self, buffer: &Buffer) -> RhiResult<Arc<Device>> {
        let Some(device) = self.pool.device() else {
            log::error!("buffer pool '{}' is not initialized", self.name());
            return Err(RhiError::InvalidOperation);
        };
        if !self.pool.is_registered(buffer) {
            log::error!("buffer '{}' is not registered with pool '{}'", buffer.name(), self.name());
            return Err(RhiError::InvalidArgument);
        }
        Ok(device)
    }

    /// Reserves budget and sub-allocates backing for `descriptor`.
    fn allocate_backing(&self, descriptor: &BufferDescriptor) -> RhiResult<HeapAllocation> {
        let heap = self.heap().ok_or(RhiError::InvalidOperation)?;
        let alignment = descriptor.alignment.max(self.descriptor.read().alignment);
        let Some(size) = align_up(descriptor.byte_count, alignment) else {
            log::warn!(
                "buffer pool '{}' cannot back {} bytes at alignment {}",
                self.name(),
                descriptor.byte_count,
                alignment
            );
            return Err(RhiError::OutOfMemory);
        };
        let usage = self.pool.memory_usage().heap(heap.level());
        if !usage.try_reserve(size) {
            log::warn!(
                "buffer pool '{}' out of budget: {} bytes requested, {} of {} used",
                self.name(),
                size,
                usage.used_resident_in_bytes(),
                usage.budget_in_bytes()
            );
            return Err(RhiError::OutOfMemory);
        }
        heap.allocate(size, alignment).inspect_err(|_| usage.release_used(size))
    }

    /// Gives up `allocation`: budget is returned now, memory once the GPU is done.
    fn release_backing(&self, device: Option<&Device>, allocation: HeapAllocation) {
        let level = self.pool.heap_memory_level();
        self.pool.memory_usage().heap(level).release_used(allocation.size());
        match device {
            Some(device) => device.queue_for_release(Box::new(allocation)),
            None => allocation.free(),
        }
    }

    #[profiling::function]
    pub fn init_buffer(&self, request: &BufferInitRequest) -> RhiResult {
        let descriptor = &request.descriptor;
        if descriptor.byte_count == 0 {
            log::error!("buffer '{}' has zero size", request.buffer.name());
            return Err(RhiError::InvalidArgument);
        }
        let pool_binds = self.descriptor.read().bind_flags;
        if !pool_binds.is_empty() && !pool_binds.contains(descriptor.bind_flags) {
            log::error!(
                "buffer '{}' binds {:?} not supported by pool '{}'",
                request.buffer.name(),
                descriptor.bind_flags,
                self.name()
            );
            return Err(RhiError::InvalidArgument);
        }
        if request.initial_data.is_some_and(|data| data.len() as u64 > descriptor.byte_count) {
            return Err(RhiError::InvalidArgument);
        }

        self.pool.init_resource(request.buffer, |device| {
            let allocation = self.allocate_backing(descriptor)?;
            let mut upload = UploadHandle::NULL;
            if let Some(data) = request.initial_data {
                let written = match self.pool.heap_memory_level() {
                    HeapMemoryLevel::Host => allocation.view().write(0, data),
                    HeapMemoryLevel::Device => device
                        .upload_queue()
                        .queue_upload(allocation.view().clone(), data.to_vec())
                        .map(|handle| {
                            self.pool.memory_usage().add_transfer_push(data.len() as u64);
                            upload = handle;
                        }),
                };
                if let Err(error) = written {
                    self.release_backing(Some(device.as_ref()), allocation);
                    return Err(error);
                }
            }

            request.buffer.set_descriptor(descriptor.clone());
            request.buffer.set_upload_handle(upload);
            request.buffer.replace_memory(Some(allocation));
            log::trace!(
                "pool '{}' allocated {} bytes for '{}'",
                self.name(),
                descriptor.byte_count,
                request.buffer.name()
            );
            Ok(())
        })
    }

    /// Swaps the buffer's backing for a fresh allocation. Host pools only.
    ///
    /// The old allocation is released once the GPU is done with the current frame and
    /// every view of the buffer is invalidated.
    #[profiling::function]
    pub fn orphan_buffer(&self, buffer: &Buffer) -> RhiResult {
        let device = self.validate_buffer(buffer)?;
        if self.pool.heap_memory_level() != HeapMemoryLevel::Host {
            log::error!("buffer pool '{}' is device resident, orphaning is only valid on host pools", self.name());
            return Err(RhiError::InvalidOperation);
        }

        let usage = self.pool.memory_usage().heap(HeapMemoryLevel::Host);
        let old_size = buffer.memory_size();
        usage.release_used(old_size);
        let allocation = match self.allocate_backing(&buffer.descriptor()) {
            Ok(allocation) => allocation,
            Err(error) => {
                if !usage.try_reserve(old_size) {
                    log::warn!("buffer pool '{}' over budget after failed orphan", self.name());
                }
                return Err(error);
            }
        };

        if let Some(old) = buffer.replace_memory(Some(allocation)) {
            device.queue_for_release(Box::new(old));
        }
        buffer.base().invalidate_views();
        Ok(())
    }

    #[profiling::function]
    pub fn map_buffer(&self, request: &BufferMapRequest) -> RhiResult<BufferMapResponse> {
        let buffer = request.buffer;
        self.validate_buffer(buffer)?;
        let (byte_offset, byte_count) = normalize_range_u64(
            request.byte_offset..request.byte_offset.saturating_add(request.byte_count),
            buffer.descriptor().byte_count,
        )?;

        let data = match self.pool.heap_memory_level() {
            HeapMemoryLevel::Host => buffer
                .memory_view()
                .ok_or(RhiError::InvalidOperation)?
                .slice(byte_offset..byte_offset + byte_count)?,
            HeapMemoryLevel::Device => {
                let resolver = self.resolver().ok_or(RhiError::InvalidOperation)?;
                resolver.map_buffer(buffer, byte_offset, byte_count)?
            }
        };
        buffer.increment_map_ref_count();
        Ok(BufferMapResponse { data })
    }

    pub fn unmap_buffer(&self, buffer: &Buffer) -> RhiResult {
        self.validate_buffer(buffer)?;
        if buffer.map_ref_count() == 0 {
            log::error!("buffer '{}' unmapped more often than mapped", buffer.name());
            return Err(RhiError::InvalidOperation);
        }
        if self.pool.heap_memory_level() == HeapMemoryLevel::Device {
            self.resolver().ok_or(RhiError::InvalidOperation)?.unmap_buffer(buffer)?;
        }
        buffer.decrement_map_ref_count();
        Ok(())
    }

    /// Queues an asynchronous upload and returns once it is queued.
    ///
    /// The region must not be touched until the returned handle completes.
    #[profiling::function]
    pub fn stream_buffer(&self, request: BufferStreamRequest) -> RhiResult<UploadHandle> {
        let buffer = request.buffer;
        let device = self.validate_buffer(buffer)?;
        let byte_count = request.source_data.len() as u64;
        let (byte_offset, byte_count) = normalize_range_u64(
            request.byte_offset..request.byte_offset.saturating_add(byte_count),
            buffer.descriptor().byte_count,
        )?;
        let destination = buffer
            .memory_view()
            .ok_or(RhiError::InvalidOperation)?
            .slice(byte_offset..byte_offset + byte_count)?;

        let handle = device.upload_queue().queue_upload(destination, request.source_data)?;
        buffer.set_upload_handle(handle);
        self.pool.memory_usage().add_transfer_push(byte_count);
        Ok(handle)
    }

    pub fn shutdown(&self) -> RhiResult {
        self.pool.shutdown(self)
    }
}

impl FrameEventHandler for BufferPool {
    fn on_frame_begin(&self) {
        self.pool.on_frame_begin();
    }

    fn on_frame_compile(&self) {
        self.pool.on_frame_compile();
        if let Some(resolver) = self.resolver() {
            if let Err(error) = resolver.compile() {
                log::error!("buffer pool '{}' failed to upload staged ranges: {}", self.name(), error);
            }
        }
    }

    fn on_frame_end(&self) {
        self.pool.on_frame_end();
    }
}

impl MemoryStatisticsHandler for BufferPool {
    fn report_memory_usage(&self, builder: &mut MemoryStatisticsBuilder) {
        self.pool.report_memory_usage(self, builder);
    }
}

impl DevicePool for BufferPool {
    fn resource_pool(&self) -> &ResourcePool {
        &self.pool
    }

    fn shutdown_resource_internal(&self, resource: &dyn DeviceResource) {
        let Some(buffer) = resource.downcast_ref::<Buffer>() else {
            log::error!("buffer pool '{}' asked to release a non-buffer resource", self.name());
            return;
        };
        let device = self.pool.device();

        if let Some(device) = &device {
            let handle = buffer.upload_handle();
            if let Err(error) = device.upload_queue().wait_for_upload(handle, None) {
                log::error!("failed to wait for uploads of '{}': {}", buffer.name(), error);
            }
        }
        if let Some(resolver) = self.resolver() {
            resolver.on_buffer_shutdown(buffer);
        }

        buffer.reset_map_ref_count();
        buffer.set_upload_handle(UploadHandle::NULL);
        if let Some(allocation) = buffer.replace_memory(None) {
            self.release_backing(device.as_deref(), allocation);
        }
        buffer.base().invalidate_views();
    }

    fn shutdown_internal(&self) {
        let device = self.pool.device();
        if let Some(resolver) = self.resolver.write().take() {
            resolver.shutdown();
        }
        if let Some(heap) = self.heap.write().take() {
            match device {
                Some(device) => device.queue_for_release(Box::new(RetiredHeap(heap))),
                None => heap.release_pages_unaccounted(),
            }
        }
    }

    fn compute_fragmentation(&self) {
        if let Some(heap) = self.heap() {
            heap.compute_fragmentation();
        }
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        if let Err(error) = self.shutdown() {
            log::error!("buffer pool '{}' failed to shut down: {}", self.name(), error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferBind;
    use crate::device::DeviceDescriptorBuilder;
    use crate::views::{BufferView, BufferViewDescriptor};

    fn device() -> Arc<Device> {
        Device::new(0, &DeviceDescriptorBuilder::default().async_upload(false).build().unwrap()).unwrap()
    }

    fn pool(device: &Arc<Device>, level: HeapMemoryLevel, budget: u64) -> Arc<BufferPool> {
        let pool = BufferPool::new(format!("{level:?}Pool"));
        let descriptor = BufferPoolDescriptorBuilder::default()
            .heap_memory_level(level)
            .budget_in_bytes(budget)
            .page_size(4096u64)
            .build()
            .unwrap();
        pool.init(device, &descriptor).unwrap();
        pool
    }

    fn buffer(pool: &BufferPool, name: &str, size: u64) -> Arc<Buffer> {
        let buffer = Buffer::new(name);
        pool.init_buffer(&BufferInitRequest::new(&buffer, BufferDescriptor::new(size))).unwrap();
        buffer
    }

    #[test]
    fn init_buffer_accounts_used_bytes_and_registers() {
        let device = device();
        let pool = pool(&device, HeapMemoryLevel::Host, 0);
        let buffer = buffer(&pool, "vertices", 100);
        assert_eq!(buffer.memory_size(), 112);
        assert!(pool.resource_pool().is_registered(buffer.as_ref()));
        assert_eq!(pool.resource_pool().heap_memory_usage(HeapMemoryLevel::Host).used_resident_in_bytes, 112);
        assert!(buffer.is_initialized());
    }

    #[test]
    fn pool_bind_flags_restrict_buffers() {
        let device = device();
        let pool = BufferPool::new("Constants");
        let descriptor = BufferPoolDescriptorBuilder::default()
            .heap_memory_level(HeapMemoryLevel::Host)
            .bind_flags(BufferBind::Constant)
            .build()
            .unwrap();
        pool.init(&device, &descriptor).unwrap();

        let buffer = Buffer::new("rw");
        let request = BufferInitRequest::new(&buffer, BufferDescriptor::new(16).with_bind_flags(BufferBind::ShaderWrite));
        assert_eq!(pool.init_buffer(&request), Err(RhiError::InvalidArgument));
        assert!(!buffer.is_initialized());
    }

    #[test]
    fn budget_is_enforced_at_allocation() {
        let device = device();
        let pool = pool(&device, HeapMemoryLevel::Device, 256);
        let _a = buffer(&pool, "a", 128);
        let _b = buffer(&pool, "b", 128);
        let c = Buffer::new("c");
        assert_eq!(
            pool.init_buffer(&BufferInitRequest::new(&c, BufferDescriptor::new(16))),
            Err(RhiError::OutOfMemory)
        );
        assert!(c.base().pool_id().is_none());
        assert_eq!(pool.resource_pool().resource_count(), 2);
    }

    #[test]
    fn budget_above_device_capacity_is_rejected() {
        let descriptor = DeviceDescriptorBuilder::default()
            .host_memory_capacity(1024u64)
            .async_upload(false)
            .build()
            .unwrap();
        let device = Device::new(0, &descriptor).unwrap();
        let pool = BufferPool::new("Oversized");
        let pool_descriptor = |budget: u64| {
            BufferPoolDescriptorBuilder::default()
                .heap_memory_level(HeapMemoryLevel::Host)
                .budget_in_bytes(budget)
                .build()
                .unwrap()
        };

        assert_eq!(pool.init(&device, &pool_descriptor(2048)), Err(RhiError::InvalidArgument));
        assert!(!pool.is_initialized());
        assert_eq!(device.pool_count(), 0);

        pool.init(&device, &pool_descriptor(1024)).unwrap();
        assert_eq!(device.pool_count(), 1);
    }

    #[test]
    fn overflowing_size_is_out_of_memory() {
        let device = device();
        let budgeted = pool(&device, HeapMemoryLevel::Host, 1024);
        let huge = Buffer::new("huge");
        assert_eq!(
            budgeted.init_buffer(&BufferInitRequest::new(&huge, BufferDescriptor::new(u64::MAX - 3))),
            Err(RhiError::OutOfMemory)
        );
        assert!(!huge.is_initialized());
        assert!(huge.base().pool_id().is_none());
        assert_eq!(budgeted.resource_pool().heap_memory_usage(HeapMemoryLevel::Host).used_resident_in_bytes, 0);

        let unlimited = pool(&device, HeapMemoryLevel::Host, 0);
        assert_eq!(
            unlimited.init_buffer(&BufferInitRequest::new(&huge, BufferDescriptor::new(u64::MAX - 3))),
            Err(RhiError::OutOfMemory)
        );
        assert_eq!(
            unlimited.init_buffer(&BufferInitRequest::new(&huge, BufferDescriptor::new(1 << 62))),
            Err(RhiError::OutOfMemory)
        );
        assert_eq!(unlimited.resource_pool().heap_memory_usage(HeapMemoryLevel::Host).used_resident_in_bytes, 0);

        let small = buffer(&budgeted, "small", 64);
        assert_eq!(small.memory_size(), 64);
    }

    #[test]
    fn host_map_round_trips_bytes() {
        let device = device();
        let pool = pool(&device, HeapMemoryLevel::Host, 0);
        let buffer = buffer(&pool, "constants", 64);

        let mapped = pool.map_buffer(&BufferMapRequest::new(&buffer, 16, 8)).unwrap();
        mapped.data.write(0, &[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        assert_eq!(buffer.map_ref_count(), 1);
        pool.unmap_buffer(&buffer).unwrap();
        assert_eq!(pool.unmap_buffer(&buffer), Err(RhiError::InvalidOperation));

        let mapped = pool.map_buffer(&BufferMapRequest::new(&buffer, 0, 64)).unwrap();
        assert_eq!(&mapped.data.to_vec()[16..24], &[1, 2, 3, 4, 5, 6, 7, 8]);
        pool.unmap_buffer(&buffer).unwrap();
    }

    #[test]
    fn map_rejects_out_of_range_and_foreign_buffers() {
        let device = device();
        let pool = pool(&device, HeapMemoryLevel::Host, 0);
        let other = self::pool(&device, HeapMemoryLevel::Host, 0);
        let buffer = buffer(&pool, "b", 32);
        assert_eq!(pool.map_buffer(&BufferMapRequest::new(&buffer, 16, 32)).err(), Some(RhiError::InvalidArgument));
        assert_eq!(other.map_buffer(&BufferMapRequest::new(&buffer, 0, 4)).err(), Some(RhiError::InvalidArgument));
        assert_eq!(buffer.map_ref_count(), 0);
    }

    #[test]
    fn device_map_goes_through_resolver_at_frame_compile() {
        let device = device();
        let pool = pool(&device, HeapMemoryLevel::Device, 0);
        let buffer = buffer(&pool, "gpu", 16);
        let resolver = pool.resolver().unwrap();

        device.begin_frame().unwrap();
        let mapped = pool.map_buffer(&BufferMapRequest::new(&buffer, 4, 4)).unwrap();
        assert_eq!(pool.resource_pool().memory_usage_snapshot().transfer_pull_bytes, 4);
        mapped.data.write(0, &[9, 9, 9, 9]).unwrap();
        pool.unmap_buffer(&buffer).unwrap();
        assert_eq!(resolver.pending_copy_count(), 1);
        assert_eq!(&buffer.memory_view().unwrap().to_vec()[4..8], &[0, 0, 0, 0]);

        device.compile_frame().unwrap();
        assert_eq!(resolver.pending_copy_count(), 0);
        assert_eq!(&buffer.memory_view().unwrap().to_vec()[4..8], &[9, 9, 9, 9]);
        device.end_frame().unwrap();

        device.begin_frame().unwrap();
        assert_eq!(pool.resource_pool().memory_usage_snapshot().transfer_pull_bytes, 0);
    }

    #[test]
    fn each_device_unmap_balances_one_map() {
        let device = device();
        let pool = pool(&device, HeapMemoryLevel::Device, 0);
        let buffer = buffer(&pool, "gpu", 64);
        let resolver = pool.resolver().unwrap();

        device.begin_frame().unwrap();
        let head = pool.map_buffer(&BufferMapRequest::new(&buffer, 0, 8)).unwrap();
        let tail = pool.map_buffer(&BufferMapRequest::new(&buffer, 32, 8)).unwrap();
        head.data.write(0, &[1; 8]).unwrap();
        tail.data.write(0, &[2; 8]).unwrap();
        assert_eq!(buffer.map_ref_count(), 2);

        pool.unmap_buffer(&buffer).unwrap();
        assert_eq!(buffer.map_ref_count(), 1);
        assert_eq!(resolver.mapped_range_count(&buffer), 1);
        assert_eq!(resolver.pending_copy_count(), 1);

        pool.unmap_buffer(&buffer).unwrap();
        assert_eq!(buffer.map_ref_count(), 0);
        assert_eq!(resolver.mapped_range_count(&buffer), 0);
        assert_eq!(resolver.pending_copy_count(), 2);
        assert_eq!(pool.unmap_buffer(&buffer), Err(RhiError::InvalidOperation));

        device.compile_frame().unwrap();
        let bytes = buffer.memory_view().unwrap().to_vec();
        assert_eq!(&bytes[0..8], &[1; 8]);
        assert_eq!(&bytes[32..40], &[2; 8]);
        device.end_frame().unwrap();
    }

    #[test]
    fn orphan_is_host_only() {
        let device = device();
        let pool = pool(&device, HeapMemoryLevel::Device, 0);
        let buffer = buffer(&pool, "gpu", 16);
        assert_eq!(pool.orphan_buffer(&buffer), Err(RhiError::InvalidOperation));
    }

    #[test]
    fn orphan_swaps_backing_and_invalidates_views_once() {
        let device = device();
        let pool = pool(&device, HeapMemoryLevel::Host, 0);
        let buffer = buffer(&pool, "per-frame", 64);
        let view = BufferView::new(&buffer, BufferViewDescriptor::range(16, 16)).unwrap();
        let before = view.gpu_address();

        pool.orphan_buffer(&buffer).unwrap();
        assert_eq!(view.invalidation_count(), 1);
        assert_ne!(view.gpu_address(), before);
        assert_eq!(view.gpu_address(), buffer.gpu_address().unwrap() + 16);
        assert_eq!(device.pending_release_count(), 1);
        assert_eq!(pool.resource_pool().heap_memory_usage(HeapMemoryLevel::Host).used_resident_in_bytes, 64);
    }

    #[test]
    fn streamed_initial_data_lands_in_device_memory() {
        let device = device();
        let pool = pool(&device, HeapMemoryLevel::Device, 0);
        let buffer = Buffer::new("mesh");
        let data = [5u8; 32];
        pool.init_buffer(&BufferInitRequest::new(&buffer, BufferDescriptor::new(32)).with_initial_data(&data))
            .unwrap();
        assert!(device.upload_queue().is_upload_finished(buffer.upload_handle()));
        assert_eq!(buffer.memory_view().unwrap().to_vec(), data);

        let handle = pool.stream_buffer(BufferStreamRequest::new(&buffer, 8, vec![1u8; 8])).unwrap();
        device.upload_queue().wait_for_upload(handle, None).unwrap();
        assert_eq!(&buffer.memory_view().unwrap().to_vec()[8..16], &[1u8; 8]);
        assert_eq!(
            pool.stream_buffer(BufferStreamRequest::new(&buffer, 30, vec![0u8; 4])).err(),
            Some(RhiError::InvalidArgument)
        );
    }

    #[test]
    fn shutdown_defers_memory_and_invalidates_views() {
        let device = device();
        let pool = pool(&device, HeapMemoryLevel::Host, 0);
        let buffer = buffer(&pool, "temp", 32);
        let view = BufferView::new(&buffer, BufferViewDescriptor::whole()).unwrap();

        buffer.shutdown().unwrap();
        assert!(!view.is_valid());
        assert_eq!(view.invalidation_count(), 1);
        assert_eq!(pool.resource_pool().heap_memory_usage(HeapMemoryLevel::Host).used_resident_in_bytes, 0);
        assert_eq!(device.pending_release_count(), 1);

        device.wait_for_idle().unwrap();
        assert_eq!(device.pending_release_count(), 0);
    }

    #[test]
    fn dropping_the_pool_shuts_down_buffers() {
        let device = device();
        let pool = pool(&device, HeapMemoryLevel::Device, 0);
        let buffer = buffer(&pool, "orphaned by pool", 32);
        drop(pool);
        assert!(buffer.pool().is_none());
        assert!(buffer.memory_view().is_none());
        device.wait_for_idle().unwrap();
        assert_eq!(device.address_space().committed_bytes(HeapMemoryLevel::Device), 0);
    }
}
