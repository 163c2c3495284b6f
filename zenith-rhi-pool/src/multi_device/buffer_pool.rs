//! Buffer pool fanning out to one [`BufferPool`] per device.

use std::sync::Arc;
use zenith_core::collections::SmallVec;
use zenith_core::log;
use crate::buffer::{Buffer, BufferDescriptor};
use crate::buffer_pool::{BufferInitRequest, BufferMapRequest, BufferPool, BufferPoolDescriptor, BufferStreamRequest};
use crate::context::RhiContext;
use crate::device::DeviceObject;
use crate::device_mask::{DeviceIndex, DeviceMask};
use crate::memory::{HeapMemoryLevel, MemoryView, PoolMemoryUsageSnapshot};
use crate::multi_device::buffer::MultiDeviceBuffer;
use crate::multi_device::object::{DeviceObjects, MultiDeviceObject};
use crate::multi_device::pool::{MultiDevicePool, MultiDeviceResourcePool};
use crate::multi_device::resource::MultiDeviceResource;
use crate::upload::UploadHandle;
use crate::{RhiError, RhiResult};

pub struct MultiDeviceBufferInitRequest<'a> {
    pub buffer: &'a Arc<MultiDeviceBuffer>,
    pub descriptor: BufferDescriptor,
    /// Copied into every device buffer.
    pub initial_data: Option<&'a [u8]>,
}

impl<'a> MultiDeviceBufferInitRequest<'a> {
    pub fn new(buffer: &'a Arc<MultiDeviceBuffer>, descriptor: BufferDescriptor) -> Self {
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

pub struct MultiDeviceBufferMapRequest<'a> {
    pub buffer: &'a MultiDeviceBuffer,
    pub byte_offset: u64,
    pub byte_count: u64,
}

impl<'a> MultiDeviceBufferMapRequest<'a> {
    pub fn new(buffer: &'a MultiDeviceBuffer, byte_offset: u64, byte_count: u64) -> Self {
        Self {
            buffer,
            byte_offset,
            byte_count,
        }
    }
}

/// Mapped range of every device buffer, in device order.
#[derive(Debug, Default)]
pub struct MultiDeviceBufferMapResponse {
    pub data: SmallVec<[(DeviceIndex, MemoryView); 4]>,
}

impl MultiDeviceBufferMapResponse {
    pub fn device_data(&self, index: DeviceIndex) -> Option<&MemoryView> {
        self.data.iter().find(|(i, _)| *i == index).map(|(_, view)| view)
    }

    /// Writes `bytes` at `offset` of every device's mapped range.
    pub fn write_all(&self, offset: u64, bytes: &[u8]) -> RhiResult {
        self.data.iter().try_for_each(|(_, view)| view.write(offset, bytes))
    }
}

pub struct MultiDeviceBufferStreamRequest<'a> {
    pub buffer: &'a MultiDeviceBuffer,
    pub byte_offset: u64,
    pub source_data: &'a [u8],
}

type DevicePair = (DeviceIndex, Arc<BufferPool>, Arc<Buffer>);

/// Upload handles of one streaming request, in device order.
pub type MultiDeviceUploadHandles = SmallVec<[(DeviceIndex, UploadHandle); 4]>;

/// Multi-device buffer pool. Every fan-out either succeeds on all devices or leaves
/// no trace on any of them.
pub struct MultiDeviceBufferPool {
    pool: MultiDeviceResourcePool,
    device_pools: MultiDeviceObject<BufferPool>,
}

impl MultiDeviceBufferPool {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            pool: MultiDeviceResourcePool::new(name),
            device_pools: MultiDeviceObject::default(),
        })
    }

    #[inline]
    pub fn multi_device_pool(&self) -> &MultiDeviceResourcePool { &self.pool }

    pub fn name(&self) -> String {
        self.pool.name()
    }

    pub fn device_mask(&self) -> DeviceMask {
        self.pool.device_mask()
    }

    pub fn is_initialized(&self) -> bool {
        self.pool.is_initialized()
    }

    pub fn device_pool(&self, index: DeviceIndex) -> Option<Arc<BufferPool>> {
        self.device_pools.device_object(index)
    }

    pub fn device_pools(&self) -> DeviceObjects<BufferPool> {
        self.device_pools.device_objects()
    }

    pub fn heap_memory_level(&self) -> Option<HeapMemoryLevel> {
        self.device_pools().first().map(|(_, pool)| pool.resource_pool().heap_memory_level())
    }

    pub fn memory_usage(&self) -> SmallVec<[(DeviceIndex, PoolMemoryUsageSnapshot); 4]> {
        self.device_pools()
            .iter()
            .map(|(index, pool)| (*index, pool.resource_pool().memory_usage_snapshot()))
            .collect()
    }

    pub fn resource_count(&self) -> usize {
        self.pool.resource_count()
    }

    /// Creates one [`BufferPool`] per device of `mask`. Any device failure shuts down
    /// the pools created so far and leaves this pool uninitialized.
    pub fn init(self: &Arc<Self>, context: &RhiContext, mask: DeviceMask, descriptor: &BufferPoolDescriptor) -> RhiResult {
        self.pool.init(self, context, mask, |devices| {
            let name = self.name();
            let mut created = DeviceObjects::new();
            for device in devices {
                let pool = BufferPool::new(format!("{} [{}]", name, device.index()));
                if let Err(error) = pool.init(device, descriptor) {
                    log::error!("buffer pool '{}' failed on device {}, rolling back", name, device.index());
                    for (_, pool) in &created {
                        shutdown_quietly(pool);
                    }
                    return Err(error);
                }
                created.push((device.index(), pool));
            }
            self.device_pools.replace(created);
            Ok(())
        })
    }

    fn validate_buffer(&self, buffer: &MultiDeviceBuffer) -> RhiResult {
        if !self.pool.is_registered(buffer) {
            log::error!("buffer '{}' is not registered with multi-device pool '{}'", buffer.name(), self.name());
            return Err(RhiError::InvalidArgument);
        }
        Ok(())
    }

    /// Device buffers of `buffer` paired with the device pools owning them.
    fn device_pairs(&self, buffer: &MultiDeviceBuffer) -> RhiResult<SmallVec<[DevicePair; 4]>> {
        buffer
            .device_buffers()
            .into_iter()
            .map(|(index, device_buffer)| {
                let pool = self.device_pool(index).ok_or(RhiError::InvalidOperation)?;
                Ok((index, pool, device_buffer))
            })
            .collect()
    }

    /// Creates a device buffer on every device. A device failure shuts down the device
    /// buffers created so far and leaves `buffer` unregistered.
    #[profiling::function]
    pub fn init_buffer(&self, request: &MultiDeviceBufferInitRequest) -> RhiResult {
        let buffer = request.buffer;
        self.pool.init_resource(buffer, || {
            let name = buffer.name();
            let mut created = DeviceObjects::new();
            for (index, pool) in self.device_pools() {
                let device_buffer = Buffer::new(format!("{} [{}]", name, index));
                let mut device_request = BufferInitRequest::new(&device_buffer, request.descriptor.clone());
                device_request.initial_data = request.initial_data;
                if let Err(error) = pool.init_buffer(&device_request) {
                    log::error!("buffer '{}' failed on device {}: {}, rolling back", name, index, error);
                    for (_, device_buffer) in &created {
                        shutdown_quietly_resource(device_buffer);
                    }
                    return Err(error);
                }
                created.push((index, device_buffer));
            }
            buffer.set_descriptor(request.descriptor.clone());
            buffer.device_objects().replace(created);
            Ok(())
        })
    }

    /// Gives every device buffer a fresh allocation, then invalidates the views of
    /// `buffer`. Host pools only.
    #[profiling::function]
    pub fn orphan_buffer(&self, buffer: &MultiDeviceBuffer) -> RhiResult {
        self.validate_buffer(buffer)?;
        if self.heap_memory_level() != Some(HeapMemoryLevel::Host) {
            log::error!("multi-device pool '{}' is device resident, orphaning needs host memory", self.name());
            return Err(RhiError::InvalidOperation);
        }
        for (_, pool, device_buffer) in self.device_pairs(buffer)? {
            pool.orphan_buffer(&device_buffer)?;
        }
        buffer.base().invalidate_views();
        Ok(())
    }

    /// Maps the range on every device. A device failure unmaps the devices mapped so far.
    #[profiling::function]
    pub fn map_buffer(&self, request: &MultiDeviceBufferMapRequest) -> RhiResult<MultiDeviceBufferMapResponse> {
        self.validate_buffer(request.buffer)?;
        let mut response = MultiDeviceBufferMapResponse::default();
        let mut mapped: SmallVec<[(Arc<BufferPool>, Arc<Buffer>); 4]> = SmallVec::new();
        for (index, pool, device_buffer) in self.device_pairs(request.buffer)? {
            let device_request = BufferMapRequest::new(&device_buffer, request.byte_offset, request.byte_count);
            match pool.map_buffer(&device_request) {
                Ok(device_response) => {
                    response.data.push((index, device_response.data));
                    mapped.push((pool, device_buffer));
                }
                Err(error) => {
                    for (pool, device_buffer) in &mapped {
                        if let Err(error) = pool.unmap_buffer(device_buffer) {
                            log::error!("failed to roll back map of '{}': {}", device_buffer.name(), error);
                        }
                    }
                    return Err(error);
                }
            }
        }
        Ok(response)
    }

    pub fn unmap_buffer(&self, buffer: &MultiDeviceBuffer) -> RhiResult {
        self.validate_buffer(buffer)?;
        for (_, pool, device_buffer) in self.device_pairs(buffer)? {
            pool.unmap_buffer(&device_buffer)?;
        }
        Ok(())
    }

    /// Queues the upload on every device and returns once queued.
    #[profiling::function]
    pub fn stream_buffer(&self, request: &MultiDeviceBufferStreamRequest) -> RhiResult<MultiDeviceUploadHandles> {
        self.validate_buffer(request.buffer)?;
        let mut handles = MultiDeviceUploadHandles::new();
        for (index, pool, device_buffer) in self.device_pairs(request.buffer)? {
            let handle = pool.stream_buffer(BufferStreamRequest::new(
                &device_buffer,
                request.byte_offset,
                request.source_data,
            ))?;
            handles.push((index, handle));
        }
        Ok(handles)
    }

    /// Whether every upload of `handles` completed.
    pub fn is_stream_finished(&self, handles: &MultiDeviceUploadHandles) -> bool {
        handles.iter().all(|(index, handle)| {
            self.device_pool(*index)
                .and_then(|pool| pool.resource_pool().device())
                .is_none_or(|device| device.upload_queue().is_upload_finished(*handle))
        })
    }

    pub fn shutdown(&self) -> RhiResult {
        self.pool.shutdown(self)
    }
}

fn shutdown_quietly(pool: &BufferPool) {
    if let Err(error) = pool.shutdown() {
        log::error!("failed to shut down buffer pool '{}': {}", pool.name(), error);
    }
}

fn shutdown_quietly_resource(buffer: &Buffer) {
    if let Err(error) = buffer.shutdown() {
        log::error!("failed to shut down buffer '{}': {}", buffer.name(), error);
    }
}

impl MultiDevicePool for MultiDeviceBufferPool {
    fn multi_device_pool(&self) -> &MultiDeviceResourcePool {
        &self.pool
    }

    fn shutdown_resource_internal(&self, resource: &dyn MultiDeviceResource) {
        let Some(buffer) = resource.downcast_ref::<MultiDeviceBuffer>() else {
            log::error!("multi-device buffer pool '{}' asked to release a non-buffer resource", self.name());
            return;
        };
        for (_, device_buffer) in buffer.device_objects().clear() {
            shutdown_quietly_resource(&device_buffer);
        }
        buffer.base().invalidate_views();
    }

    fn shutdown_internal(&self) {
        for (_, pool) in self.device_pools.clear() {
            shutdown_quietly(&pool);
        }
    }

    fn is_processing_frame(&self) -> bool {
        self.device_pools()
            .iter()
            .any(|(_, pool)| pool.resource_pool().is_processing_frame())
    }
}

impl Drop for MultiDeviceBufferPool {
    fn drop(&mut self) {
        if let Err(error) = self.shutdown() {
            log::error!("multi-device buffer pool '{}' failed to shut down: {}", self.name(), error);
        }
    }
}
