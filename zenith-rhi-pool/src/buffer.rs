//! Device-local buffers.

use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use enumflags2::BitFlags;
use parking_lot::{Mutex, RwLock};
use zenith_core::log;
use zenith_rhi_derive::DeviceObject;
use crate::memory::{GpuAddress, HeapAllocation, MemoryStatisticsBuilder, MemoryView};
use crate::resource::{DeviceResource, ResourceBase};
use crate::resource_pool::DevicePool;
use crate::upload::UploadHandle;
use crate::RhiResult;

#[enumflags2::bitflags]
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BufferBind {
    Constant = 1 << 0,
    ShaderRead = 1 << 1,
    ShaderWrite = 1 << 2,
    CopyRead = 1 << 3,
    CopyWrite = 1 << 4,
    Indirect = 1 << 5,
    InputAssembly = 1 << 6,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct BufferBindFlags(BitFlags<BufferBind>);

impl BufferBindFlags {
    pub fn empty() -> Self {
        Self(BitFlags::empty())
    }

    pub fn insert(&mut self, bind: BufferBind) {
        self.0.insert(bind);
    }

    #[inline]
    pub fn contains(self, other: BufferBindFlags) -> bool {
        self.0.contains(other.0)
    }

    #[inline]
    pub fn is_empty(self) -> bool {
        self.0.is_empty()
    }
}

impl From<BufferBind> for BufferBindFlags {
    fn from(value: BufferBind) -> Self {
        Self(BitFlags::from_flag(value))
    }
}

impl core::ops::BitOr for BufferBindFlags {
    type Output = BufferBindFlags;
    fn bitor(self, rhs: BufferBindFlags) -> Self::Output {
        BufferBindFlags(self.0 | rhs.0)
    }
}

impl core::ops::BitOr<BufferBind> for BufferBindFlags {
    type Output = BufferBindFlags;
    fn bitor(self, rhs: BufferBind) -> Self::Output {
        BufferBindFlags(self.0 | rhs)
    }
}

/// Buffer descriptor for creating device-local buffers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferDescriptor {
    /// Size of the buffer in bytes.
    pub byte_count: u64,
    pub bind_flags: BufferBindFlags,
    /// Alignment of the backing allocation, raised to the pool's alignment if lower.
    pub alignment: u64,
}

impl Default for BufferDescriptor {
    fn default() -> Self {
        Self {
            byte_count: 0,
            bind_flags: BufferBindFlags::empty(),
            alignment: 16,
        }
    }
}

impl BufferDescriptor {
    pub fn new(byte_count: u64) -> Self {
        Self {
            byte_count,
            ..Default::default()
        }
    }

    /// Constant buffer, 256-byte aligned.
    pub fn constant(byte_count: u64) -> Self {
        Self {
            byte_count,
            bind_flags: BufferBind::Constant.into(),
            alignment: 256,
        }
    }

    /// Read-only shader input filled through copies.
    pub fn shader_read(byte_count: u64) -> Self {
        Self {
            byte_count,
            bind_flags: BufferBindFlags::from(BufferBind::ShaderRead) | BufferBind::CopyWrite,
            ..Default::default()
        }
    }

    pub fn with_bind_flags(mut self, bind_flags: impl Into<BufferBindFlags>) -> Self {
        self.bind_flags = bind_flags.into();
        self
    }

    pub fn with_alignment(mut self, alignment: u64) -> Self {
        self.alignment = alignment;
        self
    }
}

/// A buffer on one device. Created detached; a [`BufferPool`](crate::BufferPool) gives
/// it backing memory.
#[DeviceObject]
pub struct Buffer {
    base: ResourceBase<dyn DevicePool>,
    descriptor: RwLock<BufferDescriptor>,
    memory: RwLock<Option<HeapAllocation>>,
    map_ref_count: AtomicU32,
    upload_handle: Mutex<UploadHandle>,
}

impl Buffer {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            base: ResourceBase::new(name),
            descriptor: RwLock::new(BufferDescriptor::default()),
            memory: RwLock::new(None),
            map_ref_count: AtomicU32::new(0),
            upload_handle: Mutex::new(UploadHandle::NULL),
            device: Default::default(),
        })
    }

    #[inline]
    pub fn base(&self) -> &ResourceBase<dyn DevicePool> { &self.base }

    pub fn name(&self) -> String {
        self.base.name()
    }

    pub fn descriptor(&self) -> BufferDescriptor {
        self.descriptor.read().clone()
    }

    pub fn version(&self) -> u32 {
        self.base.version()
    }

    pub fn pool(&self) -> Option<Arc<dyn DevicePool>> {
        self.base.pool()
    }

    /// Backing memory, `None` while the buffer is not initialized.
    pub fn memory_view(&self) -> Option<MemoryView> {
        self.memory.read().as_ref().map(|m| m.view().clone())
    }

    pub fn gpu_address(&self) -> Option<GpuAddress> {
        self.memory.read().as_ref().map(HeapAllocation::gpu_address)
    }

    /// Bytes of backing memory, which may exceed the descriptor size by alignment.
    pub fn memory_size(&self) -> u64 {
        self.memory.read().as_ref().map_or(0, HeapAllocation::size)
    }

    #[inline]
    pub fn map_ref_count(&self) -> u32 {
        self.map_ref_count.load(Ordering::Acquire)
    }

    /// Handle of the last streaming upload into this buffer.
    pub fn upload_handle(&self) -> UploadHandle {
        *self.upload_handle.lock()
    }

    pub fn shutdown(&self) -> RhiResult {
        let resource: &dyn DeviceResource = self;
        resource.shutdown()
    }

    pub(crate) fn set_descriptor(&self, descriptor: BufferDescriptor) {
        *self.descriptor.write() = descriptor;
    }

    pub(crate) fn replace_memory(&self, memory: Option<HeapAllocation>) -> Option<HeapAllocation> {
        std::mem::replace(&mut *self.memory.write(), memory)
    }

    pub(crate) fn increment_map_ref_count(&self) {
        self.map_ref_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Returns `false` if the buffer was not mapped.
    pub(crate) fn decrement_map_ref_count(&self) -> bool {
        self.map_ref_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| count.checked_sub(1))
            .is_ok()
    }

    pub(crate) fn reset_map_ref_count(&self) {
        self.map_ref_count.store(0, Ordering::Release);
    }

    pub(crate) fn set_upload_handle(&self, handle: UploadHandle) {
        *self.upload_handle.lock() = handle;
    }
}

impl DeviceResource for Buffer {
    fn resource_base(&self) -> &ResourceBase<dyn DevicePool> {
        &self.base
    }

    fn report_memory_usage(&self, builder: &mut MemoryStatisticsBuilder) {
        builder.add_resource(&self.name(), "Buffer", self.memory_size());
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if self.base.pool_id().is_some() {
            log::warn!("buffer '{}' dropped while registered, shutting it down", self.name());
            if let Err(error) = self.shutdown() {
                log::error!("failed to shut down buffer '{}': {}", self.name(), error);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceObject;

    #[test]
    fn descriptor_helpers_set_binds_and_alignment() {
        let constant = BufferDescriptor::constant(64);
        assert_eq!(constant.alignment, 256);
        assert!(constant.bind_flags.contains(BufferBind::Constant.into()));

        let read = BufferDescriptor::shader_read(32).with_alignment(64);
        assert!(read.bind_flags.contains(BufferBindFlags::from(BufferBind::ShaderRead) | BufferBind::CopyWrite));
        assert!(!read.bind_flags.contains(BufferBind::ShaderWrite.into()));
        assert_eq!(read.alignment, 64);
    }

    #[test]
    fn detached_buffer_has_no_backing() {
        let buffer = Buffer::new("detached");
        assert!(buffer.memory_view().is_none());
        assert!(buffer.gpu_address().is_none());
        assert!(!buffer.is_initialized());
        assert!(!buffer.decrement_map_ref_count());
        buffer.shutdown().unwrap();
    }
}
