//! Views over resources that cache backing addresses and rebuild when invalidated.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use zenith_core::log;
use crate::buffer::Buffer;
use crate::id::ObjectId;
use crate::memory::{GpuAddress, MemoryView};
use crate::resource::ResourceInvalidateListener;
use crate::utility::normalize_range_u64;
use crate::{RhiError, RhiResult};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct BufferViewDescriptor {
    pub byte_offset: u64,
    /// Zero views everything past `byte_offset`.
    pub byte_count: u64,
}

impl BufferViewDescriptor {
    pub fn whole() -> Self {
        Self::default()
    }

    pub fn range(byte_offset: u64, byte_count: u64) -> Self {
        Self { byte_offset, byte_count }
    }
}

/// Caches the GPU address of a buffer range.
///
/// Listens for invalidation of its buffer; after an orphan the cached address follows
/// the new backing, after a shutdown it drops to zero.
pub struct BufferView {
    id: ObjectId,
    buffer: Arc<Buffer>,
    byte_offset: u64,
    byte_count: u64,
    gpu_address: AtomicU64,
    invalidation_count: AtomicU32,
}

impl BufferView {
    pub fn new(buffer: &Arc<Buffer>, descriptor: BufferViewDescriptor) -> RhiResult<Arc<Self>> {
        let size = buffer.descriptor().byte_count;
        if buffer.memory_view().is_none() {
            log::error!("view of uninitialized buffer '{}'", buffer.name());
            return Err(RhiError::InvalidOperation);
        }
        let end = match descriptor.byte_count {
            0 => size,
            count => descriptor.byte_offset.checked_add(count).ok_or(RhiError::InvalidArgument)?,
        };
        let (byte_offset, byte_count) = normalize_range_u64(descriptor.byte_offset..end, size)?;

        let view = Arc::new(Self {
            id: ObjectId::next(),
            buffer: buffer.clone(),
            byte_offset,
            byte_count,
            gpu_address: AtomicU64::new(0),
            invalidation_count: AtomicU32::new(0),
        });
        view.rebuild();
        let listener: Weak<dyn ResourceInvalidateListener> = Arc::downgrade(&view) as Weak<BufferView>;
        buffer.base().add_invalidate_listener(view.id, listener);
        Ok(view)
    }

    #[inline]
    pub fn buffer(&self) -> &Arc<Buffer> { &self.buffer }

    #[inline]
    pub fn byte_offset(&self) -> u64 { self.byte_offset }

    #[inline]
    pub fn byte_count(&self) -> u64 { self.byte_count }

    /// Zero once the buffer lost its backing.
    #[inline]
    pub fn gpu_address(&self) -> GpuAddress {
        self.gpu_address.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.gpu_address() != 0
    }

    #[inline]
    pub fn invalidation_count(&self) -> u32 {
        self.invalidation_count.load(Ordering::Acquire)
    }

    pub fn memory_view(&self) -> Option<MemoryView> {
        self.buffer
            .memory_view()?
            .slice(self.byte_offset..self.byte_offset + self.byte_count)
            .ok()
    }

    fn rebuild(&self) {
        let address = self.buffer.gpu_address().map_or(0, |base| base + self.byte_offset);
        self.gpu_address.store(address, Ordering::Release);
    }
}

impl ResourceInvalidateListener for BufferView {
    fn on_resource_invalidated(&self) {
        self.invalidation_count.fetch_add(1, Ordering::AcqRel);
        self.rebuild();
    }
}

impl Drop for BufferView {
    fn drop(&mut self) {
        self.buffer.base().remove_invalidate_listener(self.id);
    }
}
