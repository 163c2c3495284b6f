//! Simulated device memory.
//!
//! A [`MemoryPage`] stands in for one native heap allocation: it owns a unique GPU
//! address range on its device and the bytes behind it. Sub-allocations are handed
//! out as [`MemoryView`]s.

use std::fmt;
use std::ops::RangeBounds;
use std::sync::Arc;
use parking_lot::Mutex;
use crate::device_mask::DeviceIndex;
use crate::memory::HeapMemoryLevel;
use crate::utility::normalize_range_u64;
use crate::{RhiError, RhiResult};

pub type GpuAddress = u64;

pub struct MemoryPage {
    device_index: DeviceIndex,
    level: HeapMemoryLevel,
    base_address: GpuAddress,
    data: Mutex<Box<[u8]>>,
}

impl MemoryPage {
    pub(crate) fn new(
        device_index: DeviceIndex,
        level: HeapMemoryLevel,
        base_address: GpuAddress,
        size: u64,
    ) -> RhiResult<Self> {
        let len = usize::try_from(size).map_err(|_| RhiError::OutOfMemory)?;
        let mut data = Vec::new();
        data.try_reserve_exact(len).map_err(|_| RhiError::OutOfMemory)?;
        data.resize(len, 0u8);
        Ok(Self {
            device_index,
            level,
            base_address,
            data: Mutex::new(data.into_boxed_slice()),
        })
    }

    #[inline]
    pub fn device_index(&self) -> DeviceIndex { self.device_index }

    #[inline]
    pub fn level(&self) -> HeapMemoryLevel { self.level }

    #[inline]
    pub fn base_address(&self) -> GpuAddress { self.base_address }

    #[inline]
    pub fn size(&self) -> u64 {
        self.data.lock().len() as u64
    }
}

impl fmt::Debug for MemoryPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryPage")
            .field("device_index", &self.device_index)
            .field("level", &self.level)
            .field("base_address", &format_args!("{:#x}", self.base_address))
            .finish()
    }
}

/// A byte range inside a [`MemoryPage`].
#[derive(Clone, Debug)]
pub struct MemoryView {
    page: Arc<MemoryPage>,
    offset: u64,
    size: u64,
}

impl MemoryView {
    pub(crate) fn new(page: Arc<MemoryPage>, offset: u64, size: u64) -> Self {
        Self { page, offset, size }
    }

    #[inline]
    pub fn page(&self) -> &Arc<MemoryPage> { &self.page }

    #[inline]
    pub fn offset(&self) -> u64 { self.offset }

    #[inline]
    pub fn size(&self) -> u64 { self.size }

    #[inline]
    pub fn gpu_address(&self) -> GpuAddress {
        self.page.base_address + self.offset
    }

    /// Sub-range of this view, relative to its start.
    pub fn slice<R: RangeBounds<u64>>(&self, range: R) -> RhiResult<MemoryView> {
        let (offset, size) = normalize_range_u64(range, self.size)?;
        Ok(MemoryView {
            page: self.page.clone(),
            offset: self.offset + offset,
            size,
        })
    }

    pub fn write(&self, offset: u64, bytes: &[u8]) -> RhiResult {
        let (start, len) = normalize_range_u64(offset..offset + bytes.len() as u64, self.size)?;
        let begin = (self.offset + start) as usize;
        let mut data = self.page.data.lock();
        data[begin..begin + len as usize].copy_from_slice(bytes);
        Ok(())
    }

    pub fn read(&self, offset: u64, out: &mut [u8]) -> RhiResult {
        let (start, len) = normalize_range_u64(offset..offset + out.len() as u64, self.size)?;
        let begin = (self.offset + start) as usize;
        let data = self.page.data.lock();
        out.copy_from_slice(&data[begin..begin + len as usize]);
        Ok(())
    }

    pub fn to_vec(&self) -> Vec<u8> {
        let begin = self.offset as usize;
        self.page.data.lock()[begin..begin + self.size as usize].to_vec()
    }

    /// Copies all of `src` to the start of this view.
    pub fn copy_from(&self, src: &MemoryView) -> RhiResult {
        if src.size > self.size {
            return Err(RhiError::InvalidArgument);
        }
        // Staged through a temporary so two pages are never locked at once.
        let bytes = src.to_vec();
        self.write(0, &bytes)
    }
}
