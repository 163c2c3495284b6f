//! Memory accounting, simulated device memory and the sub-allocator used by pools.

mod heap;
mod page;
mod statistics;
mod tracking;
mod usage;

pub use heap::{DeviceAddressSpace, HeapAllocation, HeapAllocator, HeapAllocatorDescriptor};
pub(crate) use heap::RetiredHeap;
pub use page::{GpuAddress, MemoryPage, MemoryView};
pub use statistics::{
    MemoryReportDetail, MemoryStatistics, MemoryStatisticsBuilder, PoolStatistics, ResourceStatistics,
};
pub use tracking::{AllocationRecord, AllocationRecordError, AllocationRecords, AllocationTrackingMode};
pub use usage::{
    HeapMemoryLevel, HeapMemoryUsage, HeapMemoryUsageSnapshot, PoolMemoryUsage, PoolMemoryUsageSnapshot,
};
