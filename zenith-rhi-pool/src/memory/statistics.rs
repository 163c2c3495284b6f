//! Memory report tree produced by pools and their resources.

use crate::device_mask::DeviceIndex;
use crate::memory::PoolMemoryUsageSnapshot;
use crate::rhi_assert;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum MemoryReportDetail {
    /// Pool aggregates only.
    #[default]
    Summary,
    /// Pool aggregates, one entry per resource and a fresh fragmentation figure.
    Detail,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourceStatistics {
    pub name: String,
    pub kind: &'static str,
    pub size_in_bytes: u64,
}

#[derive(Clone, Debug, Default)]
pub struct PoolStatistics {
    pub name: String,
    pub memory_usage: PoolMemoryUsageSnapshot,
    pub resources: Vec<ResourceStatistics>,
}

#[derive(Clone, Debug, Default)]
pub struct MemoryStatistics {
    pub device_index: DeviceIndex,
    pub detail: MemoryReportDetail,
    pub pools: Vec<PoolStatistics>,
}

impl MemoryStatistics {
    pub fn pool(&self, name: &str) -> Option<&PoolStatistics> {
        self.pools.iter().find(|p| p.name == name)
    }
}

/// Accumulates [`MemoryStatistics`] for one device.
///
/// Pools report between `begin_pool` and `end_pool`; resources add themselves to the
/// pool that is currently open.
pub struct MemoryStatisticsBuilder {
    statistics: MemoryStatistics,
    open_pool: Option<PoolStatistics>,
}

impl MemoryStatisticsBuilder {
    pub fn new(device_index: DeviceIndex, detail: MemoryReportDetail) -> Self {
        Self {
            statistics: MemoryStatistics {
                device_index,
                detail,
                pools: Vec::new(),
            },
            open_pool: None,
        }
    }

    #[inline]
    pub fn report_detail(&self) -> MemoryReportDetail {
        self.statistics.detail
    }

    pub fn begin_pool(&mut self, name: &str) -> &mut PoolStatistics {
        rhi_assert!(self.open_pool.is_none(), "begin_pool('{}') while another pool is open", name);
        self.open_pool.insert(PoolStatistics {
            name: name.to_owned(),
            ..Default::default()
        })
    }

    /// The pool opened by the last `begin_pool`.
    pub fn current_pool(&mut self) -> Option<&mut PoolStatistics> {
        self.open_pool.as_mut()
    }

    pub fn add_resource(&mut self, name: &str, kind: &'static str, size_in_bytes: u64) {
        match self.open_pool.as_mut() {
            Some(pool) => pool.resources.push(ResourceStatistics {
                name: name.to_owned(),
                kind,
                size_in_bytes,
            }),
            None => rhi_assert!(false, "resource '{}' reported outside of a pool scope", name),
        }
    }

    pub fn end_pool(&mut self) {
        match self.open_pool.take() {
            Some(pool) => self.statistics.pools.push(pool),
            None => rhi_assert!(false, "end_pool without matching begin_pool"),
        }
    }

    pub fn finish(mut self) -> MemoryStatistics {
        if let Some(pool) = self.open_pool.take() {
            rhi_assert!(false, "pool '{}' left open when finishing the memory report", pool.name);
        }
        self.statistics
    }
}
