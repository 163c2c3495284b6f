//! Shader resource groups and their pool spanning several devices.

use std::any::Any;
use std::ops::Range;
use std::sync::Arc;
use zenith_core::collections::SmallVec;
use zenith_core::log;
use crate::context::RhiContext;
use crate::device_mask::{DeviceIndex, DeviceMask};
use crate::id::ObjectId;
use crate::multi_device::buffer::MultiDeviceBufferView;
use crate::multi_device::object::{DeviceObjects, MultiDeviceObject};
use crate::multi_device::pool::{MultiDevicePool, MultiDeviceResourcePool};
use crate::multi_device::resource::MultiDeviceResource;
use crate::resource::ResourceBase;
use crate::srg::{
    SamplerConfig, ShaderInput, ShaderInputType, ShaderResourceGroup, ShaderResourceGroupData,
    ShaderResourceGroupLayout,
};
use crate::srg_pool::{ShaderResourceGroupPool, ShaderResourceGroupPoolDescriptor};
use crate::{RhiError, RhiResult};

#[derive(Clone)]
pub enum MultiDeviceShaderInput {
    Buffer(Arc<MultiDeviceBufferView>),
    Image(ObjectId),
    Sampler(SamplerConfig),
}

/// Group data whose buffer inputs span devices; each device compiles its own slice.
#[derive(Clone)]
pub struct MultiDeviceShaderResourceGroupData {
    layout: Arc<ShaderResourceGroupLayout>,
    constants: Vec<u8>,
    inputs: Vec<Option<MultiDeviceShaderInput>>,
}

impl MultiDeviceShaderResourceGroupData {
    pub fn new(layout: &Arc<ShaderResourceGroupLayout>) -> Self {
        Self {
            layout: layout.clone(),
            constants: vec![0; layout.constant_byte_count() as usize],
            inputs: vec![None; layout.slot_count()],
        }
    }

    #[inline]
    pub fn layout(&self) -> &Arc<ShaderResourceGroupLayout> { &self.layout }

    #[inline]
    pub fn constant_data(&self) -> &[u8] { &self.constants }

    pub fn set_constants(&mut self, byte_offset: u64, bytes: &[u8]) -> RhiResult<&mut Self> {
        let start = usize::try_from(byte_offset).map_err(|_| RhiError::InvalidArgument)?;
        let end = start.checked_add(bytes.len()).ok_or(RhiError::InvalidArgument)?;
        let Some(target) = self.constants.get_mut(start..end) else {
            log::error!("constants {}..{} exceed layout '{}'", start, end, self.layout.name());
            return Err(RhiError::InvalidArgument);
        };
        target.copy_from_slice(bytes);
        Ok(self)
    }

    pub fn bind_buffer(&mut self, name: &str, array_index: u32, view: &Arc<MultiDeviceBufferView>) -> RhiResult<&mut Self> {
        let slot = self.layout.slot(name, array_index, ShaderInputType::Buffer)?;
        self.inputs[slot] = Some(MultiDeviceShaderInput::Buffer(view.clone()));
        Ok(self)
    }

    pub fn bind_image(&mut self, name: &str, array_index: u32, image: ObjectId) -> RhiResult<&mut Self> {
        let slot = self.layout.slot(name, array_index, ShaderInputType::Image)?;
        self.inputs[slot] = Some(MultiDeviceShaderInput::Image(image));
        Ok(self)
    }

    pub fn bind_sampler(&mut self, name: &str, array_index: u32, sampler: SamplerConfig) -> RhiResult<&mut Self> {
        let slot = self.layout.slot(name, array_index, ShaderInputType::Sampler)?;
        self.inputs[slot] = Some(MultiDeviceShaderInput::Sampler(sampler));
        Ok(self)
    }

    /// The slice of this data seen by device `index`. Buffer inputs resolve to the
    /// device view, which must exist.
    pub fn device_data(&self, index: DeviceIndex) -> RhiResult<ShaderResourceGroupData> {
        let mut data = ShaderResourceGroupData::new(&self.layout);
        data.constants_mut().copy_from_slice(&self.constants);
        for (slot, input) in self.inputs.iter().enumerate() {
            let input = match input {
                None => None,
                Some(MultiDeviceShaderInput::Buffer(view)) => {
                    let Some(device_view) = view.device_view(index) else {
                        log::error!("view of '{}' has no part on device {}", view.buffer().name(), index);
                        return Err(RhiError::InvalidArgument);
                    };
                    Some(ShaderInput::Buffer(device_view))
                }
                Some(MultiDeviceShaderInput::Image(image)) => Some(ShaderInput::Image(*image)),
                Some(MultiDeviceShaderInput::Sampler(sampler)) => Some(ShaderInput::Sampler(*sampler)),
            };
            data.set_input(slot, input);
        }
        Ok(data)
    }
}

/// One logical group backed by a [`ShaderResourceGroup`] on every device of its mask.
pub struct MultiDeviceShaderResourceGroup {
    base: ResourceBase<dyn MultiDevicePool>,
    groups: MultiDeviceObject<ShaderResourceGroup>,
}

impl MultiDeviceShaderResourceGroup {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            base: ResourceBase::new(name),
            groups: MultiDeviceObject::default(),
        })
    }

    #[inline]
    pub fn base(&self) -> &ResourceBase<dyn MultiDevicePool> { &self.base }

    pub fn name(&self) -> String {
        self.base.name()
    }

    pub fn device_group(&self, index: DeviceIndex) -> Option<Arc<ShaderResourceGroup>> {
        self.groups.device_object(index)
    }

    pub fn device_groups(&self) -> DeviceObjects<ShaderResourceGroup> {
        self.groups.device_objects()
    }

    pub fn covers_mask(&self) -> bool {
        self.groups.covers_mask()
    }

    pub fn shutdown(&self) -> RhiResult {
        let resource: &dyn MultiDeviceResource = self;
        resource.shutdown()
    }
}

impl MultiDeviceResource for MultiDeviceShaderResourceGroup {
    fn resource_base(&self) -> &ResourceBase<dyn MultiDevicePool> {
        &self.base
    }

    fn device_mask(&self) -> DeviceMask {
        self.groups.device_mask()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Drop for MultiDeviceShaderResourceGroup {
    fn drop(&mut self) {
        if self.base.pool_id().is_some() {
            log::warn!("multi-device group '{}' dropped while registered, shutting it down", self.name());
            if let Err(error) = self.shutdown() {
                log::error!("failed to shut down multi-device group '{}': {}", self.name(), error);
            }
        }
    }
}

/// Splits the global batch `interval` over devices whose batches are laid end to end
/// in device order. Devices the interval does not touch get no entry.
pub fn redistribute_interval(
    counts: &[(DeviceIndex, usize)],
    interval: Range<usize>,
) -> SmallVec<[(DeviceIndex, Range<usize>); 4]> {
    let mut local = SmallVec::new();
    let mut start = 0;
    for &(index, count) in counts {
        let low = interval.start.max(start);
        let high = interval.end.min(start + count);
        if low < high {
            local.push((index, low - start..high - start));
        }
        start += count;
    }
    local
}

/// Multi-device shader resource group pool. Every fan-out either succeeds on all
/// devices or leaves no trace on any of them, except compiles which stop at the
/// first failing device.
pub struct MultiDeviceShaderResourceGroupPool {
    pool: MultiDeviceResourcePool,
    device_pools: MultiDeviceObject<ShaderResourceGroupPool>,
}

impl MultiDeviceShaderResourceGroupPool {
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

    pub fn device_pool(&self, index: DeviceIndex) -> Option<Arc<ShaderResourceGroupPool>> {
        self.device_pools.device_object(index)
    }

    pub fn device_pools(&self) -> DeviceObjects<ShaderResourceGroupPool> {
        self.device_pools.device_objects()
    }

    pub fn layout(&self) -> Option<Arc<ShaderResourceGroupLayout>> {
        self.device_pools().first().and_then(|(_, pool)| pool.layout())
    }

    pub fn resource_count(&self) -> usize {
        self.pool.resource_count()
    }

    pub fn init(
        self: &Arc<Self>,
        context: &RhiContext,
        mask: DeviceMask,
        descriptor: &ShaderResourceGroupPoolDescriptor,
    ) -> RhiResult {
        self.pool.init(self, context, mask, |devices| {
            let name = self.name();
            let mut created = DeviceObjects::new();
            for device in devices {
                let pool = ShaderResourceGroupPool::new(format!("{} [{}]", name, device.index()));
                if let Err(error) = pool.init(device, descriptor) {
                    log::error!("group pool '{}' failed on device {}, rolling back", name, device.index());
                    for (_, pool) in &created {
                        shutdown_pool_quietly(pool);
                    }
                    return Err(error);
                }
                created.push((device.index(), pool));
            }
            self.device_pools.replace(created);
            Ok(())
        })
    }

    #[profiling::function]
    pub fn init_group(&self, group: &Arc<MultiDeviceShaderResourceGroup>) -> RhiResult {
        self.pool.init_resource(group, || {
            let name = group.name();
            let mut created = DeviceObjects::new();
            for (index, pool) in self.device_pools() {
                let device_group = ShaderResourceGroup::new(format!("{} [{}]", name, index));
                if let Err(error) = pool.init_group(&device_group) {
                    log::error!("group '{}' failed on device {}: {}, rolling back", name, index, error);
                    for (_, device_group) in &created {
                        shutdown_group_quietly(device_group);
                    }
                    return Err(error);
                }
                created.push((index, device_group));
            }
            group.groups.replace(created);
            Ok(())
        })
    }

    fn validate_group(&self, group: &MultiDeviceShaderResourceGroup) -> RhiResult {
        if !self.pool.is_registered(group) {
            log::error!("group '{}' is not registered with multi-device pool '{}'", group.name(), self.name());
            return Err(RhiError::InvalidArgument);
        }
        Ok(())
    }

    fn device_pairs(
        &self,
        group: &MultiDeviceShaderResourceGroup,
    ) -> RhiResult<SmallVec<[(DeviceIndex, Arc<ShaderResourceGroupPool>, Arc<ShaderResourceGroup>); 4]>> {
        group
            .device_groups()
            .into_iter()
            .map(|(index, device_group)| {
                let pool = self.device_pool(index).ok_or(RhiError::InvalidOperation)?;
                Ok((index, pool, device_group))
            })
            .collect()
    }

    /// Queues the matching device slice of `data` on every device.
    pub fn queue_for_compile(
        &self,
        group: &MultiDeviceShaderResourceGroup,
        data: &MultiDeviceShaderResourceGroupData,
    ) -> RhiResult {
        self.validate_group(group)?;
        let pairs = self.device_pairs(group)?;
        let slices = pairs
            .iter()
            .map(|(index, _, _)| data.device_data(*index))
            .collect::<RhiResult<SmallVec<[_; 4]>>>()?;
        for ((_, pool, device_group), slice) in pairs.iter().zip(slices) {
            pool.queue_for_compile(device_group, slice)?;
        }
        Ok(())
    }

    /// Total of the device batches.
    pub fn groups_to_compile_count(&self) -> usize {
        self.device_pools()
            .iter()
            .map(|(_, pool)| pool.groups_to_compile_count())
            .sum()
    }

    /// Opens a batch on every device. Returns the total batch size. A device failure
    /// cancels the batches opened so far and puts their groups back in the queues.
    pub fn compile_groups_begin(&self) -> RhiResult<usize> {
        let pools = self.device_pools();
        let mut total = 0;
        for (position, (index, pool)) in pools.iter().enumerate() {
            match pool.compile_groups_begin() {
                Ok(count) => total += count,
                Err(error) => {
                    log::error!("compile batch of '{}' failed on device {}: {}, rolling back", self.name(), index, error);
                    for (opened_index, opened) in &pools[..position] {
                        if let Err(error) = opened.cancel_compile_batch() {
                            log::error!("failed to roll back the batch of device {}: {}", opened_index, error);
                        }
                    }
                    return Err(error);
                }
            }
        }
        Ok(total)
    }

    /// Compiles `interval` of the global batch: device batches are laid end to end in
    /// device order and each device compiles its local share.
    #[profiling::function]
    pub fn compile_groups_for_interval(&self, interval: Range<usize>) -> RhiResult {
        let pools = self.device_pools();
        let counts: SmallVec<[_; 4]> = pools
            .iter()
            .map(|(index, pool)| (*index, pool.groups_to_compile_count()))
            .collect();
        let total: usize = counts.iter().map(|(_, count)| count).sum();
        if interval.start > interval.end || interval.end > total {
            log::error!("compile interval {:?} outside the {} queued groups of '{}'", interval, total, self.name());
            return Err(RhiError::InvalidArgument);
        }

        for (index, local) in redistribute_interval(&counts, interval) {
            let Some((_, pool)) = pools.iter().find(|(i, _)| *i == index) else {
                continue;
            };
            log::trace!("'{}' compiles groups {:?} on device {}", self.name(), local, index);
            pool.compile_groups_for_interval(local)?;
        }
        Ok(())
    }

    pub fn compile_groups_end(&self) -> RhiResult {
        self.device_pools.iterate_objects(|_, pool| pool.compile_groups_end())
    }

    /// Compiles `data` into every device group immediately, stopping at the first failure.
    pub fn compile_group(
        &self,
        group: &MultiDeviceShaderResourceGroup,
        data: &MultiDeviceShaderResourceGroupData,
    ) -> RhiResult {
        self.validate_group(group)?;
        for (index, pool, device_group) in self.device_pairs(group)? {
            pool.compile_group(&device_group, &data.device_data(index)?)?;
        }
        Ok(())
    }

    pub fn shutdown(&self) -> RhiResult {
        self.pool.shutdown(self)
    }
}

fn shutdown_pool_quietly(pool: &ShaderResourceGroupPool) {
    if let Err(error) = pool.shutdown() {
        log::error!("failed to shut down group pool '{}': {}", pool.name(), error);
    }
}

fn shutdown_group_quietly(group: &ShaderResourceGroup) {
    if let Err(error) = group.shutdown() {
        log::error!("failed to shut down group '{}': {}", group.name(), error);
    }
}

impl MultiDevicePool for MultiDeviceShaderResourceGroupPool {
    fn multi_device_pool(&self) -> &MultiDeviceResourcePool {
        &self.pool
    }

    fn shutdown_resource_internal(&self, resource: &dyn MultiDeviceResource) {
        let Some(group) = resource.downcast_ref::<MultiDeviceShaderResourceGroup>() else {
            log::error!("multi-device group pool '{}' asked to release a non-group resource", self.name());
            return;
        };
        for (_, device_group) in group.groups.clear() {
            shutdown_group_quietly(&device_group);
        }
        group.base().invalidate_views();
    }

    fn shutdown_internal(&self) {
        for (_, pool) in self.device_pools.clear() {
            shutdown_pool_quietly(&pool);
        }
    }

    fn is_processing_frame(&self) -> bool {
        self.device_pools()
            .iter()
            .any(|(_, pool)| pool.resource_pool().is_processing_frame())
    }
}

impl Drop for MultiDeviceShaderResourceGroupPool {
    fn drop(&mut self) {
        if let Err(error) = self.shutdown() {
            log::error!("multi-device group pool '{}' failed to shut down: {}", self.name(), error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn intervals(counts: &[(DeviceIndex, usize)], interval: Range<usize>) -> Vec<(DeviceIndex, Range<usize>)> {
        redistribute_interval(counts, interval).into_vec()
    }

    #[test]
    fn interval_spanning_two_devices() {
        assert_eq!(intervals(&[(0, 5), (1, 3)], 3..7), vec![(0, 3..5), (1, 0..2)]);
    }

    #[test]
    fn interval_inside_one_device() {
        assert_eq!(intervals(&[(0, 5), (1, 3)], 1..4), vec![(0, 1..4)]);
        assert_eq!(intervals(&[(0, 5), (1, 3)], 6..8), vec![(1, 1..3)]);
    }

    #[test]
    fn interval_at_device_boundary() {
        assert_eq!(intervals(&[(0, 5), (1, 3)], 5..6), vec![(1, 0..1)]);
        assert_eq!(intervals(&[(0, 5), (1, 3)], 4..5), vec![(0, 4..5)]);
    }

    #[test]
    fn single_group_at_first_index() {
        assert_eq!(intervals(&[(0, 5), (1, 3)], 0..1), vec![(0, 0..1)]);
    }

    #[test]
    fn empty_devices_and_intervals_dispatch_nothing() {
        assert_eq!(intervals(&[(0, 0), (2, 4)], 0..2), vec![(2, 0..2)]);
        assert!(intervals(&[(0, 5), (1, 3)], 3..3).is_empty());
        assert_eq!(intervals(&[(0, 2), (1, 2), (3, 2)], 1..6), vec![(0, 1..2), (1, 0..2), (3, 0..2)]);
    }
}
