//! Owner of the enumerated devices, passed explicitly to every multi-device pool.

use std::sync::Arc;
use derive_builder::Builder;
use zenith_core::log;
use crate::device::{Device, DeviceDescriptor};
use crate::device_mask::{DeviceIndex, DeviceMask, MAX_DEVICE_COUNT};
use crate::memory::{MemoryReportDetail, MemoryStatistics};
use crate::release::LastFreedStats;
use crate::{RhiError, RhiResult};

#[derive(Clone, Debug, Builder)]
#[builder(setter(into))]
pub struct RhiConfig {
    #[builder(default = "1")]
    pub device_count: u32,
    /// Template for every device; each device gets its index appended to the name.
    #[builder(default)]
    pub device: DeviceDescriptor,
    /// Descriptors used instead of the template for the listed devices.
    #[builder(default)]
    pub device_overrides: Vec<(DeviceIndex, DeviceDescriptor)>,
}

impl Default for RhiConfig {
    fn default() -> Self {
        Self {
            device_count: 1,
            device: DeviceDescriptor::default(),
            device_overrides: Vec::new(),
        }
    }
}

pub struct RhiContext {
    devices: Vec<Arc<Device>>,
}

impl RhiContext {
    pub fn new(config: &RhiConfig) -> RhiResult<Self> {
        if config.device_count == 0 || config.device_count > MAX_DEVICE_COUNT {
            log::error!("unsupported device count {}", config.device_count);
            return Err(RhiError::InvalidArgument);
        }

        if let Some((index, _)) = config.device_overrides.iter().find(|(index, _)| *index >= config.device_count) {
            log::error!("descriptor override for device {} of {}", index, config.device_count);
            return Err(RhiError::InvalidArgument);
        }

        let devices = (0..config.device_count)
            .map(|index| {
                let template = config
                    .device_overrides
                    .iter()
                    .find(|(overridden, _)| *overridden == index)
                    .map_or(&config.device, |(_, descriptor)| descriptor);
                let mut descriptor = template.clone();
                descriptor.name = format!("{} {}", template.name, index);
                Device::new(index, &descriptor)
            })
            .collect::<RhiResult<Vec<_>>>()?;
        log::info!("RHI context with {} device(s)", devices.len());
        Ok(Self { devices })
    }

    #[inline]
    pub fn device_count(&self) -> u32 {
        self.devices.len() as u32
    }

    #[inline]
    pub fn device(&self, index: DeviceIndex) -> Option<&Arc<Device>> {
        self.devices.get(index as usize)
    }

    #[inline]
    pub fn devices(&self) -> &[Arc<Device>] {
        &self.devices
    }

    pub fn all_devices_mask(&self) -> DeviceMask {
        DeviceMask::first_n(self.device_count())
    }

    /// Devices selected by `mask`, or `InvalidArgument` if it names an unknown device.
    pub fn devices_in(&self, mask: DeviceMask) -> RhiResult<Vec<Arc<Device>>> {
        if !self.all_devices_mask().is_superset_of(mask) {
            log::error!("device mask {} exceeds the {} available device(s)", mask, self.device_count());
            return Err(RhiError::InvalidArgument);
        }
        Ok(mask.iter().map(|index| self.devices[index as usize].clone()).collect())
    }

    pub fn begin_frame(&self) -> RhiResult {
        self.devices.iter().try_for_each(|d| d.begin_frame().map(|_| ()))
    }

    pub fn compile_frame(&self) -> RhiResult {
        self.devices.iter().try_for_each(|d| d.compile_frame())
    }

    /// Ends the frame on every device and returns the submitted fence values by device.
    pub fn end_frame(&self) -> RhiResult<Vec<u64>> {
        self.devices.iter().map(|d| d.end_frame()).collect()
    }

    /// Reports GPU progress up to `fence_value` on every device.
    pub fn complete_gpu_work(&self, fence_value: u64) -> RhiResult {
        self.devices.iter().try_for_each(|d| d.complete_gpu_work(fence_value))
    }

    pub fn memory_statistics(&self, detail: MemoryReportDetail) -> Vec<MemoryStatistics> {
        self.devices.iter().map(|d| d.report_memory_usage(detail)).collect()
    }

    pub fn wait_for_idle(&self) -> RhiResult<LastFreedStats> {
        let mut total = LastFreedStats::default();
        for device in &self.devices {
            let freed = device.wait_for_idle()?;
            total.object_count += freed.object_count;
            total.bytes += freed.bytes;
            total.completed_fence_value = total.completed_fence_value.max(freed.completed_fence_value);
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceDescriptorBuilder;
    use crate::memory::HeapMemoryLevel;

    fn config(device_count: u32) -> RhiConfig {
        RhiConfigBuilder::default()
            .device_count(device_count)
            .device(DeviceDescriptorBuilder::default().name("Gpu").async_upload(false).build().unwrap())
            .build()
            .unwrap()
    }

    #[test]
    fn enumerates_devices_with_indexed_names() {
        let context = RhiContext::new(&config(3)).unwrap();
        assert_eq!(context.device_count(), 3);
        assert_eq!(context.all_devices_mask(), DeviceMask::from_bits(0b111));
        assert_eq!(context.device(2).unwrap().name(), "Gpu 2");
        assert!(context.device(3).is_none());
    }

    #[test]
    fn rejects_zero_devices_and_foreign_masks() {
        assert!(matches!(RhiContext::new(&config(0)), Err(RhiError::InvalidArgument)));
        let context = RhiContext::new(&config(2)).unwrap();
        assert_eq!(context.devices_in(DeviceMask::from_bits(0b100)).err(), Some(RhiError::InvalidArgument));
        assert_eq!(context.devices_in(DeviceMask::single(1)).unwrap()[0].index(), 1);
    }

    #[test]
    fn overrides_replace_the_template_per_device() {
        let mut config = config(2);
        let small = DeviceDescriptorBuilder::default()
            .name("Small")
            .host_memory_capacity(512u64)
            .async_upload(false)
            .build()
            .unwrap();
        config.device_overrides = vec![(1, small)];
        let context = RhiContext::new(&config).unwrap();
        assert_eq!(context.device(0).unwrap().name(), "Gpu 0");
        assert_eq!(context.device(1).unwrap().name(), "Small 1");
        assert_eq!(context.device(0).unwrap().address_space().capacity(HeapMemoryLevel::Host), 0);
        assert_eq!(context.device(1).unwrap().address_space().capacity(HeapMemoryLevel::Host), 512);

        config.device_overrides = vec![(2, DeviceDescriptor::default())];
        assert!(matches!(RhiContext::new(&config), Err(RhiError::InvalidArgument)));
    }

    #[test]
    fn frames_fan_out_to_every_device() {
        let context = RhiContext::new(&config(2)).unwrap();
        context.begin_frame().unwrap();
        context.compile_frame().unwrap();
        assert_eq!(context.end_frame().unwrap(), vec![1, 1]);
        context.complete_gpu_work(1).unwrap();
        for device in context.devices() {
            assert_eq!(device.frame_fence().completed_value(), 1);
        }
    }
}
