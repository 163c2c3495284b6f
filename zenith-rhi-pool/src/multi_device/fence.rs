//! Fences spanning several devices.

use std::sync::Arc;
use std::time::Duration;
use zenith_core::log;
use crate::context::RhiContext;
use crate::device_mask::{DeviceIndex, DeviceMask};
use crate::fence::{Fence, FenceState, FenceWaitResult};
use crate::multi_device::object::{DeviceObjects, MultiDeviceObject};
use crate::{RhiError, RhiResult};

/// One [`Fence`] per device of a mask.
///
/// `init_shared` creates a single timeline on the original device and imports it on
/// every other device, so signaling the original completes the fence everywhere.
pub struct MultiDeviceFence {
    name: String,
    fences: MultiDeviceObject<Fence>,
}

impl MultiDeviceFence {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fences: MultiDeviceObject::default(),
        }
    }

    #[inline]
    pub fn name(&self) -> &str { &self.name }

    pub fn device_mask(&self) -> DeviceMask {
        self.fences.device_mask()
    }

    pub fn device_fence(&self, index: DeviceIndex) -> Option<Arc<Fence>> {
        self.fences.device_object(index)
    }

    pub fn is_initialized(&self) -> bool {
        !self.fences.is_empty()
    }

    fn validate_uninitialized(&self, mask: DeviceMask) -> RhiResult {
        if self.is_initialized() {
            log::error!("multi-device fence '{}' initialized twice", self.name);
            return Err(RhiError::InvalidOperation);
        }
        if mask.is_empty() {
            return Err(RhiError::InvalidArgument);
        }
        Ok(())
    }

    /// Independent fence on every device of `mask`.
    pub fn init(&self, context: &RhiContext, mask: DeviceMask, initial_state: FenceState) -> RhiResult {
        self.validate_uninitialized(mask)?;
        let mut fences = DeviceObjects::new();
        for device in context.devices_in(mask)? {
            let fence = Fence::new().with_name(format!("{} [{}]", self.name, device.index()));
            fence.init(&device, initial_state)?;
            fences.push((device.index(), Arc::new(fence)));
        }
        self.fences.replace(fences);
        Ok(())
    }

    /// Fence owned by `original` and imported on the other devices of `mask`.
    pub fn init_shared(
        &self,
        context: &RhiContext,
        mask: DeviceMask,
        original: DeviceIndex,
        initial_state: FenceState,
    ) -> RhiResult {
        self.validate_uninitialized(mask)?;
        if !mask.contains(original) {
            log::error!("original device {} of fence '{}' is not in {}", original, self.name, mask);
            return Err(RhiError::InvalidArgument);
        }
        let devices = context.devices_in(mask)?;
        let Some(original_device) = devices.iter().find(|device| device.index() == original) else {
            return Err(RhiError::InvalidArgument);
        };

        let original_fence = Fence::new().with_name(format!("{} [{}]", self.name, original));
        original_fence.init(original_device, initial_state)?;
        let original_fence = Arc::new(original_fence);

        let mut fences = DeviceObjects::new();
        for device in &devices {
            if device.index() == original {
                fences.push((original, original_fence.clone()));
                continue;
            }
            let import = Fence::new().with_name(format!("{} [{} from {}]", self.name, device.index(), original));
            import.init_cross_device(device, &original_fence)?;
            fences.push((device.index(), Arc::new(import)));
        }
        self.fences.replace(fences);
        Ok(())
    }

    /// Completes every fence from the CPU. Cross-device imports complete through
    /// their original.
    pub fn signal_on_cpu(&self) -> RhiResult {
        self.fences.iterate_objects(|_, fence| {
            if fence.is_cross_device() {
                return Ok(());
            }
            fence.signal_on_cpu()
        })
    }

    /// Advances every fence that owns its timeline.
    pub fn reset(&self) -> RhiResult {
        self.fences.iterate_objects(|_, fence| {
            if fence.is_cross_device() {
                return Ok(());
            }
            fence.reset()
        })
    }

    /// Signaled once every device fence is.
    pub fn fence_state(&self) -> FenceState {
        let all_signaled = self
            .fences
            .device_objects()
            .iter()
            .all(|(_, fence)| fence.fence_state() == FenceState::Signaled);
        if all_signaled { FenceState::Signaled } else { FenceState::Reset }
    }

    /// Waits on every device fence. The timeout applies to each wait.
    pub fn wait_on_cpu(&self, timeout: Option<Duration>) -> RhiResult<FenceWaitResult> {
        for (_, fence) in self.fences.device_objects() {
            if fence.wait_on_cpu(timeout)? == FenceWaitResult::TimedOut {
                return Ok(FenceWaitResult::TimedOut);
            }
        }
        Ok(FenceWaitResult::Signaled)
    }

    pub fn shutdown(&self) {
        for (_, fence) in self.fences.clear() {
            fence.shutdown();
        }
    }
}

impl Drop for MultiDeviceFence {
    fn drop(&mut self) {
        self.shutdown();
    }
}
