//! Logical resources spanning several devices.

use std::any::Any;
use crate::device_mask::DeviceMask;
use crate::multi_device::pool::MultiDevicePool;
use crate::resource::ResourceBase;
use crate::RhiResult;

/// A resource made of one device-local resource per device of its mask, registered
/// with at most one [`MultiDevicePool`].
pub trait MultiDeviceResource: Send + Sync + 'static {
    fn resource_base(&self) -> &ResourceBase<dyn MultiDevicePool>;

    fn device_mask(&self) -> DeviceMask;

    fn as_any(&self) -> &dyn Any;
}

impl dyn MultiDeviceResource {
    /// Hands the resource back to its pool, which tears down every device-local part.
    pub fn shutdown(&self) -> RhiResult {
        match self.resource_base().pool() {
            Some(pool) => pool.multi_device_pool().shutdown_resource(pool.as_ref(), self),
            None => Ok(()),
        }
    }

    pub fn downcast_ref<T: MultiDeviceResource>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }
}
