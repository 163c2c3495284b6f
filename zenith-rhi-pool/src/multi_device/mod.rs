//! Fan-out layer: logical objects made of one device-local object per device of a mask.

mod buffer;
mod buffer_pool;
mod fence;
mod object;
mod pool;
mod resource;
mod srg;

pub use buffer::{MultiDeviceBuffer, MultiDeviceBufferView};
pub use buffer_pool::{
    MultiDeviceBufferInitRequest, MultiDeviceBufferMapRequest, MultiDeviceBufferMapResponse, MultiDeviceBufferPool,
    MultiDeviceBufferStreamRequest, MultiDeviceUploadHandles,
};
pub use fence::MultiDeviceFence;
pub use object::{iterate_devices, DeviceObjects, MultiDeviceObject};
pub use pool::{MultiDevicePool, MultiDeviceResourcePool};
pub use resource::MultiDeviceResource;
pub use srg::{
    redistribute_interval, MultiDeviceShaderInput, MultiDeviceShaderResourceGroup, MultiDeviceShaderResourceGroupData,
    MultiDeviceShaderResourceGroupPool,
};
