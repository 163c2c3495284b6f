//! Zenith RHI resource pools.
//!
//! Lifetime, memory backing and per-device fan-out of GPU resources across a set of
//! devices. Devices are simulated on the CPU: memory pages, frame fences, copy queues
//! and upload workers behave like their GPU counterparts without a graphics API.

pub mod buffer;
pub mod buffer_pool;
pub mod command_list;
pub mod context;
pub mod device;
pub mod device_mask;
pub mod events;
pub mod fence;
pub mod memory;
pub mod multi_device;
pub mod queue;
pub mod release;
pub mod resolver;
pub mod resource;
pub mod resource_pool;
pub mod srg;
pub mod srg_pool;
pub mod upload;
pub mod validation;
pub mod views;
mod id;
mod result;
mod utility;

pub(crate) use paste::paste;

pub use buffer::{Buffer, BufferBind, BufferBindFlags, BufferDescriptor};
pub use buffer_pool::{
    BufferInitRequest, BufferMapRequest, BufferMapResponse, BufferPool, BufferPoolDescriptor,
    BufferPoolDescriptorBuilder, BufferStreamRequest,
};
pub use command_list::{CommandList, CommandListAllocator, CommandListState};
pub use context::{RhiConfig, RhiConfigBuilder, RhiContext};
pub use device::{Device, DeviceDescriptor, DeviceDescriptorBuilder, DeviceObject, FramePhase};
pub use device_mask::{DeviceIndex, DeviceMask, MAX_DEVICE_COUNT};
pub use events::{FrameEventHandler, MemoryStatisticsHandler};
pub use fence::{Fence, FenceSet, FenceState, FenceWaitResult};
pub use id::ObjectId;
pub use memory::{HeapMemoryLevel, MemoryReportDetail, MemoryStatistics, MemoryView, PoolMemoryUsageSnapshot};
pub use multi_device::{
    MultiDeviceBuffer, MultiDeviceBufferInitRequest, MultiDeviceBufferMapRequest, MultiDeviceBufferPool,
    MultiDeviceBufferStreamRequest, MultiDeviceBufferView, MultiDeviceFence, MultiDeviceResource,
    MultiDeviceShaderResourceGroup, MultiDeviceShaderResourceGroupData, MultiDeviceShaderResourceGroupPool,
};
pub use queue::{HardwareQueueClass, HardwareQueueClassMask};
pub use release::{DeferRelease, LastFreedStats};
pub use resolver::BufferPoolResolver;
pub use resource::{DeviceResource, FrameAttachment, ResourceInvalidateListener};
pub use resource_pool::{DevicePool, ResourcePool, ResourcePoolDescriptor};
pub use result::{ResultCode, RhiError, RhiResult};
pub use srg::{
    SamplerConfig, ShaderInputType, ShaderResourceGroup, ShaderResourceGroupContent, ShaderResourceGroupData,
    ShaderResourceGroupLayout,
};
pub use srg_pool::{ShaderResourceGroupPool, ShaderResourceGroupPoolDescriptor, ShaderResourceGroupPoolDescriptorBuilder};
pub use upload::{AsyncUploadQueue, UploadHandle};
pub use views::{BufferView, BufferViewDescriptor};
