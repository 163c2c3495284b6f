//! Buffers and buffer views spanning several devices.

use std::any::Any;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use parking_lot::RwLock;
use zenith_core::log;
use crate::buffer::{Buffer, BufferDescriptor};
use crate::device_mask::{DeviceIndex, DeviceMask};
use crate::id::ObjectId;
use crate::multi_device::object::{DeviceObjects, MultiDeviceObject};
use crate::multi_device::pool::MultiDevicePool;
use crate::multi_device::resource::MultiDeviceResource;
use crate::resource::{ResourceBase, ResourceInvalidateListener};
use crate::views::{BufferView, BufferViewDescriptor};
use crate::RhiResult;

/// One logical buffer backed by a [`Buffer`] on every device of its mask.
pub struct MultiDeviceBuffer {
    base: ResourceBase<dyn MultiDevicePool>,
    descriptor: RwLock<BufferDescriptor>,
    buffers: MultiDeviceObject<Buffer>,
}

impl MultiDeviceBuffer {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            base: ResourceBase::new(name),
            descriptor: RwLock::new(BufferDescriptor::default()),
            buffers: MultiDeviceObject::default(),
        })
    }

    #[inline]
    pub fn base(&self) -> &ResourceBase<dyn MultiDevicePool> { &self.base }

    pub fn name(&self) -> String {
        self.base.name()
    }

    pub fn descriptor(&self) -> BufferDescriptor {
        self.descriptor.read().clone()
    }

    pub fn version(&self) -> u32 {
        self.base.version()
    }

    pub fn pool(&self) -> Option<Arc<dyn MultiDevicePool>> {
        self.base.pool()
    }

    pub fn device_buffer(&self, index: DeviceIndex) -> Option<Arc<Buffer>> {
        self.buffers.device_object(index)
    }

    pub fn device_buffers(&self) -> DeviceObjects<Buffer> {
        self.buffers.device_objects()
    }

    /// Whether a device buffer exists for exactly the devices of the mask.
    pub fn covers_mask(&self) -> bool {
        self.buffers.covers_mask()
    }

    pub fn shutdown(&self) -> RhiResult {
        let resource: &dyn MultiDeviceResource = self;
        resource.shutdown()
    }

    #[inline]
    pub(crate) fn device_objects(&self) -> &MultiDeviceObject<Buffer> { &self.buffers }

    pub(crate) fn set_descriptor(&self, descriptor: BufferDescriptor) {
        *self.descriptor.write() = descriptor;
    }
}

impl MultiDeviceResource for MultiDeviceBuffer {
    fn resource_base(&self) -> &ResourceBase<dyn MultiDevicePool> {
        &self.base
    }

    fn device_mask(&self) -> DeviceMask {
        self.buffers.device_mask()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Drop for MultiDeviceBuffer {
    fn drop(&mut self) {
        if self.base.pool_id().is_some() {
            log::warn!("multi-device buffer '{}' dropped while registered, shutting it down", self.name());
            if let Err(error) = self.shutdown() {
                log::error!("failed to shut down multi-device buffer '{}': {}", self.name(), error);
            }
        }
    }
}

/// One [`BufferView`] per device buffer of a [`MultiDeviceBuffer`].
///
/// Follows the buffer when it is re-initialized with new device buffers; views of
/// device buffers that survive are kept and follow orphaning on their own.
pub struct MultiDeviceBufferView {
    id: ObjectId,
    buffer: Arc<MultiDeviceBuffer>,
    descriptor: BufferViewDescriptor,
    views: RwLock<DeviceObjects<BufferView>>,
    invalidation_count: AtomicU32,
}

impl MultiDeviceBufferView {
    pub fn new(buffer: &Arc<MultiDeviceBuffer>, descriptor: BufferViewDescriptor) -> RhiResult<Arc<Self>> {
        let views = Self::build_views(buffer, descriptor, &DeviceObjects::new())?;
        let view = Arc::new(Self {
            id: ObjectId::next(),
            buffer: buffer.clone(),
            descriptor,
            views: RwLock::new(views),
            invalidation_count: AtomicU32::new(0),
        });
        let listener: Weak<dyn ResourceInvalidateListener> = Arc::downgrade(&view) as Weak<MultiDeviceBufferView>;
        buffer.base().add_invalidate_listener(view.id, listener);
        Ok(view)
    }

    fn build_views(
        buffer: &MultiDeviceBuffer,
        descriptor: BufferViewDescriptor,
        previous: &DeviceObjects<BufferView>,
    ) -> RhiResult<DeviceObjects<BufferView>> {
        buffer
            .device_buffers()
            .into_iter()
            .map(|(index, device_buffer)| {
                let reusable = previous
                    .iter()
                    .find(|(i, view)| *i == index && Arc::ptr_eq(view.buffer(), &device_buffer));
                match reusable {
                    Some((_, view)) => Ok((index, view.clone())),
                    None => BufferView::new(&device_buffer, descriptor).map(|view| (index, view)),
                }
            })
            .collect()
    }

    #[inline]
    pub fn buffer(&self) -> &Arc<MultiDeviceBuffer> { &self.buffer }

    #[inline]
    pub fn descriptor(&self) -> BufferViewDescriptor { self.descriptor }

    pub fn device_view(&self, index: DeviceIndex) -> Option<Arc<BufferView>> {
        self.views
            .read()
            .iter()
            .find(|(i, _)| *i == index)
            .map(|(_, view)| view.clone())
    }

    pub fn device_mask(&self) -> DeviceMask {
        self.views.read().iter().map(|(index, _)| *index).collect()
    }

    #[inline]
    pub fn invalidation_count(&self) -> u32 {
        self.invalidation_count.load(Ordering::Acquire)
    }

    fn rebuild(&self) {
        let previous = self.views.read().clone();
        match Self::build_views(&self.buffer, self.descriptor, &previous) {
            Ok(views) => *self.views.write() = views,
            Err(error) => {
                log::debug!("view of '{}' has no backing after invalidation: {}", self.buffer.name(), error);
                self.views.write().clear();
            }
        }
    }
}

impl ResourceInvalidateListener for MultiDeviceBufferView {
    fn on_resource_invalidated(&self) {
        self.invalidation_count.fetch_add(1, Ordering::AcqRel);
        self.rebuild();
    }
}

impl Drop for MultiDeviceBufferView {
    fn drop(&mut self) {
        self.buffer.base().remove_invalidate_listener(self.id);
    }
}
