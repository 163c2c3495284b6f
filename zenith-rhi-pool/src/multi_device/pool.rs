//! Registry and lifecycle shared by every multi-device pool.

use std::sync::{Arc, Weak};
use parking_lot::RwLock;
use zenith_core::log;
use crate::context::RhiContext;
use crate::device::Device;
use crate::device_mask::DeviceMask;
use crate::id::ObjectId;
use crate::multi_device::resource::MultiDeviceResource;
use crate::resource::PoolBinding;
use crate::resource_pool::ResourceRegistry;
use crate::{validation, RhiError, RhiResult};

/// A pool fanning out to one device pool per device of its mask.
pub trait MultiDevicePool: Send + Sync + 'static {
    fn multi_device_pool(&self) -> &MultiDeviceResourcePool;

    /// Tears down the device-local parts of `resource`, which is already unregistered.
    fn shutdown_resource_internal(&self, _resource: &dyn MultiDeviceResource) {}

    /// Shuts down the device pools once every resource is gone.
    fn shutdown_internal(&self) {}

    /// Whether any device pool is between frame compile and frame end.
    fn is_processing_frame(&self) -> bool {
        false
    }
}

/// Core of every multi-device pool: device mask, registry of logical resources and
/// the owner back-reference handed to resources.
pub struct MultiDeviceResourcePool {
    id: ObjectId,
    name: RwLock<String>,
    mask: RwLock<DeviceMask>,
    devices: RwLock<Vec<Arc<Device>>>,
    owner: RwLock<Option<Weak<dyn MultiDevicePool>>>,
    registry: ResourceRegistry<dyn MultiDeviceResource>,
}

impl MultiDeviceResourcePool {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: ObjectId::next(),
            name: RwLock::new(name.into()),
            mask: RwLock::new(DeviceMask::EMPTY),
            devices: RwLock::new(Vec::new()),
            owner: RwLock::new(None),
            registry: ResourceRegistry::default(),
        }
    }

    #[inline]
    pub fn id(&self) -> ObjectId { self.id }

    pub fn name(&self) -> String {
        self.name.read().clone()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        *self.name.write() = name.into();
    }

    pub fn device_mask(&self) -> DeviceMask {
        *self.mask.read()
    }

    pub fn devices(&self) -> Vec<Arc<Device>> {
        self.devices.read().clone()
    }

    pub fn is_initialized(&self) -> bool {
        !self.device_mask().is_empty()
    }

    pub fn resource_count(&self) -> usize {
        self.registry.len()
    }

    pub fn is_registered(&self, resource: &dyn MultiDeviceResource) -> bool {
        self.registry.contains(resource.resource_base().id())
    }

    fn validate_not_processing_frame(&self, owner: &dyn MultiDevicePool) -> bool {
        if validation::is_enabled() && owner.is_processing_frame() {
            log::error!("multi-device pool '{}' mutated while a frame is being processed", self.name());
            return false;
        }
        true
    }

    /// Binds the pool to the devices of `mask`. `platform_init` creates the device
    /// pools and must leave nothing behind when it fails.
    pub fn init<P: MultiDevicePool>(
        &self,
        owner: &Arc<P>,
        context: &RhiContext,
        mask: DeviceMask,
        platform_init: impl FnOnce(&[Arc<Device>]) -> RhiResult,
    ) -> RhiResult {
        if self.is_initialized() {
            log::error!("multi-device pool '{}' is already initialized", self.name());
            return Err(RhiError::InvalidOperation);
        }
        if mask.is_empty() {
            log::error!("multi-device pool '{}' initialized with an empty device mask", self.name());
            return Err(RhiError::InvalidArgument);
        }
        let devices = context.devices_in(mask)?;

        if let Err(error) = platform_init(&devices) {
            log::error!("multi-device pool '{}' failed to initialize on {}: {}", self.name(), mask, error);
            return Err(error);
        }

        let weak: Weak<dyn MultiDevicePool> = Arc::downgrade(owner) as Weak<P>;
        *self.owner.write() = Some(weak);
        *self.devices.write() = devices;
        *self.mask.write() = mask;
        log::debug!("multi-device pool '{}' initialized on devices {}", self.name(), mask);
        Ok(())
    }

    /// Registers `resource`. `platform_init` creates its device-local parts and must
    /// leave nothing behind when it fails.
    pub fn init_resource<R: MultiDeviceResource>(
        &self,
        resource: &Arc<R>,
        platform_init: impl FnOnce() -> RhiResult,
    ) -> RhiResult {
        if !self.is_initialized() {
            log::error!("multi-device pool '{}' is not initialized", self.name());
            return Err(RhiError::InvalidOperation);
        }
        let base = resource.resource_base();
        if base.pool_id().is_some() {
            log::error!("resource '{}' is already registered, cannot add it to '{}'", base.name(), self.name());
            return Err(RhiError::InvalidArgument);
        }
        let Some(owner) = self.owner.read().clone() else {
            return Err(RhiError::InvalidOperation);
        };

        platform_init()?;

        base.set_pool(Some(PoolBinding { id: self.id, pool: owner }))?;
        let registered: Weak<dyn MultiDeviceResource> = Arc::downgrade(resource) as Weak<R>;
        self.registry.insert(base.id(), registered);
        log::trace!("multi-device pool '{}' registered '{}'", self.name(), base.name());
        Ok(())
    }

    /// Unregisters `resource`, then lets `owner` tear down its device-local parts.
    pub fn shutdown_resource(&self, owner: &dyn MultiDevicePool, resource: &dyn MultiDeviceResource) -> RhiResult {
        let base = resource.resource_base();
        if base.pool_id() != Some(self.id) || !self.registry.contains(base.id()) {
            log::error!("resource '{}' is not registered with multi-device pool '{}'", base.name(), self.name());
            return Err(RhiError::InvalidArgument);
        }
        if !self.validate_not_processing_frame(owner) {
            return Err(RhiError::InvalidOperation);
        }
        if base.is_attachment() {
            log::error!("resource '{}' is a live frame attachment and cannot be shut down", base.name());
            return Err(RhiError::InvalidOperation);
        }

        self.registry.remove(base.id());
        base.set_pool(None)?;
        owner.shutdown_resource_internal(resource);
        Ok(())
    }

    /// Shuts down every registered resource, then the device pools. No-op when not
    /// initialized.
    pub fn shutdown(&self, owner: &dyn MultiDevicePool) -> RhiResult {
        if !self.is_initialized() {
            return Ok(());
        }
        if !self.validate_not_processing_frame(owner) {
            return Err(RhiError::InvalidOperation);
        }

        for (id, resource) in self.registry.snapshot() {
            self.registry.remove(id);
            let Some(resource) = resource else {
                continue;
            };
            let base = resource.resource_base();
            if base.is_attachment() {
                log::warn!("multi-device pool '{}' force-detaching frame attachment '{}'", self.name(), base.name());
                base.set_frame_attachment(None);
            }
            base.set_pool(None)?;
            owner.shutdown_resource_internal(resource.as_ref());
        }
        owner.shutdown_internal();

        self.registry.clear();
        self.owner.write().take();
        self.devices.write().clear();
        *self.mask.write() = DeviceMask::EMPTY;
        log::debug!("multi-device pool '{}' shut down", self.name());
        Ok(())
    }
}
