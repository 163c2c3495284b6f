//! Single-device pool core: registry, init protocol, frame gating and memory counters.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use derive_builder::Builder;
use parking_lot::RwLock;
use zenith_core::collections::hashmap::HashMap;
use zenith_core::log;
use zenith_rhi_derive::DeviceObject;
use crate::device::{Device, DeviceObject};
use crate::events::{FrameEventHandler, MemoryStatisticsHandler};
use crate::id::ObjectId;
use crate::memory::{
    HeapMemoryLevel, HeapMemoryUsageSnapshot, MemoryReportDetail, MemoryStatisticsBuilder, PoolMemoryUsage,
    PoolMemoryUsageSnapshot,
};
use crate::resource::{DeviceResource, PoolBinding};
use crate::{validation, RhiError, RhiResult};

/// A device-local pool. Implementors embed a [`ResourcePool`] and supply the
/// allocation strategy through the teardown hooks.
pub trait DevicePool: FrameEventHandler + MemoryStatisticsHandler + Send + Sync + 'static {
    fn resource_pool(&self) -> &ResourcePool;

    /// Releases the device-local backing of `resource`. It is already unregistered.
    fn shutdown_resource_internal(&self, _resource: &dyn DeviceResource) {}

    /// Releases the pool's own heaps after every resource is gone.
    fn shutdown_internal(&self) {}

    /// Refreshes the fragmentation figure of the pool's heaps.
    fn compute_fragmentation(&self) {}
}

#[derive(Clone, Debug, Builder)]
#[builder(setter(into))]
pub struct ResourcePoolDescriptor {
    #[builder(default)]
    pub heap_memory_level: HeapMemoryLevel,
    /// Zero for unlimited.
    #[builder(default)]
    pub budget_in_bytes: u64,
}

impl Default for ResourcePoolDescriptor {
    fn default() -> Self {
        Self {
            heap_memory_level: HeapMemoryLevel::Device,
            budget_in_bytes: 0,
        }
    }
}

/// Weak set of registered resources keyed by id, iterated in registration order.
pub(crate) struct ResourceRegistry<R: ?Sized> {
    entries: RwLock<HashMap<ObjectId, Weak<R>>>,
}

impl<R: ?Sized> Default for ResourceRegistry<R> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(HashMap::default()),
        }
    }
}

impl<R: ?Sized> ResourceRegistry<R> {
    pub fn insert(&self, id: ObjectId, resource: Weak<R>) -> bool {
        self.entries.write().insert(id, resource).is_none()
    }

    pub fn remove(&self, id: ObjectId) -> bool {
        self.entries.write().remove(&id).is_some()
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        self.entries.read().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Entries sorted by id, which is creation order. Dropped resources map to `None`.
    pub fn snapshot(&self) -> Vec<(ObjectId, Option<Arc<R>>)> {
        let mut entries: Vec<_> = self
            .entries
            .read()
            .iter()
            .map(|(id, resource)| (*id, resource.upgrade()))
            .collect();
        entries.sort_unstable_by_key(|(id, _)| *id);
        entries
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }
}

/// Core of every device pool.
///
/// Owns the registry of non-owning resource references, the init state and the
/// [`PoolMemoryUsage`] counters. Resources are owned by whoever created them.
#[DeviceObject]
pub struct ResourcePool {
    id: ObjectId,
    name: RwLock<String>,
    owner: RwLock<Option<Weak<dyn DevicePool>>>,
    descriptor: RwLock<ResourcePoolDescriptor>,
    registry: ResourceRegistry<dyn DeviceResource>,
    memory_usage: Arc<PoolMemoryUsage>,
    processing_frame: AtomicBool,
}

impl ResourcePool {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: ObjectId::next(),
            name: RwLock::new(name.into()),
            owner: RwLock::new(None),
            descriptor: RwLock::new(ResourcePoolDescriptor::default()),
            registry: ResourceRegistry::default(),
            memory_usage: Arc::new(PoolMemoryUsage::default()),
            processing_frame: AtomicBool::new(false),
            device: Default::default(),
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

    pub fn descriptor(&self) -> ResourcePoolDescriptor {
        self.descriptor.read().clone()
    }

    #[inline]
    pub fn heap_memory_level(&self) -> HeapMemoryLevel {
        self.descriptor.read().heap_memory_level
    }

    #[inline]
    pub fn memory_usage(&self) -> &Arc<PoolMemoryUsage> { &self.memory_usage }

    pub fn memory_usage_snapshot(&self) -> PoolMemoryUsageSnapshot {
        self.memory_usage.snapshot()
    }

    pub fn heap_memory_usage(&self, level: HeapMemoryLevel) -> HeapMemoryUsageSnapshot {
        self.memory_usage.heap(level).snapshot()
    }

    pub fn resource_count(&self) -> usize {
        self.registry.len()
    }

    pub fn is_registered(&self, resource: &dyn DeviceResource) -> bool {
        self.registry.contains(resource.resource_base().id())
    }

    /// Visits every live registered resource under a snapshot of the registry.
    pub fn for_each_resource(&self, mut f: impl FnMut(&Arc<dyn DeviceResource>)) {
        for (_, resource) in self.registry.snapshot() {
            if let Some(resource) = resource {
                f(&resource);
            }
        }
    }

    /// Whether the device is between `compile_frame` and `end_frame`, as seen by this pool.
    #[inline]
    pub fn is_processing_frame(&self) -> bool {
        self.processing_frame.load(Ordering::Acquire)
    }

    fn validate_not_processing_frame(&self) -> bool {
        if validation::is_enabled() && self.is_processing_frame() {
            log::error!("pool '{}' mutated while the frame is being processed", self.name());
            return false;
        }
        true
    }

    /// Binds the pool to `device`. `platform_init` runs first; the pool is only
    /// initialized and subscribed to the device channels if it succeeds.
    pub fn init<P: DevicePool>(
        &self,
        owner: &Arc<P>,
        device: &Arc<Device>,
        descriptor: &ResourcePoolDescriptor,
        platform_init: impl FnOnce(&Arc<Device>) -> RhiResult,
    ) -> RhiResult {
        if self.is_initialized() {
            log::error!("pool '{}' is already initialized", self.name());
            return Err(RhiError::InvalidOperation);
        }
        let capacity = device.address_space().capacity(descriptor.heap_memory_level);
        if capacity != 0 && descriptor.budget_in_bytes > capacity {
            log::error!(
                "pool '{}' budget of {} bytes exceeds the {} bytes of {:?} memory on device {}",
                self.name(),
                descriptor.budget_in_bytes,
                capacity,
                descriptor.heap_memory_level,
                device.index()
            );
            return Err(RhiError::InvalidArgument);
        }

        self.memory_usage
            .heap(descriptor.heap_memory_level)
            .set_budget_in_bytes(descriptor.budget_in_bytes);
        if let Err(error) = platform_init(device) {
            log::error!("pool '{}' platform init failed on device {}: {}", self.name(), device.index(), error);
            self.memory_usage.reset();
            return Err(error);
        }

        *self.descriptor.write() = descriptor.clone();
        self.device.bind(device);

        let weak = Arc::downgrade(owner);
        let as_pool: Weak<dyn DevicePool> = weak.clone();
        let as_frame_handler: Weak<dyn FrameEventHandler> = weak.clone();
        let as_statistics_handler: Weak<dyn MemoryStatisticsHandler> = weak;
        *self.owner.write() = Some(as_pool.clone());
        device.register_pool(self.id, as_pool);
        device.subscribe_frame_events(self.id, as_frame_handler);
        device.subscribe_memory_statistics(self.id, as_statistics_handler);

        log::debug!(
            "pool '{}' initialized on device {} ({:?}, budget {} bytes)",
            self.name(),
            device.index(),
            descriptor.heap_memory_level,
            descriptor.budget_in_bytes
        );
        Ok(())
    }

    /// Registers `resource`. `platform_init` creates its device-local backing; the
    /// resource is bound and registered only if it succeeds.
    pub fn init_resource<R: DeviceResource>(
        &self,
        resource: &Arc<R>,
        platform_init: impl FnOnce(&Arc<Device>) -> RhiResult,
    ) -> RhiResult {
        let Some(device) = self.device() else {
            log::error!("pool '{}' is not initialized", self.name());
            return Err(RhiError::InvalidOperation);
        };
        let base = resource.resource_base();
        if base.pool_id().is_some() || resource.is_initialized() {
            log::error!("resource '{}' is already initialized, cannot add it to pool '{}'", base.name(), self.name());
            return Err(RhiError::InvalidArgument);
        }
        let Some(owner) = self.owner.read().clone() else {
            return Err(RhiError::InvalidOperation);
        };

        platform_init(&device)?;

        resource.device_slot().bind(&device);
        base.set_pool(Some(PoolBinding { id: self.id, pool: owner }))?;
        let registered: Weak<dyn DeviceResource> = Arc::downgrade(resource) as Weak<R>;
        self.registry.insert(base.id(), registered);
        log::trace!("pool '{}' registered '{}'", self.name(), base.name());
        Ok(())
    }

    /// Unregisters `resource`, then lets `owner` release its backing.
    pub fn shutdown_resource(&self, owner: &dyn DevicePool, resource: &dyn DeviceResource) -> RhiResult {
        let base = resource.resource_base();
        if !self.is_initialized() || base.pool_id() != Some(self.id) || !self.registry.contains(base.id()) {
            log::error!("resource '{}' is not registered with pool '{}'", base.name(), self.name());
            return Err(RhiError::InvalidArgument);
        }
        if !self.validate_not_processing_frame() {
            return Err(RhiError::InvalidOperation);
        }
        if base.is_attachment() {
            log::error!("resource '{}' is a live frame attachment and cannot be shut down", base.name());
            return Err(RhiError::InvalidOperation);
        }

        self.registry.remove(base.id());
        base.set_pool(None)?;
        owner.shutdown_resource_internal(resource);
        resource.device_slot().unbind();
        log::trace!("pool '{}' released '{}'", self.name(), base.name());
        Ok(())
    }

    /// Shuts down every registered resource and detaches from the device. No-op when
    /// not initialized.
    pub fn shutdown(&self, owner: &dyn DevicePool) -> RhiResult {
        let Some(device) = self.device() else {
            return Ok(());
        };
        if !self.validate_not_processing_frame() {
            return Err(RhiError::InvalidOperation);
        }

        device.unregister_pool(self.id);
        device.unsubscribe_frame_events(self.id);
        device.unsubscribe_memory_statistics(self.id);

        let resources = self.registry.snapshot();
        let count = resources.len();
        for (id, resource) in resources {
            self.registry.remove(id);
            let Some(resource) = resource else {
                continue;
            };
            let base = resource.resource_base();
            if base.is_attachment() {
                log::warn!("pool '{}' force-detaching frame attachment '{}'", self.name(), base.name());
                base.set_frame_attachment(None);
            }
            base.set_pool(None)?;
            owner.shutdown_resource_internal(resource.as_ref());
            resource.device_slot().unbind();
        }
        owner.shutdown_internal();

        self.registry.clear();
        self.memory_usage.reset();
        self.processing_frame.store(false, Ordering::Release);
        self.owner.write().take();
        self.device.unbind();
        log::debug!("pool '{}' shut down, {} resource(s) released", self.name(), count);
        Ok(())
    }

    pub fn on_frame_begin(&self) {
        self.memory_usage.reset_transfer_counters();
    }

    pub fn on_frame_compile(&self) {
        if validation::is_enabled() {
            self.processing_frame.store(true, Ordering::Release);
        }
    }

    pub fn on_frame_end(&self) {
        self.processing_frame.store(false, Ordering::Release);
    }

    pub fn report_memory_usage(&self, owner: &dyn DevicePool, builder: &mut MemoryStatisticsBuilder) {
        builder.begin_pool(&self.name());
        if builder.report_detail() == MemoryReportDetail::Detail {
            self.for_each_resource(|resource| resource.report_memory_usage(builder));
            owner.compute_fragmentation();
        }
        if let Some(pool) = builder.current_pool() {
            pool.memory_usage = self.memory_usage.snapshot();
        }
        builder.end_pool();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::any::Any;
    use parking_lot::Mutex;
    use crate::device::DeviceDescriptorBuilder;
    use crate::resource::ResourceBase;

    #[DeviceObject]
    struct TestResource {
        base: ResourceBase<dyn DevicePool>,
    }

    impl TestResource {
        fn new(name: &str) -> Arc<Self> {
            Arc::new(Self {
                base: ResourceBase::new(name),
                device: Default::default(),
            })
        }
    }

    impl DeviceResource for TestResource {
        fn resource_base(&self) -> &ResourceBase<dyn DevicePool> {
            &self.base
        }

        fn report_memory_usage(&self, builder: &mut MemoryStatisticsBuilder) {
            builder.add_resource(&self.base.name(), "Test", 64);
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    /// Records every teardown together with whether the resource was still registered.
    struct TestPool {
        pool: ResourcePool,
        teardowns: Mutex<Vec<(String, bool)>>,
        heap_released: Mutex<u32>,
    }

    impl TestPool {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                pool: ResourcePool::new("TestPool"),
                teardowns: Mutex::new(Vec::new()),
                heap_released: Mutex::new(0),
            })
        }
    }

    impl FrameEventHandler for TestPool {
        fn on_frame_begin(&self) {
            self.pool.on_frame_begin();
        }

        fn on_frame_compile(&self) {
            self.pool.on_frame_compile();
        }

        fn on_frame_end(&self) {
            self.pool.on_frame_end();
        }
    }

    impl MemoryStatisticsHandler for TestPool {
        fn report_memory_usage(&self, builder: &mut MemoryStatisticsBuilder) {
            self.pool.report_memory_usage(self, builder);
        }
    }

    impl DevicePool for TestPool {
        fn resource_pool(&self) -> &ResourcePool {
            &self.pool
        }

        fn shutdown_resource_internal(&self, resource: &dyn DeviceResource) {
            let base = resource.resource_base();
            let still_registered = self.pool.is_registered(resource) || base.pool_id().is_some();
            self.teardowns.lock().push((base.name(), still_registered));
        }

        fn shutdown_internal(&self) {
            *self.heap_released.lock() += 1;
        }
    }

    fn device() -> Arc<Device> {
        Device::new(0, &DeviceDescriptorBuilder::default().async_upload(false).build().unwrap()).unwrap()
    }

    fn initialized_pool(device: &Arc<Device>) -> Arc<TestPool> {
        let pool = TestPool::new();
        pool.pool.init(&pool, device, &ResourcePoolDescriptor::default(), |_| Ok(())).unwrap();
        pool
    }

    #[test]
    fn init_is_not_reentrant_and_failed_platform_init_leaves_pool_clean() {
        let device = device();
        let pool = TestPool::new();
        assert_eq!(
            pool.pool.init(&pool, &device, &ResourcePoolDescriptor::default(), |_| Err(RhiError::Fail)),
            Err(RhiError::Fail)
        );
        assert!(!pool.pool.is_initialized());
        assert_eq!(device.pool_count(), 0);

        pool.pool.init(&pool, &device, &ResourcePoolDescriptor::default(), |_| Ok(())).unwrap();
        assert!(device.is_pool_registered(pool.pool.id()));
        assert_eq!(
            pool.pool.init(&pool, &device, &ResourcePoolDescriptor::default(), |_| Ok(())),
            Err(RhiError::InvalidOperation)
        );
    }

    #[test]
    fn init_resource_validates_pool_and_resource_state() {
        let device = device();
        let uninitialized = TestPool::new();
        let resource = TestResource::new("a");
        assert_eq!(uninitialized.pool.init_resource(&resource, |_| Ok(())), Err(RhiError::InvalidOperation));

        let pool = initialized_pool(&device);
        assert_eq!(pool.pool.init_resource(&resource, |_| Err(RhiError::OutOfMemory)), Err(RhiError::OutOfMemory));
        assert!(resource.base.pool_id().is_none());
        assert_eq!(pool.pool.resource_count(), 0);

        pool.pool.init_resource(&resource, |_| Ok(())).unwrap();
        assert!(pool.pool.is_registered(&*resource));
        assert_eq!(pool.pool.resource_count(), 1);
        assert_eq!(pool.pool.init_resource(&resource, |_| Ok(())), Err(RhiError::InvalidArgument));

        let other = initialized_pool(&device);
        assert_eq!(other.pool.init_resource(&resource, |_| Ok(())), Err(RhiError::InvalidArgument));
    }

    #[test]
    fn shutdown_resource_rejects_foreign_pools() {
        let device = device();
        let pool = initialized_pool(&device);
        let other = initialized_pool(&device);
        let resource = TestResource::new("a");
        pool.pool.init_resource(&resource, |_| Ok(())).unwrap();

        assert_eq!(other.pool.shutdown_resource(other.as_ref(), resource.as_ref()), Err(RhiError::InvalidArgument));
        assert!(pool.pool.is_registered(resource.as_ref()));

        let resource_dyn: &dyn DeviceResource = resource.as_ref();
        resource_dyn.shutdown().unwrap();
        assert!(!pool.pool.is_registered(resource.as_ref()));
        assert!(!resource.is_initialized());
        assert_eq!(*pool.teardowns.lock(), [(String::from("a"), false)]);
    }

    #[test]
    fn pool_shutdown_tears_down_each_resource_once_and_is_idempotent() {
        let device = device();
        let pool = initialized_pool(&device);
        let resources: Vec<_> = ["a", "b", "c"].into_iter().map(TestResource::new).collect();
        for resource in &resources {
            pool.pool.init_resource(resource, |_| Ok(())).unwrap();
        }

        pool.pool.shutdown(pool.as_ref()).unwrap();
        let teardowns = pool.teardowns.lock().clone();
        assert_eq!(teardowns.len(), 3);
        assert!(teardowns.iter().all(|(_, still_registered)| !still_registered));
        assert_eq!(pool.pool.resource_count(), 0);
        assert_eq!(*pool.heap_released.lock(), 1);
        assert_eq!(device.pool_count(), 0);
        assert!(resources.iter().all(|r| r.base.pool().is_none() && !r.is_initialized()));

        pool.pool.shutdown(pool.as_ref()).unwrap();
        assert_eq!(pool.teardowns.lock().len(), 3);
        assert_eq!(*pool.heap_released.lock(), 1);
    }

    #[cfg(feature = "validation")]
    #[test]
    fn destructive_calls_are_gated_while_processing_frame() {
        let device = device();
        let pool = initialized_pool(&device);
        let resource = TestResource::new("a");
        pool.pool.init_resource(&resource, |_| Ok(())).unwrap();

        device.begin_frame().unwrap();
        device.compile_frame().unwrap();
        assert!(pool.pool.is_processing_frame());
        assert_eq!(pool.pool.shutdown_resource(pool.as_ref(), resource.as_ref()), Err(RhiError::InvalidOperation));
        assert_eq!(pool.pool.shutdown(pool.as_ref()), Err(RhiError::InvalidOperation));
        assert_eq!(pool.pool.resource_count(), 1);

        device.end_frame().unwrap();
        pool.pool.shutdown_resource(pool.as_ref(), resource.as_ref()).unwrap();
    }

    #[test]
    fn frame_begin_resets_transfer_counters() {
        let device = device();
        let pool = initialized_pool(&device);
        pool.pool.memory_usage().add_transfer_pull(128);
        pool.pool.memory_usage().add_transfer_push(64);
        device.begin_frame().unwrap();
        let usage = pool.pool.memory_usage_snapshot();
        assert_eq!((usage.transfer_pull_bytes, usage.transfer_push_bytes), (0, 0));
    }

    #[test]
    fn detailed_report_lists_resources() {
        let device = device();
        let pool = initialized_pool(&device);
        let resource = TestResource::new("tracked");
        pool.pool.init_resource(&resource, |_| Ok(())).unwrap();

        let summary = device.report_memory_usage(MemoryReportDetail::Summary);
        assert!(summary.pool("TestPool").unwrap().resources.is_empty());
        let detail = device.report_memory_usage(MemoryReportDetail::Detail);
        assert_eq!(detail.pool("TestPool").unwrap().resources[0].name, "tracked");
    }
}
