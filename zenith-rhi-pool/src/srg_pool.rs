//! Device-local shader resource group pool and its compile queue.

use std::ops::Range;
use std::sync::{Arc, Weak};
use derive_builder::Builder;
use enumflags2::BitFlags;
use parking_lot::{Mutex, RwLock};
use zenith_core::log;
use crate::device::{Device, DeviceObject};
use crate::events::{FrameEventHandler, MemoryStatisticsHandler};
use crate::memory::{
    HeapAllocator, HeapAllocatorDescriptor, HeapMemoryLevel, MemoryStatisticsBuilder, RetiredHeap,
};
use crate::resource::DeviceResource;
use crate::resource_pool::{DevicePool, ResourcePool, ResourcePoolDescriptor};
use crate::srg::{
    CompiledInput, ShaderInput, ShaderResourceGroup, ShaderResourceGroupContent, ShaderResourceGroupData,
    ShaderResourceGroupLayout,
};
use crate::utility::align_up;
use crate::{RhiError, RhiResult};

pub const CONSTANT_DATA_ALIGNMENT: u64 = 256;
pub const DEFAULT_CONSTANT_PAGE_SIZE: u64 = 64 * 1024;

#[derive(Clone, Debug, Builder)]
#[builder(setter(into))]
pub struct ShaderResourceGroupPoolDescriptor {
    pub layout: Arc<ShaderResourceGroupLayout>,
    /// Budget of constant memory. Zero for unlimited.
    #[builder(default)]
    pub budget_in_bytes: u64,
    #[builder(default = "DEFAULT_CONSTANT_PAGE_SIZE")]
    pub page_size: u64,
}

impl ShaderResourceGroupPoolDescriptor {
    pub fn new(layout: &Arc<ShaderResourceGroupLayout>) -> Self {
        Self {
            layout: layout.clone(),
            budget_in_bytes: 0,
            page_size: DEFAULT_CONSTANT_PAGE_SIZE,
        }
    }
}

struct QueuedCompile {
    group: Weak<ShaderResourceGroup>,
    data: ShaderResourceGroupData,
}

/// Pool of shader resource groups sharing one layout on one device.
///
/// Constant data lives in host memory owned by the pool. Groups queued with
/// [`queue_for_compile`](Self::queue_for_compile) are compiled in batches:
/// `compile_groups_begin` freezes the queue, any number of callers compile disjoint
/// intervals of the batch, and `compile_groups_end` drops it.
pub struct ShaderResourceGroupPool {
    pool: ResourcePool,
    layout: RwLock<Option<Arc<ShaderResourceGroupLayout>>>,
    content: RwLock<BitFlags<ShaderResourceGroupContent>>,
    heap: RwLock<Option<Arc<HeapAllocator>>>,
    compile_queue: Mutex<Vec<QueuedCompile>>,
    compile_batch: RwLock<Option<Vec<QueuedCompile>>>,
}

impl ShaderResourceGroupPool {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            pool: ResourcePool::new(name),
            layout: RwLock::new(None),
            content: RwLock::new(BitFlags::empty()),
            heap: RwLock::new(None),
            compile_queue: Mutex::new(Vec::new()),
            compile_batch: RwLock::new(None),
        })
    }

    #[inline]
    pub fn resource_pool(&self) -> &ResourcePool { &self.pool }

    pub fn name(&self) -> String {
        self.pool.name()
    }

    pub fn layout(&self) -> Option<Arc<ShaderResourceGroupLayout>> {
        self.layout.read().clone()
    }

    /// Compile paths of the pool layout, fixed at init.
    pub fn content(&self) -> BitFlags<ShaderResourceGroupContent> {
        *self.content.read()
    }

    pub fn is_initialized(&self) -> bool {
        self.pool.is_initialized()
    }

    pub fn init(self: &Arc<Self>, device: &Arc<Device>, descriptor: &ShaderResourceGroupPoolDescriptor) -> RhiResult {
        let pool_descriptor = ResourcePoolDescriptor {
            heap_memory_level: HeapMemoryLevel::Host,
            budget_in_bytes: descriptor.budget_in_bytes,
        };
        self.pool.init(self, device, &pool_descriptor, |device| {
            let content = descriptor.layout.content();
            let heap = content.contains(ShaderResourceGroupContent::Constants).then(|| {
                Arc::new(HeapAllocator::new(
                    &format!("{}.constants", self.name()),
                    HeapAllocatorDescriptor {
                        level: HeapMemoryLevel::Host,
                        page_size: descriptor.page_size,
                        alignment: CONSTANT_DATA_ALIGNMENT,
                        tracking: device.descriptor().allocation_tracking,
                    },
                    device.address_space().clone(),
                    self.pool.memory_usage().clone(),
                ))
            });

            *self.layout.write() = Some(descriptor.layout.clone());
            *self.content.write() = content;
            *self.heap.write() = heap;
            Ok(())
        })
    }

    fn constant_size(&self) -> RhiResult<u64> {
        self.layout().map_or(Ok(0), |layout| {
            align_up(layout.constant_byte_count(), CONSTANT_DATA_ALIGNMENT).ok_or(RhiError::OutOfMemory)
        })
    }

    #[profiling::function]
    pub fn init_group(&self, group: &Arc<ShaderResourceGroup>) -> RhiResult {
        self.pool.init_resource(group, |_| {
            let layout = self.layout().ok_or(RhiError::InvalidOperation)?;
            if self.content().contains(ShaderResourceGroupContent::Constants) {
                let heap = self.heap.read().clone().ok_or(RhiError::InvalidOperation)?;
                let size = self.constant_size()?;
                let usage = self.pool.memory_usage().heap(HeapMemoryLevel::Host);
                if !usage.try_reserve(size) {
                    log::warn!(
                        "shader resource group pool '{}' out of budget: {} bytes requested, {} of {} used",
                        self.name(),
                        size,
                        usage.used_resident_in_bytes(),
                        usage.budget_in_bytes()
                    );
                    return Err(RhiError::OutOfMemory);
                }
                let memory = heap
                    .allocate(size, CONSTANT_DATA_ALIGNMENT)
                    .inspect_err(|_| usage.release_used(size))?;
                group.replace_constant_memory(Some(memory));
            }
            group.set_layout(Some(layout));
            group.reset_compile_count();
            Ok(())
        })
    }

    fn validate_group(&self, group: &ShaderResourceGroup) -> RhiResult<Arc<Device>> {
        let Some(device) = self.pool.device() else {
            log::error!("shader resource group pool '{}' is not initialized", self.name());
            return Err(RhiError::InvalidOperation);
        };
        if !self.pool.is_registered(group) {
            log::error!("group '{}' is not registered with pool '{}'", group.name(), self.name());
            return Err(RhiError::InvalidArgument);
        }
        Ok(device)
    }

    fn validate_data(&self, data: &ShaderResourceGroupData) -> RhiResult {
        match self.layout() {
            Some(layout) if Arc::ptr_eq(&layout, data.layout()) => Ok(()),
            _ => {
                log::error!("data of layout '{}' does not match pool '{}'", data.layout().name(), self.name());
                Err(RhiError::InvalidArgument)
            }
        }
    }

    /// Queues `data` to be compiled into `group` by the next batch. Queuing a group
    /// again replaces its data and keeps its place.
    pub fn queue_for_compile(&self, group: &Arc<ShaderResourceGroup>, data: ShaderResourceGroupData) -> RhiResult {
        self.validate_group(group)?;
        self.validate_data(&data)?;
        let mut queue = self.compile_queue.lock();
        let target = Arc::downgrade(group);
        match queue.iter_mut().find(|queued| Weak::ptr_eq(&queued.group, &target)) {
            Some(queued) => queued.data = data,
            None => queue.push(QueuedCompile { group: target, data }),
        }
        Ok(())
    }

    /// Groups waiting for the next batch.
    pub fn queued_group_count(&self) -> usize {
        self.compile_queue.lock().len()
    }

    /// Groups in the batch opened by `compile_groups_begin`, zero outside of a batch.
    pub fn groups_to_compile_count(&self) -> usize {
        self.compile_batch.read().as_ref().map_or(0, Vec::len)
    }

    /// Freezes the queue into a batch. Returns the batch size.
    pub fn compile_groups_begin(&self) -> RhiResult<usize> {
        let mut batch = self.compile_batch.write();
        if batch.is_some() {
            log::error!("pool '{}' already has an open compile batch", self.name());
            return Err(RhiError::InvalidOperation);
        }
        let groups = std::mem::take(&mut *self.compile_queue.lock());
        let count = groups.len();
        *batch = Some(groups);
        Ok(count)
    }

    /// Closes the open batch without compiling it. Its groups go back to the front of
    /// the queue; data queued since the batch opened wins.
    pub(crate) fn cancel_compile_batch(&self) -> RhiResult {
        let Some(mut batch) = self.compile_batch.write().take() else {
            log::error!("pool '{}' has no open compile batch", self.name());
            return Err(RhiError::InvalidOperation);
        };
        let mut queue = self.compile_queue.lock();
        batch.retain(|cancelled| !queue.iter().any(|queued| Weak::ptr_eq(&queued.group, &cancelled.group)));
        batch.append(&mut queue);
        *queue = batch;
        Ok(())
    }

    /// Compiles batch entries `interval`, stopping at the first failure.
    #[profiling::function]
    pub fn compile_groups_for_interval(&self, interval: Range<usize>) -> RhiResult {
        let batch = self.compile_batch.read();
        let Some(batch) = batch.as_ref() else {
            log::error!("pool '{}' has no open compile batch", self.name());
            return Err(RhiError::InvalidOperation);
        };
        if interval.start > interval.end || interval.end > batch.len() {
            log::error!(
                "compile interval {:?} outside the {} groups of pool '{}'",
                interval,
                batch.len(),
                self.name()
            );
            return Err(RhiError::InvalidArgument);
        }

        for queued in &batch[interval] {
            let Some(group) = queued.group.upgrade() else {
                continue;
            };
            if !self.pool.is_registered(group.as_ref()) {
                log::debug!("skipping compile of released group '{}'", group.name());
                continue;
            }
            self.compile_group_internal(&group, &queued.data)?;
        }
        Ok(())
    }

    pub fn compile_groups_end(&self) -> RhiResult {
        if self.compile_batch.write().take().is_none() {
            log::error!("pool '{}' has no open compile batch", self.name());
            return Err(RhiError::InvalidOperation);
        }
        Ok(())
    }

    /// Compiles `data` into `group` immediately.
    pub fn compile_group(&self, group: &ShaderResourceGroup, data: &ShaderResourceGroupData) -> RhiResult {
        self.validate_group(group)?;
        self.validate_data(data)?;
        self.compile_group_internal(group, data)
    }

    fn compile_group_internal(&self, group: &ShaderResourceGroup, data: &ShaderResourceGroupData) -> RhiResult {
        let content = self.content();
        let device_index = self.pool.device().map(|device| device.index());

        let mut compiled = vec![None; data.inputs().len()];
        if content.intersects(
            ShaderResourceGroupContent::Buffers | ShaderResourceGroupContent::Images | ShaderResourceGroupContent::Samplers,
        ) {
            for (slot, input) in data.inputs().iter().enumerate() {
                compiled[slot] = match input {
                    None => None,
                    Some(ShaderInput::Buffer(view)) => {
                        let buffer_device = view.buffer().device().map(|device| device.index());
                        if !view.is_valid() || buffer_device != device_index {
                            log::error!(
                                "group '{}' binds a view of '{}' that is released or lives on another device",
                                group.name(),
                                view.buffer().name()
                            );
                            return Err(RhiError::InvalidArgument);
                        }
                        Some(CompiledInput::Buffer {
                            gpu_address: view.gpu_address(),
                            byte_count: view.byte_count(),
                        })
                    }
                    Some(ShaderInput::Image(image)) => Some(CompiledInput::Image(*image)),
                    Some(ShaderInput::Sampler(sampler)) => Some(CompiledInput::Sampler(*sampler)),
                };
            }
        }

        if content.contains(ShaderResourceGroupContent::Constants) {
            let memory = group.constant_memory().ok_or(RhiError::InvalidOperation)?;
            memory.write(0, data.constant_data())?;
        }
        group.commit(compiled);
        log::trace!("compiled group '{}' ({} compiles)", group.name(), group.compile_count());
        Ok(())
    }

    pub fn shutdown(&self) -> RhiResult {
        self.pool.shutdown(self)
    }
}

impl FrameEventHandler for ShaderResourceGroupPool {
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

impl MemoryStatisticsHandler for ShaderResourceGroupPool {
    fn report_memory_usage(&self, builder: &mut MemoryStatisticsBuilder) {
        self.pool.report_memory_usage(self, builder);
    }
}

impl DevicePool for ShaderResourceGroupPool {
    fn resource_pool(&self) -> &ResourcePool {
        &self.pool
    }

    fn shutdown_resource_internal(&self, resource: &dyn DeviceResource) {
        let Some(group) = resource.downcast_ref::<ShaderResourceGroup>() else {
            log::error!("shader resource group pool '{}' asked to release a non-group resource", self.name());
            return;
        };

        self.compile_queue
            .lock()
            .retain(|queued| !std::ptr::eq(queued.group.as_ptr(), group));
        if let Some(memory) = group.replace_constant_memory(None) {
            self.pool.memory_usage().heap(HeapMemoryLevel::Host).release_used(memory.size());
            match self.pool.device() {
                Some(device) => device.queue_for_release(Box::new(memory)),
                None => memory.free(),
            }
        }
        group.set_layout(None);
    }

    fn shutdown_internal(&self) {
        self.compile_queue.lock().clear();
        self.compile_batch.write().take();
        self.layout.write().take();
        *self.content.write() = BitFlags::empty();
        if let Some(heap) = self.heap.write().take() {
            match self.pool.device() {
                Some(device) => device.queue_for_release(Box::new(RetiredHeap(heap))),
                None => heap.release_pages_unaccounted(),
            }
        }
    }

    fn compute_fragmentation(&self) {
        if let Some(heap) = self.heap.read().as_ref() {
            heap.compute_fragmentation();
        }
    }
}

impl Drop for ShaderResourceGroupPool {
    fn drop(&mut self) {
        if let Err(error) = self.shutdown() {
            log::error!("shader resource group pool '{}' failed to shut down: {}", self.name(), error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{Buffer, BufferDescriptor};
    use crate::buffer_pool::{BufferInitRequest, BufferPool, BufferPoolDescriptorBuilder};
    use crate::device::DeviceDescriptor;
    use crate::srg::SamplerConfig;
    use crate::views::{BufferView, BufferViewDescriptor};

    fn layout() -> Arc<ShaderResourceGroupLayout> {
        Arc::new(
            ShaderResourceGroupLayout::new("Material")
                .with_constants(16)
                .with_buffer("instances", 1)
                .with_sampler("sampler", 1),
        )
    }

    fn setup(budget: u64) -> (Arc<Device>, Arc<ShaderResourceGroupPool>, Arc<ShaderResourceGroupLayout>) {
        let device = Device::new(0, &DeviceDescriptor::default()).unwrap();
        let layout = layout();
        let pool = ShaderResourceGroupPool::new("Materials");
        let descriptor = ShaderResourceGroupPoolDescriptorBuilder::default()
            .layout(layout.clone())
            .budget_in_bytes(budget)
            .build()
            .unwrap();
        pool.init(&device, &descriptor).unwrap();
        (device, pool, layout)
    }

    fn group(pool: &ShaderResourceGroupPool, name: &str) -> Arc<ShaderResourceGroup> {
        let group = ShaderResourceGroup::new(name);
        pool.init_group(&group).unwrap();
        group
    }

    #[test]
    fn content_is_fixed_at_init() {
        let (_device, pool, _layout) = setup(0);
        assert_eq!(
            pool.content(),
            ShaderResourceGroupContent::Constants | ShaderResourceGroupContent::Buffers | ShaderResourceGroupContent::Samplers
        );
        let group = group(&pool, "g");
        assert_eq!(group.constant_memory().unwrap().size(), CONSTANT_DATA_ALIGNMENT);
    }

    #[test]
    fn constant_budget_is_enforced() {
        let (_device, pool, _layout) = setup(512);
        let _a = group(&pool, "a");
        let _b = group(&pool, "b");
        let c = ShaderResourceGroup::new("c");
        assert_eq!(pool.init_group(&c), Err(RhiError::OutOfMemory));
        assert_eq!(pool.resource_pool().resource_count(), 2);
    }

    #[test]
    fn compile_group_writes_constants_and_resolves_views() {
        let (device, pool, layout) = setup(0);
        let buffers = BufferPool::new("Instances");
        buffers
            .init(
                &device,
                &BufferPoolDescriptorBuilder::default()
                    .heap_memory_level(HeapMemoryLevel::Host)
                    .build()
                    .unwrap(),
            )
            .unwrap();
        let buffer = Buffer::new("instances");
        buffers.init_buffer(&BufferInitRequest::new(&buffer, BufferDescriptor::new(64))).unwrap();
        let view = BufferView::new(&buffer, BufferViewDescriptor::range(16, 32)).unwrap();

        let group = group(&pool, "material");
        let mut data = ShaderResourceGroupData::new(&layout);
        data.set_constants(0, &[7; 16]).unwrap();
        data.bind_buffer("instances", 0, &view).unwrap();
        data.bind_sampler("sampler", 0, SamplerConfig::nearest()).unwrap();
        pool.compile_group(&group, &data).unwrap();

        assert_eq!(group.constant_data().unwrap(), vec![7; 16]);
        assert_eq!(
            group.compiled_input("instances", 0),
            Some(CompiledInput::Buffer {
                gpu_address: buffer.gpu_address().unwrap() + 16,
                byte_count: 32,
            })
        );
        assert_eq!(group.compiled_input("sampler", 0), Some(CompiledInput::Sampler(SamplerConfig::nearest())));
        assert_eq!(group.compile_count(), 1);

        buffer.shutdown().unwrap();
        assert_eq!(pool.compile_group(&group, &data), Err(RhiError::InvalidArgument));
        assert_eq!(group.compile_count(), 1);
    }

    #[test]
    fn compile_rejects_foreign_layout() {
        let (_device, pool, _layout) = setup(0);
        let group = group(&pool, "g");
        let other = ShaderResourceGroupData::new(&layout());
        assert_eq!(pool.compile_group(&group, &other), Err(RhiError::InvalidArgument));
    }

    #[test]
    fn batch_compiles_requested_interval_only() {
        let (_device, pool, layout) = setup(0);
        let groups: Vec<_> = (0..4).map(|i| group(&pool, &format!("g{i}"))).collect();
        for group in &groups {
            pool.queue_for_compile(group, ShaderResourceGroupData::new(&layout)).unwrap();
        }
        pool.queue_for_compile(&groups[0], ShaderResourceGroupData::new(&layout)).unwrap();
        assert_eq!(pool.queued_group_count(), 4);
        assert_eq!(pool.groups_to_compile_count(), 0);

        assert_eq!(pool.compile_groups_begin(), Ok(4));
        assert_eq!(pool.compile_groups_begin(), Err(RhiError::InvalidOperation));
        assert_eq!(pool.groups_to_compile_count(), 4);
        assert_eq!(pool.queued_group_count(), 0);

        pool.compile_groups_for_interval(1..3).unwrap();
        assert_eq!(pool.compile_groups_for_interval(3..5), Err(RhiError::InvalidArgument));
        let counts: Vec<_> = groups.iter().map(|g| g.compile_count()).collect();
        assert_eq!(counts, vec![0, 1, 1, 0]);

        pool.compile_groups_end().unwrap();
        assert_eq!(pool.groups_to_compile_count(), 0);
        assert_eq!(pool.compile_groups_end(), Err(RhiError::InvalidOperation));
    }

    #[test]
    fn group_shutdown_leaves_the_queue_and_frees_constants() {
        let (device, pool, layout) = setup(0);
        let group = group(&pool, "g");
        pool.queue_for_compile(&group, ShaderResourceGroupData::new(&layout)).unwrap();

        group.shutdown().unwrap();
        assert_eq!(pool.queued_group_count(), 0);
        assert!(group.constant_memory().is_none());
        assert_eq!(pool.resource_pool().heap_memory_usage(HeapMemoryLevel::Host).used_resident_in_bytes, 0);
        assert_eq!(device.pending_release_count(), 1);
    }
}
