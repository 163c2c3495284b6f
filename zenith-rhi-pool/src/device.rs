//! Simulated physical device: frame timeline, deferred release and notification channels.

use std::sync::{Arc, Weak};
use std::time::Duration;
use derive_builder::Builder;
use parking_lot::{Mutex, RwLock};
use zenith_core::log;
use crate::command_list::{CommandList, CommandListAllocator};
use crate::device_mask::DeviceIndex;
use crate::events::{FrameEventHandler, MemoryStatisticsHandler, Subscribers};
use crate::fence::{Fence, FenceState};
use crate::id::ObjectId;
use crate::memory::{
    AllocationTrackingMode, DeviceAddressSpace, MemoryReportDetail, MemoryStatistics, MemoryStatisticsBuilder,
};
use crate::release::{DeferRelease, LastFreedStats, ReleaseQueue};
use crate::resource_pool::DevicePool;
use crate::upload::AsyncUploadQueue;
use crate::{RhiError, RhiResult};

pub(crate) mod sealed {
    pub trait Sealed {}
}

/// The device an object is bound to, if any.
#[derive(Default)]
pub struct DeviceSlot(RwLock<Option<Arc<Device>>>);

impl DeviceSlot {
    /// Returns `false` if the slot is already bound.
    pub(crate) fn bind(&self, device: &Arc<Device>) -> bool {
        let mut slot = self.0.write();
        if slot.is_some() {
            return false;
        }
        *slot = Some(device.clone());
        true
    }

    pub(crate) fn unbind(&self) -> Option<Arc<Device>> {
        self.0.write().take()
    }

    #[inline]
    pub fn get(&self) -> Option<Arc<Device>> {
        self.0.read().clone()
    }

    #[inline]
    pub fn is_bound(&self) -> bool {
        self.0.read().is_some()
    }
}

/// Object that lives on at most one device at a time. Implemented through `#[DeviceObject]`.
pub trait DeviceObject: sealed::Sealed {
    fn device_slot(&self) -> &DeviceSlot;

    #[inline]
    fn device(&self) -> Option<Arc<Device>> {
        self.device_slot().get()
    }

    /// Whether `init` succeeded and `shutdown` has not run since.
    #[inline]
    fn is_initialized(&self) -> bool {
        self.device_slot().is_bound()
    }
}

#[derive(Clone, Debug, Builder)]
#[builder(setter(into))]
pub struct DeviceDescriptor {
    #[builder(default = "String::from(\"Device\")")]
    pub name: String,
    /// Physical host-visible memory in bytes, zero for unlimited.
    #[builder(default)]
    pub host_memory_capacity: u64,
    /// Physical device-local memory in bytes, zero for unlimited.
    #[builder(default)]
    pub device_memory_capacity: u64,
    /// Enables allocation records on every heap created for this device.
    #[builder(default)]
    pub allocation_tracking: Option<AllocationTrackingMode>,
    #[builder(default = "true")]
    pub async_upload: bool,
    /// Artificial delay applied by the upload worker to every request.
    #[builder(default = "Duration::ZERO")]
    pub upload_latency: Duration,
}

impl Default for DeviceDescriptor {
    fn default() -> Self {
        Self {
            name: String::from("Device"),
            host_memory_capacity: 0,
            device_memory_capacity: 0,
            allocation_tracking: None,
            async_upload: true,
            upload_latency: Duration::ZERO,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum FramePhase {
    #[default]
    Idle,
    /// Between `begin_frame` and `compile_frame`.
    Begun,
    /// Between `compile_frame` and `end_frame`.
    Compiling,
}

#[derive(Default)]
struct FrameState {
    phase: FramePhase,
    frame_count: u64,
}

pub struct Device {
    index: DeviceIndex,
    descriptor: DeviceDescriptor,
    address_space: Arc<DeviceAddressSpace>,
    frame_fence: Fence,
    frame: Mutex<FrameState>,
    release_queue: Mutex<ReleaseQueue>,
    command_lists: CommandListAllocator,
    upload_queue: AsyncUploadQueue,
    pools: Subscribers<dyn DevicePool>,
    frame_handlers: Subscribers<dyn FrameEventHandler>,
    statistics_handlers: Subscribers<dyn MemoryStatisticsHandler>,
}

impl Device {
    pub fn new(index: DeviceIndex, descriptor: &DeviceDescriptor) -> RhiResult<Arc<Self>> {
        let frame_fence = Fence::new().with_name(format!("{} frame fence", descriptor.name));
        frame_fence.init_detached(FenceState::Signaled);

        let device = Arc::new(Self {
            index,
            descriptor: descriptor.clone(),
            address_space: Arc::new(DeviceAddressSpace::new(
                index,
                descriptor.host_memory_capacity,
                descriptor.device_memory_capacity,
            )),
            frame_fence,
            frame: Mutex::new(FrameState::default()),
            release_queue: Mutex::new(ReleaseQueue::new()),
            command_lists: CommandListAllocator::new(),
            upload_queue: AsyncUploadQueue::new(index, descriptor.async_upload, descriptor.upload_latency)?,
            pools: Subscribers::default(),
            frame_handlers: Subscribers::default(),
            statistics_handlers: Subscribers::default(),
        });
        log::debug!("created device {} '{}'", index, descriptor.name);
        Ok(device)
    }

    #[inline]
    pub fn index(&self) -> DeviceIndex { self.index }

    #[inline]
    pub fn name(&self) -> &str { &self.descriptor.name }

    #[inline]
    pub fn descriptor(&self) -> &DeviceDescriptor { &self.descriptor }

    #[inline]
    pub fn address_space(&self) -> &Arc<DeviceAddressSpace> { &self.address_space }

    /// Signaled by the GPU at the end of every frame with the frame's fence value.
    #[inline]
    pub fn frame_fence(&self) -> &Fence { &self.frame_fence }

    #[inline]
    pub fn command_list_allocator(&self) -> &CommandListAllocator { &self.command_lists }

    #[inline]
    pub fn upload_queue(&self) -> &AsyncUploadQueue { &self.upload_queue }

    pub fn frame_phase(&self) -> FramePhase {
        self.frame.lock().phase
    }

    /// Frames begun so far.
    pub fn frame_count(&self) -> u64 {
        self.frame.lock().frame_count
    }

    pub fn is_processing_frame(&self) -> bool {
        self.frame_phase() == FramePhase::Compiling
    }

    fn transition(&self, from: FramePhase, to: FramePhase) -> RhiResult<u64> {
        let mut frame = self.frame.lock();
        if frame.phase != from {
            log::error!("device {} frame is {:?}, expected {:?}", self.index, frame.phase, from);
            return Err(RhiError::InvalidOperation);
        }
        frame.phase = to;
        if to == FramePhase::Begun {
            frame.frame_count += 1;
        }
        Ok(frame.frame_count)
    }

    /// Sweeps work the GPU has finished and notifies `on_frame_begin`.
    #[profiling::function]
    pub fn begin_frame(&self) -> RhiResult<u64> {
        let frame = self.transition(FramePhase::Idle, FramePhase::Begun)?;
        self.collect_completed();
        for handler in self.frame_handlers.snapshot() {
            handler.on_frame_begin();
        }
        Ok(frame)
    }

    #[profiling::function]
    pub fn compile_frame(&self) -> RhiResult {
        self.transition(FramePhase::Begun, FramePhase::Compiling)?;
        for handler in self.frame_handlers.snapshot() {
            handler.on_frame_compile();
        }
        Ok(())
    }

    /// Notifies `on_frame_end` and submits the frame. Returns the fence value the
    /// GPU signals once the frame completes.
    #[profiling::function]
    pub fn end_frame(&self) -> RhiResult<u64> {
        {
            let frame = self.frame.lock();
            if frame.phase != FramePhase::Compiling {
                log::error!("device {} frame is {:?}, expected {:?}", self.index, frame.phase, FramePhase::Compiling);
                return Err(RhiError::InvalidOperation);
            }
        }
        for handler in self.frame_handlers.snapshot() {
            handler.on_frame_end();
        }
        let fence_value = self.frame_fence.increment()?;
        self.transition(FramePhase::Compiling, FramePhase::Idle)?;
        log::trace!("device {} submitted frame fence {}", self.index, fence_value);
        Ok(fence_value)
    }

    /// Fence value that covers work recorded now.
    #[inline]
    pub fn current_fence_value(&self) -> u64 {
        self.frame_fence.pending_value() + 1
    }

    /// Reports GPU progress up to `fence_value`, as the simulated GPU catches up.
    pub fn complete_gpu_work(&self, fence_value: u64) -> RhiResult {
        self.frame_fence.signal(fence_value.min(self.frame_fence.pending_value()))
    }

    /// Keeps `object` alive until the GPU finishes the frame being recorded.
    pub fn queue_for_release(&self, object: Box<dyn DeferRelease>) {
        let fence_value = self.current_fence_value();
        self.release_queue.lock().queue_for_release(fence_value, object);
    }

    /// Releases deferred objects and recycles command lists the GPU has finished with.
    pub fn collect_completed(&self) -> LastFreedStats {
        let completed = self.frame_fence.completed_value();
        self.command_lists.recycle(completed);
        self.release_queue.lock().collect(completed)
    }

    pub fn pending_release_count(&self) -> usize {
        self.release_queue.lock().len()
    }

    pub fn pending_release_bytes(&self) -> u64 {
        self.release_queue.lock().pending_bytes()
    }

    pub fn last_freed(&self) -> LastFreedStats {
        *self.release_queue.lock().last_freed()
    }

    /// Runs a closed command list and retires it behind the current frame.
    #[profiling::function]
    pub fn execute_command_list(&self, mut command_list: CommandList) -> RhiResult {
        let result = command_list.execute();
        self.command_lists.retire(command_list, self.current_fence_value());
        result
    }

    /// Blocks until uploads finish, then treats all submitted GPU work as complete
    /// and releases everything queued for release.
    pub fn wait_for_idle(&self) -> RhiResult<LastFreedStats> {
        self.upload_queue.wait_for_idle()?;
        let pending = self.frame_fence.pending_value();
        self.frame_fence.signal(pending)?;
        self.command_lists.recycle(u64::MAX);
        Ok(self.release_queue.lock().release_all())
    }

    pub(crate) fn register_pool(&self, id: ObjectId, pool: Weak<dyn DevicePool>) -> bool {
        self.pools.subscribe(id, pool)
    }

    pub(crate) fn unregister_pool(&self, id: ObjectId) -> bool {
        self.pools.unsubscribe(id)
    }

    pub fn is_pool_registered(&self, id: ObjectId) -> bool {
        self.pools.contains(id)
    }

    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }

    pub fn pools(&self) -> Vec<Arc<dyn DevicePool>> {
        self.pools.snapshot().into_vec()
    }

    pub fn subscribe_frame_events(&self, id: ObjectId, handler: Weak<dyn FrameEventHandler>) -> bool {
        self.frame_handlers.subscribe(id, handler)
    }

    pub fn unsubscribe_frame_events(&self, id: ObjectId) -> bool {
        self.frame_handlers.unsubscribe(id)
    }

    pub fn subscribe_memory_statistics(&self, id: ObjectId, handler: Weak<dyn MemoryStatisticsHandler>) -> bool {
        self.statistics_handlers.subscribe(id, handler)
    }

    pub fn unsubscribe_memory_statistics(&self, id: ObjectId) -> bool {
        self.statistics_handlers.unsubscribe(id)
    }

    /// Collects a statistics tree from every subscribed pool.
    pub fn report_memory_usage(&self, detail: MemoryReportDetail) -> MemoryStatistics {
        let mut builder = MemoryStatisticsBuilder::new(self.index, detail);
        for handler in self.statistics_handlers.snapshot() {
            handler.report_memory_usage(&mut builder);
        }
        builder.finish()
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.upload_queue.shutdown();
        let freed = self.release_queue.get_mut().release_all();
        log::debug!(
            "destroyed device {} '{}', released {} deferred objects",
            self.index,
            self.descriptor.name,
            freed.object_count
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use crate::release::DeferredDrop;

    fn device() -> Arc<Device> {
        Device::new(0, &DeviceDescriptorBuilder::default().async_upload(false).build().unwrap()).unwrap()
    }

    #[derive(Default)]
    struct PhaseRecorder(Mutex<Vec<&'static str>>);

    impl FrameEventHandler for PhaseRecorder {
        fn on_frame_begin(&self) {
            self.0.lock().push("begin");
        }

        fn on_frame_compile(&self) {
            self.0.lock().push("compile");
        }

        fn on_frame_end(&self) {
            self.0.lock().push("end");
        }
    }

    #[test]
    fn frame_phases_are_totally_ordered() {
        let device = device();
        let recorder = Arc::new(PhaseRecorder::default());
        let weak: Weak<dyn FrameEventHandler> = Arc::downgrade(&recorder) as Weak<PhaseRecorder>;
        assert!(device.subscribe_frame_events(ObjectId::next(), weak));

        assert_eq!(device.compile_frame(), Err(RhiError::InvalidOperation));
        assert_eq!(device.begin_frame(), Ok(1));
        assert_eq!(device.begin_frame(), Err(RhiError::InvalidOperation));
        device.compile_frame().unwrap();
        assert!(device.is_processing_frame());
        assert_eq!(device.end_frame(), Ok(1));
        assert_eq!(device.frame_phase(), FramePhase::Idle);

        assert_eq!(*recorder.0.lock(), ["begin", "compile", "end"]);
    }

    struct Counted(Arc<AtomicU32>);

    impl DeferRelease for Counted {
        fn release(self: Box<Self>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn release_waits_for_gpu_to_pass_the_frame() {
        let device = device();
        let released = Arc::new(AtomicU32::new(0));

        device.begin_frame().unwrap();
        device.queue_for_release(Box::new(Counted(released.clone())));
        device.queue_for_release(Box::new(DeferredDrop(vec![0u8; 4])));
        device.compile_frame().unwrap();
        let fence_value = device.end_frame().unwrap();

        device.begin_frame().unwrap();
        assert_eq!(released.load(Ordering::SeqCst), 0);
        assert_eq!(device.pending_release_count(), 2);
        device.compile_frame().unwrap();
        device.end_frame().unwrap();

        device.complete_gpu_work(fence_value).unwrap();
        device.begin_frame().unwrap();
        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert_eq!(device.last_freed().object_count, 2);
        assert_eq!(device.pending_release_count(), 0);
    }

    #[test]
    fn gpu_cannot_complete_unsubmitted_work() {
        let device = device();
        device.complete_gpu_work(10).unwrap();
        assert_eq!(device.frame_fence().completed_value(), 0);
    }

    #[test]
    fn wait_for_idle_drains_everything() {
        let device = device();
        let released = Arc::new(AtomicU32::new(0));
        device.queue_for_release(Box::new(Counted(released.clone())));
        let stats = device.wait_for_idle().unwrap();
        assert_eq!(stats.object_count, 1);
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }
}
