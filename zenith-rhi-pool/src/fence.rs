//! CPU/GPU completion signaling.

use std::sync::Arc;
use std::time::{Duration, Instant};
use parking_lot::{Condvar, Mutex, RwLock};
use zenith_core::log;
use zenith_rhi_derive::DeviceObject;
use crate::device::{Device, DeviceObject};
use crate::device_mask::DeviceIndex;
use crate::queue::HardwareQueueClass;
use crate::{rhi_assert, RhiError, RhiResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FenceState {
    /// Pending value not reached yet.
    Reset,
    Signaled,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FenceWaitResult {
    Signaled,
    /// The timeout elapsed first. The work is still in flight.
    TimedOut,
}

/// Pending/completed value pair shared by a fence and every cross-device import of it.
#[derive(Debug)]
struct FenceTimeline {
    pending: Mutex<u64>,
    completed: Mutex<u64>,
    completed_changed: Condvar,
}

impl FenceTimeline {
    fn new(initial_state: FenceState) -> Self {
        let pending = match initial_state {
            FenceState::Signaled => 0,
            FenceState::Reset => 1,
        };
        Self {
            pending: Mutex::new(pending),
            completed: Mutex::new(0),
            completed_changed: Condvar::new(),
        }
    }

    fn pending(&self) -> u64 {
        *self.pending.lock()
    }

    fn completed(&self) -> u64 {
        *self.completed.lock()
    }

    fn increment(&self) -> u64 {
        let mut pending = self.pending.lock();
        *pending += 1;
        *pending
    }

    fn signal(&self, value: u64) {
        let mut completed = self.completed.lock();
        if value > *completed {
            *completed = value;
            self.completed_changed.notify_all();
        }
    }

    fn wait_for(&self, value: u64, timeout: Option<Duration>) -> FenceWaitResult {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut completed = self.completed.lock();
        while *completed < value {
            match deadline {
                Some(deadline) => {
                    if self.completed_changed.wait_until(&mut completed, deadline).timed_out() && *completed < value {
                        return FenceWaitResult::TimedOut;
                    }
                }
                None => self.completed_changed.wait(&mut completed),
            }
        }
        FenceWaitResult::Signaled
    }
}

#[derive(Debug)]
struct CrossDeviceOrigin {
    device_index: Option<DeviceIndex>,
}

#[derive(Debug)]
struct FenceBinding {
    timeline: Arc<FenceTimeline>,
    /// Set when this fence imports the timeline of a fence on another device.
    original: Option<CrossDeviceOrigin>,
}

/// Monotonic fence. Signaled iff `pending_value <= completed_value`.
///
/// A cross-device fence imports the timeline of an original fence living on another
/// device; only the original may advance the pending value.
#[DeviceObject]
pub struct Fence {
    name: RwLock<String>,
    binding: RwLock<Option<FenceBinding>>,
}

impl Default for Fence {
    fn default() -> Self {
        Self::new()
    }
}

impl Fence {
    pub fn new() -> Self {
        Self {
            name: RwLock::new(String::from("Unnamed fence")),
            binding: RwLock::new(None),
            device: Default::default(),
        }
    }

    pub fn with_name(self, name: impl Into<String>) -> Self {
        *self.name.write() = name.into();
        self
    }

    pub fn name(&self) -> String {
        self.name.read().clone()
    }

    pub fn init(&self, device: &Arc<Device>, initial_state: FenceState) -> RhiResult {
        if self.is_initialized() || self.binding.read().is_some() {
            log::error!("fence '{}' initialized twice", self.name());
            return Err(RhiError::InvalidOperation);
        }
        self.device.bind(device);
        *self.binding.write() = Some(FenceBinding {
            timeline: Arc::new(FenceTimeline::new(initial_state)),
            original: None,
        });
        Ok(())
    }

    /// Initializes a fence with no device, used for device-internal timelines.
    pub(crate) fn init_detached(&self, initial_state: FenceState) {
        *self.binding.write() = Some(FenceBinding {
            timeline: Arc::new(FenceTimeline::new(initial_state)),
            original: None,
        });
    }

    /// Imports `original`'s timeline onto `device`.
    pub fn init_cross_device(&self, device: &Arc<Device>, original: &Fence) -> RhiResult {
        if self.is_initialized() || self.binding.read().is_some() {
            log::error!("fence '{}' initialized twice", self.name());
            return Err(RhiError::InvalidOperation);
        }
        let Some(timeline) = original.timeline() else {
            log::error!("cross-device fence '{}' imports uninitialized fence '{}'", self.name(), original.name());
            return Err(RhiError::InvalidArgument);
        };
        let origin = CrossDeviceOrigin {
            device_index: original.device().map(|d| d.index()),
        };
        self.device.bind(device);
        *self.binding.write() = Some(FenceBinding {
            timeline,
            original: Some(origin),
        });
        Ok(())
    }

    pub fn shutdown(&self) {
        self.binding.write().take();
        self.device.unbind();
    }

    fn timeline(&self) -> Option<Arc<FenceTimeline>> {
        self.binding.read().as_ref().map(|b| b.timeline.clone())
    }

    fn require_timeline(&self) -> RhiResult<Arc<FenceTimeline>> {
        self.timeline().ok_or_else(|| {
            log::error!("fence '{}' used before init", self.name());
            RhiError::InvalidOperation
        })
    }

    pub fn is_cross_device(&self) -> bool {
        self.binding.read().as_ref().is_some_and(|b| b.original.is_some())
    }

    /// Device of the fence this one imports, if it is a cross-device fence.
    pub fn original_device_index(&self) -> Option<DeviceIndex> {
        self.binding.read().as_ref()?.original.as_ref()?.device_index
    }

    /// Advances the pending value and returns it.
    pub fn increment(&self) -> RhiResult<u64> {
        if self.is_cross_device() {
            rhi_assert!(false, "increment on cross-device fence '{}', advance its original instead", self.name());
            return Err(RhiError::InvalidOperation);
        }
        Ok(self.require_timeline()?.increment())
    }

    /// Moves the fence back to `Reset` by advancing the pending value.
    pub fn reset(&self) -> RhiResult {
        if self.is_cross_device() {
            rhi_assert!(false, "reset on cross-device fence '{}'", self.name());
            return Err(RhiError::InvalidOperation);
        }
        self.require_timeline()?.increment();
        Ok(())
    }

    /// Completes the current pending value from the CPU.
    pub fn signal_on_cpu(&self) -> RhiResult {
        let timeline = self.require_timeline()?;
        timeline.signal(timeline.pending());
        Ok(())
    }

    /// Completes up to `value`, as the GPU would when it reaches the signal.
    pub fn signal(&self, value: u64) -> RhiResult {
        self.require_timeline()?.signal(value);
        Ok(())
    }

    pub fn pending_value(&self) -> u64 {
        self.timeline().map_or(0, |t| t.pending())
    }

    pub fn completed_value(&self) -> u64 {
        self.timeline().map_or(0, |t| t.completed())
    }

    pub fn fence_state(&self) -> FenceState {
        match self.timeline() {
            Some(t) if t.pending() <= t.completed() => FenceState::Signaled,
            Some(_) => FenceState::Reset,
            None => FenceState::Signaled,
        }
    }

    /// Blocks until the pending value observed at call time completes.
    pub fn wait_on_cpu(&self, timeout: Option<Duration>) -> RhiResult<FenceWaitResult> {
        let timeline = self.require_timeline()?;
        let value = timeline.pending();
        Ok(timeline.wait_for(value, timeout))
    }

    pub fn wait_for_value(&self, value: u64, timeout: Option<Duration>) -> RhiResult<FenceWaitResult> {
        Ok(self.require_timeline()?.wait_for(value, timeout))
    }
}

/// One fence per hardware queue class.
pub struct FenceSet {
    fences: [Fence; HardwareQueueClass::COUNT],
}

impl Default for FenceSet {
    fn default() -> Self {
        Self::new()
    }
}

impl FenceSet {
    pub fn new() -> Self {
        Self {
            fences: HardwareQueueClass::ALL.map(|class| Fence::new().with_name(format!("{} fence", class.name()))),
        }
    }

    pub fn init(&self, device: &Arc<Device>, initial_state: FenceState) -> RhiResult {
        for (i, fence) in self.fences.iter().enumerate() {
            if let Err(error) = fence.init(device, initial_state) {
                self.fences[..i].iter().for_each(Fence::shutdown);
                return Err(error);
            }
        }
        Ok(())
    }

    pub fn shutdown(&self) {
        self.fences.iter().for_each(Fence::shutdown);
    }

    #[inline]
    pub fn fence(&self, queue_class: HardwareQueueClass) -> &Fence {
        &self.fences[queue_class.index()]
    }

    /// Waits for every queue class in the set.
    pub fn wait(&self, timeout: Option<Duration>) -> RhiResult<FenceWaitResult> {
        let deadline = timeout.map(|t| Instant::now() + t);
        for fence in &self.fences {
            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            if fence.wait_on_cpu(remaining)? == FenceWaitResult::TimedOut {
                return Ok(FenceWaitResult::TimedOut);
            }
        }
        Ok(FenceWaitResult::Signaled)
    }

    /// Advances every fence's pending value by one.
    pub fn reset(&self) -> RhiResult {
        self.fences.iter().try_for_each(Fence::reset)
    }
}
