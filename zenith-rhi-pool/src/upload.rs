//! Asynchronous streaming uploads into device memory.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use zenith_core::log;
use crate::device_mask::DeviceIndex;
use crate::fence::{Fence, FenceState, FenceWaitResult};
use crate::memory::MemoryView;
use crate::{RhiError, RhiResult};

/// Completion ticket of a queued upload. The null handle is always finished.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UploadHandle(u64);

impl UploadHandle {
    pub const NULL: UploadHandle = UploadHandle(0);

    #[inline]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn fence_value(self) -> u64 {
        self.0
    }
}

struct UploadRequest {
    fence_value: u64,
    destination: MemoryView,
    data: Vec<u8>,
}

/// Per-device upload queue.
///
/// Requests are copied by a worker thread in submission order; the worker publishes
/// each completed request on an internal fence whose values double as upload handles.
/// Without a worker, uploads complete synchronously inside [`queue_upload`](Self::queue_upload).
pub struct AsyncUploadQueue {
    device_index: DeviceIndex,
    fence: Arc<Fence>,
    sender: Mutex<Option<Sender<UploadRequest>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    latency: Duration,
}

impl AsyncUploadQueue {
    /// `latency` delays every request on the worker, simulating the copy queue.
    pub fn new(device_index: DeviceIndex, asynchronous: bool, latency: Duration) -> RhiResult<Self> {
        let fence = Arc::new(Fence::new().with_name(format!("Device {device_index} upload fence")));
        fence.init_detached(FenceState::Signaled);

        let (sender, worker) = if asynchronous {
            let (sender, receiver) = crossbeam_channel::unbounded::<UploadRequest>();
            let worker = spawn_upload_thread(device_index, fence.clone(), receiver, latency)?;
            (Some(sender), Some(worker))
        } else {
            (None, None)
        };

        Ok(Self {
            device_index,
            fence,
            sender: Mutex::new(sender),
            worker: Mutex::new(worker),
            latency,
        })
    }

    #[inline]
    pub fn is_asynchronous(&self) -> bool {
        self.sender.lock().is_some()
    }

    #[inline]
    pub fn latency(&self) -> Duration { self.latency }

    /// Queues a copy of `data` into the front of `destination` and returns immediately.
    #[profiling::function]
    pub fn queue_upload(&self, destination: MemoryView, data: Vec<u8>) -> RhiResult<UploadHandle> {
        if data.len() as u64 > destination.size() {
            log::error!(
                "device {} upload of {} bytes into a {} byte region",
                self.device_index,
                data.len(),
                destination.size()
            );
            return Err(RhiError::InvalidArgument);
        }

        // Holding the sender lock keeps fence values and channel order in step.
        let sender = self.sender.lock();
        let fence_value = self.fence.increment()?;
        let request = UploadRequest {
            fence_value,
            destination,
            data,
        };
        match sender.as_ref() {
            Some(sender) => {
                if sender.send(request).is_err() {
                    log::error!("device {} upload worker is gone", self.device_index);
                    self.fence.signal(fence_value)?;
                    return Err(RhiError::Fail);
                }
            }
            None => process_request(self.device_index, &self.fence, request),
        }
        log::trace!("device {} queued upload {}", self.device_index, fence_value);
        Ok(UploadHandle(fence_value))
    }

    pub fn is_upload_finished(&self, handle: UploadHandle) -> bool {
        handle.0 <= self.fence.completed_value()
    }

    pub fn wait_for_upload(&self, handle: UploadHandle, timeout: Option<Duration>) -> RhiResult<FenceWaitResult> {
        if handle.is_null() {
            return Ok(FenceWaitResult::Signaled);
        }
        self.fence.wait_for_value(handle.0, timeout)
    }

    /// Waits for every upload queued so far.
    pub fn wait_for_idle(&self) -> RhiResult {
        self.fence.wait_on_cpu(None).map(|_| ())
    }

    /// Drains the queue and joins the worker.
    pub fn shutdown(&self) {
        self.sender.lock().take();
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                log::error!("device {} upload worker panicked", self.device_index);
            }
        }
    }
}

impl Drop for AsyncUploadQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn process_request(device_index: DeviceIndex, fence: &Fence, request: UploadRequest) {
    if let Err(error) = request.destination.write(0, &request.data) {
        log::error!("device {} upload {} failed: {}", device_index, request.fence_value, error);
    }
    // The handle completes even on failure so waiters never hang.
    let _ = fence.signal(request.fence_value);
}

fn spawn_upload_thread(
    device_index: DeviceIndex,
    fence: Arc<Fence>,
    receiver: Receiver<UploadRequest>,
    latency: Duration,
) -> RhiResult<JoinHandle<()>> {
    std::thread::Builder::new()
        .name(format!("Device {device_index} uploads"))
        .spawn(move || {
            // Runs until every sender is dropped.
            while let Ok(request) = receiver.recv() {
                if !latency.is_zero() {
                    std::thread::sleep(latency);
                }
                process_request(device_index, &fence, request);
            }
        })
        .map_err(|error| {
            log::error!("failed to spawn upload worker for device {}: {}", device_index, error);
            RhiError::Fail
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{DeviceAddressSpace, HeapMemoryLevel};

    fn destination(size: u64) -> MemoryView {
        let space = DeviceAddressSpace::new(0, 0, 0);
        let page = space.allocate_page(HeapMemoryLevel::Device, size, 16).unwrap();
        MemoryView::new(page, 0, size)
    }

    #[test]
    fn synchronous_queue_completes_inline() {
        let queue = AsyncUploadQueue::new(0, false, Duration::ZERO).unwrap();
        let view = destination(8);
        let handle = queue.queue_upload(view.clone(), vec![1, 2, 3, 4]).unwrap();
        assert!(queue.is_upload_finished(handle));
        assert_eq!(&view.to_vec()[..4], &[1, 2, 3, 4]);
    }

    #[test]
    fn worker_publishes_completion_in_order() {
        let queue = AsyncUploadQueue::new(0, true, Duration::from_millis(1)).unwrap();
        let view = destination(16);
        let first = queue.queue_upload(view.slice(0..8).unwrap(), vec![7; 8]).unwrap();
        let second = queue.queue_upload(view.slice(8..16).unwrap(), vec![9; 8]).unwrap();
        assert!(first < second);

        assert_eq!(queue.wait_for_upload(second, None).unwrap(), FenceWaitResult::Signaled);
        assert!(queue.is_upload_finished(first));
        assert_eq!(view.to_vec(), [[7u8; 8], [9u8; 8]].concat());
        queue.shutdown();
    }

    #[test]
    fn oversized_upload_is_rejected() {
        let queue = AsyncUploadQueue::new(0, false, Duration::ZERO).unwrap();
        assert_eq!(
            queue.queue_upload(destination(4), vec![0; 5]),
            Err(RhiError::InvalidArgument)
        );
        assert!(queue.is_upload_finished(UploadHandle::NULL));
    }
}
