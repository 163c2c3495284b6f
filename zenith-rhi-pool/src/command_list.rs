//! Command lists and their fence-gated allocator.

use std::collections::VecDeque;
use parking_lot::Mutex;
use zenith_core::log;
use crate::memory::MemoryView;
use crate::queue::HardwareQueueClass;
use crate::{RhiError, RhiResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandListState {
    Initial,
    Recording,
    Closed,
    Submitted,
}

#[derive(Debug)]
pub enum Command {
    CopyBuffer {
        source: MemoryView,
        destination: MemoryView,
    },
}

#[derive(Debug)]
pub struct CommandList {
    queue_class: HardwareQueueClass,
    state: CommandListState,
    commands: Vec<Command>,
}

impl CommandList {
    fn new(queue_class: HardwareQueueClass) -> Self {
        Self {
            queue_class,
            state: CommandListState::Initial,
            commands: Vec::new(),
        }
    }

    #[inline]
    pub fn queue_class(&self) -> HardwareQueueClass { self.queue_class }

    #[inline]
    pub fn state(&self) -> CommandListState { self.state }

    #[inline]
    pub fn commands(&self) -> &[Command] { &self.commands }

    fn transition(&mut self, from: CommandListState, to: CommandListState) -> RhiResult {
        if self.state != from {
            log::error!("{:?} command list is {:?}, expected {:?}", self.queue_class, self.state, from);
            return Err(RhiError::InvalidOperation);
        }
        self.state = to;
        Ok(())
    }

    pub fn begin(&mut self) -> RhiResult {
        self.transition(CommandListState::Initial, CommandListState::Recording)
    }

    /// Records a copy of all of `source` into the front of `destination`.
    pub fn copy_buffer(&mut self, source: &MemoryView, destination: &MemoryView) -> RhiResult {
        if self.state != CommandListState::Recording {
            return Err(RhiError::InvalidOperation);
        }
        if source.size() > destination.size() {
            log::error!(
                "copy of {} bytes into a {} byte destination",
                source.size(),
                destination.size()
            );
            return Err(RhiError::InvalidArgument);
        }
        self.commands.push(Command::CopyBuffer {
            source: source.clone(),
            destination: destination.clone(),
        });
        Ok(())
    }

    pub fn close(&mut self) -> RhiResult {
        self.transition(CommandListState::Recording, CommandListState::Closed)
    }

    /// Runs the recorded commands against simulated device memory.
    pub(crate) fn execute(&mut self) -> RhiResult {
        self.transition(CommandListState::Closed, CommandListState::Submitted)?;
        for command in &self.commands {
            match command {
                Command::CopyBuffer { source, destination } => destination.copy_from(source)?,
            }
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.commands.clear();
        self.state = CommandListState::Initial;
    }
}

/// Hands out command lists per queue class and takes them back once the GPU is done.
///
/// Submitted lists wait in a ring tagged with the frame fence value that covers them;
/// [`recycle`](Self::recycle) returns them to the free lists when that value completes.
#[derive(Default)]
pub struct CommandListAllocator {
    free: Mutex<[Vec<CommandList>; HardwareQueueClass::COUNT]>,
    in_flight: Mutex<VecDeque<(u64, CommandList)>>,
    created: Mutex<[usize; HardwareQueueClass::COUNT]>,
}

impl CommandListAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a list in the `Initial` state.
    pub fn allocate(&self, queue_class: HardwareQueueClass) -> CommandList {
        if let Some(list) = self.free.lock()[queue_class.index()].pop() {
            return list;
        }
        self.created.lock()[queue_class.index()] += 1;
        CommandList::new(queue_class)
    }

    /// Queues `list` until `fence_value` completes.
    pub fn retire(&self, list: CommandList, fence_value: u64) {
        self.in_flight.lock().push_back((fence_value, list));
    }

    /// Recycles every list whose fence value is `<= completed_fence_value`.
    pub fn recycle(&self, completed_fence_value: u64) -> usize {
        let mut in_flight = self.in_flight.lock();
        let mut free = self.free.lock();
        let mut recycled = 0;
        while in_flight.front().is_some_and(|(value, _)| *value <= completed_fence_value) {
            if let Some((_, mut list)) = in_flight.pop_front() {
                list.reset();
                free[list.queue_class.index()].push(list);
                recycled += 1;
            }
        }
        recycled
    }

    pub fn created_count(&self, queue_class: HardwareQueueClass) -> usize {
        self.created.lock()[queue_class.index()]
    }

    pub fn free_count(&self, queue_class: HardwareQueueClass) -> usize {
        self.free.lock()[queue_class.index()].len()
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_machine_rejects_out_of_order_calls() {
        let allocator = CommandListAllocator::new();
        let mut list = allocator.allocate(HardwareQueueClass::Copy);
        assert_eq!(list.state(), CommandListState::Initial);
        assert_eq!(list.close(), Err(RhiError::InvalidOperation));
        list.begin().unwrap();
        assert_eq!(list.begin(), Err(RhiError::InvalidOperation));
        list.close().unwrap();
        list.execute().unwrap();
        assert_eq!(list.state(), CommandListState::Submitted);
    }

    #[test]
    fn lists_recycle_only_after_fence_completes() {
        let allocator = CommandListAllocator::new();
        let mut list = allocator.allocate(HardwareQueueClass::Graphics);
        list.begin().unwrap();
        list.close().unwrap();
        list.execute().unwrap();
        allocator.retire(list, 2);

        assert_eq!(allocator.recycle(1), 0);
        assert_eq!(allocator.free_count(HardwareQueueClass::Graphics), 0);
        assert_eq!(allocator.recycle(2), 1);
        assert_eq!(allocator.free_count(HardwareQueueClass::Graphics), 1);

        let reused = allocator.allocate(HardwareQueueClass::Graphics);
        assert_eq!(reused.state(), CommandListState::Initial);
        assert!(reused.commands().is_empty());
        assert_eq!(allocator.created_count(HardwareQueueClass::Graphics), 1);
    }
}
