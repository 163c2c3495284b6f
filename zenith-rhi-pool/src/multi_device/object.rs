//! Container of one device-local object per bit of a device mask.

use std::sync::Arc;
use parking_lot::RwLock;
use zenith_core::collections::SmallVec;
use crate::device_mask::{DeviceIndex, DeviceMask};
use crate::rhi_assert;
use crate::RhiResult;

pub type DeviceObjects<T> = SmallVec<[(DeviceIndex, Arc<T>); 4]>;

struct State<T> {
    mask: DeviceMask,
    /// Sorted by device index.
    objects: DeviceObjects<T>,
}

/// Device mask plus the device-local objects it selects, swapped as one unit so the
/// mask never disagrees with the objects.
pub struct MultiDeviceObject<T> {
    state: RwLock<State<T>>,
}

impl<T> Default for MultiDeviceObject<T> {
    fn default() -> Self {
        Self {
            state: RwLock::new(State {
                mask: DeviceMask::EMPTY,
                objects: SmallVec::new(),
            }),
        }
    }
}

impl<T> MultiDeviceObject<T> {
    pub fn device_mask(&self) -> DeviceMask {
        self.state.read().mask
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().objects.is_empty()
    }

    pub fn device_object(&self, index: DeviceIndex) -> Option<Arc<T>> {
        let state = self.state.read();
        state
            .objects
            .binary_search_by_key(&index, |(i, _)| *i)
            .ok()
            .map(|position| state.objects[position].1.clone())
    }

    /// Snapshot of the objects in device order.
    pub fn device_objects(&self) -> DeviceObjects<T> {
        self.state.read().objects.clone()
    }

    /// Whether the live objects are exactly the devices of the mask.
    pub fn covers_mask(&self) -> bool {
        let state = self.state.read();
        state.objects.iter().map(|(index, _)| *index).collect::<DeviceMask>() == state.mask
            && state.objects.len() as u32 == state.mask.count()
    }

    /// Replaces every object. `objects` must hold one entry per device, in any order.
    pub(crate) fn replace(&self, mut objects: DeviceObjects<T>) -> DeviceObjects<T> {
        objects.sort_by_key(|(index, _)| *index);
        let mask: DeviceMask = objects.iter().map(|(index, _)| *index).collect();
        rhi_assert!(
            mask.count() as usize == objects.len(),
            "duplicate device index among {} device objects",
            objects.len()
        );
        let mut state = self.state.write();
        state.mask = mask;
        std::mem::replace(&mut state.objects, objects)
    }

    /// Drops every object and empties the mask.
    pub(crate) fn clear(&self) -> DeviceObjects<T> {
        self.replace(SmallVec::new())
    }

    /// Calls `f` on every object in device order, stopping at the first failure.
    pub fn iterate_objects(&self, mut f: impl FnMut(DeviceIndex, &Arc<T>) -> RhiResult) -> RhiResult {
        for (index, object) in self.device_objects() {
            f(index, &object)?;
        }
        Ok(())
    }
}

/// Calls `f` on every device of `mask` in index order, stopping at the first failure.
pub fn iterate_devices(mask: DeviceMask, mut f: impl FnMut(DeviceIndex) -> RhiResult) -> RhiResult {
    for index in mask.iter() {
        f(index)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use zenith_core::collections::smallvec;
    use crate::RhiError;

    #[test]
    fn replace_keeps_mask_and_objects_together() {
        let object = MultiDeviceObject::default();
        assert!(object.covers_mask());
        object.replace(smallvec![(2, Arc::new("two")), (0, Arc::new("zero"))]);

        assert_eq!(object.device_mask(), DeviceMask::from_bits(0b101));
        assert!(object.covers_mask());
        assert_eq!(object.device_object(2).as_deref(), Some(&"two"));
        assert!(object.device_object(1).is_none());
        let order: Vec<_> = object.device_objects().iter().map(|(i, _)| *i).collect();
        assert_eq!(order, vec![0, 2]);

        let removed = object.clear();
        assert_eq!(removed.len(), 2);
        assert_eq!(object.device_mask(), DeviceMask::EMPTY);
    }

    #[test]
    fn iteration_stops_at_first_failure() {
        let object = MultiDeviceObject::default();
        object.replace(smallvec![(0, Arc::new(0u32)), (1, Arc::new(1u32)), (2, Arc::new(2u32))]);

        let mut visited = Vec::new();
        let result = object.iterate_objects(|index, _| {
            visited.push(index);
            if index == 1 { Err(RhiError::OutOfMemory) } else { Ok(()) }
        });
        assert_eq!(result, Err(RhiError::OutOfMemory));
        assert_eq!(visited, vec![0, 1]);

        let mut visited = Vec::new();
        iterate_devices(DeviceMask::from_bits(0b1010), |index| {
            visited.push(index);
            Ok(())
        })
        .unwrap();
        assert_eq!(visited, vec![1, 3]);
    }
}
