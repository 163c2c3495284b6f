//! Device selection bitmask.

use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign, Not};

/// Index of a physical device inside an [`RhiContext`](crate::RhiContext).
pub type DeviceIndex = u32;

/// Upper bound of devices addressable by a [`DeviceMask`].
pub const MAX_DEVICE_COUNT: u32 = u32::BITS;

/// One bit per physical device index.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DeviceMask(u32);

impl DeviceMask {
    pub const EMPTY: DeviceMask = DeviceMask(0);

    #[inline]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    #[inline]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Mask with only `index` set.
    #[inline]
    pub const fn single(index: DeviceIndex) -> Self {
        debug_assert!(index < MAX_DEVICE_COUNT);
        Self(1 << index)
    }

    /// Mask selecting devices `0..count`.
    pub const fn first_n(count: u32) -> Self {
        if count >= MAX_DEVICE_COUNT {
            Self(u32::MAX)
        } else {
            Self((1 << count) - 1)
        }
    }

    #[inline]
    pub const fn contains(self, index: DeviceIndex) -> bool {
        index < MAX_DEVICE_COUNT && (self.0 >> index) & 1 == 1
    }

    #[inline]
    pub fn insert(&mut self, index: DeviceIndex) {
        *self = *self | Self::single(index);
    }

    #[inline]
    pub fn remove(&mut self, index: DeviceIndex) {
        self.0 &= !(1 << index);
    }

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub const fn count(self) -> u32 {
        self.0.count_ones()
    }

    /// Whether every device in `other` is also in `self`.
    #[inline]
    pub const fn is_superset_of(self, other: DeviceMask) -> bool {
        self.0 & other.0 == other.0
    }

    /// Set device indices in ascending order.
    #[inline]
    pub fn iter(self) -> DeviceMaskIter {
        DeviceMaskIter(self.0)
    }
}

impl BitOr for DeviceMask {
    type Output = DeviceMask;
    fn bitor(self, rhs: Self) -> Self::Output {
        DeviceMask(self.0 | rhs.0)
    }
}

impl BitOrAssign for DeviceMask {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for DeviceMask {
    type Output = DeviceMask;
    fn bitand(self, rhs: Self) -> Self::Output {
        DeviceMask(self.0 & rhs.0)
    }
}

impl Not for DeviceMask {
    type Output = DeviceMask;
    fn not(self) -> Self::Output {
        DeviceMask(!self.0)
    }
}

impl FromIterator<DeviceIndex> for DeviceMask {
    fn from_iter<I: IntoIterator<Item = DeviceIndex>>(iter: I) -> Self {
        let mut mask = DeviceMask::EMPTY;
        for index in iter {
            mask.insert(index);
        }
        mask
    }
}

impl IntoIterator for DeviceMask {
    type Item = DeviceIndex;
    type IntoIter = DeviceMaskIter;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl fmt::Debug for DeviceMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceMask({:#b})", self.0)
    }
}

impl fmt::Display for DeviceMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

pub struct DeviceMaskIter(u32);

impl Iterator for DeviceMaskIter {
    type Item = DeviceIndex;

    fn next(&mut self) -> Option<Self::Item> {
        if self.0 == 0 {
            return None;
        }
        let index = self.0.trailing_zeros();
        self.0 &= self.0 - 1;
        Some(index)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.0.count_ones() as usize;
        (n, Some(n))
    }
}

impl ExactSizeIterator for DeviceMaskIter {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iterates_in_ascending_order() {
        let mask = DeviceMask::from_bits(0b1010_0101);
        assert_eq!(mask.iter().collect::<Vec<_>>(), vec![0, 2, 5, 7]);
        assert_eq!(mask.count(), 4);
    }

    #[test]
    fn first_n_saturates() {
        assert_eq!(DeviceMask::first_n(0), DeviceMask::EMPTY);
        assert_eq!(DeviceMask::first_n(3).bits(), 0b111);
        assert_eq!(DeviceMask::first_n(40).bits(), u32::MAX);
    }

    #[test]
    fn insert_remove_contains() {
        let mut mask = DeviceMask::EMPTY;
        mask.insert(4);
        assert!(mask.contains(4));
        assert!(!mask.contains(3));
        assert!(!mask.contains(MAX_DEVICE_COUNT + 1));
        mask.remove(4);
        assert!(mask.is_empty());
    }

    #[test]
    fn collects_from_indices() {
        let mask: DeviceMask = [1, 3].into_iter().collect();
        assert_eq!(mask.bits(), 0b1010);
        assert!(DeviceMask::first_n(4).is_superset_of(mask));
        assert_eq!(format!("{mask}"), "[1, 3]");
    }
}
