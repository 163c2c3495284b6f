use std::ops::{Bound, RangeBounds};
use crate::RhiError;

macro_rules! normalize_range_function {
    ($unsigned:ty) => {
        $crate::paste! {
            /// Resolves `bounds` against `size` into `(offset, length)`.
            pub(crate) fn [<normalize_range_ $unsigned>]<R: RangeBounds<$unsigned>>(
                bounds: R,
                size: $unsigned,
            ) -> Result<($unsigned, $unsigned), RhiError> {
                let start = match bounds.start_bound() {
                    Bound::Included(&v) => v,
                    Bound::Excluded(&v) => v.checked_add(1).ok_or(RhiError::InvalidArgument)?,
                    Bound::Unbounded => 0,
                };
                let end_exclusive = match bounds.end_bound() {
                    Bound::Included(&v) => v.checked_add(1).ok_or(RhiError::InvalidArgument)?,
                    Bound::Excluded(&v) => v,
                    Bound::Unbounded => size,
                };

                if start > end_exclusive || end_exclusive > size {
                    return Err(RhiError::InvalidArgument);
                }

                Ok((start, end_exclusive - start))
            }
        }
    };
}

normalize_range_function!(u64);

/// Rounds `value` up to a multiple of `alignment` (a power of two, or zero for none).
/// `None` when the rounded value does not fit in a `u64`.
#[inline]
pub(crate) fn align_up(value: u64, alignment: u64) -> Option<u64> {
    if alignment <= 1 {
        return Some(value);
    }
    debug_assert!(alignment.is_power_of_two());
    Some(value.checked_add(alignment - 1)? & !(alignment - 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_all_bound_kinds() {
        assert_eq!(normalize_range_u64(.., 16), Ok((0, 16)));
        assert_eq!(normalize_range_u64(4..8, 16), Ok((4, 4)));
        assert_eq!(normalize_range_u64(4..=8, 16), Ok((4, 5)));
        assert_eq!(normalize_range_u64(10.., 16), Ok((10, 6)));
    }

    #[test]
    fn rejects_out_of_bounds() {
        assert_eq!(normalize_range_u64(8..20, 16), Err(RhiError::InvalidArgument));
        assert_eq!(normalize_range_u64(..=u64::MAX, 16), Err(RhiError::InvalidArgument));
    }

    #[test]
    fn aligns_up() {
        assert_eq!(align_up(0, 256), Some(0));
        assert_eq!(align_up(1, 256), Some(256));
        assert_eq!(align_up(256, 256), Some(256));
        assert_eq!(align_up(7, 0), Some(7));
    }

    #[test]
    fn align_up_reports_overflow() {
        assert_eq!(align_up(u64::MAX - 3, 16), None);
        assert_eq!(align_up(u64::MAX - 255, 256), Some(u64::MAX - 255));
        assert_eq!(align_up(u64::MAX, 1), Some(u64::MAX));
    }
}
