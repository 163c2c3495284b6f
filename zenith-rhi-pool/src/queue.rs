use enumflags2::BitFlags;

/// Class of hardware queue a command list or fence belongs to.
#[enumflags2::bitflags]
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HardwareQueueClass {
    Graphics = 1 << 0,
    Compute = 1 << 1,
    Copy = 1 << 2,
}

pub type HardwareQueueClassMask = BitFlags<HardwareQueueClass>;

impl HardwareQueueClass {
    pub const COUNT: usize = 3;

    pub const ALL: [HardwareQueueClass; Self::COUNT] = [
        HardwareQueueClass::Graphics,
        HardwareQueueClass::Compute,
        HardwareQueueClass::Copy,
    ];

    /// Dense index in `0..COUNT`.
    #[inline]
    pub fn index(self) -> usize {
        match self {
            HardwareQueueClass::Graphics => 0,
            HardwareQueueClass::Compute => 1,
            HardwareQueueClass::Copy => 2,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            HardwareQueueClass::Graphics => "Graphics",
            HardwareQueueClass::Compute => "Compute",
            HardwareQueueClass::Copy => "Copy",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dense_indices_match_all_order() {
        for (i, class) in HardwareQueueClass::ALL.iter().enumerate() {
            assert_eq!(class.index(), i);
        }
        let mask: HardwareQueueClassMask = HardwareQueueClass::Graphics | HardwareQueueClass::Copy;
        assert!(mask.contains(HardwareQueueClass::Copy));
        assert!(!mask.contains(HardwareQueueClass::Compute));
    }
}
