//! Size-class enumeration: nine power-of-two block sizes from 4 KiB to 1 MiB.

use snafu::Snafu;

/// A block size class. Ordinals run from `K4` (smallest) to `M1` (the macro
/// block, and the largest).
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SizeClass {
    K4 = 0,
    K8 = 1,
    K16 = 2,
    K32 = 3,
    K64 = 4,
    K128 = 5,
    K256 = 6,
    K512 = 7,
    M1 = 8,
}

impl SizeClass {
    pub const COUNT: usize = 9;
    pub const ALL: [SizeClass; Self::COUNT] = [
        SizeClass::K4,
        SizeClass::K8,
        SizeClass::K16,
        SizeClass::K32,
        SizeClass::K64,
        SizeClass::K128,
        SizeClass::K256,
        SizeClass::K512,
        SizeClass::M1,
    ];

    /// Every class poolable by a worker; the macro block is allocator-internal.
    pub const POOLABLE: [SizeClass; Self::COUNT - 1] = [
        SizeClass::K4,
        SizeClass::K8,
        SizeClass::K16,
        SizeClass::K32,
        SizeClass::K64,
        SizeClass::K128,
        SizeClass::K256,
        SizeClass::K512,
    ];

    #[inline]
    pub fn bytes(self) -> u64 {
        4096u64 << (self as u32)
    }

    #[inline]
    pub fn ordinal(self) -> u8 {
        self as u8
    }

    pub fn from_ordinal(ordinal: u8) -> Result<Self, InvalidSizeClass> {
        Self::ALL
            .into_iter()
            .find(|c| c.ordinal() == ordinal)
            .context(InvalidSizeClassSnafu { ordinal })
    }

    /// Short key-prefix form used by the free/temp list key codec.
    pub fn short(self) -> &'static str {
        match self {
            SizeClass::K4 => "4k",
            SizeClass::K8 => "8k",
            SizeClass::K16 => "16k",
            SizeClass::K32 => "32k",
            SizeClass::K64 => "64k",
            SizeClass::K128 => "128k",
            SizeClass::K256 => "256k",
            SizeClass::K512 => "512k",
            SizeClass::M1 => "1m",
        }
    }

    pub fn from_short(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.short() == s)
    }

    /// Next smaller class, or `None` at `K4`.
    pub fn split(self) -> Option<Self> {
        (self.ordinal() > 0).then(|| Self::ALL[self.ordinal() as usize - 1])
    }

    /// Next larger class, or `None` at `M1` (the macro block).
    pub fn merge(self) -> Option<Self> {
        let next = self.ordinal() as usize + 1;
        (next < Self::COUNT).then(|| Self::ALL[next])
    }

    /// Smallest class, `M1` down to `K4`, in order starting from `self`. Used
    /// by the allocator's donor walk.
    pub fn ascending_from(self) -> impl Iterator<Item = Self> {
        Self::ALL.into_iter().filter(move |c| *c >= self)
    }
}

#[derive(Debug, Snafu)]
#[snafu(display("invalid size class ordinal: {ordinal}"))]
pub struct InvalidSizeClass {
    ordinal: u8,
}

use snafu::OptionExt;

/// Smallest class whose byte size is `>= max(n, 4 KiB)`. Fails if `n` exceeds
/// the macro block.
pub fn next_power_of_two(n: u64) -> Option<SizeClass> {
    let target = n.max(4096);
    SizeClass::ALL.into_iter().find(|c| c.bytes() >= target)
}

/// Physical offset of `(size_class, block_num)` in the data file.
#[inline]
pub fn offset(size_class: SizeClass, block_num: u64) -> u64 {
    block_num * size_class.bytes()
}

/// The buddy of a block: its sibling under halving of the parent.
#[inline]
pub fn buddy_of(block_num: u64) -> u64 {
    block_num ^ 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_double_each_class() {
        assert_eq!(SizeClass::K4.bytes(), 4096);
        assert_eq!(SizeClass::M1.bytes(), 1024 * 1024);
        for pair in SizeClass::ALL.windows(2) {
            assert_eq!(pair[1].bytes(), pair[0].bytes() * 2);
        }
    }

    #[test]
    fn split_merge_are_inverses() {
        for class in SizeClass::ALL {
            if let Some(smaller) = class.split() {
                assert_eq!(smaller.merge(), Some(class));
            }
        }
    }

    #[test]
    fn split_none_at_bottom_merge_none_at_top() {
        assert_eq!(SizeClass::K4.split(), None);
        assert_eq!(SizeClass::M1.merge(), None);
    }

    #[test]
    fn next_power_of_two_picks_smallest_class_at_least_request() {
        assert_eq!(next_power_of_two(1), Some(SizeClass::K4));
        assert_eq!(next_power_of_two(4096), Some(SizeClass::K4));
        assert_eq!(next_power_of_two(4097), Some(SizeClass::K8));
        assert_eq!(next_power_of_two(1024 * 1024), Some(SizeClass::M1));
        assert_eq!(next_power_of_two(1024 * 1024 + 1), None);
    }

    #[test]
    fn short_round_trips() {
        for class in SizeClass::ALL {
            assert_eq!(SizeClass::from_short(class.short()), Some(class));
        }
    }

    #[test]
    fn buddy_xor_is_involution() {
        for n in 0u64..10 {
            assert_eq!(buddy_of(buddy_of(n)), n);
        }
    }
}
