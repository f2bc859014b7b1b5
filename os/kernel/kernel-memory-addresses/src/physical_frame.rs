use crate::{FRAME_SHIFT, FRAME_SIZE, PhysicalAddress};
use core::fmt;
use core::ops::Add;

/// A 4 KiB aligned physical frame.
///
/// ### Invariants
/// - The low [`FRAME_SHIFT`] bits of the base are always zero.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalFrame(PhysicalAddress);

impl PhysicalFrame {
    /// Frame that contains `addr` (aligns down to the frame boundary).
    #[inline]
    #[must_use]
    pub const fn containing_address(addr: PhysicalAddress) -> Self {
        Self(PhysicalAddress::new(addr.as_u64() & !(FRAME_SIZE - 1)))
    }

    /// Frame starting exactly at `base`, or `None` if `base` is not aligned.
    #[inline]
    #[must_use]
    pub const fn from_base(base: PhysicalAddress) -> Option<Self> {
        if base.is_frame_aligned() {
            Some(Self(base))
        } else {
            None
        }
    }

    /// Frame with the given frame number (`base >> 12`).
    #[inline]
    #[must_use]
    pub const fn from_number(number: u64) -> Self {
        Self(PhysicalAddress::new(number << FRAME_SHIFT))
    }

    #[inline]
    #[must_use]
    pub const fn base(self) -> PhysicalAddress {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn number(self) -> u64 {
        self.0.as_u64() >> FRAME_SHIFT
    }

    /// The frame directly following this one.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        Self::from_number(self.number() + 1)
    }
}

impl Add<u64> for PhysicalFrame {
    type Output = Self;

    /// Advance by `rhs` frames.
    #[inline]
    fn add(self, rhs: u64) -> Self::Output {
        Self::from_number(self.number() + rhs)
    }
}

impl fmt::Debug for PhysicalFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysicalFrame({:#018X})", self.0.as_u64())
    }
}

impl fmt::Display for PhysicalFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}
