use crate::{FRAME_SIZE, VirtualAddress};
use core::fmt;
use core::ops::Add;

/// Virtual memory page base.
///
/// Represents the **page-aligned base** of a 4 KiB virtual page.
///
/// ```rust
/// # use kernel_memory_addresses::*;
/// let va = VirtualAddress::new(0xFFFF_FFFF_8000_1234);
/// let vp = va.page();
/// assert_eq!(vp.base().as_u64() & (FRAME_SIZE - 1), 0);
/// assert_eq!((vp.base() + va.page_offset()).as_u64(), va.as_u64());
/// ```
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualPage(VirtualAddress);

impl VirtualPage {
    /// Page that contains `addr` (aligns down to page boundary).
    #[inline]
    #[must_use]
    pub const fn containing_address(addr: VirtualAddress) -> Self {
        Self(VirtualAddress::new(addr.as_u64() & !(FRAME_SIZE - 1)))
    }

    /// Page starting exactly at `base`, or `None` if `base` is not aligned.
    #[inline]
    #[must_use]
    pub const fn from_base(base: VirtualAddress) -> Option<Self> {
        if base.is_page_aligned() {
            Some(Self(base))
        } else {
            None
        }
    }

    #[inline]
    #[must_use]
    pub const fn base(self) -> VirtualAddress {
        self.0
    }

    /// The page directly following this one.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        Self(VirtualAddress::new(self.0.as_u64() + FRAME_SIZE))
    }
}

impl Add<u64> for VirtualPage {
    type Output = Self;

    /// Advance by `rhs` pages.
    #[inline]
    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0 + rhs * FRAME_SIZE)
    }
}

impl fmt::Debug for VirtualPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtualPage({:#018X})", self.0.as_u64())
    }
}

impl fmt::Display for VirtualPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}
