//! # HHDM-based `PhysMapper`
//!
//! Every physical address the boot memory map reports as RAM is mapped at
//! `HHDM_BASE + pa` by [`Vmm::init`](crate::vmm::Vmm::init). Page tables,
//! frame bitmaps and copy-on-write copies are all reached through this
//! window, independent of which address space is active.
//!
//! ## Example
//! ```rust,no_run
//! use kernel_alloc::phys_mapper::HhdmPhysMapper;
//! use kernel_memory_addresses::PhysicalAddress;
//! use kernel_vmem::{PageTable, PhysMapper};
//!
//! let mapper = HhdmPhysMapper;
//! unsafe {
//!     let table: &mut PageTable = mapper.phys_to_mut(PhysicalAddress::new(0x1234_0000));
//!     table.zero();
//! }
//! ```

use kernel_info::memory::HHDM_BASE;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_vmem::PhysMapper;

/// [`PhysMapper`] for a kernel with a higher-half direct map.
///
/// # Safety
/// The direct map must be installed (in every address space) and cover the
/// referenced physical range.
#[derive(Debug, Default, Copy, Clone)]
pub struct HhdmPhysMapper;

impl HhdmPhysMapper {
    /// Direct-map address of `pa`.
    #[inline]
    #[must_use]
    pub const fn virt(pa: PhysicalAddress) -> VirtualAddress {
        VirtualAddress::new(HHDM_BASE + pa.as_u64())
    }
}

impl PhysMapper for HhdmPhysMapper {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        let ptr = Self::virt(pa).as_mut_ptr::<T>();
        // SAFETY: the caller guarantees `pa` is RAM covered by the direct map.
        unsafe { &mut *ptr }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_map_is_an_offset() {
        let va = HhdmPhysMapper::virt(PhysicalAddress::new(0x1000));
        assert_eq!(va.as_u64(), HHDM_BASE + 0x1000);
        assert_eq!(va.pml4_index(), (HHDM_BASE >> 39) as usize & 0x1ff);
    }
}
