//! # Virtual Memory Support
//!
//! x86-64 4-level paging for the kernel: typed page-table entries, a
//! PML4-rooted [`AddressSpace`] that walks, builds and tears down the table
//! hierarchy, and the three seams the algorithms are written against:
//!
//! - [`FrameAlloc`]: where page-table frames come from,
//! - [`PhysMapper`]: how a physical frame is reached from the current address space,
//! - [`Mmu`]: the hardware side (active root, root switches, TLB invalidation).
//!
//! The kernel plugs in the bitmap frame allocator, the HHDM mapper and
//! [`X86Mmu`]; host tests plug in simulated RAM and a recording MMU (feature
//! `test-support`).
//!
//! ## x86-64 Virtual Address → Physical Address Walk
//!
//! ```text
//! | 47‒39 | 38‒30 | 29‒21 | 20‒12 | 11‒0   |
//! |  PML4 |  PDPT |   PD  |   PT  | Offset |
//! ```
//!
//! ```text
//!  PML4  →  PDPT  →  PD  →  PT  →  Physical Page
//!   │        │        │        │
//!   │        │        │        └───► PTE   (Page Table Entry)  → maps 4 KiB page
//!   │        │        └────────────► PDE   (Page Directory Entry)
//!   │        └─────────────────────► PDPTE (Page Directory Pointer Table Entry)
//!   └──────────────────────────────► PML4E (Page Map Level 4 Entry)
//! ```
//!
//! ### Shared and private halves
//!
//! PML4 slots below [`SHARED_PML4_INDEX`](info::SHARED_PML4_INDEX) belong to
//! the owning process; intermediate tables below them are created lazily and
//! freed with the address space. Slots from the split upward point at PDPTs
//! created once at boot and copied by value into every new root, so kernel
//! mappings are global.

#![cfg_attr(not(test), no_std)]
#![allow(unsafe_code, clippy::inline_always)]

pub mod address_space;
mod mmu;
mod page_table;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

extern crate alloc;

pub use crate::address_space::{AddressSpace, MapError};
pub use crate::mmu::Mmu;
#[cfg(target_arch = "x86_64")]
pub use crate::mmu::{Cr3, X86Mmu};
pub use crate::page_table::{ENTRIES_PER_TABLE, PageTable, PageTableEntry};
use kernel_memory_addresses::{PhysicalAddress, PhysicalFrame};

/// Re-export constants as info module.
pub use kernel_info::memory as info;

bitflags::bitflags! {
    /// Options for a single 4 KiB leaf mapping.
    ///
    /// A mapping request without [`PRESENT`](Self::PRESENT) removes the mapping.
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
    pub struct PageOptions: u8 {
        /// Page is present in physical memory.
        const PRESENT       = 1 << 0;

        /// Page is writable.
        const WRITABLE      = 1 << 1;

        /// Page is accessible from user mode (CPL=3).
        const USER          = 1 << 2;

        /// Page is not executable (requires `EFER.NXE`).
        const NO_EXECUTE    = 1 << 3;

        /// Translation survives CR3 reloads (kernel mappings).
        const GLOBAL        = 1 << 4;

        /// Read-only view of a frame shared copy-on-write.
        const COPY_ON_WRITE = 1 << 5;
    }
}

/// Minimal frame allocator used to obtain **physical** 4 KiB frames
/// for page tables.
///
/// Returned frames **must** be 4 KiB aligned; their contents are undefined.
pub trait FrameAlloc {
    /// Allocate one frame, or `None` when physical memory is exhausted.
    fn alloc_frame(&mut self) -> Option<PhysicalFrame>;

    /// Return a frame obtained from [`alloc_frame`](Self::alloc_frame).
    fn free_frame(&mut self, frame: PhysicalFrame);
}

/// Converts physical addresses to *temporarily* usable pointers in the current
/// virtual address space (e.g., via a higher-half direct map, HHDM).
///
/// # Safety
/// - You must ensure `pa` is mapped as writable in the current page tables
///   for `&mut T`.
/// - Lifetime `'a` is purely borrow-checked; the mapping must remain valid
///   for `'a`.
/// - Type `T` must match the bytes at `pa` (no aliasing UB).
pub trait PhysMapper {
    /// Convert a *physical* address to a usable mutable reference.
    ///
    /// # Safety
    /// See the trait documentation.
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T;

    /// Convert a physically contiguous range of `len` values of `T` to a slice.
    ///
    /// # Safety
    /// As [`phys_to_mut`](Self::phys_to_mut), for the whole range.
    unsafe fn phys_slice_mut<'a, T>(&self, pa: PhysicalAddress, len: usize) -> &'a mut [T] {
        let first: &mut T = unsafe { self.phys_to_mut(pa) };
        unsafe { core::slice::from_raw_parts_mut(core::ptr::from_mut(first), len) }
    }
}

/// View the frame at `frame` as a page table.
///
/// # Safety
/// `frame` must hold a page table (or be about to be initialized as one).
#[inline]
pub(crate) unsafe fn table_mut<'a, M: PhysMapper>(m: &M, frame: PhysicalFrame) -> &'a mut PageTable {
    unsafe { m.phys_to_mut::<PageTable>(frame.base()) }
}

/// View the frame at `frame` as raw bytes.
///
/// # Safety
/// Nothing else may hold a typed reference into `frame` for `'a`.
#[inline]
pub unsafe fn frame_bytes<'a, M: PhysMapper>(m: &M, frame: PhysicalFrame) -> &'a mut [u8; 4096] {
    unsafe { m.phys_to_mut::<[u8; 4096]>(frame.base()) }
}
