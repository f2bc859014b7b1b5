//! The hardware side of paging: which root is loaded, switching roots and
//! keeping the TLB coherent with table edits.

use kernel_memory_addresses::{PhysicalFrame, VirtualPage};

/// Architecture hooks the memory manager needs from the CPU.
///
/// Everything else about page tables is plain memory manipulation through a
/// [`PhysMapper`](crate::PhysMapper) and can run without real hardware.
pub trait Mmu {
    /// Root (PML4) frame currently loaded.
    fn active_root(&self) -> PhysicalFrame;

    /// Load `root` as the active address space.
    ///
    /// The new root must map the code that is executing, the current stack
    /// and the direct map.
    fn switch_root(&self, root: PhysicalFrame);

    /// Drop any cached translation for `page`.
    fn invalidate_page(&self, page: VirtualPage);

    /// Drop all non-global cached translations.
    fn flush_all(&self);
}

#[cfg(target_arch = "x86_64")]
pub use x86::{Cr3, X86Mmu};

#[cfg(target_arch = "x86_64")]
mod x86 {
    use super::Mmu;
    use bitfield_struct::bitfield;
    use kernel_memory_addresses::{PhysicalAddress, PhysicalFrame, VirtualPage};

    /// CR3 — Page-Map Level-4 Base Register (IA-32e, PCID disabled).
    #[bitfield(u64)]
    pub struct Cr3 {
        /// Bits 0–2 — Reserved (must be 0).
        #[bits(3)]
        pub reserved0: u8,

        /// Bit 3 — PWT: Page-level Write-Through for PML4.
        pub pwt: bool,

        /// Bit 4 — PCD: Page-level Cache Disable for PML4.
        pub pcd: bool,

        /// Bits 5–11 — Reserved (must be 0 when written).
        #[bits(7)]
        pub reserved1: u8,

        /// Bits 12–51 — PML4 physical base >> 12.
        #[bits(40)]
        pml4_base_4k: u64,

        /// Bits 52–63 — Reserved.
        #[bits(12)]
        pub reserved2: u16,
    }

    impl Cr3 {
        /// A `Cr3` value selecting `root` with default caching.
        #[must_use]
        pub const fn from_root(root: PhysicalFrame) -> Self {
            Self::new().with_pml4_base_4k(root.number())
        }

        /// The PML4 frame encoded in this value.
        #[must_use]
        pub const fn root(&self) -> PhysicalFrame {
            PhysicalFrame::containing_address(PhysicalAddress::new(self.pml4_base_4k() << 12))
        }
    }

    /// [`Mmu`] backed by the real control registers.
    pub struct X86Mmu {
        _private: (),
    }

    impl X86Mmu {
        /// # Safety
        /// Must run at CPL0 with paging enabled. All methods execute privileged
        /// instructions.
        #[must_use]
        pub const unsafe fn new() -> Self {
            Self { _private: () }
        }

        fn read_cr3() -> Cr3 {
            let cr3: u64;
            // SAFETY: CPL0 is guaranteed by the constructor.
            unsafe {
                core::arch::asm!("mov {}, cr3", out(reg) cr3, options(nomem, nostack, preserves_flags));
            }
            Cr3::from_bits(cr3)
        }

        fn write_cr3(value: Cr3) {
            let cr3 = value.into_bits();
            // SAFETY: CPL0 is guaranteed by the constructor; the caller of
            // `switch_root` guarantees the new root maps the kernel.
            unsafe {
                core::arch::asm!("mov cr3, {}", in(reg) cr3, options(nostack, preserves_flags));
            }
        }
    }

    impl Mmu for X86Mmu {
        fn active_root(&self) -> PhysicalFrame {
            Self::read_cr3().root()
        }

        fn switch_root(&self, root: PhysicalFrame) {
            Self::write_cr3(Cr3::from_root(root));
        }

        #[inline]
        fn invalidate_page(&self, page: VirtualPage) {
            let va = page.base().as_u64();
            // SAFETY: CPL0 is guaranteed by the constructor.
            unsafe {
                core::arch::asm!("invlpg [{}]", in(reg) va, options(nostack, preserves_flags));
            }
        }

        fn flush_all(&self) {
            Self::write_cr3(Self::read_cr3());
        }
    }

}
