//! Page-table entries and 512-entry tables.
//!
//! All four levels (PML4, PDPT, PD, PT) share the same entry layout; this
//! kernel never creates large pages, so every non-leaf entry points at the
//! next table and every PT entry maps exactly one 4 KiB frame.

use crate::PageOptions;
use bitfield_struct::bitfield;
use kernel_memory_addresses::{PhysicalAddress, PhysicalFrame};

/// Number of entries in one page table.
pub const ENTRIES_PER_TABLE: usize = 512;

/// Represents a single 64-bit x86-64 page table entry in its raw bitfield form.
///
/// ### Bit layout
///
/// | Bits      | Name / Mnemonic   | Meaning |
/// |-----------|-------------------|----------|
/// | 0         | `P` (present)     | Valid entry if set |
/// | 1         | `RW`              | Writable if set |
/// | 2         | `US`              | User-mode accessible if set |
/// | 3         | `PWT`             | Write-through caching |
/// | 4         | `PCD`             | Disable caching |
/// | 5         | `A`               | Accessed |
/// | 6         | `D`               | Dirty (leaf only) |
/// | 7         | `PS`              | Large page flag |
/// | 8         | `G`               | Global (leaf only) |
/// | 9         | OS: CoW           | Leaf is shared copy-on-write |
/// | 10–11     | OS avail low      | Reserved for OS use |
/// | 12–51     | `addr`            | Physical frame bits [51:12] |
/// | 52–58     | OS avail high     | Reserved for OS use |
/// | 59–62     | `PKU` / OS use    | Protection key or OS use |
/// | 63        | `NX`              | Execute disable |
///
/// ```rust
/// # use kernel_memory_addresses::PhysicalFrame;
/// # use kernel_vmem::{PageOptions, PageTableEntry};
/// let frame = PhysicalFrame::from_number(0x42);
/// let e = PageTableEntry::leaf(frame, PageOptions::PRESENT | PageOptions::WRITABLE);
/// assert!(e.present() && e.writable() && !e.user_access());
/// assert_eq!(e.frame(), Some(frame));
/// ```
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct PageTableEntry {
    /// Present (P, bit 0).
    pub present: bool,

    /// Writable (RW, bit 1).
    ///
    /// Clear for read-only. Supervisor writes honor this only with `CR0.WP`.
    pub writable: bool,

    /// User/Supervisor (US, bit 2).
    ///
    /// Permissions are the intersection over the walk, so the bit must be
    /// set on every level for a user mapping.
    pub user_access: bool,

    /// Page Write-Through (PWT, bit 3).
    pub write_through: bool,

    /// Page Cache Disable (PCD, bit 4).
    pub cache_disabled: bool,

    /// Accessed (A, bit 5). Set by the CPU.
    pub accessed: bool,

    /// Dirty (D, bit 6) — **leaf only**. Set by the CPU.
    pub dirty: bool,

    /// Large Page / Page Size (PS, bit 7).
    ///
    /// Never set by this kernel; walks treat it as an unsupported entry.
    pub large_page: bool,

    /// Global (G, bit 8) — **leaf only**.
    pub global_translation: bool,

    /// Copy-on-write marker (bit 9, ignored by hardware).
    ///
    /// Set on read-only leaves whose frame is shared with another address
    /// space; a write fault on such a page is resolved instead of fatal.
    pub copy_on_write: bool,

    /// OS-available (bits 10..=11).
    #[bits(2)]
    pub os_available_low: u8,

    /// Physical address bits [51:12] (bits 12..=51).
    #[bits(40)]
    phys_addr_bits_51_12: u64,

    /// OS-available (bits 52..=58).
    #[bits(7)]
    pub os_available_high: u8,

    /// Protection Key (PKU, bits 59..=62) if supported; otherwise OS use.
    #[bits(4)]
    pub protection_key: u8,

    /// No-Execute (NX, bit 63) — Execute Disable.
    pub no_execute: bool,
}

impl PageTableEntry {
    /// An all-zero (not present) entry.
    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self::new()
    }

    /// A leaf entry mapping `frame` with the given options.
    #[inline]
    #[must_use]
    pub const fn leaf(frame: PhysicalFrame, options: PageOptions) -> Self {
        let mut e = Self::new()
            .with_present(options.contains(PageOptions::PRESENT))
            .with_writable(options.contains(PageOptions::WRITABLE))
            .with_user_access(options.contains(PageOptions::USER))
            .with_global_translation(options.contains(PageOptions::GLOBAL))
            .with_copy_on_write(options.contains(PageOptions::COPY_ON_WRITE))
            .with_no_execute(options.contains(PageOptions::NO_EXECUTE));
        e.set_physical_address(frame.base());
        e
    }

    /// A non-leaf entry pointing at the next-level table in `frame`.
    ///
    /// Intermediate levels are always writable; the leaf decides. `user`
    /// must be set if any leaf below is user accessible.
    #[inline]
    #[must_use]
    pub const fn table(frame: PhysicalFrame, user: bool) -> Self {
        let mut e = Self::new()
            .with_present(true)
            .with_writable(true)
            .with_user_access(user);
        e.set_physical_address(frame.base());
        e
    }

    #[inline]
    pub const fn set_physical_address(&mut self, phys: PhysicalAddress) {
        // store bits [51:12]
        self.set_phys_addr_bits_51_12(phys.as_u64() >> 12);
    }

    #[inline]
    #[must_use]
    pub const fn physical_address(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.phys_addr_bits_51_12() << 12)
    }

    /// The referenced frame, if the entry is present.
    #[inline]
    #[must_use]
    pub const fn frame(&self) -> Option<PhysicalFrame> {
        if self.present() {
            Some(PhysicalFrame::containing_address(self.physical_address()))
        } else {
            None
        }
    }

    /// The [`PageOptions`] encoded in this entry.
    #[must_use]
    pub fn options(&self) -> PageOptions {
        let mut o = PageOptions::empty();
        o.set(PageOptions::PRESENT, self.present());
        o.set(PageOptions::WRITABLE, self.writable());
        o.set(PageOptions::USER, self.user_access());
        o.set(PageOptions::GLOBAL, self.global_translation());
        o.set(PageOptions::COPY_ON_WRITE, self.copy_on_write());
        o.set(PageOptions::NO_EXECUTE, self.no_execute());
        o
    }
}

/// A 4 KiB aligned page table of any level.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageTableEntry; ENTRIES_PER_TABLE],
}

const _: () = assert!(size_of::<PageTable>() == 4096);

impl PageTable {
    #[inline]
    #[must_use]
    pub const fn get(&self, index: usize) -> PageTableEntry {
        self.entries[index]
    }

    #[inline]
    pub const fn set(&mut self, index: usize, entry: PageTableEntry) {
        self.entries[index] = entry;
    }

    /// Clear every entry.
    pub fn zero(&mut self) {
        self.entries.fill(PageTableEntry::zero());
    }

    /// Whether no entry is present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(|e| !e.present())
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, PageTableEntry)> + '_ {
        self.entries.iter().copied().enumerate()
    }
}
