//! # Kernel Boot Information

/// Kernel function pointer.
///
/// # ABI
/// The ABI is defined as `win64` since the kernel is called from a UEFI
/// (PE/COFF) application.
pub type KernelEntryFn = extern "win64" fn(*const KernelBootInfo) -> !;

/// Information the kernel needs right after the bootloader hands over control.
/// Keep this `#[repr(C)]` and prefer fixed-size integers at the ABI boundary.
#[repr(C)]
#[derive(Clone, Debug)]
pub struct KernelBootInfo {
    /// Pointer to an array of [`MemoryMapEntry`] values.
    pub mmap_ptr: u64,

    /// Number of entries (not bytes) behind [`mmap_ptr`](Self::mmap_ptr).
    pub mmap_len: u64,

    /// Kernel load and link addresses.
    pub kernel: KernelImage,
}

impl KernelBootInfo {
    /// View the memory map handed over by the bootloader.
    ///
    /// # Safety
    /// `mmap_ptr` must point to `mmap_len` initialized, properly aligned
    /// entries that stay valid (and unmodified) for the returned lifetime.
    #[allow(unsafe_code)]
    #[must_use]
    pub unsafe fn memory_map(&self) -> &[MemoryMapEntry] {
        if self.mmap_ptr == 0 || self.mmap_len == 0 {
            return &[];
        }
        let len = usize::try_from(self.mmap_len).unwrap_or(0);
        unsafe { core::slice::from_raw_parts(self.mmap_ptr as *const MemoryMapEntry, len) }
    }
}

/// Kind of a physical memory region.
#[repr(u32)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MemoryRegionKind {
    /// Free RAM the frame allocator may hand out.
    Usable = 0,
    /// Firmware or device reserved.
    Reserved = 1,
    /// ACPI tables; reclaimable once parsed.
    AcpiReclaimable = 2,
    /// ACPI non-volatile storage.
    AcpiNvs = 3,
    /// Defective RAM.
    BadMemory = 4,
    /// The kernel image and boot modules.
    KernelAndModules = 5,
    /// Memory the bootloader used; contains the boot page tables and the memory map itself.
    BootloaderReclaimable = 6,
}

impl MemoryRegionKind {
    /// Whether the frame allocator manages regions of this kind.
    #[inline]
    #[must_use]
    pub const fn is_usable(self) -> bool {
        matches!(self, Self::Usable)
    }

    /// Whether the kernel's direct map covers regions of this kind.
    #[inline]
    #[must_use]
    pub const fn is_direct_mapped(self) -> bool {
        matches!(
            self,
            Self::Usable | Self::BootloaderReclaimable | Self::KernelAndModules | Self::AcpiReclaimable
        )
    }
}

/// One physical memory region reported by the bootloader.
#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MemoryMapEntry {
    /// Physical base address.
    pub base: u64,
    /// Length in bytes.
    pub length: u64,
    /// What the region may be used for.
    pub kind: MemoryRegionKind,
}

impl MemoryMapEntry {
    #[must_use]
    pub const fn new(base: u64, length: u64, kind: MemoryRegionKind) -> Self {
        Self { base, length, kind }
    }

    /// Exclusive end address, saturating at `u64::MAX`.
    #[inline]
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.base.saturating_add(self.length)
    }
}

/// Where the kernel image lives.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct KernelImage {
    /// Physical load address (LMA).
    pub phys_base: u64,
    /// Virtual link address (VMA), normally [`KERNEL_BASE`](crate::memory::KERNEL_BASE).
    pub virt_base: u64,
    /// Image size in bytes.
    pub size: u64,
}

#[cfg(test)]
#[allow(unsafe_code)]
mod tests {
    use super::*;

    #[test]
    fn empty_memory_map_is_empty() {
        let info = KernelBootInfo {
            mmap_ptr: 0,
            mmap_len: 3,
            kernel: KernelImage::default(),
        };
        assert!(unsafe { info.memory_map() }.is_empty());
    }

    #[test]
    fn memory_map_reads_entries() {
        let entries = [
            MemoryMapEntry::new(0, 0x1000, MemoryRegionKind::Reserved),
            MemoryMapEntry::new(0x10_0000, 0x20_0000, MemoryRegionKind::Usable),
        ];
        let info = KernelBootInfo {
            mmap_ptr: entries.as_ptr() as u64,
            mmap_len: entries.len() as u64,
            kernel: KernelImage::default(),
        };
        let map = unsafe { info.memory_map() };
        assert_eq!(map, &entries);
        assert_eq!(map[1].end(), 0x30_0000);
        assert!(map[1].kind.is_usable());
        assert!(!map[0].kind.is_direct_mapped());
    }
}
