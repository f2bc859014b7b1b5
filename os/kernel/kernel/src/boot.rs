//! Boot-time checks and the first process.
//!
//! The entry stub constructs the frame allocator and the [`Vmm`] from the
//! bootloader's hand-off (both need the HHDM mapper and the CPU, so they
//! live outside this crate), then builds a [`Kernel`] and calls
//! [`Kernel::spawn_init`] before [`Kernel::start`].
//!
//! [`Vmm`]: kernel_alloc::Vmm

use crate::{DebugSink, Kernel};
use kernel_info::boot::{MemoryMapEntry, MemoryRegionKind};
use kernel_memory_addresses::FRAME_SIZE;
use kernel_sched::{ProcessId, SchedError};
use kernel_vmem::{Mmu, PhysMapper};

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BootError {
    #[error("the memory map has no usable region")]
    NoUsableMemory,
    #[error("memory map entries at {0:#x} and {1:#x} overlap")]
    OverlappingRegions(u64, u64),
    #[error("failed to create the initial process: {0}")]
    Init(#[from] SchedError),
}

/// Byte totals of a memory map, by what the kernel may do with them.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct MemorySummary {
    pub regions: usize,
    pub usable_regions: usize,
    pub usable_bytes: u64,
    pub reclaimable_bytes: u64,
    pub reserved_bytes: u64,
}

impl MemorySummary {
    /// Summarize `map`, rejecting maps the frame allocator cannot work with.
    ///
    /// # Errors
    /// - [`BootError::NoUsableMemory`] if not a single whole frame is usable,
    /// - [`BootError::OverlappingRegions`] if two entries intersect.
    pub fn from_map(map: &[MemoryMapEntry]) -> Result<Self, BootError> {
        for (i, a) in map.iter().enumerate() {
            if let Some(b) = map[i + 1..]
                .iter()
                .find(|b| a.length != 0 && b.length != 0 && a.base < b.end() && b.base < a.end())
            {
                return Err(BootError::OverlappingRegions(a.base, b.base));
            }
        }

        let mut summary = Self {
            regions: map.len(),
            ..Self::default()
        };
        for entry in map {
            match entry.kind {
                MemoryRegionKind::Usable => {
                    summary.usable_regions += 1;
                    summary.usable_bytes += entry.length;
                }
                MemoryRegionKind::AcpiReclaimable | MemoryRegionKind::BootloaderReclaimable => {
                    summary.reclaimable_bytes += entry.length;
                }
                MemoryRegionKind::Reserved
                | MemoryRegionKind::AcpiNvs
                | MemoryRegionKind::BadMemory
                | MemoryRegionKind::KernelAndModules => summary.reserved_bytes += entry.length,
            }
        }
        if summary.usable_bytes < FRAME_SIZE {
            return Err(BootError::NoUsableMemory);
        }
        Ok(summary)
    }

    #[must_use]
    pub const fn usable_frames(&self) -> u64 {
        self.usable_bytes / FRAME_SIZE
    }

    pub fn log(&self) {
        log::info!(
            concat!(
                "Memory map:\n",
                "  regions     = {regions} ({usable_regions} usable)\n",
                "  usable      = {usable} KiB ({frames} frames)\n",
                "  reclaimable = {reclaimable} KiB\n",
                "  reserved    = {reserved} KiB"
            ),
            regions = self.regions,
            usable_regions = self.usable_regions,
            usable = self.usable_bytes / 1024,
            frames = self.usable_frames(),
            reclaimable = self.reclaimable_bytes / 1024,
            reserved = self.reserved_bytes / 1024,
        );
    }
}

impl<M: PhysMapper, H: Mmu, D: DebugSink> Kernel<'_, M, H, D> {
    /// Create the first user process from a raw image.
    ///
    /// # Errors
    /// [`BootError::Init`] if the image is empty or memory runs out.
    pub fn spawn_init(&mut self, name: &str, image: &[u8]) -> Result<ProcessId, BootError> {
        let pid = self.sched.create_process(name, image)?;
        log::info!("{pid} ({name}) is the initial process");
        Ok(pid)
    }
}
