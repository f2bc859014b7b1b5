//! Host-side stand-ins for physical memory and the MMU.
//!
//! Only built for tests and with the `test-support` feature; downstream
//! crates enable the feature in their `[dev-dependencies]`.

use crate::{FrameAlloc, Mmu, PhysMapper};
use alloc::boxed::Box;
use alloc::vec::Vec;
use core::cell::{Cell, RefCell, UnsafeCell};
use kernel_info::boot::{MemoryMapEntry, MemoryRegionKind};
use kernel_memory_addresses::{FRAME_SIZE, PhysicalAddress, PhysicalFrame, VirtualPage};

/// A 4 KiB-aligned raw frame of simulated RAM.
#[repr(C, align(4096))]
struct Frame(UnsafeCell<[u8; 4096]>);

/// Simulated physical memory.
///
/// Physical addresses are byte offsets from 0 into a contiguous run of
/// 4 KiB-aligned frames, so ranges spanning several frames are contiguous
/// just like they are through a real direct map.
pub struct TestPhys {
    frames: Box<[Frame]>,
}

impl TestPhys {
    /// `n` zeroed frames at physical addresses `0..n * 4096`.
    #[must_use]
    pub fn with_frames(n: usize) -> Self {
        let frames = (0..n)
            .map(|_| Frame(UnsafeCell::new([0u8; 4096])))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self { frames }
    }

    #[must_use]
    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    /// Size of the simulated RAM in bytes.
    #[must_use]
    pub fn len_bytes(&self) -> u64 {
        self.frames.len() as u64 * FRAME_SIZE
    }

    /// A memory map entry describing all of the simulated RAM as usable.
    #[must_use]
    pub fn usable_region(&self) -> MemoryMapEntry {
        MemoryMapEntry::new(0, self.len_bytes(), MemoryRegionKind::Usable)
    }
}

impl TestPhys {
    #[allow(clippy::cast_possible_truncation)]
    #[allow(clippy::cast_possible_truncation)]
    fn checked_ptr(&self, pa: PhysicalAddress, bytes: u64) -> *mut u8 {
        let offset = pa.as_u64();
        assert!(
            offset.checked_add(bytes).is_some_and(|end| end <= self.len_bytes()),
            "{pa} (+{bytes:#x}) outside simulated RAM"
        );
        let base = self.frames.as_ptr().cast::<u8>().cast_mut();
        // SAFETY: in bounds (checked above).
        unsafe { base.add(offset as usize) }
    }
}

impl PhysMapper for TestPhys {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        let ptr = self.checked_ptr(pa, size_of::<T>() as u64);
        // SAFETY: the frames live in `UnsafeCell`s and the caller promises
        // `T` matches the bytes.
        unsafe { &mut *ptr.cast::<T>() }
    }

    unsafe fn phys_slice_mut<'a, T>(&self, pa: PhysicalAddress, len: usize) -> &'a mut [T] {
        let ptr = self.checked_ptr(pa, (size_of::<T>() * len) as u64);
        // SAFETY: as above, for the whole range.
        unsafe { core::slice::from_raw_parts_mut(ptr.cast::<T>(), len) }
    }
}

/// A trivial **bump** allocator over a frame range that records frees.
pub struct BumpFrameAlloc {
    next: u64,
    end: u64,
    allocated: usize,
    freed: Vec<PhysicalFrame>,
}

impl BumpFrameAlloc {
    /// Hand out `count` frames starting at `first`.
    #[must_use]
    pub const fn new(first: PhysicalFrame, count: u64) -> Self {
        Self {
            next: first.number(),
            end: first.number() + count,
            allocated: 0,
            freed: Vec::new(),
        }
    }

    /// Allow at most `total` successful allocations over the allocator's lifetime.
    pub fn limit(&mut self, total: usize) {
        let remaining = total.saturating_sub(self.allocated) as u64;
        self.end = self.end.min(self.next + remaining);
    }

    #[must_use]
    pub const fn allocated(&self) -> usize {
        self.allocated
    }

    #[must_use]
    pub fn freed(&self) -> &[PhysicalFrame] {
        &self.freed
    }
}

impl FrameAlloc for BumpFrameAlloc {
    fn alloc_frame(&mut self) -> Option<PhysicalFrame> {
        if self.next >= self.end {
            return None;
        }
        let frame = PhysicalFrame::from_number(self.next);
        self.next += 1;
        self.allocated += 1;
        Some(frame)
    }

    fn free_frame(&mut self, frame: PhysicalFrame) {
        self.freed.push(frame);
    }
}

/// An [`Mmu`] that records what the memory manager asked of the hardware.
#[derive(Default)]
pub struct MockMmu {
    active: Cell<PhysicalFrame>,
    switches: RefCell<Vec<PhysicalFrame>>,
    invalidations: RefCell<Vec<VirtualPage>>,
    flushes: Cell<usize>,
}

impl MockMmu {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every root passed to [`Mmu::switch_root`], in order.
    #[must_use]
    pub fn switches(&self) -> Vec<PhysicalFrame> {
        self.switches.borrow().clone()
    }

    /// Every page passed to [`Mmu::invalidate_page`], in order.
    #[must_use]
    pub fn invalidations(&self) -> Vec<VirtualPage> {
        self.invalidations.borrow().clone()
    }

    #[must_use]
    pub fn flushes(&self) -> usize {
        self.flushes.get()
    }

    /// Forget recorded calls; the active root stays.
    pub fn clear(&self) {
        self.switches.borrow_mut().clear();
        self.invalidations.borrow_mut().clear();
        self.flushes.set(0);
    }
}

impl Mmu for MockMmu {
    fn active_root(&self) -> PhysicalFrame {
        self.active.get()
    }

    fn switch_root(&self, root: PhysicalFrame) {
        self.active.set(root);
        self.switches.borrow_mut().push(root);
    }

    fn invalidate_page(&self, page: VirtualPage) {
        self.invalidations.borrow_mut().push(page);
    }

    fn flush_all(&self) {
        self.flushes.set(self.flushes.get() + 1);
    }
}
