//! # Bitmap Physical Frame Allocator
//!
//! One bit per 4 KiB frame, one bitmap per usable region of the boot memory
//! map. A set bit means *used*.
//!
//! The bitmaps themselves live in physical memory carved from the first
//! usable region that is large enough to hold all of them; those frames are
//! marked used during construction, so the allocator needs no heap.
//!
//! ## Allocation
//!
//! [`BitmapFrameAlloc::try_allocate_pages`] looks for `count` contiguous free
//! bits, region by region:
//!
//! 1. probe the region's *hint* word; a population count rejects words that
//!    cannot possibly hold the request,
//! 2. scan forward from the hint to the end of the region,
//! 3. wrap and scan from the start of the region up to the hint.
//!
//! When the word under the hint becomes full the hint moves on to the next
//! word that still has a free bit, which keeps repeated small allocations
//! amortized O(1).

use kernel_info::boot::MemoryMapEntry;
use kernel_memory_addresses::{FRAME_SIZE, PhysicalAddress, PhysicalFrame, align_down, align_up};
use kernel_vmem::{FrameAlloc, PhysMapper};

/// Largest run a single call may request. Asking for more is a kernel bug.
pub const MAX_FRAMES_PER_ALLOCATION: usize = 64;

/// Usable regions beyond this count are ignored (and logged).
pub const MAX_FRAME_REGIONS: usize = 32;

const BITS: u64 = u64::BITS as u64;

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum FrameAllocError {
    #[error("no run of {count} free frames left")]
    Exhausted { count: usize },
    #[error("the memory map contains no usable memory")]
    NoUsableMemory,
    #[error("no usable region can hold the {frames} bitmap frames")]
    NoBootstrapRegion { frames: u64 },
}

/// Bookkeeping for one contiguous usable range.
struct FrameRegion<'m> {
    first: PhysicalFrame,
    frames: u64,
    bitmap: &'m mut [u64],
    /// Index of the bitmap word to probe first.
    hint: usize,
    free: u64,
}

impl<'m> FrameRegion<'m> {
    fn new(first: PhysicalFrame, frames: u64, bitmap: &'m mut [u64]) -> Self {
        bitmap.fill(0);
        // Padding bits past the last frame are permanently used.
        let tail = frames % BITS;
        if tail != 0
            && let Some(last) = bitmap.last_mut()
        {
            *last = !0 << tail;
        }
        Self {
            first,
            frames,
            bitmap,
            hint: 0,
            free: frames,
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    const fn words_for(frames: u64) -> usize {
        frames.div_ceil(BITS) as usize
    }

    fn contains(&self, frame: PhysicalFrame) -> bool {
        frame.number() >= self.first.number() && frame.number() < self.first.number() + self.frames
    }

    #[inline]
    #[allow(clippy::cast_possible_truncation)]
    fn is_used(&self, bit: u64) -> bool {
        self.bitmap[(bit / BITS) as usize] & (1 << (bit % BITS)) != 0
    }

    #[inline]
    #[allow(clippy::cast_possible_truncation)]
    fn set(&mut self, bit: u64, used: bool) {
        let word = &mut self.bitmap[(bit / BITS) as usize];
        if used {
            *word |= 1 << (bit % BITS);
        } else {
            *word &= !(1 << (bit % BITS));
        }
    }

    /// First bit of a free run of `count` bits that *starts* in
    /// `[from, until)`. The run itself may extend past `until`.
    #[allow(clippy::cast_possible_truncation)]
    fn find_run(&self, from: u64, until: u64, count: u64) -> Option<u64> {
        let mut run = 0;
        let mut start = from;
        let mut bit = from;
        while bit < self.frames {
            if run == 0 && bit >= until {
                return None;
            }
            let word = self.bitmap[(bit / BITS) as usize];
            let aligned = bit % BITS == 0;

            if aligned && word == u64::MAX {
                run = 0;
                bit += BITS;
                continue;
            }
            if aligned && word == 0 {
                if run == 0 {
                    start = bit;
                }
                run += BITS;
                if run >= count {
                    return Some(start);
                }
                bit += BITS;
                continue;
            }

            if self.is_used(bit) {
                run = 0;
            } else {
                if run == 0 {
                    start = bit;
                }
                run += 1;
                if run >= count {
                    return Some(start);
                }
            }
            bit += 1;
        }
        None
    }

    #[allow(clippy::cast_possible_truncation)]
    fn allocate(&mut self, count: u64) -> Option<PhysicalFrame> {
        if self.free < count {
            return None;
        }

        let hint_bit = self.hint as u64 * BITS;
        let probe = u64::from((!self.bitmap[self.hint]).count_ones());
        let fast = if probe >= count {
            self.find_run(hint_bit, hint_bit + BITS, count)
        } else {
            None
        };

        let start = fast
            .or_else(|| self.find_run(hint_bit, self.frames, count))
            .or_else(|| self.find_run(0, hint_bit, count))?;

        for bit in start..start + count {
            self.set(bit, true);
        }
        self.free -= count;

        if self.bitmap[self.hint] == u64::MAX {
            self.advance_hint(((start + count) / BITS) as usize);
        }
        Some(self.first + start)
    }

    /// Move the hint to the first word at or after `from` (wrapping) that
    /// still has a free bit. Stays put if the region is full.
    fn advance_hint(&mut self, from: usize) {
        let words = self.bitmap.len();
        for i in 0..words {
            let word = (from + i) % words;
            if self.bitmap[word] != u64::MAX {
                self.hint = word;
                return;
            }
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn free(&mut self, first: PhysicalFrame, count: u64) {
        let start = first.number() - self.first.number();
        for bit in start..start + count {
            if self.is_used(bit) {
                self.set(bit, false);
                self.free += 1;
            } else {
                log::warn!("double free of frame {} ignored", self.first + bit);
            }
        }
        if self.bitmap[self.hint] == u64::MAX {
            self.hint = (start / BITS) as usize;
        }
    }
}

/// Physical frame allocator backed by per-region bitmaps.
pub struct BitmapFrameAlloc<'m> {
    regions: [Option<FrameRegion<'m>>; MAX_FRAME_REGIONS],
    len: usize,
}

impl<'m> BitmapFrameAlloc<'m> {
    /// Build the allocator from the boot memory map.
    ///
    /// Only [`MemoryRegionKind::Usable`](kernel_info::boot::MemoryRegionKind::Usable)
    /// entries are managed; partial frames at their edges are dropped.
    ///
    /// # Safety
    /// Every usable region must be unused RAM reachable through `mapper` for
    /// `'m`. The frames holding the bitmaps are written immediately.
    ///
    /// # Errors
    /// - [`FrameAllocError::NoUsableMemory`] if no usable frame exists.
    /// - [`FrameAllocError::NoBootstrapRegion`] if no single region can hold
    ///   every bitmap and still have a frame left over.
    pub unsafe fn new<M: PhysMapper>(
        mapper: &M,
        memory_map: &[MemoryMapEntry],
    ) -> Result<Self, FrameAllocError> {
        let mut ranges = [(PhysicalFrame::default(), 0u64); MAX_FRAME_REGIONS];
        let mut len = 0;
        for entry in memory_map.iter().filter(|e| e.kind.is_usable()) {
            let start = align_up(entry.base, FRAME_SIZE);
            let end = align_down(entry.end(), FRAME_SIZE);
            if end <= start {
                continue;
            }
            if len == MAX_FRAME_REGIONS {
                log::warn!("ignoring usable memory at {start:#x}..{end:#x}: too many regions");
                continue;
            }
            let first = PhysicalFrame::containing_address(PhysicalAddress::new(start));
            ranges[len] = (first, (end - start) / FRAME_SIZE);
            len += 1;
        }
        let ranges = &ranges[..len];
        if ranges.is_empty() {
            return Err(FrameAllocError::NoUsableMemory);
        }

        let words: usize = ranges.iter().map(|&(_, n)| FrameRegion::words_for(n)).sum();
        let bitmap_frames = (words as u64 * 8).div_ceil(FRAME_SIZE);
        let bootstrap = ranges
            .iter()
            .position(|&(_, n)| n > bitmap_frames)
            .ok_or(FrameAllocError::NoBootstrapRegion {
                frames: bitmap_frames,
            })?;

        let storage_base = ranges[bootstrap].0.base();
        // SAFETY: the caller hands us the usable regions; the bootstrap
        // region is large enough for `words` (checked above).
        let mut storage: &'m mut [u64] = unsafe { mapper.phys_slice_mut(storage_base, words) };

        let mut regions = [const { None }; MAX_FRAME_REGIONS];
        for (slot, &(first, frames)) in regions.iter_mut().zip(ranges) {
            let (bitmap, rest) = core::mem::take(&mut storage).split_at_mut(FrameRegion::words_for(frames));
            storage = rest;
            *slot = Some(FrameRegion::new(first, frames, bitmap));
        }

        let mut this = Self { regions, len };
        if let Some(region) = this.regions[bootstrap].as_mut() {
            for bit in 0..bitmap_frames {
                region.set(bit, true);
            }
            region.free -= bitmap_frames;
            region.advance_hint(0);
        }

        log::debug!(
            "frame allocator: {} regions, {} frames, {} bitmap frames at {}",
            len,
            this.total_frames(),
            bitmap_frames,
            storage_base
        );
        Ok(this)
    }

    fn regions(&self) -> impl Iterator<Item = &FrameRegion<'m>> {
        self.regions[..self.len].iter().flatten()
    }

    fn regions_mut(&mut self) -> impl Iterator<Item = &mut FrameRegion<'m>> {
        self.regions[..self.len].iter_mut().flatten()
    }

    /// Allocate `count` physically contiguous frames.
    ///
    /// # Panics
    /// If `count` is zero or larger than [`MAX_FRAMES_PER_ALLOCATION`].
    ///
    /// # Errors
    /// [`FrameAllocError::Exhausted`] if no region has a long enough free run.
    pub fn try_allocate_pages(&mut self, count: usize) -> Result<PhysicalAddress, FrameAllocError> {
        assert!(
            count > 0 && count <= MAX_FRAMES_PER_ALLOCATION,
            "cannot allocate {count} frames at once (limit {MAX_FRAMES_PER_ALLOCATION})"
        );
        for region in self.regions_mut() {
            if let Some(frame) = region.allocate(count as u64) {
                log::trace!("allocated {count} frame(s) at {frame}");
                return Ok(frame.base());
            }
        }
        log::debug!("no run of {count} free frames");
        Err(FrameAllocError::Exhausted { count })
    }

    /// Allocate `count` physically contiguous frames for the kernel.
    ///
    /// # Panics
    /// On an invalid `count` or when physical memory is exhausted; both are
    /// unrecoverable for kernel-space requests.
    pub fn allocate_pages(&mut self, count: usize) -> PhysicalAddress {
        match self.try_allocate_pages(count) {
            Ok(pa) => pa,
            Err(e) => {
                log::error!("{e}");
                panic!("physical memory exhausted: {e}");
            }
        }
    }

    /// Return `count` frames starting at `addr`.
    ///
    /// Unaligned or unowned addresses and frames that are already free are
    /// logged and ignored.
    pub fn free_pages(&mut self, addr: PhysicalAddress, count: usize) {
        if !addr.is_frame_aligned() {
            log::warn!("free of unaligned address {addr} ignored");
            return;
        }
        let first = addr.frame();
        let last = first + (count as u64).saturating_sub(1);
        match self.regions_mut().find(|r| r.contains(first)) {
            Some(region) if region.contains(last) => {
                region.free(first, count as u64);
                log::trace!("freed {count} frame(s) at {addr}");
            }
            Some(_) => log::warn!("free of {count} frames at {addr} crosses a region end, ignored"),
            None => log::warn!("free of {addr} not owned by the frame allocator, ignored"),
        }
    }

    /// Whether `addr` lies in a region managed by this allocator.
    #[must_use]
    pub fn owns(&self, addr: PhysicalAddress) -> bool {
        self.regions().any(|r| r.contains(addr.frame()))
    }

    /// Whether the frame containing `addr` is currently allocated.
    #[must_use]
    pub fn is_allocated(&self, addr: PhysicalAddress) -> bool {
        let frame = addr.frame();
        self.regions()
            .find(|r| r.contains(frame))
            .is_some_and(|r| r.is_used(frame.number() - r.first.number()))
    }

    #[must_use]
    pub fn total_frames(&self) -> u64 {
        self.regions().map(|r| r.frames).sum()
    }

    #[must_use]
    pub fn free_frames(&self) -> u64 {
        self.regions().map(|r| r.free).sum()
    }

    #[must_use]
    pub fn used_frames(&self) -> u64 {
        self.total_frames() - self.free_frames()
    }
}

impl FrameAlloc for BitmapFrameAlloc<'_> {
    fn alloc_frame(&mut self) -> Option<PhysicalFrame> {
        self.try_allocate_pages(1).ok().map(PhysicalAddress::frame)
    }

    fn free_frame(&mut self, frame: PhysicalFrame) {
        self.free_pages(frame.base(), 1);
    }
}
