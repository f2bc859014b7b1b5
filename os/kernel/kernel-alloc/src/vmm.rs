//! # Virtual Memory Manager
//!
//! Owns the kernel's page-table root and the physical frame allocator handle,
//! and offers the address-space operations the scheduler and fault handlers
//! need:
//!
//! - single-page map/unmap/query in the active or any other root,
//! - creating and destroying per-process roots that share the kernel half,
//! - a page-granular kernel heap window (trap stacks, bookkeeping),
//! - backing, duplicating (copy-on-write) and releasing [`VmObject`]s,
//! - resolving a write fault on a copy-on-write page.
//!
//! All hardware interaction goes through the [`Mmu`] seam and all physical
//! memory access through the [`PhysMapper`] seam.
//!
//! # Example
//! ```ignore
//! let pm = SpinLock::new(unsafe { BitmapFrameAlloc::new(&mapper, memory_map)? });
//! let vmm = Vmm::init(&mapper, &mmu, &pm, memory_map, &boot_info.kernel)?;
//! let stack = vmm.allocate_pages(4);
//! ```

use crate::frame_alloc::{BitmapFrameAlloc, FrameAllocError};
use crate::region::VmObject;
use core::sync::atomic::Ordering;
use kernel_info::boot::{KernelImage, MemoryMapEntry};
use kernel_info::memory::{HHDM_BASE, KERNEL_HEAP_BASE, KERNEL_HEAP_END};
use kernel_memory_addresses::{FRAME_SIZE, PhysicalAddress, PhysicalFrame, VirtualAddress, VirtualPage, align_down, align_up};
use kernel_sync::SpinLock;
use kernel_vmem::{AddressSpace, FrameAlloc, MapError, Mmu, PageOptions, PageTableEntry, PhysMapper, frame_bytes};

/// Options of kernel heap and direct-map pages.
const KERNEL_DATA: PageOptions = PageOptions::PRESENT
    .union(PageOptions::WRITABLE)
    .union(PageOptions::NO_EXECUTE)
    .union(PageOptions::GLOBAL);

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum VmError {
    #[error("out of physical memory")]
    OutOfMemory,
    #[error("no free virtual range of {pages} pages")]
    AddressSpaceExhausted { pages: usize },
    #[error("{0} is not mapped")]
    NotMapped(VirtualAddress),
    #[error("{0} is not a copy-on-write page")]
    NotCopyOnWrite(VirtualAddress),
    #[error(transparent)]
    Map(MapError),
}

impl From<MapError> for VmError {
    fn from(value: MapError) -> Self {
        match value {
            MapError::OutOfMemory => Self::OutOfMemory,
            MapError::NotMapped(va) => Self::NotMapped(va),
            e @ MapError::LargePage(_) => Self::Map(e),
        }
    }
}

impl From<FrameAllocError> for VmError {
    fn from(_: FrameAllocError) -> Self {
        Self::OutOfMemory
    }
}

/// [`FrameAlloc`] that takes the allocator lock per frame, so the lock is
/// never held across a table walk.
struct LockedFrames<'a, 'm>(&'a SpinLock<BitmapFrameAlloc<'m>>);

impl FrameAlloc for LockedFrames<'_, '_> {
    fn alloc_frame(&mut self) -> Option<PhysicalFrame> {
        self.0.lock().alloc_frame()
    }

    fn free_frame(&mut self, frame: PhysicalFrame) {
        self.0.lock().free_frame(frame);
    }
}

/// The kernel's virtual memory manager.
pub struct Vmm<'m, M: PhysMapper, H: Mmu> {
    mapper: &'m M,
    mmu: &'m H,
    pm: &'m SpinLock<BitmapFrameAlloc<'m>>,
    kernel_root: PhysicalFrame,
    /// Where the next kernel heap search starts.
    heap_hint: SpinLock<VirtualPage>,
}

impl<'m, M: PhysMapper, H: Mmu> Vmm<'m, M, H> {
    /// Build the kernel address space and switch to it.
    ///
    /// Every shared-half PML4 slot receives an (empty) PDPT up front, so
    /// kernel mappings made later show up in every process. All RAM the
    /// memory map reports is mapped at `HHDM_BASE + pa`, the kernel image at
    /// its link address.
    ///
    /// # Errors
    /// [`VmError::OutOfMemory`] if the tables do not fit into physical memory.
    #[allow(clippy::cast_possible_truncation)]
    pub fn init(
        mapper: &'m M,
        mmu: &'m H,
        pm: &'m SpinLock<BitmapFrameAlloc<'m>>,
        memory_map: &[MemoryMapEntry],
        kernel: &KernelImage,
    ) -> Result<Self, VmError> {
        let mut frames = LockedFrames(pm);
        let aspace = AddressSpace::new_empty(mapper, &mut frames)?;
        let root = aspace.root();
        aspace.populate_shared_half(&mut frames)?;

        let mut direct = 0u64;
        for entry in memory_map.iter().filter(|e| e.kind.is_direct_mapped()) {
            let start = align_down(entry.base, FRAME_SIZE);
            let end = align_up(entry.end(), FRAME_SIZE);
            for pa in (start..end).step_by(FRAME_SIZE as usize) {
                let frame = PhysicalAddress::new(pa).frame();
                let page = VirtualAddress::new(HHDM_BASE + pa).page();
                aspace.map_page(&mut frames, page, frame, KERNEL_DATA)?;
                direct += 1;
            }
        }

        let image = PageOptions::PRESENT | PageOptions::WRITABLE | PageOptions::GLOBAL;
        for offset in (0..align_up(kernel.size, FRAME_SIZE)).step_by(FRAME_SIZE as usize) {
            let frame = PhysicalAddress::new(kernel.phys_base + offset).frame();
            let page = VirtualAddress::new(kernel.virt_base + offset).page();
            aspace.map_page(&mut frames, page, frame, image)?;
        }

        log::info!(
            "kernel address space at {root}: {direct} direct-mapped frames, {} image bytes",
            kernel.size
        );
        mmu.switch_root(root);

        Ok(Self {
            mapper,
            mmu,
            pm,
            kernel_root: root,
            heap_hint: SpinLock::new(VirtualAddress::new(KERNEL_HEAP_BASE).page()),
        })
    }

    #[inline]
    fn frames(&self) -> LockedFrames<'_, 'm> {
        LockedFrames(self.pm)
    }

    #[inline]
    fn aspace(&self, root: PhysicalFrame) -> AddressSpace<'m, M> {
        AddressSpace::from_root(self.mapper, root)
    }

    /// The physical frame allocator.
    #[must_use]
    pub const fn frame_allocator(&self) -> &'m SpinLock<BitmapFrameAlloc<'m>> {
        self.pm
    }

    #[must_use]
    pub const fn mapper(&self) -> &'m M {
        self.mapper
    }

    /// Root of the kernel address space built by [`init`](Self::init).
    #[must_use]
    pub const fn kernel_root(&self) -> PhysicalFrame {
        self.kernel_root
    }

    #[must_use]
    pub fn active_root(&self) -> PhysicalFrame {
        self.mmu.active_root()
    }

    /// Load `root` unless it is already active.
    pub fn switch_page_tables(&self, root: PhysicalFrame) {
        if self.mmu.active_root() != root {
            log::trace!("switching page tables to {root}");
            self.mmu.switch_root(root);
        }
    }

    /// Map `page → pa` in `root` (the active root if `None`).
    ///
    /// Options without [`PageOptions::PRESENT`] unmap the page. The TLB
    /// entry for `page` is invalidated in either case.
    ///
    /// # Panics
    /// If `pa` has bit 63 set.
    ///
    /// # Errors
    /// [`VmError::OutOfMemory`] if an intermediate table cannot be allocated;
    /// nothing was changed in that case.
    pub fn map_page(
        &self,
        pa: PhysicalAddress,
        page: VirtualPage,
        options: PageOptions,
        root: Option<PhysicalFrame>,
    ) -> Result<(), VmError> {
        assert_eq!(pa.as_u64() >> 63, 0, "physical address {pa} has the NX bit set");
        let root = root.unwrap_or_else(|| self.active_root());
        self.aspace(root).map_page(&mut self.frames(), page, pa.frame(), options)?;
        self.mmu.invalidate_page(page);
        Ok(())
    }

    /// Remove the mapping of `page` in `root`, returning its frame.
    ///
    /// # Errors
    /// [`VmError::Map`] if the walk hits a large page.
    pub fn unmap_page(&self, page: VirtualPage, root: Option<PhysicalFrame>) -> Result<Option<PhysicalFrame>, VmError> {
        let root = root.unwrap_or_else(|| self.active_root());
        let frame = self.aspace(root).unmap_page(page)?;
        self.mmu.invalidate_page(page);
        Ok(frame)
    }

    /// Translate `va` in the active address space.
    #[must_use]
    pub fn get_physical(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        self.translate_in(self.active_root(), va)
    }

    /// Translate `va` in the address space rooted at `root`.
    #[must_use]
    pub fn translate_in(&self, root: PhysicalFrame, va: VirtualAddress) -> Option<PhysicalAddress> {
        self.aspace(root).translate(va)
    }

    /// The present leaf for `page` in `root`.
    #[must_use]
    pub fn leaf_in(&self, root: PhysicalFrame, page: VirtualPage) -> Option<PageTableEntry> {
        self.aspace(root).leaf(page)
    }

    /// A fresh root sharing the kernel half of the active root.
    ///
    /// # Errors
    /// [`VmError::OutOfMemory`] if no frame is available.
    pub fn create_new_page_table(&self) -> Result<PhysicalFrame, VmError> {
        let aspace = AddressSpace::new_empty(self.mapper, &mut self.frames())?;
        aspace.copy_shared_half_from(self.active_root());
        log::debug!("new page table at {}", aspace.root());
        Ok(aspace.root())
    }

    /// Free the private tables of `root` and the root itself.
    ///
    /// Leaf frames are not touched; release the regions first.
    ///
    /// # Panics
    /// If `root` is the kernel root or currently active.
    pub fn destroy_page_table(&self, root: PhysicalFrame) {
        assert_ne!(root, self.kernel_root, "refusing to destroy the kernel page table");
        assert_ne!(root, self.active_root(), "refusing to destroy the active page table");
        let tables = self.aspace(root).destroy(&mut self.frames());
        log::debug!("destroyed page table at {root} ({tables} tables)");
    }

    /// Allocate one zeroed physical frame.
    ///
    /// # Errors
    /// [`VmError::OutOfMemory`] when physical memory is exhausted.
    pub fn allocate_frame(&self) -> Result<PhysicalFrame, VmError> {
        let frame = self.pm.lock().try_allocate_pages(1)?.frame();
        self.zero_frame(frame);
        Ok(frame)
    }

    pub fn free_frame(&self, frame: PhysicalFrame) {
        self.pm.lock().free_pages(frame.base(), 1);
    }

    pub fn zero_frame(&self, frame: PhysicalFrame) {
        // SAFETY: the frame is owned by the caller and reached through the mapper.
        unsafe { frame_bytes(self.mapper, frame) }.fill(0);
    }

    /// Copy 4 KiB from `src` to `dst` through the physical mapper.
    pub fn copy_frame(&self, src: PhysicalFrame, dst: PhysicalFrame) {
        debug_assert_ne!(src, dst);
        // SAFETY: distinct frames; the mapper gives each its own window.
        let from = unsafe { frame_bytes(self.mapper, src) };
        let to = unsafe { frame_bytes(self.mapper, dst) };
        to.copy_from_slice(from);
    }

    /// Allocate `count` zeroed, contiguous pages in the kernel heap window.
    ///
    /// # Errors
    /// - [`VmError::AddressSpaceExhausted`] if the window has no free run.
    /// - [`VmError::OutOfMemory`] if frames run out; nothing stays mapped.
    pub fn try_allocate_pages(&self, count: usize) -> Result<VirtualAddress, VmError> {
        assert!(count > 0, "zero-page kernel allocation");
        let mut hint = self.heap_hint.lock();
        let first = self
            .find_free_heap_range(*hint, count)
            .ok_or(VmError::AddressSpaceExhausted { pages: count })?;

        for i in 0..count {
            let page = first + i as u64;
            let mapped = self
                .allocate_frame()
                .and_then(|frame| match self.map_page(frame.base(), page, KERNEL_DATA, Some(self.kernel_root)) {
                    Ok(()) => Ok(()),
                    Err(e) => {
                        self.free_frame(frame);
                        Err(e)
                    }
                });
            if let Err(e) = mapped {
                for j in 0..i {
                    self.release_kernel_page(first + j as u64);
                }
                return Err(e);
            }
        }

        *hint = first + count as u64;
        log::trace!("kernel heap: {count} page(s) at {first}");
        Ok(first.base())
    }

    /// Allocate `count` zeroed kernel pages.
    ///
    /// # Panics
    /// When the heap window or physical memory is exhausted.
    pub fn allocate_pages(&self, count: usize) -> VirtualAddress {
        match self.try_allocate_pages(count) {
            Ok(va) => va,
            Err(e) => {
                log::error!("kernel page allocation of {count} failed: {e}");
                panic!("kernel page allocation failed: {e}");
            }
        }
    }

    /// Unmap and free `count` kernel heap pages starting at `addr`.
    ///
    /// # Panics
    /// If `addr` is not a page-aligned heap address.
    pub fn free_pages(&self, addr: VirtualAddress, count: usize) {
        assert!(
            addr.is_page_aligned() && (KERNEL_HEAP_BASE..KERNEL_HEAP_END).contains(&addr.as_u64()),
            "{addr} is not a kernel heap page"
        );
        let first = addr.page();
        for i in 0..count {
            self.release_kernel_page(first + i as u64);
        }
        let mut hint = self.heap_hint.lock();
        if first < *hint {
            *hint = first;
        }
    }

    fn release_kernel_page(&self, page: VirtualPage) {
        match self.unmap_page(page, Some(self.kernel_root)) {
            Ok(Some(frame)) => self.free_frame(frame),
            Ok(None) => log::warn!("kernel heap page {page} was not mapped"),
            Err(e) => log::warn!("kernel heap page {page}: {e}"),
        }
    }

    /// First run of `count` unmapped heap pages, searching from `hint` to the
    /// end of the window and then once from its start.
    #[allow(clippy::cast_possible_truncation)]
    fn find_free_heap_range(&self, hint: VirtualPage, count: usize) -> Option<VirtualPage> {
        let window = ((KERNEL_HEAP_END - KERNEL_HEAP_BASE) / FRAME_SIZE) as usize;
        let heap = VirtualAddress::new(KERNEL_HEAP_BASE).page();
        let offset = ((hint.base().as_u64() - KERNEL_HEAP_BASE) / FRAME_SIZE) as usize;
        let kernel = self.aspace(self.kernel_root);

        let mut run = 0;
        for i in 0..window {
            let index = (offset + i) % window;
            if index == 0 {
                run = 0;
            }
            if kernel.leaf(heap + index as u64).is_some() {
                run = 0;
                continue;
            }
            run += 1;
            if run == count {
                return Some(heap + (index + 1 - count) as u64);
            }
        }
        None
    }

    /// Back every page of `region` with a zeroed frame in `root`.
    ///
    /// # Errors
    /// [`VmError::OutOfMemory`]; pages backed so far are released again.
    pub fn populate_region(&self, root: PhysicalFrame, region: &mut VmObject, user: bool) -> Result<(), VmError> {
        let options = region.page_options(user);
        for i in 0..region.pages() {
            let page = region.page_at(i);
            let mapped = self.allocate_frame().and_then(|frame| {
                self.map_page(frame.base(), page, options, Some(root)).inspect_err(|_| {
                    self.free_frame(frame);
                })
            });
            if let Err(e) = mapped {
                for j in 0..i {
                    if let Ok(Some(frame)) = self.unmap_page(region.page_at(j), Some(root)) {
                        self.free_frame(frame);
                    }
                }
                return Err(e);
            }
        }
        region.set_allocated(true);
        Ok(())
    }

    /// Map a shared or copy-on-write duplicate of `region` (owned by
    /// `src_root`) into `dst_root` and return the new region.
    ///
    /// Shared regions are aliased with their full permissions. Everything
    /// else is shared copy-on-write: both sides end up read-only (with the
    /// copy-on-write marker if the region is writable).
    ///
    /// # Errors
    /// [`VmError::OutOfMemory`] for the destination's tables. The source is
    /// untouched and nothing stays mapped in the destination.
    pub fn duplicate_region(
        &self,
        src_root: PhysicalFrame,
        dst_root: PhysicalFrame,
        region: &mut VmObject,
    ) -> Result<VmObject, VmError> {
        let src = self.aspace(src_root);
        let options = if region.is_shared() {
            region.page_options(true)
        } else {
            region.shared_page_options(true)
        };

        for i in 0..region.pages() {
            let page = region.page_at(i);
            let Some(frame) = src.leaf(page).and_then(|e| e.frame()) else {
                continue;
            };
            if let Err(e) = self.map_page(frame.base(), page, options, Some(dst_root)) {
                for j in 0..i {
                    let page = region.page_at(j);
                    if let Err(unwind) = self.unmap_page(page, Some(dst_root)) {
                        log::warn!("unwinding duplicate of {page}: {unwind}");
                    }
                }
                return Err(e);
            }
        }

        if region.is_shared() {
            return Ok(region.alias());
        }

        for i in 0..region.pages() {
            let page = region.page_at(i);
            if src.set_options(page, options).is_ok() {
                self.mmu.invalidate_page(page);
            }
        }
        Ok(region.copy_as_copy_on_write())
    }

    /// Release every frame `region` owns in `root` and unmap its pages.
    ///
    /// Shared regions free their frames with the last alias. Copy-on-write
    /// pages drop one owner; the frame is freed when the last owner lets go.
    pub fn release_region(&self, root: PhysicalFrame, region: &mut VmObject) {
        let shared = region.is_shared();
        let owns_frames = region.release_alias();
        let mut freed = 0usize;
        for i in 0..region.pages() {
            let page = region.page_at(i);
            let frame = match self.unmap_page(page, Some(root)) {
                Ok(Some(frame)) => frame,
                Ok(None) => continue,
                Err(e) => {
                    log::warn!("release of {page}: {e}");
                    continue;
                }
            };
            let last_owner = if shared {
                owns_frames
            } else {
                region
                    .take_cow(i)
                    .is_none_or(|counter| counter.fetch_sub(1, Ordering::AcqRel) == 1)
            };
            if last_owner {
                self.free_frame(frame);
                freed += 1;
            }
        }
        region.set_allocated(false);
        log::trace!("released region at {} ({freed} frames freed)", region.base());
    }

    /// Resolve a write fault at `va` on a copy-on-write page of `region`.
    ///
    /// With other owners left the page is copied into a fresh frame and
    /// remapped writable; as the last owner the existing frame is simply
    /// made writable again.
    ///
    /// # Errors
    /// - [`VmError::NotCopyOnWrite`] if the page is not shared copy-on-write
    ///   or the region is not writable.
    /// - [`VmError::NotMapped`] if the page has no frame.
    /// - [`VmError::OutOfMemory`] if the copy cannot be allocated; the page
    ///   stays shared.
    pub fn resolve_copy_on_write(
        &self,
        root: PhysicalFrame,
        region: &mut VmObject,
        va: VirtualAddress,
    ) -> Result<(), VmError> {
        let index = region.page_index(va).ok_or(VmError::NotCopyOnWrite(va))?;
        if !region.is_writable() {
            return Err(VmError::NotCopyOnWrite(va));
        }
        let counter = region.cow_counter(index).cloned().ok_or(VmError::NotCopyOnWrite(va))?;
        let page = region.page_at(index);
        let aspace = self.aspace(root);
        let old = aspace.leaf(page).and_then(|e| e.frame()).ok_or(VmError::NotMapped(va))?;
        let options = region.page_options(true);

        if counter.load(Ordering::Acquire) > 1 {
            let copy = self.allocate_frame()?;
            self.copy_frame(old, copy);
            if let Err(e) = aspace.map_page(&mut self.frames(), page, copy, options) {
                self.free_frame(copy);
                return Err(e.into());
            }
            if counter.fetch_sub(1, Ordering::AcqRel) == 1 {
                // The other owners went away in the meantime.
                self.free_frame(old);
            }
            log::debug!("copy-on-write: {page} copied from {old} to {copy}");
        } else {
            counter.fetch_sub(1, Ordering::AcqRel);
            aspace.set_options(page, options)?;
            log::debug!("copy-on-write: {page} now owns {old}");
        }

        region.take_cow(index);
        self.mmu.invalidate_page(page);
        Ok(())
    }

    /// Copy bytes out of the address space rooted at `root`.
    ///
    /// # Errors
    /// [`VmError::NotMapped`] if any page is unmapped; `buf` is untouched.
    pub fn read_from(&self, root: PhysicalFrame, va: VirtualAddress, buf: &mut [u8]) -> Result<(), VmError> {
        Ok(self.aspace(root).read_bytes(va, buf)?)
    }

    /// Copy bytes into the address space rooted at `root`, ignoring leaf
    /// permissions.
    ///
    /// # Errors
    /// [`VmError::NotMapped`] if any page is unmapped; nothing is written.
    pub fn write_to(&self, root: PhysicalFrame, va: VirtualAddress, data: &[u8]) -> Result<(), VmError> {
        Ok(self.aspace(root).write_bytes(va, data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::Access;
    use alloc::boxed::Box;
    use kernel_info::boot::MemoryRegionKind;
    use kernel_vmem::test_support::{MockMmu, TestPhys};

    struct Fixture {
        vmm: Vmm<'static, TestPhys, MockMmu>,
        mmu: &'static MockMmu,
        pm: &'static SpinLock<BitmapFrameAlloc<'static>>,
    }

    fn fixture(frames: usize) -> Fixture {
        let phys: &'static TestPhys = Box::leak(Box::new(TestPhys::with_frames(frames)));
        let mmu: &'static MockMmu = Box::leak(Box::new(MockMmu::new()));
        let map = [phys.usable_region()];
        let alloc = unsafe { BitmapFrameAlloc::new(phys, &map) }.unwrap();
        let pm = Box::leak(Box::new(SpinLock::new(alloc)));
        let vmm = Vmm::init(phys, mmu, pm, &[], &KernelImage::default()).unwrap();
        Fixture { vmm, mmu, pm }
    }

    const USER_RW: PageOptions = PageOptions::PRESENT
        .union(PageOptions::WRITABLE)
        .union(PageOptions::USER);

    #[test]
    fn init_switches_to_a_populated_root() {
        let f = fixture(1024);
        assert_eq!(f.mmu.switches(), [f.vmm.kernel_root()]);
        // bitmap + root + 256 shared PDPTs
        assert_eq!(f.pm.lock().used_frames(), 258);
        assert_eq!(f.vmm.active_root(), f.vmm.kernel_root());
        assert!(f.vmm.leaf_in(f.vmm.kernel_root(), VirtualPage::default()).is_none());
    }

    #[test]
    fn init_direct_maps_ram() {
        let phys: &'static TestPhys = Box::leak(Box::new(TestPhys::with_frames(1024)));
        let mmu: &'static MockMmu = Box::leak(Box::new(MockMmu::new()));
        let pm_map = [phys.usable_region()];
        let alloc = unsafe { BitmapFrameAlloc::new(phys, &pm_map) }.unwrap();
        let pm = Box::leak(Box::new(SpinLock::new(alloc)));
        let memory_map = [
            MemoryMapEntry::new(0, 16 * FRAME_SIZE, MemoryRegionKind::Usable),
            MemoryMapEntry::new(16 * FRAME_SIZE, FRAME_SIZE, MemoryRegionKind::Reserved),
        ];
        let kernel = KernelImage {
            phys_base: 0x2000,
            virt_base: kernel_info::memory::KERNEL_BASE,
            size: 0x1800,
        };
        let vmm = Vmm::init(phys, mmu, pm, &memory_map, &kernel).unwrap();

        let hhdm = VirtualAddress::new(HHDM_BASE + 0x3123);
        assert_eq!(vmm.get_physical(hhdm), Some(PhysicalAddress::new(0x3123)));
        assert_eq!(vmm.get_physical(VirtualAddress::new(HHDM_BASE + 16 * FRAME_SIZE)), None);
        let text = VirtualAddress::new(kernel.virt_base + 0x1000);
        assert_eq!(vmm.get_physical(text), Some(PhysicalAddress::new(0x3000)));
    }

    #[test]
    fn map_query_unmap() {
        let f = fixture(1024);
        let page = VirtualAddress::new(0x40_0000).page();
        let pa = PhysicalAddress::new(0x9000);

        f.vmm.map_page(pa, page, USER_RW, None).unwrap();
        assert_eq!(f.vmm.get_physical(page.base() + 0x10), Some(pa + 0x10));
        assert_eq!(f.mmu.invalidations(), [page]);

        f.vmm.map_page(pa, page, PageOptions::empty(), None).unwrap();
        assert_eq!(f.vmm.get_physical(page.base()), None);
        assert_eq!(f.mmu.invalidations().len(), 2);
    }

    #[test]
    #[should_panic(expected = "NX bit")]
    fn map_rejects_bit_63() {
        let f = fixture(1024);
        let _ = f.vmm.map_page(PhysicalAddress::new(1 << 63), VirtualPage::default(), USER_RW, None);
    }

    #[test]
    fn new_tables_share_kernel_half_only() {
        let f = fixture(1024);
        let heap = f.vmm.allocate_pages(1);
        let user = f.vmm.create_new_page_table().unwrap();
        assert_eq!(f.vmm.translate_in(user, heap), f.vmm.get_physical(heap));

        // Kernel mappings made later are visible too.
        let later = f.vmm.allocate_pages(1);
        assert!(f.vmm.translate_in(user, later).is_some());

        let low = VirtualAddress::new(0x1000).page();
        f.vmm.map_page(PhysicalAddress::new(0x5000), low, USER_RW, Some(user)).unwrap();
        assert!(f.vmm.get_physical(low.base()).is_none());

        let used = f.pm.lock().used_frames();
        f.vmm.destroy_page_table(user);
        // root + PDPT + PD + PT
        assert_eq!(f.pm.lock().used_frames(), used - 4);
        assert!(f.vmm.get_physical(later).is_some());
    }

    #[test]
    #[should_panic(expected = "kernel page table")]
    fn kernel_root_is_never_destroyed() {
        let f = fixture(1024);
        f.vmm.destroy_page_table(f.vmm.kernel_root());
    }

    #[test]
    fn heap_pages_are_zeroed_and_reused() {
        let f = fixture(1024);
        let a = f.vmm.allocate_pages(2);
        let b = f.vmm.allocate_pages(1);
        assert_eq!(a.as_u64(), KERNEL_HEAP_BASE);
        assert_eq!(b.as_u64(), KERNEL_HEAP_BASE + 2 * FRAME_SIZE);

        let mut buf = [0xffu8; 16];
        f.vmm.read_from(f.vmm.kernel_root(), a, &mut buf).unwrap();
        assert_eq!(buf, [0; 16]);

        let used = f.pm.lock().used_frames();
        f.vmm.free_pages(a, 2);
        assert_eq!(f.pm.lock().used_frames(), used - 2);
        assert_eq!(f.vmm.get_physical(a), None);

        // The hint moved back to the freed range.
        assert_eq!(f.vmm.allocate_pages(1), a);
    }

    #[test]
    fn heap_out_of_memory_unwinds() {
        let f = fixture(300);
        // Build the heap's PD and PT first; tables are not reclaimed on unwind.
        f.vmm.free_pages(f.vmm.allocate_pages(1), 1);
        let free = f.pm.lock().free_frames() as usize;
        let err = f.vmm.try_allocate_pages(free + 1).unwrap_err();
        assert_eq!(err, VmError::OutOfMemory);
        assert_eq!(f.pm.lock().free_frames() as usize, free);
        assert_eq!(f.vmm.get_physical(VirtualAddress::new(KERNEL_HEAP_BASE)), None);
    }

    fn user_region(vmm: &Vmm<'static, TestPhys, MockMmu>, root: PhysicalFrame, pages: usize) -> VmObject {
        let mut region = VmObject::new(VirtualAddress::new(0x40_0000).page(), pages, Access::READ | Access::WRITE);
        vmm.populate_region(root, &mut region, true).unwrap();
        region
    }

    #[test]
    fn copy_on_write_isolates_writers() {
        let f = fixture(1024);
        let parent = f.vmm.create_new_page_table().unwrap();
        let child = f.vmm.create_new_page_table().unwrap();
        let mut region = user_region(&f.vmm, parent, 2);
        let va = region.base() + 0x10;
        f.vmm.write_to(parent, va, b"before").unwrap();

        let mut copy = f.vmm.duplicate_region(parent, child, &mut region).unwrap();
        let leaf = f.vmm.leaf_in(parent, va.page()).unwrap();
        assert!(!leaf.writable() && leaf.copy_on_write());
        assert_eq!(f.vmm.translate_in(parent, va), f.vmm.translate_in(child, va));
        assert_eq!(copy.cow_count(0), Some(2));

        // Child writes: gets its own frame.
        f.vmm.resolve_copy_on_write(child, &mut copy, va).unwrap();
        f.vmm.write_to(child, va, b"after!").unwrap();
        assert_ne!(f.vmm.translate_in(parent, va), f.vmm.translate_in(child, va));
        assert!(f.vmm.leaf_in(child, va.page()).unwrap().writable());
        assert_eq!(region.cow_count(0), Some(1));

        let mut buf = [0u8; 6];
        f.vmm.read_from(parent, va, &mut buf).unwrap();
        assert_eq!(&buf, b"before");

        // Parent is now the last owner: re-permission in place.
        let frame = f.vmm.translate_in(parent, va);
        f.vmm.resolve_copy_on_write(parent, &mut region, va).unwrap();
        assert_eq!(f.vmm.translate_in(parent, va), frame);
        assert!(f.vmm.leaf_in(parent, va.page()).unwrap().writable());
        assert!(!region.is_copy_on_write(0));
    }

    #[test]
    fn last_owner_frees_shared_frames() {
        let f = fixture(1024);
        let parent = f.vmm.create_new_page_table().unwrap();
        let child = f.vmm.create_new_page_table().unwrap();
        let mut region = user_region(&f.vmm, parent, 3);
        let used = f.pm.lock().used_frames();

        let mut copy = f.vmm.duplicate_region(parent, child, &mut region).unwrap();
        // Only the child's tables were allocated.
        let tables = f.pm.lock().used_frames() - used;

        f.vmm.release_region(parent, &mut region);
        assert_eq!(f.pm.lock().used_frames(), used + tables);
        assert_eq!(copy.cow_count(0), Some(1));

        f.vmm.release_region(child, &mut copy);
        assert_eq!(f.pm.lock().used_frames(), used + tables - 3);
    }

    #[test]
    fn read_only_pages_are_not_resolved() {
        let f = fixture(1024);
        let parent = f.vmm.create_new_page_table().unwrap();
        let child = f.vmm.create_new_page_table().unwrap();
        let mut region = VmObject::new(VirtualAddress::new(0x40_0000).page(), 1, Access::READ);
        f.vmm.populate_region(parent, &mut region, true).unwrap();

        let mut copy = f.vmm.duplicate_region(parent, child, &mut region).unwrap();
        assert!(!f.vmm.leaf_in(child, region.base().page()).unwrap().copy_on_write());
        assert_eq!(
            f.vmm.resolve_copy_on_write(child, &mut copy, region.base()),
            Err(VmError::NotCopyOnWrite(region.base()))
        );
    }

    #[test]
    fn failed_duplicate_leaves_nothing_mapped() {
        let f = fixture(1024);
        let parent = f.vmm.create_new_page_table().unwrap();
        let child = f.vmm.create_new_page_table().unwrap();
        // Straddles a page-table boundary: the second page needs its own PT.
        let mut region = VmObject::new(VirtualAddress::new(0x1F_F000).page(), 2, Access::READ | Access::WRITE);
        f.vmm.populate_region(parent, &mut region, true).unwrap();

        // Enough for the child's PDPT, PD and first PT only.
        let free = f.pm.lock().free_frames();
        for _ in 3..free {
            f.pm.lock().try_allocate_pages(1).unwrap();
        }

        assert_eq!(
            f.vmm.duplicate_region(parent, child, &mut region).unwrap_err(),
            VmError::OutOfMemory
        );
        assert_eq!(f.vmm.translate_in(child, region.base()), None);
        assert!(f.vmm.leaf_in(parent, region.base().page()).unwrap().writable());
        assert!(!region.is_copy_on_write(0));
    }

    #[test]
    fn shared_regions_are_aliased() {
        let f = fixture(1024);
        let parent = f.vmm.create_new_page_table().unwrap();
        let child = f.vmm.create_new_page_table().unwrap();
        let mut region = user_region(&f.vmm, parent, 1).into_shared();

        let mut alias = f.vmm.duplicate_region(parent, child, &mut region).unwrap();
        let va = region.base();
        assert!(f.vmm.leaf_in(child, va.page()).unwrap().writable());
        assert!(f.vmm.leaf_in(parent, va.page()).unwrap().writable());

        let used = f.pm.lock().used_frames();
        f.vmm.release_region(child, &mut alias);
        assert_eq!(f.pm.lock().used_frames(), used);
        assert!(f.vmm.translate_in(parent, va).is_some());
        assert_eq!(region.alias_count(), Some(1));

        // The last alias takes the frame with it.
        f.vmm.release_region(parent, &mut region);
        assert_eq!(f.pm.lock().used_frames(), used - 1);
        assert_eq!(f.vmm.translate_in(parent, va), None);
    }
}
