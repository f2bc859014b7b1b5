//! # Address Space (x86-64, PML4-rooted)
//!
//! Strongly-typed helpers to build, query and tear down a **single** virtual
//! address space (tree rooted at a PML4).
//!
//! ## Highlights
//!
//! - [`AddressSpace::map_page`] installs (or, without `PRESENT`, removes) one
//!   4 KiB mapping, creating missing intermediate tables.
//! - [`AddressSpace::translate`] resolves a VA to a PA with a read-only walk.
//! - [`AddressSpace::copy_shared_half_from`] and [`AddressSpace::destroy`]
//!   implement the private/shared split of the top-level table.
//! - [`AddressSpace::read_bytes`] / [`AddressSpace::write_bytes`] copy data in
//!   and out of a (possibly inactive) address space through the mapper.
//!
//! ## Design
//!
//! - Allocate-then-link: every table a mapping needs is allocated and zeroed
//!   before the first entry is written. An out-of-memory failure leaves the
//!   hierarchy exactly as it was.
//! - Intermediate entries are present + writable; the user bit is set on the
//!   whole path of a user mapping. The leaf carries the real permissions.
//! - No TLB maintenance happens here; the caller owns the [`Mmu`](crate::Mmu).

use crate::info::SHARED_PML4_INDEX;
use crate::{
    ENTRIES_PER_TABLE, FrameAlloc, PageOptions, PageTable, PageTableEntry, PhysMapper, table_mut,
};
use kernel_memory_addresses::{FRAME_SIZE, PhysicalAddress, PhysicalFrame, VirtualAddress, VirtualPage};

/// Handle to a single, concrete address space.
pub struct AddressSpace<'m, M: PhysMapper> {
    root: PhysicalFrame, // PML4 frame
    mapper: &'m M,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum MapError {
    #[error("out of physical frames for page tables")]
    OutOfMemory,
    #[error("{0} is not mapped")]
    NotMapped(VirtualAddress),
    #[error("large page on the walk to {0}")]
    LargePage(VirtualAddress),
}

/// Follow a non-leaf entry. `Ok(None)` if the next level is absent.
fn next_level(entry: PageTableEntry, va: VirtualAddress) -> Result<Option<PhysicalFrame>, MapError> {
    if !entry.present() {
        return Ok(None);
    }
    if entry.large_page() {
        return Err(MapError::LargePage(va));
    }
    Ok(entry.frame())
}

impl<'m, M: PhysMapper> AddressSpace<'m, M> {
    /// Allocate and zero a new, completely empty root.
    ///
    /// # Errors
    /// [`MapError::OutOfMemory`] if no frame is available.
    pub fn new_empty<A: FrameAlloc>(mapper: &'m M, alloc: &mut A) -> Result<Self, MapError> {
        let root = alloc.alloc_frame().ok_or(MapError::OutOfMemory)?;
        let aspace = Self { root, mapper };
        aspace.table(root).zero();
        Ok(aspace)
    }

    /// Wrap an existing root.
    #[inline]
    pub const fn from_root(mapper: &'m M, root: PhysicalFrame) -> Self {
        Self { root, mapper }
    }

    /// Physical frame of the PML4.
    #[inline]
    pub const fn root(&self) -> PhysicalFrame {
        self.root
    }

    #[inline]
    fn table(&self, frame: PhysicalFrame) -> &'m mut PageTable {
        // SAFETY: frames reached from this root are page tables by construction.
        unsafe { table_mut(self.mapper, frame) }
    }

    /// Frame of the PT covering `va`, if all upper levels exist.
    fn find_pt(&self, va: VirtualAddress) -> Result<Option<PhysicalFrame>, MapError> {
        let mut frame = self.root;
        for index in [va.pml4_index(), va.pdpt_index(), va.pd_index()] {
            match next_level(self.table(frame).get(index), va)? {
                Some(next) => frame = next,
                None => return Ok(None),
            }
        }
        Ok(Some(frame))
    }

    /// Map `page → frame` with `options`.
    ///
    /// Without [`PageOptions::PRESENT`] the page is unmapped instead (a no-op
    /// if it was not mapped).
    ///
    /// # Panics
    /// If the frame address has bit 63 set; such an address can only come
    /// from confusing an entry with an address.
    ///
    /// # Errors
    /// - [`MapError::OutOfMemory`] if intermediate tables cannot be allocated.
    ///   Nothing was written in that case.
    /// - [`MapError::LargePage`] if the walk hits a large-page leaf.
    pub fn map_page<A: FrameAlloc>(
        &self,
        alloc: &mut A,
        page: VirtualPage,
        frame: PhysicalFrame,
        options: PageOptions,
    ) -> Result<(), MapError> {
        assert_eq!(
            frame.base().as_u64() >> 63,
            0,
            "physical address {} has the NX bit set",
            frame.base()
        );

        if !options.contains(PageOptions::PRESENT) {
            self.unmap_page(page)?;
            return Ok(());
        }

        let va = page.base();
        let user = options.contains(PageOptions::USER);
        let indices = [va.pml4_index(), va.pdpt_index(), va.pd_index()];

        // Phase 1: read-only walk. `path[0..depth]` are existing tables.
        let mut path = [self.root; 4];
        let mut depth = 1;
        for (level, &index) in indices.iter().enumerate() {
            match next_level(self.table(path[level]).get(index), va)? {
                Some(next) => {
                    path[level + 1] = next;
                    depth += 1;
                }
                None => break,
            }
        }

        // Phase 2: allocate every missing table before touching any entry.
        for level in depth..path.len() {
            let Some(fresh) = alloc.alloc_frame() else {
                for &allocated in &path[depth..level] {
                    alloc.free_frame(allocated);
                }
                return Err(MapError::OutOfMemory);
            };
            self.table(fresh).zero();
            path[level] = fresh;
        }

        // Phase 3: link.
        for (level, &index) in indices.iter().enumerate() {
            let table = self.table(path[level]);
            let entry = table.get(index);
            if level + 1 >= depth {
                table.set(index, PageTableEntry::table(path[level + 1], user));
            } else if user && !entry.user_access() {
                table.set(index, entry.with_user_access(true));
            }
        }

        let pt = self.table(path[3]);
        pt.set(va.pt_index(), PageTableEntry::leaf(frame, options));
        log::trace!("map {va} -> {} ({options:?})", frame.base());
        Ok(())
    }

    /// Remove the mapping of `page`, returning the frame it pointed to.
    ///
    /// Intermediate tables are left in place; they are reclaimed by
    /// [`destroy`](Self::destroy).
    ///
    /// # Errors
    /// [`MapError::LargePage`] if the walk hits a large-page leaf.
    pub fn unmap_page(&self, page: VirtualPage) -> Result<Option<PhysicalFrame>, MapError> {
        let va = page.base();
        let Some(pt_frame) = self.find_pt(va)? else {
            return Ok(None);
        };
        let pt = self.table(pt_frame);
        let old = pt.get(va.pt_index());
        if !old.present() {
            return Ok(None);
        }
        pt.set(va.pt_index(), PageTableEntry::zero());
        log::trace!("unmap {va}");
        Ok(old.frame())
    }

    /// Rewrite the options of an existing leaf, keeping its frame.
    ///
    /// # Errors
    /// [`MapError::NotMapped`] if `page` has no present leaf.
    pub fn set_options(&self, page: VirtualPage, options: PageOptions) -> Result<(), MapError> {
        let va = page.base();
        let pt_frame = self.find_pt(va)?.ok_or(MapError::NotMapped(va))?;
        let pt = self.table(pt_frame);
        let frame = pt.get(va.pt_index()).frame().ok_or(MapError::NotMapped(va))?;
        pt.set(va.pt_index(), PageTableEntry::leaf(frame, options));
        Ok(())
    }

    /// The present leaf entry for `page`, if any.
    #[must_use]
    pub fn leaf(&self, page: VirtualPage) -> Option<PageTableEntry> {
        let va = page.base();
        let pt_frame = self.find_pt(va).ok().flatten()?;
        let entry = self.table(pt_frame).get(va.pt_index());
        entry.present().then_some(entry)
    }

    /// Translate a `VirtualAddress` to `PhysicalAddress` if mapped.
    #[must_use]
    pub fn translate(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        let frame = self.leaf(va.page())?.frame()?;
        Some(frame.base() + va.page_offset())
    }

    /// Point every empty shared-half slot of the root at a fresh, zeroed PDPT.
    ///
    /// Done once for the kernel root; roots created later copy these entries,
    /// so anything mapped into the shared half afterwards is visible in every
    /// address space.
    ///
    /// # Errors
    /// [`MapError::OutOfMemory`]; slots filled so far stay filled.
    pub fn populate_shared_half<A: FrameAlloc>(&self, alloc: &mut A) -> Result<(), MapError> {
        let pml4 = self.table(self.root);
        for index in SHARED_PML4_INDEX..ENTRIES_PER_TABLE {
            if pml4.get(index).present() {
                continue;
            }
            let pdpt = alloc.alloc_frame().ok_or(MapError::OutOfMemory)?;
            self.table(pdpt).zero();
            pml4.set(index, PageTableEntry::table(pdpt, false));
        }
        Ok(())
    }

    /// Copy the shared upper half of `source`'s top-level table into this one.
    pub fn copy_shared_half_from(&self, source: PhysicalFrame) {
        let src = self.table(source);
        let dst = self.table(self.root);
        for index in SHARED_PML4_INDEX..ENTRIES_PER_TABLE {
            dst.set(index, src.get(index));
        }
    }

    /// Free every private intermediate table and the root itself.
    ///
    /// Leaf frames are **not** freed; they belong to whoever mapped them. The
    /// shared upper half is never touched. Returns the number of freed tables.
    pub fn destroy<A: FrameAlloc>(self, alloc: &mut A) -> usize {
        let mut freed = 0;
        let pml4 = self.table(self.root);
        for (_, e4) in pml4.iter().take(SHARED_PML4_INDEX) {
            let Some(pdpt) = e4.frame() else { continue };
            for (_, e3) in self.table(pdpt).iter() {
                let Some(pd) = e3.frame().filter(|_| !e3.large_page()) else {
                    continue;
                };
                for (_, e2) in self.table(pd).iter() {
                    if let Some(pt) = e2.frame().filter(|_| !e2.large_page()) {
                        alloc.free_frame(pt);
                        freed += 1;
                    }
                }
                alloc.free_frame(pd);
                freed += 1;
            }
            alloc.free_frame(pdpt);
            freed += 1;
        }
        alloc.free_frame(self.root);
        freed + 1
    }

    /// Visit `[va, va + len)` page by page as `(physical chunk start, offset into range, chunk length)`.
    #[allow(clippy::cast_possible_truncation)]
    fn chunks(
        &self,
        va: VirtualAddress,
        len: usize,
        mut f: impl FnMut(PhysicalAddress, usize, usize),
    ) -> Result<(), MapError> {
        let mut done = 0usize;
        while done < len {
            let cur = va + done as u64;
            let in_page = (FRAME_SIZE - cur.page_offset()) as usize;
            let chunk = in_page.min(len - done);
            let pa = self.translate(cur).ok_or(MapError::NotMapped(cur))?;
            f(pa, done, chunk);
            done += chunk;
        }
        Ok(())
    }

    /// Copy `buf.len()` bytes starting at `va` in this address space into `buf`.
    ///
    /// # Errors
    /// [`MapError::NotMapped`] for the first unmapped page; `buf` is untouched.
    pub fn read_bytes(&self, va: VirtualAddress, buf: &mut [u8]) -> Result<(), MapError> {
        self.chunks(va, buf.len(), |_, _, _| {})?;
        self.chunks(va, buf.len(), |pa, offset, chunk| {
            // SAFETY: `pa..pa+chunk` lies inside one mapped frame.
            let src = unsafe { self.mapper.phys_slice_mut::<u8>(pa, chunk) };
            buf[offset..offset + chunk].copy_from_slice(src);
        })
    }

    /// Copy `data` into this address space starting at `va`.
    ///
    /// Leaf permissions are not consulted; the copy goes through the mapper.
    ///
    /// # Errors
    /// [`MapError::NotMapped`] for the first unmapped page; nothing is written.
    pub fn write_bytes(&self, va: VirtualAddress, data: &[u8]) -> Result<(), MapError> {
        self.chunks(va, data.len(), |_, _, _| {})?;
        self.chunks(va, data.len(), |pa, offset, chunk| {
            // SAFETY: `pa..pa+chunk` lies inside one mapped frame.
            let dst = unsafe { self.mapper.phys_slice_mut::<u8>(pa, chunk) };
            dst.copy_from_slice(&data[offset..offset + chunk]);
        })
    }
}
