//! Virtual memory objects: one contiguous, uniformly-permissioned range of a
//! process's address space, plus the per-page copy-on-write counters that
//! tie duplicated regions together.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};
use kernel_memory_addresses::{FRAME_SIZE, VirtualAddress, VirtualPage};
use kernel_vmem::PageOptions;

bitflags::bitflags! {
    /// What user code may do with a region.
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
    pub struct Access: u8 {
        const READ    = 1 << 0;
        const WRITE   = 1 << 1;
        const EXECUTE = 1 << 2;
    }
}

/// Number of regions currently owning one shared frame.
///
/// Created at 1 for the original owner on the first duplication and
/// incremented for every further copy. The owner that brings it to zero
/// owns the frame outright again (or frees it).
pub type CowCounter = Arc<AtomicU32>;

/// A contiguous mapped range inside one address space.
#[derive(Debug)]
pub struct VmObject {
    base: VirtualPage,
    pages: usize,
    access: Access,
    allocated: bool,
    /// Address spaces holding a shared region; `None` for private ones.
    shared: Option<CowCounter>,
    /// Empty until the region is first duplicated, then one slot per page.
    cow: Vec<Option<CowCounter>>,
}

impl VmObject {
    /// A region of `pages` pages starting at `base`.
    #[must_use]
    pub const fn new(base: VirtualPage, pages: usize, access: Access) -> Self {
        Self {
            base,
            pages,
            access,
            allocated: false,
            shared: None,
            cow: Vec::new(),
        }
    }

    /// Mark the region as shared: it is aliased, not copied, on fork. The
    /// frames stay allocated until the last alias is released.
    #[must_use]
    pub fn into_shared(mut self) -> Self {
        self.shared = Some(Arc::new(AtomicU32::new(1)));
        self
    }

    #[inline]
    #[must_use]
    pub const fn base(&self) -> VirtualAddress {
        self.base.base()
    }

    #[inline]
    #[must_use]
    pub const fn pages(&self) -> usize {
        self.pages
    }

    #[inline]
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.pages as u64 * FRAME_SIZE
    }

    /// First address past the region.
    #[inline]
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.base().as_u64() + self.size()
    }

    #[inline]
    #[must_use]
    pub const fn access(&self) -> Access {
        self.access
    }

    /// Whether every page is backed by a frame.
    #[inline]
    #[must_use]
    pub const fn is_allocated(&self) -> bool {
        self.allocated
    }

    pub const fn set_allocated(&mut self, allocated: bool) {
        self.allocated = allocated;
    }

    #[inline]
    #[must_use]
    pub const fn is_shared(&self) -> bool {
        self.shared.is_some()
    }

    /// Number of address spaces holding this shared region.
    #[must_use]
    pub fn alias_count(&self) -> Option<u32> {
        self.shared.as_ref().map(|c| c.load(Ordering::Acquire))
    }

    /// Drop this handle's claim on the shared frames. Returns whether it
    /// was the last one, which makes the caller responsible for freeing
    /// them. Private regions always own their (non copy-on-write) frames.
    pub fn release_alias(&mut self) -> bool {
        self.shared
            .take()
            .is_none_or(|owners| owners.fetch_sub(1, Ordering::AcqRel) == 1)
    }

    #[must_use]
    pub const fn is_writable(&self) -> bool {
        self.access.contains(Access::WRITE)
    }

    #[must_use]
    pub const fn contains(&self, va: VirtualAddress) -> bool {
        va.as_u64() >= self.base().as_u64() && va.as_u64() < self.end()
    }

    /// Whether `[va, va + len)` lies entirely inside the region. An
    /// overflowing range is never contained.
    #[must_use]
    pub fn contains_range(&self, va: VirtualAddress, len: u64) -> bool {
        va.as_u64()
            .checked_add(len)
            .is_some_and(|end| va.as_u64() >= self.base().as_u64() && end <= self.end())
    }

    #[must_use]
    pub const fn overlaps(&self, other: &Self) -> bool {
        self.base().as_u64() < other.end() && other.base().as_u64() < self.end()
    }

    /// The `index`-th page of the region.
    #[must_use]
    pub fn page_at(&self, index: usize) -> VirtualPage {
        debug_assert!(index < self.pages);
        self.base + index as u64
    }

    /// Index of the page containing `va`, if inside the region.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn page_index(&self, va: VirtualAddress) -> Option<usize> {
        if self.contains(va) {
            Some(((va.as_u64() - self.base().as_u64()) / FRAME_SIZE) as usize)
        } else {
            None
        }
    }

    /// Leaf options for a page of this region with its full permissions.
    #[must_use]
    pub fn page_options(&self, user: bool) -> PageOptions {
        let mut options = PageOptions::PRESENT;
        options.set(PageOptions::WRITABLE, self.access.contains(Access::WRITE));
        options.set(PageOptions::NO_EXECUTE, !self.access.contains(Access::EXECUTE));
        options.set(PageOptions::USER, user);
        options
    }

    /// Leaf options for a page whose frame is shared copy-on-write: never
    /// writable, marked so a write fault can be told apart from a violation.
    #[must_use]
    pub fn shared_page_options(&self, user: bool) -> PageOptions {
        let mut options = self.page_options(user) - PageOptions::WRITABLE;
        options.set(PageOptions::COPY_ON_WRITE, self.is_writable());
        options
    }

    /// Duplicate this region over the same frames.
    ///
    /// Every page gets a shared counter (created at 1 for `self` the first
    /// time) that is incremented for the copy. The caller must install both
    /// owners' leaves read-only.
    pub fn copy_as_copy_on_write(&mut self) -> Self {
        if self.cow.is_empty() {
            self.cow = vec![None; self.pages];
        }
        let cow = self
            .cow
            .iter_mut()
            .map(|slot| {
                let counter = slot.get_or_insert_with(|| Arc::new(AtomicU32::new(1)));
                counter.fetch_add(1, Ordering::AcqRel);
                Some(Arc::clone(counter))
            })
            .collect();
        Self {
            base: self.base,
            pages: self.pages,
            access: self.access,
            allocated: self.allocated,
            shared: None,
            cow,
        }
    }

    /// A second handle on a shared region for another address space.
    #[must_use]
    pub fn alias(&self) -> Self {
        debug_assert!(self.is_shared());
        if let Some(owners) = &self.shared {
            owners.fetch_add(1, Ordering::AcqRel);
        }
        Self {
            base: self.base,
            pages: self.pages,
            access: self.access,
            allocated: self.allocated,
            shared: self.shared.clone(),
            cow: Vec::new(),
        }
    }

    /// The counter of page `index` if that page is still shared.
    #[must_use]
    pub fn cow_counter(&self, index: usize) -> Option<&CowCounter> {
        self.cow.get(index)?.as_ref()
    }

    /// Whether page `index` is still shared copy-on-write.
    #[must_use]
    pub fn is_copy_on_write(&self, index: usize) -> bool {
        self.cow_counter(index).is_some()
    }

    /// Current owner count of page `index`, if shared.
    #[must_use]
    pub fn cow_count(&self, index: usize) -> Option<u32> {
        self.cow_counter(index).map(|c| c.load(Ordering::Acquire))
    }

    /// Detach page `index` from its counter; the region owns the page
    /// outright afterwards (or no longer at all, see the caller).
    pub fn take_cow(&mut self, index: usize) -> Option<CowCounter> {
        self.cow.get_mut(index)?.take()
    }
}
