//! # Processes
//!
//! A process owns an address space (its page-table root and the regions
//! mapped into it), its threads, a message buffer and a descriptor table.
//! A process without threads is dead and removed by the next scheduling
//! pass.

use crate::error::SchedError;
use crate::ids::{ProcessId, ThreadId};
use crate::ipc::MessageBuffer;
use crate::thread::Thread;
use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;
use kernel_alloc::{Access, VmObject};
use kernel_info::memory::{USER_MMAP_BASE, USERSPACE_END};
use kernel_memory_addresses::{PhysicalFrame, VirtualAddress};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ProcessKind {
    Kernel,
    User,
}

/// A user pointer the kernel refused to follow.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UserPointerError {
    #[error("{ptr} + {len:#x} leaves user space")]
    OutsideUserSpace { ptr: VirtualAddress, len: u64 },
    #[error("{ptr} + {len:#x} is not inside one mapped region")]
    Unmapped { ptr: VirtualAddress, len: u64 },
    #[error("{ptr} + {len:#x} is read-only")]
    ReadOnly { ptr: VirtualAddress, len: u64 },
}

/// One loadable piece of a program image.
#[derive(Debug, Copy, Clone)]
pub struct Segment<'a> {
    pub vaddr: VirtualAddress,
    /// Size in memory; the tail past `data` is zero-filled.
    pub mem_size: u64,
    pub data: &'a [u8],
    pub access: Access,
}

/// Per-process translation of descriptors to global handles.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FdTable {
    entries: BTreeMap<u32, u64>,
}

impl FdTable {
    /// Install `handle` at the lowest free descriptor.
    #[allow(clippy::cast_possible_truncation)]
    pub fn install(&mut self, handle: u64) -> u32 {
        let fd = (0..)
            .zip(self.entries.keys())
            .find(|(expected, used)| expected != *used)
            .map_or(self.entries.len() as u32, |(fd, _)| fd);
        self.entries.insert(fd, handle);
        fd
    }

    #[must_use]
    pub fn get(&self, fd: u32) -> Option<u64> {
        self.entries.get(&fd).copied()
    }

    pub fn remove(&mut self, fd: u32) -> Option<u64> {
        self.entries.remove(&fd)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug)]
pub struct Process {
    id: ProcessId,
    parent: Option<ProcessId>,
    kind: ProcessKind,
    name: String,
    pub(crate) root: PhysicalFrame,
    pub(crate) threads: Vec<Thread>,
    pub(crate) regions: Vec<VmObject>,
    pub(crate) ipc: MessageBuffer,
    pub(crate) fds: FdTable,
    /// Where the next anonymous mapping goes.
    pub(crate) mmap_cursor: VirtualAddress,
}

impl Process {
    pub(crate) fn new(
        id: ProcessId,
        parent: Option<ProcessId>,
        kind: ProcessKind,
        name: String,
        root: PhysicalFrame,
        ipc: MessageBuffer,
    ) -> Self {
        Self {
            id,
            parent,
            kind,
            name,
            root,
            threads: Vec::new(),
            regions: Vec::new(),
            ipc,
            fds: FdTable::default(),
            mmap_cursor: VirtualAddress::new(USER_MMAP_BASE),
        }
    }

    #[inline]
    #[must_use]
    pub const fn id(&self) -> ProcessId {
        self.id
    }

    #[inline]
    #[must_use]
    pub const fn parent(&self) -> Option<ProcessId> {
        self.parent
    }

    #[inline]
    #[must_use]
    pub const fn kind(&self) -> ProcessKind {
        self.kind
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Page-table root of the process's address space.
    #[inline]
    #[must_use]
    pub const fn root(&self) -> PhysicalFrame {
        self.root
    }

    #[must_use]
    pub fn threads(&self) -> &[Thread] {
        &self.threads
    }

    #[must_use]
    pub fn thread(&self, id: ThreadId) -> Option<&Thread> {
        self.threads.iter().find(|t| t.id() == id)
    }

    pub(crate) fn thread_mut(&mut self, id: ThreadId) -> Option<&mut Thread> {
        self.threads.iter_mut().find(|t| t.id() == id)
    }

    #[must_use]
    pub fn regions(&self) -> &[VmObject] {
        &self.regions
    }

    #[must_use]
    pub const fn ipc(&self) -> &MessageBuffer {
        &self.ipc
    }

    #[must_use]
    pub const fn fds(&self) -> &FdTable {
        &self.fds
    }

    pub const fn fds_mut(&mut self) -> &mut FdTable {
        &mut self.fds
    }

    /// Whether the process still has a thread.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        !self.threads.is_empty()
    }

    /// Check that `[ptr, ptr + len)` lies inside one allocated region.
    ///
    /// An empty range is always accepted.
    ///
    /// # Errors
    /// [`UserPointerError`] describing why the range was refused.
    pub fn validate_user_range(&self, ptr: VirtualAddress, len: u64) -> Result<(), UserPointerError> {
        if len == 0 {
            return Ok(());
        }
        let in_user_space = ptr
            .as_u64()
            .checked_add(len)
            .is_some_and(|end| end <= USERSPACE_END);
        if !in_user_space {
            return Err(UserPointerError::OutsideUserSpace { ptr, len });
        }
        if self
            .regions
            .iter()
            .any(|r| r.is_allocated() && r.contains_range(ptr, len))
        {
            Ok(())
        } else {
            Err(UserPointerError::Unmapped { ptr, len })
        }
    }

    /// The region containing `va`.
    pub fn region_containing_mut(&mut self, va: VirtualAddress) -> Option<&mut VmObject> {
        self.regions.iter_mut().find(|r| r.contains(va))
    }

    /// Take ownership of `region`, returning it for population.
    ///
    /// # Errors
    /// [`SchedError::RegionOverlap`] if it intersects a region already owned.
    pub(crate) fn add_region(&mut self, region: VmObject) -> Result<&mut VmObject, SchedError> {
        if self.regions.iter().any(|r| r.overlaps(&region)) {
            return Err(SchedError::RegionOverlap(region.base()));
        }
        self.regions.push(region);
        let last = self.regions.len() - 1;
        Ok(&mut self.regions[last])
    }
}
