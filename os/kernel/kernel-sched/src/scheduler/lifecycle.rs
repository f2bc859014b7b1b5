//! Process creation, fork, exec and teardown, plus the per-process memory
//! services the syscall and fault paths call into.

use super::Scheduler;
use crate::error::SchedError;
use crate::frame::InterruptFrame;
use crate::ids::{ProcessId, ThreadId};
use crate::ipc::MessageBuffer;
use crate::process::{Process, ProcessKind, Segment, UserPointerError};
use crate::thread::{TRAP_STACK_PAGES, Thread, ThreadState, WaitCondition};
use alloc::string::String;
use kernel_alloc::{Access, VmError, VmObject, Vmm};
use kernel_info::memory::{USER_IMAGE_BASE, USER_STACK_SIZE, USER_STACK_TOP, USERSPACE_END};
use kernel_memory_addresses::{FRAME_SIZE, PhysicalFrame, VirtualAddress, align_down, align_up};
use kernel_vmem::{Mmu, PhysMapper};

/// Lowest address `mmap` may not reach: the bottom of the user stack.
const MMAP_LIMIT: u64 = USER_STACK_TOP - USER_STACK_SIZE;

/// Bytes below a new thread's stack pointer that must be writable.
const STACK_SLACK: u64 = 16;

impl<M: PhysMapper, H: Mmu> Scheduler<'_, M, H> {
    /// Create a user process from a raw image loaded at
    /// [`USER_IMAGE_BASE`], entered at its first byte.
    ///
    /// # Errors
    /// See [`create_process_from_elf`](Self::create_process_from_elf).
    pub fn create_process(&mut self, name: &str, image: &[u8]) -> Result<ProcessId, SchedError> {
        if image.is_empty() {
            return Err(SchedError::InvalidImage("empty image"));
        }
        let base = VirtualAddress::new(USER_IMAGE_BASE);
        let segment = Segment {
            vaddr: base,
            mem_size: image.len() as u64,
            data: image,
            access: Access::READ | Access::WRITE | Access::EXECUTE,
        };
        self.create_process_from_elf(name, base, &[segment])
    }

    /// Create a user process from loadable segments.
    ///
    /// The process gets a fresh address space with one region per segment,
    /// a user stack ending at [`USER_STACK_TOP`] and one thread starting at
    /// `entry`.
    ///
    /// # Errors
    /// - [`SchedError::InvalidImage`] for malformed segments,
    /// - [`SchedError::RegionOverlap`] for overlapping segments,
    /// - [`SchedError::OutOfMemory`].
    ///
    /// Nothing is left allocated on failure.
    pub fn create_process_from_elf(
        &mut self,
        name: &str,
        entry: VirtualAddress,
        segments: &[Segment<'_>],
    ) -> Result<ProcessId, SchedError> {
        let root = self.vmm.create_new_page_table()?;
        let pid = self.allocate_pid();
        let parent = self.current.map(|(pid, _)| pid);
        let ipc = MessageBuffer::new(self.config.default_ipc_capacity);
        let mut process = Process::new(pid, parent, ProcessKind::User, String::from(name), root, ipc);

        if let Err(e) = self.load_image(&mut process, segments) {
            self.discard_image(&mut process);
            return Err(e);
        }
        let trap_stack = match self.vmm.try_allocate_pages(TRAP_STACK_PAGES) {
            Ok(stack) => stack,
            Err(e) => {
                self.discard_image(&mut process);
                return Err(e.into());
            }
        };

        let tid = self.allocate_tid();
        let regs = InterruptFrame::user(entry, VirtualAddress::new(USER_STACK_TOP));
        process.threads.push(Thread::new(tid, regs, trap_stack));
        log::info!(
            "{pid} ({name}) created: {} region(s), entry {entry}",
            process.regions.len()
        );
        self.processes.push(process);
        Ok(pid)
    }

    /// Create a kernel process running `entry` on its trap stack.
    ///
    /// # Errors
    /// [`SchedError::OutOfMemory`].
    pub fn create_kernel_process(&mut self, name: &str, entry: VirtualAddress) -> Result<ProcessId, SchedError> {
        let root = self.vmm.create_new_page_table()?;
        let trap_stack = match self.vmm.try_allocate_pages(TRAP_STACK_PAGES) {
            Ok(stack) => stack,
            Err(e) => {
                self.vmm.destroy_page_table(root);
                return Err(e.into());
            }
        };
        let pid = self.allocate_pid();
        let tid = self.allocate_tid();
        let ipc = MessageBuffer::new(self.config.default_ipc_capacity);
        let mut process = Process::new(pid, None, ProcessKind::Kernel, String::from(name), root, ipc);
        let mut thread = Thread::new(tid, InterruptFrame::default(), trap_stack);
        thread.regs = InterruptFrame::kernel(entry, thread.trap_stack_top());
        process.threads.push(thread);
        log::info!("{pid} ({name}) created as kernel process");
        self.processes.push(process);
        Ok(pid)
    }

    /// Map every segment plus the user stack into `process`.
    #[allow(clippy::cast_possible_truncation)]
    fn load_image(&self, process: &mut Process, segments: &[Segment<'_>]) -> Result<(), SchedError> {
        let root = process.root();
        for segment in segments {
            let start = segment.vaddr.as_u64();
            let end = start
                .checked_add(segment.mem_size)
                .filter(|&end| end <= USERSPACE_END)
                .ok_or(SchedError::InvalidImage("segment leaves user space"))?;
            if segment.mem_size == 0 {
                continue;
            }
            if (segment.data.len() as u64) > segment.mem_size {
                return Err(SchedError::InvalidImage("file size exceeds memory size"));
            }

            let base = align_down(start, FRAME_SIZE);
            let pages = ((align_up(end, FRAME_SIZE) - base) / FRAME_SIZE) as usize;
            let region = VmObject::new(VirtualAddress::new(base).page(), pages, segment.access);
            add_backed_region(self.vmm, process, region)?;
            self.vmm.write_to(root, segment.vaddr, segment.data)?;
        }

        let stack = VmObject::new(
            VirtualAddress::new(USER_STACK_TOP - USER_STACK_SIZE).page(),
            (USER_STACK_SIZE / FRAME_SIZE) as usize,
            Access::READ | Access::WRITE,
        );
        add_backed_region(self.vmm, process, stack).map(|_| ())
    }

    /// Undo a partially built process that was never scheduled.
    fn discard_image(&self, process: &mut Process) {
        release_regions(self.vmm, process.root(), process);
        self.vmm.destroy_page_table(process.root());
    }

    /// Duplicate the current process.
    ///
    /// The child shares every private region copy-on-write and every shared
    /// region directly, inherits the descriptor table, and resumes from
    /// `frame` with `rax = 0`. The parent's `rax` in `frame` receives the
    /// child's id.
    ///
    /// # Errors
    /// - [`SchedError::NoCurrentProcess`],
    /// - [`SchedError::OutOfMemory`]; the child is torn down again and the
    ///   parent keeps running unchanged.
    pub fn fork_current(&mut self, frame: &mut InterruptFrame) -> Result<ProcessId, SchedError> {
        let (pi, tid) = self.current_indices()?;
        let child_root = self.vmm.create_new_page_table()?;
        let child_pid = self.allocate_pid();
        let child_tid = self.allocate_tid();

        let parent = &mut self.processes[pi];
        let parent_root = parent.root();
        if let Some(thread) = parent.thread_mut(tid) {
            thread.state = ThreadState::ProcessActionBusy;
        }
        let mut child = Process::new(
            child_pid,
            Some(parent.id()),
            parent.kind(),
            String::from(parent.name()),
            child_root,
            MessageBuffer::new(parent.ipc.capacity()),
        );
        child.fds = parent.fds.clone();
        child.mmap_cursor = parent.mmap_cursor;

        let mut result = Ok(());
        for region in &mut parent.regions {
            match self.vmm.duplicate_region(parent_root, child_root, region) {
                Ok(copy) => child.regions.push(copy),
                Err(e) => {
                    result = Err(SchedError::from(e));
                    break;
                }
            }
        }
        let trap_stack = result.and_then(|()| {
            self.vmm
                .try_allocate_pages(TRAP_STACK_PAGES)
                .map_err(SchedError::from)
        });

        let parent = &mut self.processes[pi];
        if let Some(thread) = parent.thread_mut(tid) {
            thread.state = ThreadState::Running;
        }
        let trap_stack = match trap_stack {
            Ok(stack) => stack,
            Err(e) => {
                log::warn!("fork of {} failed: {e}", parent.id());
                self.discard_image(&mut child);
                return Err(e);
            }
        };

        let mut regs = *frame;
        regs.rax = 0;
        child.threads.push(Thread::new(child_tid, regs, trap_stack));
        frame.rax = child_pid.as_u64();
        log::info!("{} forked {child_pid}", parent.id());
        self.processes.push(child);
        Ok(child_pid)
    }

    /// Replace the current process's image.
    ///
    /// Other threads of the process are destroyed; the calling thread
    /// restarts at `entry` on a fresh stack. The message buffer, pipe names
    /// and descriptors survive.
    ///
    /// # Errors
    /// As for [`create_process_from_elf`](Self::create_process_from_elf);
    /// the old image is untouched on failure.
    pub fn exec_current(
        &mut self,
        frame: &mut InterruptFrame,
        entry: VirtualAddress,
        segments: &[Segment<'_>],
    ) -> Result<(), SchedError> {
        let (pi, tid) = self.current_indices()?;
        let new_root = self.vmm.create_new_page_table()?;
        let (pid, kind) = (self.processes[pi].id(), self.processes[pi].kind());
        if let Some(thread) = self.processes[pi].thread_mut(tid) {
            thread.state = ThreadState::ProcessActionBusy;
        }

        let mut image = Process::new(pid, None, kind, String::new(), new_root, MessageBuffer::new(0));
        let loaded = self.load_image(&mut image, segments);
        let process = &mut self.processes[pi];
        if let Err(e) = loaded {
            if let Some(thread) = process.thread_mut(tid) {
                thread.state = ThreadState::Running;
            }
            self.discard_image(&mut image);
            return Err(e);
        }

        let old_root = process.root();
        process.root = new_root;
        core::mem::swap(&mut process.regions, &mut image.regions);
        process.mmap_cursor = image.mmap_cursor;
        for thread in &mut process.threads {
            if thread.id() == tid {
                thread.state = ThreadState::Running;
                thread.regs = InterruptFrame::user(entry, VirtualAddress::new(USER_STACK_TOP));
                *frame = thread.regs;
            } else {
                thread.destroy_later();
            }
        }

        self.vmm.switch_page_tables(new_root);
        release_regions(self.vmm, old_root, &mut image);
        self.vmm.destroy_page_table(old_root);
        log::info!("{pid} replaced its image, entry {entry}");
        Ok(())
    }

    /// Kill process `pid` and release everything it owns.
    ///
    /// If `pid` is the current process no thread is current afterwards; the
    /// caller must [`schedule`](Self::schedule).
    ///
    /// # Errors
    /// [`SchedError::InvalidArgument`] for an unknown process.
    pub fn kill_process(&mut self, pid: ProcessId) -> Result<(), SchedError> {
        let index = self.index_of(pid).ok_or(SchedError::InvalidArgument)?;
        log::info!("killing {pid}");
        self.remove_process(index);
        Ok(())
    }

    /// Kill the current process and switch to the next thread.
    ///
    /// # Errors
    /// [`SchedError::NoCurrentProcess`].
    pub fn kill_current_process(&mut self, frame: &mut InterruptFrame) -> Result<(), SchedError> {
        let (pid, _) = self.current.ok_or(SchedError::NoCurrentProcess)?;
        self.kill_process(pid)?;
        self.schedule(frame);
        Ok(())
    }

    /// Terminate the current thread and switch to the next one. The last
    /// thread of a process takes the process with it.
    ///
    /// # Errors
    /// [`SchedError::NoCurrentProcess`].
    pub fn exit_current_thread(&mut self, frame: &mut InterruptFrame) -> Result<(), SchedError> {
        let (pi, tid) = self.current_indices()?;
        if let Some(thread) = self.processes[pi].thread_mut(tid) {
            thread.destroy_later();
        }
        self.schedule(frame);
        Ok(())
    }

    /// Start another thread in the current process at `entry`.
    ///
    /// A user thread begins with `rsp = stack`, which must sit at or inside
    /// the top of a writable region the process already owns (typically
    /// one it got from `mmap`). Threads of kernel processes run on their
    /// own trap stack and ignore `stack`. The thread is appended behind the
    /// existing ones and runs once the round robin reaches it.
    ///
    /// # Errors
    /// - [`SchedError::NoCurrentProcess`],
    /// - [`SchedError::UserPointer`] if `stack` is not backed by writable
    ///   memory,
    /// - [`SchedError::OutOfMemory`] for the trap stack.
    pub fn spawn_thread(&mut self, entry: VirtualAddress, stack: VirtualAddress) -> Result<ThreadId, SchedError> {
        let (pi, _) = self.current_indices()?;
        let kind = self.processes[pi].kind();
        if kind == ProcessKind::User {
            check_user_stack(&self.processes[pi], stack)?;
        }
        let trap_stack = self.vmm.try_allocate_pages(TRAP_STACK_PAGES)?;
        let tid = self.allocate_tid();
        let mut thread = Thread::new(tid, InterruptFrame::default(), trap_stack);
        thread.regs = match kind {
            ProcessKind::User => InterruptFrame::user(entry, stack),
            ProcessKind::Kernel => InterruptFrame::kernel(entry, thread.trap_stack_top()),
        };
        let process = &mut self.processes[pi];
        process.threads.push(thread);
        log::debug!("{}: spawned {tid} at {entry}", process.id());
        Ok(tid)
    }

    /// Back `size` bytes (rounded up to pages) of fresh zeroed memory in the
    /// current process.
    ///
    /// # Errors
    /// - [`SchedError::InvalidArgument`] for `size == 0`,
    /// - [`SchedError::OutOfMemory`] if frames or the mmap window run out.
    #[allow(clippy::cast_possible_truncation)]
    pub fn mmap_current(&mut self, size: u64) -> Result<VirtualAddress, SchedError> {
        if size == 0 {
            return Err(SchedError::InvalidArgument);
        }
        let (pi, _) = self.current_indices()?;
        let bytes = size.checked_next_multiple_of(FRAME_SIZE).ok_or(SchedError::OutOfMemory)?;
        let process = &mut self.processes[pi];
        let base = process.mmap_cursor;
        let end = base
            .as_u64()
            .checked_add(bytes)
            .filter(|&end| end <= MMAP_LIMIT)
            .ok_or(SchedError::OutOfMemory)?;

        let region = VmObject::new(base.page(), (bytes / FRAME_SIZE) as usize, Access::READ | Access::WRITE);
        add_backed_region(self.vmm, process, region)?;
        process.mmap_cursor = VirtualAddress::new(end);
        log::debug!("{}: mmap {bytes:#x} bytes at {base}", process.id());
        Ok(base)
    }

    /// Block the current thread until `irq` fires, then switch away.
    ///
    /// # Errors
    /// [`SchedError::NoCurrentProcess`].
    pub fn wait_for_irq(&mut self, frame: &mut InterruptFrame, irq: u8) -> Result<(), SchedError> {
        let (pi, tid) = self.current_indices()?;
        if let Some(thread) = self.processes[pi].thread_mut(tid) {
            thread.block_on(WaitCondition::Irq(irq));
        }
        self.save_context(frame);
        self.schedule(frame);
        Ok(())
    }

    /// Wake every thread waiting for `irq`. Returns how many woke up.
    pub fn notify_irq(&mut self, irq: u8) -> usize {
        let mut woken = 0;
        for thread in self.processes.iter_mut().flat_map(|p| p.threads.iter_mut()) {
            if thread.state() == ThreadState::WaitingOnIrq(irq) {
                thread.wake(0);
                woken += 1;
            }
        }
        woken
    }

    /// Resolve a write fault at `va` in the current process.
    ///
    /// # Errors
    /// [`SchedError::Vm`] with [`VmError::NotCopyOnWrite`] if `va` is no
    /// copy-on-write page, [`SchedError::OutOfMemory`] if the copy fails.
    pub fn resolve_copy_on_write(&mut self, va: VirtualAddress) -> Result<(), SchedError> {
        let (pi, _) = self.current_indices()?;
        let process = &mut self.processes[pi];
        let root = process.root();
        let region = process
            .region_containing_mut(va)
            .ok_or(SchedError::Vm(VmError::NotCopyOnWrite(va)))?;
        Ok(self.vmm.resolve_copy_on_write(root, region, va)?)
    }

    /// Validate a user range of the current process.
    ///
    /// # Errors
    /// [`SchedError::UserPointer`] if the range is refused.
    pub fn validate_current(&self, ptr: VirtualAddress, len: u64) -> Result<(), SchedError> {
        let process = self.current_process().ok_or(SchedError::NoCurrentProcess)?;
        process.validate_user_range(ptr, len).map_err(|e| {
            log::warn!("{}: refused user pointer: {e}", process.id());
            SchedError::from(e)
        })
    }

    /// Copy `buf.len()` bytes from the current process at `ptr`.
    ///
    /// # Errors
    /// [`SchedError::UserPointer`] if the range is refused.
    pub fn copy_from_user(&self, ptr: VirtualAddress, buf: &mut [u8]) -> Result<(), SchedError> {
        self.validate_current(ptr, buf.len() as u64)?;
        let root = self.current_root()?;
        Ok(self.vmm.read_from(root, ptr, buf)?)
    }

    /// Copy `data` into the current process at `ptr`.
    ///
    /// # Errors
    /// [`SchedError::UserPointer`] if the range is refused.
    pub fn copy_to_user(&mut self, ptr: VirtualAddress, data: &[u8]) -> Result<(), SchedError> {
        self.validate_current(ptr, data.len() as u64)?;
        let (pi, _) = self.current_indices()?;
        let process = &mut self.processes[pi];
        prepare_user_write(self.vmm, process, ptr, data.len() as u64)?;
        Ok(self.vmm.write_to(process.root(), ptr, data)?)
    }

    fn current_root(&self) -> Result<PhysicalFrame, SchedError> {
        self.current_process()
            .map(Process::root)
            .ok_or(SchedError::NoCurrentProcess)
    }
}

/// Add `region` to `process` and back it with zeroed frames.
fn add_backed_region<M: PhysMapper, H: Mmu>(
    vmm: &Vmm<'_, M, H>,
    process: &mut Process,
    region: VmObject,
) -> Result<VirtualAddress, SchedError> {
    let root = process.root();
    let user = process.kind() == ProcessKind::User;
    let region = process.add_region(region)?;
    let base = region.base();
    if let Err(e) = vmm.populate_region(root, region, user) {
        process.regions.pop();
        return Err(e.into());
    }
    Ok(base)
}

/// Make `[ptr, ptr + len)` of `process` safe for a kernel write through the
/// direct map: copy-on-write pages get their private frame first.
///
/// The range must already be validated, so it lies in a single region.
pub(super) fn prepare_user_write<M: PhysMapper, H: Mmu>(
    vmm: &Vmm<'_, M, H>,
    process: &mut Process,
    ptr: VirtualAddress,
    len: u64,
) -> Result<(), SchedError> {
    if len == 0 {
        return Ok(());
    }
    let root = process.root();
    let Some(region) = process.region_containing_mut(ptr) else {
        return Err(UserPointerError::Unmapped { ptr, len }.into());
    };
    if !region.is_writable() {
        return Err(UserPointerError::ReadOnly { ptr, len }.into());
    }
    let end = ptr.as_u64() + len;
    let mut page = align_down(ptr.as_u64(), FRAME_SIZE);
    while page < end {
        let va = VirtualAddress::new(page);
        if region.page_index(va).is_some_and(|i| region.is_copy_on_write(i)) {
            vmm.resolve_copy_on_write(root, region, va)?;
        }
        page += FRAME_SIZE;
    }
    Ok(())
}

/// Check that a thread can push onto a stack ending at `top`.
fn check_user_stack(process: &Process, top: VirtualAddress) -> Result<(), SchedError> {
    let ptr = VirtualAddress::new(top.as_u64().saturating_sub(STACK_SLACK));
    process.validate_user_range(ptr, STACK_SLACK)?;
    if process.regions().iter().any(|r| r.contains(ptr) && r.is_writable()) {
        Ok(())
    } else {
        Err(UserPointerError::ReadOnly { ptr, len: STACK_SLACK }.into())
    }
}

/// Release every region of `process` in `root`.
fn release_regions<M: PhysMapper, H: Mmu>(vmm: &Vmm<'_, M, H>, root: PhysicalFrame, process: &mut Process) {
    for region in &mut process.regions {
        vmm.release_region(root, region);
    }
    process.regions.clear();
}
