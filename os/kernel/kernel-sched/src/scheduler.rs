//! # Round-Robin Scheduler
//!
//! The scheduler owns every process and walks a `(process, thread)` cursor
//! over them. Each pass first reaps threads marked
//! [`ShouldDestroy`](ThreadState::ShouldDestroy), then drops processes left
//! without threads (releasing their memory), and only then picks the next
//! runnable thread after the previously selected one.
//!
//! ```text
//!  timer tick ──► timer_callback ──► every quantum-th tick:
//!                                      save_context(frame)
//!                                      schedule(frame) ──► frame := next thread's registers
//!                                                          trap stack top := its stack
//!                                                          page tables := its root
//! ```
//!
//! Nothing runnable means the idle context (captured the first time a tick
//! arrives while no thread is current) is resumed in the kernel address
//! space.
//!
//! The scheduler is single-core and runs with interrupts disabled; all
//! methods take `&mut self` and the kernel serializes entry.

mod lifecycle;
mod messaging;

pub use messaging::RecvOutcome;

use crate::error::SchedError;
use crate::frame::InterruptFrame;
use crate::ids::{ProcessId, ThreadId};
use crate::ipc::DEFAULT_IPC_CAPACITY;
use crate::process::Process;
use crate::thread::{TRAP_STACK_PAGES, ThreadState};
use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;
use kernel_alloc::Vmm;
use kernel_memory_addresses::VirtualAddress;
use kernel_vmem::{Mmu, PhysMapper};

/// Runtime knobs of the scheduler.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Timer ticks between two scheduling decisions.
    pub quantum: u64,
    /// Message buffer capacity of new processes.
    pub default_ipc_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            quantum: 10,
            default_ipc_capacity: DEFAULT_IPC_CAPACITY,
        }
    }
}

pub struct Scheduler<'m, M: PhysMapper, H: Mmu> {
    vmm: &'m Vmm<'m, M, H>,
    config: SchedulerConfig,
    processes: Vec<Process>,
    current: Option<(ProcessId, ThreadId)>,
    /// Next `(process index, thread index)` to consider.
    cursor: (usize, usize),
    ticks: u64,
    next_pid: u64,
    next_tid: u64,
    /// Stack the CPU switches to on the next kernel entry from ring 3.
    kernel_stack_top: VirtualAddress,
    /// Pipe name → owning process.
    pipes: BTreeMap<String, ProcessId>,
    started: bool,
    idle: Option<InterruptFrame>,
    /// Trap stacks of reaped threads that were still executing on them.
    retired_stacks: Vec<VirtualAddress>,
}

impl<'m, M: PhysMapper, H: Mmu> Scheduler<'m, M, H> {
    #[must_use]
    pub fn new(vmm: &'m Vmm<'m, M, H>, config: SchedulerConfig) -> Self {
        Self {
            vmm,
            config: SchedulerConfig {
                quantum: config.quantum.max(1),
                ..config
            },
            processes: Vec::new(),
            current: None,
            cursor: (0, 0),
            ticks: 0,
            next_pid: 1,
            next_tid: 1,
            kernel_stack_top: VirtualAddress::zero(),
            pipes: BTreeMap::new(),
            started: false,
            idle: None,
            retired_stacks: Vec::new(),
        }
    }

    #[must_use]
    pub const fn vmm(&self) -> &'m Vmm<'m, M, H> {
        self.vmm
    }

    #[must_use]
    pub const fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    #[must_use]
    pub const fn ticks(&self) -> u64 {
        self.ticks
    }

    /// The thread whose context the CPU currently holds, if any.
    #[must_use]
    pub const fn current(&self) -> Option<(ProcessId, ThreadId)> {
        self.current
    }

    #[must_use]
    pub fn current_process(&self) -> Option<&Process> {
        self.process(self.current?.0)
    }

    #[must_use]
    pub fn processes(&self) -> &[Process] {
        &self.processes
    }

    #[must_use]
    pub fn process(&self, pid: ProcessId) -> Option<&Process> {
        self.processes.iter().find(|p| p.id() == pid)
    }

    /// Top of the trap stack to load into the TSS after a switch.
    #[must_use]
    pub const fn kernel_stack_top(&self) -> VirtualAddress {
        self.kernel_stack_top
    }

    /// The process that registered `name`.
    #[must_use]
    pub fn pipe_owner(&self, name: &str) -> Option<ProcessId> {
        self.pipes.get(name).copied()
    }

    /// The context resumed when nothing is runnable.
    pub const fn set_idle_frame(&mut self, frame: InterruptFrame) {
        self.idle = Some(frame);
    }

    /// Enable preemption. The first tick taken afterwards selects the first
    /// thread.
    pub const fn first_schedule(&mut self) {
        self.cursor = (0, 0);
        self.started = true;
    }

    /// Timer interrupt entry.
    ///
    /// Returns whether a scheduling decision was made.
    pub fn timer_callback(&mut self, frame: &mut InterruptFrame) -> bool {
        self.free_retired_stacks();
        self.ticks += 1;
        if !self.started || !self.ticks.is_multiple_of(self.config.quantum) {
            return false;
        }
        self.save_context(frame);
        self.schedule(frame);
        true
    }

    /// Store `frame` as the current thread's context, or as the idle
    /// context if no thread is current.
    pub fn save_context(&mut self, frame: &InterruptFrame) {
        match self.current {
            Some((pid, tid)) => {
                if let Some(thread) = self.process_mut(pid).and_then(|p| p.thread_mut(tid)) {
                    thread.regs = *frame;
                }
            }
            None => self.idle = Some(*frame),
        }
    }

    /// Select the next thread and load it into `frame`.
    ///
    /// # Panics
    /// If nothing is runnable and no idle context was ever captured.
    pub fn schedule(&mut self, frame: &mut InterruptFrame) -> Option<(ProcessId, ThreadId)> {
        self.reap_threads();
        self.remove_dead_processes();

        let positions: usize = self.processes.iter().map(|p| p.threads.len() + 1).sum();
        let (mut pi, mut ti) = self.cursor;
        for _ in 0..=positions {
            if pi >= self.processes.len() {
                pi = 0;
                ti = 0;
                if self.processes.is_empty() {
                    break;
                }
            }
            let process = &self.processes[pi];
            let Some(thread) = process.threads.get(ti) else {
                pi += 1;
                ti = 0;
                continue;
            };
            if thread.is_runnable() {
                let selected = (process.id(), thread.id());
                *frame = thread.regs;
                self.kernel_stack_top = thread.trap_stack_top();
                self.vmm.switch_page_tables(process.root());
                self.cursor = (pi, ti + 1);
                self.current = Some(selected);
                log::trace!("scheduled {} {}", selected.0, selected.1);
                return Some(selected);
            }
            ti += 1;
        }

        self.current = None;
        let Some(idle) = self.idle else {
            log::error!("no runnable thread and no idle context");
            panic!("nothing to schedule");
        };
        *frame = idle;
        self.vmm.switch_page_tables(self.vmm.kernel_root());
        log::trace!("idle");
        None
    }

    fn process_mut(&mut self, pid: ProcessId) -> Option<&mut Process> {
        self.processes.iter_mut().find(|p| p.id() == pid)
    }

    fn index_of(&self, pid: ProcessId) -> Option<usize> {
        self.processes.iter().position(|p| p.id() == pid)
    }

    /// Index of the current process and the current thread's id.
    fn current_indices(&self) -> Result<(usize, ThreadId), SchedError> {
        let (pid, tid) = self.current.ok_or(SchedError::NoCurrentProcess)?;
        let index = self.index_of(pid).ok_or(SchedError::NoCurrentProcess)?;
        Ok((index, tid))
    }

    const fn allocate_pid(&mut self) -> ProcessId {
        let pid = ProcessId::new(self.next_pid);
        self.next_pid += 1;
        pid
    }

    const fn allocate_tid(&mut self) -> ThreadId {
        let tid = ThreadId::new(self.next_tid);
        self.next_tid += 1;
        tid
    }

    fn free_retired_stacks(&mut self) {
        for stack in self.retired_stacks.drain(..) {
            self.vmm.free_pages(stack, TRAP_STACK_PAGES);
        }
    }

    /// Free a trap stack, or retire it if the CPU may still be running on it.
    fn release_trap_stack(&mut self, pid: ProcessId, tid: ThreadId, stack: VirtualAddress) {
        if self.current == Some((pid, tid)) {
            self.current = None;
            self.retired_stacks.push(stack);
        } else {
            self.vmm.free_pages(stack, TRAP_STACK_PAGES);
        }
    }

    fn reap_threads(&mut self) {
        for pi in 0..self.processes.len() {
            let mut ti = 0;
            while ti < self.processes[pi].threads.len() {
                if self.processes[pi].threads[ti].state() != ThreadState::ShouldDestroy {
                    ti += 1;
                    continue;
                }
                let thread = self.processes[pi].threads.remove(ti);
                let pid = self.processes[pi].id();
                log::debug!("reaped {} of {pid}", thread.id());
                self.release_trap_stack(pid, thread.id(), thread.trap_stack());
                if self.cursor.0 == pi && self.cursor.1 > ti {
                    self.cursor.1 -= 1;
                }
            }
        }
    }

    fn remove_dead_processes(&mut self) {
        let mut pi = 0;
        while pi < self.processes.len() {
            if self.processes[pi].is_alive() {
                pi += 1;
            } else {
                self.remove_process(pi);
            }
        }
    }

    /// Remove the process at `index` and release everything it owns.
    fn remove_process(&mut self, index: usize) {
        let mut process = self.processes.remove(index);
        match self.cursor.0 {
            c if c > index => self.cursor.0 -= 1,
            c if c == index => self.cursor.1 = 0,
            _ => {}
        }

        for thread in core::mem::take(&mut process.threads) {
            self.release_trap_stack(process.id(), thread.id(), thread.trap_stack());
        }
        if self.current.is_some_and(|(pid, _)| pid == process.id()) {
            self.current = None;
        }

        let root = process.root();
        let previous = self.vmm.active_root();
        self.vmm.switch_page_tables(root);
        for region in &mut process.regions {
            self.vmm.release_region(root, region);
        }
        // Another process may still be running on the previous root.
        if previous == root {
            self.vmm.switch_page_tables(self.vmm.kernel_root());
        } else {
            self.vmm.switch_page_tables(previous);
        }
        self.vmm.destroy_page_table(root);

        self.pipes.retain(|_, owner| *owner != process.id());
        log::info!("{} ({}) removed", process.id(), process.name());
    }
}
