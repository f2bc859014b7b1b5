//! # Kernel
//!
//! Ties the memory manager and the scheduler to the CPU's entry points.
//!
//! ```text
//!   int 0x80 ───────► Kernel::syscall ──────────┐
//!   #PF / #GP / #UD ─► Kernel::page_fault, ... ──┼──► Scheduler ──► Vmm ──► BitmapFrameAlloc
//!   LAPIC timer ────► Kernel::timer_interrupt ──┘
//! ```
//!
//! Every entry point receives the saved [`InterruptFrame`] of the interrupted
//! context and may rewrite it; the assembly stubs restore whatever the frame
//! holds on return. The [`Kernel`] value is built once during boot and
//! handed to the stubs; it owns no globals.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

extern crate alloc;

pub mod boot;
pub mod debug;
pub mod interrupts;
pub mod logging;
mod syscall;

pub use boot::{BootError, MemorySummary};
pub use debug::{DebugSink, LogSink, QemuConsole};
pub use interrupts::{FaultOutcome, PageFaultError};

use kernel_alloc::Vmm;
use kernel_sched::{InterruptFrame, Scheduler, SchedulerConfig};
use kernel_vmem::{Mmu, PhysMapper};

/// The kernel context shared by all interrupt and syscall entries.
pub struct Kernel<'m, M: PhysMapper, H: Mmu, D: DebugSink> {
    sched: Scheduler<'m, M, H>,
    debug: D,
    /// `munmap` is reported once, not on every call.
    munmap_warned: bool,
}

impl<'m, M: PhysMapper, H: Mmu, D: DebugSink> Kernel<'m, M, H, D> {
    #[must_use]
    pub fn new(vmm: &'m Vmm<'m, M, H>, config: SchedulerConfig, debug: D) -> Self {
        Self {
            sched: Scheduler::new(vmm, config),
            debug,
            munmap_warned: false,
        }
    }

    #[must_use]
    pub const fn scheduler(&self) -> &Scheduler<'m, M, H> {
        &self.sched
    }

    pub const fn scheduler_mut(&mut self) -> &mut Scheduler<'m, M, H> {
        &mut self.sched
    }

    #[must_use]
    pub const fn debug_sink(&self) -> &D {
        &self.debug
    }

    /// Capture `frame` as the idle context and enable preemption.
    ///
    /// Called once from the boot path right before interrupts are enabled;
    /// the next timer tick selects the first thread.
    pub fn start(&mut self, idle: InterruptFrame) {
        self.sched.set_idle_frame(idle);
        self.sched.first_schedule();
        log::info!("scheduler started with {} process(es)", self.sched.processes().len());
    }

    /// Timer interrupt entry.
    pub fn timer_interrupt(&mut self, frame: &mut InterruptFrame) {
        self.sched.timer_callback(frame);
    }

    /// Terminate the current process because of `reason` and load the next
    /// context into `frame`.
    fn kill_current(&mut self, frame: &mut InterruptFrame, reason: &str) {
        let Some((pid, tid)) = self.sched.current() else {
            log::error!("{reason} with no current process");
            panic!("{reason} outside of any process");
        };
        log::warn!("{pid} {tid} killed: {reason}");
        if let Err(e) = self.sched.kill_current_process(frame) {
            log::error!("failed to kill {pid}: {e}");
        }
    }
}
