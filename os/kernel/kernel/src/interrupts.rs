//! # CPU exception and IRQ entry points
//!
//! The assembly stubs push the general-purpose registers on top of the
//! hardware frame, forming an [`InterruptFrame`], and call into [`Kernel`]
//! through [`Kernel::dispatch_interrupt`]. Whatever the frame holds on return
//! is restored with `iretq`.
//!
//! Faults raised in ring 3 never take the kernel down: a write to a
//! copy-on-write page is resolved, anything else kills the process and
//! another thread is loaded into the frame. Faults raised in ring 0 are
//! kernel bugs and panic with a diagnostic.

use crate::{DebugSink, Kernel};
use bitfield_struct::bitfield;
use kernel_memory_addresses::VirtualAddress;
use kernel_sched::{InterruptFrame, SchedError};
use kernel_vmem::{Mmu, PhysMapper};

pub use kernel_syscall::SYSCALL_VECTOR;

pub const INVALID_OPCODE_VECTOR: u8 = 0x06;
pub const GENERAL_PROTECTION_VECTOR: u8 = 0x0D;
pub const PAGE_FAULT_VECTOR: u8 = 0x0E;
pub const LAPIC_TIMER_VECTOR: u8 = 0xE0;

/// What a fault handler did with the faulting context.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FaultOutcome {
    /// The faulting instruction can be retried.
    Resolved,
    /// The process was terminated; the frame holds the next context.
    ProcessKilled,
}

/// Page-fault error code layout (x86-64).
///
/// Reference: Intel SDM Vol. 3A, §6.15.1 “Page-Fault Exception (#PF)”.
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct PageFaultError {
    /// 0 = non-present page, 1 = protection violation.
    pub present: bool,
    /// 0 = read or execute, 1 = write.
    pub write: bool,
    /// 1 = access from CPL 3.
    pub user: bool,
    /// 1 = reserved bit set in a paging structure.
    pub reserved_bit: bool,
    /// 1 = instruction fetch.
    pub instruction_fetch: bool,
    /// 1 = protection-key violation (CR4.PKE=1).
    pub protection_key: bool,
    /// 1 = shadow stack access (CET-SS).
    pub shadow_stack: bool,
    #[bits(57)]
    __: u64,
}

impl PageFaultError {
    #[must_use]
    pub const fn explain(&self) -> &'static str {
        if self.reserved_bit() {
            "Reserved bit set in a paging structure"
        } else if !self.present() {
            "Non-present page"
        } else if self.instruction_fetch() {
            if self.user() {
                "User-mode instruction fetch on protected page"
            } else {
                "Kernel instruction fetch on protected page"
            }
        } else if self.write() {
            "Write access to protected page"
        } else {
            "Read access to protected page"
        }
    }

    /// A write to a present page that the leaf denies: the only fault a
    /// copy-on-write page produces.
    #[must_use]
    pub const fn is_protection_write(&self) -> bool {
        self.present() && self.write() && !self.instruction_fetch() && !self.reserved_bit()
    }
}

impl<M: PhysMapper, H: Mmu, D: DebugSink> Kernel<'_, M, H, D> {
    /// Route a vector to its handler. Exceptions without an error code pass
    /// 0 for `error_code`; `fault_address` is CR2 and only meaningful for
    /// page faults.
    ///
    /// # Panics
    /// On an unexpected vector or a fault in kernel mode.
    pub fn dispatch_interrupt(
        &mut self,
        vector: u8,
        error_code: u64,
        fault_address: VirtualAddress,
        frame: &mut InterruptFrame,
    ) {
        match vector {
            PAGE_FAULT_VECTOR => {
                self.page_fault(fault_address, PageFaultError::from_bits(error_code), frame);
            }
            GENERAL_PROTECTION_VECTOR => {
                self.general_protection(error_code, frame);
            }
            INVALID_OPCODE_VECTOR => {
                self.invalid_opcode(frame);
            }
            LAPIC_TIMER_VECTOR => self.timer_interrupt(frame),
            SYSCALL_VECTOR => self.syscall(frame),
            v => {
                log::error!("unexpected interrupt vector {v:#04x} at {:#x}", frame.rip);
                panic!("unexpected interrupt vector {v:#04x}");
            }
        }
    }

    /// Page-fault entry.
    ///
    /// # Panics
    /// If the fault was raised in kernel mode.
    pub fn page_fault(
        &mut self,
        addr: VirtualAddress,
        error: PageFaultError,
        frame: &mut InterruptFrame,
    ) -> FaultOutcome {
        if !frame.is_user() || !error.user() {
            log::error!(
                "kernel page fault at {addr} rip={:#x} err={:#x}: {}",
                frame.rip,
                error.into_bits(),
                error.explain()
            );
            log::error!("{error:#?}");
            panic!("kernel page fault at {addr}");
        }

        if error.is_protection_write() {
            match self.sched.resolve_copy_on_write(addr) {
                Ok(()) => return FaultOutcome::Resolved,
                Err(SchedError::OutOfMemory) => {
                    self.kill_current(frame, "out of memory resolving copy-on-write");
                    return FaultOutcome::ProcessKilled;
                }
                Err(e) => log::debug!("write fault at {addr} is no copy-on-write: {e}"),
            }
        }

        log::warn!("user page fault at {addr} rip={:#x}: {}", frame.rip, error.explain());
        self.kill_current(frame, "segmentation fault");
        FaultOutcome::ProcessKilled
    }

    /// General-protection entry.
    ///
    /// # Panics
    /// If the fault was raised in kernel mode.
    pub fn general_protection(&mut self, error_code: u64, frame: &mut InterruptFrame) -> FaultOutcome {
        if !frame.is_user() {
            log::error!("kernel #GP rip={:#x} err={error_code:#x}", frame.rip);
            panic!("kernel general protection fault");
        }
        self.kill_current(frame, "general protection fault");
        FaultOutcome::ProcessKilled
    }

    /// Invalid-opcode entry.
    ///
    /// # Panics
    /// If the fault was raised in kernel mode.
    pub fn invalid_opcode(&mut self, frame: &mut InterruptFrame) -> FaultOutcome {
        if !frame.is_user() {
            log::error!("kernel #UD rip={:#x}", frame.rip);
            panic!("kernel invalid opcode");
        }
        self.kill_current(frame, "invalid opcode");
        FaultOutcome::ProcessKilled
    }
}
