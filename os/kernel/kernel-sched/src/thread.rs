//! Threads: a saved register set, a scheduling state, and the trap stack the
//! CPU switches to when the thread enters the kernel.

use crate::frame::InterruptFrame;
use crate::ids::ThreadId;
use kernel_info::memory::TRAP_STACK_SIZE;
use kernel_memory_addresses::{FRAME_SIZE, VirtualAddress};

/// Pages of kernel heap backing one trap stack.
#[allow(clippy::cast_possible_truncation)]
pub const TRAP_STACK_PAGES: usize = (TRAP_STACK_SIZE / FRAME_SIZE) as usize;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ThreadState {
    /// Eligible for selection.
    Running,
    /// Blocked in a receive until a message arrives.
    WaitingOnMessage,
    /// Blocked until the given IRQ line fires.
    WaitingOnIrq(u8),
    /// Reaped by the next scheduling pass.
    ShouldDestroy,
    /// Its process is being forked or replaced; never selected.
    ProcessActionBusy,
}

/// What a blocked thread is waiting for.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WaitCondition {
    /// A message, to be copied to `buffer` (at most `max_len` bytes).
    Message { buffer: VirtualAddress, max_len: usize },
    Irq(u8),
}

#[derive(Debug)]
pub struct Thread {
    id: ThreadId,
    pub(crate) regs: InterruptFrame,
    pub(crate) state: ThreadState,
    trap_stack: VirtualAddress,
    pub(crate) wait: Option<WaitCondition>,
}

impl Thread {
    pub(crate) const fn new(id: ThreadId, regs: InterruptFrame, trap_stack: VirtualAddress) -> Self {
        Self {
            id,
            regs,
            state: ThreadState::Running,
            trap_stack,
            wait: None,
        }
    }

    #[inline]
    #[must_use]
    pub const fn id(&self) -> ThreadId {
        self.id
    }

    /// The register state the thread resumes with.
    #[inline]
    #[must_use]
    pub const fn regs(&self) -> &InterruptFrame {
        &self.regs
    }

    #[inline]
    #[must_use]
    pub const fn state(&self) -> ThreadState {
        self.state
    }

    #[inline]
    #[must_use]
    pub const fn wait_condition(&self) -> Option<WaitCondition> {
        self.wait
    }

    /// Lowest address of the trap stack.
    #[inline]
    #[must_use]
    pub const fn trap_stack(&self) -> VirtualAddress {
        self.trap_stack
    }

    /// Initial stack pointer for kernel entries from this thread.
    #[inline]
    #[must_use]
    pub const fn trap_stack_top(&self) -> VirtualAddress {
        VirtualAddress::new(self.trap_stack.as_u64() + TRAP_STACK_SIZE)
    }

    #[inline]
    #[must_use]
    pub const fn is_runnable(&self) -> bool {
        matches!(self.state, ThreadState::Running)
    }

    /// Block until `condition` is met.
    pub(crate) fn block_on(&mut self, condition: WaitCondition) {
        self.state = match condition {
            WaitCondition::Message { .. } => ThreadState::WaitingOnMessage,
            WaitCondition::Irq(irq) => ThreadState::WaitingOnIrq(irq),
        };
        self.wait = Some(condition);
    }

    /// Leave the thread to the next scheduling pass. A pending wait is
    /// dropped so no wake-up can revive it.
    pub(crate) const fn destroy_later(&mut self) {
        self.state = ThreadState::ShouldDestroy;
        self.wait = None;
    }

    /// Make the thread runnable again, returning `rax` to it.
    pub(crate) fn wake(&mut self, rax: u64) {
        self.regs.rax = rax;
        self.state = ThreadState::Running;
        self.wait = None;
    }
}
