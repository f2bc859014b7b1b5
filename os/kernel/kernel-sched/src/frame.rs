//! # Saved Register State
//!
//! [`InterruptFrame`] is what the interrupt and `int 0x80` entry stubs push
//! before calling into the kernel, and what they pop before `iretq`. The
//! scheduler switches threads by overwriting it in place.
//!
//! ```text
//!   lowest address (stub's RSP after the pushes)
//!   +0x00  r15 … rax        pushed by the stub (rax first, r15 last)
//!   +0x78  rip cs rflags    pushed by the CPU
//!   +0x90  rsp ss           pushed by the CPU (always, in 64-bit mode)
//! ```

use kernel_memory_addresses::VirtualAddress;

/// Kernel code segment selector.
pub const KERNEL_CS: u64 = 0x08;
/// Kernel data segment selector.
pub const KERNEL_DS: u64 = 0x10;
/// User data segment selector (RPL 3).
pub const USER_DS: u64 = 0x1b;
/// User code segment selector (RPL 3).
pub const USER_CS: u64 = 0x23;

/// `IF` set plus the always-one bit 1.
pub const INITIAL_RFLAGS: u64 = 0x202;

#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct InterruptFrame {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64, // arg3
    pub r9: u64,
    pub r8: u64, // arg4
    pub rbp: u64,
    pub rdi: u64, // arg0
    pub rsi: u64, // arg1
    pub rdx: u64, // arg2
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64, // syscall number on entry, return value on exit

    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

const _: () = assert!(size_of::<InterruptFrame>() == 20 * 8);

impl InterruptFrame {
    /// Initial state of a user thread entering at `entry` with stack `stack`.
    #[must_use]
    pub const fn user(entry: VirtualAddress, stack: VirtualAddress) -> Self {
        Self::with_selectors(entry, stack, USER_CS, USER_DS)
    }

    /// Initial state of a kernel thread.
    #[must_use]
    pub const fn kernel(entry: VirtualAddress, stack: VirtualAddress) -> Self {
        Self::with_selectors(entry, stack, KERNEL_CS, KERNEL_DS)
    }

    const fn with_selectors(entry: VirtualAddress, stack: VirtualAddress, cs: u64, ss: u64) -> Self {
        Self {
            rax: 0,
            rbx: 0,
            rcx: 0,
            rdx: 0,
            rsi: 0,
            rdi: 0,
            rbp: 0,
            r8: 0,
            r9: 0,
            r10: 0,
            r11: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
            rip: entry.as_u64(),
            cs,
            rflags: INITIAL_RFLAGS,
            rsp: stack.as_u64(),
            ss,
        }
    }

    /// Whether the interrupted code ran in ring 3.
    #[inline]
    #[must_use]
    pub const fn is_user(&self) -> bool {
        self.cs & 3 == 3
    }

    /// The five syscall argument registers, in ABI order.
    #[inline]
    #[must_use]
    pub const fn syscall_args(&self) -> [u64; 5] {
        [self.rdi, self.rsi, self.rdx, self.r10, self.r8]
    }
}
