//! # System call ABI
//!
//! User code enters the kernel with `int 0x80`. The call number travels in
//! `rax`, up to five arguments in `rdi, rsi, rdx, r10, r8`, and the result
//! comes back in `rax`:
//!
//! ```text
//!  rax = number ─┐                         ┌─ rax = value        (success)
//!  rdi, rsi,     ├──► int 0x80 ──► kernel ─┤
//!  rdx, r10, r8 ─┘                         └─ rax = -(error code) (failure)
//! ```
//!
//! Successful results are always far below `2^63`, so the two ranges never
//! overlap. This crate only describes the ABI; the dispatcher lives in the
//! kernel.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

mod error;
mod sysno;

pub use error::{SyscallError, SyscallResult, encode_result};
pub use sysno::{Syscall, Sysno};

/// Longest pipe name accepted by `ipc-hint` and `ipc-send-pipe`.
pub const MAX_PIPE_NAME_LEN: usize = 64;

/// Software interrupt vector for system calls.
pub const SYSCALL_VECTOR: u8 = 0x80;
