//! # Processes, Threads and Scheduling
//!
//! Everything above the virtual memory manager that gives the kernel its
//! notion of "who runs next":
//!
//! - [`Process`] and [`Thread`]: address space, regions, register state,
//!   trap stack, message buffer, descriptor table.
//! - [`Scheduler`]: strict round robin over all runnable threads, lazy
//!   reaping, fork/exec/kill, IRQ waits and the user-pointer checks every
//!   syscall goes through.
//! - [`ipc`]: per-process message buffers and pipe names.
//!
//! The scheduler borrows a [`Vmm`](kernel_alloc::Vmm) for its lifetime and
//! performs every memory operation through it, so it runs unchanged on the
//! host against simulated RAM.
//!
//! ```ignore
//! let mut sched = Scheduler::new(&vmm, SchedulerConfig::default());
//! sched.create_process("init", INIT_IMAGE)?;
//! sched.first_schedule();
//! // … from the timer interrupt:
//! sched.timer_callback(frame);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

extern crate alloc;

mod error;
pub mod frame;
mod ids;
pub mod ipc;
pub mod process;
pub mod scheduler;
pub mod thread;

pub use error::SchedError;
pub use frame::InterruptFrame;
pub use ids::{ProcessId, ThreadId};
pub use ipc::IpcError;
pub use process::{FdTable, Process, ProcessKind, Segment, UserPointerError};
pub use scheduler::{RecvOutcome, Scheduler, SchedulerConfig};
pub use thread::{Thread, ThreadState, WaitCondition};
