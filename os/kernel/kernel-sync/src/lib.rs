//! # Kernel synchronization primitives
//!
//! The kernel targets a single core and only switches threads at timer
//! interrupts, so the only shared state needing a lock is the state touched
//! from both interrupt and non-interrupt context: the physical frame bitmap
//! and the kernel virtual-address hint. Both sit behind a [`SpinLock`].

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod spin_lock;

pub use spin_lock::{SpinLock, SpinLockGuard};
