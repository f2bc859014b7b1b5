//! # Kernel Configuration and Boot Interface
//!
//! Memory layout constants and the bootloader-to-kernel hand-off types. This
//! crate is the single source of truth for where things live in every address
//! space, shared by the frame allocator, the page-table code and the
//! scheduler.
//!
//! ## Architecture
//!
//! ### Boot Information ([`boot`])
//! * **Memory Map**: physical regions tagged usable, reserved, ACPI, bad, …
//! * **Kernel Image**: where the kernel was loaded physically and where it runs
//! * **ABI Stability**: `#[repr(C)]` structures only
//!
//! ### Memory Layout ([`memory`])
//! * **Split Address Space**: PML4 slots `0..256` are private per process,
//!   `256..512` are shared by every address space
//! * **Higher Half Direct Map**: all usable RAM at [`HHDM_BASE`](memory::HHDM_BASE)` + pa`
//! * **Kernel Heap Window**: page-granular kernel allocations
//!
//! ## Virtual Memory Architecture
//!
//! ```text
//! 0x0000_0000_0000_0000 ┌─────────────────────────────────┐
//!                       │  User images, mmap window,      │
//!                       │  user stacks (private half)     │
//! USERSPACE_END         ├─────────────────────────────────┤ 0x0000_8000_0000_0000
//!                       │  non-canonical hole             │
//!                       ├─────────────────────────────────┤ 0xffff_8000_0000_0000
//! HHDM_BASE             ├─────────────────────────────────┤ 0xffff_8880_0000_0000
//!                       │  Higher Half Direct Mapping     │
//! KERNEL_HEAP_BASE      ├─────────────────────────────────┤ 0xffff_c000_0000_0000
//!                       │  Kernel heap window             │
//!                       │  (trap stacks, kernel pages)    │
//! KERNEL_BASE           ├─────────────────────────────────┤ 0xffff_ffff_8000_0000
//!                       │  Kernel Text & Data             │
//! 0xFFFF_FFFF_FFFF_FFFF └─────────────────────────────────┘
//! ```
//!
//! ## Configuration Management
//!
//! All layout constants are `const` values; compile-time assertions in
//! [`memory`] reject inconsistent configurations.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod boot;
pub mod memory;
