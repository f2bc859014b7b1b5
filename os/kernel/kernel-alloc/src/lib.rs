//! # Kernel Memory Allocation and Virtual Memory Management
//!
//! Physical frame allocation, the kernel's view of physical memory, and the
//! virtual memory manager built on top of both.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │            Virtual Memory Manager (Vmm)             │
//! │    • kernel root, per-process roots                 │
//! │    • kernel heap window                             │
//! │    • region backing, copy-on-write resolution       │
//! └─────────────────┬───────────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────────┐
//! │              Physical Mapper                        │
//! │    • HHDM (Higher Half Direct Mapping)              │
//! └─────────────────┬───────────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────────┐
//! │           Physical Frame Allocator                  │
//! │    • one bitmap per usable memory-map region        │
//! │    • hint word per region, popcount fast path       │
//! │    • bitmaps carved from physical memory, no heap   │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! ### Physical Frame Allocator ([`frame_alloc`])
//!
//! [`BitmapFrameAlloc`] hands out runs of up to
//! [`MAX_FRAMES_PER_ALLOCATION`](frame_alloc::MAX_FRAMES_PER_ALLOCATION)
//! contiguous 4 KiB frames. Kernel requests that cannot be satisfied are
//! fatal; the fallible variant exists for paths triggered by user processes.
//! The allocator lives behind one [`SpinLock`](kernel_sync::SpinLock).
//!
//! ### Physical Mapper ([`phys_mapper`])
//!
//! [`HhdmPhysMapper`] reaches any physical address at `HHDM_BASE + pa`.
//!
//! ### Regions ([`region`])
//!
//! A [`VmObject`] describes one contiguous range of a process's address
//! space. Duplicating it for a child shares its frames copy-on-write through
//! per-page owner counters.
//!
//! ### Virtual Memory Manager ([`vmm`])
//!
//! [`Vmm`] owns the kernel root and implements every address-space operation
//! the scheduler and the fault handlers need.
//!
//! ## Memory Layout Integration
//!
//! ```text
//! 0x0000_0000_0000_0000 ┌─────────────────────────────────┐
//!                       │        User Space               │
//!                       │  (private PML4 slots 0..256)    │
//! USERSPACE_END         ├─────────────────────────────────┤
//!                       │        Non-canonical hole       │
//! HHDM_BASE             ├─────────────────────────────────┤
//!                       │   Higher Half Direct Map        │
//! KERNEL_HEAP_BASE      ├─────────────────────────────────┤
//!                       │   Kernel heap window            │
//! KERNEL_BASE           ├─────────────────────────────────┤
//!                       │       Kernel image              │
//! 0xFFFF_FFFF_FFFF_FFFF └─────────────────────────────────┘
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

pub mod frame_alloc;
pub mod phys_mapper;
pub mod region;
pub mod vmm;

pub use frame_alloc::{BitmapFrameAlloc, FrameAllocError};
pub use phys_mapper::HhdmPhysMapper;
pub use region::{Access, VmObject};
pub use vmm::{Vmm, VmError};
