//! # Virtual and Physical Memory Address Types
//!
//! Strongly typed wrappers for raw addresses, physical frames and virtual
//! pages used by the frame allocator, the page-table code and the scheduler.
//!
//! ## Overview
//!
//! The kernel manages memory exclusively in 4 KiB units. The types in this
//! crate keep the two address spaces apart at compile time while remaining
//! zero-cost wrappers around `u64` values:
//!
//! | Type | Meaning |
//! |------|---------|
//! | [`PhysicalAddress`] | A byte address in physical memory (RAM or MMIO). |
//! | [`PhysicalFrame`] | A 4 KiB aligned physical frame, the allocator's unit. |
//! | [`VirtualAddress`] | A byte address in some (page-table translated) address space. |
//! | [`VirtualPage`] | A 4 KiB aligned virtual page. |
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let va = VirtualAddress::new(0x0000_7fff_0000_1234);
//! let page = va.page();
//! assert_eq!(page.base().as_u64(), 0x0000_7fff_0000_1000);
//! assert_eq!(va.page_offset(), 0x234);
//!
//! let pa = PhysicalAddress::new(0x20_3042);
//! assert_eq!(pa.frame().number(), 0x203);
//! assert_eq!(pa.frame().base() + 0x42, pa);
//! ```
//!
//! ## Design Notes
//!
//! - The types are `#[repr(transparent)]` and implement `Copy`, `Eq`, `Ord`
//!   and `Hash`, making them suitable as map keys or for ABI use.
//! - All alignment calculations are `const fn`.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(clippy::inline_always)]

mod physical_address;
mod physical_frame;
mod virtual_address;
mod virtual_page;

pub use crate::physical_address::PhysicalAddress;
pub use crate::physical_frame::PhysicalFrame;
pub use crate::virtual_address::VirtualAddress;
pub use crate::virtual_page::VirtualPage;

/// Size of a physical frame or virtual page in bytes.
pub const FRAME_SIZE: u64 = 4096;

/// `log2(FRAME_SIZE)`, i.e. the number of in-page offset bits.
pub const FRAME_SHIFT: u32 = 12;

/// Align `x` down to the nearest multiple of `a`.
///
/// `a` must be a non-zero power of two.
///
/// ```rust
/// # use kernel_memory_addresses::align_down;
/// assert_eq!(align_down(0, 4096), 0);
/// assert_eq!(align_down(4095, 4096), 0);
/// assert_eq!(align_down(8191, 4096), 4096);
/// ```
#[inline(always)]
#[must_use]
pub const fn align_down(x: u64, a: u64) -> u64 {
    x & !(a - 1)
}

/// Align `x` up to the nearest multiple of `a`.
///
/// `a` must be a non-zero power of two and `x + (a - 1)` must not overflow.
///
/// ```rust
/// # use kernel_memory_addresses::align_up;
/// assert_eq!(align_up(0, 4096), 0);
/// assert_eq!(align_up(1, 4096), 4096);
/// assert_eq!(align_up(4097, 4096), 8192);
/// ```
#[inline(always)]
#[must_use]
pub const fn align_up(x: u64, a: u64) -> u64 {
    (x + a - 1) & !(a - 1)
}

/// Number of 4 KiB frames needed to hold `bytes` bytes.
#[inline(always)]
#[must_use]
pub const fn frames_for(bytes: u64) -> u64 {
    bytes.div_ceil(FRAME_SIZE)
}
