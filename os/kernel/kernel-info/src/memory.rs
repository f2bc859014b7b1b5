//! # Memory Layout

/// End (exclusive) of the canonical lower half. User mappings live below it.
pub const USERSPACE_END: u64 = 0x0000_8000_0000_0000;

/// First PML4 slot of the shared (kernel) half.
///
/// Entries `SHARED_PML4_INDEX..512` of every top-level table point at the same
/// PDPTs, so kernel mappings made after a process was created are visible in
/// that process as well.
pub const SHARED_PML4_INDEX: usize = 256;

/// A simple Higher Half Direct Map (HHDM) base.
/// Anything you map at [`HHDM_BASE`] + `pa` lets the kernel
/// access physical memory via a fixed offset.
pub const HHDM_BASE: u64 = 0xffff_8880_0000_0000;

/// Start of the kernel heap window used for page-granular kernel allocations.
pub const KERNEL_HEAP_BASE: u64 = 0xffff_c000_0000_0000;

/// End (exclusive) of the kernel heap window.
pub const KERNEL_HEAP_END: u64 = KERNEL_HEAP_BASE + 0x4000_0000; // 1 GiB

/// Where the kernel executes (VMA), matches the linker script.
pub const KERNEL_BASE: u64 = 0xffff_ffff_8000_0000;

/// Where the bootloader places the kernel bytes in *physical* memory (LMA).
pub const PHYS_LOAD: u64 = 0x0010_0000; // 1 MiB

/// Load address for raw (non-ELF) user images.
pub const USER_IMAGE_BASE: u64 = 0x0000_0000_0040_0000;

/// Start of the window `mmap` hands out anonymous memory from.
pub const USER_MMAP_BASE: u64 = 0x0000_1000_0000_0000;

/// Top (exclusive) of the initial user stack.
pub const USER_STACK_TOP: u64 = 0x0000_7fff_ffff_0000;

/// Size of the initial user stack.
pub const USER_STACK_SIZE: u64 = 16 * 1024;

/// Size of a thread's trap (privileged) stack.
pub const TRAP_STACK_SIZE: u64 = 16 * 1024;

/// The size of the boot kernel stack.
pub const KERNEL_STACK_SIZE: usize = 32 * 1024;

#[allow(clippy::cast_possible_truncation)]
const _: () = {
    assert!(KERNEL_STACK_SIZE.is_multiple_of(4096));
    assert!(TRAP_STACK_SIZE.is_multiple_of(4096));
    assert!(USER_STACK_SIZE.is_multiple_of(4096));
    assert!(USER_STACK_TOP.is_multiple_of(4096));
    assert!(USER_STACK_TOP <= USERSPACE_END);
    assert!(USER_MMAP_BASE < USER_STACK_TOP - USER_STACK_SIZE);
    assert!(USER_IMAGE_BASE < USER_MMAP_BASE);
    assert!(((HHDM_BASE >> 39) & 0x1ff) as usize >= SHARED_PML4_INDEX);
    assert!(KERNEL_HEAP_BASE > HHDM_BASE);
    assert!(KERNEL_HEAP_END <= KERNEL_BASE);
    assert!(KERNEL_BASE > HHDM_BASE);
};
