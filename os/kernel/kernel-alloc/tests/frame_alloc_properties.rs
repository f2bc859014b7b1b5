//! Property tests for the bitmap frame allocator.

use kernel_alloc::frame_alloc::{BitmapFrameAlloc, MAX_FRAMES_PER_ALLOCATION};
use kernel_info::boot::{MemoryMapEntry, MemoryRegionKind};
use kernel_memory_addresses::{FRAME_SIZE, PhysicalAddress};
use kernel_vmem::test_support::TestPhys;
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    Allocate(usize),
    /// Free the live allocation at this index (modulo the live count).
    Free(usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (1..=MAX_FRAMES_PER_ALLOCATION).prop_map(Op::Allocate),
        2 => any::<usize>().prop_map(Op::Free),
    ]
}

fn overlaps(a: (u64, usize), b: (u64, usize)) -> bool {
    let end = |(base, count): (u64, usize)| base + count as u64 * FRAME_SIZE;
    a.0 < end(b) && b.0 < end(a)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn live_allocations_never_overlap(ops in prop::collection::vec(op(), 1..200)) {
        let phys = TestPhys::with_frames(512);
        // Two regions with a hole, to exercise region selection.
        let map = [
            MemoryMapEntry::new(0, 200 * FRAME_SIZE, MemoryRegionKind::Usable),
            MemoryMapEntry::new(200 * FRAME_SIZE, 8 * FRAME_SIZE, MemoryRegionKind::Reserved),
            MemoryMapEntry::new(208 * FRAME_SIZE, 304 * FRAME_SIZE, MemoryRegionKind::Usable),
        ];
        let mut pm = unsafe { BitmapFrameAlloc::new(&phys, &map) }.unwrap();
        let total = pm.total_frames();
        let mut live: Vec<(u64, usize)> = Vec::new();

        for op in ops {
            match op {
                Op::Allocate(count) => {
                    if let Ok(pa) = pm.try_allocate_pages(count) {
                        prop_assert!(pa.is_frame_aligned());
                        let run = (pa.as_u64(), count);
                        for &other in &live {
                            prop_assert!(!overlaps(run, other), "{run:x?} overlaps {other:x?}");
                        }
                        // Never inside the reserved hole.
                        prop_assert!(!overlaps(run, (200 * FRAME_SIZE, 8)));
                        live.push(run);
                    }
                }
                Op::Free(i) if !live.is_empty() => {
                    let (base, count) = live.swap_remove(i % live.len());
                    pm.free_pages(PhysicalAddress::new(base), count);
                }
                Op::Free(_) => {}
            }
            prop_assert_eq!(pm.free_frames() + pm.used_frames(), total);
        }

        let live_frames: u64 = live.iter().map(|&(_, n)| n as u64).sum();
        // The single bitmap frame is the only other used frame.
        prop_assert_eq!(pm.used_frames(), live_frames + 1);
    }
}

#[test]
fn freeing_everything_restores_the_initial_state() {
    let phys = TestPhys::with_frames(256);
    let mut pm = unsafe { BitmapFrameAlloc::new(&phys, &[phys.usable_region()]) }.unwrap();
    let initial = pm.free_frames();

    let runs: Vec<_> = [5, 64, 1, 17, 33].iter().map(|&n| (pm.allocate_pages(n), n)).collect();
    for &(pa, n) in runs.iter().rev() {
        pm.free_pages(pa, n);
    }
    assert_eq!(pm.free_frames(), initial);

    // No fragmentation is left behind: the whole region splits into maximal runs.
    for _ in 0..3 {
        pm.allocate_pages(64);
    }
    pm.allocate_pages(63);
    assert_eq!(pm.free_frames(), 0);
}
