//! Shared fixtures: a kernel address space on simulated RAM and helpers to
//! drive the scheduler the way the interrupt and syscall paths do.

#![allow(dead_code)]

use kernel_alloc::{BitmapFrameAlloc, Vmm};
use kernel_info::boot::KernelImage;
use kernel_memory_addresses::VirtualAddress;
use kernel_sched::{InterruptFrame, ProcessId, Scheduler, SchedulerConfig};
use kernel_sync::SpinLock;
use kernel_vmem::test_support::{MockMmu, TestPhys};

pub type TestScheduler = Scheduler<'static, TestPhys, MockMmu>;
pub type TestVmm = Vmm<'static, TestPhys, MockMmu>;

pub struct World {
    pub vmm: &'static TestVmm,
    pub mmu: &'static MockMmu,
    pub pm: &'static SpinLock<BitmapFrameAlloc<'static>>,
}

impl World {
    pub fn new(frames: usize) -> Self {
        let phys: &'static TestPhys = Box::leak(Box::new(TestPhys::with_frames(frames)));
        let mmu: &'static MockMmu = Box::leak(Box::new(MockMmu::new()));
        let alloc = unsafe { BitmapFrameAlloc::new(phys, &[phys.usable_region()]) }.unwrap();
        let pm: &'static _ = Box::leak(Box::new(SpinLock::new(alloc)));
        let vmm = Vmm::init(phys, mmu, pm, &[], &KernelImage::default()).unwrap();
        Self {
            vmm: Box::leak(Box::new(vmm)),
            mmu,
            pm,
        }
    }

    /// A started scheduler that switches on every tick, with an idle context.
    pub fn scheduler(&self) -> TestScheduler {
        let config = SchedulerConfig {
            quantum: 1,
            ..SchedulerConfig::default()
        };
        let mut sched = Scheduler::new(self.vmm, config);
        sched.set_idle_frame(idle_frame());
        sched.first_schedule();
        sched
    }

    pub fn used_frames(&self) -> u64 {
        self.pm.lock().used_frames()
    }
}

/// The context the scheduler falls back to when nothing is runnable.
pub fn idle_frame() -> InterruptFrame {
    InterruptFrame::kernel(
        VirtualAddress::new(0xffff_ffff_8000_0100),
        VirtualAddress::new(0xffff_ffff_8001_0000),
    )
}

/// A tiny raw user image; its content is only ever read back, never run.
pub const IMAGE: &[u8] = b"\x90\x90\x90\xeb\xfe user image bytes";

/// Run the scheduler until `pid` is current, simulating timer ticks.
pub fn run_until(sched: &mut TestScheduler, frame: &mut InterruptFrame, pid: ProcessId) {
    for _ in 0..=sched.processes().len() * 4 {
        if sched.current().is_some_and(|(current, _)| current == pid) {
            return;
        }
        sched.timer_callback(frame);
    }
    panic!("{pid} never became current");
}
