//! A kernel on simulated RAM, driven the way the interrupt stubs drive it.

#![allow(dead_code)]

use kernel::{DebugSink, Kernel};
use kernel_alloc::{BitmapFrameAlloc, Vmm};
use kernel_info::boot::KernelImage;
use kernel_memory_addresses::{PhysicalFrame, VirtualAddress};
use kernel_sched::{InterruptFrame, ProcessId, SchedulerConfig};
use kernel_sync::SpinLock;
use kernel_syscall::Sysno;
use kernel_vmem::test_support::{MockMmu, TestPhys};

pub type TestKernel = Kernel<'static, TestPhys, MockMmu, Recorder>;

/// Keeps everything user programs write to the debug console.
#[derive(Debug, Default)]
pub struct Recorder(pub Vec<u8>);

impl DebugSink for Recorder {
    fn write(&mut self, bytes: &[u8]) {
        self.0.extend_from_slice(bytes);
    }
}

pub struct World {
    pub vmm: &'static Vmm<'static, TestPhys, MockMmu>,
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
            pm,
        }
    }

    /// A started kernel that switches threads on every timer tick.
    pub fn kernel(&self) -> TestKernel {
        let config = SchedulerConfig {
            quantum: 1,
            ..SchedulerConfig::default()
        };
        let mut kernel = Kernel::new(self.vmm, config, Recorder::default());
        kernel.start(idle_frame());
        kernel
    }

    pub fn read(&self, root: PhysicalFrame, va: VirtualAddress, len: usize) -> Vec<u8> {
        let mut buf = vec![0; len];
        self.vmm.read_from(root, va, &mut buf).unwrap();
        buf
    }
}

pub fn idle_frame() -> InterruptFrame {
    InterruptFrame::kernel(
        VirtualAddress::new(0xffff_ffff_8000_0100),
        VirtualAddress::new(0xffff_ffff_8001_0000),
    )
}

/// Raw user image; only ever read back.
pub const IMAGE: &[u8] = b"hello from user space\n";

/// Tick the timer until `pid` is current.
pub fn run_until(kernel: &mut TestKernel, frame: &mut InterruptFrame, pid: ProcessId) {
    for _ in 0..=kernel.scheduler().processes().len() * 4 {
        if kernel.scheduler().current().is_some_and(|(current, _)| current == pid) {
            return;
        }
        kernel.timer_interrupt(frame);
    }
    panic!("{pid} never became current");
}

/// Issue system call `no` from the context in `frame` and return `rax`.
pub fn syscall(kernel: &mut TestKernel, frame: &mut InterruptFrame, no: Sysno, args: &[u64]) -> u64 {
    let mut regs = [0u64; 5];
    regs[..args.len()].copy_from_slice(args);
    frame.rax = no as u64;
    frame.rdi = regs[0];
    frame.rsi = regs[1];
    frame.rdx = regs[2];
    frame.r10 = regs[3];
    frame.r8 = regs[4];
    kernel.syscall(frame);
    frame.rax
}

pub fn current_pid(kernel: &TestKernel) -> Option<ProcessId> {
    kernel.scheduler().current().map(|(pid, _)| pid)
}
