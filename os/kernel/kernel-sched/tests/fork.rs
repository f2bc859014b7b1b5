mod common;

use common::{IMAGE, World, idle_frame, run_until};
use kernel_alloc::{Access, VmError};
use kernel_info::memory::USER_IMAGE_BASE;
use kernel_memory_addresses::{FRAME_SIZE, PhysicalFrame, VirtualAddress};
use kernel_sched::{SchedError, Segment, ThreadState};
use kernel_vmem::PageOptions;

fn read(world: &World, root: PhysicalFrame, va: VirtualAddress, len: usize) -> Vec<u8> {
    let mut buf = vec![0; len];
    world.vmm.read_from(root, va, &mut buf).unwrap();
    buf
}

#[test]
fn fork_returns_twice() {
    let world = World::new(2048);
    let mut sched = world.scheduler();
    let parent = sched.create_process("parent", IMAGE).unwrap();
    let mut frame = idle_frame();
    run_until(&mut sched, &mut frame, parent);
    frame.rax = 5;
    frame.rbx = 0xfeed;
    sched.ipc_hint(256, None).unwrap();

    let child = sched.fork_current(&mut frame).unwrap();
    assert_ne!(child, parent);
    assert_eq!(frame.rax, child.as_u64());
    assert_eq!(sched.current().unwrap().0, parent);

    let process = sched.process(child).unwrap();
    assert_eq!(process.parent(), Some(parent));
    assert_eq!(process.ipc().capacity(), 256);
    let thread = &process.threads()[0];
    assert_eq!(thread.state(), ThreadState::Running);
    assert_eq!(thread.regs().rax, 0);
    assert_eq!(thread.regs().rbx, 0xfeed);
    assert_eq!(thread.regs().rip, frame.rip);
    assert_eq!(
        sched.process(parent).unwrap().threads()[0].state(),
        ThreadState::Running
    );

    run_until(&mut sched, &mut frame, child);
    assert_eq!(frame.rax, 0);
}

#[test]
fn child_sees_the_same_bytes_through_the_same_frames() {
    let world = World::new(2048);
    let mut sched = world.scheduler();
    let parent = sched.create_process("parent", IMAGE).unwrap();
    let mut frame = idle_frame();
    run_until(&mut sched, &mut frame, parent);
    let heap = sched.mmap_current(2 * FRAME_SIZE).unwrap();
    sched.copy_to_user(heap + 0x1ff0, b"straddles a page").unwrap();

    let child = sched.fork_current(&mut frame).unwrap();
    let (p, c) = (sched.process(parent).unwrap(), sched.process(child).unwrap());
    assert_ne!(p.root(), c.root());
    assert_eq!(c.regions().len(), p.regions().len());

    let image = VirtualAddress::new(USER_IMAGE_BASE);
    assert_eq!(read(&world, c.root(), image, IMAGE.len()), IMAGE);
    assert_eq!(read(&world, c.root(), heap + 0x1ff0, 16), b"straddles a page");
    assert_eq!(
        world.vmm.translate_in(c.root(), heap),
        world.vmm.translate_in(p.root(), heap)
    );

    // Both owners lost write access and carry the copy-on-write marker.
    for root in [p.root(), c.root()] {
        let leaf = world.vmm.leaf_in(root, heap.page()).unwrap();
        assert!(!leaf.options().contains(PageOptions::WRITABLE));
        assert!(leaf.options().contains(PageOptions::COPY_ON_WRITE));
    }
    // The raw image is writable as well, so it is shared the same way.
    let text = world.vmm.leaf_in(c.root(), image.page()).unwrap();
    assert!(text.options().contains(PageOptions::COPY_ON_WRITE));
}

#[test]
fn writes_after_fork_are_private() {
    let world = World::new(2048);
    let mut sched = world.scheduler();
    let parent = sched.create_process("parent", IMAGE).unwrap();
    let mut frame = idle_frame();
    run_until(&mut sched, &mut frame, parent);
    let heap = sched.mmap_current(FRAME_SIZE).unwrap();
    sched.copy_to_user(heap, b"original").unwrap();
    let child = sched.fork_current(&mut frame).unwrap();
    let shared = world.vmm.translate_in(sched.process(parent).unwrap().root(), heap);

    // The child takes the write fault first and gets its own copy.
    run_until(&mut sched, &mut frame, child);
    let used = world.used_frames();
    sched.resolve_copy_on_write(heap + 3).unwrap();
    assert_eq!(world.used_frames(), used + 1);
    sched.copy_to_user(heap, b"child!!!").unwrap();

    let child_root = sched.process(child).unwrap().root();
    let parent_root = sched.process(parent).unwrap().root();
    assert_ne!(world.vmm.translate_in(child_root, heap), shared);
    let leaf = world.vmm.leaf_in(child_root, heap.page()).unwrap();
    assert!(leaf.options().contains(PageOptions::WRITABLE));
    assert!(!leaf.options().contains(PageOptions::COPY_ON_WRITE));
    assert_eq!(read(&world, parent_root, heap, 8), b"original");

    // The parent is now the last owner: its fault re-permissions in place.
    run_until(&mut sched, &mut frame, parent);
    let used = world.used_frames();
    sched.resolve_copy_on_write(heap).unwrap();
    assert_eq!(world.used_frames(), used);
    assert_eq!(world.vmm.translate_in(parent_root, heap), shared);
    assert!(world.vmm.leaf_in(parent_root, heap.page()).unwrap().options().contains(PageOptions::WRITABLE));
    assert_eq!(read(&world, child_root, heap, 8), b"child!!!");

    // Nothing left to resolve.
    assert_eq!(
        sched.resolve_copy_on_write(heap),
        Err(SchedError::Vm(VmError::NotCopyOnWrite(heap)))
    );
}

#[test]
fn kernel_writes_into_shared_pages_stay_private() {
    let world = World::new(2048);
    let mut sched = world.scheduler();
    let parent = sched.create_process("parent", IMAGE).unwrap();
    let mut frame = idle_frame();
    run_until(&mut sched, &mut frame, parent);
    let heap = sched.mmap_current(FRAME_SIZE).unwrap();
    sched.copy_to_user(heap, b"original").unwrap();
    let child = sched.fork_current(&mut frame).unwrap();

    // No user fault happens first: the kernel copies straight into the child.
    run_until(&mut sched, &mut frame, child);
    sched.copy_to_user(heap, b"kernel!!").unwrap();

    let child_root = sched.process(child).unwrap().root();
    let parent_root = sched.process(parent).unwrap().root();
    assert_eq!(read(&world, child_root, heap, 8), b"kernel!!");
    assert_eq!(read(&world, parent_root, heap, 8), b"original");
    assert!(!world.vmm.leaf_in(child_root, heap.page()).unwrap().options().contains(PageOptions::COPY_ON_WRITE));
}

#[test]
fn shared_frames_outlive_either_owner() {
    let world = World::new(2048);
    let mut sched = world.scheduler();
    world.vmm.free_pages(world.vmm.allocate_pages(1), 1);
    let parent = sched.create_process("parent", IMAGE).unwrap();
    let mut frame = idle_frame();
    run_until(&mut sched, &mut frame, parent);
    let heap = sched.mmap_current(FRAME_SIZE).unwrap();
    sched.copy_to_user(heap, b"kept").unwrap();
    let before_fork = world.used_frames();

    let child = sched.fork_current(&mut frame).unwrap();
    sched.kill_current_process(&mut frame).unwrap();
    assert_eq!(sched.current().unwrap().0, child);
    let child_root = sched.process(child).unwrap().root();
    assert_eq!(read(&world, child_root, heap, 4), b"kept");

    // Sole owner now: resolving needs no new frame.
    let used = world.used_frames();
    sched.resolve_copy_on_write(heap).unwrap();
    assert_eq!(world.used_frames(), used);

    sched.kill_current_process(&mut frame).unwrap();
    sched.timer_callback(&mut frame);
    assert!(sched.processes().is_empty());
    assert!(world.used_frames() < before_fork);
}

#[test]
fn read_only_regions_never_resolve() {
    let world = World::new(2048);
    let mut sched = world.scheduler();
    let code = [0xc3u8; 16];
    let segments = [Segment {
        vaddr: VirtualAddress::new(0x40_0000),
        mem_size: 16,
        data: &code,
        access: Access::READ | Access::EXECUTE,
    }];
    let pid = sched
        .create_process_from_elf("ro", VirtualAddress::new(0x40_0000), &segments)
        .unwrap();
    let mut frame = idle_frame();
    run_until(&mut sched, &mut frame, pid);
    sched.fork_current(&mut frame).unwrap();

    let va = VirtualAddress::new(0x40_0004);
    assert_eq!(
        sched.resolve_copy_on_write(va),
        Err(SchedError::Vm(VmError::NotCopyOnWrite(va)))
    );
    let outside = VirtualAddress::new(0x50_0000);
    assert!(sched.resolve_copy_on_write(outside).is_err());
}

#[test]
fn fork_without_memory_leaves_the_parent_alone() {
    let world = World::new(2048);
    let mut sched = world.scheduler();
    let parent = sched.create_process("parent", IMAGE).unwrap();
    let mut frame = idle_frame();
    run_until(&mut sched, &mut frame, parent);
    frame.rax = 5;

    let mut hoard = Vec::new();
    while let Ok(pa) = world.pm.lock().try_allocate_pages(1) {
        hoard.push(pa);
    }
    assert_eq!(sched.fork_current(&mut frame), Err(SchedError::OutOfMemory));
    assert_eq!(frame.rax, 5);
    assert_eq!(sched.processes().len(), 1);
    assert_eq!(
        sched.process(parent).unwrap().threads()[0].state(),
        ThreadState::Running
    );
    for pa in hoard {
        world.pm.lock().free_pages(pa, 1);
    }
    assert!(sched.fork_current(&mut frame).is_ok());
}
