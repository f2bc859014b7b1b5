mod common;

use common::{IMAGE, TestKernel, World, current_pid, idle_frame, run_until, syscall};
use kernel_info::memory::{USER_IMAGE_BASE, USER_MMAP_BASE};
use kernel_memory_addresses::{FRAME_SIZE, VirtualAddress};
use kernel_sched::{InterruptFrame, ProcessId, ThreadState};
use kernel_syscall::{SyscallError, Sysno};

fn err(e: SyscallError) -> u64 {
    e.as_return()
}

#[test]
fn debug_write_copies_user_bytes_to_the_sink() {
    let world = World::new(2048);
    let mut kernel = world.kernel();
    let pid = kernel.spawn_init("init", IMAGE).unwrap();
    let mut frame = idle_frame();
    run_until(&mut kernel, &mut frame, pid);

    let len = IMAGE.len() as u64;
    assert_eq!(syscall(&mut kernel, &mut frame, Sysno::DebugWrite, &[USER_IMAGE_BASE, len]), len);
    assert_eq!(kernel.debug_sink().0, IMAGE);
}

#[test]
fn debug_write_spanning_many_chunks() {
    let world = World::new(2048);
    let mut kernel = world.kernel();
    let pid = kernel.spawn_init("init", IMAGE).unwrap();
    let mut frame = idle_frame();
    run_until(&mut kernel, &mut frame, pid);

    let page = syscall(&mut kernel, &mut frame, Sysno::Mmap, &[FRAME_SIZE]);
    let text: Vec<u8> = (0..1000u32).map(|i| b'a' + (i % 26) as u8).collect();
    kernel.scheduler_mut().copy_to_user(VirtualAddress::new(page), &text).unwrap();

    assert_eq!(syscall(&mut kernel, &mut frame, Sysno::DebugWrite, &[page, 1000]), 1000);
    assert_eq!(kernel.debug_sink().0, text);
}

#[test]
fn bad_pointers_are_refused_before_any_copy() {
    let world = World::new(2048);
    let mut kernel = world.kernel();
    let pid = kernel.spawn_init("init", IMAGE).unwrap();
    let mut frame = idle_frame();
    run_until(&mut kernel, &mut frame, pid);

    let unmapped = syscall(&mut kernel, &mut frame, Sysno::DebugWrite, &[0x1000, 4]);
    assert_eq!(unmapped, err(SyscallError::InvalidPointer));
    let kernel_half = syscall(&mut kernel, &mut frame, Sysno::DebugWrite, &[0xffff_8000_0000_0000, 4]);
    assert_eq!(kernel_half, err(SyscallError::InvalidPointer));
    let overflow = syscall(&mut kernel, &mut frame, Sysno::DebugWrite, &[USER_IMAGE_BASE, u64::MAX]);
    assert_eq!(overflow, err(SyscallError::InvalidPointer));
    assert!(kernel.debug_sink().0.is_empty());

    // Nothing to copy, nothing to check.
    assert_eq!(syscall(&mut kernel, &mut frame, Sysno::DebugWrite, &[0x1000, 0]), 0);
}

#[test]
fn unknown_numbers_fail_without_side_effects() {
    let world = World::new(2048);
    let mut kernel = world.kernel();
    let pid = kernel.spawn_init("init", IMAGE).unwrap();
    let mut frame = idle_frame();
    run_until(&mut kernel, &mut frame, pid);

    frame.rax = 0x1234;
    kernel.syscall(&mut frame);
    assert_eq!(frame.rax, err(SyscallError::UnknownSyscall));
    assert_eq!(current_pid(&kernel), Some(pid));
}

#[test]
fn mmap_hands_out_consecutive_zeroed_ranges() {
    let world = World::new(2048);
    let mut kernel = world.kernel();
    let pid = kernel.spawn_init("init", IMAGE).unwrap();
    let mut frame = idle_frame();
    run_until(&mut kernel, &mut frame, pid);

    let first = syscall(&mut kernel, &mut frame, Sysno::Mmap, &[100]);
    let second = syscall(&mut kernel, &mut frame, Sysno::Mmap, &[2 * FRAME_SIZE]);
    assert_eq!(first, USER_MMAP_BASE);
    assert_eq!(second, USER_MMAP_BASE + FRAME_SIZE);

    let root = kernel.scheduler().process(pid).unwrap().root();
    assert_eq!(world.read(root, VirtualAddress::new(second), 16), [0; 16]);
    assert_eq!(syscall(&mut kernel, &mut frame, Sysno::Mmap, &[0]), err(SyscallError::InvalidArgument));
}

#[test]
fn munmap_is_not_implemented() {
    let world = World::new(2048);
    let mut kernel = world.kernel();
    let pid = kernel.spawn_init("init", IMAGE).unwrap();
    let mut frame = idle_frame();
    run_until(&mut kernel, &mut frame, pid);

    let page = syscall(&mut kernel, &mut frame, Sysno::Mmap, &[FRAME_SIZE]);
    for _ in 0..2 {
        assert_eq!(
            syscall(&mut kernel, &mut frame, Sysno::Munmap, &[page]),
            err(SyscallError::NotImplemented)
        );
    }
    // The mapping stays usable.
    kernel.scheduler_mut().copy_to_user(VirtualAddress::new(page), b"still here").unwrap();
}

#[test]
fn exit_removes_the_process_and_resumes_another() {
    let world = World::new(2048);
    let mut kernel = world.kernel();
    let first = kernel.spawn_init("first", IMAGE).unwrap();
    let second = kernel.scheduler_mut().create_process("second", IMAGE).unwrap();
    let mut frame = idle_frame();
    run_until(&mut kernel, &mut frame, first);

    frame.rbx = 0xdead;
    syscall(&mut kernel, &mut frame, Sysno::Exit, &[3]);
    assert!(kernel.scheduler().process(first).is_none());
    assert_eq!(current_pid(&kernel), Some(second));
    assert_eq!(frame, *kernel.scheduler().process(second).unwrap().threads()[0].regs());

    // The last exit falls back to the idle context.
    syscall(&mut kernel, &mut frame, Sysno::Exit, &[0]);
    assert!(kernel.scheduler().processes().is_empty());
    assert_eq!(current_pid(&kernel), None);
    assert_eq!(frame, idle_frame());
}

#[test]
fn fork_returns_the_child_pid_to_the_parent_and_zero_to_the_child() {
    let world = World::new(2048);
    let mut kernel = world.kernel();
    let parent = kernel.spawn_init("parent", IMAGE).unwrap();
    let mut frame = idle_frame();
    run_until(&mut kernel, &mut frame, parent);

    let child = syscall(&mut kernel, &mut frame, Sysno::Fork, &[]);
    assert_ne!(child, parent.as_u64());
    assert_eq!(current_pid(&kernel), Some(parent));

    let process = kernel
        .scheduler()
        .processes()
        .iter()
        .find(|p| p.id().as_u64() == child)
        .unwrap();
    assert_eq!(process.parent(), Some(parent));
    assert_eq!(process.threads()[0].regs().rax, 0);
    assert_eq!(process.threads()[0].regs().rip, frame.rip);
}

#[test]
fn fork_without_memory_kills_the_caller() {
    let world = World::new(2048);
    let mut kernel = world.kernel();
    let parent = kernel.spawn_init("parent", IMAGE).unwrap();
    let bystander = kernel.scheduler_mut().create_process("bystander", IMAGE).unwrap();
    let mut frame = idle_frame();
    run_until(&mut kernel, &mut frame, parent);

    let mut hoard = Vec::new();
    while let Ok(pa) = world.pm.lock().try_allocate_pages(1) {
        hoard.push(pa);
    }
    syscall(&mut kernel, &mut frame, Sysno::Fork, &[]);
    assert!(kernel.scheduler().process(parent).is_none());
    assert_eq!(current_pid(&kernel), Some(bystander));
    assert_eq!(kernel.scheduler().processes().len(), 1);
}

mod ipc {
    use super::*;

    const INBOX: u64 = 64;

    #[test]
    fn named_pipe_round_trip() {
        let world = World::new(2048);
        let mut kernel = world.kernel();
        let server = kernel.spawn_init("server", IMAGE).unwrap();
        let client = kernel.scheduler_mut().create_process("client", IMAGE).unwrap();
        let mut frame = idle_frame();

        run_until(&mut kernel, &mut frame, server);
        let page = syscall(&mut kernel, &mut frame, Sysno::Mmap, &[FRAME_SIZE]);
        kernel.scheduler_mut().copy_to_user(VirtualAddress::new(page), b"srv").unwrap();
        assert_eq!(syscall(&mut kernel, &mut frame, Sysno::IpcHint, &[1024, page, 3]), 1024);
        assert_eq!(
            syscall(&mut kernel, &mut frame, Sysno::IpcRecv, &[page + INBOX, 256, 0]),
            err(SyscallError::WouldBlock)
        );

        // Block; the client runs in the server's place.
        let server_tid = kernel.scheduler().current().unwrap().1;
        frame.rax = Sysno::IpcRecv as u64;
        frame.rdi = page + INBOX;
        frame.rsi = 256;
        frame.rdx = 1;
        kernel.syscall(&mut frame);
        assert_eq!(current_pid(&kernel), Some(client));
        let waiting = kernel.scheduler().process(server).unwrap().thread(server_tid).unwrap();
        assert_eq!(waiting.state(), ThreadState::WaitingOnMessage);

        let out = syscall(&mut kernel, &mut frame, Sysno::Mmap, &[FRAME_SIZE]);
        kernel.scheduler_mut().copy_to_user(VirtualAddress::new(out), b"srvping").unwrap();
        assert_eq!(syscall(&mut kernel, &mut frame, Sysno::IpcSendPipe, &[out + 3, 4, out, 3]), 0);

        let server_process = kernel.scheduler().process(server).unwrap();
        let woken = server_process.thread(server_tid).unwrap();
        assert_eq!(woken.state(), ThreadState::Running);
        assert_eq!(woken.regs().rax, 4);
        assert_eq!(world.read(server_process.root(), VirtualAddress::new(page + INBOX), 4), b"ping");

        // When the server runs again it resumes with the length in rax.
        run_until(&mut kernel, &mut frame, server);
        assert_eq!(frame.rax, 4);
    }

    #[test]
    fn queued_messages_are_received_without_blocking() {
        let world = World::new(2048);
        let mut kernel = world.kernel();
        let server = kernel.spawn_init("server", IMAGE).unwrap();
        let client = kernel.scheduler_mut().create_process("client", IMAGE).unwrap();
        let mut frame = idle_frame();

        run_until(&mut kernel, &mut frame, server);
        let page = syscall(&mut kernel, &mut frame, Sysno::Mmap, &[FRAME_SIZE]);
        kernel.scheduler_mut().copy_to_user(VirtualAddress::new(page), b"srv").unwrap();
        syscall(&mut kernel, &mut frame, Sysno::IpcHint, &[1024, page, 3]);

        run_until(&mut kernel, &mut frame, client);
        let out = syscall(&mut kernel, &mut frame, Sysno::Mmap, &[FRAME_SIZE]);
        kernel.scheduler_mut().copy_to_user(VirtualAddress::new(out), b"srvone\0two").unwrap();
        syscall(&mut kernel, &mut frame, Sysno::IpcSendPipe, &[out + 3, 3, out, 3]);
        syscall(&mut kernel, &mut frame, Sysno::IpcSendPipe, &[out + 7, 3, out, 3]);
        assert_eq!(
            syscall(&mut kernel, &mut frame, Sysno::IpcSendPipe, &[out + 3, 3, out + 3, 3]),
            err(SyscallError::NoSuchPipe)
        );

        run_until(&mut kernel, &mut frame, server);
        let root = kernel.scheduler().process(server).unwrap().root();
        assert_eq!(syscall(&mut kernel, &mut frame, Sysno::IpcRecv, &[page + INBOX, 2, 0]), err(SyscallError::MessageTooLarge));
        assert_eq!(syscall(&mut kernel, &mut frame, Sysno::IpcRecv, &[page + INBOX, 16, 0]), 3);
        assert_eq!(world.read(root, VirtualAddress::new(page + INBOX), 3), b"one");
        assert_eq!(syscall(&mut kernel, &mut frame, Sysno::IpcRecv, &[page + INBOX, 16, 1]), 3);
        assert_eq!(world.read(root, VirtualAddress::new(page + INBOX), 3), b"two");
    }

    #[test]
    fn pipe_names_are_validated() {
        let world = World::new(2048);
        let mut kernel = world.kernel();
        let first = kernel.spawn_init("first", IMAGE).unwrap();
        let second = kernel.scheduler_mut().create_process("second", IMAGE).unwrap();
        let mut frame = idle_frame();

        run_until(&mut kernel, &mut frame, first);
        let page = syscall(&mut kernel, &mut frame, Sysno::Mmap, &[FRAME_SIZE]);
        kernel.scheduler_mut().copy_to_user(VirtualAddress::new(page), b"name\xff").unwrap();
        assert_eq!(syscall(&mut kernel, &mut frame, Sysno::IpcHint, &[64, page, 4]), 64);
        // Registering the same name again is harmless.
        assert_eq!(syscall(&mut kernel, &mut frame, Sysno::IpcHint, &[128, page, 4]), 128);
        assert_eq!(syscall(&mut kernel, &mut frame, Sysno::IpcHint, &[64, page, 5]), err(SyscallError::InvalidArgument));
        assert_eq!(syscall(&mut kernel, &mut frame, Sysno::IpcHint, &[64, page, 65]), err(SyscallError::InvalidArgument));
        assert_eq!(syscall(&mut kernel, &mut frame, Sysno::IpcHint, &[64, 0x1000, 4]), err(SyscallError::InvalidPointer));

        run_until(&mut kernel, &mut frame, second);
        let page = syscall(&mut kernel, &mut frame, Sysno::Mmap, &[FRAME_SIZE]);
        kernel.scheduler_mut().copy_to_user(VirtualAddress::new(page), b"name").unwrap();
        assert_eq!(syscall(&mut kernel, &mut frame, Sysno::IpcHint, &[64, page, 4]), err(SyscallError::PipeNameTaken));
        // Without a name only the buffer is resized.
        assert_eq!(syscall(&mut kernel, &mut frame, Sysno::IpcHint, &[512, 0, 0]), 512);
    }

    #[test]
    fn oversized_sends_are_refused() {
        let world = World::new(2048);
        let mut kernel = world.kernel();
        let pid = kernel.spawn_init("solo", IMAGE).unwrap();
        let mut frame = idle_frame();
        run_until(&mut kernel, &mut frame, pid);

        let page = syscall(&mut kernel, &mut frame, Sysno::Mmap, &[FRAME_SIZE]);
        kernel.scheduler_mut().copy_to_user(VirtualAddress::new(page), b"me").unwrap();
        syscall(&mut kernel, &mut frame, Sysno::IpcHint, &[16, page, 2]);
        assert_eq!(
            syscall(&mut kernel, &mut frame, Sysno::IpcSendPipe, &[page, 1 << 20, page, 2]),
            err(SyscallError::MessageTooLarge)
        );
        assert_eq!(
            syscall(&mut kernel, &mut frame, Sysno::IpcSendPipe, &[page, 32, page, 2]),
            err(SyscallError::MessageTooLarge)
        );
        assert_eq!(syscall(&mut kernel, &mut frame, Sysno::IpcSendPipe, &[page, 16, page, 2]), 0);
        assert_eq!(
            syscall(&mut kernel, &mut frame, Sysno::IpcSendPipe, &[page, 1, page, 2]),
            err(SyscallError::BufferFull)
        );
    }

    /// A server whose inbox became copy-on-write through a fork.
    fn forked_server(kernel: &mut TestKernel, frame: &mut InterruptFrame) -> (ProcessId, ProcessId, u64) {
        let server = kernel.spawn_init("server", IMAGE).unwrap();
        run_until(kernel, frame, server);
        let page = syscall(kernel, frame, Sysno::Mmap, &[FRAME_SIZE]);
        kernel.scheduler_mut().copy_to_user(VirtualAddress::new(page), b"srv").unwrap();
        syscall(kernel, frame, Sysno::IpcHint, &[1024, page, 3]);
        let child = ProcessId::new(syscall(kernel, frame, Sysno::Fork, &[]));
        (server, child, page)
    }

    #[test]
    fn receiving_without_memory_kills_the_receiver() {
        let world = World::new(2048);
        let mut kernel = world.kernel();
        let mut frame = idle_frame();
        let (server, child, page) = forked_server(&mut kernel, &mut frame);
        assert_eq!(syscall(&mut kernel, &mut frame, Sysno::IpcSendPipe, &[page, 3, page, 3]), 0);

        let mut hoard = Vec::new();
        while let Ok(pa) = world.pm.lock().try_allocate_pages(1) {
            hoard.push(pa);
        }
        // Writing the message needs a private copy of the inbox page.
        syscall(&mut kernel, &mut frame, Sysno::IpcRecv, &[page + INBOX, 16, 0]);
        assert!(kernel.scheduler().process(server).is_none());
        assert_eq!(current_pid(&kernel), Some(child));
        assert_eq!(kernel.scheduler().pipe_owner("srv"), None);
    }

    #[test]
    fn delivery_without_memory_kills_the_receiver() {
        let world = World::new(2048);
        let mut kernel = world.kernel();
        let mut frame = idle_frame();
        let (server, child, page) = forked_server(&mut kernel, &mut frame);

        // The server blocks; its child runs and sends from its own copy.
        frame.rax = Sysno::IpcRecv as u64;
        frame.rdi = page + INBOX;
        frame.rsi = 16;
        frame.rdx = 1;
        kernel.syscall(&mut frame);
        assert_eq!(current_pid(&kernel), Some(child));

        let mut hoard = Vec::new();
        while let Ok(pa) = world.pm.lock().try_allocate_pages(1) {
            hoard.push(pa);
        }
        assert_eq!(
            syscall(&mut kernel, &mut frame, Sysno::IpcSendPipe, &[page, 3, page, 3]),
            err(SyscallError::NoSuchPipe)
        );
        assert!(kernel.scheduler().process(server).is_none());
        assert_eq!(current_pid(&kernel), Some(child));
    }
}
