//! System call dispatch.
//!
//! Every pointer argument is validated against the caller's regions before
//! the kernel reads or writes through it. Calls that switch context (exit,
//! a blocking receive, or a kill on exhaustion) leave `rax` of the newly
//! loaded frame alone.

use crate::{DebugSink, Kernel};
use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;
use kernel_memory_addresses::VirtualAddress;
use kernel_sched::ipc::MAX_IPC_CAPACITY;
use kernel_sched::{InterruptFrame, ProcessId, RecvOutcome, SchedError};
use kernel_syscall::{MAX_PIPE_NAME_LEN, Syscall, SyscallError, SyscallResult, encode_result};
use kernel_vmem::{Mmu, PhysMapper};

/// Bytes moved per step of `debug_write`.
const DEBUG_CHUNK: usize = 256;

impl<M: PhysMapper, H: Mmu, D: DebugSink> Kernel<'_, M, H, D> {
    /// System call entry: decode `rax` and the argument registers of
    /// `frame`, run the call and store the encoded result in `rax`.
    pub fn syscall(&mut self, frame: &mut InterruptFrame) {
        let call = match Syscall::decode(frame.rax, frame.syscall_args()) {
            Ok(call) => call,
            Err(e) => {
                log::warn!("unknown system call {:#x}", frame.rax);
                frame.rax = e.as_return();
                return;
            }
        };
        log::trace!("syscall {call:?}");
        if let Some(result) = self.dispatch(call, frame) {
            frame.rax = encode_result(result);
        }
    }

    /// Run `call`. `None` means `frame` now holds another context.
    fn dispatch(&mut self, call: Syscall, frame: &mut InterruptFrame) -> Option<SyscallResult> {
        match call {
            Syscall::DebugWrite { ptr, len } => Some(self.debug_write(VirtualAddress::new(ptr), len)),
            Syscall::Mmap { size } => {
                let mapped = self.sched.mmap_current(size);
                self.or_kill(frame, mapped, "out of memory in mmap")
                    .map(|r| r.map(VirtualAddress::as_u64))
            }
            Syscall::Munmap { ptr } => {
                if !self.munmap_warned {
                    self.munmap_warned = true;
                    log::warn!("munmap({ptr:#x}) is not supported; memory is reclaimed at exit");
                }
                Some(Err(SyscallError::NotImplemented))
            }
            Syscall::Exit { code } => {
                if let Some((pid, _)) = self.sched.current() {
                    log::info!("{pid} exited with code {code}");
                }
                match self.sched.kill_current_process(frame) {
                    Ok(()) => None,
                    Err(e) => Some(Err(e.into())),
                }
            }
            Syscall::Fork => {
                let forked = self.sched.fork_current(frame);
                self.or_kill(frame, forked, "out of memory in fork")
                    .map(|r| r.map(ProcessId::as_u64))
            }
            Syscall::IpcHint {
                max_size,
                name_ptr,
                name_len,
            } => Some(self.ipc_hint(max_size, name_ptr, name_len)),
            Syscall::IpcSendPipe {
                ptr,
                len,
                name_ptr,
                name_len,
            } => {
                let sent = self.ipc_send_pipe(VirtualAddress::new(ptr), len, name_ptr, name_len);
                match sent {
                    Ok(result) => Some(result),
                    Err(e) => self.or_kill(frame, Err(e), "out of memory delivering to itself"),
                }
            }
            Syscall::IpcRecv { ptr, max_len, blocking } => {
                let max_len = usize::try_from(max_len).unwrap_or(usize::MAX);
                let received = self.sched.ipc_recv(frame, VirtualAddress::new(ptr), max_len, blocking);
                match self.or_kill(frame, received, "out of memory receiving")? {
                    Ok(RecvOutcome::Received(len)) => Some(Ok(len as u64)),
                    Ok(RecvOutcome::Blocked) => None,
                    Err(e) => Some(Err(e)),
                }
            }
        }
    }

    fn debug_write(&mut self, ptr: VirtualAddress, len: u64) -> SyscallResult {
        self.sched.validate_current(ptr, len)?;
        let mut buf = [0u8; DEBUG_CHUNK];
        let mut done = 0u64;
        while done < len {
            let n = usize::try_from(len - done).map_or(DEBUG_CHUNK, |rest| rest.min(DEBUG_CHUNK));
            let at = VirtualAddress::new(ptr.as_u64() + done);
            self.sched.copy_from_user(at, &mut buf[..n])?;
            self.debug.write(&buf[..n]);
            done += n as u64;
        }
        Ok(len)
    }

    fn ipc_hint(&mut self, max_size: u64, name_ptr: u64, name_len: u64) -> SyscallResult {
        let name = if name_len == 0 {
            None
        } else {
            Some(self.user_str(VirtualAddress::new(name_ptr), name_len)?)
        };
        let max_size = usize::try_from(max_size).unwrap_or(usize::MAX);
        let capacity = self.sched.ipc_hint(max_size, name.as_deref())?;
        Ok(capacity as u64)
    }

    /// Send a user buffer down a pipe. Exhaustion while delivering into the
    /// caller's own receive buffer comes back as `Err` for the caller to
    /// handle; every other failure is an ordinary result.
    fn ipc_send_pipe(
        &mut self,
        ptr: VirtualAddress,
        len: u64,
        name_ptr: u64,
        name_len: u64,
    ) -> Result<SyscallResult, SchedError> {
        let (name, data) = match self.pipe_payload(ptr, len, name_ptr, name_len) {
            Ok(payload) => payload,
            Err(e) => return Ok(Err(e)),
        };
        match self.sched.ipc_send_pipe(&name, &data) {
            Ok(()) => Ok(Ok(0)),
            Err(SchedError::OutOfMemory) => Err(SchedError::OutOfMemory),
            Err(e) => Ok(Err(e.into())),
        }
    }

    /// Copy the pipe name and the message out of the current process.
    fn pipe_payload(
        &self,
        ptr: VirtualAddress,
        len: u64,
        name_ptr: u64,
        name_len: u64,
    ) -> Result<(String, Vec<u8>), SyscallError> {
        let name = self.user_str(VirtualAddress::new(name_ptr), name_len)?;
        let len = usize::try_from(len)
            .ok()
            .filter(|&len| len <= MAX_IPC_CAPACITY)
            .ok_or(SyscallError::MessageTooLarge)?;
        let mut data = vec![0u8; len];
        self.sched.copy_from_user(ptr, &mut data)?;
        Ok((name, data))
    }

    /// Memory exhaustion caused by the caller kills it (`None`, `frame`
    /// holds the next context). Other errors become syscall errors.
    fn or_kill<T>(
        &mut self,
        frame: &mut InterruptFrame,
        result: Result<T, SchedError>,
        reason: &str,
    ) -> Option<Result<T, SyscallError>> {
        match result {
            Err(SchedError::OutOfMemory) => {
                self.kill_current(frame, reason);
                None
            }
            other => Some(other.map_err(SyscallError::from)),
        }
    }

    /// Copy a pipe name out of the current process.
    fn user_str(&self, ptr: VirtualAddress, len: u64) -> Result<String, SyscallError> {
        let len = usize::try_from(len)
            .ok()
            .filter(|&len| (1..=MAX_PIPE_NAME_LEN).contains(&len))
            .ok_or(SyscallError::InvalidArgument)?;
        let mut buf = [0u8; MAX_PIPE_NAME_LEN];
        self.sched.copy_from_user(ptr, &mut buf[..len])?;
        let name = core::str::from_utf8(&buf[..len]).map_err(|_| SyscallError::InvalidArgument)?;
        Ok(String::from(name))
    }
}
