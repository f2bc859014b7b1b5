//! Pipe registration and message delivery between processes.

use super::Scheduler;
use super::lifecycle::prepare_user_write;
use crate::error::SchedError;
use crate::frame::InterruptFrame;
use crate::ipc::{IpcError, Message};
use crate::thread::{ThreadState, WaitCondition};
use alloc::string::String;
use kernel_memory_addresses::VirtualAddress;
use kernel_syscall::{MAX_PIPE_NAME_LEN, SyscallError};
use kernel_vmem::{Mmu, PhysMapper};

/// Result of a receive that did not fail.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RecvOutcome {
    /// A message of this many bytes was copied out.
    Received(usize),
    /// The thread now waits; `frame` holds another context. The message
    /// length is delivered in the waiting thread's `rax` later.
    Blocked,
}

impl<M: PhysMapper, H: Mmu> Scheduler<'_, M, H> {
    /// Resize the current process's message buffer and optionally register
    /// a pipe name for it. Returns the capacity actually reserved.
    ///
    /// Registering a name the process already owns is a no-op.
    ///
    /// # Errors
    /// - [`IpcError::InvalidName`] for empty or overlong names,
    /// - [`IpcError::PipeNameTaken`] if another process owns the name.
    pub fn ipc_hint(&mut self, max_size: usize, pipe: Option<&str>) -> Result<usize, SchedError> {
        let (pi, _) = self.current_indices()?;
        let pid = self.processes[pi].id();
        if let Some(name) = pipe {
            if name.is_empty() || name.len() > MAX_PIPE_NAME_LEN {
                return Err(IpcError::InvalidName.into());
            }
            match self.pipes.get(name) {
                Some(&owner) if owner != pid => return Err(IpcError::PipeNameTaken.into()),
                Some(_) => {}
                None => {
                    self.pipes.insert(String::from(name), pid);
                    log::debug!("{pid} registered pipe {name:?}");
                }
            }
        }
        Ok(self.processes[pi].ipc.set_capacity(max_size))
    }

    /// Send `data` to the owner of pipe `name`.
    ///
    /// A receiver already blocked on the owner gets the message copied
    /// straight into its buffer and is woken with the length in `rax`.
    /// Otherwise the message is queued.
    ///
    /// Copying into a copy-on-write receive buffer may need frames. If none
    /// are left the receiver is killed, as if it had faulted on the write
    /// itself.
    ///
    /// # Errors
    /// - [`IpcError::NoSuchPipe`], also if the owner was killed on delivery,
    /// - [`IpcError::BufferFull`] / [`IpcError::MessageTooLarge`] if the
    ///   owner's buffer cannot take the message,
    /// - [`SchedError::OutOfMemory`] if the sender is its own receiver and
    ///   delivery ran out of frames; the caller decides its fate.
    pub fn ipc_send_pipe(&mut self, name: &str, data: &[u8]) -> Result<(), SchedError> {
        let (sender, _) = self.current.ok_or(SchedError::NoCurrentProcess)?;
        let owner = self.pipe_owner(name).ok_or(IpcError::NoSuchPipe)?;
        let vmm = self.vmm;
        let receiver = self.process_mut(owner).ok_or(IpcError::NoSuchPipe)?;
        let root = receiver.root();

        let waiting = receiver.threads.iter().enumerate().find_map(|(ti, t)| {
            match (t.state(), t.wait_condition()) {
                (ThreadState::WaitingOnMessage, Some(WaitCondition::Message { buffer, max_len })) => {
                    Some((ti, buffer, max_len))
                }
                _ => None,
            }
        });
        let message = Message {
            sender,
            data: data.to_vec(),
        };

        match waiting {
            Some((ti, buffer, max_len)) if data.len() <= max_len => {
                let delivered = prepare_user_write(vmm, receiver, buffer, data.len() as u64)
                    .and_then(|()| vmm.write_to(root, buffer, data).map_err(SchedError::from));
                let rax = match delivered {
                    Ok(()) => data.len() as u64,
                    Err(SchedError::OutOfMemory) if owner == sender => return Err(SchedError::OutOfMemory),
                    Err(SchedError::OutOfMemory) => {
                        log::warn!("{owner}: out of memory taking delivery at {buffer}");
                        self.kill_process(owner)?;
                        return Err(IpcError::NoSuchPipe.into());
                    }
                    Err(e) => {
                        log::warn!("{owner}: receive buffer {buffer} unusable: {e}");
                        receiver.ipc.push(message)?;
                        SyscallError::from(e).as_return()
                    }
                };
                receiver.threads[ti].wake(rax);
                log::trace!("{sender} → {owner}: {} bytes delivered directly", data.len());
            }
            Some((ti, _, _)) => {
                receiver.ipc.push(message)?;
                receiver.threads[ti].wake(SyscallError::MessageTooLarge.as_return());
            }
            None => {
                receiver.ipc.push(message)?;
                log::trace!("{sender} → {owner}: {} bytes queued", data.len());
            }
        }
        Ok(())
    }

    /// Receive the next message of the current process into `buffer`.
    ///
    /// A message longer than `max_len` stays queued.
    ///
    /// # Errors
    /// - [`SchedError::UserPointer`] for a refused buffer,
    /// - [`IpcError::MessageTooLarge`] if the next message exceeds `max_len`,
    /// - [`IpcError::WouldBlock`] if nothing is queued and `blocking` is off.
    pub fn ipc_recv(
        &mut self,
        frame: &mut InterruptFrame,
        buffer: VirtualAddress,
        max_len: usize,
        blocking: bool,
    ) -> Result<RecvOutcome, SchedError> {
        self.validate_current(buffer, max_len as u64)?;
        let (pi, tid) = self.current_indices()?;
        let process = &mut self.processes[pi];

        if let Some(len) = process.ipc.peek_len() {
            if len > max_len {
                return Err(IpcError::MessageTooLarge {
                    len,
                    capacity: max_len,
                }
                .into());
            }
            prepare_user_write(self.vmm, process, buffer, len as u64)?;
            let root = process.root();
            if let Some(message) = process.ipc.pop() {
                self.vmm.write_to(root, buffer, &message.data)?;
            }
            return Ok(RecvOutcome::Received(len));
        }

        if !blocking {
            return Err(IpcError::WouldBlock.into());
        }
        if let Some(thread) = process.thread_mut(tid) {
            thread.block_on(WaitCondition::Message { buffer, max_len });
        }
        self.save_context(frame);
        self.schedule(frame);
        Ok(RecvOutcome::Blocked)
    }
}
