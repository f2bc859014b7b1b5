use crate::SyscallError;

/// System call numbers, as passed in `rax`.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
#[repr(u64)]
pub enum Sysno {
    /// `debug_write(ptr, len)`: write bytes to the kernel debug sink.
    DebugWrite = 1,
    /// `mmap(size) -> address`: map fresh zeroed anonymous memory.
    Mmap = 2,
    /// `munmap(ptr)`: not supported.
    Munmap = 3,
    /// `exit(code)`: terminate the calling process.
    Exit = 4,
    /// `fork() -> pid` (0 in the child).
    Fork = 5,
    /// `ipc_hint(max_size, name_ptr, name_len)`: size the message buffer,
    /// optionally registering a named pipe.
    IpcHint = 6,
    /// `ipc_send_pipe(ptr, len, name_ptr, name_len)`.
    IpcSendPipe = 7,
    /// `ipc_recv(ptr, max_len, blocking) -> len`.
    IpcRecv = 8,
}

impl TryFrom<u64> for Sysno {
    type Error = SyscallError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => Self::DebugWrite,
            2 => Self::Mmap,
            3 => Self::Munmap,
            4 => Self::Exit,
            5 => Self::Fork,
            6 => Self::IpcHint,
            7 => Self::IpcSendPipe,
            8 => Self::IpcRecv,
            _ => return Err(SyscallError::UnknownSyscall),
        })
    }
}

/// A decoded system call with its raw (still unvalidated) arguments.
///
/// Pointers are user virtual addresses; the kernel validates them against
/// the caller's regions before touching any memory.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Syscall {
    DebugWrite { ptr: u64, len: u64 },
    Mmap { size: u64 },
    Munmap { ptr: u64 },
    Exit { code: u64 },
    Fork,
    IpcHint { max_size: u64, name_ptr: u64, name_len: u64 },
    IpcSendPipe { ptr: u64, len: u64, name_ptr: u64, name_len: u64 },
    IpcRecv { ptr: u64, max_len: u64, blocking: bool },
}

impl Syscall {
    /// Decode `number` and the argument registers `rdi, rsi, rdx, r10, r8`.
    ///
    /// # Errors
    /// [`SyscallError::UnknownSyscall`] for an unassigned number.
    pub fn decode(number: u64, args: [u64; 5]) -> Result<Self, SyscallError> {
        let [a0, a1, a2, a3, _] = args;
        Ok(match Sysno::try_from(number)? {
            Sysno::DebugWrite => Self::DebugWrite { ptr: a0, len: a1 },
            Sysno::Mmap => Self::Mmap { size: a0 },
            Sysno::Munmap => Self::Munmap { ptr: a0 },
            Sysno::Exit => Self::Exit { code: a0 },
            Sysno::Fork => Self::Fork,
            Sysno::IpcHint => Self::IpcHint {
                max_size: a0,
                name_ptr: a1,
                name_len: a2,
            },
            Sysno::IpcSendPipe => Self::IpcSendPipe {
                ptr: a0,
                len: a1,
                name_ptr: a2,
                name_len: a3,
            },
            Sysno::IpcRecv => Self::IpcRecv {
                ptr: a0,
                max_len: a1,
                blocking: a2 != 0,
            },
        })
    }

    #[must_use]
    pub const fn number(&self) -> Sysno {
        match self {
            Self::DebugWrite { .. } => Sysno::DebugWrite,
            Self::Mmap { .. } => Sysno::Mmap,
            Self::Munmap { .. } => Sysno::Munmap,
            Self::Exit { .. } => Sysno::Exit,
            Self::Fork => Sysno::Fork,
            Self::IpcHint { .. } => Sysno::IpcHint,
            Self::IpcSendPipe { .. } => Sysno::IpcSendPipe,
            Self::IpcRecv { .. } => Sysno::IpcRecv,
        }
    }
}
