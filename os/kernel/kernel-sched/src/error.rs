use crate::ipc::IpcError;
use crate::process::UserPointerError;
use kernel_alloc::VmError;
use kernel_memory_addresses::VirtualAddress;
use kernel_syscall::SyscallError;

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchedError {
    #[error("out of memory")]
    OutOfMemory,
    #[error("no process is running")]
    NoCurrentProcess,
    #[error(transparent)]
    UserPointer(#[from] UserPointerError),
    #[error(transparent)]
    Ipc(#[from] IpcError),
    #[error("invalid image: {0}")]
    InvalidImage(&'static str),
    #[error("region at {0} overlaps an existing region")]
    RegionOverlap(VirtualAddress),
    #[error("invalid argument")]
    InvalidArgument,
    #[error(transparent)]
    Vm(VmError),
}

impl From<VmError> for SchedError {
    fn from(value: VmError) -> Self {
        match value {
            VmError::OutOfMemory | VmError::AddressSpaceExhausted { .. } => Self::OutOfMemory,
            e => Self::Vm(e),
        }
    }
}

impl From<IpcError> for SyscallError {
    fn from(value: IpcError) -> Self {
        match value {
            IpcError::BufferFull => Self::BufferFull,
            IpcError::MessageTooLarge { .. } => Self::MessageTooLarge,
            IpcError::NoSuchPipe => Self::NoSuchPipe,
            IpcError::PipeNameTaken => Self::PipeNameTaken,
            IpcError::InvalidName => Self::InvalidArgument,
            IpcError::WouldBlock => Self::WouldBlock,
        }
    }
}

impl From<SchedError> for SyscallError {
    fn from(value: SchedError) -> Self {
        match value {
            SchedError::OutOfMemory => Self::OutOfMemory,
            SchedError::UserPointer(_) | SchedError::Vm(VmError::NotMapped(_)) => Self::InvalidPointer,
            SchedError::Ipc(e) => e.into(),
            SchedError::NoCurrentProcess
            | SchedError::InvalidImage(_)
            | SchedError::RegionOverlap(_)
            | SchedError::InvalidArgument
            | SchedError::Vm(_) => Self::InvalidArgument,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhaustion_collapses_to_out_of_memory() {
        assert_eq!(SchedError::from(VmError::AddressSpaceExhausted { pages: 4 }), SchedError::OutOfMemory);
        assert_eq!(SyscallError::from(SchedError::OutOfMemory), SyscallError::OutOfMemory);
    }

    #[test]
    fn user_errors_map_to_syscall_codes() {
        let bad = UserPointerError::Unmapped {
            ptr: VirtualAddress::new(0x1000),
            len: 1,
        };
        assert_eq!(SyscallError::from(SchedError::from(bad)), SyscallError::InvalidPointer);
        assert_eq!(SyscallError::from(SchedError::from(IpcError::WouldBlock)), SyscallError::WouldBlock);
        assert_eq!(SyscallError::from(IpcError::InvalidName), SyscallError::InvalidArgument);
    }
}
