/// Errors a system call reports to user space.
///
/// The discriminant is the error code; `rax` carries its negation.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, thiserror::Error)]
#[repr(u64)]
pub enum SyscallError {
    #[error("operation not implemented")]
    NotImplemented = 1,
    #[error("pointer outside the caller's memory")]
    InvalidPointer = 2,
    #[error("no message available")]
    WouldBlock = 3,
    #[error("message larger than the receive buffer")]
    MessageTooLarge = 4,
    #[error("receiver's message buffer is full")]
    BufferFull = 5,
    #[error("no process registered that pipe")]
    NoSuchPipe = 6,
    #[error("pipe name already registered")]
    PipeNameTaken = 7,
    #[error("invalid argument")]
    InvalidArgument = 8,
    #[error("out of memory")]
    OutOfMemory = 9,
    #[error("unknown system call")]
    UnknownSyscall = 10,
}

pub type SyscallResult = Result<u64, SyscallError>;

impl SyscallError {
    const ALL: [Self; 10] = [
        Self::NotImplemented,
        Self::InvalidPointer,
        Self::WouldBlock,
        Self::MessageTooLarge,
        Self::BufferFull,
        Self::NoSuchPipe,
        Self::PipeNameTaken,
        Self::InvalidArgument,
        Self::OutOfMemory,
        Self::UnknownSyscall,
    ];

    #[must_use]
    pub const fn code(self) -> u64 {
        self as u64
    }

    /// The value placed in `rax`: the two's-complement negative of the code.
    #[must_use]
    pub const fn as_return(self) -> u64 {
        0u64.wrapping_sub(self.code())
    }

    /// Decode a raw `rax` value, if it encodes an error.
    #[must_use]
    pub fn from_return(value: u64) -> Option<Self> {
        let code = 0u64.wrapping_sub(value);
        Self::ALL.into_iter().find(|e| e.code() == code)
    }
}

/// Encode a result for `rax`.
#[must_use]
pub const fn encode_result(result: SyscallResult) -> u64 {
    match result {
        Ok(value) => value,
        Err(e) => e.as_return(),
    }
}
