//! # Message Passing
//!
//! Every process owns one [`MessageBuffer`]: a FIFO of whole messages whose
//! total payload never exceeds the buffer's capacity. Senders address a
//! process through a pipe name registered with `ipc-hint`; the scheduler
//! keeps the name table and performs direct delivery to blocked receivers.

use crate::ids::ProcessId;
use alloc::collections::VecDeque;
use alloc::vec::Vec;

/// Capacity of a fresh process's message buffer.
pub const DEFAULT_IPC_CAPACITY: usize = 4096;

/// Upper bound for `ipc-hint` reservations.
pub const MAX_IPC_CAPACITY: usize = 64 * 1024;

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IpcError {
    #[error("receiver's buffer is full")]
    BufferFull,
    #[error("message of {len} bytes exceeds capacity {capacity}")]
    MessageTooLarge { len: usize, capacity: usize },
    #[error("no such pipe")]
    NoSuchPipe,
    #[error("pipe name already registered")]
    PipeNameTaken,
    #[error("invalid pipe name")]
    InvalidName,
    #[error("no message available")]
    WouldBlock,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub sender: ProcessId,
    pub data: Vec<u8>,
}

#[derive(Debug)]
pub struct MessageBuffer {
    capacity: usize,
    used: usize,
    queue: VecDeque<Message>,
}

impl MessageBuffer {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.min(MAX_IPC_CAPACITY),
            used: 0,
            queue: VecDeque::new(),
        }
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Payload bytes currently queued.
    #[must_use]
    pub const fn used(&self) -> usize {
        self.used
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Reserve `capacity` bytes, clamped to [`MAX_IPC_CAPACITY`]. Messages
    /// already queued stay even if they no longer fit.
    pub fn set_capacity(&mut self, capacity: usize) -> usize {
        self.capacity = capacity.min(MAX_IPC_CAPACITY);
        self.capacity
    }

    /// Queue a message.
    ///
    /// # Errors
    /// - [`IpcError::MessageTooLarge`] if it could never fit.
    /// - [`IpcError::BufferFull`] if it does not fit right now.
    pub fn push(&mut self, message: Message) -> Result<(), IpcError> {
        let len = message.data.len();
        if len > self.capacity {
            return Err(IpcError::MessageTooLarge {
                len,
                capacity: self.capacity,
            });
        }
        if self.used + len > self.capacity {
            return Err(IpcError::BufferFull);
        }
        self.used += len;
        self.queue.push_back(message);
        Ok(())
    }

    /// Length of the oldest message.
    #[must_use]
    pub fn peek_len(&self) -> Option<usize> {
        self.queue.front().map(|m| m.data.len())
    }

    pub fn pop(&mut self) -> Option<Message> {
        let message = self.queue.pop_front()?;
        self.used -= message.data.len();
        Some(message)
    }
}

impl Default for MessageBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_IPC_CAPACITY)
    }
}
