//! Destinations for the bytes user programs pass to `debug_write`.

use alloc::string::String;

/// Where `debug_write` output goes.
pub trait DebugSink {
    fn write(&mut self, bytes: &[u8]);
}

/// Forwards every write to the QEMU debug console.
#[derive(Debug, Default, Copy, Clone)]
pub struct QemuConsole;

impl DebugSink for QemuConsole {
    fn write(&mut self, bytes: &[u8]) {
        kernel_qemu::qemu_fmt::write_bytes(bytes);
    }
}

/// Buffers output and emits it through the `log` facade, one record per
/// completed line.
#[derive(Debug, Default)]
pub struct LogSink {
    line: String,
}

impl LogSink {
    /// Longest line kept before it is emitted without a newline.
    pub const MAX_LINE: usize = 256;

    #[must_use]
    pub const fn new() -> Self {
        Self { line: String::new() }
    }

    /// Text written since the last emitted line.
    #[must_use]
    pub fn pending(&self) -> &str {
        &self.line
    }

    fn emit(&mut self) {
        log::info!(target: "user", "{}", self.line);
        self.line.clear();
    }
}

impl DebugSink for LogSink {
    fn write(&mut self, bytes: &[u8]) {
        for chunk in bytes.utf8_chunks() {
            for c in chunk.valid().chars() {
                if c == '\n' {
                    self.emit();
                } else {
                    self.line.push(c);
                }
            }
            if !chunk.invalid().is_empty() {
                self.line.push(char::REPLACEMENT_CHARACTER);
            }
            if self.line.len() >= Self::MAX_LINE {
                self.emit();
            }
        }
    }
}
