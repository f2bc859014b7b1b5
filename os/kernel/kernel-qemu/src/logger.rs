use crate::qemu_trace;
use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};

/// [`Log`] implementation writing `[LEVEL] target: message` lines to the
/// debug port.
#[derive(Debug)]
pub struct QemuLogger {
    max_level: LevelFilter,
}

impl QemuLogger {
    #[must_use]
    pub const fn new(max_level: LevelFilter) -> Self {
        Self { max_level }
    }

    #[must_use]
    pub const fn max_level(&self) -> LevelFilter {
        self.max_level
    }

    /// Make `logger` the global logger. Call once during early init.
    ///
    /// # Errors
    /// If a logger was already installed.
    pub fn install(logger: &'static Self) -> Result<(), SetLoggerError> {
        log::set_logger(logger)?;
        log::set_max_level(logger.max_level);
        Ok(())
    }
}

impl Log for QemuLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= self.max_level
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        qemu_trace!("[{}] {}: {}\n", record.level(), record.target(), record.args());
    }

    fn flush(&self) {}
}
