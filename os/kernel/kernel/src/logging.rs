//! Kernel log setup.

use log::LevelFilter;

#[cfg(feature = "qemu")]
static LOGGER: kernel_qemu::QemuLogger = kernel_qemu::QemuLogger::new(LEVEL);

/// Records above this level are dropped before formatting.
pub const LEVEL: LevelFilter = if cfg!(debug_assertions) {
    LevelFilter::Debug
} else {
    LevelFilter::Info
};

/// Route the `log` facade to the QEMU debug console.
///
/// Without the `qemu` feature the facade stays a no-op. A second call is
/// ignored.
pub fn init() {
    #[cfg(feature = "qemu")]
    if kernel_qemu::QemuLogger::install(&LOGGER).is_ok() {
        log::info!("kernel log at {LEVEL}");
    }
}
