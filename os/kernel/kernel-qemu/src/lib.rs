//! # QEMU Debug Console
//!
//! Kernel-to-host output through QEMU's debug port (`0x402`), captured on
//! the host with `-debugcon stdio` or `-debugcon file:debug.log`.
//!
//! ```text
//! log::info!(…) ──► QemuLogger ──┐
//! qemu_trace!(…) ────────────────┼──► qemu_fmt::QemuSink ──► out 0x402
//! debug-write syscall ───────────┘
//! ```
//!
//! Port I/O is only emitted for bare-metal x86-64 builds with the `enabled`
//! feature (the default). Everywhere else, host tests included, output is
//! silently dropped.
//!
//! ```rust,no_run
//! use kernel_qemu::QemuLogger;
//! use log::LevelFilter;
//!
//! static LOGGER: QemuLogger = QemuLogger::new(LevelFilter::Debug);
//! QemuLogger::install(&LOGGER).ok();
//! log::info!("scheduler up");
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod logger;

pub use logger::QemuLogger;

#[doc(hidden)]
pub mod qemu_fmt {
    use core::fmt::{self, Write};

    /// QEMU's debug console port.
    pub const QEMU_DEBUG_PORT: u16 = 0x402;

    #[cfg(all(feature = "enabled", target_arch = "x86_64", target_os = "none"))]
    #[allow(clippy::inline_always)]
    #[inline(always)]
    pub fn dbg_putc(c: u8) {
        // SAFETY: writing the debug port has no side effects besides output.
        unsafe {
            core::arch::asm!(
                "out dx, al",
                in("dx") QEMU_DEBUG_PORT,
                in("al") c,
                options(nomem, nostack, preserves_flags)
            );
        }
    }

    #[cfg(not(all(feature = "enabled", target_arch = "x86_64", target_os = "none")))]
    #[inline]
    pub const fn dbg_putc(_: u8) {}

    /// Write raw bytes to the debug port.
    #[inline]
    pub fn write_bytes(bytes: &[u8]) {
        for &b in bytes {
            dbg_putc(b);
        }
    }

    /// [`fmt::Write`] onto the debug port.
    #[derive(Debug, Default, Copy, Clone)]
    pub struct QemuSink;

    impl Write for QemuSink {
        #[inline]
        fn write_str(&mut self, s: &str) -> fmt::Result {
            write_bytes(s.as_bytes());
            Ok(())
        }
    }

    #[inline]
    pub fn qemu_write(args: fmt::Arguments<'_>) {
        // Best effort.
        let _ = fmt::write(&mut QemuSink, args);
    }
}

/// `print!`-style output straight to the debug port, bypassing `log`.
#[macro_export]
macro_rules! qemu_trace {
    ($($arg:tt)*) => {{
        $crate::qemu_fmt::qemu_write(core::format_args!($($arg)*));
    }};
}
