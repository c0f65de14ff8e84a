//! Leveled kernel logger over the serial port.
//!
//! Five severities (Debug through Critical) with a runtime threshold set at
//! boot. Formatting happens at the call site via `format_args!`; this module
//! only prefixes the level tag and routes the result to COM1.

use core::fmt;
use core::sync::atomic::{AtomicU8, Ordering};

/// Log severity, lowest to highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Debug = 0,
    Info = 1,
    Warn = 2,
    Error = 3,
    Critical = 4,
}

impl LogLevel {
    fn tag(self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => " INFO",
            LogLevel::Warn => " WARN",
            LogLevel::Error => "ERROR",
            LogLevel::Critical => " CRIT",
        }
    }
}

static THRESHOLD: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);

/// Set the minimum severity that reaches the serial port.
pub fn init(level: LogLevel) {
    THRESHOLD.store(level as u8, Ordering::Relaxed);
}

/// Current logging threshold.
pub fn level() -> LogLevel {
    match THRESHOLD.load(Ordering::Relaxed) {
        0 => LogLevel::Debug,
        1 => LogLevel::Info,
        2 => LogLevel::Warn,
        3 => LogLevel::Error,
        _ => LogLevel::Critical,
    }
}

/// Emit one log record. Called through the `log_*!` macros.
pub fn write(level: LogLevel, args: fmt::Arguments) {
    if (level as u8) < THRESHOLD.load(Ordering::Relaxed) {
        return;
    }
    let ticks = crate::arch::x86::pit::get_ticks();
    crate::serial_print!("[{:>6}] {}: {}\n", ticks, level.tag(), args);
}

#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        $crate::logging::write($crate::logging::LogLevel::Debug, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        $crate::logging::write($crate::logging::LogLevel::Info, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        $crate::logging::write($crate::logging::LogLevel::Warn, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        $crate::logging::write($crate::logging::LogLevel::Error, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_critical {
    ($($arg:tt)*) => {
        $crate::logging::write($crate::logging::LogLevel::Critical, format_args!($($arg)*))
    };
}
