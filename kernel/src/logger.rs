//! Leveled log sink.
//!
//! Every subsystem logs through the same `[LEVEL TARGET] message` format on
//! the serial console.  Log output carries no semantics for any kernel
//! contract; messages below the configured level are dropped.

use core::fmt;
use core::sync::atomic::{AtomicU8, Ordering};

/// Log severity, in ascending order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warning = 3,
    Error = 4,
    Fatal = 5,
}

impl LogLevel {
    fn as_str(self) -> &'static str {
        match self {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO ",
            LogLevel::Warning => "WARN ",
            LogLevel::Error => "ERROR",
            LogLevel::Fatal => "FATAL",
        }
    }

    fn from_u8(raw: u8) -> LogLevel {
        match raw {
            0 => LogLevel::Trace,
            1 => LogLevel::Debug,
            2 => LogLevel::Info,
            3 => LogLevel::Warning,
            4 => LogLevel::Error,
            _ => LogLevel::Fatal,
        }
    }
}

/// Minimum level that reaches the sink.
static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);

/// Set the minimum log level.
pub fn set_level(level: LogLevel) {
    LOG_LEVEL.store(level as u8, Ordering::Relaxed);
}

/// Get the current minimum log level.
pub fn level() -> LogLevel {
    LogLevel::from_u8(LOG_LEVEL.load(Ordering::Relaxed))
}

/// Emit one log line.
pub fn log(log_level: LogLevel, target: &str, args: fmt::Arguments) {
    if log_level >= level() {
        crate::serial_println!("[{} {}] {}", log_level.as_str(), target, args);
    }
}

#[macro_export]
macro_rules! trace {
    ($target:expr, $($arg:tt)*) => {
        $crate::logger::log($crate::logger::LogLevel::Trace, $target, format_args!($($arg)*));
    };
}

#[macro_export]
macro_rules! debug {
    ($target:expr, $($arg:tt)*) => {
        $crate::logger::log($crate::logger::LogLevel::Debug, $target, format_args!($($arg)*));
    };
}

#[macro_export]
macro_rules! info {
    ($target:expr, $($arg:tt)*) => {
        $crate::logger::log($crate::logger::LogLevel::Info, $target, format_args!($($arg)*));
    };
}

#[macro_export]
macro_rules! warning {
    ($target:expr, $($arg:tt)*) => {
        $crate::logger::log($crate::logger::LogLevel::Warning, $target, format_args!($($arg)*));
    };
}

#[macro_export]
macro_rules! error {
    ($target:expr, $($arg:tt)*) => {
        $crate::logger::log($crate::logger::LogLevel::Error, $target, format_args!($($arg)*));
    };
}

/// Log at Fatal and panic.  Used by init stages whose failure leaves the
/// machine unusable.
#[macro_export]
macro_rules! fatal {
    ($target:expr, $fmt:expr $(, $arg:expr)* $(,)?) => {{
        $crate::logger::log(
            $crate::logger::LogLevel::Fatal,
            $target,
            format_args!($fmt $(, $arg)*),
        );
        panic!($fmt $(, $arg)*);
    }};
}
