//! Leveled print macros for the pipeline.
//!
//! Thread-safe, optionally-flushing debug output written to stderr.
//!
//! # Environment Variables
//!
//! - `VLINK_FLUSH_LOG=1` - Flush stderr after each print (useful for debugging crashes)
//! - `VLINK_LOG_LEVEL=<level>` - Set log level: 0=off, 1=error, 2=warn, 3=info, 4=debug, 5=trace
//!
//! # Usage
//!
//! ```ignore
//! use vlink_core::{verror, vwarn, vinfo, vdebug, vtrace};
//!
//! vinfo!("Worker {} started", id);
//! vwarn!("Unexpected state: {:?}", state);
//! verror!("Critical failure!");
//! ```

use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

/// Log levels (matches common conventions)
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Off = 0,
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl LogLevel {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => LogLevel::Off,
            1 => LogLevel::Error,
            2 => LogLevel::Warn,
            3 => LogLevel::Info,
            4 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }

    pub fn prefix(&self) -> &'static str {
        match self {
            LogLevel::Off => "",
            LogLevel::Error => "[ERROR]",
            LogLevel::Warn => "[WARN] ",
            LogLevel::Info => "[INFO] ",
            LogLevel::Debug => "[DEBUG]",
            LogLevel::Trace => "[TRACE]",
        }
    }
}

// Global configuration (initialized once)
static FLUSH_ENABLED: AtomicBool = AtomicBool::new(false);
static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);
static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Initialize logging from environment variables.
///
/// Called automatically on first log, but can be called explicitly for
/// deterministic initialization.
pub fn init() {
    if INITIALIZED.swap(true, Ordering::SeqCst) {
        return; // Already initialized
    }

    if let Ok(val) = std::env::var("VLINK_FLUSH_LOG") {
        let flush = matches!(val.as_str(), "1" | "true" | "yes" | "on");
        FLUSH_ENABLED.store(flush, Ordering::Relaxed);
    }

    if let Ok(val) = std::env::var("VLINK_LOG_LEVEL") {
        if let Ok(level) = val.parse::<u8>() {
            LOG_LEVEL.store(level.min(5), Ordering::Relaxed);
        }
    }
}

/// Set log level programmatically (overrides environment).
pub fn set_level(level: LogLevel) {
    init();
    LOG_LEVEL.store(level as u8, Ordering::Relaxed);
}

/// Check whether a message of the given level would be printed.
#[inline]
pub fn enabled(level: LogLevel) -> bool {
    if !INITIALIZED.load(Ordering::Relaxed) {
        init();
    }
    level as u8 <= LOG_LEVEL.load(Ordering::Relaxed)
}

/// Emit a single log line. Prefer the macros over calling this directly.
pub fn emit(level: LogLevel, args: std::fmt::Arguments<'_>) {
    if !enabled(level) {
        return;
    }
    let stderr = std::io::stderr();
    let mut handle = stderr.lock();
    let _ = writeln!(handle, "{} {}", level.prefix(), args);
    if FLUSH_ENABLED.load(Ordering::Relaxed) {
        let _ = handle.flush();
    }
}

#[macro_export]
macro_rules! verror {
    ($($arg:tt)*) => {
        $crate::vprint::emit($crate::vprint::LogLevel::Error, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! vwarn {
    ($($arg:tt)*) => {
        $crate::vprint::emit($crate::vprint::LogLevel::Warn, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! vinfo {
    ($($arg:tt)*) => {
        $crate::vprint::emit($crate::vprint::LogLevel::Info, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! vdebug {
    ($($arg:tt)*) => {
        $crate::vprint::emit($crate::vprint::LogLevel::Debug, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! vtrace {
    ($($arg:tt)*) => {
        $crate::vprint::emit($crate::vprint::LogLevel::Trace, format_args!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_from_u8() {
        assert_eq!(LogLevel::from_u8(0), LogLevel::Off);
        assert_eq!(LogLevel::from_u8(3), LogLevel::Info);
        assert_eq!(LogLevel::from_u8(200), LogLevel::Trace);
    }

    #[test]
    fn test_level_ordering() {
        assert!(LogLevel::Error < LogLevel::Warn);
        assert!(LogLevel::Debug < LogLevel::Trace);
    }

    #[test]
    fn test_enabled_follows_level() {
        set_level(LogLevel::Warn);
        assert!(enabled(LogLevel::Error));
        assert!(enabled(LogLevel::Warn));
        assert!(!enabled(LogLevel::Debug));
        set_level(LogLevel::Info);
    }
}
