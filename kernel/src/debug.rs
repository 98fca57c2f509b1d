//! Debug console output
//!
//! Early-boot and development output, separate from the system log
//! ring: `kprint!`/`kprintln!` write through whatever console sink the
//! platform registered (a serial port on hardware, a capture buffer in
//! hosted tests), and the leveled macros are gated by cargo features
//! so release kernels compile chatter out entirely.

use core::fmt;

use spin::Mutex;

/// The registered console sink.
static SINK: Mutex<Option<fn(&str)>> = Mutex::new(None);

/// Register the console sink. Called once by platform bring-up, before
/// any output matters.
pub fn set_console(sink: fn(&str)) {
    *SINK.lock() = Some(sink);
}

/// Write a string to the console sink, if one is registered.
pub fn console_write(s: &str) {
    if let Some(sink) = *SINK.lock() {
        sink(s);
    }
}

/// Console log levels, selected at compile time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Spam = 5,
}

/// The compiled-in console threshold.
#[inline(always)]
pub const fn current_log_level() -> LogLevel {
    #[cfg(feature = "log-spam")]
    return LogLevel::Spam;

    #[cfg(all(feature = "log-debug", not(feature = "log-spam")))]
    return LogLevel::Debug;

    #[cfg(all(
        feature = "log-info",
        not(any(feature = "log-debug", feature = "log-spam"))
    ))]
    return LogLevel::Info;

    #[cfg(all(
        feature = "log-warn",
        not(any(feature = "log-info", feature = "log-debug", feature = "log-spam"))
    ))]
    return LogLevel::Warn;

    #[cfg(all(
        feature = "log-error",
        not(any(
            feature = "log-warn",
            feature = "log-info",
            feature = "log-debug",
            feature = "log-spam"
        ))
    ))]
    return LogLevel::Error;

    #[cfg(not(any(
        feature = "log-error",
        feature = "log-warn",
        feature = "log-info",
        feature = "log-debug",
        feature = "log-spam"
    )))]
    return LogLevel::Info;
}

/// True if messages at `level` reach the console.
#[inline(always)]
pub const fn should_log(level: LogLevel) -> bool {
    level as u8 <= current_log_level() as u8
}

/// Console writer for the print macros.
pub struct DebugWriter;

impl fmt::Write for DebugWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        console_write(s);
        Ok(())
    }
}

/// Print to the console, unconditionally.
#[macro_export]
macro_rules! kprint {
    ($($arg:tt)*) => ({
        use core::fmt::Write;
        let _ = write!($crate::debug::DebugWriter, $($arg)*);
    });
}

/// Print a line to the console, unconditionally.
#[macro_export]
macro_rules! kprintln {
    () => ($crate::kprint!("\n"));
    ($($arg:tt)*) => ({
        use core::fmt::Write;
        let _ = writeln!($crate::debug::DebugWriter, $($arg)*);
    });
}

/// Console error message.
#[macro_export]
macro_rules! kerror {
    ($($arg:tt)*) => ({
        if $crate::debug::should_log($crate::debug::LogLevel::Error) {
            $crate::kprintln!("[error] {}", format_args!($($arg)*));
        }
    });
}

/// Console warning message.
#[macro_export]
macro_rules! kwarn {
    ($($arg:tt)*) => ({
        if $crate::debug::should_log($crate::debug::LogLevel::Warn) {
            $crate::kprintln!("[warn]  {}", format_args!($($arg)*));
        }
    });
}

/// Console info message.
#[macro_export]
macro_rules! kinfo {
    ($($arg:tt)*) => ({
        if $crate::debug::should_log($crate::debug::LogLevel::Info) {
            $crate::kprintln!("[info]  {}", format_args!($($arg)*));
        }
    });
}

/// Console debug message.
#[macro_export]
macro_rules! kdebug {
    ($($arg:tt)*) => ({
        if $crate::debug::should_log($crate::debug::LogLevel::Debug) {
            $crate::kprintln!("[debug] {}", format_args!($($arg)*));
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_threshold_is_info() {
        assert!(should_log(LogLevel::Error));
        assert!(should_log(LogLevel::Info));
        assert!(!should_log(LogLevel::Spam));
    }
}
