//! Debug logging macros for development-time diagnostics.
//!
//! Conditional compilation keeps these free in production builds; all of
//! them are controlled by the `dev-log` feature flag. Protocol-level
//! tracing for operators is a different thing; see `trace` and the
//! `--log` flag.

/// General-purpose debug logging macro.
///
/// Outputs informational messages prefixed with `[DEBUG]`.
#[macro_export]
#[cfg(feature = "dev-log")]
macro_rules! debug_log {
    ($($arg:tt)*) => {
        println!("[DEBUG] {}", format!($($arg)*));
    };
}

#[macro_export]
#[cfg(not(feature = "dev-log"))]
macro_rules! debug_log {
    ($($arg:tt)*) => {};
}

/// Error logging macro for recoverable errors.
///
/// Outputs to stderr with `[ERROR]` prefix.
#[macro_export]
#[cfg(feature = "dev-log")]
macro_rules! debug_error {
    ($($arg:tt)*) => {
        eprintln!("[ERROR] {}", format!($($arg)*));
    };
}

#[macro_export]
#[cfg(not(feature = "dev-log"))]
macro_rules! debug_error {
    ($($arg:tt)*) => {};
}

/// Warning logging macro for potentially problematic conditions.
///
/// Outputs to stderr with `[WARN]` prefix.
#[macro_export]
#[cfg(feature = "dev-log")]
macro_rules! debug_warn {
    ($($arg:tt)*) => {
        eprintln!("[WARN] {}", format!($($arg)*));
    };
}

#[macro_export]
#[cfg(not(feature = "dev-log"))]
macro_rules! debug_warn {
    ($($arg:tt)*) => {};
}
