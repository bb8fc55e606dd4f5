//! Core error types.

use std::fmt;

/// Result type for core pipeline operations.
pub type CoreResult<T> = std::result::Result<T, CoreError>;

/// Errors that can occur in request pipeline operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreError {
    /// Operation is not allowed in the current request state
    /// (e.g. setting a handler on a request which is no longer pending).
    InvalidState,

    /// Container is already enabled.
    AlreadyEnabled,

    /// A timeout is already armed on this operation waiter.
    TimeoutAlreadyArmed,

    /// OS error with errno.
    Os(i32),
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidState => write!(f, "invalid request state for operation"),
            Self::AlreadyEnabled => write!(f, "container already enabled"),
            Self::TimeoutAlreadyArmed => write!(f, "timeout already armed on this waiter"),
            Self::Os(e) => write!(f, "OS error: errno {}", e),
        }
    }
}

impl std::error::Error for CoreError {}

/// Report a broken internal invariant.
///
/// Release builds abort the process (fail fast, leave a core dump).
/// Debug builds panic so tests can observe the failure.
#[macro_export]
macro_rules! fatal_internal {
    ($($arg:tt)*) => {{
        if cfg!(debug_assertions) {
            panic!($($arg)*);
        } else {
            $crate::verror!($($arg)*);
            std::process::abort();
        }
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = CoreError::InvalidState;
        assert_eq!(format!("{}", e), "invalid request state for operation");

        let e = CoreError::Os(libc::EAGAIN);
        assert_eq!(format!("{}", e), format!("OS error: errno {}", libc::EAGAIN));
    }

    #[test]
    #[should_panic]
    fn test_fatal_internal_panics_in_debug() {
        // Debug builds turn invariant violations into panics.
        fatal_internal!("boom: {}", 42);
    }
}
