//! Stream layer error types.

use std::fmt;

use vlink_core::CoreError;

pub type Result<T> = std::result::Result<T, IoError>;

/// Errors surfaced by stream setup operations (opening, enabling).
/// Completion results of asynchronous operations use [`crate::IoResult`]
/// instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IoError {
    /// The specified filesystem path does not exist.
    NotFound(String),
    /// Insufficient permissions for the requested action.
    PermissionDenied(String),
    /// New file creation requested but the file already exists.
    AlreadyExists(String),
    /// Opening mode string is not valid.
    InvalidMode(String),
    /// Invalid parameter (e.g. negative seek target).
    InvalidParam,
    /// Error propagated from the request pipeline.
    Core(CoreError),
    /// OS error with errno.
    Os(i32),
}

impl fmt::Display for IoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound(path) => write!(f, "path not found: {}", path),
            Self::PermissionDenied(path) => write!(f, "permission denied: {}", path),
            Self::AlreadyExists(path) => write!(f, "already exists: {}", path),
            Self::InvalidMode(mode) => write!(f, "invalid opening mode: {}", mode),
            Self::InvalidParam => write!(f, "invalid parameter"),
            Self::Core(e) => write!(f, "pipeline error: {}", e),
            Self::Os(e) => write!(f, "OS error: errno {}", e),
        }
    }
}

impl std::error::Error for IoError {}

impl From<CoreError> for IoError {
    fn from(e: CoreError) -> Self {
        Self::Core(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let e = IoError::NotFound("/no/such".to_owned());
        assert_eq!(format!("{}", e), "path not found: /no/such");
    }

    #[test]
    fn test_core_conversion() {
        let e: IoError = CoreError::AlreadyEnabled.into();
        assert_eq!(e, IoError::Core(CoreError::AlreadyEnabled));
    }
}
