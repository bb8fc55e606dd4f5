//! Result vocabulary of asynchronous I/O operations.

use std::fmt;

/// Result of an I/O operation, delivered to the completion handler. This is
/// the whole vocabulary the stream layer speaks; the core never retries,
/// retry policy belongs to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoResult {
    /// Operation completed successfully.
    Ok,
    /// Operation timed out.
    TimedOut,
    /// Operation canceled.
    Canceled,
    /// Bad address. It could not be understood and used.
    BadAddress,
    /// Remote side has explicitly refused the connection.
    ConnectionRefused,
    /// Stream has been or is being closed. All pending or new operations
    /// initiated for a closed stream are completed with this result.
    Closed,
    /// Insufficient permissions for the requested operation.
    PermissionDenied,
    /// End of file encountered.
    EndOfFile,
    /// File locking error. Possible double lock or unlock while not locked.
    LockError,
    /// Some other system failure. If happened, it is recommended to
    /// investigate the root cause.
    OtherFailure,
}

impl IoResult {
    pub const fn as_str(&self) -> &'static str {
        match self {
            IoResult::Ok => "OK",
            IoResult::TimedOut => "TIMED_OUT",
            IoResult::Canceled => "CANCELED",
            IoResult::BadAddress => "BAD_ADDRESS",
            IoResult::ConnectionRefused => "CONNECTION_REFUSED",
            IoResult::Closed => "CLOSED",
            IoResult::PermissionDenied => "PERMISSION_DENIED",
            IoResult::EndOfFile => "END_OF_FILE",
            IoResult::LockError => "LOCK_ERROR",
            IoResult::OtherFailure => "OTHER_FAILURE",
        }
    }
}

impl fmt::Display for IoResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
