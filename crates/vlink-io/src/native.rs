//! Native I/O controller interface.
//!
//! The stream layer never issues syscalls itself: it hands operation
//! control blocks to a controller which performs the native I/O and feeds
//! the result back into the request pipeline through a completion callback.
//! Swapping the controller (poll dispatcher, completion ports, a test
//! double) does not touch the stream layer.

use std::os::fd::RawFd;
use std::sync::atomic::{AtomicU8, Ordering};

use crate::buffer::IoBuffer;
use crate::error::Result;
use crate::result::IoResult;

/// Offset specification for positioned I/O.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offset {
    /// Use the descriptor's own position (or the stream-maintained one,
    /// resolved by the stream before queueing).
    Auto,
    /// Operate at the end of the stream (append).
    End,
    /// Operate at the given absolute position.
    At(u64),
}

/// Operation control block handed to the controller.
#[derive(Debug)]
pub enum NativeOp {
    Read {
        fd: RawFd,
        /// Maximal number of bytes to read.
        max: usize,
        /// Minimal number of bytes; the controller keeps reading until
        /// reached or end of file.
        min: usize,
        offset: Offset,
    },
    Write {
        fd: RawFd,
        data: IoBuffer,
        offset: Offset,
    },
}

/// Outcome of a native operation: transfer size or errno, plus the read
/// payload.
pub struct NativeCompletion {
    pub result: std::result::Result<usize, i32>,
    pub data: Option<Vec<u8>>,
}

/// Completion callback invoked by the controller exactly once per queued
/// operation, unless the operation was canceled before execution started
/// (see [`OpToken::cancel`]).
pub type NativeCallback = Box<dyn FnOnce(NativeCompletion) + Send>;

const TOKEN_QUEUED: u8 = 0;
const TOKEN_RUNNING: u8 = 1;
const TOKEN_DONE: u8 = 2;
const TOKEN_CANCELED: u8 = 3;

/// Cancellation token for a queued operation.
pub struct OpToken {
    state: AtomicU8,
}

impl OpToken {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(TOKEN_QUEUED),
        }
    }

    /// Try to cancel the operation. Returns true when the operation had
    /// not started yet; the controller will then never invoke its
    /// callback and the canceler owns the completion. Returns false when
    /// execution already started; the callback will deliver the outcome.
    pub fn cancel(&self) -> bool {
        self.state
            .compare_exchange(
                TOKEN_QUEUED,
                TOKEN_CANCELED,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    /// Claim the operation for execution. Fails when it was canceled.
    pub(crate) fn begin(&self) -> bool {
        self.state
            .compare_exchange(
                TOKEN_QUEUED,
                TOKEN_RUNNING,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    pub(crate) fn finish(&self) {
        self.state.store(TOKEN_DONE, Ordering::SeqCst);
    }
}

impl Default for OpToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Native I/O controller.
///
/// **Contract:**
/// - `queue()` never blocks; a controller that cannot accept the operation
///   completes it immediately with an error.
/// - Exactly one callback invocation per queued operation, except when
///   `OpToken::cancel` returned true before execution started.
/// - `disable()` drains: every still-queued operation is completed (with
///   ECANCELED) before it returns. No completion may hang.
pub trait NativeController: Send + Sync {
    /// Start the controller.
    fn enable(&self) -> Result<()>;

    /// Stop the controller, completing everything still queued.
    fn disable(&self);

    /// Queue an operation for execution. The returned token allows
    /// cancellation before execution starts.
    fn queue(&self, op: NativeOp, callback: NativeCallback) -> std::sync::Arc<OpToken>;
}

/// Map an errno value onto the stream result vocabulary.
pub fn map_errno(errno: i32) -> IoResult {
    match errno {
        libc::ETIMEDOUT => IoResult::TimedOut,
        libc::ECANCELED => IoResult::Canceled,
        libc::EACCES | libc::EPERM => IoResult::PermissionDenied,
        libc::ECONNREFUSED => IoResult::ConnectionRefused,
        libc::ENOENT | libc::EFAULT | libc::EADDRNOTAVAIL => IoResult::BadAddress,
        libc::EBADF => IoResult::Closed,
        _ => IoResult::OtherFailure,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_cancel_before_start() {
        let token = OpToken::new();
        assert!(token.cancel());
        /* The controller can no longer claim it. */
        assert!(!token.begin());
        /* Repeated cancel reports too-late. */
        assert!(!token.cancel());
    }

    #[test]
    fn test_token_cancel_after_start() {
        let token = OpToken::new();
        assert!(token.begin());
        assert!(!token.cancel());
        token.finish();
        assert!(!token.cancel());
    }

    #[test]
    fn test_errno_mapping() {
        assert_eq!(map_errno(libc::EACCES), IoResult::PermissionDenied);
        assert_eq!(map_errno(libc::ECANCELED), IoResult::Canceled);
        assert_eq!(map_errno(libc::EBADF), IoResult::Closed);
        assert_eq!(map_errno(libc::EIO), IoResult::OtherFailure);
    }
}
