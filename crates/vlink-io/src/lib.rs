//! # vlink-io — stream I/O abstraction
//!
//! Byte-oriented asynchronous streams on top of the `vlink-core` request
//! pipeline. A stream operation builds a request, hands it to a processor
//! container serviced by a worker thread, and the native controller feeds
//! the syscall outcome back as the request completion, while the caller holds an
//! operation waiter for synchronization, cancellation and timeouts.
//!
//! The native side is behind the [`native::NativeController`] trait; the
//! bundled implementation is a poll-style dispatcher thread
//! ([`poll_controller::PollIoController`]). [`file::FileProcessor`] builds
//! file streams (read/write/lock/unlock/close) on these pieces.

pub mod buffer;
pub mod error;
pub mod result;
pub mod stream;

#[cfg(unix)]
pub mod file;
#[cfg(unix)]
pub mod native;
#[cfg(unix)]
pub mod poll_controller;

pub use buffer::IoBuffer;
pub use error::IoError;
pub use result::IoResult;
pub use stream::{RefCounted, RefGuard, StreamBase, StreamKind, StreamState};

#[cfg(unix)]
pub use file::{FileProcessor, FileStream, Mode};
#[cfg(unix)]
pub use native::{NativeController, NativeOp, Offset, OpToken};
#[cfg(unix)]
pub use poll_controller::PollIoController;
