//! Stream identity: name, state, kind and explicit reference counting.
//!
//! Streams are shared across the protocol layer, registries and in-flight
//! operations; the explicit reference counter decides when the underlying
//! resource is closed, independently of how many Arc clones exist. Reaching
//! zero references while the stream is still open triggers an implicit
//! close.

use std::sync::atomic::{AtomicI32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

/// Stream lifecycle. Transitions are monotonic: once closing, a stream
/// never reopens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StreamState {
    /// Open and ready for read/write operations.
    Opened = 0,
    /// Close was requested; in-flight operations are being wound down.
    Closing = 1,
    /// Terminal state. New asynchronous calls complete with
    /// [`crate::IoResult::Closed`].
    Closed = 2,
}

impl From<u8> for StreamState {
    fn from(v: u8) -> Self {
        match v {
            0 => StreamState::Opened,
            1 => StreamState::Closing,
            _ => StreamState::Closed,
        }
    }
}

/// Stream kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    File,
    Serial,
    Socket,
    Can,
    Hid,
}

/// Objects managed through explicit reference counting.
///
/// `add_ref`/`release_ref` are thread-safe; `release_ref` may tear the
/// object down when the last reference is released.
pub trait RefCounted {
    fn add_ref(&self);
    fn release_ref(&self);
}

/// RAII reference holder: taking a guard adds a reference, cloning adds
/// another, dropping releases it.
pub struct RefGuard<T: RefCounted> {
    ptr: Arc<T>,
}

impl<T: RefCounted> RefGuard<T> {
    pub fn new(ptr: Arc<T>) -> Self {
        ptr.add_ref();
        Self { ptr }
    }

    /// The underlying shared pointer, without reference accounting.
    pub fn arc(&self) -> Arc<T> {
        self.ptr.clone()
    }
}

impl<T: RefCounted> Clone for RefGuard<T> {
    fn clone(&self) -> Self {
        self.ptr.add_ref();
        Self {
            ptr: self.ptr.clone(),
        }
    }
}

impl<T: RefCounted> Drop for RefGuard<T> {
    fn drop(&mut self) {
        self.ptr.release_ref();
    }
}

impl<T: RefCounted> std::ops::Deref for RefGuard<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.ptr
    }
}

/// Common state embedded in every stream implementation.
pub struct StreamBase {
    name: Mutex<String>,
    state: AtomicU8,
    kind: StreamKind,
    ref_count: AtomicI32,
}

impl StreamBase {
    pub fn new(name: &str, kind: StreamKind) -> Self {
        Self {
            name: Mutex::new(name.to_owned()),
            state: AtomicU8::new(StreamState::Opened as u8),
            kind,
            ref_count: AtomicI32::new(0),
        }
    }

    /// Human readable stream name.
    pub fn name(&self) -> String {
        self.name.lock().unwrap().clone()
    }

    pub fn set_name(&self, name: &str) {
        *self.name.lock().unwrap() = name.to_owned();
    }

    pub fn state(&self) -> StreamState {
        self.state.load(Ordering::SeqCst).into()
    }

    /// Advance the stream state. Transitions are monotonic; attempts to go
    /// backwards are ignored.
    pub fn set_state(&self, state: StreamState) {
        self.state.fetch_max(state as u8, Ordering::SeqCst);
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    pub fn is_closed(&self) -> bool {
        self.state() == StreamState::Closed
    }

    /// Add one reference. Returns the new count.
    pub fn add_ref(&self) -> i32 {
        self.ref_count.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Release one reference. Returns the previous count; the caller
    /// handles the last-reference close. Underflow is the caller's
    /// invariant to report.
    pub fn release_ref(&self) -> i32 {
        self.ref_count.fetch_sub(1, Ordering::SeqCst)
    }

    pub fn ref_count(&self) -> i32 {
        self.ref_count.load(Ordering::SeqCst)
    }
}
