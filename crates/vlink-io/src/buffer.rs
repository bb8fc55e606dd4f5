//! Byte buffer shared between I/O operations and completion handlers.

use std::sync::Arc;

/// Immutable, cheaply cloneable byte buffer. A clone shares the backing
/// storage; slicing adjusts the visible window without copying.
#[derive(Clone)]
pub struct IoBuffer {
    data: Arc<Vec<u8>>,
    offset: usize,
    len: usize,
}

impl IoBuffer {
    /// Create a buffer taking ownership of the data.
    pub fn new(data: Vec<u8>) -> Self {
        let len = data.len();
        Self {
            data: Arc::new(data),
            offset: 0,
            len,
        }
    }

    /// Create an empty buffer.
    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    pub fn from_slice(data: &[u8]) -> Self {
        Self::new(data.to_vec())
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data[self.offset..self.offset + self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// A sub-window of this buffer sharing the same storage. Out-of-range
    /// bounds are clamped to the buffer end.
    pub fn slice(&self, from: usize, len: usize) -> Self {
        let from = from.min(self.len);
        let len = len.min(self.len - from);
        Self {
            data: self.data.clone(),
            offset: self.offset + from,
            len,
        }
    }

    /// Copy the visible window into an owned vector.
    pub fn to_vec(&self) -> Vec<u8> {
        self.as_slice().to_vec()
    }
}

impl std::fmt::Debug for IoBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "IoBuffer({} bytes)", self.len)
    }
}

impl From<&[u8]> for IoBuffer {
    fn from(data: &[u8]) -> Self {
        Self::from_slice(data)
    }
}

impl From<Vec<u8>> for IoBuffer {
    fn from(data: Vec<u8>) -> Self {
        Self::new(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic() {
        let buffer = IoBuffer::from_slice(b"hello world");
        assert_eq!(buffer.len(), 11);
        assert_eq!(buffer.as_slice(), b"hello world");
        assert!(!buffer.is_empty());
        assert!(IoBuffer::empty().is_empty());
    }

    #[test]
    fn test_slice_shares_storage() {
        let buffer = IoBuffer::from_slice(b"hello world");
        let world = buffer.slice(6, 5);
        assert_eq!(world.as_slice(), b"world");
        let sub = world.slice(1, 3);
        assert_eq!(sub.as_slice(), b"orl");
    }

    #[test]
    fn test_slice_clamps() {
        let buffer = IoBuffer::from_slice(b"abc");
        assert_eq!(buffer.slice(1, 100).as_slice(), b"bc");
        assert_eq!(buffer.slice(100, 1).len(), 0);
    }
}
