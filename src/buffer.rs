//! Fixed-capacity ring buffer backing each stream's inbound data.
//!
//! `start == end` is ambiguous between empty and full, so fullness is
//! tracked by an explicit flag instead of being inferred from the cursors.

use crate::error::{MuxError, Result};

/// Circular byte store with a fixed capacity.
#[derive(Debug)]
pub struct RingBuffer {
    storage: Box<[u8]>,
    /// Index of the next byte to read.
    start: usize,
    /// Index of the next byte to write.
    end: usize,
    full: bool,
}

impl RingBuffer {
    /// Create an empty buffer holding at most `capacity` bytes.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring buffer capacity must be non-zero");
        Self {
            storage: vec![0u8; capacity].into_boxed_slice(),
            start: 0,
            end: 0,
            full: false,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    /// Number of buffered bytes.
    #[inline]
    pub fn len(&self) -> usize {
        if self.full {
            self.capacity()
        } else if self.end >= self.start {
            self.end - self.start
        } else {
            self.capacity() - self.start + self.end
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        !self.full && self.start == self.end
    }

    /// Free space in bytes.
    #[inline]
    pub fn available(&self) -> usize {
        self.capacity() - self.len()
    }

    /// Append all of `data`, or nothing.
    ///
    /// Fails with [`MuxError::NoCapacity`] if `data` does not fit; a sender
    /// that honours its credit can never trigger this.
    pub fn write(&mut self, data: &[u8]) -> Result<usize> {
        let available = self.available();
        if data.len() > available {
            return Err(MuxError::NoCapacity {
                requested: data.len(),
                available,
            });
        }
        if data.is_empty() {
            return Ok(0);
        }

        let cap = self.capacity();
        let first = data.len().min(cap - self.end);
        self.storage[self.end..self.end + first].copy_from_slice(&data[..first]);
        let rest = data.len() - first;
        self.storage[..rest].copy_from_slice(&data[first..]);

        self.end = (self.end + data.len()) % cap;
        self.full = self.end == self.start;
        Ok(data.len())
    }

    /// Copy up to `buf.len()` buffered bytes into `buf`.
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        let n = buf.len().min(self.len());
        if n == 0 {
            return 0;
        }

        let cap = self.capacity();
        let first = n.min(cap - self.start);
        buf[..first].copy_from_slice(&self.storage[self.start..self.start + first]);
        buf[first..n].copy_from_slice(&self.storage[..n - first]);

        self.start = (self.start + n) % cap;
        self.full = false;
        n
    }

    /// Drop all buffered bytes.
    pub fn clear(&mut self) {
        self.start = 0;
        self.end = 0;
        self.full = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_buffer_is_empty() {
        let buf = RingBuffer::new(8);
        assert_eq!(buf.len(), 0);
        assert!(buf.is_empty());
        assert_eq!(buf.available(), 8);
    }

    #[test]
    fn test_wraparound() {
        let mut buf = RingBuffer::new(8);
        buf.write(b"abcde").unwrap();

        let mut out = [0u8; 3];
        assert_eq!(buf.read(&mut out), 3);
        assert_eq!(&out, b"abc");

        buf.write(b"fghij").unwrap();
        assert_eq!(buf.len(), 7);

        let mut out = [0u8; 16];
        assert_eq!(buf.read(&mut out), 7);
        assert_eq!(&out[..7], b"defghij");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_fill_to_capacity_is_not_empty() {
        let mut buf = RingBuffer::new(8);
        buf.write(b"12345678").unwrap();
        assert_eq!(buf.len(), 8);
        assert!(!buf.is_empty());
        assert_eq!(buf.available(), 0);

        let mut out = [0u8; 8];
        assert_eq!(buf.read(&mut out), 8);
        assert_eq!(&out, b"12345678");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_full_after_wrap() {
        let mut buf = RingBuffer::new(4);
        buf.write(b"ab").unwrap();
        let mut out = [0u8; 2];
        buf.read(&mut out);
        buf.write(b"wxyz").unwrap();
        assert_eq!(buf.len(), 4);

        let mut out = [0u8; 4];
        assert_eq!(buf.read(&mut out), 4);
        assert_eq!(&out, b"wxyz");
    }

    #[test]
    fn test_overflow_is_atomic() {
        let mut buf = RingBuffer::new(4);
        buf.write(b"abc").unwrap();

        let err = buf.write(b"de").unwrap_err();
        assert!(matches!(
            err,
            MuxError::NoCapacity {
                requested: 2,
                available: 1
            }
        ));

        let mut out = [0u8; 4];
        assert_eq!(buf.read(&mut out), 3);
        assert_eq!(&out[..3], b"abc");
    }

    #[test]
    fn test_partial_read() {
        let mut buf = RingBuffer::new(8);
        buf.write(b"hello").unwrap();
        let mut out = [0u8; 2];
        assert_eq!(buf.read(&mut out), 2);
        assert_eq!(buf.len(), 3);
        assert_eq!(buf.read(&mut []), 0);
    }

    #[test]
    fn test_clear() {
        let mut buf = RingBuffer::new(4);
        buf.write(b"abcd").unwrap();
        buf.clear();
        assert!(buf.is_empty());
        assert_eq!(buf.available(), 4);
    }

    #[test]
    fn test_empty_write() {
        let mut buf = RingBuffer::new(1);
        buf.write(b"x").unwrap();
        assert_eq!(buf.write(b"").unwrap(), 0);
        assert_eq!(buf.len(), 1);
    }
}
