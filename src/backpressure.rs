//! Credit-based backpressure for stream writes.
//!
//! Each stream may only send as many bytes as the remote end has granted
//! through ACK frames. The initial grant is the remote buffer capacity;
//! further grants arrive as the remote application *consumes* data, so a
//! slow reader throttles a fast writer across the tunnel.
//!
//! The window is a plain counter owned by the stream and mutated only
//! under the stream lock; the lock is what makes "take credit, queue the
//! DAT frame" a single step.

/// Outbound credit ("unblocked" bytes) for one stream.
#[derive(Debug, Clone, Default)]
pub struct CreditWindow {
    available: u32,
}

impl CreditWindow {
    /// Create a window with no credit.
    pub fn new() -> Self {
        Self { available: 0 }
    }

    /// Bytes we may send right now.
    #[inline]
    pub fn available(&self) -> u32 {
        self.available
    }

    /// Check whether a writer has to wait.
    #[inline]
    pub fn is_exhausted(&self) -> bool {
        self.available == 0
    }

    /// Add credit granted by the remote end.
    ///
    /// Saturates instead of wrapping; a peer that grants more than 4 GiB of
    /// outstanding credit is already broken.
    pub fn grant(&mut self, credit: u32) {
        self.available = self.available.saturating_add(credit);
    }

    /// Take up to `wanted` bytes of credit, returning how much was taken.
    pub fn take(&mut self, wanted: usize) -> usize {
        let taken = wanted.min(self.available as usize);
        // `taken <= available`, so the cast back is lossless.
        self.available -= taken as u32;
        taken
    }
}
