//! Transport message header encoding and decoding.
//!
//! Every message on the physical connection starts with a 5-byte header:
//! ```text
//! ┌────────┬──────────┐
//! │ Opcode │ Length   │
//! │ 1 byte │ 4 bytes  │
//! │        │ uint32 BE│
//! └────────┴──────────┘
//! ```
//!
//! Opcode values follow WebSocket so a WebSocket adapter can map them 1:1.

use crate::error::{MuxError, Result};

/// Header size in bytes (fixed, exactly 5).
pub const HEADER_SIZE: usize = 5;

/// Default maximum message payload size (16 MiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: u32 = 16 * 1024 * 1024;

/// Opcode constants for transport messages.
pub mod opcode {
    /// Text message (not used by the mux, ignored on receipt).
    pub const TEXT: u8 = 0x1;
    /// Binary message carrying exactly one mux frame.
    pub const BINARY: u8 = 0x2;
    /// Connection close.
    pub const CLOSE: u8 = 0x8;
    /// Keep-alive ping.
    pub const PING: u8 = 0x9;
    /// Keep-alive pong.
    pub const PONG: u8 = 0xA;

    /// Check whether an opcode is one this layer understands.
    #[inline]
    pub fn is_known(op: u8) -> bool {
        matches!(op, TEXT | BINARY | CLOSE | PING | PONG)
    }
}

/// Decoded message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Message opcode (see `opcode` module).
    pub opcode: u8,
    /// Payload length in bytes.
    pub length: u32,
}

impl Header {
    /// Create a new header.
    pub fn new(opcode: u8, length: u32) -> Self {
        Self { opcode, length }
    }

    /// Encode header to bytes.
    ///
    /// # Example
    ///
    /// ```
    /// use tunnel_mux::protocol::{opcode, Header};
    ///
    /// let bytes = Header::new(opcode::BINARY, 9).encode();
    /// assert_eq!(bytes, [0x02, 0, 0, 0, 9]);
    /// ```
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        self.encode_into(&mut buf);
        buf
    }

    /// Encode header into an existing buffer.
    ///
    /// # Panics
    ///
    /// Panics if buffer is smaller than `HEADER_SIZE` (5 bytes).
    pub fn encode_into(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= HEADER_SIZE);
        buf[0] = self.opcode;
        buf[1..5].copy_from_slice(&self.length.to_be_bytes());
    }

    /// Decode header from bytes.
    ///
    /// Returns `None` if buffer is too short.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_SIZE {
            return None;
        }
        Some(Self {
            opcode: buf[0],
            length: u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]),
        })
    }

    /// Validate the header against the protocol and a size limit.
    pub fn validate(&self, max_message_size: u32) -> Result<()> {
        if !opcode::is_known(self.opcode) {
            return Err(MuxError::Protocol(format!(
                "Unknown message opcode 0x{:02x}",
                self.opcode
            )));
        }

        if self.length > max_message_size {
            return Err(MuxError::Protocol(format!(
                "Message size {} exceeds maximum {}",
                self.length, max_message_size
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_encode_decode_roundtrip() {
        let original = Header::new(opcode::PING, 42);
        let decoded = Header::decode(&original.encode()).unwrap();
        assert_eq!(original, decoded);
    }

    #[test]
    fn test_header_big_endian_length() {
        let bytes = Header::new(opcode::BINARY, 0x01020304).encode();
        assert_eq!(bytes, [0x02, 0x01, 0x02, 0x03, 0x04]);
    }

    #[test]
    fn test_decode_too_short_buffer() {
        assert!(Header::decode(&[0x02, 0, 0, 0]).is_none());
    }

    #[test]
    fn test_validate_unknown_opcode() {
        let result = Header::new(0x3, 0).validate(DEFAULT_MAX_MESSAGE_SIZE);
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Unknown message opcode 0x03"));
    }

    #[test]
    fn test_validate_too_large() {
        let result = Header::new(opcode::BINARY, 1000).validate(100);
        assert!(result.unwrap_err().to_string().contains("exceeds maximum"));
    }

    #[test]
    fn test_known_opcodes() {
        for op in [
            opcode::TEXT,
            opcode::BINARY,
            opcode::CLOSE,
            opcode::PING,
            opcode::PONG,
        ] {
            assert!(opcode::is_known(op));
            assert!(Header::new(op, 0).validate(0).is_ok());
        }
        assert!(!opcode::is_known(0));
        assert!(!opcode::is_known(0xFF));
    }
}
