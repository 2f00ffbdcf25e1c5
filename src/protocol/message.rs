//! Transport messages.
//!
//! A [`Message`] is one unit on the physical connection. Only `Binary`
//! messages carry mux frames; the rest drive connection liveness and
//! shutdown.

use bytes::Bytes;

use super::wire_format::{opcode, Header, HEADER_SIZE};
use crate::error::{MuxError, Result};

/// A complete transport message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Text payload; the mux ignores these.
    Text(Bytes),
    /// One encoded mux frame.
    Binary(Bytes),
    /// Keep-alive probe, answered with a `Pong` carrying the same payload.
    Ping(Bytes),
    /// Keep-alive answer.
    Pong(Bytes),
    /// The sender is closing the connection.
    Close,
}

impl Message {
    /// Build a message from a decoded header and its payload.
    pub fn from_parts(header: Header, payload: Bytes) -> Result<Self> {
        match header.opcode {
            opcode::TEXT => Ok(Message::Text(payload)),
            opcode::BINARY => Ok(Message::Binary(payload)),
            opcode::PING => Ok(Message::Ping(payload)),
            opcode::PONG => Ok(Message::Pong(payload)),
            opcode::CLOSE => Ok(Message::Close),
            other => Err(MuxError::Protocol(format!(
                "Unknown message opcode 0x{:02x}",
                other
            ))),
        }
    }

    /// Opcode for this message.
    pub fn opcode(&self) -> u8 {
        match self {
            Message::Text(_) => opcode::TEXT,
            Message::Binary(_) => opcode::BINARY,
            Message::Ping(_) => opcode::PING,
            Message::Pong(_) => opcode::PONG,
            Message::Close => opcode::CLOSE,
        }
    }

    /// Payload bytes (empty for `Close`).
    pub fn payload(&self) -> Bytes {
        match self {
            Message::Text(p) | Message::Binary(p) | Message::Ping(p) | Message::Pong(p) => {
                p.clone()
            }
            Message::Close => Bytes::new(),
        }
    }

    /// Header describing this message.
    pub fn header(&self) -> Header {
        let len = match self {
            Message::Text(p) | Message::Binary(p) | Message::Ping(p) | Message::Pong(p) => p.len(),
            Message::Close => 0,
        };
        Header::new(self.opcode(), len as u32)
    }
}

/// Build a complete message as a single byte vector.
///
/// # Example
///
/// ```
/// use bytes::Bytes;
/// use tunnel_mux::protocol::{build_message, Message};
///
/// let bytes = build_message(&Message::Ping(Bytes::from_static(b"hi")));
/// assert_eq!(bytes, vec![0x09, 0, 0, 0, 2, b'h', b'i']);
/// ```
pub fn build_message(message: &Message) -> Vec<u8> {
    let payload = message.payload();
    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    buf.extend_from_slice(&message.header().encode());
    buf.extend_from_slice(&payload);
    buf
}
