//! Message buffer for accumulating partial reads.
//!
//! The physical connection is a byte stream, so messages arrive in
//! arbitrary fragments. `MessageBuffer` uses `bytes::BytesMut` and a small
//! state machine to cut them back into whole messages:
//! - `WaitingForHeader`: need at least 5 bytes
//! - `WaitingForPayload`: header parsed, need N more payload bytes

use bytes::{Bytes, BytesMut};

use super::message::Message;
use super::wire_format::{Header, DEFAULT_MAX_MESSAGE_SIZE, HEADER_SIZE};
use crate::error::Result;

/// Initial buffer capacity.
const INITIAL_CAPACITY: usize = 64 * 1024;

#[derive(Debug, Clone)]
enum State {
    WaitingForHeader,
    WaitingForPayload { header: Header },
}

/// Buffer for accumulating incoming bytes and extracting complete messages.
pub struct MessageBuffer {
    buffer: BytesMut,
    state: State,
    max_message_size: u32,
}

impl MessageBuffer {
    /// Create a new message buffer with the default size limit (16 MiB).
    pub fn new() -> Self {
        Self::with_max_message_size(DEFAULT_MAX_MESSAGE_SIZE)
    }

    /// Create a new message buffer with a custom size limit.
    pub fn with_max_message_size(max_message_size: u32) -> Self {
        Self {
            buffer: BytesMut::with_capacity(INITIAL_CAPACITY),
            state: State::WaitingForHeader,
            max_message_size,
        }
    }

    /// Push data into the buffer and extract all complete messages.
    ///
    /// Partial data is kept for the next push.
    ///
    /// # Errors
    ///
    /// Returns a protocol error on an unknown opcode or an oversized message.
    /// The connection cannot be resynchronized after that.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Message>> {
        self.buffer.extend_from_slice(data);

        let mut messages = Vec::new();
        while let Some(message) = self.try_extract_one()? {
            messages.push(message);
        }
        Ok(messages)
    }

    fn try_extract_one(&mut self) -> Result<Option<Message>> {
        loop {
            match &self.state {
                State::WaitingForHeader => {
                    let header = match Header::decode(&self.buffer) {
                        Some(header) => header,
                        None => return Ok(None),
                    };
                    header.validate(self.max_message_size)?;

                    let _ = self.buffer.split_to(HEADER_SIZE);

                    if header.length == 0 {
                        return Message::from_parts(header, Bytes::new()).map(Some);
                    }
                    self.state = State::WaitingForPayload { header };
                }

                State::WaitingForPayload { header } => {
                    let remaining = header.length as usize;
                    if self.buffer.len() < remaining {
                        return Ok(None);
                    }

                    let header = *header;
                    let payload = self.buffer.split_to(remaining).freeze();
                    self.state = State::WaitingForHeader;

                    return Message::from_parts(header, payload).map(Some);
                }
            }
        }
    }

    /// Get the number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    #[cfg(test)]
    fn state_name(&self) -> &'static str {
        match &self.state {
            State::WaitingForHeader => "WaitingForHeader",
            State::WaitingForPayload { .. } => "WaitingForPayload",
        }
    }
}

impl Default for MessageBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{build_message, opcode};

    fn binary(payload: &'static [u8]) -> Vec<u8> {
        build_message(&Message::Binary(Bytes::from_static(payload)))
    }

    #[test]
    fn test_single_complete_message() {
        let mut buffer = MessageBuffer::new();
        let messages = buffer.push(&binary(b"hello")).unwrap();

        assert_eq!(messages, vec![Message::Binary(Bytes::from_static(b"hello"))]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_multiple_messages_in_one_push() {
        let mut buffer = MessageBuffer::new();

        let mut combined = binary(b"first");
        combined.extend(build_message(&Message::Ping(Bytes::from_static(b"p"))));
        combined.extend(build_message(&Message::Close));

        let messages = buffer.push(&combined).unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[1], Message::Ping(Bytes::from_static(b"p")));
        assert_eq!(messages[2], Message::Close);
    }

    #[test]
    fn test_fragmented_header_and_payload() {
        let mut buffer = MessageBuffer::new();
        let bytes = binary(b"a longer payload that arrives in pieces");

        assert!(buffer.push(&bytes[..3]).unwrap().is_empty());
        assert_eq!(buffer.state_name(), "WaitingForHeader");

        assert!(buffer.push(&bytes[3..HEADER_SIZE + 4]).unwrap().is_empty());
        assert_eq!(buffer.state_name(), "WaitingForPayload");

        let messages = buffer.push(&bytes[HEADER_SIZE + 4..]).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(
            messages[0].payload(),
            Bytes::from_static(b"a longer payload that arrives in pieces")
        );
        assert_eq!(buffer.state_name(), "WaitingForHeader");
    }

    #[test]
    fn test_byte_at_a_time() {
        let mut buffer = MessageBuffer::new();
        let mut all = Vec::new();
        for byte in binary(b"hi") {
            all.extend(buffer.push(&[byte]).unwrap());
        }
        assert_eq!(all, vec![Message::Binary(Bytes::from_static(b"hi"))]);
    }

    #[test]
    fn test_oversized_message_rejected() {
        let mut buffer = MessageBuffer::with_max_message_size(100);
        let header = Header::new(opcode::BINARY, 1000).encode();

        let result = buffer.push(&header);
        assert!(result.unwrap_err().to_string().contains("exceeds maximum"));
    }

    #[test]
    fn test_unknown_opcode_rejected() {
        let mut buffer = MessageBuffer::new();
        let result = buffer.push(&[0x4, 0, 0, 0, 0]);
        assert!(result.is_err());
    }
}
