//! Protocol module - transport messages and mux frames.
//!
//! Two layers live here:
//! - the transport message layer (5-byte header, partial-read accumulation)
//!   that turns a byte stream into a message-framed connection
//! - the mux frame codec (SYN/ACK/DAT/FIN) carried in binary messages

mod frame;
mod message;
mod message_buffer;
mod wire_format;

pub use frame::{Frame, FrameKind, FRAME_HEADER_SIZE};
pub use message::{build_message, Message};
pub use message_buffer::MessageBuffer;
pub use wire_format::{opcode, Header, DEFAULT_MAX_MESSAGE_SIZE, HEADER_SIZE};
