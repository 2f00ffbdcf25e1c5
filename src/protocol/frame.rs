//! Mux frames.
//!
//! A frame is the payload of one binary transport message:
//! ```text
//! ┌──────┬───────────┬──────────────────────────────┐
//! │ Kind │ Stream ID │ Payload                      │
//! │1 byte│ uint32 LE │ SYN/FIN: empty               │
//! │      │           │ ACK: uint32 LE credit grant  │
//! │      │           │ DAT: application bytes       │
//! └──────┴───────────┴──────────────────────────────┘
//! ```
//!
//! DAT frames carry no length prefix; the message boundary delimits them.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{MuxError, Result};

/// Size of the fixed frame prefix (kind + stream id).
pub const FRAME_HEADER_SIZE: usize = 5;

/// Size of the credit field carried by ACK frames.
const CREDIT_SIZE: usize = 4;

/// The four frame kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameKind {
    /// Open request.
    Syn = 0,
    /// Acceptance and credit grant.
    Ack = 1,
    /// Stream data.
    Dat = 2,
    /// Half-close.
    Fin = 3,
}

impl TryFrom<u8> for FrameKind {
    type Error = MuxError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(FrameKind::Syn),
            1 => Ok(FrameKind::Ack),
            2 => Ok(FrameKind::Dat),
            3 => Ok(FrameKind::Fin),
            other => Err(MuxError::Decode(format!("unknown frame kind {}", other))),
        }
    }
}

/// An immutable mux frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    kind: FrameKind,
    stream_id: u32,
    payload: Bytes,
}

impl Frame {
    /// SYN frame opening `stream_id`.
    pub fn syn(stream_id: u32) -> Self {
        Self {
            kind: FrameKind::Syn,
            stream_id,
            payload: Bytes::new(),
        }
    }

    /// ACK frame granting `credit` more bytes on `stream_id`.
    pub fn ack(stream_id: u32, credit: u32) -> Self {
        Self {
            kind: FrameKind::Ack,
            stream_id,
            payload: Bytes::copy_from_slice(&credit.to_le_bytes()),
        }
    }

    /// DAT frame carrying `payload` on `stream_id`.
    pub fn dat(stream_id: u32, payload: Bytes) -> Self {
        Self {
            kind: FrameKind::Dat,
            stream_id,
            payload,
        }
    }

    /// FIN frame closing our side of `stream_id`.
    pub fn fin(stream_id: u32) -> Self {
        Self {
            kind: FrameKind::Fin,
            stream_id,
            payload: Bytes::new(),
        }
    }

    #[inline]
    pub fn kind(&self) -> FrameKind {
        self.kind
    }

    #[inline]
    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    #[inline]
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Credit carried by an ACK frame, `None` for other kinds.
    pub fn credit(&self) -> Option<u32> {
        if self.kind != FrameKind::Ack {
            return None;
        }
        let raw: [u8; CREDIT_SIZE] = self.payload.get(..CREDIT_SIZE)?.try_into().ok()?;
        Some(u32::from_le_bytes(raw))
    }

    /// Encoded size in bytes.
    #[inline]
    pub fn encoded_len(&self) -> usize {
        FRAME_HEADER_SIZE + self.payload.len()
    }

    /// Serialize the frame.
    ///
    /// # Example
    ///
    /// ```
    /// use tunnel_mux::protocol::Frame;
    ///
    /// let bytes = Frame::ack(7, 1024).encode();
    /// assert_eq!(&bytes[..], &[1, 7, 0, 0, 0, 0, 4, 0, 0]);
    /// assert_eq!(Frame::decode(bytes).unwrap().credit(), Some(1024));
    /// ```
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_u8(self.kind as u8);
        buf.put_u32_le(self.stream_id);
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }

    /// Deserialize a frame. The payload shares memory with `buf`.
    pub fn decode(buf: Bytes) -> Result<Self> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Err(MuxError::Decode(format!(
                "frame too short: {} bytes",
                buf.len()
            )));
        }

        let kind = FrameKind::try_from(buf[0])?;
        let stream_id = u32::from_le_bytes([buf[1], buf[2], buf[3], buf[4]]);
        let payload = buf.slice(FRAME_HEADER_SIZE..);

        match kind {
            FrameKind::Ack if payload.len() != CREDIT_SIZE => {
                return Err(MuxError::Decode(format!(
                    "ACK for stream {} carries {} payload bytes, expected {}",
                    stream_id,
                    payload.len(),
                    CREDIT_SIZE
                )));
            }
            FrameKind::Syn | FrameKind::Fin if !payload.is_empty() => {
                return Err(MuxError::Decode(format!(
                    "{:?} for stream {} carries an unexpected payload",
                    kind, stream_id
                )));
            }
            _ => {}
        }

        Ok(Self {
            kind,
            stream_id,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_syn_fin_layout() {
        assert_eq!(&Frame::syn(1).encode()[..], &[0, 1, 0, 0, 0]);
        assert_eq!(&Frame::fin(0x01020304).encode()[..], &[3, 4, 3, 2, 1]);
    }

    #[test]
    fn test_dat_layout() {
        let frame = Frame::dat(2, Bytes::from_static(b"abc"));
        assert_eq!(&frame.encode()[..], &[2, 2, 0, 0, 0, b'a', b'b', b'c']);
        assert_eq!(frame.encoded_len(), 8);
    }

    #[test]
    fn test_decode_dat_shares_payload() {
        let frame = Frame::decode(Frame::dat(9, Bytes::from_static(b"payload")).encode()).unwrap();
        assert_eq!(frame.kind(), FrameKind::Dat);
        assert_eq!(frame.stream_id(), 9);
        assert_eq!(&frame.payload()[..], b"payload");
        assert_eq!(frame.credit(), None);
    }

    #[test]
    fn test_ack_credit_little_endian() {
        let frame = Frame::decode(Bytes::from_static(&[1, 5, 0, 0, 0, 0x10, 0x27, 0, 0])).unwrap();
        assert_eq!(frame.kind(), FrameKind::Ack);
        assert_eq!(frame.credit(), Some(10_000));
    }

    #[test]
    fn test_decode_truncated() {
        let err = Frame::decode(Bytes::from_static(&[0, 1, 0])).unwrap_err();
        assert!(matches!(err, MuxError::Decode(_)));
    }

    #[test]
    fn test_decode_unknown_kind() {
        let err = Frame::decode(Bytes::from_static(&[9, 1, 0, 0, 0])).unwrap_err();
        assert!(err.to_string().contains("unknown frame kind 9"));
    }

    #[test]
    fn test_decode_ack_without_credit() {
        let err = Frame::decode(Bytes::from_static(&[1, 1, 0, 0, 0, 0xff])).unwrap_err();
        assert!(matches!(err, MuxError::Decode(_)));
        assert!(Frame::decode(Bytes::from_static(&[1, 1, 0, 0, 0])).is_err());
    }

    #[test]
    fn test_decode_syn_with_payload() {
        assert!(Frame::decode(Bytes::from_static(&[0, 1, 0, 0, 0, 1])).is_err());
    }

    #[test]
    fn test_empty_dat_is_valid() {
        let frame = Frame::decode(Bytes::from_static(&[2, 1, 0, 0, 0])).unwrap();
        assert!(frame.payload().is_empty());
    }
}
