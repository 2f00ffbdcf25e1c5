//! Error types for tunnel-mux.

use std::io;
use std::sync::Arc;

use thiserror::Error;

/// Main error type for all session and stream operations.
///
/// The type is `Clone` because a single abort error is stored by the
/// session and handed out to every pending and future caller.
#[derive(Debug, Clone, Error)]
pub enum MuxError {
    /// Operation attempted after (or during) session shutdown.
    #[error("session closed")]
    SessionClosed,

    /// The peer did not acknowledge an opened stream in time.
    #[error("stream not accepted before deadline")]
    AcceptTimeout,

    /// The queue of peer-initiated streams awaiting `accept` overflowed.
    #[error("too many pending SYN frames")]
    TooManySyns,

    /// No pong was seen within the keep-alive interval, or the writer had
    /// already stopped when a ping was due. A ping that fails on the
    /// connection itself surfaces as [`MuxError::Io`] from the writer.
    #[error("keep-alive expired")]
    KeepAliveExpired,

    /// The read deadline fired.
    #[error("read timed out")]
    ReadTimeout,

    /// The write deadline fired.
    #[error("write timed out")]
    WriteTimeout,

    /// Write attempted on a locally closed or dead stream.
    #[error("broken pipe")]
    BrokenPipe,

    /// Inbound data would overflow the stream buffer (peer ignored flow control).
    #[error("buffer has no capacity for {requested} bytes ({available} available)")]
    NoCapacity { requested: usize, available: usize },

    /// A single mux frame could not be decoded.
    #[error("frame decode error: {0}")]
    Decode(String),

    /// Transport-level protocol violation.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// I/O error on the physical connection.
    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),
}

impl From<io::Error> for MuxError {
    fn from(err: io::Error) -> Self {
        MuxError::Io(Arc::new(err))
    }
}

impl From<MuxError> for io::Error {
    fn from(err: MuxError) -> Self {
        let kind = match &err {
            MuxError::Io(inner) => inner.kind(),
            MuxError::SessionClosed => io::ErrorKind::NotConnected,
            MuxError::AcceptTimeout | MuxError::ReadTimeout | MuxError::WriteTimeout => {
                io::ErrorKind::TimedOut
            }
            MuxError::BrokenPipe => io::ErrorKind::BrokenPipe,
            MuxError::KeepAliveExpired | MuxError::TooManySyns => io::ErrorKind::ConnectionAborted,
            MuxError::NoCapacity { .. } | MuxError::Decode(_) | MuxError::Protocol(_) => {
                io::ErrorKind::InvalidData
            }
        };
        io::Error::new(kind, err)
    }
}

/// Result type alias using MuxError.
pub type Result<T> = std::result::Result<T, MuxError>;
