//! Split connection halves plus optional socket addresses.
//!
//! # Example
//!
//! ```ignore
//! use tunnel_mux::{Config, Session, Transport};
//!
//! let tcp = tokio::net::TcpStream::connect("127.0.0.1:7000").await?;
//! let session = Session::client(Transport::from_tcp(tcp), Config::default());
//! ```

use std::net::SocketAddr;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// Boxed read half of a connection.
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Boxed write half of a connection.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Local and remote address of the physical connection, when known.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Addrs {
    pub local: Option<SocketAddr>,
    pub remote: Option<SocketAddr>,
}

/// An established physical connection, ready to carry a session.
pub struct Transport {
    reader: BoxedReader,
    writer: BoxedWriter,
    addrs: Addrs,
}

impl Transport {
    /// Wrap any bidirectional byte stream.
    pub fn new<T>(io: T) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(io);
        Self::from_split(reader, writer)
    }

    /// Wrap separately owned read and write halves.
    pub fn from_split<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
            addrs: Addrs::default(),
        }
    }

    /// Wrap a TCP connection, recording both socket addresses.
    pub fn from_tcp(stream: TcpStream) -> Self {
        let addrs = Addrs {
            local: stream.local_addr().ok(),
            remote: stream.peer_addr().ok(),
        };
        let (reader, writer) = stream.into_split();
        Self {
            addrs,
            ..Self::from_split(reader, writer)
        }
    }

    /// Wrap a Unix Domain Socket connection.
    #[cfg(unix)]
    pub fn from_unix(stream: tokio::net::UnixStream) -> Self {
        let (reader, writer) = stream.into_split();
        Self::from_split(reader, writer)
    }

    /// Override the addresses reported by the session and its streams.
    pub fn with_addrs(mut self, local: Option<SocketAddr>, remote: Option<SocketAddr>) -> Self {
        self.addrs = Addrs { local, remote };
        self
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.addrs.local
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.addrs.remote
    }

    pub(crate) fn into_parts(self) -> (BoxedReader, BoxedWriter, Addrs) {
        (self.reader, self.writer, self.addrs)
    }
}
