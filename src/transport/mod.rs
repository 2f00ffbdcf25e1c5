//! Transport module - the physical connection under a session.
//!
//! A session runs over any ordered, reliable byte stream:
//! - TCP (`Transport::from_tcp`, which also records socket addresses)
//! - Unix Domain Sockets (`Transport::from_unix`)
//! - anything else implementing `AsyncRead + AsyncWrite`, including
//!   in-memory pipes in tests

mod conn;

pub use conn::{BoxedReader, BoxedWriter, Transport};
pub(crate) use conn::Addrs;
