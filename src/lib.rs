//! # tunnel-mux
//!
//! Multiplex many independent, flow-controlled byte streams over a single
//! message-framed connection.
//!
//! ## Architecture
//!
//! - **Transport**: any `AsyncRead + AsyncWrite` connection, carrying
//!   length-prefixed messages (binary, text, ping, pong, close)
//! - **Frames**: each binary message holds one mux frame (SYN, ACK, DAT or
//!   FIN) addressed to a stream
//! - **Session**: opens and accepts streams, keeps the connection alive
//!   and forgets dead streams
//! - **Stream**: a bidirectional byte channel with credit-based flow
//!   control, half-close and deadlines
//!
//! ## Example
//!
//! ```ignore
//! use tunnel_mux::{Config, Session, Transport};
//!
//! #[tokio::main]
//! async fn main() -> tunnel_mux::Result<()> {
//!     let tcp = tokio::net::TcpStream::connect("127.0.0.1:7000").await?;
//!     let session = Session::client(Transport::from_tcp(tcp), Config::default());
//!
//!     let stream = session.open().await?;
//!     stream.write(b"hello").await?;
//!
//!     let mut buf = [0u8; 64];
//!     let n = stream.read(&mut buf).await?;
//!     println!("{:?}", &buf[..n]);
//!     Ok(())
//! }
//! ```

pub mod buffer;
pub mod config;
pub mod error;
pub mod protocol;
pub mod transport;

mod backpressure;
mod session;
mod stream;
mod writer;

pub use config::{CloseCallback, Config};
pub use error::{MuxError, Result};
pub use session::{Role, Session, SessionBuilder};
pub use stream::Stream;
pub use transport::Transport;
