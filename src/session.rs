//! Sessions: many streams over one connection.
//!
//! A session owns the physical connection through four background tasks:
//!
//! - the **writer**, the only task that touches the write half;
//! - the **receive loop**, which decodes messages and dispatches frames;
//! - the **keep-alive** loop, which pings the peer and aborts the session
//!   when no pong comes back within one interval;
//! - the **reaper**, which forgets streams that are dead and drained.
//!
//! # Example
//!
//! ```ignore
//! use tunnel_mux::{Config, Session, Transport};
//!
//! let (a, b) = tokio::io::duplex(64 * 1024);
//! let server = Session::server(Transport::new(a), Config::default());
//! let client = Session::client(Transport::new(b), Config::default());
//!
//! let (opened, accepted) = tokio::join!(client.open(), server.accept());
//! opened?.write(b"hello").await?;
//! ```

use std::collections::HashMap;
use std::fmt;
use std::future::poll_fn;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::Instrument;

use crate::config::Config;
use crate::error::{MuxError, Result};
use crate::protocol::{Frame, FrameKind, Message, MessageBuffer};
use crate::stream::{Stream, StreamShared};
use crate::transport::{Addrs, BoxedReader, Transport};
use crate::writer::{self, WriterHandle};

/// Size of the receive loop's read buffer.
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// How long the writer may keep flushing after the session closed.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Which end of the connection a session is.
///
/// Servers allocate even stream IDs starting at 0, clients odd IDs
/// starting at 1, so the two ends never collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    fn first_stream_id(self) -> u32 {
        match self {
            Role::Server => 0,
            Role::Client => 1,
        }
    }

    /// Check whether `id` belongs to the range this role allocates from.
    fn owns(self, id: u32) -> bool {
        id % 2 == self.first_stream_id()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Open,
    Closing,
    Closed,
}

struct SessionInner {
    lifecycle: Lifecycle,
    streams: HashMap<u32, Arc<StreamShared>>,
    next_id: u32,
    accept_tx: Option<mpsc::Sender<Arc<StreamShared>>>,
    /// Why the session ended; reported by `accept` and to killed streams.
    close_reason: Option<MuxError>,
    /// Cleared when the peer already said goodbye.
    send_close: bool,
}

pub(crate) struct SessionShared {
    role: Role,
    config: Config,
    addrs: Addrs,
    inner: Mutex<SessionInner>,
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<Arc<StreamShared>>>,
    closed: watch::Sender<bool>,
    pong_seen: AtomicBool,
    writer: WriterHandle,
}

/// A multiplexing session over one connection.
///
/// Dropping the session closes it.
pub struct Session {
    shared: Arc<SessionShared>,
}

/// Builder for [`Session`].
pub struct SessionBuilder {
    role: Role,
    config: Config,
}

impl SessionBuilder {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            config: Config::default(),
        }
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    pub fn keep_alive_interval(mut self, interval: Duration) -> Self {
        self.config.keep_alive_interval = interval;
        self
    }

    pub fn stream_accept_deadline(mut self, deadline: Duration) -> Self {
        self.config.stream_accept_deadline = deadline;
        self
    }

    pub fn stream_buffer_size(mut self, size: usize) -> Self {
        self.config.stream_buffer_size = size;
        self
    }

    pub fn accept_queue_size(mut self, size: usize) -> Self {
        self.config.accept_queue_size = size;
        self
    }

    pub fn dead_stream_check_interval(mut self, interval: Duration) -> Self {
        self.config.dead_stream_check_interval = interval;
        self
    }

    pub fn max_message_size(mut self, size: u32) -> Self {
        self.config.max_message_size = size;
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = Some(name.into());
        self
    }

    /// Run `callback` once when the session closes.
    pub fn close_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.config.close_callback = Some(Arc::new(callback));
        self
    }

    /// Start the session on `transport`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(self, transport: Transport) -> Session {
        Session::start(self.role, transport, self.config)
    }
}

impl Session {
    /// Start the client end of a session.
    pub fn client(transport: Transport, config: Config) -> Self {
        Self::start(Role::Client, transport, config)
    }

    /// Start the server end of a session.
    pub fn server(transport: Transport, config: Config) -> Self {
        Self::start(Role::Server, transport, config)
    }

    pub fn builder(role: Role) -> SessionBuilder {
        SessionBuilder::new(role)
    }

    fn start(role: Role, transport: Transport, config: Config) -> Self {
        let config = config.normalized();
        let (reader, write_half, addrs) = transport.into_parts();
        let (writer, queue) = writer::channel();
        let (accept_tx, accept_rx) = mpsc::channel(config.accept_queue_size);
        let (closed, _) = watch::channel(false);

        let span = tracing::debug_span!(
            "mux_session",
            role = ?role,
            name = config.name.as_deref().unwrap_or_default()
        );

        let shared = Arc::new(SessionShared {
            role,
            addrs,
            inner: Mutex::new(SessionInner {
                lifecycle: Lifecycle::Open,
                streams: HashMap::new(),
                next_id: role.first_stream_id(),
                accept_tx: Some(accept_tx),
                close_reason: None,
                send_close: true,
            }),
            accept_rx: tokio::sync::Mutex::new(accept_rx),
            closed,
            pong_seen: AtomicBool::new(false),
            writer,
            config,
        });

        tokio::spawn(
            {
                let shared = shared.clone();
                async move {
                    let mut closed = shared.closed.subscribe();
                    let run = writer::run(queue, write_half);
                    tokio::pin!(run);

                    let result = tokio::select! {
                        result = &mut run => result,
                        _ = wait_closed(&mut closed) => {
                            // Let the queued frames and the goodbye go out.
                            tokio::time::timeout(WRITER_DRAIN_TIMEOUT, run)
                                .await
                                .unwrap_or(Ok(()))
                        }
                    };
                    if let Err(e) = result {
                        tracing::warn!("writer task failed: {}", e);
                        shared.abort(e);
                    }
                }
            }
            .instrument(span.clone()),
        );
        tokio::spawn(recv_loop(shared.clone(), reader).instrument(span.clone()));
        tokio::spawn(keep_alive(shared.clone()).instrument(span.clone()));
        tokio::spawn(reap_dead_streams(shared.clone()).instrument(span.clone()));

        span.in_scope(|| tracing::debug!("session started"));
        Self { shared }
    }

    /// Open a new stream and wait for the peer to accept it.
    ///
    /// Fails with `AcceptTimeout` if the peer does not accept within
    /// the configured deadline, or with the session's error if it closes
    /// first.
    pub async fn open(&self) -> Result<Stream> {
        let shared = &*self.shared;
        let stream = shared.register_outbound()?;

        let mut guard = OpenGuard {
            session: shared,
            stream: &stream,
            armed: true,
        };
        let accepted = tokio::time::timeout(
            shared.config.stream_accept_deadline,
            poll_fn(|cx| stream.poll_accepted(cx)),
        )
        .await;

        match accepted {
            Ok(Ok(())) => {
                guard.armed = false;
                Ok(Stream::new(stream.clone()))
            }
            Ok(Err(e)) => Err(e),
            Err(_) => {
                tracing::debug!("stream {} was not accepted in time", stream.id());
                Err(MuxError::AcceptTimeout)
            }
        }
    }

    /// Wait for the next peer-initiated stream.
    pub async fn accept(&self) -> Result<Stream> {
        let shared = &*self.shared;
        let mut closed = shared.closed.subscribe();

        let mut queue = tokio::select! {
            queue = shared.accept_rx.lock() => queue,
            _ = wait_closed(&mut closed) => return Err(shared.close_reason()),
        };
        let next = tokio::select! {
            biased;
            _ = wait_closed(&mut closed) => return Err(shared.close_reason()),
            next = queue.recv() => next,
        };
        drop(queue);

        let Some(stream) = next else {
            return Err(shared.close_reason());
        };
        if shared.lock().lifecycle != Lifecycle::Open {
            return Err(shared.close_reason());
        }

        // Outbound credit arrives with the opener's first ACK.
        stream.accept(0);
        let grant = shared.config.stream_buffer_size as u32;
        if let Err(e) = shared.writer.send_frame(&Frame::ack(stream.id(), grant)) {
            shared.abort(e.clone());
            return Err(e);
        }
        tracing::debug!("stream {} accepted", stream.id());
        Ok(Stream::new(stream))
    }

    /// Close the session and every stream in it.
    ///
    /// Idempotent; calls after the first return `Ok(())`.
    pub fn close(&self) -> Result<()> {
        self.shared.close()
    }

    pub fn is_closed(&self) -> bool {
        *self.shared.closed.borrow()
    }

    /// Wait until the session has closed.
    pub async fn closed(&self) {
        wait_closed(&mut self.shared.closed.subscribe()).await;
    }

    /// Why the session closed, once it has.
    pub fn close_reason(&self) -> Option<MuxError> {
        if self.is_closed() {
            Some(self.shared.close_reason())
        } else {
            None
        }
    }

    pub fn role(&self) -> Role {
        self.shared.role
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.addrs.local
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.shared.addrs.remote
    }

    /// Number of streams the session is tracking.
    pub fn stream_count(&self) -> usize {
        self.shared.lock().streams.len()
    }

    /// Messages queued but not yet written to the connection.
    pub fn pending_messages(&self) -> usize {
        self.shared.writer.pending_count()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.shared.lock();
        f.debug_struct("Session")
            .field("role", &self.shared.role)
            .field("lifecycle", &inner.lifecycle)
            .field("streams", &inner.streams.len())
            .finish()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let _ = self.shared.close();
    }
}

/// Forgets a pending `open` registration unless disarmed.
struct OpenGuard<'a> {
    session: &'a SessionShared,
    stream: &'a Arc<StreamShared>,
    armed: bool,
}

impl Drop for OpenGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.session.forget(self.stream);
        }
    }
}

impl SessionShared {
    fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn close_reason(&self) -> MuxError {
        self.lock()
            .close_reason
            .clone()
            .unwrap_or(MuxError::SessionClosed)
    }

    /// Allocate an ID, register the stream and queue its SYN.
    fn register_outbound(&self) -> Result<Arc<StreamShared>> {
        let mut inner = self.lock();
        if inner.lifecycle != Lifecycle::Open {
            return Err(MuxError::SessionClosed);
        }

        // Skip IDs still held by live streams after wraparound.
        let mut id = inner.next_id;
        while inner.streams.contains_key(&id) {
            id = id.wrapping_add(2);
        }
        inner.next_id = id.wrapping_add(2);

        let stream = StreamShared::new(
            id,
            self.config.stream_buffer_size,
            self.writer.clone(),
            self.addrs,
        );
        self.writer.send_frame(&Frame::syn(id))?;
        inner.streams.insert(id, stream.clone());
        tracing::debug!("stream {} opened", id);
        Ok(stream)
    }

    /// Drop `stream` from the table if the ID still maps to it.
    fn forget(&self, stream: &Arc<StreamShared>) {
        let mut inner = self.lock();
        let id = stream.id();
        if inner
            .streams
            .get(&id)
            .is_some_and(|current| Arc::ptr_eq(current, stream))
        {
            inner.streams.remove(&id);
        }
    }

    fn handle_message(&self, message: Message) {
        match message {
            Message::Binary(payload) => match Frame::decode(payload) {
                Ok(frame) => self.handle_frame(frame),
                Err(e) => tracing::warn!("dropping malformed frame: {}", e),
            },
            Message::Ping(payload) => {
                if let Err(e) = self.writer.send(&Message::Pong(payload)) {
                    tracing::trace!("could not answer ping: {}", e);
                }
            }
            Message::Pong(_) => self.pong_seen.store(true, Ordering::Release),
            Message::Close => {
                tracing::debug!("peer closed the connection");
                self.lock().send_close = false;
                let _ = self.close();
            }
            Message::Text(_) => tracing::warn!("ignoring text message"),
        }
    }

    fn handle_frame(&self, frame: Frame) {
        if frame.kind() == FrameKind::Syn {
            self.handle_syn(frame.stream_id());
            return;
        }

        let stream = self.lock().streams.get(&frame.stream_id()).cloned();
        match stream {
            Some(stream) => stream.handle_frame(&frame),
            None => tracing::trace!(
                "dropping {:?} frame for unknown stream {}",
                frame.kind(),
                frame.stream_id()
            ),
        }
    }

    fn handle_syn(&self, id: u32) {
        let (stream, queued) = {
            let mut inner = self.lock();
            if inner.lifecycle != Lifecycle::Open {
                return;
            }
            if self.role.owns(id) {
                tracing::warn!("ignoring SYN for stream {} from our own ID range", id);
                return;
            }
            if inner.streams.contains_key(&id) {
                tracing::warn!("ignoring duplicate SYN for stream {}", id);
                return;
            }

            let stream = StreamShared::new(
                id,
                self.config.stream_buffer_size,
                self.writer.clone(),
                self.addrs,
            );
            inner.streams.insert(id, stream.clone());
            let queued = match &inner.accept_tx {
                Some(tx) => tx.try_send(stream.clone()),
                None => return,
            };
            (stream, queued)
        };

        match queued {
            Ok(()) => tracing::debug!("stream {} waiting to be accepted", id),
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!("accept queue full, rejecting stream {}", id);
                let _ = stream.close();
                self.abort(MuxError::TooManySyns);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    /// Close with `err` as the reason, unless already closing.
    fn abort(&self, err: MuxError) {
        {
            let mut inner = self.lock();
            if inner.lifecycle != Lifecycle::Open {
                return;
            }
            tracing::warn!("aborting session: {}", err);
            inner.close_reason = Some(err);
        }
        let _ = self.close();
    }

    fn close(&self) -> Result<()> {
        let (streams, send_close, reason) = {
            let mut inner = self.lock();
            if inner.lifecycle != Lifecycle::Open {
                return Ok(());
            }
            inner.lifecycle = Lifecycle::Closing;
            inner.accept_tx = None;
            let reason = inner
                .close_reason
                .get_or_insert(MuxError::SessionClosed)
                .clone();
            (std::mem::take(&mut inner.streams), inner.send_close, reason)
        };

        tracing::debug!("closing session with {} streams", streams.len());
        let result = self.writer.shutdown(send_close);
        for stream in streams.values() {
            stream.kill(reason.clone());
        }

        self.lock().lifecycle = Lifecycle::Closed;
        self.closed.send_replace(true);
        if let Some(callback) = &self.config.close_callback {
            callback();
        }
        result
    }
}

/// Resolve once the session has been marked closed.
async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    let _ = closed.wait_for(|closed| *closed).await;
}

async fn recv_loop(shared: Arc<SessionShared>, mut reader: BoxedReader) {
    let mut closed = shared.closed.subscribe();
    let mut messages = MessageBuffer::with_max_message_size(shared.config.max_message_size);
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let read = tokio::select! {
            _ = wait_closed(&mut closed) => return,
            read = reader.read(&mut buf) => read,
        };

        let n = match read {
            Ok(0) => {
                let eof = io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed by peer");
                shared.abort(eof.into());
                return;
            }
            Ok(n) => n,
            Err(e) => {
                shared.abort(e.into());
                return;
            }
        };

        match messages.push(&buf[..n]) {
            Ok(batch) => {
                for message in batch {
                    shared.handle_message(message);
                }
            }
            Err(e) => {
                shared.abort(e);
                return;
            }
        }
    }
}

async fn keep_alive(shared: Arc<SessionShared>) {
    let period = shared.config.keep_alive_interval;
    let mut closed = shared.closed.subscribe();
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        if shared.writer.send(&Message::Ping(Bytes::new())).is_err() {
            shared.abort(MuxError::KeepAliveExpired);
            return;
        }

        tokio::select! {
            _ = ticker.tick() => {}
            _ = wait_closed(&mut closed) => return,
        }

        if !shared.pong_seen.swap(false, Ordering::AcqRel) {
            shared.abort(MuxError::KeepAliveExpired);
            return;
        }
    }
}

async fn reap_dead_streams(shared: Arc<SessionShared>) {
    let period = shared.config.dead_stream_check_interval;
    let mut closed = shared.closed.subscribe();
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = wait_closed(&mut closed) => return,
        }

        let mut inner = shared.lock();
        let before = inner.streams.len();
        inner.streams.retain(|_, stream| !stream.is_removable());
        let reaped = before - inner.streams.len();
        if reaped > 0 {
            tracing::trace!("reaped {} dead streams", reaped);
        }
    }
}
