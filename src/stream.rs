//! Multiplexed streams.
//!
//! A [`Stream`] is one logical byte channel inside a session. Inbound DAT
//! payloads land in a fixed-size [`RingBuffer`]; outbound writes are
//! bounded by the [`CreditWindow`] the peer grants through ACK frames.
//!
//! All mutable state sits behind one lock. Blocked readers, writers and
//! `open` calls park their wakers in a single list that is drained on
//! every state change, and each woken task re-checks its own condition.
//!
//! ```text
//!            accept / ACK          local close
//! Created ───────────────► Accepted ──────────► Closed ──┐
//!                             │                          │ remote FIN
//!                             │ remote FIN               ▼
//!                             └──────────► RemoteClosed ─► Dead
//!                                            local close
//! ```
//!
//! Session shutdown moves any state straight to `Dead`.

use std::fmt;
use std::future::poll_fn;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, Waker};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::backpressure::CreditWindow;
use crate::buffer::RingBuffer;
use crate::error::{MuxError, Result};
use crate::protocol::{Frame, FrameKind};
use crate::transport::Addrs;
use crate::writer::WriterHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StreamState {
    Created,
    Accepted,
    /// Closed locally; the peer may still send.
    Closed,
    /// The peer sent FIN; we may still send.
    RemoteClosed,
    Dead,
}

#[derive(Debug, Clone, Copy)]
enum Direction {
    Read,
    Write,
}

/// One armed (or fired) deadline.
#[derive(Default)]
struct Deadline {
    exceeded: bool,
    /// Bumped on every reset so a stale timer cannot fire.
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

impl Deadline {
    fn cancel(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

struct Inner {
    state: StreamState,
    buffer: RingBuffer,
    credit: CreditWindow,
    accepted: bool,
    /// The handle is gone; inbound data is discarded.
    detached: bool,
    end_err: Option<MuxError>,
    read_deadline: Deadline,
    write_deadline: Deadline,
    waiters: Vec<Waker>,
}

impl Inner {
    fn park(&mut self, waker: &Waker) {
        if !self.waiters.iter().any(|w| w.will_wake(waker)) {
            self.waiters.push(waker.clone());
        }
    }

    fn wake_all(&mut self) {
        for waker in self.waiters.drain(..) {
            waker.wake();
        }
    }

    fn deadline_mut(&mut self, direction: Direction) -> &mut Deadline {
        match direction {
            Direction::Read => &mut self.read_deadline,
            Direction::Write => &mut self.write_deadline,
        }
    }

    fn remote_done(&self) -> bool {
        matches!(self.state, StreamState::RemoteClosed | StreamState::Dead)
    }

    fn local_done(&self) -> bool {
        matches!(self.state, StreamState::Closed | StreamState::Dead)
    }
}

/// State shared between a [`Stream`] handle and its session.
pub(crate) struct StreamShared {
    id: u32,
    inner: Mutex<Inner>,
    writer: WriterHandle,
    addrs: Addrs,
}

impl StreamShared {
    pub(crate) fn new(id: u32, buffer_size: usize, writer: WriterHandle, addrs: Addrs) -> Arc<Self> {
        Arc::new(Self {
            id,
            inner: Mutex::new(Inner {
                state: StreamState::Created,
                buffer: RingBuffer::new(buffer_size),
                credit: CreditWindow::new(),
                accepted: false,
                detached: false,
                end_err: None,
                read_deadline: Deadline::default(),
                write_deadline: Deadline::default(),
                waiters: Vec::new(),
            }),
            writer,
            addrs,
        })
    }

    #[inline]
    pub(crate) fn id(&self) -> u32 {
        self.id
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> StreamState {
        self.lock().state
    }

    /// Apply an inbound ACK, DAT or FIN frame.
    pub(crate) fn handle_frame(&self, frame: &Frame) {
        let mut inner = self.lock();
        match frame.kind() {
            FrameKind::Ack => {
                let credit = frame.credit().unwrap_or(0);
                if inner.accepted {
                    inner.credit.grant(credit);
                    tracing::trace!("stream {}: {} bytes of credit granted", self.id, credit);
                } else {
                    // Our open was accepted. Grant the peer our own buffer
                    // so it never sends more than we can hold.
                    Self::mark_accepted(&mut inner, credit);
                    let capacity = inner.buffer.capacity() as u32;
                    if let Err(e) = self.writer.send_frame(&Frame::ack(self.id, capacity)) {
                        tracing::debug!("stream {}: could not grant initial credit: {}", self.id, e);
                    }
                    tracing::debug!("stream {}: accepted by peer with {} bytes of credit", self.id, credit);
                }
            }
            FrameKind::Dat => {
                let payload = frame.payload();
                if inner.detached {
                    // Nobody will read this; hand the credit straight back.
                    let _ = self.writer.send_frame(&Frame::ack(self.id, payload.len() as u32));
                } else if let Err(e) = inner.buffer.write(payload) {
                    tracing::warn!("stream {}: inbound data overflows buffer: {}", self.id, e);
                    inner.end_err = Some(e);
                }
            }
            FrameKind::Fin => {
                inner.state = match inner.state {
                    StreamState::Closed | StreamState::Dead => StreamState::Dead,
                    _ => StreamState::RemoteClosed,
                };
                tracing::debug!("stream {}: closed by peer, now {:?}", self.id, inner.state);
            }
            FrameKind::Syn => {
                tracing::warn!("stream {}: unexpected SYN for an existing stream", self.id);
                return;
            }
        }
        inner.wake_all();
    }

    /// Accept a peer-initiated stream, starting with `credit` bytes of
    /// outbound credit.
    pub(crate) fn accept(&self, credit: u32) {
        let mut inner = self.lock();
        Self::mark_accepted(&mut inner, credit);
        inner.wake_all();
    }

    fn mark_accepted(inner: &mut Inner, credit: u32) {
        inner.credit.grant(credit);
        inner.accepted = true;
        if inner.state == StreamState::Created {
            inner.state = StreamState::Accepted;
        }
    }

    /// Resolve once the peer has accepted, or with the error that killed
    /// the stream first.
    pub(crate) fn poll_accepted(&self, cx: &mut Context<'_>) -> Poll<Result<()>> {
        let mut inner = self.lock();
        if inner.accepted {
            return Poll::Ready(Ok(()));
        }
        if inner.state == StreamState::Dead {
            let err = inner.end_err.clone().unwrap_or(MuxError::SessionClosed);
            return Poll::Ready(Err(err));
        }
        inner.park(cx.waker());
        Poll::Pending
    }

    /// Force the stream dead. Buffered data stays readable; once drained,
    /// reads fail with `err` unless the peer had already finished sending.
    pub(crate) fn kill(&self, err: MuxError) {
        let mut inner = self.lock();
        if inner.end_err.is_none() && !inner.remote_done() {
            inner.end_err = Some(err);
        }
        inner.state = StreamState::Dead;
        inner.read_deadline.cancel();
        inner.write_deadline.cancel();
        inner.wake_all();
    }

    /// Dead with nothing left to read.
    pub(crate) fn is_removable(&self) -> bool {
        let inner = self.lock();
        inner.state == StreamState::Dead && inner.buffer.is_empty()
    }

    fn poll_read(&self, cx: &mut Context<'_>, buf: &mut [u8]) -> Poll<Result<usize>> {
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let mut inner = self.lock();
        let ready = !inner.buffer.is_empty()
            || inner.end_err.is_some()
            || inner.remote_done()
            || inner.read_deadline.exceeded;
        if !ready {
            inner.park(cx.waker());
            return Poll::Pending;
        }

        if inner.buffer.is_empty() {
            if let Some(err) = &inner.end_err {
                return Poll::Ready(Err(err.clone()));
            }
            if inner.remote_done() {
                return Poll::Ready(Ok(0));
            }
        }
        if inner.read_deadline.exceeded {
            return Poll::Ready(Err(MuxError::ReadTimeout));
        }

        let n = inner.buffer.read(buf);
        if let Err(e) = self.writer.send_frame(&Frame::ack(self.id, n as u32)) {
            tracing::debug!("stream {}: could not acknowledge {} bytes: {}", self.id, n, e);
        }
        Poll::Ready(Ok(n))
    }

    fn poll_write(&self, cx: &mut Context<'_>, buf: &[u8]) -> Poll<Result<usize>> {
        let mut inner = self.lock();
        let ready = buf.is_empty()
            || !inner.credit.is_exhausted()
            || inner.end_err.is_some()
            || inner.local_done()
            || inner.write_deadline.exceeded;
        if !ready {
            tracing::trace!("stream {}: write waiting for credit", self.id);
            inner.park(cx.waker());
            return Poll::Pending;
        }

        if let Some(err) = &inner.end_err {
            return Poll::Ready(Err(err.clone()));
        }
        if inner.local_done() {
            return Poll::Ready(Err(MuxError::BrokenPipe));
        }
        if inner.write_deadline.exceeded {
            return Poll::Ready(Err(MuxError::WriteTimeout));
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let n = inner.credit.take(buf.len());
        let frame = Frame::dat(self.id, Bytes::copy_from_slice(&buf[..n]));
        Poll::Ready(self.writer.send_frame(&frame).map(|()| n))
    }

    /// Half-close: tell the peer we will send no more.
    pub(crate) fn close(&self) -> Result<()> {
        let mut inner = self.lock();
        inner.state = match inner.state {
            StreamState::Closed | StreamState::Dead => return Ok(()),
            StreamState::RemoteClosed => StreamState::Dead,
            StreamState::Created | StreamState::Accepted => StreamState::Closed,
        };
        tracing::debug!("stream {}: closed locally, now {:?}", self.id, inner.state);
        inner.wake_all();
        self.writer.send_frame(&Frame::fin(self.id))
    }

    /// The handle was dropped: close and stop holding inbound data.
    fn detach(&self) {
        {
            let mut inner = self.lock();
            inner.detached = true;
            inner.buffer.clear();
            inner.read_deadline.cancel();
            inner.write_deadline.cancel();
        }
        let _ = self.close();
    }

    fn set_deadline(self: &Arc<Self>, direction: Direction, deadline: Option<Instant>) {
        let mut inner = self.lock();
        let slot = inner.deadline_mut(direction);
        slot.cancel();
        slot.exceeded = false;
        slot.generation = slot.generation.wrapping_add(1);

        if let Some(at) = deadline {
            let generation = slot.generation;
            let stream = Arc::downgrade(self);
            slot.timer = Some(tokio::spawn(async move {
                tokio::time::sleep_until(at).await;
                if let Some(stream) = stream.upgrade() {
                    stream.expire(direction, generation);
                }
            }));
        }
    }

    fn expire(&self, direction: Direction, generation: u64) {
        let mut inner = self.lock();
        let slot = inner.deadline_mut(direction);
        if slot.generation != generation {
            return;
        }
        slot.exceeded = true;
        slot.timer = None;
        tracing::trace!("stream {}: {:?} deadline exceeded", self.id, direction);
        inner.wake_all();
    }
}

/// A bidirectional byte stream multiplexed over a session.
///
/// Dropping the handle closes the stream.
pub struct Stream {
    shared: Arc<StreamShared>,
}

impl Stream {
    pub(crate) fn new(shared: Arc<StreamShared>) -> Self {
        Self { shared }
    }

    /// The stream ID, unique among the session's live streams.
    pub fn id(&self) -> u32 {
        self.shared.id
    }

    /// Read buffered data, waiting until some is available.
    ///
    /// Returns `Ok(0)` once the peer has closed and everything it sent
    /// has been read.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        poll_fn(|cx| self.shared.poll_read(cx, &mut *buf)).await
    }

    /// Write all of `buf`, waiting for credit as needed.
    ///
    /// On error, some prefix of `buf` may already have been sent.
    pub async fn write(&self, buf: &[u8]) -> Result<usize> {
        let mut written = 0;
        loop {
            let n = poll_fn(|cx| self.shared.poll_write(cx, &buf[written..])).await?;
            written += n;
            if written == buf.len() {
                return Ok(written);
            }
        }
    }

    /// Close the sending half. Reads keep working until the peer closes.
    pub fn close(&self) -> Result<()> {
        self.shared.close()
    }

    /// Fail pending and future reads with `ReadTimeout` once `deadline`
    /// passes. `None` clears the deadline.
    pub fn set_read_deadline(&self, deadline: Option<Instant>) {
        self.shared.set_deadline(Direction::Read, deadline);
    }

    /// Fail pending and future writes with `WriteTimeout` once `deadline`
    /// passes. `None` clears the deadline.
    pub fn set_write_deadline(&self, deadline: Option<Instant>) {
        self.shared.set_deadline(Direction::Write, deadline);
    }

    /// Set both read and write deadlines.
    pub fn set_deadline(&self, deadline: Option<Instant>) {
        self.set_read_deadline(deadline);
        self.set_write_deadline(deadline);
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.addrs.local
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.shared.addrs.remote
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.shared.lock();
        f.debug_struct("Stream")
            .field("id", &self.shared.id)
            .field("state", &inner.state)
            .field("buffered", &inner.buffer.len())
            .field("credit", &inner.credit.available())
            .finish()
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        self.shared.detach();
    }
}

impl AsyncRead for Stream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let n = match self.shared.poll_read(cx, buf.initialize_unfilled()) {
            Poll::Ready(Ok(n)) => n,
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e.into())),
            Poll::Pending => return Poll::Pending,
        };
        buf.advance(n);
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for Stream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        self.shared.poll_write(cx, buf).map_err(Into::into)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(self.shared.close().map_err(Into::into))
    }
}
