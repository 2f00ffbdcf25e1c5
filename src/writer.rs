//! Dedicated writer task for the physical connection.
//!
//! Many producers share one connection: DAT frames from every stream, ACK
//! and FIN control frames, keep-alive pings and pongs. The connection must
//! never see two messages interleaved, so all of them are queued to a
//! single task that owns the write half.
//!
//! ```text
//! Stream 1 ─┐
//! Stream 2 ─┼─► mpsc::UnboundedSender<Command> ─► Writer Task ─► Connection
//! Keepalive ┘
//! ```
//!
//! Queueing never blocks, so a stream can take credit and queue its DAT
//! frame inside one critical section of its own lock. The queue is
//! unbounded, but DAT frames are bounded by the credit windows and control
//! frames are a few bytes each.

use std::io::IoSlice;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::error::{MuxError, Result};
use crate::protocol::{Frame, Message, HEADER_SIZE};

/// Maximum messages to batch in a single write operation.
const MAX_BATCH_SIZE: usize = 64;

/// A message ready to be written to the connection.
#[derive(Debug)]
pub struct OutboundMessage {
    /// Pre-encoded message header (5 bytes).
    pub header: [u8; HEADER_SIZE],
    /// Payload bytes (empty for Close).
    pub payload: Bytes,
}

impl OutboundMessage {
    pub fn new(message: &Message) -> Self {
        Self {
            header: message.header().encode(),
            payload: message.payload(),
        }
    }

    /// Wrap a mux frame in a binary message.
    pub fn frame(frame: &Frame) -> Self {
        Self::new(&Message::Binary(frame.encode()))
    }

    /// Total size of this message (header + payload).
    #[inline]
    pub fn size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }
}

#[derive(Debug)]
enum Command {
    Send(OutboundMessage),
    /// Flush what is queued, optionally say goodbye, then close the write half.
    Shutdown { send_close: bool },
}

/// Handle for queueing messages to the writer task.
///
/// Cheaply cloneable; every stream of a session holds one.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::UnboundedSender<Command>,
    pending: Arc<AtomicUsize>,
    closed: Arc<AtomicBool>,
}

/// Receiving side of the writer queue, consumed by [`run`].
pub struct WriterQueue {
    rx: mpsc::UnboundedReceiver<Command>,
    pending: Arc<AtomicUsize>,
}

/// Create a connected handle/queue pair.
pub fn channel() -> (WriterHandle, WriterQueue) {
    let (tx, rx) = mpsc::unbounded_channel();
    let pending = Arc::new(AtomicUsize::new(0));
    (
        WriterHandle {
            tx,
            pending: pending.clone(),
            closed: Arc::new(AtomicBool::new(false)),
        },
        WriterQueue { rx, pending },
    )
}

impl WriterHandle {
    /// Queue a message.
    ///
    /// Fails with `SessionClosed` once shutdown has been requested or the
    /// writer task is gone.
    pub fn send(&self, message: &Message) -> Result<()> {
        self.enqueue(OutboundMessage::new(message))
    }

    /// Queue a mux frame.
    pub fn send_frame(&self, frame: &Frame) -> Result<()> {
        tracing::trace!(
            "queue {:?} frame for stream {} ({} bytes)",
            frame.kind(),
            frame.stream_id(),
            frame.payload().len()
        );
        self.enqueue(OutboundMessage::frame(frame))
    }

    fn enqueue(&self, message: OutboundMessage) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(MuxError::SessionClosed);
        }

        self.pending.fetch_add(1, Ordering::AcqRel);
        self.tx.send(Command::Send(message)).map_err(|_| {
            self.pending.fetch_sub(1, Ordering::Release);
            MuxError::SessionClosed
        })
    }

    /// Stop accepting messages and tell the writer task to finish.
    ///
    /// Messages queued before this call are still written. With
    /// `send_close`, a Close message follows them.
    pub fn shutdown(&self, send_close: bool) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        self.tx
            .send(Command::Shutdown { send_close })
            .map_err(|_| MuxError::SessionClosed)
    }

    /// Messages queued but not yet written.
    #[inline]
    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }
}

#[cfg(test)]
impl WriterQueue {
    /// Pop the next queued mux frame without a writer task (for tests).
    pub(crate) fn try_recv_frame(&mut self) -> Option<Frame> {
        use crate::protocol::opcode;

        loop {
            match self.rx.try_recv().ok()? {
                Command::Send(msg) if msg.header[0] == opcode::BINARY => {
                    self.pending.fetch_sub(1, Ordering::Release);
                    return Frame::decode(msg.payload).ok();
                }
                Command::Send(_) => {
                    self.pending.fetch_sub(1, Ordering::Release);
                }
                Command::Shutdown { .. } => return None,
            }
        }
    }
}

/// Writer loop: receives queued messages and writes them to the connection.
///
/// Returns `Ok(())` after a requested shutdown or when every handle is
/// dropped, and the I/O error if the connection fails.
pub async fn run<W>(mut queue: WriterQueue, mut writer: W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut batch = Vec::with_capacity(MAX_BATCH_SIZE + 1);

    loop {
        let mut shutdown = match queue.rx.recv().await {
            Some(Command::Send(message)) => {
                batch.push(message);
                None
            }
            Some(Command::Shutdown { send_close }) => Some(send_close),
            None => {
                let _ = writer.shutdown().await;
                return Ok(());
            }
        };

        // Collect additional ready messages (non-blocking)
        while shutdown.is_none() && batch.len() < MAX_BATCH_SIZE {
            match queue.rx.try_recv() {
                Ok(Command::Send(message)) => batch.push(message),
                Ok(Command::Shutdown { send_close }) => shutdown = Some(send_close),
                Err(_) => break,
            }
        }

        let queued = batch.len();
        if shutdown == Some(true) {
            batch.push(OutboundMessage::new(&Message::Close));
        }

        write_batch(&mut writer, &batch).await?;
        queue.pending.fetch_sub(queued, Ordering::Release);
        batch.clear();

        if shutdown.is_some() {
            let _ = writer.shutdown().await;
            return Ok(());
        }
    }
}

/// Write a batch of messages using scatter/gather I/O (write_vectored).
async fn write_batch<W>(writer: &mut W, batch: &[OutboundMessage]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if batch.is_empty() {
        return Ok(());
    }

    let total_size: usize = batch.iter().map(|m| m.size()).sum();
    let mut total_written = 0;

    while total_written < total_size {
        let slices = build_remaining_slices(batch, total_written);
        let written = writer.write_vectored(&slices).await?;
        if written == 0 {
            return Err(MuxError::from(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            )));
        }
        total_written += written;
    }

    writer.flush().await?;
    Ok(())
}

/// Build IoSlice array for the data after the first `skip_bytes` bytes.
fn build_remaining_slices(batch: &[OutboundMessage], skip_bytes: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len() * 2);
    let mut offset = 0;

    for message in batch {
        for part in [&message.header[..], &message.payload[..]] {
            let end = offset + part.len();
            if !part.is_empty() && skip_bytes < end {
                let start = skip_bytes.saturating_sub(offset);
                slices.push(IoSlice::new(&part[start..]));
            }
            offset = end;
        }
    }

    slices
}
