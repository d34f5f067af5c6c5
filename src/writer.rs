//! Bounded outbound queue and the dedicated sender task draining it.
//!
//! Every connection owns one [`WriteQueue`] and exactly one sender task.
//! Producers never block: a write either lands in the queue or, when the
//! queue is full, the connection is force-closed (backpressure-by-closure).
//!
//! # Architecture
//!
//! ```text
//! Handler 1 ─┐
//! Handler 2 ─┼─► WriteQueue (mpsc, try_send) ─► Sender Task ─► Socket
//! Handler N ─┘
//! ```
//!
//! The sender task is the only code that shuts the socket down. Whatever
//! mix of `close`, `destroy` and overflow races against it, the shutdown
//! runs once, after which [`WriteQueue::closed`] resolves.

use std::io::IoSlice;
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{NetError, Result};
use crate::logger::SharedLogger;

/// Default outbound queue capacity.
pub const DEFAULT_PENDING_WRITE_NUM: usize = 100;

/// Maximum frames to batch in a single write operation.
const MAX_BATCH_SIZE: usize = 64;

/// Why a connection stopped accepting writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// `close()`: queued writes were flushed first.
    Graceful,
    /// `destroy()`: queued writes were discarded.
    Forced,
    /// The outbound queue was full.
    Overflow,
    /// The socket rejected a write.
    WriteFailed,
}

struct QueueState<T> {
    tx: Option<mpsc::Sender<T>>,
    reason: Option<CloseReason>,
}

/// Bounded FIFO feeding one sender task.
pub struct WriteQueue<T> {
    state: Mutex<QueueState<T>>,
    /// Tells the sender task to stop without draining.
    kill: CancellationToken,
    /// Cancelled by the sender task once the socket is shut.
    done: CancellationToken,
}

impl<T> WriteQueue<T> {
    /// Create a queue holding at most `capacity` items (minimum 1).
    pub fn new(capacity: usize) -> (Arc<Self>, mpsc::Receiver<T>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let queue = Self {
            state: Mutex::new(QueueState {
                tx: Some(tx),
                reason: None,
            }),
            kill: CancellationToken::new(),
            done: CancellationToken::new(),
        };
        (Arc::new(queue), rx)
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Enqueue one item without waiting.
    ///
    /// # Errors
    ///
    /// - `ConnectionClosed` if the queue is already closed
    /// - `QueueFull` if the queue was at capacity; the queue is now closed
    ///   and the sender task told to stop
    pub fn push(&self, item: T) -> Result<()> {
        let mut state = self.lock();
        let Some(tx) = state.tx.as_ref() else {
            return Err(NetError::ConnectionClosed);
        };

        match tx.try_send(item) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                state.tx = None;
                state.reason.get_or_insert(CloseReason::Overflow);
                self.kill.cancel();
                Err(NetError::QueueFull)
            }
            Err(TrySendError::Closed(_)) => {
                state.tx = None;
                state.reason.get_or_insert(CloseReason::WriteFailed);
                Err(NetError::ConnectionClosed)
            }
        }
    }

    /// Stop accepting writes; the sender drains what is queued, then shuts
    /// the socket down. Returns `false` if the queue was already closed.
    pub fn close(&self) -> bool {
        let mut state = self.lock();
        if state.tx.take().is_none() {
            return false;
        }
        state.reason.get_or_insert(CloseReason::Graceful);
        true
    }

    /// Stop accepting writes and make the sender discard whatever is queued.
    ///
    /// Also cuts short a graceful close that is still draining.
    pub fn destroy(&self, reason: CloseReason) {
        {
            let mut state = self.lock();
            state.tx = None;
            state.reason.get_or_insert(reason);
        }
        self.kill.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().tx.is_none()
    }

    /// Reason of the first close transition, if any.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.lock().reason
    }

    /// Resolves once the sender task has shut the socket down.
    pub async fn closed(&self) {
        self.done.cancelled().await;
    }

    /// Whether the sender task has finished.
    pub fn is_done(&self) -> bool {
        self.done.is_cancelled()
    }

    pub(crate) fn kill_token(&self) -> CancellationToken {
        self.kill.clone()
    }

    pub(crate) fn done_token(&self) -> CancellationToken {
        self.done.clone()
    }

    pub(crate) fn mark_done(&self) {
        self.done.cancel();
    }
}

/// Spawn the sender task for a byte stream.
///
/// Returns the queue producers write into and the task handle.
pub fn spawn_writer_task<W>(
    writer: W,
    capacity: usize,
    logger: SharedLogger,
) -> (Arc<WriteQueue<Bytes>>, JoinHandle<()>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (queue, rx) = WriteQueue::new(capacity);
    let task = tokio::spawn(writer_loop(rx, writer, queue.clone(), logger));
    (queue, task)
}

/// Receives frames and writes them out in batches until the queue closes
/// or the connection is destroyed, then shuts the writer down once.
async fn writer_loop<W>(
    mut rx: mpsc::Receiver<Bytes>,
    mut writer: W,
    queue: Arc<WriteQueue<Bytes>>,
    logger: SharedLogger,
) where
    W: AsyncWrite + Unpin,
{
    let kill = queue.kill_token();

    loop {
        let first = tokio::select! {
            biased;
            _ = kill.cancelled() => break,
            frame = rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);
        batch.push(first);
        while batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(frame) => batch.push(frame),
                Err(_) => break,
            }
        }

        let result = tokio::select! {
            biased;
            _ = kill.cancelled() => break,
            result = write_batch(&mut writer, &batch) => result,
        };

        if let Err(e) = result {
            logger.error(format_args!("write error: {}", e));
            queue.destroy(CloseReason::WriteFailed);
            break;
        }
    }

    drop(rx);
    if let Err(e) = writer.shutdown().await {
        logger.debug(format_args!("shutdown error: {}", e));
    }
    drop(writer);
    queue.mark_done();
}

/// Write a batch of frames using scatter/gather I/O (write_vectored).
async fn write_batch<W>(writer: &mut W, batch: &[Bytes]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let total_size: usize = batch.iter().map(Bytes::len).sum();
    if total_size == 0 {
        return Ok(());
    }

    let mut total_written = 0;
    while total_written < total_size {
        let slices = build_remaining_slices(batch, total_written);
        let written = writer.write_vectored(&slices).await?;
        if written == 0 {
            return Err(NetError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            )));
        }
        total_written += written;
    }

    writer.flush().await?;
    Ok(())
}

/// Build IoSlice array for remaining data after a partial write.
fn build_remaining_slices(batch: &[Bytes], skip_bytes: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len());
    let mut offset = 0;

    for frame in batch {
        let end = offset + frame.len();
        if skip_bytes < end && !frame.is_empty() {
            let start_in_frame = skip_bytes.saturating_sub(offset);
            slices.push(IoSlice::new(&frame[start_in_frame..]));
        }
        offset = end;
    }

    slices
}
