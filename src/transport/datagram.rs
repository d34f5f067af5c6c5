//! Datagram connection: one UDP socket shared by every peer.
//!
//! Each read yields one datagram and the address it came from. Each write
//! carries its destination, or `None` on a connected socket. There is no
//! reassembly: a datagram larger than the read size is truncated.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use crate::error::{NetError, Result};
use crate::logger::SharedLogger;
use crate::protocol::DEFAULT_MAX_DATAGRAM_SIZE;
use crate::writer::{CloseReason, WriteQueue};

/// One queued outbound datagram.
#[derive(Debug, Clone)]
pub struct Datagram {
    pub data: Bytes,
    /// Destination; `None` sends to the connected peer.
    pub peer: Option<SocketAddr>,
}

/// The socket until the sender task releases it. Readers hold a clone only
/// while a receive is pending.
type SocketSlot = Arc<Mutex<Option<Arc<UdpSocket>>>>;

/// A UDP socket with a bounded outbound queue and one sender task.
pub struct DatagramConn {
    socket: SocketSlot,
    queue: Arc<WriteQueue<Datagram>>,
    local_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,
    max_datagram_size: usize,
    logger: SharedLogger,
}

impl DatagramConn {
    /// Wrap a bound (and optionally connected) socket. Must be called inside
    /// a tokio runtime.
    ///
    /// A `max_datagram_size` of 0 falls back to 1024.
    pub fn new(
        socket: UdpSocket,
        pending_write_num: usize,
        max_datagram_size: usize,
        logger: SharedLogger,
    ) -> Arc<Self> {
        let local_addr = socket.local_addr().ok();
        let peer_addr = socket.peer_addr().ok();
        let socket = Arc::new(socket);
        let slot: SocketSlot = Arc::new(Mutex::new(Some(socket.clone())));

        let (queue, rx) = WriteQueue::new(pending_write_num);
        tokio::spawn(sender_loop(
            rx,
            socket,
            slot.clone(),
            queue.clone(),
            logger.clone(),
        ));

        let max_datagram_size = if max_datagram_size == 0 {
            DEFAULT_MAX_DATAGRAM_SIZE
        } else {
            max_datagram_size
        };

        Arc::new(Self {
            socket: slot,
            queue,
            local_addr,
            peer_addr,
            max_datagram_size,
            logger,
        })
    }

    /// Concatenate `segments` into one datagram and enqueue it.
    pub fn write_msg(&self, peer: Option<SocketAddr>, segments: &[&[u8]]) -> Result<()> {
        let len = segments.iter().map(|s| s.len()).sum();
        let mut data = Vec::with_capacity(len);
        for segment in segments {
            data.extend_from_slice(segment);
        }
        self.write(peer, Bytes::from(data))
    }

    /// Enqueue one datagram as-is.
    pub fn write(&self, peer: Option<SocketAddr>, data: Bytes) -> Result<()> {
        let result = self.queue.push(Datagram { data, peer });
        if let Err(NetError::QueueFull) = result {
            self.logger
                .warn(format_args!("close udp conn: write queue full"));
        }
        result
    }

    /// Wait for one datagram.
    ///
    /// Returns `ConnectionClosed` once the connection has shut down.
    pub async fn read_msg(&self) -> Result<(Bytes, SocketAddr)> {
        let done = self.queue.done_token();
        let socket = self
            .socket
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let Some(socket) = socket else {
            return Err(NetError::ConnectionClosed);
        };
        let mut buf = vec![0u8; self.max_datagram_size];

        let (n, peer) = tokio::select! {
            biased;
            _ = done.cancelled() => return Err(NetError::ConnectionClosed),
            received = socket.recv_from(&mut buf) => received?,
        };

        buf.truncate(n);
        Ok((Bytes::from(buf), peer))
    }

    pub fn close(&self) {
        self.queue.close();
    }

    pub fn destroy(&self) {
        self.queue.destroy(CloseReason::Forced);
    }

    pub fn is_closed(&self) -> bool {
        self.queue.is_closed()
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.queue.close_reason()
    }

    /// Resolves once the sender task has stopped and released the socket.
    pub async fn closed(&self) {
        self.queue.closed().await;
    }

    /// Address the socket was bound to.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// The connected peer, if the socket is connected.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn max_datagram_size(&self) -> usize {
        self.max_datagram_size
    }
}

impl Drop for DatagramConn {
    fn drop(&mut self) {
        self.queue.close();
    }
}

/// Send errors are logged and the loop keeps going: one unreachable peer
/// must not stop delivery to the others.
async fn sender_loop(
    mut rx: mpsc::Receiver<Datagram>,
    socket: Arc<UdpSocket>,
    slot: SocketSlot,
    queue: Arc<WriteQueue<Datagram>>,
    logger: SharedLogger,
) {
    let kill = queue.kill_token();

    loop {
        let datagram = tokio::select! {
            biased;
            _ = kill.cancelled() => break,
            datagram = rx.recv() => match datagram {
                Some(datagram) => datagram,
                None => break,
            },
        };

        let sent = match datagram.peer {
            Some(peer) => socket.send_to(&datagram.data, peer).await,
            None => socket.send(&datagram.data).await,
        };
        if let Err(e) = sent {
            logger.error(format_args!(
                "udp send to {} failed: {}",
                super::display_addr(datagram.peer),
                e
            ));
        }
    }

    drop(rx);
    slot.lock().unwrap_or_else(|e| e.into_inner()).take();
    drop(socket);
    // A pending reader drops its clone as soon as it sees this.
    queue.mark_done();
}
