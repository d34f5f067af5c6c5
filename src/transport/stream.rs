//! Stream connection: one byte stream, one bounded outbound queue, one
//! sender task.
//!
//! Frames travel length-prefixed (see [`MsgParser`]). The connection can be
//! built over a `TcpStream` or over any `AsyncRead + AsyncWrite` (in-memory
//! duplex streams in tests).
//!
//! # Example
//!
//! ```no_run
//! use leafnet::logger::default_logger;
//! use leafnet::transport::{StreamConfig, StreamConn};
//! use tokio::net::TcpStream;
//!
//! # async fn demo() -> leafnet::error::Result<()> {
//! let stream = TcpStream::connect("127.0.0.1:3563").await?;
//! let conn = StreamConn::from_tcp(stream, &StreamConfig::default(), default_logger());
//!
//! conn.write_msg(&[&[0, 1], b"body"])?;
//! let frame = conn.read_msg().await?;
//! conn.close();
//! # Ok(())
//! # }
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::error::{NetError, Result};
use crate::logger::SharedLogger;
use crate::protocol::{
    ByteOrder, FrameBuffer, LenWidth, MsgParser, DEFAULT_MAX_MSG_LEN, DEFAULT_MIN_MSG_LEN,
};
use crate::writer::{spawn_writer_task, CloseReason, WriteQueue, DEFAULT_PENDING_WRITE_NUM};

/// Socket read chunk size.
const READ_CHUNK_SIZE: usize = 4096;

/// Queue and framing settings shared by stream servers and clients.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Outbound queue capacity.
    pub pending_write_num: usize,
    /// Width of the length prefix (1, 2 or 4).
    pub len_msg_len: LenWidth,
    pub min_msg_len: u32,
    pub max_msg_len: u32,
    /// Byte order of length prefixes.
    pub little_endian: bool,
}

impl StreamConfig {
    /// Length-prefix parser for these settings.
    pub fn parser(&self) -> MsgParser {
        MsgParser::new(
            self.len_msg_len,
            self.min_msg_len,
            self.max_msg_len,
            ByteOrder::from_little_endian(self.little_endian),
        )
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            pending_write_num: DEFAULT_PENDING_WRITE_NUM,
            len_msg_len: LenWidth::Two,
            min_msg_len: DEFAULT_MIN_MSG_LEN,
            max_msg_len: DEFAULT_MAX_MSG_LEN,
            little_endian: false,
        }
    }
}

struct ReadState {
    /// Released once the sender task has shut the socket down.
    io: Option<Box<dyn AsyncRead + Send + Unpin>>,
    buffer: FrameBuffer,
    chunk: Vec<u8>,
}

/// A framed byte-stream connection.
pub struct StreamConn {
    queue: Arc<WriteQueue<Bytes>>,
    reader: Mutex<ReadState>,
    parser: MsgParser,
    local_addr: Option<SocketAddr>,
    remote_addr: Option<SocketAddr>,
    logger: SharedLogger,
}

impl StreamConn {
    /// Wrap any byte stream. Must be called inside a tokio runtime.
    pub fn new<S>(stream: S, config: &StreamConfig, logger: SharedLogger) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        Self::from_parts(Box::new(read_half), write_half, config, logger, None, None)
    }

    /// Wrap an accepted or dialed TCP stream.
    pub fn from_tcp(stream: TcpStream, config: &StreamConfig, logger: SharedLogger) -> Arc<Self> {
        let local_addr = stream.local_addr().ok();
        let remote_addr = stream.peer_addr().ok();
        let (read_half, write_half) = stream.into_split();
        Self::from_parts(
            Box::new(read_half),
            write_half,
            config,
            logger,
            local_addr,
            remote_addr,
        )
    }

    fn from_parts<W>(
        reader: Box<dyn AsyncRead + Send + Unpin>,
        writer: W,
        config: &StreamConfig,
        logger: SharedLogger,
        local_addr: Option<SocketAddr>,
        remote_addr: Option<SocketAddr>,
    ) -> Arc<Self>
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (queue, _task) = spawn_writer_task(writer, config.pending_write_num, logger.clone());
        Arc::new(Self {
            queue,
            reader: Mutex::new(ReadState {
                io: Some(reader),
                buffer: FrameBuffer::new(),
                chunk: vec![0u8; READ_CHUNK_SIZE],
            }),
            parser: config.parser(),
            local_addr,
            remote_addr,
            logger,
        })
    }

    fn enqueue(&self, data: Bytes) -> Result<()> {
        let result = self.queue.push(data);
        if let Err(NetError::QueueFull) = result {
            self.logger.warn(format_args!(
                "close conn {}: write queue full",
                display_addr(self.remote_addr)
            ));
        }
        result
    }

    /// Enqueue raw bytes with no length prefix.
    pub fn write(&self, data: impl Into<Bytes>) -> Result<()> {
        self.enqueue(data.into())
    }

    /// Concatenate `segments` into one length-prefixed frame and enqueue it.
    ///
    /// A frame outside the configured length bounds is rejected and nothing
    /// is enqueued.
    pub fn write_msg(&self, segments: &[&[u8]]) -> Result<()> {
        let frame = self.parser.encode_frame(segments)?;
        self.enqueue(frame)
    }

    /// Read one frame (without its length prefix).
    ///
    /// # Errors
    ///
    /// - `ConnectionClosed` on EOF or once the connection has shut down
    /// - `Protocol` if the peer sent a length outside the configured bounds
    /// - `Io` on socket errors
    pub async fn read_msg(&self) -> Result<Bytes> {
        let parser = self.parser;
        self.read_with(|buffer| buffer.next_frame(&parser)).await
    }

    /// Read one `\n`-terminated line, terminator stripped.
    ///
    /// Lines longer than the configured `max_msg_len` are a `Protocol`
    /// error.
    pub async fn read_line(&self) -> Result<Bytes> {
        let max_len = self.parser.max_msg_len() as usize;
        self.read_with(|buffer| buffer.next_line(max_len)).await
    }

    async fn read_with<F>(&self, mut extract: F) -> Result<Bytes>
    where
        F: FnMut(&mut FrameBuffer) -> Result<Option<Bytes>>,
    {
        let done = self.queue.done_token();
        let mut state = self.reader.lock().await;
        let ReadState { io, buffer, chunk } = &mut *state;

        loop {
            if let Some(item) = extract(&mut *buffer)? {
                return Ok(item);
            }

            let Some(reader) = io.as_mut() else {
                return Err(NetError::ConnectionClosed);
            };
            let read = tokio::select! {
                biased;
                _ = done.cancelled() => None,
                n = reader.read(&mut chunk[..]) => Some(n?),
            };
            let Some(n) = read else {
                *io = None;
                return Err(NetError::ConnectionClosed);
            };
            if n == 0 {
                return Err(NetError::ConnectionClosed);
            }
            buffer.extend(&chunk[..n]);
        }
    }

    /// Stop accepting writes; queued frames are flushed before the socket
    /// is shut down. Idempotent.
    pub fn close(&self) {
        self.queue.close();
    }

    /// Close immediately, discarding queued frames. Idempotent.
    pub fn destroy(&self) {
        self.queue.destroy(CloseReason::Forced);
    }

    pub fn is_closed(&self) -> bool {
        self.queue.is_closed()
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.queue.close_reason()
    }

    /// Resolves once the sender task has shut the socket down and the read
    /// half is released. The socket is fully closed afterwards, even while
    /// handles to this connection are still alive.
    pub async fn closed(&self) {
        self.queue.closed().await;
        self.reader.lock().await.io = None;
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub fn parser(&self) -> &MsgParser {
        &self.parser
    }
}

impl Drop for StreamConn {
    fn drop(&mut self) {
        // The sender task holds the queue too; closing lets it finish.
        self.queue.close();
    }
}

pub(crate) fn display_addr(addr: Option<SocketAddr>) -> String {
    addr.map(|a| a.to_string()).unwrap_or_else(|| "-".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::NoopLogger;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    fn config() -> StreamConfig {
        StreamConfig::default()
    }

    fn conn_pair() -> (Arc<StreamConn>, Arc<StreamConn>) {
        let (a, b) = duplex(4096);
        (
            StreamConn::new(a, &config(), Arc::new(NoopLogger)),
            StreamConn::new(b, &config(), Arc::new(NoopLogger)),
        )
    }

    #[test]
    fn test_stream_config_defaults() {
        let config = StreamConfig::default();
        assert_eq!(config.pending_write_num, 100);
        assert_eq!(config.len_msg_len, LenWidth::Two);
        assert_eq!(config.parser(), MsgParser::default());
    }

    #[test]
    fn test_stream_config_little_endian_parser() {
        let config: StreamConfig =
            serde_json::from_str(r#"{ "len_msg_len": 4, "little_endian": true }"#).unwrap();
        let parser = config.parser();
        assert_eq!(parser.header_len(), 4);
        assert_eq!(parser.byte_order(), ByteOrder::LittleEndian);
    }

    #[tokio::test]
    async fn test_frames_in_order() {
        let (left, right) = conn_pair();

        left.write_msg(&[&[0, 1], b"first"]).unwrap();
        left.write_msg(&[&[0, 2], b"second"]).unwrap();

        assert_eq!(&right.read_msg().await.unwrap()[..], b"\x00\x01first");
        assert_eq!(&right.read_msg().await.unwrap()[..], b"\x00\x02second");
    }

    #[tokio::test]
    async fn test_frame_split_across_reads() {
        let (mut raw, peer) = duplex(4096);
        let conn = StreamConn::new(peer, &config(), Arc::new(NoopLogger));

        let reader = tokio::spawn({
            let conn = conn.clone();
            async move { conn.read_msg().await }
        });

        raw.write_all(&[0, 4, b'a']).await.unwrap();
        tokio::task::yield_now().await;
        raw.write_all(b"bcd").await.unwrap();

        assert_eq!(&reader.await.unwrap().unwrap()[..], b"abcd");
    }

    #[tokio::test]
    async fn test_oversized_write_rejected() {
        let (a, _b) = duplex(4096);
        let config = StreamConfig {
            max_msg_len: 4,
            ..StreamConfig::default()
        };
        let conn = StreamConn::new(a, &config, Arc::new(NoopLogger));

        let result = conn.write_msg(&[b"too long"]);
        assert!(matches!(result, Err(NetError::Protocol(_))));
        assert!(!conn.is_closed());
    }

    #[tokio::test]
    async fn test_oversized_read_rejected() {
        let (mut raw, peer) = duplex(4096);
        let conn = StreamConn::new(peer, &config(), Arc::new(NoopLogger));

        raw.write_all(&[0xFF, 0xFF, 0]).await.unwrap();
        assert!(matches!(conn.read_msg().await, Err(NetError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_peer_eof_is_connection_closed() {
        let (raw, peer) = duplex(4096);
        let conn = StreamConn::new(peer, &config(), Arc::new(NoopLogger));

        drop(raw);
        assert!(matches!(conn.read_msg().await, Err(NetError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_close_wakes_pending_reader() {
        let (_raw, peer) = duplex(4096);
        let conn = StreamConn::new(peer, &config(), Arc::new(NoopLogger));

        let reader = tokio::spawn({
            let conn = conn.clone();
            async move { conn.read_msg().await }
        });
        tokio::task::yield_now().await;

        conn.close();
        conn.closed().await;

        assert!(matches!(reader.await.unwrap(), Err(NetError::ConnectionClosed)));
        assert_eq!(conn.close_reason(), Some(CloseReason::Graceful));
        assert!(matches!(conn.write(&b"x"[..]), Err(NetError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_closed_releases_stream_while_handles_live() {
        let (mut raw, peer) = duplex(64);
        let conn = StreamConn::new(peer, &config(), Arc::new(NoopLogger));
        let handle = conn.clone();

        conn.close();
        conn.closed().await;

        // Both halves are gone although `handle` still holds the conn, so
        // the peer sees a fully closed stream.
        let mut buf = [0u8; 1];
        assert_eq!(raw.read(&mut buf).await.unwrap(), 0);
        let result = raw.write_all(b"late").await;
        assert_eq!(result.unwrap_err().kind(), std::io::ErrorKind::BrokenPipe);

        assert!(matches!(handle.read_msg().await, Err(NetError::ConnectionClosed)));
        assert!(handle.is_closed());
    }

    #[tokio::test]
    async fn test_close_flushes_before_shutdown() {
        let (left, right) = conn_pair();

        left.write_msg(&[b"bye"]).unwrap();
        left.close();

        assert_eq!(&right.read_msg().await.unwrap()[..], b"bye");
        assert!(matches!(right.read_msg().await, Err(NetError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_read_line_and_raw_write() {
        let (left, right) = conn_pair();

        left.write(Bytes::from_static(b"help\r\nquit\n")).unwrap();

        assert_eq!(&right.read_line().await.unwrap()[..], b"help");
        assert_eq!(&right.read_line().await.unwrap()[..], b"quit");
    }

    #[tokio::test]
    async fn test_duplex_has_no_addrs() {
        let (left, _right) = conn_pair();
        assert!(left.local_addr().is_none());
        assert!(left.remote_addr().is_none());
        assert_eq!(display_addr(left.remote_addr()), "-");
    }
}
