//! Frame buffer for accumulating partial reads.
//!
//! Uses `bytes::BytesMut` so extracted frames are zero-copy slices of the
//! read buffer. A small state machine handles fragmented input:
//! - `WaitingForHeader`: need a whole length prefix
//! - `WaitingForBody`: prefix parsed, need N more bytes
//!
//! The same buffer also splits newline-terminated text for the console.
//!
//! # Example
//!
//! ```
//! use leafnet::protocol::{FrameBuffer, MsgParser};
//!
//! let parser = MsgParser::default();
//! let mut buffer = FrameBuffer::new();
//!
//! // Data arrives in chunks from the socket
//! let frames = buffer.push(&[0, 3, b'a'], &parser).unwrap();
//! assert!(frames.is_empty());
//! let frames = buffer.push(&[b'b', b'c'], &parser).unwrap();
//! assert_eq!(&frames[0][..], b"abc");
//! ```

use bytes::{Bytes, BytesMut};

use super::wire_format::MsgParser;
use crate::error::{NetError, Result};

/// Initial read buffer capacity.
const INITIAL_CAPACITY: usize = 4 * 1024;

/// State machine for frame parsing.
#[derive(Debug, Clone, Copy)]
enum State {
    WaitingForHeader,
    WaitingForBody { remaining: usize },
}

/// Buffer for accumulating incoming bytes and extracting complete frames.
#[derive(Debug)]
pub struct FrameBuffer {
    buffer: BytesMut,
    state: State,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::with_capacity(INITIAL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(capacity),
            state: State::WaitingForHeader,
        }
    }

    /// Push data and extract every complete frame.
    ///
    /// Partial data stays buffered for the next push.
    ///
    /// # Errors
    ///
    /// Returns `Protocol` if a length prefix is outside the parser's bounds.
    /// The buffer should be discarded after an error.
    pub fn push(&mut self, data: &[u8], parser: &MsgParser) -> Result<Vec<Bytes>> {
        self.buffer.extend_from_slice(data);

        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame(parser)? {
            frames.push(frame);
        }
        Ok(frames)
    }

    /// Try to extract one frame (without its length prefix).
    ///
    /// Returns:
    /// - `Ok(Some(frame))` if a complete frame was extracted
    /// - `Ok(None)` if more data is needed
    /// - `Err(...)` on a length outside the parser's bounds
    pub fn next_frame(&mut self, parser: &MsgParser) -> Result<Option<Bytes>> {
        loop {
            match self.state {
                State::WaitingForHeader => {
                    let header_len = parser.header_len();
                    if self.buffer.len() < header_len {
                        return Ok(None);
                    }

                    let remaining = parser.decode_header(&self.buffer[..header_len])?;
                    let _ = self.buffer.split_to(header_len);
                    self.state = State::WaitingForBody { remaining };
                }
                State::WaitingForBody { remaining } => {
                    if self.buffer.len() < remaining {
                        return Ok(None);
                    }

                    let frame = self.buffer.split_to(remaining).freeze();
                    self.state = State::WaitingForHeader;
                    return Ok(Some(frame));
                }
            }
        }
    }

    /// Try to extract one `\n`-terminated line of at most `max_len` bytes
    /// (terminator excluded).
    ///
    /// The terminator and a preceding `\r` are stripped. A longer line, or
    /// more than `max_len` buffered bytes with no terminator yet, is a
    /// `Protocol` error.
    pub fn next_line(&mut self, max_len: usize) -> Result<Option<Bytes>> {
        let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') else {
            // One byte of slack for a `\r` whose `\n` is still in flight.
            if self.buffer.len() > max_len.saturating_add(1) {
                return Err(NetError::Protocol(format!(
                    "line longer than {} bytes",
                    max_len
                )));
            }
            return Ok(None);
        };

        let mut line = self.buffer.split_to(pos + 1);
        line.truncate(pos);
        if line.last() == Some(&b'\r') {
            line.truncate(pos - 1);
        }
        if line.len() > max_len {
            return Err(NetError::Protocol(format!(
                "line longer than {} bytes",
                max_len
            )));
        }
        Ok(Some(line.freeze()))
    }

    /// Append data without extracting anything.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Clear the buffer and reset state.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.state = State::WaitingForHeader;
    }

    #[cfg(test)]
    fn state_name(&self) -> &'static str {
        match self.state {
            State::WaitingForHeader => "WaitingForHeader",
            State::WaitingForBody { .. } => "WaitingForBody",
        }
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ByteOrder, LenWidth};

    fn frame_bytes(parser: &MsgParser, body: &[u8]) -> Vec<u8> {
        parser.encode_frame(&[body]).unwrap().to_vec()
    }

    #[test]
    fn test_single_complete_frame() {
        let parser = MsgParser::default();
        let mut buffer = FrameBuffer::new();

        let frames = buffer.push(&frame_bytes(&parser, b"hello"), &parser).unwrap();

        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..], b"hello");
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_multiple_frames_in_one_push() {
        let parser = MsgParser::default();
        let mut buffer = FrameBuffer::new();

        let mut combined = frame_bytes(&parser, b"first");
        combined.extend(frame_bytes(&parser, b"second"));
        combined.extend(frame_bytes(&parser, b"third"));

        let frames = buffer.push(&combined, &parser).unwrap();

        assert_eq!(frames.len(), 3);
        assert_eq!(&frames[0][..], b"first");
        assert_eq!(&frames[1][..], b"second");
        assert_eq!(&frames[2][..], b"third");
    }

    #[test]
    fn test_fragmented_header() {
        let parser = MsgParser::new(LenWidth::Four, 1, 4096, ByteOrder::BigEndian);
        let mut buffer = FrameBuffer::new();
        let bytes = frame_bytes(&parser, b"data");

        assert!(buffer.push(&bytes[..2], &parser).unwrap().is_empty());
        assert_eq!(buffer.state_name(), "WaitingForHeader");

        let frames = buffer.push(&bytes[2..], &parser).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..], b"data");
    }

    #[test]
    fn test_fragmented_body() {
        let parser = MsgParser::default();
        let mut buffer = FrameBuffer::new();
        let bytes = frame_bytes(&parser, b"0123456789");

        assert!(buffer.push(&bytes[..5], &parser).unwrap().is_empty());
        assert_eq!(buffer.state_name(), "WaitingForBody");
        assert_eq!(buffer.len(), 3);

        let frames = buffer.push(&bytes[5..], &parser).unwrap();
        assert_eq!(&frames[0][..], b"0123456789");
        assert_eq!(buffer.state_name(), "WaitingForHeader");
    }

    #[test]
    fn test_byte_by_byte() {
        let parser = MsgParser::new(LenWidth::Two, 1, 4096, ByteOrder::LittleEndian);
        let mut buffer = FrameBuffer::new();
        let bytes = frame_bytes(&parser, b"xyz");

        let mut frames = Vec::new();
        for byte in &bytes {
            frames.extend(buffer.push(&[*byte], &parser).unwrap());
        }

        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..], b"xyz");
    }

    #[test]
    fn test_oversized_length_rejected() {
        let parser = MsgParser::new(LenWidth::Two, 1, 16, ByteOrder::BigEndian);
        let mut buffer = FrameBuffer::new();

        let result = buffer.push(&[0x00, 0x20, 1, 2, 3], &parser);
        assert!(matches!(result, Err(NetError::Protocol(_))));
    }

    #[test]
    fn test_zero_length_rejected() {
        let parser = MsgParser::default();
        let mut buffer = FrameBuffer::new();

        assert!(buffer.push(&[0, 0], &parser).is_err());
    }

    #[test]
    fn test_next_line() {
        let mut buffer = FrameBuffer::new();
        buffer.extend(b"help\r\ncpuprof start\nparti");

        assert_eq!(&buffer.next_line(64).unwrap().unwrap()[..], b"help");
        assert_eq!(&buffer.next_line(64).unwrap().unwrap()[..], b"cpuprof start");
        assert!(buffer.next_line(64).unwrap().is_none());

        buffer.extend(b"al\n");
        assert_eq!(&buffer.next_line(64).unwrap().unwrap()[..], b"partial");
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_next_line_empty() {
        let mut buffer = FrameBuffer::new();
        buffer.extend(b"\n\r\n");

        assert!(buffer.next_line(8).unwrap().unwrap().is_empty());
        assert!(buffer.next_line(8).unwrap().unwrap().is_empty());
    }

    #[test]
    fn test_next_line_length_cap() {
        let mut buffer = FrameBuffer::new();
        buffer.extend(b"12345678");
        buffer.extend(b"\r");
        assert!(buffer.next_line(8).unwrap().is_none());

        // Unterminated input past the cap fails without waiting for `\n`.
        buffer.extend(b"9");
        assert!(matches!(buffer.next_line(8), Err(NetError::Protocol(_))));

        let mut buffer = FrameBuffer::new();
        buffer.extend(b"123456789\r\n");
        assert!(matches!(buffer.next_line(8), Err(NetError::Protocol(_))));

        let mut buffer = FrameBuffer::new();
        buffer.extend(b"12345678\r\n");
        assert_eq!(&buffer.next_line(8).unwrap().unwrap()[..], b"12345678");
    }
}
