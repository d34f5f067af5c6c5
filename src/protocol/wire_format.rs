//! Wire format encoding and decoding.
//!
//! Every frame starts with a 16-bit message identifier. On stream transports
//! the frame is additionally preceded by a length prefix:
//! ```text
//! ┌──────────────┬────────────┬──────────────────┐
//! │ Length       │ Message ID │ Body             │
//! │ 1/2/4 bytes  │ 2 bytes    │ Length - 2 bytes │
//! │ (stream only)│ uint16     │ codec-specific   │
//! └──────────────┴────────────┴──────────────────┘
//! ```
//!
//! Length and identifier share one configurable byte order (big endian
//! unless configured otherwise).

use std::convert::TryFrom;

use bytes::{BufMut, Bytes, BytesMut};
use serde::Deserialize;

use crate::error::{NetError, Result};

/// Size of the message identifier in bytes.
pub const MSG_ID_SIZE: usize = 2;

/// Default minimum frame length on stream transports.
pub const DEFAULT_MIN_MSG_LEN: u32 = 1;

/// Default maximum frame length on stream transports.
pub const DEFAULT_MAX_MSG_LEN: u32 = 4096;

/// Default read size for one datagram. Larger datagrams are truncated.
pub const DEFAULT_MAX_DATAGRAM_SIZE: usize = 1024;

/// Byte order of identifiers and length prefixes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ByteOrder {
    #[default]
    BigEndian,
    LittleEndian,
}

impl ByteOrder {
    /// Pick the order from a `little_endian` config flag.
    #[inline]
    pub fn from_little_endian(little_endian: bool) -> Self {
        if little_endian {
            ByteOrder::LittleEndian
        } else {
            ByteOrder::BigEndian
        }
    }

    /// Encode a message identifier.
    #[inline]
    pub fn encode_id(self, id: u16) -> [u8; MSG_ID_SIZE] {
        match self {
            ByteOrder::BigEndian => id.to_be_bytes(),
            ByteOrder::LittleEndian => id.to_le_bytes(),
        }
    }

    /// Decode a message identifier from the first two bytes of `buf`.
    ///
    /// Returns `None` if the buffer is too short.
    #[inline]
    pub fn decode_id(self, buf: &[u8]) -> Option<u16> {
        let bytes: [u8; MSG_ID_SIZE] = buf.get(..MSG_ID_SIZE)?.try_into().ok()?;
        Some(match self {
            ByteOrder::BigEndian => u16::from_be_bytes(bytes),
            ByteOrder::LittleEndian => u16::from_le_bytes(bytes),
        })
    }
}

/// Width of the stream length prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(try_from = "u8")]
pub enum LenWidth {
    One,
    #[default]
    Two,
    Four,
}

impl LenWidth {
    /// Number of bytes in the prefix.
    #[inline]
    pub fn size(self) -> usize {
        match self {
            LenWidth::One => 1,
            LenWidth::Two => 2,
            LenWidth::Four => 4,
        }
    }

    /// Largest length the prefix can express.
    #[inline]
    pub fn max_len(self) -> u32 {
        match self {
            LenWidth::One => u8::MAX as u32,
            LenWidth::Two => u16::MAX as u32,
            LenWidth::Four => u32::MAX,
        }
    }
}

impl TryFrom<u8> for LenWidth {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(LenWidth::One),
            2 => Ok(LenWidth::Two),
            4 => Ok(LenWidth::Four),
            other => Err(format!("length prefix must be 1, 2 or 4 bytes, got {other}")),
        }
    }
}

/// Length-prefix framer for stream transports.
///
/// The prefix counts the frame only (identifier plus body), never itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgParser {
    len_width: LenWidth,
    min_msg_len: u32,
    max_msg_len: u32,
    byte_order: ByteOrder,
}

impl MsgParser {
    /// Create a parser. Bounds larger than the prefix can express are
    /// clamped to its maximum.
    pub fn new(len_width: LenWidth, min_msg_len: u32, max_msg_len: u32, byte_order: ByteOrder) -> Self {
        let limit = len_width.max_len();
        Self {
            len_width,
            min_msg_len: min_msg_len.min(limit),
            max_msg_len: max_msg_len.min(limit),
            byte_order,
        }
    }

    #[inline]
    pub fn header_len(&self) -> usize {
        self.len_width.size()
    }

    #[inline]
    pub fn min_msg_len(&self) -> u32 {
        self.min_msg_len
    }

    #[inline]
    pub fn max_msg_len(&self) -> u32 {
        self.max_msg_len
    }

    #[inline]
    pub fn byte_order(&self) -> ByteOrder {
        self.byte_order
    }

    /// Check a frame length against the configured bounds.
    pub fn validate(&self, len: usize) -> Result<u32> {
        if len > self.max_msg_len as usize {
            return Err(NetError::Protocol(format!(
                "message too long: {} > {}",
                len, self.max_msg_len
            )));
        }
        // Fits in u32 because max_msg_len does.
        let len = len as u32;
        if len < self.min_msg_len {
            return Err(NetError::Protocol(format!(
                "message too short: {} < {}",
                len, self.min_msg_len
            )));
        }
        Ok(len)
    }

    /// Encode a length prefix for a frame of `len` bytes.
    pub fn encode_header(&self, len: usize, dst: &mut BytesMut) -> Result<()> {
        let len = self.validate(len)?;
        match (self.len_width, self.byte_order) {
            (LenWidth::One, _) => dst.put_u8(len as u8),
            (LenWidth::Two, ByteOrder::BigEndian) => dst.put_u16(len as u16),
            (LenWidth::Two, ByteOrder::LittleEndian) => dst.put_u16_le(len as u16),
            (LenWidth::Four, ByteOrder::BigEndian) => dst.put_u32(len),
            (LenWidth::Four, ByteOrder::LittleEndian) => dst.put_u32_le(len),
        }
        Ok(())
    }

    /// Decode and validate a length prefix.
    ///
    /// `header` must hold at least [`header_len`](Self::header_len) bytes.
    pub fn decode_header(&self, header: &[u8]) -> Result<usize> {
        let width = self.header_len();
        let raw = header
            .get(..width)
            .ok_or_else(|| NetError::Protocol(format!("length prefix needs {} bytes", width)))?;

        let len = match (self.len_width, self.byte_order) {
            (LenWidth::One, _) => raw[0] as u32,
            (LenWidth::Two, ByteOrder::BigEndian) => u16::from_be_bytes([raw[0], raw[1]]) as u32,
            (LenWidth::Two, ByteOrder::LittleEndian) => u16::from_le_bytes([raw[0], raw[1]]) as u32,
            (LenWidth::Four, ByteOrder::BigEndian) => {
                u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]])
            }
            (LenWidth::Four, ByteOrder::LittleEndian) => {
                u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]])
            }
        };

        Ok(self.validate(len as usize)? as usize)
    }

    /// Concatenate `segments` into one length-prefixed frame.
    pub fn encode_frame(&self, segments: &[&[u8]]) -> Result<Bytes> {
        let len: usize = segments.iter().map(|s| s.len()).sum();
        let mut buf = BytesMut::with_capacity(self.header_len() + len);
        self.encode_header(len, &mut buf)?;
        for segment in segments {
            buf.extend_from_slice(segment);
        }
        Ok(buf.freeze())
    }
}

impl Default for MsgParser {
    fn default() -> Self {
        Self::new(
            LenWidth::Two,
            DEFAULT_MIN_MSG_LEN,
            DEFAULT_MAX_MSG_LEN,
            ByteOrder::BigEndian,
        )
    }
}
