//! Protocol module - wire format and framing.
//!
//! - 16-bit message identifier encoding with configurable byte order
//! - Length-prefix framing for stream transports
//! - Frame buffer for accumulating partial reads

mod frame_buffer;
mod wire_format;

pub use frame_buffer::FrameBuffer;
pub use wire_format::{
    ByteOrder, LenWidth, MsgParser, DEFAULT_MAX_DATAGRAM_SIZE, DEFAULT_MAX_MSG_LEN,
    DEFAULT_MIN_MSG_LEN, MSG_ID_SIZE,
};
