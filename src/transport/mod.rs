//! Transport module - connections over byte streams and datagrams.
//!
//! - [`StreamConn`]: length-prefixed frames over TCP (or any byte stream)
//! - [`DatagramConn`]: one frame per UDP datagram, peer address per read

mod datagram;
mod stream;

pub use datagram::{Datagram, DatagramConn};
pub use stream::{StreamConfig, StreamConn};

pub(crate) use stream::display_addr;
