//! Codec module - serialization of message bodies.
//!
//! Codecs are marker structs with static methods rather than trait objects.
//! A message type picks its codec when it implements
//! [`Message`](crate::processor::Message); the
//! [`msgpack_message!`](crate::msgpack_message) macro wires serde types to
//! [`MsgPackCodec`].

mod msgpack;

pub use msgpack::MsgPackCodec;
