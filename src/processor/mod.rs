//! Processor module - message registry, codec and dispatch.
//!
//! A frame is a 16-bit identifier followed by a codec-specific body. The
//! processor maps identifiers to message types, turns frames into messages
//! and back, and routes decoded messages to handlers or a router.

mod context;
mod message;
mod registry;

pub use context::RouteContext;
pub use message::{AnyMessage, Message};
pub use registry::{Decoded, Handler, Processor, ProcessorBuilder, RawHandler, RawMessage};
