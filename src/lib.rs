//! # leafnet
//!
//! Transport and dispatch layer for game servers.
//!
//! Connections (TCP streams with length-prefixed frames, or one shared UDP
//! socket) carry frames of the form `[id: u16][body]`. A [`Processor`] maps
//! ids to message types, decodes inbound frames and routes them to typed
//! handlers, raw handlers or an asynchronous [`Router`]. Each connection is
//! driven by an [`Agent`]; servers and clients create and run them.
//!
//! ## Architecture
//!
//! - **Setup**: register messages and handlers on a [`ProcessorBuilder`],
//!   then freeze it. The frozen registry is read without locks.
//! - **Traffic**: one read task per connection runs the agent; one sender
//!   task per connection drains a bounded outbound queue. A full queue
//!   closes the connection instead of blocking the writer.
//!
//! ## Example
//!
//! ```no_run
//! use leafnet::gate::{Gate, GateConfig};
//! use leafnet::logger::default_logger;
//! use leafnet::msgpack_message;
//! use leafnet::processor::ProcessorBuilder;
//! use serde::{Deserialize, Serialize};
//! use tokio_util::sync::CancellationToken;
//!
//! #[derive(Debug, Serialize, Deserialize)]
//! struct Hello {
//!     name: String,
//! }
//! msgpack_message!(Hello);
//!
//! #[tokio::main]
//! async fn main() -> leafnet::Result<()> {
//!     let mut builder = ProcessorBuilder::new(default_logger());
//!     builder.register::<Hello>(0);
//!     builder.set_handler::<Hello, _>(|hello, ctx| {
//!         let _ = ctx.reply(hello);
//!     });
//!
//!     let config = GateConfig {
//!         tcp_addr: Some("127.0.0.1:3563".to_string()),
//!         ..GateConfig::default()
//!     };
//!     Gate::new(config, builder.build(), default_logger())
//!         .run(CancellationToken::new())
//!         .await
//! }
//! ```

pub mod agent;
pub mod client;
pub mod codec;
pub mod config;
pub mod console;
pub mod error;
pub mod gate;
pub mod logger;
pub mod processor;
pub mod protocol;
pub mod router;
pub mod server;
pub mod transport;
pub mod writer;

pub use agent::{Agent, AgentHandle};
pub use error::{NetError, Result};
pub use processor::{Message, Processor, ProcessorBuilder, RouteContext};
pub use router::{Router, RouterHandle};
