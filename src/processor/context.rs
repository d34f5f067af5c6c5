//! Per-message routing context.

use std::net::SocketAddr;

use crate::agent::AgentHandle;
use crate::error::Result;
use crate::processor::AnyMessage;

/// Where a decoded message came from.
///
/// Created per inbound message and handed to every dispatch target. A
/// detached context (no agent) makes replies no-ops, which is what unit
/// tests of handlers usually want.
#[derive(Clone, Default)]
pub struct RouteContext {
    agent: Option<AgentHandle>,
    peer: Option<SocketAddr>,
}

impl RouteContext {
    /// A context with no origin.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_agent(agent: AgentHandle) -> Self {
        Self {
            agent: Some(agent),
            peer: None,
        }
    }

    /// Attach the sender address (datagram transports).
    pub fn with_peer(mut self, peer: SocketAddr) -> Self {
        self.peer = Some(peer);
        self
    }

    pub fn agent(&self) -> Option<&AgentHandle> {
        self.agent.as_ref()
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Send `msg` back to the origin.
    pub fn reply(&self, msg: &dyn AnyMessage) -> Result<()> {
        match &self.agent {
            Some(agent) => agent.write_msg_to(self.peer, msg),
            None => Ok(()),
        }
    }

    /// Send an already encoded frame back to the origin.
    pub fn reply_raw(&self, data: &[u8]) -> Result<()> {
        match &self.agent {
            Some(agent) => agent.write_data_to(self.peer, data),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for RouteContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteContext")
            .field("agent", &self.agent.as_ref().map(AgentHandle::id))
            .field("peer", &self.peer)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::ProcessorBuilder;
    use crate::transport::{StreamConfig, StreamConn};
    use serde::{Deserialize, Serialize};
    use std::sync::Arc;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Pong {
        seq: u32,
    }
    crate::msgpack_message!(Pong);

    #[test]
    fn test_detached_reply_is_noop() {
        let ctx = RouteContext::new();
        assert!(ctx.agent().is_none());
        assert!(ctx.peer().is_none());
        ctx.reply(&Pong { seq: 1 }).unwrap();
        ctx.reply_raw(b"raw").unwrap();
    }

    #[test]
    fn test_with_peer() {
        let peer: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let ctx = RouteContext::new().with_peer(peer);
        assert_eq!(ctx.peer(), Some(peer));
        assert!(format!("{:?}", ctx).contains("9000"));
    }

    #[tokio::test]
    async fn test_reply_goes_to_agent() {
        let mut builder = ProcessorBuilder::default();
        builder.register::<Pong>(5);
        let processor = builder.build();

        let (a, b) = tokio::io::duplex(4096);
        let logger: crate::logger::SharedLogger = Arc::new(crate::logger::NoopLogger);
        let conn = StreamConn::new(a, &StreamConfig::default(), logger.clone());
        let peer = StreamConn::new(b, &StreamConfig::default(), logger);

        let ctx = RouteContext::with_agent(AgentHandle::stream(conn, processor.clone()));
        ctx.reply(&Pong { seq: 9 }).unwrap();

        let frame = peer.read_msg().await.unwrap();
        assert_eq!(&frame[..2], &[0, 5]);
        let decoded = processor.unmarshal(frame).unwrap();
        let msg = decoded.into_message().unwrap();
        assert_eq!(msg.downcast_ref::<Pong>(), Some(&Pong { seq: 9 }));
    }
}
