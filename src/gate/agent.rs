//! The agents a gate puts behind each connection.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::agent::{Agent, AgentHandle};
use crate::error::NetError;
use crate::logger::SharedLogger;
use crate::processor::RouteContext;
use crate::transport::{DatagramConn, StreamConn};

/// Connection lifecycle notifications.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    Opened(AgentHandle),
    Closed(AgentHandle),
}

impl AgentEvent {
    pub fn agent(&self) -> &AgentHandle {
        match self {
            AgentEvent::Opened(agent) | AgentEvent::Closed(agent) => agent,
        }
    }
}

/// Optional event sink shared by every agent of a gate.
#[derive(Clone)]
pub(crate) struct Events {
    tx: Option<mpsc::Sender<AgentEvent>>,
    logger: SharedLogger,
}

impl Events {
    pub(crate) fn new(tx: Option<mpsc::Sender<AgentEvent>>, logger: SharedLogger) -> Self {
        Self { tx, logger }
    }

    fn send(&self, event: AgentEvent) {
        let Some(tx) = &self.tx else {
            return;
        };
        if let Err(e) = tx.try_send(event) {
            self.logger
                .warn(format_args!("agent event dropped: {}", e));
        }
    }
}

/// Route errors that reflect the router, not the peer.
fn is_router_error(err: &NetError) -> bool {
    matches!(err, NetError::RouterFull(_) | NetError::RouterClosed)
}

/// Reads frames from one stream connection and routes them. Any read,
/// decode or route failure drops the connection.
pub struct StreamAgent {
    conn: Arc<StreamConn>,
    handle: AgentHandle,
    events: Events,
    logger: SharedLogger,
}

impl StreamAgent {
    pub(crate) fn new(
        conn: Arc<StreamConn>,
        handle: AgentHandle,
        events: Events,
        logger: SharedLogger,
    ) -> Self {
        events.send(AgentEvent::Opened(handle.clone()));
        Self {
            conn,
            handle,
            events,
            logger,
        }
    }

    pub fn handle(&self) -> &AgentHandle {
        &self.handle
    }
}

impl Agent for StreamAgent {
    async fn run(&mut self) {
        let processor = self.handle.processor().clone();
        let ctx = RouteContext::with_agent(self.handle.clone());

        loop {
            let frame = match self.conn.read_msg().await {
                Ok(frame) => frame,
                Err(NetError::ConnectionClosed) => break,
                Err(e) => {
                    self.logger
                        .debug(format_args!("read message: {}", e));
                    break;
                }
            };

            let decoded = match processor.unmarshal(frame) {
                Ok(decoded) => decoded,
                Err(e) => {
                    self.logger
                        .debug(format_args!("unmarshal message error: {}", e));
                    break;
                }
            };

            if let Err(e) = processor.route(decoded, &ctx) {
                if is_router_error(&e) {
                    self.logger.warn(format_args!("route message: {}", e));
                    continue;
                }
                self.logger
                    .debug(format_args!("route message error: {}", e));
                break;
            }
        }
    }

    fn on_close(&mut self) {
        self.events.send(AgentEvent::Closed(self.handle.clone()));
    }
}

/// Serves every peer of one datagram socket. Bad datagrams are logged and
/// skipped; the loop ends only when the connection closes.
pub struct DatagramAgent {
    conn: Arc<DatagramConn>,
    handle: AgentHandle,
    events: Events,
    logger: SharedLogger,
}

impl DatagramAgent {
    pub(crate) fn new(
        conn: Arc<DatagramConn>,
        handle: AgentHandle,
        events: Events,
        logger: SharedLogger,
    ) -> Self {
        events.send(AgentEvent::Opened(handle.clone()));
        Self {
            conn,
            handle,
            events,
            logger,
        }
    }

    pub fn handle(&self) -> &AgentHandle {
        &self.handle
    }
}

impl Agent for DatagramAgent {
    async fn run(&mut self) {
        let processor = self.handle.processor().clone();

        loop {
            let (data, peer) = match self.conn.read_msg().await {
                Ok(received) => received,
                Err(NetError::ConnectionClosed) => break,
                Err(e) => {
                    if self.conn.is_closed() {
                        break;
                    }
                    self.logger.debug(format_args!("read datagram: {}", e));
                    continue;
                }
            };

            let decoded = match processor.unmarshal(data) {
                Ok(decoded) => decoded,
                Err(e) => {
                    self.logger
                        .debug(format_args!("unmarshal datagram from {}: {}", peer, e));
                    continue;
                }
            };

            let ctx = RouteContext::with_agent(self.handle.clone()).with_peer(peer);
            if let Err(e) = processor.route(decoded, &ctx) {
                self.logger
                    .debug(format_args!("route datagram from {}: {}", peer, e));
            }
        }
    }

    fn on_close(&mut self) {
        self.events.send(AgentEvent::Closed(self.handle.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::NoopLogger;
    use crate::processor::{Processor, ProcessorBuilder};
    use crate::transport::StreamConfig;
    use serde::{Deserialize, Serialize};
    use std::sync::Mutex;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Say {
        text: String,
    }
    crate::msgpack_message!(Say);

    fn logger() -> SharedLogger {
        Arc::new(NoopLogger)
    }

    fn echo_processor(seen: Arc<Mutex<Vec<String>>>) -> Processor {
        let mut builder = ProcessorBuilder::new(logger());
        builder.register::<Say>(1);
        builder.set_handler::<Say, _>(move |say, ctx| {
            seen.lock().unwrap().push(say.text.clone());
            let _ = ctx.reply(say);
        });
        builder.build()
    }

    #[tokio::test]
    async fn test_stream_agent_routes_and_replies() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let processor = echo_processor(seen.clone());
        let (a, b) = tokio::io::duplex(4096);
        let conn = StreamConn::new(a, &StreamConfig::default(), logger());
        let peer = StreamConn::new(b, &StreamConfig::default(), logger());

        let (tx, mut rx) = mpsc::channel(4);
        let handle = AgentHandle::stream(conn.clone(), processor.clone());
        let mut agent = StreamAgent::new(conn.clone(), handle, Events::new(Some(tx), logger()), logger());
        assert!(matches!(rx.recv().await, Some(AgentEvent::Opened(_))));

        let task = tokio::spawn(async move {
            agent.run().await;
            agent.on_close();
        });

        let frame = processor
            .marshal_merged(&Say {
                text: "hello".to_string(),
            })
            .unwrap();
        peer.write_msg(&[&frame[..]]).unwrap();
        let echoed = peer.read_msg().await.unwrap();
        assert_eq!(echoed, frame);

        // Unknown id: the agent drops the connection.
        peer.write_msg(&[&[0, 9]]).unwrap();
        task.await.unwrap();

        assert_eq!(*seen.lock().unwrap(), vec!["hello".to_string()]);
        assert!(matches!(rx.recv().await, Some(AgentEvent::Closed(_))));
    }

    #[tokio::test]
    async fn test_datagram_agent_skips_bad_datagrams() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let processor = echo_processor(seen.clone());

        let server_socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server = DatagramConn::new(server_socket, 8, 1024, logger());
        let client_socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client = DatagramConn::new(client_socket, 8, 1024, logger());

        let handle = AgentHandle::datagram(server.clone(), processor.clone());
        let mut agent = DatagramAgent::new(server.clone(), handle, Events::new(None, logger()), logger());
        let task = tokio::spawn(async move { agent.run().await });

        client.write_msg(server.local_addr(), &[&[0, 7, 1]]).unwrap();
        let frame = processor
            .marshal_merged(&Say {
                text: "udp".to_string(),
            })
            .unwrap();
        client.write(server.local_addr(), frame.clone()).unwrap();

        let (echoed, from) = client.read_msg().await.unwrap();
        assert_eq!(echoed, frame);
        assert_eq!(Some(from), server.local_addr());

        server.close();
        task.await.unwrap();
        assert_eq!(*seen.lock().unwrap(), vec!["udp".to_string()]);
    }

    #[test]
    fn test_router_errors_are_not_peer_faults() {
        assert!(is_router_error(&NetError::RouterClosed));
        assert!(is_router_error(&NetError::RouterFull("Say".to_string())));
        assert!(!is_router_error(&NetError::UnknownMessageId(3)));
    }
}
