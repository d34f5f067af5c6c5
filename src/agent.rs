//! Per-connection agents.
//!
//! Servers and clients create one [`Agent`] per connection and drive it:
//! `run()` until it returns, then `on_close()` exactly once. The agent never
//! outlives the task that drives it.
//!
//! [`AgentHandle`] is the cheap, cloneable face of a connection that
//! handlers and application code write through.

use std::any::Any;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::Result;
use crate::processor::{AnyMessage, Processor};
use crate::transport::{DatagramConn, StreamConn};
use crate::writer::CloseReason;

/// Behaviour bound to one connection.
pub trait Agent: Send + 'static {
    /// Serve the connection. Returning ends the agent.
    fn run(&mut self) -> impl Future<Output = ()> + Send;

    /// Called once after `run` returns, never concurrently with it.
    fn on_close(&mut self) {}
}

/// The connection behind an [`AgentHandle`].
#[derive(Clone)]
pub enum Link {
    Stream(Arc<StreamConn>),
    Datagram(Arc<DatagramConn>),
}

type UserData = Option<Arc<dyn Any + Send + Sync>>;

struct Inner {
    id: u64,
    link: Link,
    processor: Processor,
    user_data: Mutex<UserData>,
}

static NEXT_AGENT_ID: AtomicU64 = AtomicU64::new(1);

/// Shared handle to a connection plus the processor that encodes for it.
#[derive(Clone)]
pub struct AgentHandle(Arc<Inner>);

impl AgentHandle {
    pub fn new(link: Link, processor: Processor) -> Self {
        Self(Arc::new(Inner {
            id: NEXT_AGENT_ID.fetch_add(1, Ordering::Relaxed),
            link,
            processor,
            user_data: Mutex::new(None),
        }))
    }

    pub fn stream(conn: Arc<StreamConn>, processor: Processor) -> Self {
        Self::new(Link::Stream(conn), processor)
    }

    pub fn datagram(conn: Arc<DatagramConn>, processor: Processor) -> Self {
        Self::new(Link::Datagram(conn), processor)
    }

    /// Process-unique agent id.
    pub fn id(&self) -> u64 {
        self.0.id
    }

    pub fn link(&self) -> &Link {
        &self.0.link
    }

    pub fn processor(&self) -> &Processor {
        &self.0.processor
    }

    /// Marshal `msg` and enqueue it. Datagram links send to the connected
    /// peer.
    pub fn write_msg(&self, msg: &dyn AnyMessage) -> Result<()> {
        self.write_msg_to(None, msg)
    }

    /// Marshal `msg` and enqueue it for `peer`. Stream links ignore `peer`.
    pub fn write_msg_to(&self, peer: Option<SocketAddr>, msg: &dyn AnyMessage) -> Result<()> {
        let (id, body) = self.0.processor.marshal(msg)?;
        self.send(peer, &[&id[..], &body[..]])
    }

    /// Enqueue an already encoded frame.
    pub fn write_data(&self, data: &[u8]) -> Result<()> {
        self.write_data_to(None, data)
    }

    pub fn write_data_to(&self, peer: Option<SocketAddr>, data: &[u8]) -> Result<()> {
        self.send(peer, &[data])
    }

    fn send(&self, peer: Option<SocketAddr>, segments: &[&[u8]]) -> Result<()> {
        match &self.0.link {
            Link::Stream(conn) => conn.write_msg(segments),
            Link::Datagram(conn) => conn.write_msg(peer, segments),
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &self.0.link {
            Link::Stream(conn) => conn.local_addr(),
            Link::Datagram(conn) => conn.local_addr(),
        }
    }

    /// Stream peer, or the connected peer of a datagram socket.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        match &self.0.link {
            Link::Stream(conn) => conn.remote_addr(),
            Link::Datagram(conn) => conn.peer_addr(),
        }
    }

    pub fn close(&self) {
        match &self.0.link {
            Link::Stream(conn) => conn.close(),
            Link::Datagram(conn) => conn.close(),
        }
    }

    pub fn destroy(&self) {
        match &self.0.link {
            Link::Stream(conn) => conn.destroy(),
            Link::Datagram(conn) => conn.destroy(),
        }
    }

    pub fn is_closed(&self) -> bool {
        match &self.0.link {
            Link::Stream(conn) => conn.is_closed(),
            Link::Datagram(conn) => conn.is_closed(),
        }
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        match &self.0.link {
            Link::Stream(conn) => conn.close_reason(),
            Link::Datagram(conn) => conn.close_reason(),
        }
    }

    fn user_data_slot(&self) -> MutexGuard<'_, UserData> {
        self.0.user_data.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The attached user data, if it is a `T`.
    pub fn user_data<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        let data = self.user_data_slot().clone()?;
        data.downcast::<T>().ok()
    }

    /// Replace the attached user data.
    pub fn set_user_data<T: Any + Send + Sync>(&self, data: T) {
        *self.user_data_slot() = Some(Arc::new(data));
    }

    pub fn clear_user_data(&self) {
        *self.user_data_slot() = None;
    }

    /// Whether two handles point at the same agent.
    pub fn ptr_eq(&self, other: &AgentHandle) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl std::fmt::Debug for AgentHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.0.link {
            Link::Stream(_) => "stream",
            Link::Datagram(_) => "datagram",
        };
        f.debug_struct("AgentHandle")
            .field("id", &self.0.id)
            .field("link", &kind)
            .field("remote_addr", &self.remote_addr())
            .finish()
    }
}
