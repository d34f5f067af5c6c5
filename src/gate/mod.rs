//! Gate - wires listeners to a processor.
//!
//! A gate runs a TCP server, a UDP server, or both. Every TCP connection gets
//! a [`StreamAgent`]; the UDP socket gets one [`DatagramAgent`] for all
//! peers. Agents decode inbound frames with the shared [`Processor`] and
//! route them. Lifecycle notifications go out as [`AgentEvent`]s when an
//! event channel is attached.
//!
//! # Example
//!
//! ```no_run
//! use leafnet::gate::{Gate, GateConfig};
//! use leafnet::logger::default_logger;
//! use leafnet::processor::ProcessorBuilder;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn demo() -> leafnet::error::Result<()> {
//! let processor = ProcessorBuilder::new(default_logger()).build();
//! let config = GateConfig {
//!     tcp_addr: Some("127.0.0.1:3563".to_string()),
//!     ..GateConfig::default()
//! };
//!
//! let shutdown = CancellationToken::new();
//! Gate::new(config, processor, default_logger()).run(shutdown).await?;
//! # Ok(())
//! # }
//! ```

mod agent;

pub use agent::{AgentEvent, DatagramAgent, StreamAgent};

use std::net::SocketAddr;

use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::agent::AgentHandle;
use crate::error::Result;
use crate::logger::SharedLogger;
use crate::processor::Processor;
use crate::protocol::{LenWidth, DEFAULT_MAX_DATAGRAM_SIZE, DEFAULT_MAX_MSG_LEN, DEFAULT_MIN_MSG_LEN};
use crate::server::{TcpServer, TcpServerConfig, UdpServer, UdpServerConfig, DEFAULT_MAX_CONN_NUM};
use crate::transport::StreamConfig;
use crate::writer::DEFAULT_PENDING_WRITE_NUM;

use agent::Events;

/// Listener and framing settings of a gate. An absent address disables that
/// listener.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    pub tcp_addr: Option<String>,
    pub udp_addr: Option<String>,
    pub max_conn_num: usize,
    pub pending_write_num: usize,
    pub len_msg_len: LenWidth,
    pub min_msg_len: u32,
    pub max_msg_len: u32,
    pub little_endian: bool,
    pub max_datagram_size: usize,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            tcp_addr: None,
            udp_addr: None,
            max_conn_num: DEFAULT_MAX_CONN_NUM,
            pending_write_num: DEFAULT_PENDING_WRITE_NUM,
            len_msg_len: LenWidth::Two,
            min_msg_len: DEFAULT_MIN_MSG_LEN,
            max_msg_len: DEFAULT_MAX_MSG_LEN,
            little_endian: false,
            max_datagram_size: DEFAULT_MAX_DATAGRAM_SIZE,
        }
    }
}

impl GateConfig {
    pub fn tcp_server(&self) -> Option<TcpServerConfig> {
        let addr = self.tcp_addr.clone()?;
        Some(TcpServerConfig {
            addr,
            max_conn_num: self.max_conn_num,
            stream: StreamConfig {
                pending_write_num: self.pending_write_num,
                len_msg_len: self.len_msg_len,
                min_msg_len: self.min_msg_len,
                max_msg_len: self.max_msg_len,
                little_endian: self.little_endian,
            },
        })
    }

    pub fn udp_server(&self) -> Option<UdpServerConfig> {
        let addr = self.udp_addr.clone()?;
        Some(UdpServerConfig {
            addr,
            pending_write_num: self.pending_write_num,
            max_datagram_size: self.max_datagram_size,
        })
    }
}

pub struct Gate {
    config: GateConfig,
    processor: Processor,
    events: Option<mpsc::Sender<AgentEvent>>,
    logger: SharedLogger,
}

impl Gate {
    pub fn new(config: GateConfig, processor: Processor, logger: SharedLogger) -> Self {
        Self {
            config,
            processor,
            events: None,
            logger,
        }
    }

    /// Publish agent open/close events on `tx`. Events are dropped, with a
    /// warning, when the channel is full.
    pub fn with_events(mut self, tx: mpsc::Sender<AgentEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    /// Bind the configured listeners and start serving.
    pub async fn start(self) -> Result<RunningGate> {
        let events = Events::new(self.events.clone(), self.logger.clone());

        let tcp = match self.config.tcp_server() {
            Some(config) => {
                let processor = self.processor.clone();
                let events = events.clone();
                let logger = self.logger.clone();
                let server = TcpServer::bind(config, self.logger.clone(), move |conn| {
                    let handle = AgentHandle::stream(conn.clone(), processor.clone());
                    StreamAgent::new(conn, handle, events.clone(), logger.clone())
                })
                .await?;
                Some(server)
            }
            None => None,
        };

        let udp = match self.config.udp_server() {
            Some(config) => {
                let processor = self.processor.clone();
                let logger = self.logger.clone();
                let bound = UdpServer::bind(config, self.logger.clone(), move |conn| {
                    let handle = AgentHandle::datagram(conn.clone(), processor);
                    DatagramAgent::new(conn, handle, events, logger)
                })
                .await;
                match bound {
                    Ok(server) => Some(server),
                    Err(e) => {
                        if let Some(tcp) = &tcp {
                            tcp.close().await;
                        }
                        return Err(e);
                    }
                }
            }
            None => None,
        };

        if tcp.is_none() && udp.is_none() {
            self.logger
                .warn(format_args!("gate has neither tcp_addr nor udp_addr"));
        }

        Ok(RunningGate {
            tcp,
            udp,
            logger: self.logger,
        })
    }

    /// Serve until `shutdown` fires, then close every listener and
    /// connection.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let gate = self.start().await?;
        shutdown.cancelled().await;
        gate.close().await;
        Ok(())
    }
}

/// A started gate.
pub struct RunningGate {
    tcp: Option<TcpServer>,
    udp: Option<UdpServer>,
    logger: SharedLogger,
}

impl RunningGate {
    pub fn tcp_addr(&self) -> Option<SocketAddr> {
        self.tcp.as_ref().map(TcpServer::local_addr)
    }

    pub fn udp_addr(&self) -> Option<SocketAddr> {
        self.udp.as_ref().and_then(UdpServer::local_addr)
    }

    /// Live TCP connections.
    pub fn connection_count(&self) -> usize {
        self.tcp.as_ref().map_or(0, TcpServer::connection_count)
    }

    pub async fn close(self) {
        if let Some(tcp) = &self.tcp {
            tcp.close().await;
        }
        if let Some(udp) = &self.udp {
            udp.close().await;
        }
        self.logger.debug(format_args!("gate closed"));
    }
}
