//! Dialing side: a TCP client with fixed-interval retry and optional
//! auto-reconnect, and a UDP client bound to one remote peer.
//!
//! Both clients drive exactly one agent per established connection, the same
//! way the servers do: `run()`, close the connection, `on_close()`, then wait
//! for the socket to shut.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Deserialize;
use tokio::net::{TcpStream, UdpSocket};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::agent::Agent;
use crate::logger::SharedLogger;
use crate::protocol::DEFAULT_MAX_DATAGRAM_SIZE;
use crate::transport::{DatagramConn, StreamConfig, StreamConn};
use crate::writer::DEFAULT_PENDING_WRITE_NUM;

/// Default delay between connect attempts.
pub const DEFAULT_CONNECT_INTERVAL_MS: u64 = 3000;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TcpClientConfig {
    pub addr: String,
    /// Delay between failed dials, and before a reconnect.
    pub connect_interval_ms: u64,
    /// Dial again after the agent finishes.
    pub auto_reconnect: bool,
    #[serde(flatten)]
    pub stream: StreamConfig,
}

impl Default for TcpClientConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:3563".to_string(),
            connect_interval_ms: DEFAULT_CONNECT_INTERVAL_MS,
            auto_reconnect: false,
            stream: StreamConfig::default(),
        }
    }
}

impl TcpClientConfig {
    pub fn connect_interval(&self) -> Duration {
        Duration::from_millis(self.connect_interval_ms)
    }

    fn normalized(mut self, logger: &SharedLogger) -> Self {
        if self.connect_interval_ms == 0 {
            self.connect_interval_ms = DEFAULT_CONNECT_INTERVAL_MS;
            logger.info(format_args!(
                "invalid connect_interval_ms, reset to {}",
                self.connect_interval_ms
            ));
        }
        if self.stream.pending_write_num == 0 {
            self.stream.pending_write_num = DEFAULT_PENDING_WRITE_NUM;
            logger.info(format_args!(
                "invalid pending_write_num, reset to {}",
                self.stream.pending_write_num
            ));
        }
        self
    }
}

/// Sleep for `interval` unless `shutdown` fires first. Returns false when
/// cancelled.
async fn pause(shutdown: &CancellationToken, interval: Duration) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => false,
        _ = tokio::time::sleep(interval) => true,
    }
}

type CurrentConn = Arc<Mutex<Option<Arc<StreamConn>>>>;

/// TCP client. Dials forever until connected; with `auto_reconnect` it dials
/// again each time the agent finishes.
pub struct TcpClient {
    current: CurrentConn,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    logger: SharedLogger,
}

impl TcpClient {
    /// Start dialing in the background. Must be called inside a tokio
    /// runtime.
    pub fn start<A, F>(config: TcpClientConfig, logger: SharedLogger, new_agent: F) -> Self
    where
        A: Agent,
        F: Fn(Arc<StreamConn>) -> A + Send + Sync + 'static,
    {
        let config = config.normalized(&logger);
        let current: CurrentConn = Arc::new(Mutex::new(None));
        let shutdown = CancellationToken::new();

        let dialer = Dialer {
            config,
            new_agent,
            current: current.clone(),
            shutdown: shutdown.clone(),
            logger: logger.clone(),
        };
        let task = tokio::spawn(dialer.run());

        Self {
            current,
            shutdown,
            task: Mutex::new(Some(task)),
            logger,
        }
    }

    /// Whether a connection is currently established and open.
    pub fn is_connected(&self) -> bool {
        self.current
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|conn| !conn.is_closed())
    }

    /// The live connection, if any.
    pub fn conn(&self) -> Option<Arc<StreamConn>> {
        self.current
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Stop reconnecting, close the live connection and wait for the agent
    /// to finish.
    pub async fn close(&self) {
        self.shutdown.cancel();

        let conn = self
            .current
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(conn) = conn {
            conn.close();
        }

        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                self.logger.error(format_args!("tcp client failed: {}", e));
            }
        }
    }
}

struct Dialer<F> {
    config: TcpClientConfig,
    new_agent: F,
    current: CurrentConn,
    shutdown: CancellationToken,
    logger: SharedLogger,
}

impl<A, F> Dialer<F>
where
    A: Agent,
    F: Fn(Arc<StreamConn>) -> A + Send + Sync + 'static,
{
    async fn run(self) {
        let interval = self.config.connect_interval();

        while let Some(stream) = self.dial(interval).await {
            let conn = StreamConn::from_tcp(stream, &self.config.stream, self.logger.clone());
            *self.current.lock().unwrap_or_else(|e| e.into_inner()) = Some(conn.clone());

            // close() may have run before the connection was published.
            if self.shutdown.is_cancelled() {
                conn.close();
            }

            let mut agent = (self.new_agent)(conn.clone());
            agent.run().await;

            conn.close();
            *self.current.lock().unwrap_or_else(|e| e.into_inner()) = None;
            agent.on_close();
            conn.closed().await;

            if !self.config.auto_reconnect {
                break;
            }
            self.logger.debug(format_args!(
                "connection to {} lost, reconnecting",
                self.config.addr
            ));
            if !pause(&self.shutdown, interval).await {
                break;
            }
        }
    }

    /// Dial until connected. `None` once shut down.
    async fn dial(&self, interval: Duration) -> Option<TcpStream> {
        loop {
            let connected = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return None,
                connected = TcpStream::connect(&self.config.addr) => connected,
            };

            match connected {
                Ok(stream) => return Some(stream),
                Err(e) => self.logger.info(format_args!(
                    "connect to {} error: {}",
                    self.config.addr, e
                )),
            }

            if !pause(&self.shutdown, interval).await {
                return None;
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct UdpClientConfig {
    pub addr: String,
    pub connect_interval_ms: u64,
    pub pending_write_num: usize,
    pub max_datagram_size: usize,
}

impl Default for UdpClientConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:3564".to_string(),
            connect_interval_ms: DEFAULT_CONNECT_INTERVAL_MS,
            pending_write_num: DEFAULT_PENDING_WRITE_NUM,
            max_datagram_size: DEFAULT_MAX_DATAGRAM_SIZE,
        }
    }
}

/// UDP client: an ephemeral socket connected to one peer, one agent, no
/// reconnect.
pub struct UdpClient {
    current: Arc<Mutex<Option<Arc<DatagramConn>>>>,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    logger: SharedLogger,
}

impl UdpClient {
    /// Start in the background. Must be called inside a tokio runtime.
    pub fn start<A, F>(config: UdpClientConfig, logger: SharedLogger, new_agent: F) -> Self
    where
        A: Agent,
        F: FnOnce(Arc<DatagramConn>) -> A + Send + 'static,
    {
        let current = Arc::new(Mutex::new(None));
        let shutdown = CancellationToken::new();

        let task = tokio::spawn(udp_client_loop(
            config,
            logger.clone(),
            new_agent,
            current.clone(),
            shutdown.clone(),
        ));

        Self {
            current,
            shutdown,
            task: Mutex::new(Some(task)),
            logger,
        }
    }

    pub fn conn(&self) -> Option<Arc<DatagramConn>> {
        self.current
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub async fn close(&self) {
        self.shutdown.cancel();
        if let Some(conn) = self.conn() {
            conn.close();
        }

        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                self.logger.error(format_args!("udp client failed: {}", e));
            }
        }
    }
}

async fn udp_client_loop<A, F>(
    config: UdpClientConfig,
    logger: SharedLogger,
    new_agent: F,
    current: Arc<Mutex<Option<Arc<DatagramConn>>>>,
    shutdown: CancellationToken,
) where
    A: Agent,
    F: FnOnce(Arc<DatagramConn>) -> A,
{
    let peer = match resolve(&config.addr).await {
        Ok(peer) => peer,
        Err(e) => {
            logger.error(format_args!("resolve {} error: {}", config.addr, e));
            return;
        }
    };

    let interval = Duration::from_millis(config.connect_interval_ms.max(1));
    let socket = loop {
        match connect_udp(peer).await {
            Ok(socket) => break socket,
            Err(e) => logger.info(format_args!("connect to {} error: {}", peer, e)),
        }
        if !pause(&shutdown, interval).await {
            return;
        }
    };

    let conn = DatagramConn::new(
        socket,
        config.pending_write_num,
        config.max_datagram_size,
        logger.clone(),
    );
    *current.lock().unwrap_or_else(|e| e.into_inner()) = Some(conn.clone());
    if shutdown.is_cancelled() {
        conn.close();
    }

    let mut agent = new_agent(conn.clone());
    agent.run().await;

    conn.close();
    *current.lock().unwrap_or_else(|e| e.into_inner()) = None;
    agent.on_close();
    conn.closed().await;
}

async fn resolve(addr: &str) -> std::io::Result<SocketAddr> {
    tokio::net::lookup_host(addr).await?.next().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("no address for {}", addr),
        )
    })
}

async fn connect_udp(peer: SocketAddr) -> std::io::Result<UdpSocket> {
    let local = if peer.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
    let socket = UdpSocket::bind(local).await?;
    socket.connect(peer).await?;
    Ok(socket)
}
