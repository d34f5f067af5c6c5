//! Listening side: a TCP server spawning one agent per connection, and a
//! UDP server serving every peer through one socket and one agent.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Deserialize;
use tokio::net::{TcpListener, UdpSocket};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::agent::Agent;
use crate::error::Result;
use crate::logger::SharedLogger;
use crate::protocol::DEFAULT_MAX_DATAGRAM_SIZE;
use crate::transport::{DatagramConn, StreamConfig, StreamConn};
use crate::writer::DEFAULT_PENDING_WRITE_NUM;

/// Default live connection limit.
pub const DEFAULT_MAX_CONN_NUM: usize = 100;

/// First delay after a failed accept.
const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(5);

/// Longest delay between failed accepts.
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TcpServerConfig {
    pub addr: String,
    /// Connections beyond this many are closed right after accept.
    pub max_conn_num: usize,
    #[serde(flatten)]
    pub stream: StreamConfig,
}

impl Default for TcpServerConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:3563".to_string(),
            max_conn_num: DEFAULT_MAX_CONN_NUM,
            stream: StreamConfig::default(),
        }
    }
}

impl TcpServerConfig {
    /// Replace zero limits with the defaults, logging each correction.
    pub fn normalized(mut self, logger: &SharedLogger) -> Self {
        if self.max_conn_num == 0 {
            self.max_conn_num = DEFAULT_MAX_CONN_NUM;
            logger.info(format_args!(
                "invalid max_conn_num, reset to {}",
                self.max_conn_num
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

type ConnMap = Arc<Mutex<HashMap<u64, Arc<StreamConn>>>>;

fn lock_conns(conns: &ConnMap) -> MutexGuard<'_, HashMap<u64, Arc<StreamConn>>> {
    conns.lock().unwrap_or_else(|e| e.into_inner())
}

/// TCP server: accept loop plus one agent task per live connection.
///
/// ```no_run
/// use std::sync::Arc;
/// use leafnet::agent::Agent;
/// use leafnet::logger::default_logger;
/// use leafnet::server::{TcpServer, TcpServerConfig};
/// use leafnet::transport::StreamConn;
///
/// struct Echo(Arc<StreamConn>);
///
/// impl Agent for Echo {
///     async fn run(&mut self) {
///         while let Ok(frame) = self.0.read_msg().await {
///             if self.0.write_msg(&[&frame[..]]).is_err() {
///                 break;
///             }
///         }
///     }
/// }
///
/// # async fn demo() -> leafnet::error::Result<()> {
/// let server = TcpServer::bind(TcpServerConfig::default(), default_logger(), Echo).await?;
/// // ...
/// server.close().await;
/// # Ok(())
/// # }
/// ```
pub struct TcpServer {
    local_addr: SocketAddr,
    conns: ConnMap,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    logger: SharedLogger,
}

impl TcpServer {
    /// Bind `config.addr` and start accepting.
    ///
    /// `new_agent` is called once per accepted connection.
    pub async fn bind<A, F>(config: TcpServerConfig, logger: SharedLogger, new_agent: F) -> Result<Self>
    where
        A: Agent,
        F: Fn(Arc<StreamConn>) -> A + Send + Sync + 'static,
    {
        let config = config.normalized(&logger);
        let listener = TcpListener::bind(&config.addr).await?;
        let local_addr = listener.local_addr()?;
        logger.debug(format_args!("tcp server listening on {}", local_addr));

        let server = Self {
            local_addr,
            conns: Arc::new(Mutex::new(HashMap::new())),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
            accept_task: Mutex::new(None),
            logger,
        };

        let accept = AcceptLoop {
            listener,
            config,
            new_agent,
            conns: server.conns.clone(),
            tracker: server.tracker.clone(),
            shutdown: server.shutdown.clone(),
            logger: server.logger.clone(),
        };
        let task = tokio::spawn(accept.run());
        *server
            .accept_task
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(task);

        Ok(server)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        lock_conns(&self.conns).len()
    }

    /// Stop accepting, close every connection and wait until all agents
    /// have finished and every socket is shut.
    pub async fn close(&self) {
        self.shutdown.cancel();

        let accept_task = self
            .accept_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = accept_task {
            if let Err(e) = task.await {
                self.logger.error(format_args!("accept loop failed: {}", e));
            }
        }

        let conns: Vec<_> = lock_conns(&self.conns).values().cloned().collect();
        for conn in conns {
            conn.close();
        }

        self.tracker.close();
        self.tracker.wait().await;
        self.logger
            .debug(format_args!("tcp server {} closed", self.local_addr));
    }
}

struct AcceptLoop<F> {
    listener: TcpListener,
    config: TcpServerConfig,
    new_agent: F,
    conns: ConnMap,
    tracker: TaskTracker,
    shutdown: CancellationToken,
    logger: SharedLogger,
}

impl<A, F> AcceptLoop<F>
where
    A: Agent,
    F: Fn(Arc<StreamConn>) -> A + Send + Sync + 'static,
{
    async fn run(self) {
        let mut delay = Duration::ZERO;
        let mut next_id: u64 = 0;

        loop {
            let accepted = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            let (stream, peer) = match accepted {
                Ok(accepted) => {
                    delay = Duration::ZERO;
                    accepted
                }
                Err(e) => {
                    delay = if delay.is_zero() {
                        ACCEPT_BACKOFF_MIN
                    } else {
                        (delay * 2).min(ACCEPT_BACKOFF_MAX)
                    };
                    self.logger.info(format_args!(
                        "accept error: {}; retrying in {:?}",
                        e, delay
                    ));
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(delay) => continue,
                    }
                }
            };

            let conn = {
                let mut conns = lock_conns(&self.conns);
                if conns.len() >= self.config.max_conn_num {
                    drop(conns);
                    drop(stream);
                    self.logger
                        .debug(format_args!("too many connections, rejected {}", peer));
                    continue;
                }

                next_id += 1;
                let conn = StreamConn::from_tcp(stream, &self.config.stream, self.logger.clone());
                conns.insert(next_id, conn.clone());
                conn
            };

            let id = next_id;
            let mut agent = (self.new_agent)(conn.clone());
            let conns = self.conns.clone();
            self.tracker.spawn(async move {
                agent.run().await;

                conn.close();
                lock_conns(&conns).remove(&id);
                agent.on_close();
                conn.closed().await;
            });
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct UdpServerConfig {
    pub addr: String,
    pub pending_write_num: usize,
    /// Read size per datagram; longer datagrams are truncated.
    pub max_datagram_size: usize,
}

impl Default for UdpServerConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:3564".to_string(),
            pending_write_num: DEFAULT_PENDING_WRITE_NUM,
            max_datagram_size: DEFAULT_MAX_DATAGRAM_SIZE,
        }
    }
}

/// UDP server: one socket, one connection and one agent for every peer.
pub struct UdpServer {
    conn: Arc<DatagramConn>,
    task: Mutex<Option<JoinHandle<()>>>,
    logger: SharedLogger,
}

impl UdpServer {
    pub async fn bind<A, F>(
        mut config: UdpServerConfig,
        logger: SharedLogger,
        new_agent: F,
    ) -> Result<Self>
    where
        A: Agent,
        F: FnOnce(Arc<DatagramConn>) -> A,
    {
        if config.pending_write_num == 0 {
            config.pending_write_num = DEFAULT_PENDING_WRITE_NUM;
            logger.info(format_args!(
                "invalid pending_write_num, reset to {}",
                config.pending_write_num
            ));
        }

        let socket = UdpSocket::bind(&config.addr).await?;
        let conn = DatagramConn::new(
            socket,
            config.pending_write_num,
            config.max_datagram_size,
            logger.clone(),
        );
        logger.debug(format_args!(
            "udp server listening on {}",
            crate::transport::display_addr(conn.local_addr())
        ));

        let mut agent = new_agent(conn.clone());
        let task = tokio::spawn({
            let conn = conn.clone();
            async move {
                agent.run().await;
                conn.close();
                agent.on_close();
                conn.closed().await;
            }
        });

        Ok(Self {
            conn,
            task: Mutex::new(Some(task)),
            logger,
        })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.conn.local_addr()
    }

    pub fn conn(&self) -> &Arc<DatagramConn> {
        &self.conn
    }

    /// Close the socket and wait for the agent to finish. The address can be
    /// bound again once this returns.
    pub async fn close(&self) {
        self.conn.close();

        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                self.logger.error(format_args!("udp agent failed: {}", e));
            }
        }
    }
}
