//! Administrative console.
//!
//! The remote console is a TCP server on `localhost:<port>` speaking plain
//! text: one `command args...\r\n` line in, the command output plus `\r\n`
//! out, with an optional prompt before every line. `quit` ends the session.
//! The local console reads commands from stdin and logs their output.

mod command;

pub use command::{Commands, Execution, NOT_FOUND};

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::agent::Agent;
use crate::error::Result;
use crate::logger::SharedLogger;
use crate::server::{TcpServer, TcpServerConfig};
use crate::transport::{StreamConfig, StreamConn};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ConsoleConfig {
    /// Read commands from stdin.
    pub local: bool,
    /// Remote console port; 0 disables it.
    pub port: u16,
    pub prompt: String,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            local: false,
            port: 0,
            prompt: "Leaf# ".to_string(),
        }
    }
}

/// One remote console session.
pub struct ConsoleAgent {
    conn: Arc<StreamConn>,
    commands: Arc<Commands>,
    prompt: Arc<str>,
}

impl ConsoleAgent {
    pub fn new(conn: Arc<StreamConn>, commands: Arc<Commands>, prompt: Arc<str>) -> Self {
        Self {
            conn,
            commands,
            prompt,
        }
    }

    fn send(&self, text: String) -> bool {
        self.conn.write(text.into_bytes()).is_ok()
    }
}

impl Agent for ConsoleAgent {
    async fn run(&mut self) {
        loop {
            if !self.prompt.is_empty() && !self.send(self.prompt.to_string()) {
                break;
            }

            let Ok(line) = self.conn.read_line().await else {
                break;
            };
            let line = String::from_utf8_lossy(&line);

            let sent = match self.commands.execute(&line) {
                Execution::Nothing => true,
                Execution::Quit => break,
                Execution::NotFound(_) => self.send(format!("{}\r\n", NOT_FOUND)),
                Execution::Output(output) if output.is_empty() => true,
                Execution::Output(output) => self.send(output + "\r\n"),
            };
            if !sent {
                break;
            }
        }
    }
}

/// Running console services.
pub struct Console {
    server: Option<TcpServer>,
    local: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl Console {
    /// Start the remote and/or local console as configured.
    pub async fn start(config: ConsoleConfig, commands: Commands, logger: SharedLogger) -> Result<Self> {
        let commands = Arc::new(commands);

        let server = if config.port != 0 {
            let server_config = TcpServerConfig {
                addr: format!("localhost:{}", config.port),
                max_conn_num: i32::MAX as usize,
                stream: StreamConfig::default(),
            };
            Some(Self::serve(server_config, commands.clone(), &config.prompt, logger.clone()).await?)
        } else {
            None
        };

        let local = config.local.then(|| {
            let shutdown = CancellationToken::new();
            let task = tokio::spawn(local_loop(commands, shutdown.clone(), logger));
            (shutdown, task)
        });

        Ok(Self {
            server,
            local: Mutex::new(local),
        })
    }

    /// Remote console on an explicit server configuration.
    pub async fn serve(
        config: TcpServerConfig,
        commands: Arc<Commands>,
        prompt: &str,
        logger: SharedLogger,
    ) -> Result<TcpServer> {
        let prompt: Arc<str> = Arc::from(prompt);
        TcpServer::bind(config, logger, move |conn| {
            ConsoleAgent::new(conn, commands.clone(), prompt.clone())
        })
        .await
    }

    /// Address of the remote console, if enabled.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.server.as_ref().map(TcpServer::local_addr)
    }

    pub async fn close(&self) {
        if let Some(server) = &self.server {
            server.close().await;
        }

        let local = self.local.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some((shutdown, task)) = local {
            shutdown.cancel();
            let _ = task.await;
        }
    }
}

async fn local_loop(commands: Arc<Commands>, shutdown: CancellationToken, logger: SharedLogger) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = tokio::select! {
            _ = shutdown.cancelled() => break,
            line = lines.next_line() => line,
        };

        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                logger.error(format_args!("console: read stdin: {}", e));
                break;
            }
        };

        match commands.execute(&line) {
            Execution::Nothing => {}
            Execution::Output(output) if output.is_empty() => {}
            Execution::Output(output) => {
                let name = line.split_whitespace().next().unwrap_or_default();
                logger.info(format_args!("{} cmd run result: {}", name, output));
            }
            Execution::Quit | Execution::NotFound(_) => {
                logger.error(format_args!("{}", NOT_FOUND));
            }
        }
    }
}
