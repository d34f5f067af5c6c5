//! Leveled logging service injected into every component.
//!
//! Components never reach for a global logger. Each one receives a
//! [`SharedLogger`] at construction and emits through it. The default
//! implementation forwards to `tracing`, so the usual subscriber machinery
//! decides where output ends up.
//!
//! `fatal` is reserved for setup-time programmer errors (duplicate message
//! registration and the like): it logs and then panics.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use leafnet::logger::{Level, Logger, SharedLogger, TracingLogger};
//!
//! let logger: SharedLogger = Arc::new(TracingLogger::new(Level::Info));
//! logger.info(format_args!("listening on {}", "127.0.0.1:3563"));
//! assert!(!logger.enabled(Level::Debug));
//! ```

use std::fmt;
use std::fs::{self, OpenOptions};
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use serde::Deserialize;

use crate::error::{NetError, Result};

/// Log file name used by [`init`] when a directory is given.
pub const LOG_FILE_NAME: &str = "leafnet.log";

/// Severity of a log record, lowest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    /// Verbose diagnostics.
    #[default]
    Debug,
    /// Normal operational messages.
    Info,
    /// Something unexpected but recoverable.
    Warn,
    /// A failed operation.
    Error,
    /// Unrecoverable setup error; the caller panics after logging.
    Fatal,
}

impl Level {
    /// Lowercase name of the level.
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
            Level::Fatal => "fatal",
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Level {
    type Err = NetError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "debug" => Ok(Level::Debug),
            "info" => Ok(Level::Info),
            "warn" | "warning" => Ok(Level::Warn),
            "error" => Ok(Level::Error),
            "fatal" => Ok(Level::Fatal),
            other => Err(NetError::Config(format!("unknown level: {other}"))),
        }
    }
}

/// Leveled log sink.
pub trait Logger: Send + Sync + 'static {
    /// Emit one record.
    fn log(&self, level: Level, args: fmt::Arguments<'_>);

    /// Whether records at `level` would be emitted.
    fn enabled(&self, _level: Level) -> bool {
        true
    }

    fn debug(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Debug, args);
    }

    fn info(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Info, args);
    }

    fn warn(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Warn, args);
    }

    fn error(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Error, args);
    }

    /// Log at [`Level::Fatal`] and panic with the same message.
    fn fatal(&self, args: fmt::Arguments<'_>) -> ! {
        self.log(Level::Fatal, args);
        panic!("{}", args);
    }
}

/// Logger handle shared by every component.
pub type SharedLogger = Arc<dyn Logger>;

/// Logger that forwards records to `tracing`.
#[derive(Debug, Clone, Copy)]
pub struct TracingLogger {
    min_level: Level,
}

impl TracingLogger {
    /// Create a logger that drops records below `min_level`.
    pub fn new(min_level: Level) -> Self {
        Self { min_level }
    }

    /// The lowest level this logger emits.
    pub fn min_level(&self) -> Level {
        self.min_level
    }
}

impl Default for TracingLogger {
    fn default() -> Self {
        Self::new(Level::Debug)
    }
}

impl Logger for TracingLogger {
    fn log(&self, level: Level, args: fmt::Arguments<'_>) {
        if !self.enabled(level) {
            return;
        }
        match level {
            Level::Debug => tracing::debug!("{}", args),
            Level::Info => tracing::info!("{}", args),
            Level::Warn => tracing::warn!("{}", args),
            Level::Error => tracing::error!("{}", args),
            Level::Fatal => tracing::error!(fatal = true, "{}", args),
        }
    }

    fn enabled(&self, level: Level) -> bool {
        level >= self.min_level
    }
}

/// Logger that discards everything except the panic of `fatal`.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopLogger;

impl Logger for NoopLogger {
    fn log(&self, _level: Level, _args: fmt::Arguments<'_>) {}

    fn enabled(&self, _level: Level) -> bool {
        false
    }
}

/// The logger components use when none is supplied.
pub fn default_logger() -> SharedLogger {
    Arc::new(TracingLogger::default())
}

/// Install a global `tracing` subscriber.
///
/// Writes to stdout when `dir` is `None`, otherwise appends to
/// `dir/leafnet.log` (the directory is created if needed). `RUST_LOG`
/// overrides `level` when set.
pub fn init(level: Level, dir: Option<&Path>) -> Result<()> {
    use tracing_subscriber::EnvFilter;

    let directive = match level {
        Level::Fatal => "error",
        other => other.as_str(),
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    let installed = match dir {
        None => builder.try_init(),
        Some(dir) => {
            fs::create_dir_all(dir)?;
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(dir.join(LOG_FILE_NAME))?;
            builder.with_ansi(false).with_writer(Mutex::new(file)).try_init()
        }
    };

    installed.map_err(|e| NetError::Config(format!("logger already installed: {e}")))
}
