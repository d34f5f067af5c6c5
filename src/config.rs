//! Top-level configuration tree.
//!
//! Every section deserializes with `#[serde(default)]`, so a config file
//! only needs to name the values it changes:
//!
//! ```
//! use leafnet::config::LeafConfig;
//! use leafnet::logger::Level;
//!
//! let config = LeafConfig::from_json(r#"{
//!     "log_level": "info",
//!     "gate": { "tcp_addr": "127.0.0.1:3563", "max_conn_num": 2000 }
//! }"#).unwrap();
//!
//! assert_eq!(config.log_level, Level::Info);
//! assert_eq!(config.gate.max_conn_num, 2000);
//! assert_eq!(config.gate.pending_write_num, 100);
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::console::ConsoleConfig;
use crate::error::Result;
use crate::gate::GateConfig;
use crate::logger::Level;

/// Root of a leafnet configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LeafConfig {
    /// Minimum level passed to [`logger::init`](crate::logger::init).
    pub log_level: Level,
    /// Directory for the log file; stdout when absent.
    pub log_path: Option<PathBuf>,
    /// Administrative console.
    pub console: ConsoleConfig,
    /// Gateway listeners and framing.
    pub gate: GateConfig,
}

impl LeafConfig {
    /// Parse a configuration from JSON text.
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Read and parse a JSON configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::from_json(&text)
    }
}
