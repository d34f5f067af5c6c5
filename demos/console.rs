//! Console - administrative commands over telnet and stdin.
//!
//! ```text
//! cargo run --example console
//! telnet localhost 3333
//! Leaf# uptime
//! ```

use std::time::Instant;

use leafnet::config::LeafConfig;
use leafnet::console::{Commands, Console};
use leafnet::logger::{self, default_logger};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = LeafConfig::from_json(
        r#"{
            "log_level": "info",
            "console": { "local": true, "port": 3333 }
        }"#,
    )?;
    logger::init(config.log_level, config.log_path.as_deref())?;
    let log = default_logger();

    let started = Instant::now();
    let mut commands = Commands::new(log.clone());
    commands.register("uptime", "seconds since start", move |_| {
        format!("{}s", started.elapsed().as_secs())
    });
    commands.register("sum", "add integer arguments", |args| {
        let total: i64 = args.iter().filter_map(|a| a.parse::<i64>().ok()).sum();
        total.to_string()
    });

    let console = Console::start(config.console, commands, log).await?;
    tracing::info!(addr = ?console.local_addr(), "console ready");

    tokio::signal::ctrl_c().await?;
    console.close().await;
    Ok(())
}
