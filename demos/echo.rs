//! Echo Gate - TCP chat echo with a router and lifecycle events.
//!
//! This example demonstrates:
//! - Registering a serde message with `msgpack_message!`
//! - Replying from a typed handler
//! - Handing messages off to a `Router` running on its own task
//! - Watching agents open and close through `AgentEvent`s
//!
//! # Running
//!
//! ```text
//! cargo run --example echo -- 127.0.0.1:3563
//! ```
//!
//! Frames are `[len: u16 BE][id: u16 BE][msgpack body]`.

use leafnet::gate::{AgentEvent, Gate, GateConfig};
use leafnet::logger::{self, default_logger, Level};
use leafnet::msgpack_message;
use leafnet::processor::ProcessorBuilder;
use leafnet::router::{Router, DEFAULT_ROUTER_CAPACITY};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Chat line sent by a client and echoed back.
#[derive(Serialize, Deserialize, Debug)]
struct Chat {
    from: String,
    text: String,
}
msgpack_message!(Chat);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    logger::init(Level::Debug, None)?;
    let log = default_logger();

    let addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:3563".to_string());

    // Chat history lives on the router task; handlers never touch it.
    let (mut router, router_handle) = Router::new(DEFAULT_ROUTER_CAPACITY, log.clone());
    let mut history = Vec::new();
    router.register::<Chat, _>(move |chat, _ctx| {
        history.push(chat.text);
        tracing::info!(lines = history.len(), "chat history updated");
    });
    tokio::spawn(router.run());

    let mut builder = ProcessorBuilder::new(log.clone());
    builder.register::<Chat>(0);
    builder.set_handler::<Chat, _>(|chat, ctx| {
        if let Err(e) = ctx.reply(chat) {
            tracing::warn!(error = %e, "echo failed");
        }
    });
    builder.set_router::<Chat>(router_handle);

    let (events_tx, mut events) = mpsc::channel(64);
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                AgentEvent::Opened(agent) => tracing::info!(id = agent.id(), peer = ?agent.remote_addr(), "agent opened"),
                AgentEvent::Closed(agent) => tracing::info!(id = agent.id(), "agent closed"),
            }
        }
    });

    let config = GateConfig {
        tcp_addr: Some(addr),
        ..GateConfig::default()
    };

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            let _ = tokio::signal::ctrl_c().await;
            shutdown.cancel();
        }
    });

    Gate::new(config, builder.build(), log)
        .with_events(events_tx)
        .run(shutdown)
        .await?;

    Ok(())
}
