//! UDP Echo - a datagram gate and a client talking to it.
//!
//! This example demonstrates:
//! - Serving every UDP peer through one socket and one agent
//! - Replying to the sender address carried by `RouteContext`
//! - Writing a custom `Message` with a hand-rolled body
//! - Driving a `UdpClient` with a small agent of its own

use std::sync::Arc;

use leafnet::agent::Agent;
use leafnet::client::{UdpClient, UdpClientConfig};
use leafnet::error::{NetError, Result};
use leafnet::gate::{Gate, GateConfig};
use leafnet::logger::{self, default_logger, Level};
use leafnet::processor::{Message, Processor, ProcessorBuilder};
use leafnet::transport::DatagramConn;
use tokio::sync::oneshot;

/// Big-endian counter.
#[derive(Debug)]
struct Ping {
    value: i32,
}

impl Message for Ping {
    const NAME: &'static str = "Ping";

    fn encode(&self) -> Result<Vec<u8>> {
        Ok(self.value.to_be_bytes().to_vec())
    }

    fn decode(body: &[u8]) -> Result<Self> {
        let bytes: [u8; 4] = body
            .try_into()
            .map_err(|_| NetError::Protocol("ping body must be 4 bytes".to_string()))?;
        Ok(Ping {
            value: i32::from_be_bytes(bytes),
        })
    }
}

/// Sends a few pings and reports the last answer.
struct Pinger {
    conn: Arc<DatagramConn>,
    processor: Processor,
    done: Option<oneshot::Sender<i32>>,
}

impl Agent for Pinger {
    async fn run(&mut self) {
        let mut value = 0;
        for _ in 0..3 {
            let Ok(frame) = self.processor.marshal_merged(&Ping { value }) else {
                return;
            };
            if self.conn.write(None, frame).is_err() {
                return;
            }

            let Ok((reply, _)) = self.conn.read_msg().await else {
                return;
            };
            let Some(pong) = self
                .processor
                .unmarshal(reply)
                .ok()
                .and_then(|decoded| decoded.into_message())
                .and_then(|msg| msg.downcast::<Ping>())
            else {
                return;
            };
            tracing::info!(value = pong.value, "pong");
            value = pong.value;
        }

        if let Some(done) = self.done.take() {
            let _ = done.send(value);
        }
    }
}

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    logger::init(Level::Info, None)?;
    let log = default_logger();

    let mut builder = ProcessorBuilder::new(log.clone());
    builder.register::<Ping>(1);
    builder.set_handler::<Ping, _>(|ping, ctx| {
        let _ = ctx.reply(&Ping {
            value: ping.value + 1,
        });
    });
    let processor = builder.build();

    let config = GateConfig {
        udp_addr: Some("127.0.0.1:0".to_string()),
        ..GateConfig::default()
    };
    let gate = Gate::new(config, processor.clone(), log.clone()).start().await?;
    let gate_addr = gate.udp_addr().ok_or("udp listener did not start")?;

    let (done_tx, done_rx) = oneshot::channel();
    let client = UdpClient::start(
        UdpClientConfig {
            addr: gate_addr.to_string(),
            ..UdpClientConfig::default()
        },
        log,
        {
            let processor = processor.clone();
            move |conn| Pinger {
                conn,
                processor,
                done: Some(done_tx),
            }
        },
    );

    let last = done_rx.await?;
    tracing::info!(last, "done");

    client.close().await;
    gate.close().await;
    Ok(())
}
