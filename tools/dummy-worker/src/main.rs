//! Simulated worker.
//!
//! Accepts the flags the manager launches workers with, dials the manager's
//! heartbeat endpoint and sends one heartbeat per tick, with counts rising
//! to ten and falling back to zero. With `--crash-chance` it exits with an
//! error now and then so reclamation can be watched end to end.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use lift_id::WorkerId;
use lift_proto::HeartbeatMessage;
use rand::Rng;
use tokio_tungstenite::tungstenite::Message;
use tracing::{info, warn};

const MAX_COUNT: i64 = 10;

#[derive(Debug, Parser)]
#[command(name = "lift-dummy-worker", version, about = "Simulated lift worker")]
struct Args {
    /// Address to listen on.
    #[arg(short = 'a', default_value = "127.0.0.1")]
    address: String,

    /// Port to listen on.
    #[arg(short = 'p', default_value_t = 7777)]
    port: u16,

    /// Worker id assigned by the manager.
    #[arg(short = 'u')]
    id: WorkerId,

    /// Manager WebSocket base URL.
    #[arg(long, env = "LIFT_MANAGER_URL", default_value = "ws://127.0.0.1:9990")]
    manager: String,

    /// Milliseconds between heartbeats.
    #[arg(long, default_value_t = 1000)]
    interval_ms: u64,

    /// Percent chance per tick of exiting with an error.
    #[arg(long, default_value_t = 1)]
    crash_chance: u8,
}

/// Counts bounce between zero and [`MAX_COUNT`].
fn next_count(count: i64, step: i64) -> (i64, i64) {
    let step = if count >= MAX_COUNT {
        -1
    } else if count <= 0 {
        1
    } else {
        step
    };
    (count + step, step)
}

fn connect_url(manager: &str, id: &WorkerId) -> String {
    format!("{}/connect/{}", manager.trim_end_matches('/'), id)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    info!(
        address = %args.address,
        port = args.port,
        worker_id = %args.id,
        "Dummy worker starting"
    );

    let url = connect_url(&args.manager, &args.id);
    let (socket, _) = tokio_tungstenite::connect_async(url.as_str())
        .await
        .with_context(|| format!("connecting to {url}"))?;
    let (mut sink, mut stream) = socket.split();

    let mut ticker = tokio::time::interval(Duration::from_millis(args.interval_ms.max(1)));
    let mut count = 0;
    let mut step = 1;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            frame = stream.next() => match frame {
                Some(Ok(Message::Close(_))) | None => {
                    info!("Manager closed the connection");
                    return Ok(());
                }
                Some(Err(e)) => return Err(e).context("reading from manager"),
                Some(Ok(_)) => continue,
            },
        }

        if rand::rng().random_range(0..100u8) < args.crash_chance {
            warn!("Simulated crash");
            bail!("simulated crash");
        }

        let message = HeartbeatMessage::report(&args.id, count, count, count).encode()?;
        sink.send(Message::text(message))
            .await
            .context("sending heartbeat")?;
        info!(count, "Sent heartbeat");

        (count, step) = next_count(count, step);
    }
}
