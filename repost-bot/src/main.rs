//! repost-bot: keeps one self-healing IRC session per configured network.
//!
//! Every inbound line is logged; server `PING`s are answered so the
//! session isn't dropped. Command handling lives elsewhere and plugs in as
//! another consumer of the inbound stream.

mod config;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use repost_irc::{ConnectionHandle, Error, Event, Inbound, Message};
use tokio::sync::broadcast;
use tokio::task::JoinSet;

use crate::config::Config;

#[derive(Parser)]
#[command(name = "repost-bot", about = "Self-healing multi-network IRC bot")]
struct Args {
    /// Config file (default: ~/.config/repost/config.toml)
    #[arg(long, env = "REPOST_CONFIG")]
    config: Option<PathBuf>,

    /// Only connect to these networks (repeatable)
    #[arg(long = "network")]
    networks: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "repost_bot=info,repost_irc=info".into()),
        )
        .init();

    let args = Args::parse();
    let path = args.config.unwrap_or_else(config::default_path);
    let config = Config::load(&path)?;

    let mut tasks = JoinSet::new();
    for network in &config.networks {
        if !args.networks.is_empty() && !args.networks.contains(&network.name) {
            continue;
        }
        tracing::info!(
            network = %network.name,
            nick = %network.nick,
            servers = network.servers.len(),
            "Starting session"
        );
        let (handle, inbound, events) = repost_irc::connect(network.connect_config(&config.reconnect))
            .with_context(|| format!("can't start network {}", network.name))?;
        tasks.spawn(log_events(network.name.clone(), events));
        tasks.spawn(keepalive(handle, inbound));
    }
    if tasks.is_empty() {
        anyhow::bail!("no configured network matches {:?}", args.networks);
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    Ok(())
}

/// Answer server PINGs for one network's session.
async fn keepalive(handle: ConnectionHandle, mut inbound: Inbound) {
    while let Some(msg) = inbound.recv().await {
        let Some(reply) = pong_for(&msg) else {
            continue;
        };
        match handle.send(reply).await {
            Ok(()) => {}
            Err(Error::Closed) => return,
            Err(e) => tracing::warn!(network = %handle.network(), error = %e, "Can't queue PONG"),
        }
    }
}

fn pong_for(msg: &Message) -> Option<Message> {
    if msg.command != "PING" {
        return None;
    }
    let token = msg
        .trailing
        .as_deref()
        .or_else(|| msg.params.first().map(String::as_str));
    Some(Message::pong(token))
}

async fn log_events(network: String, mut events: broadcast::Receiver<Event>) {
    loop {
        match events.recv().await {
            Ok(Event::DialFailed {
                server,
                error,
                retry_in,
            }) => tracing::warn!(
                %network,
                %server,
                %error,
                retry_ms = retry_in.as_millis() as u64,
                "Dial failed"
            ),
            Ok(Event::Disconnected { generation, dropped }) if dropped > 0 => tracing::warn!(
                %network,
                generation,
                dropped,
                "Session lost with unsent messages"
            ),
            Ok(event) => tracing::debug!(%network, ?event, "Lifecycle event"),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!(%network, skipped = n, "Missed lifecycle events");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}
