use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use chrono::{TimeDelta, Utc};
use clap::{Parser, Subcommand};
use client_core::{
    load_settings, load_settings_from, prepare_database_url, ChatSession, DedupLedger,
    MarkerStore, MemoryNetwork, StaticIdentity,
};
use shared::domain::PeerAddress;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Cli {
    /// Settings file; defaults to ./client.toml when present.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Overrides the markers database from settings.
    #[arg(long)]
    database_url: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Runs a session against an in-process network and prints the result.
    Simulate {
        #[arg(long, default_value_t = 3)]
        peers: u8,
        #[arg(long, default_value_t = 120)]
        history: i64,
    },
    Block {
        address: String,
    },
    Unblock {
        address: String,
    },
    Mute {
        address: String,
    },
    Unmute {
        address: String,
    },
    Markers,
}

fn demo_address(n: u8) -> Result<PeerAddress> {
    Ok(PeerAddress::parse(&format!("0x{:040x}", n))?)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
    let cli = Cli::parse();

    let settings = match &cli.config {
        Some(path) => load_settings_from(path),
        None => load_settings(),
    };
    let database_url = prepare_database_url(
        cli.database_url
            .as_deref()
            .unwrap_or(&settings.markers_database_url),
    )?;
    let markers = Arc::new(
        MarkerStore::connect(&database_url)
            .await
            .with_context(|| format!("failed to open markers at {database_url}"))?,
    );
    info!(%database_url, "sync_demo: markers opened");

    match cli.command {
        Command::Block { address } => {
            markers.block(&PeerAddress::parse(&address)?).await?;
            println!("blocked {address}");
        }
        Command::Unblock { address } => {
            markers.unblock(&PeerAddress::parse(&address)?).await?;
            println!("unblocked {address}");
        }
        Command::Mute { address } => {
            markers.mute(&PeerAddress::parse(&address)?).await?;
            println!("muted {address}");
        }
        Command::Unmute { address } => {
            markers.unmute(&PeerAddress::parse(&address)?).await?;
            println!("unmuted {address}");
        }
        Command::Markers => {
            for address in markers.blocked() {
                println!("blocked {address}");
            }
            for channel in markers.muted() {
                println!("muted {channel}");
            }
        }
        Command::Simulate { peers, history } => {
            simulate(&settings, markers, peers.max(1), history.max(0)).await?;
        }
    }

    Ok(())
}

async fn simulate(
    settings: &client_core::Settings,
    markers: Arc<MarkerStore>,
    peers: u8,
    history: i64,
) -> Result<()> {
    let network = MemoryNetwork::new();
    let local = demo_address(1)?;
    let mut peer_addresses = Vec::new();
    for n in 0..peers {
        let peer = demo_address(n.saturating_add(2))?;
        network.register(&peer);
        let start = Utc::now() - TimeDelta::hours(i64::from(n) + 1);
        for m in 0..history {
            network.post_at(
                &peer,
                &local,
                format!("history {m} from {}", peer.short_label()),
                start + TimeDelta::seconds(m),
            );
        }
        peer_addresses.push(peer);
    }

    let session = ChatSession::from_parts(
        Arc::new(StaticIdentity::new(local.clone())),
        settings,
        Arc::new(DedupLedger::new()),
        Some(markers),
    );
    session.connect(Arc::new(network.client(local.clone()))).await?;

    if let Some(first) = session.state().channels.first().map(|c| c.id.clone()) {
        session.set_current_channel(Some(first.clone())).await?;
        let mut pages = 0;
        while session.load_older_messages().await? > 0 {
            pages += 1;
        }
        println!(
            "loaded {} messages for {} across {} older pages",
            session.state().messages_for(&first).len(),
            first.short_label(),
            pages
        );
        session.send_message(&first, "hello from the demo").await?;
    }

    for peer in &peer_addresses {
        let raw = network.post(peer, &local, "live ping");
        network.redeliver(&raw);
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    let state = session.state();
    for channel in &state.channels {
        println!(
            "{} last_message_at={} unread={} loaded={}",
            channel.id.short_label(),
            channel.last_message_at,
            state.unread(&channel.id),
            state.messages_for(&channel.id).len()
        );
    }
    println!(
        "ledger: {} messages, {} channels",
        session.ledger().seen_message_count(),
        session.ledger().seen_channel_count()
    );
    if let Some(current) = &state.current_channel_id {
        if let Some(last) = state.messages_for(current).last() {
            println!("latest in current channel: {}", serde_json::to_string(last)?);
        }
    }

    session.disconnect().await;
    Ok(())
}
