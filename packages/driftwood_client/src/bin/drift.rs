//! `drift`: command-line companion for the Driftwood gallery server.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::prelude::*;

use driftwood_client::config::{self, DriftConfig, FileConfig};
use driftwood_client::events::{ConnectionManager, SseTransport};
use driftwood_client::identity::{ClientIdentity, LegacyTokenFile, WindowTokenStore};
use driftwood_client::presence::{DetachedHttpSender, PresenceLease, PresenceSignal};

#[derive(Parser)]
#[command(name = "drift", about = "Driftwood gallery client")]
struct Cli {
    /// Data directory (config.toml, migration state). Defaults to the
    /// platform-local data dir.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Connect the update channel and print events until Ctrl-C
    Tail {
        /// Hold a presence lease on this gallery while tailing
        #[arg(long)]
        gallery: Option<String>,
    },
    /// Print the resolved configuration
    Status,
}

fn resolve_data_dir(cli: &Cli) -> PathBuf {
    cli.data_dir.clone().unwrap_or_else(|| {
        dirs::data_local_dir()
            .map(|dir| dir.join("driftwood"))
            .unwrap_or_else(|| PathBuf::from("."))
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let cli = Cli::parse();
    let data_dir = resolve_data_dir(&cli);
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("failed to create data dir: {}", data_dir.display()))?;

    let fc: FileConfig = config::load_config(&data_dir)
        .extract()
        .context("invalid configuration")?;
    let config = DriftConfig::from_file(data_dir, &fc);

    match cli.command {
        Command::Status => status(&config),
        Command::Tail { gallery } => tail(&config, gallery).await,
    }
}

fn status(config: &DriftConfig) -> Result<()> {
    println!("server:       {}", config.base_url);
    println!("events:       {}", config.events_url());
    println!(
        "reconnect:    base {}ms, {} attempts, ceiling {}ms",
        config.base_delay.as_millis(),
        config.max_attempts,
        config.max_delay.as_millis()
    );
    println!(
        "admission:    folders={} thumb={} file={}",
        config.admission_limits.folders, config.admission_limits.thumb, config.admission_limits.file
    );
    println!("lease ttl:    {}s", config.lease_ttl.as_secs());
    Ok(())
}

async fn tail(config: &DriftConfig, gallery: Option<String>) -> Result<()> {
    let client = reqwest::Client::new();

    let identity = ClientIdentity::new(
        Box::new(WindowTokenStore::new()),
        Some(Box::new(LegacyTokenFile::new(&config.data_dir))),
    );
    let client_id = identity.token();
    eprintln!("Connecting as {client_id}...");

    let manager = ConnectionManager::new(
        config.channel_config(&client_id),
        Arc::new(SseTransport::new(client.clone())),
    );
    manager.subscribe_status(|status| eprintln!("[channel: {status}]"));
    manager.subscribe_events(|event| match serde_json::to_string(event) {
        Ok(line) => println!("{line}"),
        Err(err) => eprintln!("[unprintable event: {err}]"),
    });
    manager.connect();

    let lease = gallery.map(|gallery_id| {
        PresenceLease::acquire(
            client.clone(),
            config.presence_enter_url(),
            gallery_id,
            client_id.clone(),
            config.lease_ttl,
        )
    });

    tokio::signal::ctrl_c()
        .await
        .context("failed to wait for Ctrl-C")?;

    if let Some(lease) = lease {
        let signal = PresenceSignal::new(
            config.presence_leave_url(),
            None,
            Arc::new(DetachedHttpSender::new(client.clone())),
        );
        lease.release(&signal);
    }
    if manager.polling_enabled() {
        eprintln!("[channel had degraded to polling]");
    }
    manager.disconnect();

    // Give the detached leave notice a beat to get on the wire.
    tokio::time::sleep(std::time::Duration::from_millis(300)).await;
    eprintln!("\n[drift: disconnected]");
    Ok(())
}
