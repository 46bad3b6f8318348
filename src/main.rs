// src/main.rs
//! snapd - daemon entry point

use anyhow::Result;
use clap::Parser;
use snapd::daemon::{Daemon, DaemonConfig};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "snapd")]
#[command(version)]
#[command(about = "Control-plane daemon for the snap package platform", long_about = None)]
struct Cli {
    /// Unix socket the REST API listens on
    #[arg(long, default_value = "/run/snapd/snapd.sock")]
    socket_path: PathBuf,

    /// Path of the persisted state document
    #[arg(long, default_value = "/var/lib/snapd/state.json")]
    state_path: PathBuf,

    /// Directory snaps are mounted under
    #[arg(long, default_value = "/snap")]
    snap_mount_dir: PathBuf,

    /// Group given ownership of the socket
    #[arg(long)]
    socket_group: Option<String>,

    /// Store id advertised in system-info
    #[arg(long)]
    store_id: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = DaemonConfig::default()
        .with_socket_path(cli.socket_path)
        .with_state_path(cli.state_path)
        .with_snap_mount_dir(cli.snap_mount_dir);
    config.socket_group = cli.socket_group;
    config.store_id = cli.store_id;

    let daemon = Daemon::new(config)?;
    daemon.run().await?;
    Ok(())
}
