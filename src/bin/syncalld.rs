use anyhow::{Context, Result};
use clap::Parser;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::mpsc;
use tracing_subscriber::EnvFilter;

use syncall::config::{config_dir, SyncConfig};
use syncall::node::SyncNode;

/// Keep a directory in sync with every syncall peer on the LAN
#[derive(Clone, Debug, Parser)]
#[command(version)]
struct DaemonOpts {
    /// Directory to synchronize
    #[arg(long)]
    root: Option<PathBuf>,

    /// TOML config file (default: <config dir>/syncall.toml if present)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Control channel port
    #[arg(long)]
    port: Option<u16>,

    /// Transfer channel port
    #[arg(long)]
    transfer_port: Option<u16>,

    /// Broadcast address for discovery
    #[arg(long)]
    broadcast: Option<IpAddr>,

    /// Seconds between rescans of the directory
    #[arg(long)]
    rescan_interval: Option<u64>,
}

fn load_config(opts: &DaemonOpts) -> Result<SyncConfig> {
    let mut config = match &opts.config {
        Some(path) => SyncConfig::load(path)?,
        None => {
            let default = config_dir().join("syncall.toml");
            if default.is_file() {
                SyncConfig::load(&default)?
            } else {
                SyncConfig::default()
            }
        }
    };

    if let Some(root) = &opts.root {
        config.root = root.clone();
    }
    if let Some(port) = opts.port {
        config.control_port = port;
        config.discovery_port = port;
    }
    if let Some(port) = opts.transfer_port {
        config.transfer_port = port;
    }
    if let Some(broadcast) = opts.broadcast {
        config.broadcast_address = broadcast;
    }
    if let Some(secs) = opts.rescan_interval {
        config.rescan_interval_secs = secs;
    }
    Ok(config)
}

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let opts = DaemonOpts::parse();
    let config = load_config(&opts)?;

    if !config.root.is_dir() {
        anyhow::bail!("root directory does not exist: {}", config.root.display());
    }

    let node = SyncNode::start(config).context("failed to start sync node")?;

    let (stop_tx, stop_rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = stop_tx.send(());
    })
    .context("set Ctrl-C handler")?;

    let _ = stop_rx.recv();
    tracing::info!("interrupted, shutting down");
    node.shutdown();
    Ok(())
}
