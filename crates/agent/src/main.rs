//! uvnet agent daemon
//!
//! Runs the cell (or registry) agent: brings up tunnels, announces status,
//! and reloads itself when the registry publishes a new configuration.

use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use uvnet_agent::agent::{run, AgentOptions};

#[derive(Parser)]
#[command(name = "uvnet-agent")]
#[command(about = "uvnet agent - WireGuard overlay cell daemon")]
#[command(version)]
struct Cli {
    /// Agent root directory
    #[arg(short, long)]
    root: Option<PathBuf>,

    /// PID file location
    #[arg(long)]
    pid_file: Option<PathBuf>,

    /// Do not touch kernel networking (tunnels, iptables, router config)
    #[arg(long)]
    no_net: bool,

    /// Start even if some allowed LANs were not detected locally
    #[arg(long)]
    allow_invalid_lans: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    info!("uvnet agent v{}", env!("CARGO_PKG_VERSION"));
    let root = cli.root.unwrap_or_else(uvnet_common::default_root_path);

    // Flags override the optional agent.toml
    let config = uvnet_agent::config::AgentConfig::load_root(&root)?;
    let mut options = AgentOptions::new(root);
    options.pid_file = cli.pid_file.or(config.pid_file);
    options.enable_net = !cli.no_net && config.enable_net;
    options.allow_invalid_lans = cli.allow_invalid_lans || config.allow_invalid_lans;
    options.transport_port = config.transport_port;
    run(options).await?;

    info!("agent shutdown complete");
    Ok(())
}
