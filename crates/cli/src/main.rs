//! uvnet CLI - Main Entry Point
//!
//! Administers a uvn registry: define entities, ban them, redeploy the
//! backbone, push configurations to cells, and run the local agent.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;
mod output;

use commands::{ban, define, deploy, service, show};

/// uvnet CLI - WireGuard overlay registry and agents
#[derive(Parser)]
#[command(name = "uvnet")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Registry or agent root directory
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Output format
    #[arg(long, default_value = "table", global = true)]
    format: output::OutputFormat,

    /// Skip confirmation prompts
    #[arg(short, long, global = true)]
    yes: bool,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Define uvn entities
    #[command(subcommand)]
    Define(define::DefineCommands),

    /// Exclude a cell, particle or user from the uvn
    Ban(ban::BanArgs),

    /// Re-admit a banned cell, particle or user
    Unban(ban::BanArgs),

    /// Regenerate the backbone deployment
    Redeploy(deploy::RedeployArgs),

    /// Drop and regenerate key material
    #[command(subcommand)]
    Rekey(deploy::RekeyCommands),

    /// Push configurations and wait for the uvn to converge
    Sync(deploy::SyncArgs),

    /// Manage the background agent process
    #[command(subcommand)]
    Service(service::ServiceCommands),

    /// Run the agent in the foreground
    Agent {
        /// Do not touch kernel networking
        #[arg(long)]
        no_net: bool,

        /// Start even if some allowed LANs were not detected locally
        #[arg(long)]
        allow_invalid_lans: bool,
    },

    /// Inspect registry contents
    #[command(subcommand)]
    Show(show::ShowCommands),
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_target(false)
        .init();

    let root = cli.root.clone().unwrap_or_else(uvnet_common::default_root_path);

    let result = match cli.command {
        Commands::Define(cmd) => define::execute(cmd, &root, cli.yes),
        Commands::Ban(args) => ban::execute(args, true, &root, cli.yes),
        Commands::Unban(args) => ban::execute(args, false, &root, cli.yes),
        Commands::Redeploy(args) => deploy::redeploy(args, &root, cli.yes),
        Commands::Rekey(cmd) => deploy::rekey(cmd, &root, cli.yes),
        Commands::Sync(args) => deploy::sync(args, &root).await,
        Commands::Service(cmd) => service::execute(cmd, &root),
        Commands::Agent {
            no_net,
            allow_invalid_lans,
        } => {
            let mut options = uvnet_agent::AgentOptions::new(root.clone());
            options.enable_net = !no_net;
            options.allow_invalid_lans = allow_invalid_lans;
            uvnet_agent::agent::run(options).await.map_err(Into::into)
        }
        Commands::Show(cmd) => show::execute(cmd, &root, cli.format),
    };

    if let Err(e) = result {
        eprintln!("error: {e}");
        let code = e
            .downcast_ref::<uvnet_common::Error>()
            .map(|e| e.exit_code())
            .unwrap_or(1);
        std::process::exit(code);
    }
}
