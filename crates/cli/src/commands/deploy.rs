//! Deployment and rekey commands

use anyhow::Result;
use clap::{Args, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use uvnet_agent::agent::{Agent, AgentOptions, SpinUntil};
use uvnet_registry::{package, Registry};

use crate::commands::define::finish;
use crate::output::{confirm, print_success};

#[derive(Args)]
pub struct RedeployArgs {
    /// Keep the existing backbone keys
    #[arg(long)]
    pub keep_keys: bool,
}

pub fn redeploy(args: RedeployArgs, root: &PathBuf, yes: bool) -> Result<()> {
    let mut registry = Registry::open(root)?;
    if !confirm(
        &format!("generate a new backbone deployment for uvn {}?", registry.uvn.name),
        yes,
    ) {
        return Ok(());
    }
    registry.redeploy(!args.keep_keys)?;
    finish(&mut registry)?;
    print_success("backbone deployment regenerated");
    Ok(())
}

#[derive(Subcommand)]
pub enum RekeyCommands {
    /// Drop and regenerate every key of the uvn
    Uvn,

    /// Rekey one cell
    Cell {
        /// Cell name
        name: String,

        /// Rekey the cell's root VPN key
        #[arg(long)]
        root_vpn: bool,

        /// Rekey the cell's particles VPN
        #[arg(long)]
        particles_vpn: bool,
    },

    /// Rekey one particle across every cell
    Particle {
        /// Particle name
        name: String,
    },
}

pub fn rekey(cmd: RekeyCommands, root: &PathBuf, yes: bool) -> Result<()> {
    let mut registry = Registry::open(root)?;
    match cmd {
        RekeyCommands::Uvn => {
            if !confirm(
                &format!("drop and regenerate all vpn keys for uvn {}?", registry.uvn.name),
                yes,
            ) {
                return Ok(());
            }
            registry.rekey_uvn()?;
        }
        RekeyCommands::Cell {
            name,
            root_vpn,
            particles_vpn,
        } => {
            if !confirm(&format!("drop and regenerate vpn keys for cell {name}?"), yes) {
                return Ok(());
            }
            registry.rekey_cell(&name, root_vpn, particles_vpn)?;
        }
        RekeyCommands::Particle { name } => {
            if !confirm(
                &format!("drop and regenerate vpn keys for particle {name}?"),
                yes,
            ) {
                return Ok(());
            }
            registry.rekey_particle(&name)?;
        }
    }
    package::export_cell_packages(&registry)?;
    print_success("rekey staged; run sync to push the new configuration");
    Ok(())
}

#[derive(Args)]
pub struct SyncArgs {
    /// Give up after this many seconds
    #[arg(long, default_value = "3600")]
    pub max_wait_time: u64,

    /// Wait only for configuration consistency, not full routing
    #[arg(long)]
    pub config_only: bool,

    /// Do not touch kernel networking
    #[arg(long)]
    pub no_net: bool,
}

/// Push the current configuration and wait for the uvn to converge
pub async fn sync(args: SyncArgs, root: &PathBuf) -> Result<()> {
    let rekey_pending = Registry::open(root)?.rekeyed_root();
    let mut options = AgentOptions::new(root.clone());
    options.enable_net = !args.no_net;
    let mut agent = Agent::open(options)?;
    agent.start().await?;
    agent.publish_packages().await?;

    let until = if rekey_pending {
        SpinUntil::RekeyConverged
    } else if args.config_only {
        SpinUntil::ConsistentConfig
    } else {
        SpinUntil::ConsistentAndRouted
    };
    let result = agent
        .spin(until, Some(Duration::from_secs(args.max_wait_time)))
        .await;
    agent.stop(result.is_err()).await?;
    result?;
    print_success("uvn synchronized");
    Ok(())
}
