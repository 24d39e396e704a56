//! `define` commands: create or update uvn entities

use anyhow::Result;
use clap::Subcommand;
use ipnetwork::Ipv4Network;
use std::collections::BTreeSet;
use std::path::PathBuf;
use uvnet_common::types::{CellSettings, DeploymentStrategyKind, TimingProfile, UvnSettings};
use uvnet_registry::{package, Registry};

use crate::output::print_success;

#[derive(Subcommand)]
pub enum DefineCommands {
    /// Initialize a new uvn registry
    Uvn {
        /// UVN name
        #[arg(short, long)]
        name: String,

        /// Owner, as `Full Name <email>` or a bare email
        #[arg(short, long)]
        owner: String,

        /// Owner password
        #[arg(short, long)]
        password: String,

        /// Public address of the registry
        #[arg(short, long)]
        address: Option<String>,

        /// Timing profile (default, fast)
        #[arg(long, default_value = "default")]
        timing: String,

        /// Backbone deployment strategy
        /// (full_mesh, circular, crossed, random, static)
        #[arg(long)]
        strategy: Option<String>,

        /// Extra strategy arguments, as JSON
        #[arg(long)]
        strategy_args: Option<String>,
    },

    /// Define or update a cell
    Cell {
        /// Cell name
        #[arg(short, long)]
        name: String,

        /// Public address; omit for a private cell
        #[arg(short, long)]
        address: Option<String>,

        /// LAN subnets the cell exports (repeatable)
        #[arg(short, long)]
        lan: Vec<Ipv4Network>,

        /// Owning user email
        #[arg(short, long)]
        owner: Option<String>,

        /// Disable the particles VPN on this cell
        #[arg(long)]
        no_particles_vpn: bool,

        /// Update an existing cell instead of creating one
        #[arg(long)]
        update: bool,

        /// Delete the cell
        #[arg(long, conflicts_with = "update")]
        delete: bool,
    },

    /// Define or delete a particle
    Particle {
        /// Particle name
        #[arg(short, long)]
        name: String,

        /// Owning user email
        #[arg(short, long)]
        owner: Option<String>,

        /// Delete the particle
        #[arg(long)]
        delete: bool,
    },

    /// Define or delete a user
    User {
        /// User email
        #[arg(short, long)]
        email: String,

        /// Display name
        #[arg(short, long, default_value = "")]
        name: String,

        /// Password
        #[arg(short, long, default_value = "")]
        password: String,

        /// Delete the user
        #[arg(long)]
        delete: bool,
    },
}

pub fn execute(cmd: DefineCommands, root: &PathBuf, yes: bool) -> Result<()> {
    match cmd {
        DefineCommands::Uvn {
            name,
            owner,
            password,
            address,
            timing,
            strategy,
            strategy_args,
        } => {
            let mut settings = UvnSettings::default();
            settings.timing_profile = match timing.as_str() {
                "default" => TimingProfile::Default,
                "fast" => TimingProfile::Fast,
                other => {
                    return Err(uvnet_common::Error::InvalidConfig(format!(
                        "unknown timing profile: {other}"
                    ))
                    .into())
                }
            };
            if let Some(strategy) = strategy {
                settings.backbone_vpn.deployment_strategy = parse_strategy(&strategy)?;
            }
            if let Some(args) = strategy_args {
                settings.backbone_vpn.deployment_strategy_args = serde_json::from_str(&args)
                    .map_err(|e| {
                        uvnet_common::Error::InvalidConfig(format!(
                            "invalid strategy arguments: {e}"
                        ))
                    })?;
            }
            let registry = Registry::create(root, &name, &owner, &password, address, settings)?;
            package::export_cell_packages(&registry)?;
            print_success(&format!("initialized uvn {name} in {}", root.display()));
        }

        DefineCommands::Cell {
            name,
            address,
            lan,
            owner,
            no_particles_vpn,
            update,
            delete,
        } => {
            let mut registry = Registry::open(root)?;
            if delete {
                if !crate::output::confirm(
                    &format!("delete cell {name} from uvn {}?", registry.uvn.name),
                    yes,
                ) {
                    return Ok(());
                }
                registry.delete_cell(&name)?;
            } else if update {
                let lans: Option<BTreeSet<Ipv4Network>> = if lan.is_empty() {
                    None
                } else {
                    Some(lan.into_iter().collect())
                };
                registry.update_cell(&name, owner.as_deref(), address.map(Some), lans, None)?;
            } else {
                let settings = CellSettings {
                    enable_particles_vpn: !no_particles_vpn,
                    ..Default::default()
                };
                registry.add_cell(
                    &name,
                    owner.as_deref(),
                    address,
                    lan.into_iter().collect(),
                    settings,
                )?;
            }
            finish(&mut registry)?;
            print_success(&format!("cell {name} {}", verb(update, delete)));
        }

        DefineCommands::Particle {
            name,
            owner,
            delete,
        } => {
            let mut registry = Registry::open(root)?;
            if delete {
                if !crate::output::confirm(
                    &format!("delete particle {name} from uvn {}?", registry.uvn.name),
                    yes,
                ) {
                    return Ok(());
                }
                registry.delete_particle(&name)?;
            } else {
                registry.add_particle(&name, owner.as_deref())?;
            }
            finish(&mut registry)?;
            print_success(&format!("particle {name} {}", verb(false, delete)));
        }

        DefineCommands::User {
            email,
            name,
            password,
            delete,
        } => {
            let mut registry = Registry::open(root)?;
            if delete {
                if !crate::output::confirm(&format!("delete user {email}?"), yes) {
                    return Ok(());
                }
                registry.delete_user(&email)?;
            } else {
                registry.add_user(&email, &name, &password)?;
            }
            finish(&mut registry)?;
            print_success(&format!("user {email} {}", verb(false, delete)));
        }
    }
    Ok(())
}

pub fn parse_strategy(raw: &str) -> Result<DeploymentStrategyKind> {
    Ok(match raw {
        "full_mesh" | "full-mesh" => DeploymentStrategyKind::FullMesh,
        "circular" => DeploymentStrategyKind::Circular,
        "crossed" => DeploymentStrategyKind::Crossed,
        "random" => DeploymentStrategyKind::Random,
        "static" => DeploymentStrategyKind::Static,
        other => {
            return Err(uvnet_common::Error::InvalidConfig(format!(
                "unknown deployment strategy: {other}"
            ))
            .into())
        }
    })
}

fn verb(update: bool, delete: bool) -> &'static str {
    if delete {
        "deleted"
    } else if update {
        "updated"
    } else {
        "defined"
    }
}

/// Regenerate derived state and re-export packages after a mutation
pub fn finish(registry: &mut Registry) -> Result<()> {
    registry.generate()?;
    package::export_cell_packages(registry)?;
    Ok(())
}
