//! `show` commands: registry contents

use anyhow::Result;
use clap::Subcommand;
use serde::Serialize;
use std::path::PathBuf;
use uvnet_registry::Registry;

use crate::output::{print_list, OutputFormat, TableDisplay};

#[derive(Subcommand)]
pub enum ShowCommands {
    /// List cells
    Cells,
    /// List particles
    Particles,
    /// List users
    Users,
    /// Show the backbone deployment
    Deployment,
}

#[derive(Serialize)]
struct CellDisplay {
    id: i64,
    name: String,
    address: String,
    lans: String,
    excluded: bool,
}

impl TableDisplay for CellDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["ID", "Name", "Address", "LANs", "Excluded"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.id.to_string(),
            self.name.clone(),
            self.address.clone(),
            self.lans.clone(),
            self.excluded.to_string(),
        ]
    }
}

#[derive(Serialize)]
struct ParticleDisplay {
    id: i64,
    name: String,
    excluded: bool,
}

impl TableDisplay for ParticleDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["ID", "Name", "Excluded"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.id.to_string(),
            self.name.clone(),
            self.excluded.to_string(),
        ]
    }
}

#[derive(Serialize)]
struct UserDisplay {
    id: i64,
    email: String,
    name: String,
    excluded: bool,
}

impl TableDisplay for UserDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["ID", "Email", "Name", "Excluded"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.id.to_string(),
            self.email.clone(),
            self.name.clone(),
            self.excluded.to_string(),
        ]
    }
}

#[derive(Serialize)]
struct LinkDisplay {
    cell: String,
    port: usize,
    local: String,
    peer: String,
    remote: String,
}

impl TableDisplay for LinkDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["Cell", "Port", "Local", "Peer", "Remote"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.cell.clone(),
            self.port.to_string(),
            self.local.clone(),
            self.peer.clone(),
            self.remote.clone(),
        ]
    }
}

pub fn execute(cmd: ShowCommands, root: &PathBuf, format: OutputFormat) -> Result<()> {
    let registry = Registry::open_readonly(root)?;
    match cmd {
        ShowCommands::Cells => {
            let cells: Vec<CellDisplay> = registry
                .all_cells()?
                .into_values()
                .map(|c| CellDisplay {
                    id: c.id,
                    name: c.name.clone(),
                    address: c.address.clone().unwrap_or_else(|| "private".into()),
                    lans: c
                        .allowed_lans
                        .iter()
                        .map(|l| l.to_string())
                        .collect::<Vec<_>>()
                        .join(", "),
                    excluded: c.excluded,
                })
                .collect();
            print_list(&cells, format);
        }
        ShowCommands::Particles => {
            let particles: Vec<ParticleDisplay> = registry
                .all_particles()?
                .into_values()
                .map(|p| ParticleDisplay {
                    id: p.id,
                    name: p.name,
                    excluded: p.excluded,
                })
                .collect();
            print_list(&particles, format);
        }
        ShowCommands::Users => {
            let users: Vec<UserDisplay> = registry
                .users()?
                .into_values()
                .map(|u| UserDisplay {
                    id: u.id,
                    email: u.email,
                    name: u.name,
                    excluded: u.excluded,
                })
                .collect();
            print_list(&users, format);
        }
        ShowCommands::Deployment => {
            let cells = registry.all_cells()?;
            let name_of = |id: i64| {
                cells
                    .get(&id)
                    .map(|c| c.name.clone())
                    .unwrap_or_else(|| id.to_string())
            };
            let mut links = Vec::new();
            if let Some(deployment) = registry.deployment() {
                for (cell_id, peer) in &deployment.peers {
                    for (remote_id, link) in &peer.peers {
                        links.push(LinkDisplay {
                            cell: name_of(*cell_id),
                            port: link.port_index,
                            local: link.addr_local.to_string(),
                            peer: name_of(*remote_id),
                            remote: link.addr_remote.to_string(),
                        });
                    }
                }
            }
            print_list(&links, format);
        }
    }
    Ok(())
}
