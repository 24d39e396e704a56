//! `ban` / `unban` commands

use anyhow::Result;
use clap::Args;
use std::path::PathBuf;
use uvnet_registry::Registry;

use crate::commands::define::finish;
use crate::output::{confirm, print_success};

#[derive(Args)]
pub struct BanArgs {
    /// Target kind: cell, particle, or user
    pub kind: String,

    /// Target name (cell/particle name or user email)
    pub name: String,
}

pub fn execute(args: BanArgs, banned: bool, root: &PathBuf, yes: bool) -> Result<()> {
    let mut registry = Registry::open(root)?;
    let action = if banned { "ban" } else { "unban" };
    if !confirm(&format!("{action} {} {}?", args.kind, args.name), yes) {
        return Ok(());
    }
    match args.kind.as_str() {
        "cell" => registry.ban_cell(&args.name, banned)?,
        "particle" => registry.ban_particle(&args.name, banned)?,
        "user" => registry.ban_user(&args.name, banned)?,
        other => {
            return Err(uvnet_common::Error::InvalidConfig(format!(
                "unknown ban target kind: {other}"
            ))
            .into())
        }
    }
    finish(&mut registry)?;
    print_success(&format!("{} {} {}ned", args.kind, args.name, action));
    Ok(())
}
