//! `service` commands: run the agent in the background

use anyhow::Result;
use clap::Subcommand;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use uvnet_common::Error;

use crate::output::print_success;

#[derive(Subcommand)]
pub enum ServiceCommands {
    /// Start the agent as a background process
    Up {
        /// Do not touch kernel networking
        #[arg(long)]
        no_net: bool,
    },
    /// Stop the background agent
    Down,
}

fn pid_file(root: &PathBuf) -> PathBuf {
    root.join("agent.pid")
}

pub fn execute(cmd: ServiceCommands, root: &PathBuf) -> Result<()> {
    match cmd {
        ServiceCommands::Up { no_net } => {
            let pid_path = pid_file(root);
            if let Ok(content) = std::fs::read_to_string(&pid_path) {
                if let Ok(pid) = content.trim().parse::<i32>() {
                    if kill(Pid::from_raw(pid), None).is_ok() {
                        return Err(Error::AgentAlreadyRunning(pid).into());
                    }
                }
            }
            let exe = std::env::current_exe()?;
            let agent = exe
                .parent()
                .map(|dir| dir.join("uvnet-agent"))
                .filter(|p| p.exists())
                .unwrap_or_else(|| PathBuf::from("uvnet-agent"));
            let mut command = Command::new(agent);
            command
                .arg("--root")
                .arg(root)
                .arg("--pid-file")
                .arg(&pid_path)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null());
            if no_net {
                command.arg("--no-net");
            }
            let child = command.spawn()?;
            print_success(&format!("agent started [{}]", child.id()));
        }
        ServiceCommands::Down => {
            let pid_path = pid_file(root);
            let content = std::fs::read_to_string(&pid_path).map_err(|_| Error::NotFound {
                kind: "agent".into(),
                id: root.display().to_string(),
            })?;
            let pid: i32 = content.trim().parse().map_err(|_| {
                Error::InvalidConfig(format!("corrupt PID file: {}", pid_path.display()))
            })?;
            kill(Pid::from_raw(pid), Signal::SIGINT)
                .map_err(|e| Error::Internal(format!("failed to signal agent {pid}: {e}")))?;
            print_success(&format!("agent stopping [{}]", pid));
        }
    }
    Ok(())
}
