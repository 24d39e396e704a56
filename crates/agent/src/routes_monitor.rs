//! Kernel route monitor
//!
//! Watches `ip monitor route` from a background task. Each kernel delta sets
//! the service trigger; the spin thread then calls `poll_routes` to diff the
//! current table against a file-persisted snapshot, atomically rewriting the
//! snapshot and reporting the new and gone routes.

use crate::service::AgentService;
use crate::transport::TriggerCondition;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, warn};
use uvnet_common::{exec, Result};

/// Name of the snapshot file inside the agent log directory
pub const ROUTES_FILENAME: &str = "routes.local";

pub struct RoutesMonitor {
    log_dir: PathBuf,
    trigger: TriggerCondition,
    child: Option<tokio::process::Child>,
    reader_task: Option<tokio::task::JoinHandle<()>>,
}

impl RoutesMonitor {
    pub fn new(log_dir: PathBuf, trigger: TriggerCondition) -> Self {
        Self {
            log_dir,
            trigger,
            child: None,
            reader_task: None,
        }
    }

    pub fn routes_file(&self) -> PathBuf {
        self.log_dir.join(ROUTES_FILENAME)
    }

    /// Prime the snapshot and start watching kernel route changes
    pub async fn start(&mut self) -> Result<()> {
        self.poll_routes()?;
        let mut child = tokio::process::Command::new("ip")
            .args(["monitor", "route"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| uvnet_common::Error::Internal("no stdout from ip monitor".into()))?;
        let trigger = self.trigger.clone();
        self.reader_task = Some(tokio::spawn(async move {
            debug!("starting to monitor kernel routes");
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!("route change: {}", line.trim());
                trigger.trigger();
            }
            debug!("route monitor stopped");
        }));
        self.child = Some(child);
        Ok(())
    }

    /// Current kernel routes, as destination prefixes
    fn list_routes() -> Result<BTreeSet<String>> {
        let output = exec::run("ip", &["-4", "route", "list"])?;
        Ok(parse_routes(&output))
    }

    fn read_snapshot(&self) -> BTreeSet<String> {
        let path = self.routes_file();
        if !path.exists() {
            return BTreeSet::new();
        }
        std::fs::read_to_string(&path)
            .map(|content| {
                content
                    .lines()
                    .filter(|l| !l.is_empty())
                    .map(|l| l.to_string())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn write_snapshot(&self, routes: &BTreeSet<String>) -> Result<()> {
        let mut content = String::new();
        for route in routes {
            content.push_str(route);
            content.push('\n');
        }
        exec::write_atomic(&self.routes_file(), content.as_bytes())
    }

    /// Diff the kernel table against the snapshot. Returns (new, gone).
    pub fn poll_routes(&self) -> Result<(BTreeSet<String>, BTreeSet<String>)> {
        let current = match Self::list_routes() {
            Ok(routes) => routes,
            Err(e) => {
                warn!("failed to list kernel routes: {}", e);
                return Ok((BTreeSet::new(), BTreeSet::new()));
            }
        };
        let previous = self.read_snapshot();
        let new: BTreeSet<String> = current.difference(&previous).cloned().collect();
        let gone: BTreeSet<String> = previous.difference(&current).cloned().collect();
        if new.is_empty() && gone.is_empty() {
            return Ok((new, gone));
        }
        self.write_snapshot(&current)?;
        Ok((new, gone))
    }
}

/// Extract destination prefixes from `ip -4 route list` output
pub fn parse_routes(output: &str) -> BTreeSet<String> {
    output
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .filter(|dst| *dst != "default" && dst.contains('/'))
        .map(|dst| dst.to_string())
        .collect()
}

#[async_trait::async_trait]
impl AgentService for RoutesMonitor {
    fn name(&self) -> &'static str {
        "routes-monitor"
    }

    async fn stop(&mut self, _assert_stopped: bool) -> Result<()> {
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
        if let Some(mut child) = self.child.take() {
            child.kill().await.ok();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::WaitSet;

    #[test]
    fn test_parse_routes() {
        let output = "\
default via 192.168.1.1 dev eth0
10.1.0.0/24 dev eth0 proto kernel scope link src 10.1.0.2
10.255.192.2/31 dev uwg-b0 proto kernel scope link
192.168.1.0/24 dev eth0 proto kernel scope link src 192.168.1.10
";
        let routes = parse_routes(output);
        assert_eq!(routes.len(), 3);
        assert!(routes.contains("10.1.0.0/24"));
        assert!(routes.contains("10.255.192.2/31"));
        assert!(!routes.iter().any(|r| r == "default"));
    }

    #[test]
    fn test_snapshot_diff() {
        let dir = tempfile::tempdir().unwrap();
        let waitset = WaitSet::new();
        let monitor = RoutesMonitor::new(
            dir.path().to_path_buf(),
            waitset.new_condition("routes-monitor"),
        );

        let first: BTreeSet<String> =
            ["10.1.0.0/24".to_string(), "10.2.0.0/24".to_string()]
                .into_iter()
                .collect();
        monitor.write_snapshot(&first).unwrap();
        assert_eq!(monitor.read_snapshot(), first);

        let second: BTreeSet<String> =
            ["10.1.0.0/24".to_string(), "10.3.0.0/24".to_string()]
                .into_iter()
                .collect();
        monitor.write_snapshot(&second).unwrap();
        assert_eq!(monitor.read_snapshot(), second);
    }
}
