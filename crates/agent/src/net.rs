//! Kernel network orchestration
//!
//! Brings up the agent's WireGuard interfaces and the iptables rules around
//! them: IPv4 forwarding, a TCP-MSS clamp on FORWARD, and MASQUERADE rules
//! for interfaces flagged by the configurator. Everything installed at start
//! is recorded and torn down in reverse order at stop; teardown failures are
//! logged without aborting the remaining teardown.

use crate::service::AgentService;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};
use uvnet_common::{exec, Error, Result};
use uvnet_registry::WgConfig;

/// Injectable command runner; the default shells out
pub type CommandRunner = Arc<dyn Fn(&str, &[&str]) -> Result<String> + Send + Sync>;

pub fn system_runner() -> CommandRunner {
    Arc::new(|program, args| exec::run(program, args))
}

struct TeardownStep {
    program: String,
    args: Vec<String>,
}

pub struct UvnNet {
    configs: Vec<WgConfig>,
    /// Names of the LAN interfaces, for cross-MASQUERADE rules
    lan_interfaces: Vec<String>,
    config_dir: PathBuf,
    runner: CommandRunner,
    teardown: Vec<TeardownStep>,
}

impl UvnNet {
    pub fn new(
        configs: Vec<WgConfig>,
        lan_interfaces: Vec<String>,
        config_dir: PathBuf,
        runner: CommandRunner,
    ) -> Self {
        Self {
            configs,
            lan_interfaces,
            config_dir,
            runner,
            teardown: Vec::new(),
        }
    }

    fn run(&self, program: &str, args: &[&str]) -> Result<String> {
        (self.runner)(program, args)
    }

    /// Run a setup command, registering its inverse for teardown
    fn run_reversible(
        &mut self,
        program: &str,
        args: &[&str],
        undo: Option<(&str, Vec<String>)>,
    ) -> Result<()> {
        self.run(program, args)?;
        if let Some((undo_program, undo_args)) = undo {
            self.teardown.push(TeardownStep {
                program: undo_program.to_string(),
                args: undo_args,
            });
        }
        Ok(())
    }

    fn all_interface_names(&self) -> Vec<String> {
        let mut names = self.lan_interfaces.clone();
        names.extend(self.configs.iter().map(|c| c.intf.name.clone()));
        names
    }

    /// Bring up forwarding, the MSS clamp, and every tunnel
    pub fn start(&mut self) -> Result<()> {
        self.run("sysctl", &["-w", "net.ipv4.ip_forward=1"])?;

        let clamp = [
            "-t", "mangle", "-A", "FORWARD", "-p", "tcp", "--tcp-flags", "SYN,RST", "SYN", "-j",
            "TCPMSS", "--clamp-mss-to-pmtu",
        ];
        let mut unclamp: Vec<String> = clamp.iter().map(|s| s.to_string()).collect();
        unclamp[2] = "-D".to_string();
        self.run_reversible("iptables", &clamp, Some(("iptables", unclamp)))?;

        for i in 0..self.configs.len() {
            self.start_interface(i)?;
        }
        Ok(())
    }

    fn start_interface(&mut self, index: usize) -> Result<()> {
        let config = self.configs[index].clone();
        let name = config.intf.name.clone();
        debug!("bringing up tunnel: {}", name);

        self.run_reversible(
            "ip",
            &["link", "add", &name, "type", "wireguard"],
            Some(("ip", vec!["link".into(), "del".into(), name.clone()])),
        )?;

        let config_file = self.config_dir.join(format!("{}.conf", name));
        exec::write_private(&config_file, config.render_setconf().as_bytes())?;
        let config_path = config_file.to_string_lossy().into_owned();
        self.run("wg", &["setconf", &name, &config_path])?;

        let address = format!("{}/{}", config.intf.address, config.intf.subnet.prefix());
        self.run("ip", &["-4", "address", "add", &address, "dev", &name])?;
        self.run("ip", &["link", "set", "up", "dev", &name])?;

        if config.intf.masquerade {
            let subnet = config.intf.subnet.to_string();
            self.masquerade_rule(&["-o", &name])?;
            for other in self.all_interface_names() {
                if other == name {
                    continue;
                }
                self.masquerade_rule(&["-s", &subnet, "-o", &other])?;
            }
        }
        Ok(())
    }

    fn masquerade_rule(&mut self, selector: &[&str]) -> Result<()> {
        let mut args: Vec<&str> = vec!["-t", "nat", "-A", "POSTROUTING"];
        args.extend_from_slice(selector);
        args.extend_from_slice(&["-j", "MASQUERADE"]);
        let mut undo: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        undo[2] = "-D".to_string();
        self.run_reversible("iptables", &args, Some(("iptables", undo)))
    }

    fn stop_sync(&mut self, assert_stopped: bool) -> Result<()> {
        let mut failures = Vec::new();
        while let Some(step) = self.teardown.pop() {
            let args: Vec<&str> = step.args.iter().map(|s| s.as_str()).collect();
            if let Err(e) = self.run(&step.program, &args) {
                warn!("teardown step failed: {} {}: {}", step.program, step.args.join(" "), e);
                failures.push(format!("{} {}: {}", step.program, step.args.join(" "), e));
            }
        }
        if failures.is_empty() {
            Ok(())
        } else if assert_stopped {
            Err(Error::StopAgentService(failures))
        } else {
            Err(Error::CommandFailed(failures.remove(0)))
        }
    }
}

#[async_trait::async_trait]
impl AgentService for UvnNet {
    fn name(&self) -> &'static str {
        "net"
    }

    async fn stop(&mut self, assert_stopped: bool) -> Result<()> {
        self.stop_sync(assert_stopped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::net::Ipv4Addr;
    use uvnet_registry::{WgInterfaceConfig, WgPeerConfig};

    fn recording_runner() -> (CommandRunner, Arc<Mutex<Vec<String>>>) {
        let log: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let recorded = log.clone();
        let runner: CommandRunner = Arc::new(move |program, args| {
            recorded.lock().push(format!("{} {}", program, args.join(" ")));
            Ok(String::new())
        });
        (runner, log)
    }

    fn config(name: &str, masquerade: bool) -> WgConfig {
        WgConfig {
            intf: WgInterfaceConfig {
                name: name.into(),
                address: Ipv4Addr::new(10, 255, 192, 2),
                subnet: "10.255.192.2/31".parse().unwrap(),
                port: Some(51900),
                private_key: "priv".into(),
                masquerade,
            },
            peers: vec![WgPeerConfig {
                id: 2,
                public_key: "pub".into(),
                psk: Some("psk".into()),
                allowed_ips: vec!["10.0.0.0/8".parse().unwrap()],
                endpoint: None,
                keepalive: None,
            }],
        }
    }

    #[tokio::test]
    async fn test_bring_up_sequence_and_teardown_order() {
        let dir = tempfile::tempdir().unwrap();
        let (runner, log) = recording_runner();
        let mut net = UvnNet::new(
            vec![config("uwg-b0", false)],
            vec!["eth0".into()],
            dir.path().to_path_buf(),
            runner,
        );
        net.start().unwrap();

        let commands = log.lock().clone();
        assert_eq!(commands[0], "sysctl -w net.ipv4.ip_forward=1");
        assert!(commands[1].contains("TCPMSS"));
        assert!(commands[2].contains("link add uwg-b0 type wireguard"));
        assert!(commands
            .iter()
            .any(|c| c.starts_with("wg setconf uwg-b0")));
        assert!(commands
            .iter()
            .any(|c| c.contains("address add 10.255.192.2/31 dev uwg-b0")));
        assert!(dir.path().join("uwg-b0.conf").exists());

        log.lock().clear();
        net.stop(false).await.unwrap();
        let commands = log.lock().clone();
        // Reverse order: device first, clamp last
        assert!(commands[0].contains("link del uwg-b0"));
        assert!(commands.last().unwrap().contains("-D FORWARD"));
    }

    #[tokio::test]
    async fn test_masquerade_rules() {
        let dir = tempfile::tempdir().unwrap();
        let (runner, log) = recording_runner();
        let mut net = UvnNet::new(
            vec![config("uwg-b0", true), config("uwg-b1", false)],
            vec!["eth0".into()],
            dir.path().to_path_buf(),
            runner,
        );
        net.start().unwrap();
        let commands = log.lock().clone();
        assert!(commands
            .iter()
            .any(|c| c.contains("-A POSTROUTING -o uwg-b0 -j MASQUERADE")));
        // Cross rules toward the LAN and the other tunnel
        assert!(commands.iter().any(|c| c.contains("-s 10.255.192.2/31 -o eth0")));
        assert!(commands.iter().any(|c| c.contains("-s 10.255.192.2/31 -o uwg-b1")));
        // The unflagged interface has no rules of its own
        assert!(!commands.iter().any(|c| c.contains("-o uwg-b1 -j MASQUERADE")));
    }

    #[tokio::test]
    async fn test_teardown_continues_past_failures() {
        let dir = tempfile::tempdir().unwrap();
        let calls: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let recorded = calls.clone();
        let runner: CommandRunner = Arc::new(move |program, args| {
            let line = format!("{} {}", program, args.join(" "));
            recorded.lock().push(line.clone());
            if line.contains("link del") {
                return Err(Error::CommandFailed("device busy".into()));
            }
            Ok(String::new())
        });
        let mut net = UvnNet::new(
            vec![config("uwg-b0", false)],
            vec![],
            dir.path().to_path_buf(),
            runner,
        );
        net.start().unwrap();
        calls.lock().clear();

        let err = net.stop(true).await.unwrap_err();
        match err {
            Error::StopAgentService(failures) => assert_eq!(failures.len(), 1),
            other => panic!("unexpected: {other}"),
        }
        // The clamp removal still ran after the failed link deletion
        assert!(calls.lock().iter().any(|c| c.contains("-D FORWARD")));
    }
}
