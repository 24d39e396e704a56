//! Dynamic router configuration
//!
//! The agent does not speak OSPF itself: it renders a configuration for the
//! external router daemon (bird) and pokes it to reload. One OSPF area per
//! backbone link, with the local LANs attached as stub interfaces.

use crate::net::CommandRunner;
use crate::service::AgentService;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use tracing::{debug, warn};
use uvnet_common::types::LanDescriptor;
use uvnet_common::{exec, Result};
use uvnet_registry::WgConfig;

/// File name of the rendered router configuration
pub const ROUTER_CONFIG_FILENAME: &str = "bird.conf";

/// Render the router daemon configuration
pub fn render_router_config(
    router_id: Ipv4Addr,
    backbone: &[WgConfig],
    lans: &[LanDescriptor],
) -> String {
    let mut out = String::new();
    out.push_str(&format!("router id {};\n\n", router_id));
    out.push_str("protocol device {\n}\n\n");
    out.push_str("protocol direct {\n  ipv4;\n}\n\n");
    out.push_str("protocol kernel {\n  ipv4 {\n    import all;\n    export all;\n  };\n  learn;\n}\n\n");
    out.push_str("protocol ospf v2 uvn {\n  ipv4 {\n    import all;\n    export all;\n  };\n");
    for config in backbone {
        let area = config.intf.port.map(|p| p as u32).unwrap_or(0) % 1000;
        out.push_str(&format!("  area {} {{\n", area));
        out.push_str(&format!(
            "    interface \"{}\" {{\n      type pointopoint;\n    }};\n",
            config.intf.name
        ));
        out.push_str("  };\n");
    }
    if !lans.is_empty() {
        out.push_str("  area 0 {\n");
        for lan in lans {
            out.push_str(&format!(
                "    interface \"{}\" {{\n      stub;\n    }};\n",
                lan.nic.name
            ));
        }
        out.push_str("  };\n");
    }
    out.push_str("}\n");
    out
}

pub struct RouterService {
    config_dir: PathBuf,
    runner: CommandRunner,
    router_id: Ipv4Addr,
    backbone: Vec<WgConfig>,
    lans: Vec<LanDescriptor>,
    started: bool,
}

impl RouterService {
    pub fn new(
        config_dir: PathBuf,
        runner: CommandRunner,
        router_id: Ipv4Addr,
        backbone: Vec<WgConfig>,
        lans: Vec<LanDescriptor>,
    ) -> Self {
        Self {
            config_dir,
            runner,
            router_id,
            backbone,
            lans,
            started: false,
        }
    }

    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join(ROUTER_CONFIG_FILENAME)
    }

    /// Render the configuration and ask the daemon to pick it up
    pub fn write_config(&self) -> Result<()> {
        let rendered = render_router_config(self.router_id, &self.backbone, &self.lans);
        exec::write_atomic(&self.config_file(), rendered.as_bytes())?;
        debug!("router configuration written: {}", self.config_file().display());
        // The daemon may not be running yet; that is not our failure
        if let Err(e) = (self.runner)("birdc", &["configure"]) {
            warn!("router daemon reload failed: {}", e);
        }
        Ok(())
    }

    pub fn start(&mut self) -> Result<()> {
        self.write_config()?;
        self.started = true;
        Ok(())
    }
}

#[async_trait::async_trait]
impl AgentService for RouterService {
    fn name(&self) -> &'static str {
        "router"
    }

    async fn stop(&mut self, _assert_stopped: bool) -> Result<()> {
        self.started = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uvnet_registry::{WgInterfaceConfig, WgPeerConfig};

    fn backbone_config(name: &str, port: u16) -> WgConfig {
        WgConfig {
            intf: WgInterfaceConfig {
                name: name.into(),
                address: Ipv4Addr::new(10, 255, 192, 2),
                subnet: "10.255.192.2/31".parse().unwrap(),
                port: Some(port),
                private_key: "priv".into(),
                masquerade: false,
            },
            peers: vec![WgPeerConfig {
                id: 2,
                public_key: "pub".into(),
                psk: None,
                allowed_ips: vec!["10.0.0.0/8".parse().unwrap()],
                endpoint: None,
                keepalive: None,
            }],
        }
    }

    #[test]
    fn test_render_one_area_per_link() {
        let lan = LanDescriptor {
            nic: uvnet_common::types::NicDescriptor {
                name: "eth0".into(),
                address: Ipv4Addr::new(10, 1, 0, 2),
                subnet: "10.1.0.0/24".parse().unwrap(),
            },
            gw: Ipv4Addr::new(10, 1, 0, 1),
        };
        let rendered = render_router_config(
            Ipv4Addr::new(10, 255, 128, 2),
            &[backbone_config("uwg-b0", 51900), backbone_config("uwg-b1", 51901)],
            &[lan],
        );
        assert!(rendered.starts_with("router id 10.255.128.2;"));
        assert_eq!(rendered.matches("type pointopoint").count(), 2);
        assert!(rendered.contains("interface \"uwg-b0\""));
        assert!(rendered.contains("interface \"uwg-b1\""));
        assert!(rendered.contains("stub;"));
        // Distinct areas per link
        assert!(rendered.contains("area 900"));
        assert!(rendered.contains("area 901"));
    }
}
