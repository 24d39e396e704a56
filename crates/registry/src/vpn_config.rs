//! VPN configurator
//!
//! Derives per-endpoint WireGuard configurations from the deployment map and
//! the key pools: the root VPN (registry hub, cell spokes), each cell's
//! particles VPN, and one interface per backbone link.

use crate::keymat::{CentralizedVpnKeys, PairedVpnKeys};
use crate::planner::P2pLinksMap;
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use uvnet_common::types::{cell_enables_particles_vpn, Cell, ObjectId, Particle, Uvn};
use uvnet_common::{Error, Result};

/// Interface half of a WireGuard configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WgInterfaceConfig {
    pub name: String,
    pub address: Ipv4Addr,
    pub subnet: Ipv4Network,
    pub port: Option<u16>,
    pub private_key: String,
    /// Install POSTROUTING MASQUERADE for this interface's subnet
    pub masquerade: bool,
}

/// One peer of a WireGuard configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WgPeerConfig {
    pub id: ObjectId,
    pub public_key: String,
    pub psk: Option<String>,
    pub allowed_ips: Vec<Ipv4Network>,
    pub endpoint: Option<String>,
    pub keepalive: Option<u16>,
}

/// A complete tunnel description
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WgConfig {
    pub intf: WgInterfaceConfig,
    pub peers: Vec<WgPeerConfig>,
}

impl WgConfig {
    /// Render for `wg setconf`: interface address and routes are applied
    /// separately with `ip`, so only the key material and peers appear
    pub fn render_setconf(&self) -> String {
        let mut out = String::new();
        out.push_str("[Interface]\n");
        if let Some(port) = self.intf.port {
            out.push_str(&format!("ListenPort = {}\n", port));
        }
        out.push_str(&format!("PrivateKey = {}\n", self.intf.private_key));
        for peer in &self.peers {
            out.push_str("\n[Peer]\n");
            out.push_str(&format!("PublicKey = {}\n", peer.public_key));
            if let Some(psk) = &peer.psk {
                out.push_str(&format!("PresharedKey = {}\n", psk));
            }
            let allowed: Vec<String> = peer.allowed_ips.iter().map(|n| n.to_string()).collect();
            out.push_str(&format!("AllowedIPs = {}\n", allowed.join(", ")));
            if let Some(endpoint) = &peer.endpoint {
                out.push_str(&format!("Endpoint = {}\n", endpoint));
            }
            if let Some(keepalive) = peer.keepalive {
                out.push_str(&format!("PersistentKeepalive = {}\n", keepalive));
            }
        }
        out
    }

    /// Render in wg-quick form, with the interface address included
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str("[Interface]\n");
        out.push_str(&format!(
            "Address = {}/{}\n",
            self.intf.address,
            self.intf.subnet.prefix()
        ));
        if let Some(port) = self.intf.port {
            out.push_str(&format!("ListenPort = {}\n", port));
        }
        out.push_str(&format!("PrivateKey = {}\n", self.intf.private_key));
        for peer in &self.peers {
            out.push_str("\n[Peer]\n");
            out.push_str(&format!("PublicKey = {}\n", peer.public_key));
            if let Some(psk) = &peer.psk {
                out.push_str(&format!("PresharedKey = {}\n", psk));
            }
            let allowed: Vec<String> = peer.allowed_ips.iter().map(|n| n.to_string()).collect();
            out.push_str(&format!("AllowedIPs = {}\n", allowed.join(", ")));
            if let Some(endpoint) = &peer.endpoint {
                out.push_str(&format!("Endpoint = {}\n", endpoint));
            }
            if let Some(keepalive) = peer.keepalive {
                out.push_str(&format!("PersistentKeepalive = {}\n", keepalive));
            }
        }
        out
    }
}

fn host_in(subnet: Ipv4Network, offset: u32) -> Result<Ipv4Addr> {
    let addr = Ipv4Addr::from(u32::from(subnet.network()) + offset);
    if !subnet.contains(addr) {
        return Err(Error::InvalidConfig(format!(
            "address {addr} outside of subnet {subnet}"
        )));
    }
    Ok(addr)
}

/// Registry address inside the root VPN subnet
pub fn root_vpn_registry_address(uvn: &Uvn) -> Result<Ipv4Addr> {
    host_in(uvn.settings.root_vpn.subnet, 1)
}

/// Cell address inside the root VPN subnet
pub fn root_vpn_cell_address(uvn: &Uvn, cell_id: ObjectId) -> Result<Ipv4Addr> {
    host_in(uvn.settings.root_vpn.subnet, 1 + cell_id as u32)
}

/// The /24 carved out of the particles subnet for one cell
pub fn particles_vpn_cell_subnet(uvn: &Uvn, cell_id: ObjectId) -> Result<Ipv4Network> {
    let base = uvn.settings.particles_vpn.subnet;
    if base.prefix() > 24 {
        return Err(Error::InvalidConfig(format!(
            "particles subnet {base} too small to carve per-cell /24s"
        )));
    }
    let capacity = 1u32 << (24 - base.prefix());
    if cell_id as u32 >= capacity {
        return Err(Error::InvalidConfig(format!(
            "cell id {cell_id} exceeds particles subnet capacity {capacity}"
        )));
    }
    let network = Ipv4Addr::from(u32::from(base.network()) + ((cell_id as u32) << 8));
    Ipv4Network::new(network, 24).map_err(|e| Error::Internal(e.to_string()))
}

/// Every subnet of the overlay: attached LANs plus the VPN subnets
pub fn uvn_networks(uvn: &Uvn, cells: &BTreeMap<ObjectId, Cell>) -> Vec<Ipv4Network> {
    let mut networks: Vec<Ipv4Network> = cells
        .values()
        .flat_map(|c| c.allowed_lans.iter().copied())
        .collect();
    networks.push(uvn.settings.root_vpn.subnet);
    networks.push(uvn.settings.backbone_vpn.subnet);
    networks.push(uvn.settings.particles_vpn.subnet);
    networks.sort();
    networks.dedup();
    networks
}

/// Root VPN as seen by the registry: hub with one peer per cell
pub fn root_vpn_registry(
    uvn: &Uvn,
    cells: &BTreeMap<ObjectId, Cell>,
    keys: &CentralizedVpnKeys,
) -> Result<Option<WgConfig>> {
    if !uvn.settings.enable_root_vpn || cells.is_empty() {
        return Ok(None);
    }
    let root_key = keys.root_key()?.ok_or_else(|| Error::MissingKeyMaterial {
        prefix: keys.prefix().to_string(),
        scope: "root".to_string(),
    })?;
    let mut peers = Vec::new();
    for cell in cells.values() {
        let key = keys.peer_key(cell.id)?.ok_or_else(|| Error::MissingKeyMaterial {
            prefix: keys.prefix().to_string(),
            scope: format!("peer:{}", cell.id),
        })?;
        let psk = keys.psk(cell.id)?.map(|p| p.value);
        let mut allowed_ips = vec![Ipv4Network::new(
            root_vpn_cell_address(uvn, cell.id)?,
            32,
        )
        .map_err(|e| Error::Internal(e.to_string()))?];
        allowed_ips.extend(cell.allowed_lans.iter().copied());
        peers.push(WgPeerConfig {
            id: cell.id,
            public_key: key.public,
            psk,
            allowed_ips,
            endpoint: None,
            keepalive: None,
        });
    }
    Ok(Some(WgConfig {
        intf: WgInterfaceConfig {
            name: "uwg-v0".to_string(),
            address: root_vpn_registry_address(uvn)?,
            subnet: uvn.settings.root_vpn.subnet,
            port: Some(uvn.settings.root_vpn.port),
            private_key: root_key.private,
            masquerade: false,
        },
        peers,
    }))
}

/// Root VPN as seen by one cell: a single registry peer
pub fn root_vpn_cell(uvn: &Uvn, cell: &Cell, keys: &CentralizedVpnKeys) -> Result<Option<WgConfig>> {
    if !uvn.settings.enable_root_vpn {
        return Ok(None);
    }
    let Some(registry_address) = uvn.address.clone() else {
        // Without a public registry address the root VPN only works while
        // cells are directly reachable; still bring the interface up
        return root_vpn_cell_with_endpoint(uvn, cell, keys, None);
    };
    let endpoint = format!("{}:{}", registry_address, uvn.settings.root_vpn.port);
    root_vpn_cell_with_endpoint(uvn, cell, keys, Some(endpoint))
}

fn root_vpn_cell_with_endpoint(
    uvn: &Uvn,
    cell: &Cell,
    keys: &CentralizedVpnKeys,
    endpoint: Option<String>,
) -> Result<Option<WgConfig>> {
    let cell_key = keys.peer_key(cell.id)?.ok_or_else(|| Error::MissingKeyMaterial {
        prefix: keys.prefix().to_string(),
        scope: format!("peer:{}", cell.id),
    })?;
    let root_key = keys.root_key()?.ok_or_else(|| Error::MissingKeyMaterial {
        prefix: keys.prefix().to_string(),
        scope: "root".to_string(),
    })?;
    let psk = keys.psk(cell.id)?.map(|p| p.value);
    Ok(Some(WgConfig {
        intf: WgInterfaceConfig {
            name: "uwg-v0".to_string(),
            address: root_vpn_cell_address(uvn, cell.id)?,
            subnet: uvn.settings.root_vpn.subnet,
            port: None,
            private_key: cell_key.private,
            masquerade: false,
        },
        peers: vec![WgPeerConfig {
            id: 0,
            public_key: root_key.public,
            psk,
            allowed_ips: vec![uvn.settings.root_vpn.subnet],
            endpoint,
            keepalive: Some(25),
        }],
    }))
}

/// Particles VPN as seen by the hosting cell: hub with one peer per particle
pub fn particles_vpn_cell(
    uvn: &Uvn,
    cell: &Cell,
    particles: &BTreeMap<ObjectId, Particle>,
    keys: &CentralizedVpnKeys,
) -> Result<Option<WgConfig>> {
    if !cell_enables_particles_vpn(uvn, cell) {
        return Ok(None);
    }
    let hub_key = keys.root_key()?.ok_or_else(|| Error::MissingKeyMaterial {
        prefix: keys.prefix().to_string(),
        scope: "root".to_string(),
    })?;
    let subnet = particles_vpn_cell_subnet(uvn, cell.id)?;
    let mut peers = Vec::new();
    for particle in particles.values() {
        let key = keys
            .peer_key(particle.id)?
            .ok_or_else(|| Error::MissingKeyMaterial {
                prefix: keys.prefix().to_string(),
                scope: format!("peer:{}", particle.id),
            })?;
        let psk = keys.psk(particle.id)?.map(|p| p.value);
        let address = host_in(subnet, 1 + particle.id as u32)?;
        peers.push(WgPeerConfig {
            id: particle.id,
            public_key: key.public,
            psk,
            allowed_ips: vec![
                Ipv4Network::new(address, 32).map_err(|e| Error::Internal(e.to_string()))?
            ],
            endpoint: None,
            keepalive: None,
        });
    }
    Ok(Some(WgConfig {
        intf: WgInterfaceConfig {
            name: "uwg-p0".to_string(),
            address: host_in(subnet, 1)?,
            subnet,
            port: Some(uvn.settings.particles_vpn.port),
            private_key: hub_key.private,
            masquerade: false,
        },
        peers,
    }))
}

/// Particles VPN as seen by one particle, for distribution to the client
pub fn particles_vpn_particle(
    uvn: &Uvn,
    cell: &Cell,
    cells: &BTreeMap<ObjectId, Cell>,
    particle: &Particle,
    keys: &CentralizedVpnKeys,
) -> Result<Option<WgConfig>> {
    if !cell_enables_particles_vpn(uvn, cell) {
        return Ok(None);
    }
    let Some(cell_address) = cell.address.clone() else {
        return Ok(None);
    };
    let hub_key = keys.root_key()?.ok_or_else(|| Error::MissingKeyMaterial {
        prefix: keys.prefix().to_string(),
        scope: "root".to_string(),
    })?;
    let particle_key = keys
        .peer_key(particle.id)?
        .ok_or_else(|| Error::MissingKeyMaterial {
            prefix: keys.prefix().to_string(),
            scope: format!("peer:{}", particle.id),
        })?;
    let psk = keys.psk(particle.id)?.map(|p| p.value);
    let subnet = particles_vpn_cell_subnet(uvn, cell.id)?;
    // A particle reaches the whole overlay through its cell
    let mut allowed_ips = vec![subnet];
    allowed_ips.extend(cells.values().flat_map(|c| c.allowed_lans.iter().copied()));
    Ok(Some(WgConfig {
        intf: WgInterfaceConfig {
            name: format!("uwg-{}", particle.name),
            address: host_in(subnet, 1 + particle.id as u32)?,
            subnet,
            port: None,
            private_key: particle_key.private,
            masquerade: false,
        },
        peers: vec![WgPeerConfig {
            id: 0,
            public_key: hub_key.public,
            psk,
            allowed_ips,
            endpoint: Some(format!(
                "{}:{}",
                cell_address, uvn.settings.particles_vpn.port
            )),
            keepalive: Some(25),
        }],
    }))
}

/// Whether an endpoint masquerades its backbone interface: the remote cannot
/// route back natively when it is private; on a private-to-private link only
/// the lower id side translates
fn backbone_masquerade(local: &Cell, remote: &Cell) -> bool {
    if local.private() && remote.private() {
        local.id < remote.id
    } else {
        remote.private()
    }
}

/// Backbone interfaces of one cell, sorted by port index
pub fn backbone_cell(
    uvn: &Uvn,
    cells: &BTreeMap<ObjectId, Cell>,
    deployment: &P2pLinksMap,
    cell_id: ObjectId,
    keys: &PairedVpnKeys,
) -> Result<Vec<WgConfig>> {
    let Some(cell) = cells.get(&cell_id) else {
        return Ok(Vec::new());
    };
    let networks = uvn_networks(uvn, cells);
    let mut configs = Vec::new();
    for remote_id in deployment.peers_of(cell_id) {
        let link = deployment
            .link(cell_id, remote_id)
            .ok_or_else(|| Error::Internal(format!("missing link {cell_id} -> {remote_id}")))?;
        let Some(remote) = cells.get(&remote_id) else {
            continue;
        };
        let material = keys.get_pair_material(cell_id, remote_id)?;
        let local_key = material.key_of(cell_id, remote_id).clone();
        let remote_key = material.key_of(remote_id, cell_id).clone();
        let endpoint = remote.address.as_ref().map(|address| {
            let remote_link = deployment
                .link(remote_id, cell_id)
                .expect("reverse link exists");
            format!(
                "{}:{}",
                address,
                uvn.settings.backbone_vpn.port + remote_link.port_index as u16
            )
        });
        configs.push(WgConfig {
            intf: WgInterfaceConfig {
                name: format!("uwg-b{}", link.port_index),
                address: link.addr_local,
                subnet: link.subnet,
                port: Some(uvn.settings.backbone_vpn.port + link.port_index as u16),
                private_key: local_key.private,
                masquerade: backbone_masquerade(cell, remote),
            },
            peers: vec![WgPeerConfig {
                id: remote_id,
                public_key: remote_key.public,
                psk: Some(material.psk.value.clone()),
                allowed_ips: networks.clone(),
                endpoint,
                keepalive: if cell.private() { Some(25) } else { None },
            }],
        });
    }
    Ok(configs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::{deploy, PlannerInput};
    use std::collections::BTreeSet;
    use uvnet_common::types::DeploymentStrategyKind;
    use uvnet_common::Database;

    fn fixture() -> (Uvn, BTreeMap<ObjectId, Cell>, Database) {
        let mut uvn = Uvn::new("u1".into());
        uvn.address = Some("203.0.113.100".into());
        let db = Database::open_memory().unwrap();
        (uvn, BTreeMap::new(), db)
    }

    fn cell(id: ObjectId, name: &str, address: Option<&str>, lan: Option<&str>) -> Cell {
        let mut c = Cell::new(1, name.into());
        c.id = id;
        c.address = address.map(|a| a.to_string());
        if let Some(lan) = lan {
            c.allowed_lans = [lan.parse().unwrap()].into_iter().collect();
        }
        c
    }

    #[test]
    fn test_single_cell_root_and_particles() {
        let (uvn, mut cells, db) = fixture();
        cells.insert(1, cell(1, "c1", Some("203.0.113.1"), Some("10.1.0.0/24")));

        let root_keys = CentralizedVpnKeys::new(db.clone(), "u1:vpn:root");
        root_keys.assert_keys(&[1].into_iter().collect()).unwrap();

        let registry_config = root_vpn_registry(&uvn, &cells, &root_keys)
            .unwrap()
            .unwrap();
        assert_eq!(registry_config.peers.len(), 1);
        assert!(registry_config.peers[0]
            .allowed_ips
            .contains(&"10.1.0.0/24".parse().unwrap()));

        let cell_config = root_vpn_cell(&uvn, &cells[&1], &root_keys).unwrap().unwrap();
        assert_eq!(cell_config.peers.len(), 1);
        assert_eq!(
            cell_config.peers[0].endpoint.as_deref(),
            Some("203.0.113.100:51820")
        );

        let particle_keys = CentralizedVpnKeys::new(db.clone(), "u1:vpn:particles:1");
        let mut particles = BTreeMap::new();
        let mut p1 = Particle::new(1, "p1".into());
        p1.id = 1;
        particles.insert(1, p1);
        particle_keys.assert_keys(&[1].into_iter().collect()).unwrap();
        let hub = particles_vpn_cell(&uvn, &cells[&1], &particles, &particle_keys)
            .unwrap()
            .unwrap();
        assert_eq!(hub.peers.len(), 1);
        assert_eq!(hub.intf.subnet, "10.254.1.0/24".parse().unwrap());
        assert_eq!(hub.intf.address, "10.254.1.1".parse::<Ipv4Addr>().unwrap());

        let roaming = particles_vpn_particle(&uvn, &cells[&1], &cells, &particles[&1], &particle_keys)
            .unwrap()
            .unwrap();
        assert_eq!(
            roaming.peers[0].endpoint.as_deref(),
            Some("203.0.113.1:51821")
        );
        assert!(roaming.peers[0]
            .allowed_ips
            .contains(&"10.1.0.0/24".parse().unwrap()));
    }

    #[test]
    fn test_relay_masquerades_private_peers() {
        let (uvn, mut cells, db) = fixture();
        cells.insert(1, cell(1, "c1", None, Some("10.1.0.0/24")));
        cells.insert(2, cell(2, "c2", None, Some("10.2.0.0/24")));
        cells.insert(3, cell(3, "r1", Some("203.0.113.9"), None));

        let input = PlannerInput {
            peers: cells.keys().copied().collect(),
            private_peers: [1, 2].into_iter().collect(),
        };
        let deployment = deploy(
            &input,
            DeploymentStrategyKind::FullMesh,
            &serde_json::Value::Null,
            uvn.settings.backbone_vpn.subnet,
            "ts0",
        )
        .unwrap();

        let keys = PairedVpnKeys::new(db, "u1:vpn:backbone");
        for (a, b) in [(1, 3), (2, 3)] {
            keys.assert_pair(a, b).unwrap();
        }

        // Relay masquerades on both interfaces: its peers are private
        let relay_configs = backbone_cell(&uvn, &cells, &deployment, 3, &keys).unwrap();
        assert_eq!(relay_configs.len(), 2);
        assert!(relay_configs.iter().all(|c| c.intf.masquerade));
        // Relay cannot dial private peers
        assert!(relay_configs.iter().all(|c| c.peers[0].endpoint.is_none()));

        // Private cells dial the relay and do not masquerade
        let cell_configs = backbone_cell(&uvn, &cells, &deployment, 1, &keys).unwrap();
        assert_eq!(cell_configs.len(), 1);
        assert!(!cell_configs[0].intf.masquerade);
        assert!(cell_configs[0].peers[0]
            .endpoint
            .as_deref()
            .unwrap()
            .starts_with("203.0.113.9:"));
        assert_eq!(cell_configs[0].peers[0].keepalive, Some(25));
    }

    #[test]
    fn test_backbone_endpoint_uses_remote_port_index() {
        let (uvn, mut cells, db) = fixture();
        for id in 1..=3 {
            cells.insert(
                id,
                cell(id, &format!("c{id}"), Some("203.0.113.1"), None),
            );
        }
        let input = PlannerInput {
            peers: cells.keys().copied().collect(),
            private_peers: BTreeSet::new(),
        };
        let deployment = deploy(
            &input,
            DeploymentStrategyKind::FullMesh,
            &serde_json::Value::Null,
            uvn.settings.backbone_vpn.subnet,
            "ts0",
        )
        .unwrap();
        let keys = PairedVpnKeys::new(db, "u1:vpn:backbone");
        for (a, b) in [(1, 2), (1, 3), (2, 3)] {
            keys.assert_pair(a, b).unwrap();
        }
        let configs = backbone_cell(&uvn, &cells, &deployment, 3, &keys).unwrap();
        for config in configs {
            let remote = config.peers[0].id;
            let remote_port = deployment.link(remote, 3).unwrap().port_index;
            let endpoint = config.peers[0].endpoint.clone().unwrap();
            assert!(endpoint.ends_with(&format!(":{}", 51900 + remote_port)));
        }
    }

    #[test]
    fn test_render_config() {
        let (uvn, mut cells, db) = fixture();
        cells.insert(1, cell(1, "c1", Some("203.0.113.1"), None));
        let keys = CentralizedVpnKeys::new(db, "u1:vpn:root");
        keys.assert_keys(&[1].into_iter().collect()).unwrap();
        let config = root_vpn_cell(&uvn, &cells[&1], &keys).unwrap().unwrap();
        let rendered = config.render();
        assert!(rendered.contains("[Interface]"));
        assert!(rendered.contains("[Peer]"));
        assert!(rendered.contains("Endpoint = 203.0.113.100:51820"));
        assert!(rendered.contains("PersistentKeepalive = 25"));
    }
}
