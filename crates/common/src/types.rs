//! Core entity types for uvnet
//!
//! The administrative model: a UVN owns cells and particles, users own all
//! three. Every persistent entity carries a per-attribute change set that the
//! object store consults on save; setters mark the touched attribute and
//! refuse writes on read-only handles.

use crate::{Error, Result};
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;
use std::time::Duration;

/// Identifier allocated from a typed monotonic pool. Never reused.
pub type ObjectId = i64;

/// Set of attribute names modified since the last save
pub type ChangeSet = BTreeSet<&'static str>;

/// A unified virtual network: the administrative overlay domain
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Uvn {
    pub id: ObjectId,
    pub name: String,
    pub address: Option<String>,
    pub settings: UvnSettings,
    #[serde(skip)]
    pub changed: ChangeSet,
    #[serde(skip)]
    pub readonly: bool,
}

impl Uvn {
    pub fn new(name: String) -> Self {
        Self {
            id: 0,
            name,
            address: None,
            settings: UvnSettings::default(),
            changed: ChangeSet::new(),
            readonly: false,
        }
    }

    pub fn set_address(&mut self, address: Option<String>) -> Result<()> {
        if self.address == address {
            return Ok(());
        }
        self.touch("address")?;
        self.address = address;
        Ok(())
    }

    pub fn set_settings(&mut self, settings: UvnSettings) -> Result<()> {
        if self.settings == settings {
            return Ok(());
        }
        self.touch("settings")?;
        self.settings = settings;
        Ok(())
    }

    fn touch(&mut self, attr: &'static str) -> Result<()> {
        if self.readonly {
            return Err(Error::ReadOnly(attr));
        }
        self.changed.insert(attr);
        Ok(())
    }
}

/// A site in the UVN, exporting zero or more LAN subnets
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cell {
    pub id: ObjectId,
    pub uvn_id: ObjectId,
    pub name: String,
    pub address: Option<String>,
    pub allowed_lans: BTreeSet<Ipv4Network>,
    pub settings: CellSettings,
    pub excluded: bool,
    pub owner_id: Option<ObjectId>,
    #[serde(skip)]
    pub changed: ChangeSet,
    #[serde(skip)]
    pub readonly: bool,
}

impl Cell {
    pub fn new(uvn_id: ObjectId, name: String) -> Self {
        Self {
            id: 0,
            uvn_id,
            name,
            address: None,
            allowed_lans: BTreeSet::new(),
            settings: CellSettings::default(),
            excluded: false,
            owner_id: None,
            changed: ChangeSet::new(),
            readonly: false,
        }
    }

    /// A cell without a public address can only dial out
    pub fn private(&self) -> bool {
        self.address.is_none()
    }

    /// A cell without attached LANs only forwards traffic
    pub fn relay(&self) -> bool {
        self.allowed_lans.is_empty()
    }

    pub fn set_address(&mut self, address: Option<String>) -> Result<bool> {
        if self.address == address {
            return Ok(false);
        }
        self.touch("address")?;
        self.address = address;
        Ok(true)
    }

    pub fn set_allowed_lans(&mut self, lans: BTreeSet<Ipv4Network>) -> Result<bool> {
        if self.allowed_lans == lans {
            return Ok(false);
        }
        self.touch("allowed_lans")?;
        self.allowed_lans = lans;
        Ok(true)
    }

    pub fn set_settings(&mut self, settings: CellSettings) -> Result<()> {
        if self.settings == settings {
            return Ok(());
        }
        self.touch("settings")?;
        self.settings = settings;
        Ok(())
    }

    pub fn set_excluded(&mut self, excluded: bool) -> Result<bool> {
        if self.excluded == excluded {
            return Ok(false);
        }
        self.touch("excluded")?;
        self.excluded = excluded;
        Ok(true)
    }

    fn touch(&mut self, attr: &'static str) -> Result<()> {
        if self.readonly {
            return Err(Error::ReadOnly(attr));
        }
        self.changed.insert(attr);
        Ok(())
    }
}

/// A roaming client, attached to one cell's particles VPN at a time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Particle {
    pub id: ObjectId,
    pub uvn_id: ObjectId,
    pub name: String,
    pub excluded: bool,
    pub owner_id: Option<ObjectId>,
    #[serde(skip)]
    pub changed: ChangeSet,
    #[serde(skip)]
    pub readonly: bool,
}

impl Particle {
    pub fn new(uvn_id: ObjectId, name: String) -> Self {
        Self {
            id: 0,
            uvn_id,
            name,
            excluded: false,
            owner_id: None,
            changed: ChangeSet::new(),
            readonly: false,
        }
    }

    pub fn set_excluded(&mut self, excluded: bool) -> Result<bool> {
        if self.excluded == excluded {
            return Ok(false);
        }
        if self.readonly {
            return Err(Error::ReadOnly("excluded"));
        }
        self.changed.insert("excluded");
        self.excluded = excluded;
        Ok(true)
    }
}

/// An administrative user. Owns cells, particles, possibly the UVN itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: ObjectId,
    pub email: String,
    pub name: String,
    pub realm: String,
    /// Salted digest, `<salt>:<hex sha256(email:realm:salt:password)>`
    pub password: String,
    pub excluded: bool,
    #[serde(skip)]
    pub changed: ChangeSet,
    #[serde(skip)]
    pub readonly: bool,
}

impl User {
    pub fn new(email: String, name: String, realm: String, password: &str) -> Self {
        let digest = Self::digest_password(&email, &realm, password);
        Self {
            id: 0,
            email,
            name,
            realm,
            password: digest,
            excluded: false,
            changed: ChangeSet::new(),
            readonly: false,
        }
    }

    /// Parse `Full Name <email@host>` or a bare email address
    pub fn parse_user_id(spec: &str) -> Result<(String, String)> {
        if let (Some(start), Some(end)) = (spec.find('<'), spec.rfind('>')) {
            if start >= end {
                return Err(Error::InvalidConfig(format!("invalid user id: {spec}")));
            }
            let email = spec[start + 1..end].trim().to_string();
            let name = spec[..start].trim().to_string();
            if email.is_empty() {
                return Err(Error::InvalidConfig(format!("invalid user id: {spec}")));
            }
            Ok((email, name))
        } else if spec.contains('@') {
            let email = spec.trim().to_string();
            let name = email.split('@').next().unwrap_or_default().to_string();
            Ok((email, name))
        } else {
            Err(Error::InvalidConfig(format!("invalid user id: {spec}")))
        }
    }

    pub fn digest_password(email: &str, realm: &str, password: &str) -> String {
        use rand::RngCore;
        use sha2::{Digest, Sha256};
        let mut salt = [0u8; 8];
        rand::rngs::OsRng.fill_bytes(&mut salt);
        let salt = hex::encode(salt);
        let mut h = Sha256::new();
        h.update(format!("{email}:{realm}:{salt}:{password}").as_bytes());
        format!("{}:{}", salt, hex::encode(h.finalize()))
    }

    pub fn check_password(&self, password: &str) -> bool {
        use sha2::{Digest, Sha256};
        let Some((salt, digest)) = self.password.split_once(':') else {
            return false;
        };
        let mut h = Sha256::new();
        h.update(format!("{}:{}:{}:{}", self.email, self.realm, salt, password).as_bytes());
        hex::encode(h.finalize()) == digest
    }

    pub fn set_excluded(&mut self, excluded: bool) -> Result<bool> {
        if self.excluded == excluded {
            return Ok(false);
        }
        if self.readonly {
            return Err(Error::ReadOnly("excluded"));
        }
        self.changed.insert("excluded");
        self.excluded = excluded;
        Ok(true)
    }
}

/// Timing profile selecting announce/probe cadences for a whole UVN
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TimingProfile {
    #[default]
    Default,
    Fast,
}

impl TimingProfile {
    /// Period between unsolicited cell-info announcements
    pub fn announce_period(&self) -> Duration {
        match self {
            TimingProfile::Default => Duration::from_secs(60),
            TimingProfile::Fast => Duration::from_secs(10),
        }
    }

    /// Period between reachability probes of a known remote LAN
    pub fn probe_period(&self) -> Duration {
        match self {
            TimingProfile::Default => Duration::from_secs(30),
            TimingProfile::Fast => Duration::from_secs(5),
        }
    }

    /// Timeout of a single reachability probe
    pub fn probe_timeout(&self) -> Duration {
        match self {
            TimingProfile::Default => Duration::from_secs(5),
            TimingProfile::Fast => Duration::from_secs(2),
        }
    }

    /// Consecutive failures before a reachable LAN is marked unreachable
    pub fn probe_max_failures(&self) -> u32 {
        3
    }

    /// Transport heartbeat period; a writer is offline after three missed beats
    pub fn liveness_period(&self) -> Duration {
        match self {
            TimingProfile::Default => Duration::from_secs(5),
            TimingProfile::Fast => Duration::from_secs(1),
        }
    }
}

/// Backbone deployment strategy selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStrategyKind {
    Crossed,
    Circular,
    #[default]
    FullMesh,
    Random,
    Static,
}

impl std::fmt::Display for DeploymentStrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeploymentStrategyKind::Crossed => write!(f, "crossed"),
            DeploymentStrategyKind::Circular => write!(f, "circular"),
            DeploymentStrategyKind::FullMesh => write!(f, "full_mesh"),
            DeploymentStrategyKind::Random => write!(f, "random"),
            DeploymentStrategyKind::Static => write!(f, "static"),
        }
    }
}

/// Root VPN parameters (registry hub-and-spoke)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootVpnSettings {
    pub subnet: Ipv4Network,
    pub port: u16,
}

impl Default for RootVpnSettings {
    fn default() -> Self {
        Self {
            subnet: "10.255.128.0/22".parse().unwrap(),
            port: 51820,
        }
    }
}

/// Backbone VPN parameters (cell-to-cell P2P links)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackboneVpnSettings {
    pub subnet: Ipv4Network,
    /// UDP port of the i-th link is `port + i`
    pub port: u16,
    pub deployment_strategy: DeploymentStrategyKind,
    #[serde(default)]
    pub deployment_strategy_args: serde_json::Value,
}

impl Default for BackboneVpnSettings {
    fn default() -> Self {
        Self {
            subnet: "10.255.192.0/20".parse().unwrap(),
            port: 51900,
            deployment_strategy: DeploymentStrategyKind::default(),
            deployment_strategy_args: serde_json::Value::Null,
        }
    }
}

/// Particles VPN parameters (per-cell hub-and-spoke for roaming clients)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticlesVpnSettings {
    pub subnet: Ipv4Network,
    pub port: u16,
}

impl Default for ParticlesVpnSettings {
    fn default() -> Self {
        Self {
            subnet: "10.254.0.0/16".parse().unwrap(),
            port: 51821,
        }
    }
}

/// UVN-wide settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UvnSettings {
    #[serde(default)]
    pub timing_profile: TimingProfile,
    #[serde(default)]
    pub root_vpn: RootVpnSettings,
    #[serde(default)]
    pub backbone_vpn: BackboneVpnSettings,
    #[serde(default)]
    pub particles_vpn: ParticlesVpnSettings,
    #[serde(default = "default_true")]
    pub enable_particles_vpn: bool,
    #[serde(default = "default_true")]
    pub enable_root_vpn: bool,
}

fn default_true() -> bool {
    true
}

impl Default for UvnSettings {
    fn default() -> Self {
        Self {
            timing_profile: TimingProfile::default(),
            root_vpn: RootVpnSettings::default(),
            backbone_vpn: BackboneVpnSettings::default(),
            particles_vpn: ParticlesVpnSettings::default(),
            enable_particles_vpn: true,
            enable_root_vpn: true,
        }
    }
}

/// Per-cell settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellSettings {
    #[serde(default = "default_httpd_port")]
    pub httpd_port: u16,
    #[serde(default = "default_true")]
    pub enable_particles_vpn: bool,
}

fn default_httpd_port() -> u16 {
    8443
}

impl Default for CellSettings {
    fn default() -> Self {
        Self {
            httpd_port: 8443,
            enable_particles_vpn: true,
        }
    }
}

/// Effective particles-VPN flag: the uvn enables it, the cell enables it, and
/// the cell is publicly reachable
pub fn cell_enables_particles_vpn(uvn: &Uvn, cell: &Cell) -> bool {
    uvn.settings.enable_particles_vpn
        && cell.settings.enable_particles_vpn
        && cell.address.is_some()
}

/// A local network interface attached to a LAN
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NicDescriptor {
    pub name: String,
    pub address: Ipv4Addr,
    pub subnet: Ipv4Network,
}

/// An attached LAN: interface plus the gateway used to reach it
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LanDescriptor {
    pub nic: NicDescriptor,
    pub gw: Ipv4Addr,
}

impl std::fmt::Display for LanDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.nic.subnet, self.nic.name)
    }
}

/// Detect overlaps between candidate networks and the LANs already exported
/// by other cells. Keys are the clashing candidate networks, values the
/// `(cell name, network)` pairs they overlap with.
pub fn detect_network_clashes(
    existing: &[(String, BTreeSet<Ipv4Network>)],
    candidate: &BTreeSet<Ipv4Network>,
) -> BTreeMap<Ipv4Network, BTreeSet<(String, Ipv4Network)>> {
    let mut clashes: BTreeMap<Ipv4Network, BTreeSet<(String, Ipv4Network)>> = BTreeMap::new();
    for net in candidate {
        for (name, nets) in existing {
            for other in nets {
                if net.overlaps(*other) {
                    clashes
                        .entry(*net)
                        .or_default()
                        .insert((name.clone(), *other));
                }
            }
        }
    }
    clashes
}

/// Render a clash map in the `{net: {(cell, net)}}` form used by errors
pub fn format_network_clashes(
    clashes: &BTreeMap<Ipv4Network, BTreeSet<(String, Ipv4Network)>>,
) -> String {
    let entries: Vec<String> = clashes
        .iter()
        .map(|(net, matches)| {
            let matches: Vec<String> = matches
                .iter()
                .map(|(name, other)| format!("({name}, {other})"))
                .collect();
            format!("{}: {{{}}}", net, matches.join(", "))
        })
        .collect();
    format!("{{{}}}", entries.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_user_id() {
        let (email, name) = User::parse_user_id("Jane Doe <jane@example.org>").unwrap();
        assert_eq!(email, "jane@example.org");
        assert_eq!(name, "Jane Doe");

        let (email, name) = User::parse_user_id("root@example.org").unwrap();
        assert_eq!(email, "root@example.org");
        assert_eq!(name, "root");

        assert!(User::parse_user_id("not-an-email").is_err());
    }

    #[test]
    fn test_password_digest_roundtrip() {
        let user = User::new(
            "jane@example.org".into(),
            "Jane".into(),
            "u1".into(),
            "hunter2",
        );
        assert!(user.check_password("hunter2"));
        assert!(!user.check_password("hunter3"));
        // Salted: two digests of the same password differ
        let other = User::new(
            "jane@example.org".into(),
            "Jane".into(),
            "u1".into(),
            "hunter2",
        );
        assert_ne!(user.password, other.password);
    }

    #[test]
    fn test_readonly_rejects_mutation() {
        let mut cell = Cell::new(1, "c1".into());
        cell.readonly = true;
        let err = cell.set_address(Some("203.0.113.1".into())).unwrap_err();
        assert!(matches!(err, Error::ReadOnly("address")));
    }

    #[test]
    fn test_change_tracking() {
        let mut cell = Cell::new(1, "c1".into());
        assert!(cell.changed.is_empty());
        cell.set_address(Some("203.0.113.1".into())).unwrap();
        assert!(cell.changed.contains("address"));
        // Assigning the same value again does not re-mark
        cell.changed.clear();
        cell.set_address(Some("203.0.113.1".into())).unwrap();
        assert!(cell.changed.is_empty());
    }

    #[test]
    fn test_network_clash_detection() {
        let existing = vec![(
            "c1".to_string(),
            ["10.1.0.0/24".parse().unwrap()].into_iter().collect(),
        )];
        let candidate: BTreeSet<Ipv4Network> =
            ["10.1.0.0/25".parse().unwrap()].into_iter().collect();
        let clashes = detect_network_clashes(&existing, &candidate);
        assert_eq!(clashes.len(), 1);
        let formatted = format_network_clashes(&clashes);
        assert_eq!(formatted, "{10.1.0.0/25: {(c1, 10.1.0.0/24)}}");

        let disjoint: BTreeSet<Ipv4Network> =
            ["10.2.0.0/24".parse().unwrap()].into_iter().collect();
        assert!(detect_network_clashes(&existing, &disjoint).is_empty());
    }
}
