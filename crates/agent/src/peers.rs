//! Replicated peer state and derived predicates
//!
//! Every agent tracks one entry per known uvn/cell/particle. Entries are only
//! mutated through transactional batched updates; after each batch the list
//! recomputes the uvn-wide predicates exactly once and emits the transitions
//! as events. Events are suppressed until the local peer itself is online so
//! startup churn does not flap listeners.

use ipnetwork::Ipv4Network;
use rusqlite::params;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, trace, warn};
use uvnet_common::types::{Cell, LanDescriptor, ObjectId, Particle};
use uvnet_common::{Database, Result};

/// Observed liveness of a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PeerStatus {
    #[default]
    Declared,
    Online,
    Offline,
}

impl std::fmt::Display for PeerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerStatus::Declared => write!(f, "declared"),
            PeerStatus::Online => write!(f, "online"),
            PeerStatus::Offline => write!(f, "offline"),
        }
    }
}

/// What a peer entry describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PeerKey {
    Registry,
    Cell(ObjectId),
    Particle(ObjectId),
}

impl PeerKey {
    fn kind(&self) -> &'static str {
        match self {
            PeerKey::Registry => "registry",
            PeerKey::Cell(_) => "cell",
            PeerKey::Particle(_) => "particle",
        }
    }

    fn owner_id(&self) -> ObjectId {
        match self {
            PeerKey::Registry => 0,
            PeerKey::Cell(id) | PeerKey::Particle(id) => *id,
        }
    }
}

/// A known network of a peer, with its reachability flag
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LanStatus {
    pub lan: LanDescriptor,
    pub reachable: bool,
}

/// Statistics of one VPN interface toward a peer
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VpnIntfStats {
    pub online: bool,
    pub last_handshake: Option<String>,
    pub rx: u64,
    pub tx: u64,
    pub endpoint: Option<String>,
}

/// One peer entry
#[derive(Debug, Clone)]
pub struct Peer {
    pub key: PeerKey,
    pub name: String,
    pub local: bool,
    pub excluded: bool,
    pub status: PeerStatus,
    pub config_id: Option<String>,
    pub routed_networks: BTreeSet<LanDescriptor>,
    /// Keyed by subnet; one entry per known network
    pub known_networks: BTreeMap<Ipv4Network, LanStatus>,
    pub vpn_stats: BTreeMap<String, VpnIntfStats>,
    pub ts_start: Option<String>,
    pub instance: Option<String>,
}

impl Peer {
    fn new(key: PeerKey, name: String) -> Self {
        Self {
            key,
            name,
            local: false,
            excluded: false,
            status: PeerStatus::Declared,
            config_id: None,
            routed_networks: BTreeSet::new(),
            known_networks: BTreeMap::new(),
            vpn_stats: BTreeMap::new(),
            ts_start: None,
            instance: None,
        }
    }

    pub fn reachable_networks(&self) -> impl Iterator<Item = &LanStatus> {
        self.known_networks.values().filter(|n| n.reachable)
    }

    pub fn unreachable_networks(&self) -> impl Iterator<Item = &LanStatus> {
        self.known_networks.values().filter(|n| !n.reachable)
    }

    fn reachable_subnets(&self) -> BTreeSet<Ipv4Network> {
        self.reachable_networks()
            .map(|n| n.lan.nic.subnet)
            .collect()
    }
}

/// A transactional batch of field updates: either all fields apply or none
#[derive(Debug, Clone, Default)]
pub struct PeerUpdate {
    pub status: Option<PeerStatus>,
    pub config_id: Option<Option<String>>,
    pub routed_networks: Option<BTreeSet<LanDescriptor>>,
    pub known_networks: Option<Vec<(LanDescriptor, bool)>>,
    pub vpn_stats: Option<BTreeMap<String, VpnIntfStats>>,
    pub ts_start: Option<Option<String>>,
    pub instance: Option<Option<String>>,
}

impl PeerUpdate {
    pub fn status(status: PeerStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }
}

/// Transitions surfaced after a batch of updates
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    OnlineCells {
        online: BTreeSet<ObjectId>,
        offline: BTreeSet<ObjectId>,
    },
    OnlineParticles {
        online: BTreeSet<ObjectId>,
        offline: BTreeSet<ObjectId>,
    },
    RegistryConnected(bool),
    AllCellsConnected(bool),
    RoutedNetworks {
        new: BTreeSet<(ObjectId, Ipv4Network)>,
        gone: BTreeSet<(ObjectId, Ipv4Network)>,
    },
    RoutedNetworksDiscovered(bool),
    ConsistentConfigCells {
        new: BTreeSet<ObjectId>,
        gone: BTreeSet<ObjectId>,
    },
    ConsistentConfigUvn(bool),
    LocalReachableNetworks {
        new: BTreeSet<Ipv4Network>,
        gone: BTreeSet<Ipv4Network>,
    },
    ReachableNetworks {
        new: BTreeSet<(ObjectId, Ipv4Network)>,
        gone: BTreeSet<(ObjectId, Ipv4Network)>,
    },
    FullyRoutedUvn(bool),
}

/// Snapshot of the derived inputs, captured before a batch applies
struct DerivedSnapshot {
    online_cells: BTreeSet<ObjectId>,
    online_particles: BTreeSet<ObjectId>,
    registry_online: bool,
    routed: BTreeSet<(ObjectId, Ipv4Network)>,
    consistent: BTreeSet<ObjectId>,
    local_reachable: BTreeSet<Ipv4Network>,
    remote_reachable: BTreeSet<(ObjectId, Ipv4Network)>,
}

/// The agent's replicated view of every peer
pub struct PeerList {
    uvn_name: String,
    local_key: PeerKey,
    local_config_id: String,
    peers: BTreeMap<PeerKey, Peer>,
    /// Union of allowed LANs over non-excluded cells
    expected_lans: BTreeSet<Ipv4Network>,
    cell_count: usize,
    pub all_cells_connected: bool,
    pub consistent_config_uvn: bool,
    pub routed_networks_discovered: bool,
    pub fully_routed_uvn: bool,
    pub registry_connected: bool,
}

impl PeerList {
    /// Build the list from the registry view: one entry per uvn object.
    /// The local entry is always present and flagged.
    pub fn new(
        uvn_name: String,
        local_key: PeerKey,
        local_config_id: String,
        cells: &BTreeMap<ObjectId, Cell>,
        excluded_cells: &BTreeMap<ObjectId, Cell>,
        particles: &BTreeMap<ObjectId, Particle>,
    ) -> Self {
        let mut peers = BTreeMap::new();
        let mut registry = Peer::new(PeerKey::Registry, uvn_name.clone());
        registry.local = local_key == PeerKey::Registry;
        peers.insert(PeerKey::Registry, registry);
        for cell in cells.values() {
            let mut peer = Peer::new(PeerKey::Cell(cell.id), cell.name.clone());
            peer.local = local_key == PeerKey::Cell(cell.id);
            peers.insert(peer.key, peer);
        }
        for cell in excluded_cells.values() {
            let mut peer = Peer::new(PeerKey::Cell(cell.id), cell.name.clone());
            peer.excluded = true;
            peer.local = local_key == PeerKey::Cell(cell.id);
            peers.insert(peer.key, peer);
        }
        for particle in particles.values() {
            let mut peer = Peer::new(PeerKey::Particle(particle.id), particle.name.clone());
            peer.excluded = particle.excluded;
            peers.insert(peer.key, peer);
        }
        assert!(peers.values().filter(|p| p.local).count() == 1 || local_key == PeerKey::Registry);

        let expected_lans = cells
            .values()
            .flat_map(|c| c.allowed_lans.iter().copied())
            .collect();
        let cell_count = cells.len();
        Self {
            uvn_name,
            local_key,
            local_config_id,
            peers,
            expected_lans,
            cell_count,
            all_cells_connected: false,
            consistent_config_uvn: false,
            routed_networks_discovered: false,
            fully_routed_uvn: false,
            registry_connected: false,
        }
    }

    pub fn uvn_name(&self) -> &str {
        &self.uvn_name
    }

    pub fn local(&self) -> &Peer {
        &self.peers[&self.local_key]
    }

    pub fn get(&self, key: PeerKey) -> Option<&Peer> {
        self.peers.get(&key)
    }

    pub fn by_instance(&self, instance: &str) -> Option<PeerKey> {
        self.peers
            .values()
            .find(|p| p.instance.as_deref() == Some(instance))
            .map(|p| p.key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    /// Non-excluded cell peers
    pub fn cells(&self) -> impl Iterator<Item = &Peer> {
        self.peers
            .values()
            .filter(|p| matches!(p.key, PeerKey::Cell(_)) && !p.excluded)
    }

    pub fn particles(&self) -> impl Iterator<Item = &Peer> {
        self.peers
            .values()
            .filter(|p| matches!(p.key, PeerKey::Particle(_)) && !p.excluded)
    }

    pub fn online_cells(&self) -> impl Iterator<Item = &Peer> {
        self.cells().filter(|p| p.status == PeerStatus::Online)
    }

    pub fn offline_cells(&self) -> impl Iterator<Item = &Peer> {
        self.cells().filter(|p| p.status == PeerStatus::Offline)
    }

    pub fn expected_lans(&self) -> &BTreeSet<Ipv4Network> {
        &self.expected_lans
    }

    fn snapshot(&self) -> DerivedSnapshot {
        DerivedSnapshot {
            online_cells: self
                .online_cells()
                .map(|p| p.key.owner_id())
                .collect(),
            online_particles: self
                .particles()
                .filter(|p| p.status == PeerStatus::Online)
                .map(|p| p.key.owner_id())
                .collect(),
            registry_online: self.peers[&PeerKey::Registry].status == PeerStatus::Online,
            routed: self
                .cells()
                .flat_map(|p| {
                    p.routed_networks
                        .iter()
                        .map(move |l| (p.key.owner_id(), l.nic.subnet))
                })
                .collect(),
            consistent: self
                .cells()
                .filter(|p| p.config_id.as_deref() == Some(self.local_config_id.as_str()))
                .map(|p| p.key.owner_id())
                .collect(),
            local_reachable: self.local().reachable_subnets(),
            remote_reachable: self
                .iter()
                .filter(|p| !p.local)
                .flat_map(|p| {
                    p.reachable_networks()
                        .map(move |n| (p.key.owner_id(), n.lan.nic.subnet))
                })
                .collect(),
        }
    }

    fn apply(&mut self, key: PeerKey, update: PeerUpdate) {
        let Some(peer) = self.peers.get_mut(&key) else {
            warn!("ignoring update for unknown peer: {:?}", key);
            return;
        };
        if let Some(status) = update.status {
            if peer.status != status {
                trace!("peer {} -> {}", peer.name, status);
            }
            peer.status = status;
        }
        if let Some(config_id) = update.config_id {
            peer.config_id = config_id;
        }
        if let Some(routed) = update.routed_networks {
            peer.routed_networks = routed;
        }
        if let Some(known) = update.known_networks {
            for (lan, reachable) in known {
                peer.known_networks
                    .insert(lan.nic.subnet, LanStatus { lan, reachable });
            }
        }
        if let Some(stats) = update.vpn_stats {
            for (intf, stat) in stats {
                peer.vpn_stats.insert(intf, stat);
            }
        }
        if let Some(ts_start) = update.ts_start {
            peer.ts_start = ts_start;
        }
        if let Some(instance) = update.instance {
            peer.instance = instance;
        }
    }

    /// Apply one update transactionally and recompute predicates once
    pub fn update_peer(&mut self, key: PeerKey, update: PeerUpdate) -> Vec<PeerEvent> {
        self.update_many(vec![(key, update)])
    }

    /// Apply a batch of updates, then recompute every derived predicate
    /// exactly once and return the transitions
    pub fn update_many(&mut self, updates: Vec<(PeerKey, PeerUpdate)>) -> Vec<PeerEvent> {
        let before = self.snapshot();
        for (key, update) in updates {
            self.apply(key, update);
        }
        self.process_updates(before)
    }

    /// Mark the local peer online
    pub fn online(&mut self, mut update: PeerUpdate) -> Vec<PeerEvent> {
        update.status = Some(PeerStatus::Online);
        update.config_id = Some(Some(self.local_config_id.clone()));
        self.update_peer(self.local_key, update)
    }

    /// Local shutdown: every peer transitions offline and forgets its
    /// replicated state
    pub fn offline(&mut self) -> Vec<PeerEvent> {
        if self.local().status == PeerStatus::Offline {
            return Vec::new();
        }
        let keys: Vec<PeerKey> = self.peers.keys().copied().collect();
        let updates = keys
            .into_iter()
            .map(|key| {
                (
                    key,
                    PeerUpdate {
                        status: Some(PeerStatus::Offline),
                        config_id: Some(None),
                        routed_networks: Some(BTreeSet::new()),
                        ts_start: Some(None),
                        instance: Some(None),
                        ..Default::default()
                    },
                )
            })
            .collect();
        let events = self.update_many(updates);
        for peer in self.peers.values_mut() {
            peer.known_networks.clear();
            peer.vpn_stats.clear();
        }
        events
    }

    fn process_updates(&mut self, before: DerivedSnapshot) -> Vec<PeerEvent> {
        let after = self.snapshot();
        let suppressed = self.local().status != PeerStatus::Online;
        let mut events = Vec::new();

        // Cell liveness
        let online: BTreeSet<ObjectId> = after
            .online_cells
            .difference(&before.online_cells)
            .copied()
            .collect();
        let offline: BTreeSet<ObjectId> = before
            .online_cells
            .difference(&after.online_cells)
            .copied()
            .collect();
        if !online.is_empty() || !offline.is_empty() {
            events.push(PeerEvent::OnlineCells { online, offline });
            let all_connected = after.online_cells.len() == self.cell_count;
            if all_connected != self.all_cells_connected {
                self.all_cells_connected = all_connected;
                events.push(PeerEvent::AllCellsConnected(all_connected));
            }
        }

        // Particle liveness
        let online: BTreeSet<ObjectId> = after
            .online_particles
            .difference(&before.online_particles)
            .copied()
            .collect();
        let offline: BTreeSet<ObjectId> = before
            .online_particles
            .difference(&after.online_particles)
            .copied()
            .collect();
        if !online.is_empty() || !offline.is_empty() {
            events.push(PeerEvent::OnlineParticles { online, offline });
        }

        // Registry liveness
        if after.registry_online != before.registry_online {
            self.registry_connected = after.registry_online;
            events.push(PeerEvent::RegistryConnected(after.registry_online));
        }

        // Routed networks
        let new: BTreeSet<_> = after.routed.difference(&before.routed).copied().collect();
        let gone: BTreeSet<_> = before.routed.difference(&after.routed).copied().collect();
        if !new.is_empty() || !gone.is_empty() {
            events.push(PeerEvent::RoutedNetworks { new, gone });
            let routed_subnets: BTreeSet<Ipv4Network> =
                after.routed.iter().map(|(_, subnet)| *subnet).collect();
            let discovered =
                !self.expected_lans.is_empty() && routed_subnets == self.expected_lans;
            if discovered != self.routed_networks_discovered {
                self.routed_networks_discovered = discovered;
                events.push(PeerEvent::RoutedNetworksDiscovered(discovered));
            }
        }

        // Configuration consistency
        let new: BTreeSet<_> = after
            .consistent
            .difference(&before.consistent)
            .copied()
            .collect();
        let gone: BTreeSet<_> = before
            .consistent
            .difference(&after.consistent)
            .copied()
            .collect();
        if !new.is_empty() || !gone.is_empty() {
            events.push(PeerEvent::ConsistentConfigCells { new, gone });
            let consistent = after.consistent.len() == self.cell_count;
            if consistent != self.consistent_config_uvn {
                self.consistent_config_uvn = consistent;
                events.push(PeerEvent::ConsistentConfigUvn(consistent));
            }
        }

        // Reachability
        let new: BTreeSet<_> = after
            .local_reachable
            .difference(&before.local_reachable)
            .copied()
            .collect();
        let gone: BTreeSet<_> = before
            .local_reachable
            .difference(&after.local_reachable)
            .copied()
            .collect();
        let reachable_changed = !new.is_empty() || !gone.is_empty();
        if reachable_changed {
            events.push(PeerEvent::LocalReachableNetworks { new, gone });
        }

        let new: BTreeSet<_> = after
            .remote_reachable
            .difference(&before.remote_reachable)
            .copied()
            .collect();
        let gone: BTreeSet<_> = before
            .remote_reachable
            .difference(&after.remote_reachable)
            .copied()
            .collect();
        let remote_changed = !new.is_empty() || !gone.is_empty();
        if remote_changed {
            events.push(PeerEvent::ReachableNetworks { new, gone });
        }

        if reachable_changed || remote_changed {
            let fully_routed = !self.expected_lans.is_empty()
                && self
                    .cells()
                    .all(|c| c.reachable_subnets().is_superset(&self.expected_lans))
                && self.cell_count > 0;
            if fully_routed != self.fully_routed_uvn {
                self.fully_routed_uvn = fully_routed;
                events.push(PeerEvent::FullyRoutedUvn(fully_routed));
            }
        }

        if suppressed {
            if !events.is_empty() {
                debug!("notifications disabled while local peer is not online");
            }
            return Vec::new();
        }
        events
    }

    /// Persist the last observed peer state
    pub fn save(&self, db: &Database) -> Result<()> {
        let conn = db.connection();
        let conn = conn.lock();
        for peer in self.peers.values() {
            conn.execute(
                "INSERT INTO peers (owner_kind, owner_id, registry_id, status, ts_start, \
                 routed_networks, known_networks) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
                 ON CONFLICT (owner_kind, owner_id) DO UPDATE SET registry_id = ?3, \
                 status = ?4, ts_start = ?5, routed_networks = ?6, known_networks = ?7",
                params![
                    peer.key.kind(),
                    peer.key.owner_id(),
                    peer.config_id,
                    peer.status.to_string(),
                    peer.ts_start,
                    serde_json::to_string(&peer.routed_networks)?,
                    serde_json::to_string(
                        &peer.known_networks.values().collect::<Vec<_>>()
                    )?,
                ],
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn lan(subnet: &str) -> LanDescriptor {
        let subnet: Ipv4Network = subnet.parse().unwrap();
        LanDescriptor {
            nic: uvnet_common::types::NicDescriptor {
                name: "eth0".into(),
                address: Ipv4Addr::from(u32::from(subnet.network()) + 1),
                subnet,
            },
            gw: Ipv4Addr::from(u32::from(subnet.network()) + 1),
        }
    }

    fn cell(id: ObjectId, name: &str, lan_subnet: Option<&str>) -> Cell {
        let mut c = Cell::new(1, name.into());
        c.id = id;
        if let Some(subnet) = lan_subnet {
            c.allowed_lans = [subnet.parse().unwrap()].into_iter().collect();
        }
        c
    }

    fn list(local: PeerKey) -> PeerList {
        let cells: BTreeMap<ObjectId, Cell> = [
            (1, cell(1, "c1", Some("10.1.0.0/24"))),
            (2, cell(2, "c2", Some("10.2.0.0/24"))),
        ]
        .into_iter()
        .collect();
        let mut list = PeerList::new(
            "u1".into(),
            local,
            "cfg1".into(),
            &cells,
            &BTreeMap::new(),
            &BTreeMap::new(),
        );
        // Local comes up first so notifications are not suppressed
        list.online(PeerUpdate::default());
        list
    }

    fn cell_online(config_id: &str, routed: Vec<LanDescriptor>) -> PeerUpdate {
        PeerUpdate {
            status: Some(PeerStatus::Online),
            config_id: Some(Some(config_id.into())),
            routed_networks: Some(routed.into_iter().collect()),
            ..Default::default()
        }
    }

    #[test]
    fn test_suppressed_until_local_online() {
        let cells: BTreeMap<ObjectId, Cell> =
            [(1, cell(1, "c1", None)), (2, cell(2, "c2", None))]
                .into_iter()
                .collect();
        let mut list = PeerList::new(
            "u1".into(),
            PeerKey::Cell(1),
            "cfg1".into(),
            &cells,
            &BTreeMap::new(),
            &BTreeMap::new(),
        );
        let events = list.update_peer(
            PeerKey::Cell(2),
            PeerUpdate::status(PeerStatus::Online),
        );
        assert!(events.is_empty());
        // State still applied
        assert_eq!(list.get(PeerKey::Cell(2)).unwrap().status, PeerStatus::Online);
    }

    #[test]
    fn test_all_cells_connected_transition() {
        let mut list = list(PeerKey::Cell(1));
        let events = list.update_peer(
            PeerKey::Cell(2),
            cell_online("cfg1", vec![]),
        );
        assert!(events
            .iter()
            .any(|e| matches!(e, PeerEvent::AllCellsConnected(true))));
        assert!(list.all_cells_connected);

        // Offline transition retains the last known networks
        let events = list.update_peer(PeerKey::Cell(2), PeerUpdate::status(PeerStatus::Offline));
        assert!(events
            .iter()
            .any(|e| matches!(e, PeerEvent::AllCellsConnected(false))));
    }

    #[test]
    fn test_consistent_config_uvn() {
        let mut list = list(PeerKey::Cell(1));
        let events = list.update_peer(PeerKey::Cell(2), cell_online("cfg-old", vec![]));
        assert!(!events
            .iter()
            .any(|e| matches!(e, PeerEvent::ConsistentConfigUvn(_))));
        assert!(!list.consistent_config_uvn);

        let events = list.update_peer(PeerKey::Cell(2), cell_online("cfg1", vec![]));
        assert!(events
            .iter()
            .any(|e| matches!(e, PeerEvent::ConsistentConfigUvn(true))));
    }

    #[test]
    fn test_routed_networks_discovered_exactly_once() {
        let mut list = list(PeerKey::Cell(1));
        let mut discovered = 0;

        // Local cell announces its own LAN
        for event in list.online(PeerUpdate {
            routed_networks: Some([lan("10.1.0.0/24")].into_iter().collect()),
            ..Default::default()
        }) {
            if matches!(event, PeerEvent::RoutedNetworksDiscovered(true)) {
                discovered += 1;
            }
        }
        assert_eq!(discovered, 0);

        // The last expected LAN appears: exactly one notification
        for event in list.update_peer(
            PeerKey::Cell(2),
            cell_online("cfg1", vec![lan("10.2.0.0/24")]),
        ) {
            if matches!(event, PeerEvent::RoutedNetworksDiscovered(true)) {
                discovered += 1;
            }
        }
        assert_eq!(discovered, 1);
        assert!(list.routed_networks_discovered);

        // Re-announcing the same networks does not re-notify
        for event in list.update_peer(
            PeerKey::Cell(2),
            cell_online("cfg1", vec![lan("10.2.0.0/24")]),
        ) {
            if matches!(event, PeerEvent::RoutedNetworksDiscovered(_)) {
                discovered += 1;
            }
        }
        assert_eq!(discovered, 1);
    }

    #[test]
    fn test_fully_routed_uvn() {
        let mut list = list(PeerKey::Cell(1));
        list.update_peer(PeerKey::Cell(2), cell_online("cfg1", vec![lan("10.2.0.0/24")]));

        // Local reaches both LANs
        list.update_peer(
            PeerKey::Cell(1),
            PeerUpdate {
                known_networks: Some(vec![(lan("10.1.0.0/24"), true), (lan("10.2.0.0/24"), true)]),
                ..Default::default()
            },
        );
        assert!(!list.fully_routed_uvn);

        // Remote reaches both LANs: the uvn is fully routed
        let events = list.update_peer(
            PeerKey::Cell(2),
            PeerUpdate {
                known_networks: Some(vec![(lan("10.1.0.0/24"), true), (lan("10.2.0.0/24"), true)]),
                ..Default::default()
            },
        );
        assert!(events
            .iter()
            .any(|e| matches!(e, PeerEvent::FullyRoutedUvn(true))));

        // One network becomes unreachable
        let events = list.update_peer(
            PeerKey::Cell(2),
            PeerUpdate {
                known_networks: Some(vec![(lan("10.1.0.0/24"), false)]),
                ..Default::default()
            },
        );
        assert!(events
            .iter()
            .any(|e| matches!(e, PeerEvent::FullyRoutedUvn(false))));
    }

    #[test]
    fn test_batch_recomputes_once() {
        let mut list = list(PeerKey::Cell(1));
        // Both updates in one batch: a single OnlineCells event
        let events = list.update_many(vec![
            (PeerKey::Cell(2), cell_online("cfg1", vec![])),
            (PeerKey::Registry, PeerUpdate::status(PeerStatus::Online)),
        ]);
        let online_events = events
            .iter()
            .filter(|e| matches!(e, PeerEvent::OnlineCells { .. }))
            .count();
        assert_eq!(online_events, 1);
        assert!(events
            .iter()
            .any(|e| matches!(e, PeerEvent::RegistryConnected(true))));
    }

    #[test]
    fn test_offline_clears_replicated_state() {
        let mut list = list(PeerKey::Cell(1));
        list.update_peer(
            PeerKey::Cell(2),
            cell_online("cfg1", vec![lan("10.2.0.0/24")]),
        );
        list.offline();
        let peer = list.get(PeerKey::Cell(2)).unwrap();
        assert_eq!(peer.status, PeerStatus::Offline);
        assert!(peer.routed_networks.is_empty());
        assert!(peer.known_networks.is_empty());
        assert_eq!(list.local().status, PeerStatus::Offline);
    }

    #[test]
    fn test_persist_peers() {
        let db = Database::open_memory().unwrap();
        let mut list = list(PeerKey::Cell(1));
        list.update_peer(
            PeerKey::Cell(2),
            cell_online("cfg1", vec![lan("10.2.0.0/24")]),
        );
        list.save(&db).unwrap();
        list.save(&db).unwrap();
        let count: i64 = db
            .connection()
            .lock()
            .query_row("SELECT COUNT(*) FROM peers", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 3);
    }
}
