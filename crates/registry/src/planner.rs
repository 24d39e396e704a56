//! Backbone topology planner
//!
//! Turns a set of cells into a P2P link map: for every ordered peer pair, a
//! port index, both endpoint addresses, and the /31 subnet the link lives in.
//! The output is deterministic for a given (input, strategy, seed).

use ipnetwork::Ipv4Network;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;
use tracing::{debug, warn};
use uvnet_common::types::{DeploymentStrategyKind, ObjectId};
use uvnet_common::{Error, Result};

/// One end of a backbone link, as seen from the owning cell
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerLink {
    /// Compact per-cell index; the link's UDP port is `backbone_port + port_index`
    pub port_index: usize,
    /// Address of the owning cell inside the /31
    pub addr_local: Ipv4Addr,
    /// Address of the remote cell inside the /31
    pub addr_remote: Ipv4Addr,
    pub subnet: Ipv4Network,
}

/// All links of one cell
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployedPeer {
    /// Cell count at generation time
    pub n: usize,
    pub peers: BTreeMap<ObjectId, PeerLink>,
}

/// The backbone deployment: a P2P link map over all cells
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct P2pLinksMap {
    pub peers: BTreeMap<ObjectId, DeployedPeer>,
    pub generation_ts: String,
}

impl P2pLinksMap {
    /// Neighbors of a cell, sorted by port index
    pub fn peers_of(&self, cell: ObjectId) -> Vec<ObjectId> {
        let Some(peer) = self.peers.get(&cell) else {
            return Vec::new();
        };
        let mut out: Vec<(usize, ObjectId)> = peer
            .peers
            .iter()
            .map(|(id, link)| (link.port_index, *id))
            .collect();
        out.sort();
        out.into_iter().map(|(_, id)| id).collect()
    }

    /// Local backbone addresses of a cell, sorted by port index
    pub fn interfaces_of(&self, cell: ObjectId) -> Vec<Ipv4Addr> {
        self.peers_of(cell)
            .into_iter()
            .filter_map(|remote| self.link(cell, remote).map(|l| l.addr_local))
            .collect()
    }

    pub fn link(&self, cell: ObjectId, remote: ObjectId) -> Option<&PeerLink> {
        self.peers.get(&cell)?.peers.get(&remote)
    }

    /// Number of undirected links
    pub fn link_count(&self) -> usize {
        self.peers.values().map(|p| p.peers.len()).sum::<usize>() / 2
    }

    pub fn is_empty(&self) -> bool {
        self.peers.values().all(|p| p.peers.is_empty())
    }
}

/// Sequential /31 allocator over the backbone parent subnet
struct LinkAllocationMap {
    subnet: Ipv4Network,
    next: u32,
}

impl LinkAllocationMap {
    fn new(subnet: Ipv4Network) -> Self {
        Self {
            subnet,
            next: u32::from(subnet.network()) + 2,
        }
    }

    fn allocate_address(&mut self) -> Result<Ipv4Addr> {
        let addr = Ipv4Addr::from(self.next);
        if !self.subnet.contains(addr) {
            return Err(Error::SubnetExhausted(self.subnet));
        }
        self.next += 1;
        Ok(addr)
    }

    /// Allocate both ends of a link and verify they share the /31
    fn allocate_link(&mut self) -> Result<(Ipv4Addr, Ipv4Addr, Ipv4Network)> {
        let addr_a = self.allocate_address()?;
        let addr_b = self.allocate_address()?;
        let net_a = Ipv4Network::new(addr_a, 31)
            .map_err(|e| Error::Internal(e.to_string()))?;
        let subnet = Ipv4Network::new(net_a.network(), 31)
            .map_err(|e| Error::Internal(e.to_string()))?;
        if !subnet.contains(addr_b) {
            return Err(Error::Internal(format!(
                "peer addresses not in the same /31: {addr_a} {addr_b}"
            )));
        }
        Ok((addr_a, addr_b, subnet))
    }
}

/// Planner input: cell ids partitioned into public and private
#[derive(Debug, Clone, Default)]
pub struct PlannerInput {
    pub peers: BTreeSet<ObjectId>,
    pub private_peers: BTreeSet<ObjectId>,
}

impl PlannerInput {
    pub fn public_peers(&self) -> BTreeSet<ObjectId> {
        self.peers.difference(&self.private_peers).copied().collect()
    }

    fn is_private(&self, id: ObjectId) -> bool {
        self.private_peers.contains(&id)
    }
}

/// Compute the backbone deployment for the given strategy
pub fn deploy(
    input: &PlannerInput,
    strategy: DeploymentStrategyKind,
    args: &serde_json::Value,
    backbone_subnet: Ipv4Network,
    generation_ts: &str,
) -> Result<P2pLinksMap> {
    let edges = match strategy {
        DeploymentStrategyKind::FullMesh => full_mesh_edges(input),
        DeploymentStrategyKind::Circular => ring_edges(input, 1),
        DeploymentStrategyKind::Crossed => crossed_edges(input),
        DeploymentStrategyKind::Random => random_edges(input, args)?,
        DeploymentStrategyKind::Static => static_edges(input, args)?,
    };
    debug!(
        "deployment strategy {} over {} peers: {} links",
        strategy,
        input.peers.len(),
        edges.len()
    );
    build_map(input, edges, backbone_subnet, generation_ts)
}

/// Turn an ordered undirected edge list into the link map
fn build_map(
    input: &PlannerInput,
    edges: Vec<(ObjectId, ObjectId)>,
    backbone_subnet: Ipv4Network,
    generation_ts: &str,
) -> Result<P2pLinksMap> {
    let mut alloc = LinkAllocationMap::new(backbone_subnet);
    let mut peers: BTreeMap<ObjectId, DeployedPeer> = BTreeMap::new();
    let n = input.peers.len();

    for (a, b) in edges {
        // Canonical order: the lower id gets the even address
        let (a, b) = (a.min(b), a.max(b));
        if peers.get(&a).map(|p| p.peers.contains_key(&b)).unwrap_or(false) {
            continue;
        }
        let (addr_a, addr_b, subnet) = alloc.allocate_link()?;
        let entry_a = peers.entry(a).or_insert_with(|| DeployedPeer {
            n,
            peers: BTreeMap::new(),
        });
        let port_a = entry_a.peers.len();
        entry_a.peers.insert(
            b,
            PeerLink {
                port_index: port_a,
                addr_local: addr_a,
                addr_remote: addr_b,
                subnet,
            },
        );
        let entry_b = peers.entry(b).or_insert_with(|| DeployedPeer {
            n,
            peers: BTreeMap::new(),
        });
        let port_b = entry_b.peers.len();
        entry_b.peers.insert(
            a,
            PeerLink {
                port_index: port_b,
                addr_local: addr_b,
                addr_remote: addr_a,
                subnet,
            },
        );
    }

    Ok(P2pLinksMap {
        peers,
        generation_ts: generation_ts.to_string(),
    })
}

/// Every pair connected, except private-to-private pairs while a public peer
/// exists to relay between them
fn full_mesh_edges(input: &PlannerInput) -> Vec<(ObjectId, ObjectId)> {
    let has_public = input.peers.len() != input.private_peers.len();
    let ids: Vec<ObjectId> = input.peers.iter().copied().collect();
    let mut edges = Vec::new();
    for (i, a) in ids.iter().enumerate() {
        for b in &ids[i + 1..] {
            if has_public && input.is_private(*a) && input.is_private(*b) {
                continue;
            }
            edges.push((*a, *b));
        }
    }
    edges
}

/// Ring order that keeps private cells apart when the public population
/// allows it: private cells are spliced between public ones
fn ring_order(input: &PlannerInput) -> Vec<ObjectId> {
    let publics: Vec<ObjectId> = input.public_peers().into_iter().collect();
    let privates: Vec<ObjectId> = input.private_peers.iter().copied().collect();
    if publics.is_empty() || privates.is_empty() {
        return input.peers.iter().copied().collect();
    }
    let mut order = Vec::with_capacity(input.peers.len());
    let mut privates = privates.into_iter();
    for public in publics {
        order.push(public);
        if let Some(private) = privates.next() {
            order.push(private);
        }
    }
    order.extend(privates);
    order
}

/// Each cell connected to its neighbors at ring distance 1..=width
fn ring_edges(input: &PlannerInput, width: usize) -> Vec<(ObjectId, ObjectId)> {
    let order = ring_order(input);
    let n = order.len();
    if n < 2 {
        return Vec::new();
    }
    if n == 2 {
        return vec![(order[0], order[1])];
    }
    let mut edges = Vec::new();
    let mut seen = BTreeSet::new();
    for dist in 1..=width {
        for i in 0..n {
            let a = order[i];
            let b = order[(i + dist) % n];
            if a == b {
                continue;
            }
            let key = (a.min(b), a.max(b));
            if seen.insert(key) {
                edges.push(key);
            }
        }
    }
    edges
}

/// Two concentric rings: immediate ring neighbors plus the ring that skips
/// one cell, four neighbors per cell once the uvn is large enough
fn crossed_edges(input: &PlannerInput) -> Vec<(ObjectId, ObjectId)> {
    ring_edges(input, 2)
}

fn args_u64(args: &serde_json::Value, key: &str) -> Option<u64> {
    args.get(key).and_then(|v| v.as_u64())
}

/// Random graph with a target degree, private-first, reproducible from the
/// seed declared in the strategy args
fn random_edges(
    input: &PlannerInput,
    args: &serde_json::Value,
) -> Result<Vec<(ObjectId, ObjectId)>> {
    let degree = args_u64(args, "degree").unwrap_or(2) as usize;
    let seed = args_u64(args, "seed").unwrap_or(0);
    let mut rng = StdRng::seed_from_u64(seed);

    let mut order: Vec<ObjectId> = input.private_peers.iter().copied().collect();
    order.extend(input.public_peers());

    let mut degrees: BTreeMap<ObjectId, usize> =
        input.peers.iter().map(|id| (*id, 0)).collect();
    let mut edges: Vec<(ObjectId, ObjectId)> = Vec::new();
    let mut seen: BTreeSet<(ObjectId, ObjectId)> = BTreeSet::new();

    let mut connect = |a: ObjectId,
                       candidates: &[ObjectId],
                       degrees: &mut BTreeMap<ObjectId, usize>,
                       seen: &mut BTreeSet<(ObjectId, ObjectId)>,
                       edges: &mut Vec<(ObjectId, ObjectId)>,
                       rng: &mut StdRng| {
        while degrees[&a] < degree {
            let available: Vec<ObjectId> = candidates
                .iter()
                .copied()
                .filter(|b| *b != a && !seen.contains(&(a.min(*b), a.max(*b))))
                .collect();
            if available.is_empty() {
                break;
            }
            let min_degree = available.iter().map(|b| degrees[b]).min().unwrap();
            let tied: Vec<ObjectId> = available
                .into_iter()
                .filter(|b| degrees[b] == min_degree)
                .collect();
            let b = tied[rng.gen_range(0..tied.len())];
            let key = (a.min(b), a.max(b));
            seen.insert(key);
            edges.push(key);
            *degrees.get_mut(&a).unwrap() += 1;
            *degrees.get_mut(&b).unwrap() += 1;
        }
    };

    let publics: Vec<ObjectId> = input.public_peers().into_iter().collect();
    let privates: Vec<ObjectId> = input.private_peers.iter().copied().collect();
    for a in order {
        if input.is_private(a) {
            // Public candidates first; private-to-private only in an
            // all-private deployment
            connect(a, &publics, &mut degrees, &mut seen, &mut edges, &mut rng);
            if publics.is_empty() {
                connect(a, &privates, &mut degrees, &mut seen, &mut edges, &mut rng);
            }
        } else {
            let all: Vec<ObjectId> = input.peers.iter().copied().collect();
            connect(a, &all, &mut degrees, &mut seen, &mut edges, &mut rng);
        }
    }

    // A connected backbone needs at least a spanning structure; warn if the
    // requested degree left isolated peers
    for (id, d) in &degrees {
        if *d == 0 && input.peers.len() > 1 {
            warn!("random deployment left cell {} without backbone links", id);
        }
    }
    Ok(edges)
}

/// Explicit pair list from the strategy args: `{"links": [[a, b], ...]}`
fn static_edges(
    input: &PlannerInput,
    args: &serde_json::Value,
) -> Result<Vec<(ObjectId, ObjectId)>> {
    let links = args
        .get("links")
        .and_then(|v| v.as_array())
        .ok_or_else(|| {
            Error::InvalidConfig("static deployment strategy requires a links list".into())
        })?;
    let mut edges = Vec::new();
    for link in links {
        let pair = link.as_array().filter(|p| p.len() == 2).ok_or_else(|| {
            Error::InvalidConfig(format!("invalid static link: {link}"))
        })?;
        let a = pair[0]
            .as_i64()
            .ok_or_else(|| Error::InvalidConfig(format!("invalid static link: {link}")))?;
        let b = pair[1]
            .as_i64()
            .ok_or_else(|| Error::InvalidConfig(format!("invalid static link: {link}")))?;
        for id in [a, b] {
            if !input.peers.contains(&id) {
                return Err(Error::InvalidConfig(format!(
                    "unknown cell in static deployment: {id}"
                )));
            }
        }
        if a == b {
            return Err(Error::InvalidConfig(format!(
                "cell linked to itself in static deployment: {a}"
            )));
        }
        edges.push((a, b));
    }
    Ok(edges)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(public: &[ObjectId], private: &[ObjectId]) -> PlannerInput {
        PlannerInput {
            peers: public.iter().chain(private).copied().collect(),
            private_peers: private.iter().copied().collect(),
        }
    }

    fn subnet() -> Ipv4Network {
        "10.255.192.0/20".parse().unwrap()
    }

    fn deploy_kind(
        input: &PlannerInput,
        kind: DeploymentStrategyKind,
        args: serde_json::Value,
    ) -> P2pLinksMap {
        deploy(input, kind, &args, subnet(), "ts0").unwrap()
    }

    #[test]
    fn test_single_cell_empty_backbone() {
        let map = deploy_kind(
            &input(&[1], &[]),
            DeploymentStrategyKind::FullMesh,
            serde_json::Value::Null,
        );
        assert!(map.is_empty());
    }

    #[test]
    fn test_full_mesh_private_cells_use_relay() {
        // c1, c2 private; r1 (id 3) public relay
        let map = deploy_kind(
            &input(&[3], &[1, 2]),
            DeploymentStrategyKind::FullMesh,
            serde_json::Value::Null,
        );
        assert_eq!(map.link_count(), 2);
        assert!(map.link(1, 3).is_some());
        assert!(map.link(2, 3).is_some());
        assert!(map.link(1, 2).is_none());
    }

    #[test]
    fn test_full_mesh_all_private_connects_directly() {
        let map = deploy_kind(
            &input(&[], &[1, 2, 3]),
            DeploymentStrategyKind::FullMesh,
            serde_json::Value::Null,
        );
        assert_eq!(map.link_count(), 3);
    }

    #[test]
    fn test_crossed_six_cells_four_neighbors() {
        let map = deploy_kind(
            &input(&[1, 2, 3, 4, 5, 6], &[]),
            DeploymentStrategyKind::Crossed,
            serde_json::Value::Null,
        );
        for cell in 1..=6 {
            let neighbors = map.peers_of(cell);
            assert_eq!(neighbors.len(), 4, "cell {cell}: {neighbors:?}");
            let ports: Vec<usize> = neighbors
                .iter()
                .map(|n| map.link(cell, *n).unwrap().port_index)
                .collect();
            assert_eq!(ports, vec![0, 1, 2, 3]);
        }
    }

    #[test]
    fn test_circular_two_neighbors() {
        let map = deploy_kind(
            &input(&[1, 2, 3, 4, 5], &[]),
            DeploymentStrategyKind::Circular,
            serde_json::Value::Null,
        );
        for cell in 1..=5 {
            assert_eq!(map.peers_of(cell).len(), 2);
        }
    }

    #[test]
    fn test_links_share_a_slash31() {
        let map = deploy_kind(
            &input(&[1, 2, 3, 4], &[]),
            DeploymentStrategyKind::FullMesh,
            serde_json::Value::Null,
        );
        let mut subnets = BTreeSet::new();
        for (cell, peer) in map.peers.iter() {
            for (remote, link) in &peer.peers {
                assert_eq!(link.subnet.prefix(), 31);
                assert!(link.subnet.contains(link.addr_local));
                assert!(link.subnet.contains(link.addr_remote));
                let reverse = map.link(*remote, *cell).unwrap();
                assert_eq!(reverse.subnet, link.subnet);
                assert_eq!(reverse.addr_local, link.addr_remote);
                subnets.insert(link.subnet);
                // Lower id holds the even address
                if cell < remote {
                    assert_eq!(u32::from(link.addr_local) % 2, 0);
                }
            }
        }
        // All /31s disjoint and inside the parent subnet
        assert_eq!(subnets.len(), map.link_count());
        for s in subnets {
            assert!(subnet().contains(s.network()));
        }
    }

    #[test]
    fn test_subnet_exhaustion() {
        let tiny: Ipv4Network = "10.0.0.0/29".parse().unwrap();
        let input = input(&[1, 2, 3, 4, 5, 6], &[]);
        let err = deploy(
            &input,
            DeploymentStrategyKind::FullMesh,
            &serde_json::Value::Null,
            tiny,
            "ts0",
        )
        .unwrap_err();
        assert!(matches!(err, Error::SubnetExhausted(_)));
    }

    #[test]
    fn test_random_deterministic() {
        let input = input(&[1, 2, 3, 4], &[5, 6]);
        let args = serde_json::json!({"degree": 2, "seed": 42});
        let a = deploy_kind(&input, DeploymentStrategyKind::Random, args.clone());
        let b = deploy_kind(&input, DeploymentStrategyKind::Random, args);
        assert_eq!(
            serde_json::to_string(&a).unwrap(),
            serde_json::to_string(&b).unwrap()
        );
        // Private cells never link to each other while publics exist
        assert!(a.link(5, 6).is_none());
    }

    #[test]
    fn test_static_validates_ids() {
        let input = input(&[1, 2], &[]);
        let args = serde_json::json!({"links": [[1, 9]]});
        let err = deploy(
            &input,
            DeploymentStrategyKind::Static,
            &args,
            subnet(),
            "ts0",
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));

        let args = serde_json::json!({"links": [[1, 2]]});
        let map = deploy_kind(&input, DeploymentStrategyKind::Static, args);
        assert_eq!(map.link_count(), 1);
    }

    #[test]
    fn test_deployment_determinism() {
        for kind in [
            DeploymentStrategyKind::FullMesh,
            DeploymentStrategyKind::Circular,
            DeploymentStrategyKind::Crossed,
        ] {
            let input = input(&[2, 4, 6], &[1, 3]);
            let a = deploy_kind(&input, kind, serde_json::Value::Null);
            let b = deploy_kind(&input, kind, serde_json::Value::Null);
            assert_eq!(
                serde_json::to_string(&a).unwrap(),
                serde_json::to_string(&b).unwrap()
            );
        }
    }
}
