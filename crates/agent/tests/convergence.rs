//! End-to-end agent tests over the in-process transport
//!
//! Exercises the full control plane without kernel networking: a registry
//! agent and two cell agents converge on configuration and routed networks,
//! reload on a published configuration change, and complete a coordinated
//! rekey.

use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use uvnet_agent::agent::{Agent, AgentOptions, SpinOutcome, SpinUntil};
use uvnet_agent::transport::LoopbackHub;
use uvnet_common::types::{CellSettings, LanDescriptor, NicDescriptor, UvnSettings};
use uvnet_registry::{package, Registry};

fn lan(subnet: &str) -> LanDescriptor {
    let subnet: ipnetwork::Ipv4Network = subnet.parse().unwrap();
    let address = Ipv4Addr::from(u32::from(subnet.network()) + 1);
    LanDescriptor {
        nic: NicDescriptor {
            name: "eth0".into(),
            address,
            subnet,
        },
        gw: address,
    }
}

struct Fixture {
    registry_root: TempDir,
    cell_roots: Vec<TempDir>,
    hub: LoopbackHub,
}

impl Fixture {
    fn new() -> Self {
        let registry_root = TempDir::new().unwrap();
        let mut registry = Registry::create(
            registry_root.path(),
            "u1",
            "root@example.org",
            "secret",
            Some("203.0.113.100".into()),
            UvnSettings::default(),
        )
        .unwrap();
        for (name, address, lan) in [
            ("c1", "203.0.113.1", "10.1.0.0/24"),
            ("c2", "203.0.113.2", "10.2.0.0/24"),
        ] {
            registry
                .add_cell(
                    name,
                    None,
                    Some(address.into()),
                    [lan.parse().unwrap()].into_iter().collect(),
                    CellSettings::default(),
                )
                .unwrap();
        }
        registry.generate().unwrap();
        package::export_cell_packages(&registry).unwrap();

        let mut cell_roots = Vec::new();
        for name in ["c1", "c2"] {
            let root = TempDir::new().unwrap();
            let pkg = package::load_package(
                &registry_root
                    .path()
                    .join(format!("cells/{name}/{name}.uvn-agent")),
            )
            .unwrap();
            package::install_package(&pkg, root.path()).unwrap();
            cell_roots.push(root);
        }

        Self {
            registry_root,
            cell_roots,
            hub: LoopbackHub::new(),
        }
    }

    fn registry_agent(&self) -> Agent {
        let mut options = AgentOptions::new(self.registry_root.path());
        options.enable_net = false;
        options.tick = Duration::from_millis(20);
        options.transport = Some(Box::new(self.hub.endpoint("uvn:u1")));
        options.pid_file = Some(self.registry_root.path().join("agent.pid"));
        Agent::open(options).unwrap()
    }

    fn cell_agent(&self, index: usize) -> Agent {
        let root: &Path = self.cell_roots[index].path();
        let mut options = AgentOptions::new(root);
        options.enable_net = false;
        options.tick = Duration::from_millis(20);
        options.transport = Some(Box::new(self.hub.endpoint(format!("cell:{}", index + 1))));
        options.lans = Some(vec![lan(if index == 0 {
            "10.1.0.0/24"
        } else {
            "10.2.0.0/24"
        })]);
        options.pid_file = Some(root.join("agent.pid"));
        Agent::open(options).unwrap()
    }
}

/// Interleave short spins until the condition holds on the probe agent
async fn converge<F>(agents: &mut [&mut Agent], probe: usize, condition: F) -> bool
where
    F: Fn(&Agent) -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        for agent in agents.iter_mut() {
            agent
                .spin(SpinUntil::Forever, Some(Duration::from_millis(40)))
                .await
                .unwrap();
        }
        if condition(&*agents[probe]) {
            return true;
        }
    }
    false
}

#[tokio::test]
async fn test_uvn_converges_on_config_and_routes() {
    let fixture = Fixture::new();
    let mut registry_agent = fixture.registry_agent();
    let mut c1 = fixture.cell_agent(0);
    let mut c2 = fixture.cell_agent(1);

    c1.start().await.unwrap();
    c2.start().await.unwrap();
    registry_agent.start().await.unwrap();

    let converged = converge(
        &mut [&mut c1, &mut c2, &mut registry_agent],
        2,
        |registry_agent| {
            registry_agent.peers().all_cells_connected
                && registry_agent.peers().consistent_config_uvn
                && registry_agent.peers().routed_networks_discovered
        },
    )
    .await;
    assert!(converged, "uvn did not converge");

    // Cells see the registry and each other
    assert!(c1.peers().registry_connected);
    assert!(c1.peers().all_cells_connected);
    assert!(c2.peers().routed_networks_discovered);

    // Expected LANs are exactly the two cell LANs
    let expected: BTreeSet<String> = registry_agent
        .peers()
        .expected_lans()
        .iter()
        .map(|n| n.to_string())
        .collect();
    assert_eq!(
        expected,
        ["10.1.0.0/24".to_string(), "10.2.0.0/24".to_string()]
            .into_iter()
            .collect::<BTreeSet<_>>()
    );

    c1.stop(false).await.unwrap();

    // The departed cell transitions offline at the registry, but its last
    // announced networks are retained
    let saw_offline = converge(
        &mut [&mut c2, &mut registry_agent],
        1,
        |registry_agent| !registry_agent.peers().all_cells_connected,
    )
    .await;
    assert!(saw_offline);
    let peer = registry_agent
        .peers()
        .get(uvnet_agent::PeerKey::Cell(c1_id(&fixture)))
        .unwrap();
    assert!(!peer.routed_networks.is_empty());

    c2.stop(false).await.unwrap();
    registry_agent.stop(false).await.unwrap();
}

fn c1_id(fixture: &Fixture) -> i64 {
    Registry::open_readonly(fixture.registry_root.path())
        .unwrap()
        .load_cell("c1")
        .unwrap()
        .id
}

#[tokio::test]
async fn test_rekey_push_and_convergence() {
    let fixture = Fixture::new();
    let old_config = Registry::open_readonly(fixture.registry_root.path())
        .unwrap()
        .config_id();

    let mut registry_agent = fixture.registry_agent();
    let mut c1 = fixture.cell_agent(0);
    let mut c2 = fixture.cell_agent(1);
    c1.start().await.unwrap();
    c2.start().await.unwrap();
    registry_agent.start().await.unwrap();

    assert!(
        converge(
            &mut [&mut c1, &mut c2, &mut registry_agent],
            2,
            |registry_agent| registry_agent.peers().consistent_config_uvn,
        )
        .await
    );

    // Stage the rekey while the registry agent is paused
    registry_agent.stop(false).await.unwrap();
    drop(registry_agent);
    let new_config = {
        let mut registry = Registry::open(fixture.registry_root.path()).unwrap();
        registry.rekey_uvn().unwrap();
        assert!(registry.rekeyed_root());
        package::export_cell_packages(&registry).unwrap();
        registry.config_id()
    };
    assert_ne!(new_config, old_config);

    // The new registry agent reconnects the cells under the old config
    let mut registry_agent = fixture.registry_agent();
    assert_eq!(registry_agent.config_id(), new_config);
    registry_agent.start().await.unwrap();
    assert!(
        converge(
            &mut [&mut c1, &mut c2, &mut registry_agent],
            2,
            |registry_agent| registry_agent.peers().all_cells_connected,
        )
        .await
    );

    // Push the rekeyed packages: both cells ask for a reload
    registry_agent.publish_packages().await.unwrap();
    let mut reload_packages = Vec::new();
    for cell in [&mut c1, &mut c2] {
        let outcome = cell
            .spin(SpinUntil::Forever, Some(Duration::from_secs(5)))
            .await
            .unwrap();
        match outcome {
            SpinOutcome::Reload(package) => {
                assert_eq!(package.data.config_id, new_config);
                reload_packages.push(package);
            }
            _ => panic!("expected a reload"),
        }
        cell.stop(true).await.unwrap();
    }
    drop(c1);
    drop(c2);

    // With every rekeyed cell offline under the old config, the registry
    // drops the retained key material
    let outcome = registry_agent
        .spin(SpinUntil::RekeyConverged, Some(Duration::from_secs(5)))
        .await
        .unwrap();
    assert!(matches!(outcome, SpinOutcome::ConditionReached));
    assert!(!Registry::open_readonly(fixture.registry_root.path())
        .unwrap()
        .rekeyed_root());

    // Cells install the new packages and come back consistent
    for (index, package) in reload_packages.iter().enumerate() {
        package::install_package(package, fixture.cell_roots[index].path()).unwrap();
    }
    let mut c1 = fixture.cell_agent(0);
    let mut c2 = fixture.cell_agent(1);
    assert_eq!(c1.config_id(), new_config);
    c1.start().await.unwrap();
    c2.start().await.unwrap();
    assert!(
        converge(
            &mut [&mut c1, &mut c2, &mut registry_agent],
            2,
            |registry_agent| registry_agent.peers().consistent_config_uvn,
        )
        .await
    );

    c1.stop(false).await.unwrap();
    c2.stop(false).await.unwrap();
    registry_agent.stop(false).await.unwrap();
}

#[tokio::test]
async fn test_routed_networks_discovered_on_last_cell() {
    let fixture = Fixture::new();
    let mut registry_agent = fixture.registry_agent();
    let mut c1 = fixture.cell_agent(0);

    c1.start().await.unwrap();
    registry_agent.start().await.unwrap();

    // One cell online: its LAN alone does not cover the expected set
    assert!(
        converge(&mut [&mut c1, &mut registry_agent], 1, |registry_agent| {
            registry_agent
                .peers()
                .cells()
                .any(|p| p.status == uvnet_agent::PeerStatus::Online)
        })
        .await
    );
    assert!(!registry_agent.peers().routed_networks_discovered);

    // The second cell brings the last expected LAN
    let mut c2 = fixture.cell_agent(1);
    c2.start().await.unwrap();
    assert!(
        converge(
            &mut [&mut c1, &mut c2, &mut registry_agent],
            2,
            |registry_agent| registry_agent.peers().routed_networks_discovered,
        )
        .await
    );

    c1.stop(false).await.unwrap();
    c2.stop(false).await.unwrap();
    registry_agent.stop(false).await.unwrap();
}
