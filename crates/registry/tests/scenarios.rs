//! Registry-level scenario tests

use std::collections::BTreeSet;
use uvnet_common::types::{CellSettings, DeploymentStrategyKind, UvnSettings};
use uvnet_registry::{package, vpn_config, Registry};

fn settings(strategy: DeploymentStrategyKind) -> UvnSettings {
    let mut settings = UvnSettings::default();
    settings.backbone_vpn.deployment_strategy = strategy;
    settings
}

#[test]
fn test_single_public_cell_and_particle() {
    let dir = tempfile::tempdir().unwrap();
    let mut registry = Registry::create(
        dir.path(),
        "u1",
        "root@example.org",
        "secret",
        Some("203.0.113.100".into()),
        settings(DeploymentStrategyKind::FullMesh),
    )
    .unwrap();
    registry
        .add_cell(
            "c1",
            None,
            Some("203.0.113.1".into()),
            ["10.1.0.0/24".parse().unwrap()].into_iter().collect(),
            CellSettings::default(),
        )
        .unwrap();
    registry.add_particle("p1", None).unwrap();
    registry.generate().unwrap();

    // No backbone links for a single cell
    assert!(registry.deployment().unwrap().is_empty());

    let cells = registry.cells().unwrap();
    let cell = registry.load_cell("c1").unwrap();

    // One root VPN peer at the registry
    let root = vpn_config::root_vpn_registry(&registry.uvn, &cells, &registry.root_vpn_keys())
        .unwrap()
        .unwrap();
    assert_eq!(root.peers.len(), 1);

    // One particles VPN peer at the cell
    let hub = vpn_config::particles_vpn_cell(
        &registry.uvn,
        &cell,
        &registry.particles().unwrap(),
        &registry.particles_keys(cell.id),
    )
    .unwrap()
    .unwrap();
    assert_eq!(hub.peers.len(), 1);

    // The cell's backbone is empty: its agent starts without backbone links
    let backbone = vpn_config::backbone_cell(
        &registry.uvn,
        &cells,
        registry.deployment().unwrap(),
        cell.id,
        &registry.backbone_keys(),
    )
    .unwrap();
    assert!(backbone.is_empty());

    // The package reflects all of it
    let built = package::build_cell_package(&registry, &cell).unwrap();
    assert_eq!(built.data.particle_configs.len(), 1);
}

#[test]
fn test_two_private_cells_and_relay() {
    let dir = tempfile::tempdir().unwrap();
    let mut registry = Registry::create(
        dir.path(),
        "u1",
        "root@example.org",
        "secret",
        Some("203.0.113.100".into()),
        settings(DeploymentStrategyKind::FullMesh),
    )
    .unwrap();
    registry
        .add_cell(
            "c1",
            None,
            None,
            ["10.1.0.0/24".parse().unwrap()].into_iter().collect(),
            CellSettings::default(),
        )
        .unwrap();
    registry
        .add_cell(
            "c2",
            None,
            None,
            ["10.2.0.0/24".parse().unwrap()].into_iter().collect(),
            CellSettings::default(),
        )
        .unwrap();
    registry
        .add_cell(
            "r1",
            None,
            Some("203.0.113.9".into()),
            BTreeSet::new(),
            CellSettings::default(),
        )
        .unwrap();
    registry.generate().unwrap();

    let c1 = registry.load_cell("c1").unwrap();
    let c2 = registry.load_cell("c2").unwrap();
    let r1 = registry.load_cell("r1").unwrap();
    assert!(c1.private() && c2.private());
    assert!(r1.relay() && !r1.private());

    // Only the relay edges exist
    let deployment = registry.deployment().unwrap();
    assert_eq!(deployment.link_count(), 2);
    assert!(deployment.link(c1.id, r1.id).is_some());
    assert!(deployment.link(c2.id, r1.id).is_some());
    assert!(deployment.link(c1.id, c2.id).is_none());

    // The relay masquerades on both backbone interfaces
    let cells = registry.cells().unwrap();
    let relay_configs = vpn_config::backbone_cell(
        &registry.uvn,
        &cells,
        deployment,
        r1.id,
        &registry.backbone_keys(),
    )
    .unwrap();
    assert_eq!(relay_configs.len(), 2);
    assert!(relay_configs.iter().all(|c| c.intf.masquerade));
}

#[test]
fn test_crossed_on_six_cells() {
    let dir = tempfile::tempdir().unwrap();
    let mut registry = Registry::create(
        dir.path(),
        "u1",
        "root@example.org",
        "secret",
        Some("203.0.113.100".into()),
        settings(DeploymentStrategyKind::Crossed),
    )
    .unwrap();
    for i in 1..=6 {
        registry
            .add_cell(
                &format!("c{i}"),
                None,
                Some(format!("203.0.113.{i}")),
                BTreeSet::new(),
                CellSettings::default(),
            )
            .unwrap();
    }
    registry.generate().unwrap();

    let deployment = registry.deployment().unwrap();
    for (_, peer) in &deployment.peers {
        assert_eq!(peer.peers.len(), 4);
        let mut ports: Vec<usize> = peer.peers.values().map(|l| l.port_index).collect();
        ports.sort();
        assert_eq!(ports, vec![0, 1, 2, 3]);
    }
}

#[test]
fn test_deployment_deterministic_across_regeneration() {
    let build = |dir: &std::path::Path| {
        let mut registry = Registry::create(
            dir,
            "u1",
            "root@example.org",
            "secret",
            Some("203.0.113.100".into()),
            settings(DeploymentStrategyKind::Crossed),
        )
        .unwrap();
        for i in 1..=5 {
            registry
                .add_cell(
                    &format!("c{i}"),
                    None,
                    Some(format!("203.0.113.{i}")),
                    BTreeSet::new(),
                    CellSettings::default(),
                )
                .unwrap();
        }
        registry.generate().unwrap();
        let mut deployment = registry.deployment().unwrap().clone();
        // The generation timestamp is the only nondeterministic field
        deployment.generation_ts = String::new();
        serde_json::to_string(&deployment).unwrap()
    };
    let a = tempfile::tempdir().unwrap();
    let b = tempfile::tempdir().unwrap();
    assert_eq!(build(a.path()), build(b.path()));
}
