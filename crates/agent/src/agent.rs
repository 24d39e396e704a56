//! Agent lifecycle and orchestration
//!
//! One agent runs per cell (and one for the registry itself). The lifecycle
//! is `Created -> Starting -> Running <-> Reloading -> Stopping -> Stopped`:
//! start acquires the PID file, brings up tunnels and routing, starts the
//! transport and announces the local status; the spin loop then multiplexes
//! transport polls, subservice work, VPN statistics and predicate
//! recomputation on a single thread. A backbone sample carrying a foreign
//! config id ends the spin with a reload outcome instead of unwinding
//! through an exception.

use crate::net::{system_runner, CommandRunner, UvnNet};
use crate::peers::{PeerEvent, PeerKey, PeerList, PeerStatus, PeerUpdate, VpnIntfStats};
use crate::peers_tester::PeersTester;
use crate::router::RouterService;
use crate::routes_monitor::RoutesMonitor;
use crate::service::{stop_all, AgentService};
use crate::transport::{
    BackboneSample, CellInfoSample, KnownNetworkSample, Topic, Transport, TransportEvent,
    UdpTransport, UdpTransportConfig, UvnInfoSample, WaitSet,
};
use ipnetwork::Ipv4Network;
use std::collections::{BTreeMap, BTreeSet};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uvnet_common::types::{Cell, LanDescriptor, NicDescriptor, ObjectId};
use uvnet_common::{exec, Error, Result};
use uvnet_registry::{package, vpn_config, Registry, WgConfig};

/// UDP port of the control-plane transport
pub const TRANSPORT_PORT: u16 = 51789;

/// Handshake age beyond which a VPN peer counts as offline
const HANDSHAKE_ONLINE_WINDOW: Duration = Duration::from_secs(180);

/// Agent lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Created,
    Starting,
    Running,
    Reloading,
    Stopping,
    Stopped,
}

/// How a spin loop ended
pub enum SpinOutcome {
    /// Shutdown was requested
    Stopped,
    /// A new configuration arrived; install it and start a new agent
    Reload(Box<uvnet_registry::AgentPackage>),
    /// The requested exit condition was reached
    ConditionReached,
}

/// Exit condition of a spin loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpinUntil {
    Forever,
    /// Every cell reports the local config id
    ConsistentConfig,
    /// Consistent config and a fully routed uvn
    ConsistentAndRouted,
    /// Registry only: a pending rekey has converged and old keys are dropped
    RekeyConverged,
}

/// Scoped PID file: acquired at start, released on every exit path
pub struct PidFile {
    path: PathBuf,
    acquired: bool,
}

impl PidFile {
    pub fn acquire(path: PathBuf) -> Result<Self> {
        if let Some(pid) = Self::stored_pid(&path) {
            if pid != std::process::id() as i32 && Self::alive(pid) {
                return Err(Error::AgentAlreadyRunning(pid));
            }
            warn!("clearing stale PID file: {} [{}]", path.display(), pid);
            std::fs::remove_file(&path).ok();
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, std::process::id().to_string())?;
        debug!("PID file [{}]: {}", std::process::id(), path.display());
        Ok(Self {
            path,
            acquired: true,
        })
    }

    fn stored_pid(path: &Path) -> Option<i32> {
        std::fs::read_to_string(path)
            .ok()?
            .trim()
            .parse::<i32>()
            .ok()
    }

    fn alive(pid: i32) -> bool {
        nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok()
    }

    pub fn release(&mut self) {
        if self.acquired {
            std::fs::remove_file(&self.path).ok();
            self.acquired = false;
        }
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        self.release();
    }
}

/// Construction options
pub struct AgentOptions {
    pub root: PathBuf,
    /// PID file location; defaults to `<root>/agent.pid`
    pub pid_file: Option<PathBuf>,
    /// Bring up kernel tunnels, iptables and the router daemon config
    pub enable_net: bool,
    /// Skip the check that every allowed LAN was detected locally
    pub allow_invalid_lans: bool,
    /// Injected transport; defaults to the UDP transport over the overlay
    pub transport: Option<Box<dyn Transport>>,
    /// Injected LAN descriptors, bypassing interface detection
    pub lans: Option<Vec<LanDescriptor>>,
    /// UDP port of the control-plane transport
    pub transport_port: u16,
    /// Poll tick; transport polls block at most this long
    pub tick: Duration,
}

impl AgentOptions {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            pid_file: None,
            enable_net: true,
            allow_invalid_lans: false,
            transport: None,
            lans: None,
            transport_port: TRANSPORT_PORT,
            tick: Duration::from_secs(1),
        }
    }
}

enum AgentRole {
    Registry,
    Cell(Cell),
}

pub struct Agent {
    root: PathBuf,
    registry: Registry,
    role: AgentRole,
    config_id: String,
    state: AgentState,
    peers: PeerList,
    transport: Box<dyn Transport>,
    waitset: WaitSet,
    runner: CommandRunner,
    tick: Duration,
    pid_path: PathBuf,
    pid: Option<PidFile>,
    lans: Vec<LanDescriptor>,
    vpn_configs: Vec<WgConfig>,
    /// (interface, peer public key) -> peer, for VPN statistics
    vpn_peer_index: BTreeMap<(String, String), PeerKey>,
    net: Option<UvnNet>,
    router: Option<RouterService>,
    routes_monitor: Option<RoutesMonitor>,
    peers_tester: Option<PeersTester>,
    enable_net: bool,
    allow_invalid_lans: bool,
    injected_lans: Option<Vec<LanDescriptor>>,
    pending_reload: Option<Box<uvnet_registry::AgentPackage>>,
    ts_start: Option<String>,
    last_stats: Instant,
    last_announce: Instant,
}

impl Agent {
    /// Load an agent from a registry or cell root directory
    pub fn open(mut options: AgentOptions) -> Result<Self> {
        let root = options.root.clone();
        let local_id = package::load_local_id(&root)?;
        let (registry, role) = match &local_id {
            Some(id) => {
                let registry = Registry::open_readonly(&root)?;
                let cell: Cell = registry
                    .all_cells()?
                    .remove(&id.cell_id)
                    .ok_or_else(|| Error::NotFound {
                        kind: "cell".to_string(),
                        id: id.cell_id.to_string(),
                    })?;
                (registry, AgentRole::Cell(cell))
            }
            None => (Registry::open(&root)?, AgentRole::Registry),
        };
        let config_id = registry.config_id();
        info!(
            "loaded agent for {} at {}",
            match &role {
                AgentRole::Registry => registry.uvn.name.clone(),
                AgentRole::Cell(cell) => cell.name.clone(),
            },
            config_id
        );

        let cells = registry.cells()?;
        let excluded: BTreeMap<ObjectId, Cell> = registry
            .all_cells()?
            .into_iter()
            .filter(|(id, _)| !cells.contains_key(id))
            .collect();
        let particles = registry.all_particles()?;
        let local_key = match &role {
            AgentRole::Registry => PeerKey::Registry,
            AgentRole::Cell(cell) => PeerKey::Cell(cell.id),
        };
        let peers = PeerList::new(
            registry.uvn.name.clone(),
            local_key,
            config_id.clone(),
            &cells,
            &excluded,
            &particles,
        );

        let vpn_configs = Self::build_vpn_configs(&registry, &role)?;
        let vpn_peer_index = Self::index_vpn_peers(&role, &vpn_configs);

        let transport = match options.transport.take() {
            Some(transport) => transport,
            None => Box::new(UdpTransport::new(UdpTransportConfig {
                bind: SocketAddr::from(([0, 0, 0, 0], options.transport_port)),
                peers: Self::initial_peers(&registry, &role, options.transport_port)?,
                writer: Self::writer_handle(&registry, &role),
                liveness_period: registry.uvn.settings.timing_profile.liveness_period(),
            })),
        };
        let waitset = transport.waitset();

        Ok(Self {
            pid_path: options
                .pid_file
                .clone()
                .unwrap_or_else(|| root.join("agent.pid")),
            root,
            registry,
            role,
            config_id,
            state: AgentState::Created,
            peers,
            transport,
            waitset,
            runner: system_runner(),
            tick: options.tick,
            pid: None,
            lans: Vec::new(),
            vpn_configs,
            vpn_peer_index,
            net: None,
            router: None,
            routes_monitor: None,
            peers_tester: None,
            enable_net: options.enable_net,
            allow_invalid_lans: options.allow_invalid_lans,
            injected_lans: options.lans.clone(),
            pending_reload: None,
            ts_start: None,
            last_stats: Instant::now(),
            last_announce: Instant::now(),
        })
    }

    fn writer_handle(registry: &Registry, role: &AgentRole) -> String {
        match role {
            AgentRole::Registry => format!("uvn:{}", registry.uvn.name),
            AgentRole::Cell(cell) => format!("cell:{}", cell.id),
        }
    }

    fn build_vpn_configs(registry: &Registry, role: &AgentRole) -> Result<Vec<WgConfig>> {
        let cells = registry.cells()?;
        let mut configs = Vec::new();
        match role {
            AgentRole::Registry => {
                if let Some(config) =
                    vpn_config::root_vpn_registry(&registry.uvn, &cells, &registry.root_vpn_keys())?
                {
                    configs.push(config);
                }
            }
            AgentRole::Cell(cell) => {
                if let Some(config) =
                    vpn_config::root_vpn_cell(&registry.uvn, cell, &registry.root_vpn_keys())?
                {
                    configs.push(config);
                }
                if let Some(config) = vpn_config::particles_vpn_cell(
                    &registry.uvn,
                    cell,
                    &registry.particles()?,
                    &registry.particles_keys(cell.id),
                )? {
                    configs.push(config);
                }
                if let Some(deployment) = registry.deployment() {
                    configs.extend(vpn_config::backbone_cell(
                        &registry.uvn,
                        &cells,
                        deployment,
                        cell.id,
                        &registry.backbone_keys(),
                    )?);
                }
            }
        }
        Ok(configs)
    }

    fn index_vpn_peers(
        role: &AgentRole,
        configs: &[WgConfig],
    ) -> BTreeMap<(String, String), PeerKey> {
        let mut index = BTreeMap::new();
        for config in configs {
            for peer in &config.peers {
                let key = match (role, config.intf.name.as_str()) {
                    (AgentRole::Registry, _) => PeerKey::Cell(peer.id),
                    (AgentRole::Cell(_), name) if name.starts_with("uwg-p") => {
                        PeerKey::Particle(peer.id)
                    }
                    (AgentRole::Cell(_), name) if name.starts_with("uwg-b") => {
                        PeerKey::Cell(peer.id)
                    }
                    (AgentRole::Cell(_), _) => PeerKey::Registry,
                };
                index.insert((config.intf.name.clone(), peer.public_key.clone()), key);
            }
        }
        index
    }

    /// Transport peer addresses known before any routing exists: direct
    /// backbone neighbors, plus the registry (or every cell, for the
    /// registry agent) over the root VPN
    fn initial_peers(
        registry: &Registry,
        role: &AgentRole,
        transport_port: u16,
    ) -> Result<Vec<SocketAddr>> {
        let mut addresses: BTreeSet<Ipv4Addr> = BTreeSet::new();
        match role {
            AgentRole::Registry => {
                for cell_id in registry.cells()?.keys() {
                    addresses.insert(vpn_config::root_vpn_cell_address(&registry.uvn, *cell_id)?);
                }
            }
            AgentRole::Cell(cell) => {
                if let Some(deployment) = registry.deployment() {
                    for remote in deployment.peers_of(cell.id) {
                        if let Some(link) = deployment.link(cell.id, remote) {
                            addresses.insert(link.addr_remote);
                        }
                    }
                    // First-port addresses of every other cell, reachable
                    // once routing converges
                    for (peer_id, peer) in &deployment.peers {
                        if *peer_id == cell.id {
                            continue;
                        }
                        for link in peer.peers.values() {
                            if link.port_index == 0 {
                                addresses.insert(link.addr_local);
                            }
                        }
                    }
                }
                if registry.uvn.settings.enable_root_vpn {
                    addresses.insert(vpn_config::root_vpn_registry_address(&registry.uvn)?);
                }
            }
        }
        Ok(addresses
            .into_iter()
            .map(|addr| SocketAddr::from((addr, transport_port)))
            .collect())
    }

    pub fn state(&self) -> AgentState {
        self.state
    }

    pub fn config_id(&self) -> &str {
        &self.config_id
    }

    pub fn peers(&self) -> &PeerList {
        &self.peers
    }

    pub fn waitset(&self) -> WaitSet {
        self.waitset.clone()
    }

    pub fn log_dir(&self) -> PathBuf {
        self.root.join("log")
    }

    pub fn config_dir(&self) -> PathBuf {
        self.root.join("static")
    }

    fn is_cell(&self) -> bool {
        matches!(self.role, AgentRole::Cell(_))
    }

    // ------------------------------------------------------------------
    // Start
    // ------------------------------------------------------------------

    /// Acquire the PID file, bring up networking, start the transport and
    /// announce the initial status
    pub async fn start(&mut self) -> Result<()> {
        self.state = AgentState::Starting;
        self.pid = Some(PidFile::acquire(self.pid_path.clone())?);
        std::fs::create_dir_all(self.log_dir())?;
        std::fs::create_dir_all(self.config_dir())?;

        if let Err(e) = self.start_services().await {
            self.stop(true).await.ok();
            self.state = AgentState::Stopped;
            return Err(e);
        }

        self.ts_start = Some(chrono::Utc::now().to_rfc3339());
        let events = self.peers.online(PeerUpdate {
            routed_networks: Some(self.lans.iter().cloned().collect()),
            ts_start: Some(self.ts_start.clone()),
            ..Default::default()
        });
        self.react(events).await?;
        self.announce().await?;
        self.state = AgentState::Running;
        info!("agent started [{}]", self.config_id);
        Ok(())
    }

    async fn start_services(&mut self) -> Result<()> {
        if let Some(lans) = self.injected_lans.clone() {
            self.lans = lans;
        } else if self.enable_net && self.is_cell() {
            self.lans = self.detect_lans()?;
            self.validate_lans()?;
        }
        if self.enable_net && !self.vpn_configs.is_empty() {
            let lan_names = self.lans.iter().map(|l| l.nic.name.clone()).collect();
            let mut net = UvnNet::new(
                self.vpn_configs.clone(),
                lan_names,
                self.config_dir(),
                self.runner.clone(),
            );
            net.start()?;
            self.net = Some(net);
        }
        if self.enable_net && self.is_cell() && self.net.is_some() {
            let backbone: Vec<WgConfig> = self
                .vpn_configs
                .iter()
                .filter(|c| c.intf.name.starts_with("uwg-b"))
                .cloned()
                .collect();
            let router_id = self
                .vpn_configs
                .first()
                .map(|c| c.intf.address)
                .unwrap_or(Ipv4Addr::UNSPECIFIED);
            let mut router = RouterService::new(
                self.config_dir(),
                self.runner.clone(),
                router_id,
                backbone,
                self.lans.clone(),
            );
            router.start()?;
            self.router = Some(router);

            let mut monitor = RoutesMonitor::new(
                self.log_dir(),
                self.waitset.new_condition("routes-monitor"),
            );
            monitor.start().await?;
            self.routes_monitor = Some(monitor);

            let mut tester = PeersTester::new(
                self.registry.uvn.settings.timing_profile,
                self.waitset.new_condition("peers-tester"),
            );
            tester.start().await?;
            self.peers_tester = Some(tester);
        }
        self.transport.start().await?;
        Ok(())
    }

    fn detect_lans(&self) -> Result<Vec<LanDescriptor>> {
        let AgentRole::Cell(cell) = &self.role else {
            return Ok(Vec::new());
        };
        if cell.allowed_lans.is_empty() {
            return Ok(Vec::new());
        }
        let output = (self.runner)("ip", &["-4", "-o", "addr", "show"])?;
        let mut lans = Vec::new();
        for nic in parse_addr_show(&output) {
            if !cell.allowed_lans.iter().any(|lan| lan.contains(nic.address)) {
                debug!("interface not allowed: {}@{}", nic.subnet, nic.name);
                continue;
            }
            let lan = LanDescriptor {
                gw: nic.address,
                nic,
            };
            info!("LAN interface detected: {}", lan);
            lans.push(lan);
        }
        Ok(lans)
    }

    fn validate_lans(&self) -> Result<()> {
        let AgentRole::Cell(cell) = &self.role else {
            return Ok(());
        };
        if self.allow_invalid_lans {
            return Ok(());
        }
        let detected: BTreeSet<Ipv4Network> =
            self.lans.iter().map(|l| l.nic.subnet).collect();
        let missing: Vec<Ipv4Network> = cell
            .allowed_lans
            .iter()
            .filter(|lan| !detected.contains(lan))
            .copied()
            .collect();
        if !missing.is_empty() {
            return Err(Error::InvalidConfig(format!(
                "failed to detect expected network interfaces: {}",
                missing
                    .iter()
                    .map(|m| m.to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            )));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Spin
    // ------------------------------------------------------------------

    /// Run the event loop until shutdown, reload, timeout, or the requested
    /// exit condition
    pub async fn spin(
        &mut self,
        until: SpinUntil,
        max_spin_time: Option<Duration>,
    ) -> Result<SpinOutcome> {
        let spin_start = Instant::now();
        let mut rekey_stage = if self.peers.all_cells_connected { 1 } else { 0 };
        if until == SpinUntil::RekeyConverged {
            let rekeyed = self.registry.rekeyed_cells()?;
            info!(
                "pushing rekeyed configuration to {} cells: {:?}",
                rekeyed.len(),
                rekeyed
            );
        }
        loop {
            if self.waitset.exit_requested() {
                return Ok(SpinOutcome::Stopped);
            }
            let events = self.transport.poll(self.tick).await?;
            self.process_transport_events(events).await?;

            if let Some(package) = self.pending_reload.take() {
                self.state = AgentState::Reloading;
                return Ok(SpinOutcome::Reload(package));
            }

            self.refresh_vpn_stats().await?;
            self.spin_services().await?;
            self.announce_if_due().await?;

            if let Some(max) = max_spin_time {
                if spin_start.elapsed() >= max {
                    if until != SpinUntil::Forever {
                        return Err(Error::AgentTimedout {
                            seconds: max.as_secs(),
                        });
                    }
                    return Ok(SpinOutcome::Stopped);
                }
            }

            match until {
                SpinUntil::Forever => {}
                SpinUntil::ConsistentConfig => {
                    if self.peers.consistent_config_uvn {
                        info!("exit condition reached: consistent config uvn");
                        return Ok(SpinOutcome::ConditionReached);
                    }
                }
                SpinUntil::ConsistentAndRouted => {
                    if self.peers.consistent_config_uvn && self.peers.fully_routed_uvn {
                        info!("exit condition reached: consistent config and fully routed uvn");
                        return Ok(SpinOutcome::ConditionReached);
                    }
                }
                SpinUntil::RekeyConverged => {
                    if rekey_stage == 0 && self.peers.all_cells_connected {
                        rekey_stage = 1;
                        debug!("all cells connected under the new configuration");
                    }
                    if rekey_stage == 1 {
                        let offline: BTreeSet<ObjectId> = self
                            .peers
                            .offline_cells()
                            .map(|p| match p.key {
                                PeerKey::Cell(id) => id,
                                _ => unreachable!(),
                            })
                            .collect();
                        let rekeyed = self.registry.rekeyed_cells()?;
                        if !rekeyed.is_empty() && offline == rekeyed {
                            info!("applying rekeyed configuration: {}", self.config_id);
                            self.registry.drop_rekeyed()?;
                            return Ok(SpinOutcome::ConditionReached);
                        }
                        if rekeyed.is_empty() {
                            self.registry.drop_rekeyed()?;
                            return Ok(SpinOutcome::ConditionReached);
                        }
                    }
                }
            }
        }
    }

    async fn process_transport_events(&mut self, events: Vec<TransportEvent>) -> Result<()> {
        let mut updates: Vec<(PeerKey, PeerUpdate)> = Vec::new();
        let mut triggers: Vec<String> = Vec::new();
        let mut registry_seen = false;
        for event in events {
            match event {
                TransportEvent::UvnInfo { sample, instance } => {
                    if sample.uvn != self.peers.uvn_name() {
                        warn!("ignoring update for foreign UVN: uvn={}", sample.uvn);
                        continue;
                    }
                    debug!("uvn info UPDATE: {}", sample.uvn);
                    registry_seen = true;
                    updates.push((
                        PeerKey::Registry,
                        PeerUpdate {
                            status: Some(PeerStatus::Online),
                            config_id: Some(Some(sample.config_id)),
                            instance: Some(Some(instance)),
                            ..Default::default()
                        },
                    ));
                }
                TransportEvent::CellInfo { sample, instance } => {
                    if sample.uvn != self.peers.uvn_name() {
                        debug!(
                            "ignoring update from foreign agent: uvn={}, cell={}",
                            sample.uvn, sample.cell_id
                        );
                        continue;
                    }
                    let key = PeerKey::Cell(sample.cell_id);
                    if self.peers.get(key).is_none() {
                        warn!(
                            "ignoring update from unknown agent: uvn={}, cell={}",
                            sample.uvn, sample.cell_id
                        );
                        continue;
                    }
                    debug!("cell info UPDATE: {}", sample.cell_id);
                    updates.push((
                        key,
                        PeerUpdate {
                            status: Some(PeerStatus::Online),
                            config_id: Some(Some(sample.config_id)),
                            routed_networks: Some(sample.routed_networks.into_iter().collect()),
                            known_networks: Some(
                                sample
                                    .known_networks
                                    .into_iter()
                                    .map(|n| (n.lan, n.reachable))
                                    .collect(),
                            ),
                            ts_start: Some(sample.ts_start),
                            instance: Some(Some(instance)),
                            ..Default::default()
                        },
                    ));
                }
                TransportEvent::Backbone { sample } => {
                    self.handle_backbone_sample(sample)?;
                }
                TransportEvent::WriterOffline { topic, instance } => {
                    if !matches!(topic, Topic::UvnInfo | Topic::CellInfo) {
                        continue;
                    }
                    if let Some(key) = self.peers.by_instance(&instance) {
                        debug!("peer writer offline: {:?}", key);
                        updates.push((key, PeerUpdate::status(PeerStatus::Offline)));
                    }
                }
                TransportEvent::Trigger { condition } => triggers.push(condition),
            }
        }
        if !updates.is_empty() {
            let events = self.peers.update_many(updates);
            self.react(events).await?;
        }
        // A registry (re)appearing may have missed our last announcement
        if registry_seen && self.is_cell() {
            self.announce().await?;
        }
        for condition in triggers {
            self.process_trigger(&condition).await?;
        }
        Ok(())
    }

    fn handle_backbone_sample(&mut self, sample: BackboneSample) -> Result<()> {
        let AgentRole::Cell(cell) = &self.role else {
            return Ok(());
        };
        if sample.uvn != self.peers.uvn_name() || sample.cell_id != cell.id {
            return Ok(());
        }
        if sample.config_id == self.config_id {
            debug!("ignoring current configuration: {}", self.config_id);
            return Ok(());
        }
        match package::load_package_bytes(sample.package.as_bytes()) {
            Ok(package) => {
                warn!(
                    "new agent configuration available: {}",
                    package.data.config_id
                );
                self.pending_reload = Some(Box::new(package));
            }
            Err(e) => {
                warn!("failed to load received configuration package: {}", e);
            }
        }
        Ok(())
    }

    async fn process_trigger(&mut self, condition: &str) -> Result<()> {
        match condition {
            "routes-monitor" => {
                let deltas = match &self.routes_monitor {
                    Some(monitor) => monitor.poll_routes()?,
                    None => Default::default(),
                };
                let (new_routes, gone_routes) = deltas;
                if !new_routes.is_empty() || !gone_routes.is_empty() {
                    info!(
                        "local routes changed: +{} -{}",
                        new_routes.len(),
                        gone_routes.len()
                    );
                    self.announce().await?;
                }
            }
            "peers-tester" => {
                let transitions = match &mut self.peers_tester {
                    Some(tester) => tester.process_results(),
                    None => Vec::new(),
                };
                if !transitions.is_empty() {
                    let local = self.peers.local().key;
                    let events = self.peers.update_peer(
                        local,
                        PeerUpdate {
                            known_networks: Some(
                                transitions
                                    .into_iter()
                                    .map(|t| (t.lan, t.reachable))
                                    .collect(),
                            ),
                            ..Default::default()
                        },
                    );
                    self.react(events).await?;
                    self.announce().await?;
                }
            }
            other => debug!("unhandled trigger: {}", other),
        }
        Ok(())
    }

    /// React to peer transitions after a batch of updates
    async fn react(&mut self, events: Vec<PeerEvent>) -> Result<()> {
        let mut retarget = false;
        for event in &events {
            match event {
                PeerEvent::OnlineCells { online, offline } => {
                    if !online.is_empty() {
                        warn!("cells ONLINE [{}]: {:?}", online.len(), online);
                    }
                    if !offline.is_empty() {
                        warn!("cells OFFLINE [{}]: {:?}", offline.len(), offline);
                    }
                    retarget = true;
                }
                PeerEvent::OnlineParticles { online, offline } => {
                    if !online.is_empty() {
                        info!("particles ONLINE [{}]: {:?}", online.len(), online);
                    }
                    if !offline.is_empty() {
                        info!("particles OFFLINE [{}]: {:?}", offline.len(), offline);
                    }
                }
                PeerEvent::AllCellsConnected(connected) => {
                    if *connected {
                        warn!("all cells connected");
                    } else {
                        warn!("lost connection with some cells");
                    }
                }
                PeerEvent::RegistryConnected(connected) => {
                    warn!(
                        "registry {}",
                        if *connected { "connected" } else { "disconnected" }
                    );
                }
                PeerEvent::RoutedNetworks { new, gone } => {
                    info!("routed networks changed: +{} -{}", new.len(), gone.len());
                    retarget = true;
                }
                PeerEvent::RoutedNetworksDiscovered(discovered) => {
                    if *discovered {
                        warn!("all expected networks discovered");
                    }
                }
                PeerEvent::ConsistentConfigCells { .. } => {}
                PeerEvent::ConsistentConfigUvn(consistent) => {
                    warn!(
                        "uvn configuration {}",
                        if *consistent { "consistent" } else { "inconsistent" }
                    );
                }
                PeerEvent::LocalReachableNetworks { new, gone } => {
                    debug!("reachable networks changed: +{} -{}", new.len(), gone.len());
                }
                PeerEvent::ReachableNetworks { new, gone } => {
                    debug!("reachable networks changed: +{} -{}", new.len(), gone.len());
                }
                PeerEvent::FullyRoutedUvn(routed) => {
                    if *routed {
                        warn!("uvn fully routed");
                    } else {
                        warn!("uvn no longer fully routed");
                    }
                }
            }
        }
        if !events.is_empty() {
            self.write_network_tables()?;
            self.peers.save(self.registry.db()).ok();
        }
        if retarget {
            self.update_probe_targets();
        }
        Ok(())
    }

    /// Remote LANs this agent should probe: every routed network announced
    /// by another cell
    fn update_probe_targets(&self) {
        let Some(tester) = &self.peers_tester else {
            return;
        };
        let targets: Vec<LanDescriptor> = self
            .peers
            .iter()
            .filter(|p| !p.local)
            .flat_map(|p| p.routed_networks.iter().cloned())
            .collect();
        tester.set_targets(targets);
    }

    fn write_network_tables(&self) -> Result<()> {
        let local = self.peers.local();
        let mut known = String::new();
        let mut reachable = String::new();
        let mut unreachable = String::new();
        for status in local.known_networks.values() {
            known.push_str(&format!("{}\n", status.lan.nic.subnet));
            if status.reachable {
                reachable.push_str(&format!("{}\n", status.lan.nic.subnet));
            } else {
                unreachable.push_str(&format!("{}\n", status.lan.nic.subnet));
            }
        }
        let mut local_nets = String::new();
        for lan in &self.lans {
            local_nets.push_str(&format!("{}\n", lan.nic.subnet));
        }
        exec::write_atomic(&self.log_dir().join("networks.known"), known.as_bytes())?;
        exec::write_atomic(
            &self.log_dir().join("networks.reachable"),
            reachable.as_bytes(),
        )?;
        exec::write_atomic(
            &self.log_dir().join("networks.unreachable"),
            unreachable.as_bytes(),
        )?;
        exec::write_atomic(&self.log_dir().join("networks.local"), local_nets.as_bytes())?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Publishing
    // ------------------------------------------------------------------

    fn cell_info_sample(&self) -> Option<CellInfoSample> {
        let AgentRole::Cell(cell) = &self.role else {
            return None;
        };
        let local = self.peers.local();
        Some(CellInfoSample {
            uvn: self.registry.uvn.name.clone(),
            cell_id: cell.id,
            config_id: self.config_id.clone(),
            ts_start: self.ts_start.clone(),
            routed_networks: local.routed_networks.iter().cloned().collect(),
            known_networks: local
                .known_networks
                .values()
                .map(|status| KnownNetworkSample {
                    lan: status.lan.clone(),
                    reachable: status.reachable,
                })
                .collect(),
        })
    }

    /// Publish the local status sample
    pub async fn announce(&mut self) -> Result<()> {
        match &self.role {
            AgentRole::Cell(_) => {
                if let Some(sample) = self.cell_info_sample() {
                    self.transport.publish_cell_info(&sample).await?;
                }
            }
            AgentRole::Registry => {
                self.transport
                    .publish_uvn_info(&UvnInfoSample {
                        uvn: self.registry.uvn.name.clone(),
                        config_id: self.config_id.clone(),
                    })
                    .await?;
            }
        }
        self.last_announce = Instant::now();
        Ok(())
    }

    async fn announce_if_due(&mut self) -> Result<()> {
        let period = self.registry.uvn.settings.timing_profile.announce_period();
        if self.last_announce.elapsed() >= period {
            self.announce().await?;
        }
        Ok(())
    }

    /// Registry only: publish the current per-cell configuration packages
    pub async fn publish_packages(&mut self) -> Result<()> {
        if self.is_cell() {
            return Ok(());
        }
        for cell in self.registry.cells()?.values() {
            let built = package::build_cell_package(&self.registry, cell)?;
            let sample = BackboneSample {
                uvn: self.registry.uvn.name.clone(),
                cell_id: cell.id,
                config_id: self.config_id.clone(),
                package: serde_json::to_string(&built)?,
            };
            self.transport.publish_backbone(&sample).await?;
            debug!("published package for cell {}", cell.name);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // VPN statistics
    // ------------------------------------------------------------------

    async fn refresh_vpn_stats(&mut self) -> Result<()> {
        // Rate-limited to at most twice per second
        if self.last_stats.elapsed() < Duration::from_millis(500) {
            return Ok(());
        }
        self.last_stats = Instant::now();
        if !self.enable_net || self.vpn_configs.is_empty() {
            return Ok(());
        }
        let output = match (self.runner)("wg", &["show", "all", "dump"]) {
            Ok(output) => output,
            Err(e) => {
                debug!("wg dump failed: {}", e);
                return Ok(());
            }
        };
        let mut updates: BTreeMap<PeerKey, (BTreeMap<String, VpnIntfStats>, bool)> =
            BTreeMap::new();
        for entry in parse_wg_dump(&output) {
            let Some(key) = self
                .vpn_peer_index
                .get(&(entry.intf.clone(), entry.public_key.clone()))
            else {
                continue;
            };
            let online = entry.online(HANDSHAKE_ONLINE_WINDOW);
            let (stats, any_online) = updates.entry(*key).or_default();
            stats.insert(
                entry.intf.clone(),
                VpnIntfStats {
                    online,
                    last_handshake: entry.handshake_ts(),
                    rx: entry.rx,
                    tx: entry.tx,
                    endpoint: entry.endpoint.clone(),
                },
            );
            *any_online |= online;
        }
        let mut batch = Vec::new();
        for (key, (stats, online)) in updates {
            // Particles have exactly one VPN interface, so their liveness
            // follows the handshake directly
            let status = match (&key, online) {
                (PeerKey::Particle(_), true) => Some(PeerStatus::Online),
                (PeerKey::Particle(_), false) => self
                    .peers
                    .get(key)
                    .filter(|p| p.status == PeerStatus::Online)
                    .map(|_| PeerStatus::Offline),
                _ => None,
            };
            batch.push((
                key,
                PeerUpdate {
                    status,
                    vpn_stats: Some(stats),
                    ..Default::default()
                },
            ));
        }
        if !batch.is_empty() {
            let events = self.peers.update_many(batch);
            self.react(events).await?;
        }
        Ok(())
    }

    async fn spin_services(&mut self) -> Result<()> {
        // Subservices are event-driven through their trigger conditions;
        // nothing polls here beyond the stats refresh
        Ok(())
    }

    // ------------------------------------------------------------------
    // Stop
    // ------------------------------------------------------------------

    /// Announce offline, tear down subservices in reverse start order,
    /// release the PID file
    pub async fn stop(&mut self, assert_stopped: bool) -> Result<()> {
        if self.state == AgentState::Stopped {
            return Ok(());
        }
        self.state = AgentState::Stopping;
        info!("shutting down...");
        self.peers.offline();
        self.peers.save(self.registry.db()).ok();
        self.transport.announce_offline().await.ok();
        self.transport.stop().await.ok();

        let mut services: Vec<&mut dyn AgentService> = Vec::new();
        if let Some(net) = &mut self.net {
            services.push(net);
        }
        if let Some(router) = &mut self.router {
            services.push(router);
        }
        if let Some(monitor) = &mut self.routes_monitor {
            services.push(monitor);
        }
        if let Some(tester) = &mut self.peers_tester {
            services.push(tester);
        }
        let result = stop_all(&mut services, assert_stopped).await;

        if let Some(pid) = &mut self.pid {
            pid.release();
        }
        self.pid = None;
        self.state = AgentState::Stopped;
        info!("shutdown complete");
        result
    }
}

/// Run the full agent lifecycle: start, spin, reload on new configuration,
/// graceful shutdown on SIGINT
pub async fn run(options: AgentOptions) -> Result<()> {
    let root = options.root.clone();
    let enable_net = options.enable_net;
    let allow_invalid_lans = options.allow_invalid_lans;
    let pid_file = options.pid_file.clone();
    let mut next_options = Some(options);
    loop {
        let options = match next_options.take() {
            Some(options) => options,
            None => {
                let mut options = AgentOptions::new(root.clone());
                options.enable_net = enable_net;
                options.allow_invalid_lans = allow_invalid_lans;
                options.pid_file = pid_file.clone();
                options
            }
        };
        let mut agent = Agent::open(options)?;
        agent.start().await?;
        agent.publish_packages().await?;

        let waitset = agent.waitset();
        let outcome = {
            let spin = agent.spin(SpinUntil::Forever, None);
            tokio::pin!(spin);
            tokio::select! {
                outcome = &mut spin => outcome,
                _ = tokio::signal::ctrl_c() => {
                    info!("received shutdown signal");
                    waitset.request_exit();
                    spin.await
                }
            }
        };

        match outcome {
            Ok(SpinOutcome::Reload(reload_package)) => {
                warn!(
                    "reloading with new configuration: {}",
                    reload_package.data.config_id
                );
                agent.stop(true).await?;
                package::install_package(&reload_package, &root)?;
            }
            Ok(_) => {
                agent.stop(false).await?;
                return Ok(());
            }
            Err(e) => {
                agent.stop(true).await.ok();
                return Err(e);
            }
        }
    }
}

/// One peer row of `wg show all dump`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WgDumpEntry {
    pub intf: String,
    pub public_key: String,
    pub endpoint: Option<String>,
    pub last_handshake: i64,
    pub rx: u64,
    pub tx: u64,
}

impl WgDumpEntry {
    fn online(&self, window: Duration) -> bool {
        if self.last_handshake == 0 {
            return false;
        }
        let age = chrono::Utc::now().timestamp() - self.last_handshake;
        age >= 0 && (age as u64) < window.as_secs()
    }

    fn handshake_ts(&self) -> Option<String> {
        if self.last_handshake == 0 {
            return None;
        }
        chrono::DateTime::from_timestamp(self.last_handshake, 0).map(|ts| ts.to_rfc3339())
    }
}

/// Parse `wg show all dump`: interface rows have 5 columns, peer rows 9
pub fn parse_wg_dump(output: &str) -> Vec<WgDumpEntry> {
    let mut entries = Vec::new();
    for line in output.lines() {
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() != 9 {
            continue;
        }
        entries.push(WgDumpEntry {
            intf: fields[0].to_string(),
            public_key: fields[1].to_string(),
            endpoint: match fields[3] {
                "(none)" => None,
                endpoint => Some(endpoint.to_string()),
            },
            last_handshake: fields[5].parse().unwrap_or(0),
            rx: fields[6].parse().unwrap_or(0),
            tx: fields[7].parse().unwrap_or(0),
        });
    }
    entries
}

/// Parse `ip -4 -o addr show` into interface descriptors
pub fn parse_addr_show(output: &str) -> Vec<NicDescriptor> {
    let mut nics = Vec::new();
    for line in output.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 4 || fields[2] != "inet" {
            continue;
        }
        let name = fields[1].to_string();
        let Ok(with_prefix) = fields[3].parse::<Ipv4Network>() else {
            continue;
        };
        let Ok(subnet) = Ipv4Network::new(with_prefix.network(), with_prefix.prefix()) else {
            continue;
        };
        nics.push(NicDescriptor {
            name,
            address: with_prefix.ip(),
            subnet,
        });
    }
    nics
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_addr_show() {
        let output = "\
1: lo    inet 127.0.0.1/8 scope host lo\\       valid_lft forever preferred_lft forever
2: eth0    inet 10.1.0.2/24 brd 10.1.0.255 scope global eth0\\       valid_lft forever preferred_lft forever
3: uwg-b0    inet 10.255.192.2/31 scope global uwg-b0\\       valid_lft forever preferred_lft forever
";
        let nics = parse_addr_show(output);
        assert_eq!(nics.len(), 3);
        assert_eq!(nics[1].name, "eth0");
        assert_eq!(nics[1].address, Ipv4Addr::new(10, 1, 0, 2));
        assert_eq!(nics[1].subnet, "10.1.0.0/24".parse().unwrap());
    }

    #[test]
    fn test_parse_wg_dump() {
        let now = chrono::Utc::now().timestamp();
        let output = format!(
            "uwg-b0\tPRIV\tPUB\t51900\toff\n\
             uwg-b0\tpeerkey1\tpsk\t203.0.113.2:51900\t10.0.0.0/8\t{}\t1024\t2048\t25\n\
             uwg-b0\tpeerkey2\t(none)\t(none)\t10.0.0.0/8\t0\t0\t0\toff\n",
            now - 10
        );
        let entries = parse_wg_dump(&output);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].public_key, "peerkey1");
        assert_eq!(entries[0].endpoint.as_deref(), Some("203.0.113.2:51900"));
        assert!(entries[0].online(HANDSHAKE_ONLINE_WINDOW));
        assert_eq!(entries[0].rx, 1024);
        assert!(entries[1].endpoint.is_none());
        assert!(!entries[1].online(HANDSHAKE_ONLINE_WINDOW));
    }

    #[test]
    fn test_pid_file_scoped_release() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.pid");
        {
            let _pid = PidFile::acquire(path.clone()).unwrap();
            assert!(path.exists());
            // Second acquisition by this process reuses the slot
        }
        assert!(!path.exists());

        // A stale PID file from a dead process is cleared
        std::fs::write(&path, "999999").unwrap();
        let _pid = PidFile::acquire(path.clone()).unwrap();
        assert!(path.exists());
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            std::process::id().to_string()
        );
    }
}
