//! Remote LAN reachability prober
//!
//! A background task pings the gateway of every known remote LAN at the rate
//! set by the uvn's timing profile, then wakes the spin thread through the
//! service trigger. The spin thread drains the results and applies the
//! hysteresis: one success marks a LAN reachable, N consecutive failures
//! (from the timing profile) mark it unreachable again. LANs owned by the
//! local cell are never probed.

use crate::service::AgentService;
use crate::transport::TriggerCondition;
use ipnetwork::Ipv4Network;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, trace};
use uvnet_common::types::{LanDescriptor, TimingProfile};
use uvnet_common::Result;

/// Outcome of one probe
#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub lan: LanDescriptor,
    pub ok: bool,
}

/// A reachability transition derived from probe results
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LanTransition {
    pub lan: LanDescriptor,
    pub reachable: bool,
}

pub struct PeersTester {
    timing: TimingProfile,
    trigger: TriggerCondition,
    targets: Arc<Mutex<Vec<LanDescriptor>>>,
    active: Arc<AtomicBool>,
    results_tx: mpsc::UnboundedSender<ProbeResult>,
    results_rx: mpsc::UnboundedReceiver<ProbeResult>,
    task: Option<tokio::task::JoinHandle<()>>,
    /// Consecutive failures per subnet, spin-thread state
    failures: BTreeMap<Ipv4Network, u32>,
    /// Last reported reachability per subnet
    reachable: BTreeMap<Ipv4Network, bool>,
}

impl PeersTester {
    pub fn new(timing: TimingProfile, trigger: TriggerCondition) -> Self {
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        Self {
            timing,
            trigger,
            targets: Arc::new(Mutex::new(Vec::new())),
            active: Arc::new(AtomicBool::new(false)),
            results_tx,
            results_rx,
            task: None,
            failures: BTreeMap::new(),
            reachable: BTreeMap::new(),
        }
    }

    /// Replace the set of remote LANs to probe
    pub fn set_targets(&self, targets: Vec<LanDescriptor>) {
        *self.targets.lock() = targets;
    }

    pub async fn start(&mut self) -> Result<()> {
        self.active.store(true, Ordering::SeqCst);
        let targets = self.targets.clone();
        let active = self.active.clone();
        let results = self.results_tx.clone();
        let trigger = self.trigger.clone();
        let period = self.timing.probe_period();
        let timeout = self.timing.probe_timeout();
        self.task = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(period).await;
                if !active.load(Ordering::SeqCst) {
                    break;
                }
                let snapshot: Vec<LanDescriptor> = targets.lock().clone();
                let mut produced = false;
                for lan in snapshot {
                    let ok = ping(&lan, timeout).await;
                    // Abandoned probes are discarded: results are only
                    // published while the service is running
                    if !active.load(Ordering::SeqCst) {
                        return;
                    }
                    trace!("probe {}: {}", lan, if ok { "ok" } else { "failed" });
                    if results.send(ProbeResult { lan, ok }).is_err() {
                        return;
                    }
                    produced = true;
                }
                if produced {
                    trigger.trigger();
                }
            }
        }));
        Ok(())
    }

    /// Drain results and apply the hysteresis. Returns the transitions.
    pub fn process_results(&mut self) -> Vec<LanTransition> {
        let mut transitions = Vec::new();
        while let Ok(result) = self.results_rx.try_recv() {
            let subnet = result.lan.nic.subnet;
            let currently = self.reachable.get(&subnet).copied().unwrap_or(false);
            if result.ok {
                self.failures.insert(subnet, 0);
                if !currently {
                    self.reachable.insert(subnet, true);
                    debug!("network reachable: {}", result.lan);
                    transitions.push(LanTransition {
                        lan: result.lan,
                        reachable: true,
                    });
                }
            } else {
                let failures = self.failures.entry(subnet).or_insert(0);
                *failures += 1;
                if currently && *failures >= self.timing.probe_max_failures() {
                    self.reachable.insert(subnet, false);
                    debug!("network unreachable: {}", result.lan);
                    transitions.push(LanTransition {
                        lan: result.lan,
                        reachable: false,
                    });
                }
            }
        }
        transitions
    }

    #[cfg(test)]
    fn inject(&self, result: ProbeResult) {
        self.results_tx.send(result).unwrap();
    }
}

/// Probe a LAN by pinging its gateway
async fn ping(lan: &LanDescriptor, timeout: Duration) -> bool {
    let secs = timeout.as_secs().max(1).to_string();
    let target = lan.gw.to_string();
    tokio::process::Command::new("ping")
        .args(["-c", "1", "-W", &secs, &target])
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .await
        .map(|status| status.success())
        .unwrap_or(false)
}

#[async_trait::async_trait]
impl AgentService for PeersTester {
    fn name(&self) -> &'static str {
        "peers-tester"
    }

    async fn stop(&mut self, _assert_stopped: bool) -> Result<()> {
        self.active.store(false, Ordering::SeqCst);
        if let Some(task) = self.task.take() {
            task.abort();
        }
        Ok(())
    }
}
