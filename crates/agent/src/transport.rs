//! Pub/sub transport
//!
//! Three topics move all control-plane state: `UvnInfo` (registry identity),
//! `CellInfo` (per-cell status), and `Backbone` (per-cell configuration
//! packages). The trait abstracts the middleware: typed writers, per-topic
//! reader events, writer liveness, and a waitset whose trigger conditions let
//! background tasks wake the spin thread.
//!
//! Within one poll cycle events are delivered in topic order
//! `UvnInfo -> CellInfo -> Backbone`, then writer liveness transitions, then
//! user triggers.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tracing::{debug, trace, warn};
use uvnet_common::types::{LanDescriptor, ObjectId};
use uvnet_common::{Error, Result};

/// Transport topics, in reader processing order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    UvnInfo,
    CellInfo,
    Backbone,
}

/// Identity of a remote writer instance
pub type InstanceHandle = String;

/// Registry identity announcement; one durable instance per uvn
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UvnInfoSample {
    pub uvn: String,
    pub config_id: String,
}

/// One known network of a cell, with its observed reachability
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownNetworkSample {
    pub lan: LanDescriptor,
    pub reachable: bool,
}

/// Per-cell status; one instance per cell
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellInfoSample {
    pub uvn: String,
    pub cell_id: ObjectId,
    pub config_id: String,
    pub ts_start: Option<String>,
    pub routed_networks: Vec<LanDescriptor>,
    pub known_networks: Vec<KnownNetworkSample>,
}

/// Configuration package addressed to one cell
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackboneSample {
    pub uvn: String,
    pub cell_id: ObjectId,
    pub config_id: String,
    /// Opaque serialized agent package
    pub package: String,
}

/// Everything a poll cycle can surface
#[derive(Debug, Clone)]
pub enum TransportEvent {
    UvnInfo {
        sample: UvnInfoSample,
        instance: InstanceHandle,
    },
    CellInfo {
        sample: CellInfoSample,
        instance: InstanceHandle,
    },
    Backbone {
        sample: BackboneSample,
    },
    /// A remote writer lost liveness
    WriterOffline {
        topic: Topic,
        instance: InstanceHandle,
    },
    /// A waitset trigger condition fired
    Trigger {
        condition: String,
    },
}

impl TransportEvent {
    fn rank(&self) -> usize {
        match self {
            TransportEvent::UvnInfo { .. } => 0,
            TransportEvent::CellInfo { .. } => 1,
            TransportEvent::Backbone { .. } => 2,
            TransportEvent::WriterOffline { .. } => 3,
            TransportEvent::Trigger { .. } => 4,
        }
    }
}

/// Order events for one poll cycle: readers first, by topic, then liveness,
/// then triggers; arrival order preserved within each class
pub fn sort_events(events: &mut Vec<TransportEvent>) {
    events.sort_by_key(|e| e.rank());
}

/// A waitset trigger condition. Background tasks call `trigger`; the spin
/// thread observes the condition name in the next poll cycle.
#[derive(Clone)]
pub struct TriggerCondition {
    name: String,
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl TriggerCondition {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }
}

/// The waitset shared by a transport and its trigger conditions
#[derive(Clone, Default)]
pub struct WaitSet {
    notify: Arc<Notify>,
    conditions: Arc<Mutex<Vec<TriggerCondition>>>,
    exit: Arc<AtomicBool>,
}

impl WaitSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a named trigger condition attached to this waitset
    pub fn new_condition(&self, name: impl Into<String>) -> TriggerCondition {
        let condition = TriggerCondition {
            name: name.into(),
            flag: Arc::new(AtomicBool::new(false)),
            notify: self.notify.clone(),
        };
        self.conditions.lock().push(condition.clone());
        condition
    }

    /// Request that the current and all future polls return immediately
    pub fn request_exit(&self) {
        self.exit.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    pub fn exit_requested(&self) -> bool {
        self.exit.load(Ordering::SeqCst)
    }

    fn drain_triggers(&self) -> Vec<TransportEvent> {
        self.conditions
            .lock()
            .iter()
            .filter(|c| c.flag.swap(false, Ordering::SeqCst))
            .map(|c| TransportEvent::Trigger {
                condition: c.name.clone(),
            })
            .collect()
    }

    async fn notified(&self) {
        self.notify.notified().await;
    }
}

/// Abstract pub/sub transport
#[async_trait]
pub trait Transport: Send {
    async fn start(&mut self) -> Result<()>;
    async fn stop(&mut self) -> Result<()>;

    /// Collect the events of one poll cycle, blocking at most `max_wait`
    async fn poll(&mut self, max_wait: Duration) -> Result<Vec<TransportEvent>>;

    async fn publish_uvn_info(&self, sample: &UvnInfoSample) -> Result<()>;
    async fn publish_cell_info(&self, sample: &CellInfoSample) -> Result<()>;
    async fn publish_backbone(&self, sample: &BackboneSample) -> Result<()>;

    /// Announce an orderly departure of this writer
    async fn announce_offline(&self) -> Result<()>;

    /// The waitset backing this transport's trigger conditions
    fn waitset(&self) -> WaitSet;
}

// ---------------------------------------------------------------------------
// UDP implementation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum EnvelopeKind {
    Sample,
    Heartbeat,
    Bye,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Envelope {
    writer: InstanceHandle,
    kind: EnvelopeKind,
    topic: Option<Topic>,
    payload: Option<serde_json::Value>,
}

/// Static configuration of the UDP transport
#[derive(Debug, Clone)]
pub struct UdpTransportConfig {
    /// Local bind address
    pub bind: SocketAddr,
    /// Addresses of the initial peers
    pub peers: Vec<SocketAddr>,
    /// This writer's instance handle (`uvn:<name>` or `cell:<id>`)
    pub writer: InstanceHandle,
    /// Heartbeat period; a writer is offline after three missed beats
    pub liveness_period: Duration,
}

struct WriterLiveness {
    last_seen: Instant,
    topics: Vec<Topic>,
    offline: bool,
}

/// JSON-over-UDP transport with heartbeat liveness
pub struct UdpTransport {
    config: UdpTransportConfig,
    socket: Option<Arc<UdpSocket>>,
    waitset: WaitSet,
    writers: Mutex<BTreeMap<InstanceHandle, WriterLiveness>>,
    last_heartbeat: Mutex<Instant>,
    /// Samples we republish with heartbeats so late joiners converge
    last_samples: Mutex<BTreeMap<Topic, serde_json::Value>>,
}

impl UdpTransport {
    pub fn new(config: UdpTransportConfig) -> Self {
        Self {
            config,
            socket: None,
            waitset: WaitSet::new(),
            writers: Mutex::new(BTreeMap::new()),
            last_heartbeat: Mutex::new(Instant::now()),
            last_samples: Mutex::new(BTreeMap::new()),
        }
    }

    async fn send_envelope(&self, envelope: &Envelope) -> Result<()> {
        let Some(socket) = &self.socket else {
            return Err(Error::NetworkError("transport not started".into()));
        };
        let bytes = serde_json::to_vec(envelope)?;
        for peer in &self.config.peers {
            if let Err(e) = socket.send_to(&bytes, peer).await {
                trace!("send to {} failed: {}", peer, e);
            }
        }
        Ok(())
    }

    async fn publish(&self, topic: Topic, payload: serde_json::Value) -> Result<()> {
        self.last_samples.lock().insert(topic, payload.clone());
        self.send_envelope(&Envelope {
            writer: self.config.writer.clone(),
            kind: EnvelopeKind::Sample,
            topic: Some(topic),
            payload: Some(payload),
        })
        .await
    }

    async fn heartbeat_if_due(&self) -> Result<()> {
        {
            let mut last = self.last_heartbeat.lock();
            if last.elapsed() < self.config.liveness_period {
                return Ok(());
            }
            *last = Instant::now();
        }
        self.send_envelope(&Envelope {
            writer: self.config.writer.clone(),
            kind: EnvelopeKind::Heartbeat,
            topic: None,
            payload: None,
        })
        .await
    }

    fn note_writer(&self, writer: &InstanceHandle, topic: Option<Topic>) {
        let mut writers = self.writers.lock();
        let entry = writers.entry(writer.clone()).or_insert(WriterLiveness {
            last_seen: Instant::now(),
            topics: Vec::new(),
            offline: false,
        });
        entry.last_seen = Instant::now();
        entry.offline = false;
        if let Some(topic) = topic {
            if !entry.topics.contains(&topic) {
                entry.topics.push(topic);
            }
        }
    }

    fn liveness_events(&self) -> Vec<TransportEvent> {
        let deadline = self.config.liveness_period * 3;
        let mut events = Vec::new();
        let mut writers = self.writers.lock();
        for (writer, state) in writers.iter_mut() {
            if !state.offline && state.last_seen.elapsed() > deadline {
                state.offline = true;
                for topic in &state.topics {
                    events.push(TransportEvent::WriterOffline {
                        topic: *topic,
                        instance: writer.clone(),
                    });
                }
            }
        }
        events
    }

    fn decode(&self, bytes: &[u8]) -> Option<Vec<TransportEvent>> {
        let envelope: Envelope = match serde_json::from_slice(bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("ignoring malformed transport datagram: {}", e);
                return None;
            }
        };
        if envelope.writer == self.config.writer {
            return None;
        }
        match envelope.kind {
            EnvelopeKind::Heartbeat => {
                self.note_writer(&envelope.writer, None);
                None
            }
            EnvelopeKind::Bye => {
                let mut writers = self.writers.lock();
                if let Some(state) = writers.get_mut(&envelope.writer) {
                    if !state.offline {
                        state.offline = true;
                        return Some(
                            state
                                .topics
                                .iter()
                                .map(|topic| TransportEvent::WriterOffline {
                                    topic: *topic,
                                    instance: envelope.writer.clone(),
                                })
                                .collect(),
                        );
                    }
                }
                None
            }
            EnvelopeKind::Sample => {
                let topic = envelope.topic?;
                self.note_writer(&envelope.writer, Some(topic));
                let payload = envelope.payload?;
                let event = match topic {
                    Topic::UvnInfo => TransportEvent::UvnInfo {
                        sample: serde_json::from_value(payload).ok()?,
                        instance: envelope.writer,
                    },
                    Topic::CellInfo => TransportEvent::CellInfo {
                        sample: serde_json::from_value(payload).ok()?,
                        instance: envelope.writer,
                    },
                    Topic::Backbone => TransportEvent::Backbone {
                        sample: serde_json::from_value(payload).ok()?,
                    },
                };
                Some(vec![event])
            }
        }
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn start(&mut self) -> Result<()> {
        let socket = UdpSocket::bind(self.config.bind)
            .await
            .map_err(|e| Error::NetworkError(format!("bind {}: {}", self.config.bind, e)))?;
        debug!("transport bound to {}", self.config.bind);
        self.socket = Some(Arc::new(socket));
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        self.socket = None;
        Ok(())
    }

    async fn poll(&mut self, max_wait: Duration) -> Result<Vec<TransportEvent>> {
        let Some(socket) = self.socket.clone() else {
            return Err(Error::NetworkError("transport not started".into()));
        };
        self.heartbeat_if_due().await?;

        let mut events = Vec::new();
        let deadline = Instant::now() + max_wait;
        let mut buf = vec![0u8; 64 * 1024];

        // Wait for the first stimulus, then drain without blocking
        while events.is_empty() && !self.waitset.exit_requested() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            tokio::select! {
                received = socket.recv_from(&mut buf) => {
                    if let Ok((n, _)) = received {
                        if let Some(decoded) = self.decode(&buf[..n]) {
                            events.extend(decoded);
                        }
                    }
                }
                _ = self.waitset.notified() => {}
                _ = tokio::time::sleep(remaining) => break,
            }
            events.extend(self.waitset.drain_triggers());
        }

        // Non-blocking drain of anything else already queued
        while let Ok((n, _)) = socket.try_recv_from(&mut buf) {
            if let Some(decoded) = self.decode(&buf[..n]) {
                events.extend(decoded);
            }
        }
        events.extend(self.waitset.drain_triggers());
        events.extend(self.liveness_events());
        sort_events(&mut events);
        Ok(events)
    }

    async fn publish_uvn_info(&self, sample: &UvnInfoSample) -> Result<()> {
        self.publish(Topic::UvnInfo, serde_json::to_value(sample)?).await
    }

    async fn publish_cell_info(&self, sample: &CellInfoSample) -> Result<()> {
        self.publish(Topic::CellInfo, serde_json::to_value(sample)?).await
    }

    async fn publish_backbone(&self, sample: &BackboneSample) -> Result<()> {
        self.publish(Topic::Backbone, serde_json::to_value(sample)?).await
    }

    async fn announce_offline(&self) -> Result<()> {
        self.send_envelope(&Envelope {
            writer: self.config.writer.clone(),
            kind: EnvelopeKind::Bye,
            topic: None,
            payload: None,
        })
        .await
    }

    fn waitset(&self) -> WaitSet {
        self.waitset.clone()
    }
}

// ---------------------------------------------------------------------------
// In-process loopback, used by tests
// ---------------------------------------------------------------------------

type LoopbackQueue = Arc<Mutex<VecDeque<TransportEvent>>>;

/// Shared hub connecting loopback endpoints
#[derive(Clone, Default)]
pub struct LoopbackHub {
    endpoints: Arc<Mutex<BTreeMap<InstanceHandle, (LoopbackQueue, Arc<Notify>)>>>,
    /// Topics each writer has published on, for Bye fan-out
    topics: Arc<Mutex<BTreeMap<InstanceHandle, Vec<Topic>>>>,
}

impl LoopbackHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn endpoint(&self, writer: impl Into<InstanceHandle>) -> LoopbackTransport {
        let writer = writer.into();
        let queue: LoopbackQueue = Arc::new(Mutex::new(VecDeque::new()));
        let notify = Arc::new(Notify::new());
        self.endpoints
            .lock()
            .insert(writer.clone(), (queue.clone(), notify.clone()));
        LoopbackTransport {
            hub: self.clone(),
            writer,
            queue,
            notify,
            waitset: WaitSet::new(),
        }
    }

    fn broadcast(&self, from: &InstanceHandle, event: TransportEvent, topic: Option<Topic>) {
        if let Some(topic) = topic {
            let mut topics = self.topics.lock();
            let entry = topics.entry(from.clone()).or_default();
            if !entry.contains(&topic) {
                entry.push(topic);
            }
        }
        for (writer, (queue, notify)) in self.endpoints.lock().iter() {
            if writer == from {
                continue;
            }
            queue.lock().push_back(event.clone());
            notify.notify_one();
        }
    }
}

/// Test transport delivering events through an in-process hub
pub struct LoopbackTransport {
    hub: LoopbackHub,
    writer: InstanceHandle,
    queue: LoopbackQueue,
    notify: Arc<Notify>,
    waitset: WaitSet,
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn start(&mut self) -> Result<()> {
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        self.hub.endpoints.lock().remove(&self.writer);
        Ok(())
    }

    async fn poll(&mut self, max_wait: Duration) -> Result<Vec<TransportEvent>> {
        let deadline = Instant::now() + max_wait;
        let mut events: Vec<TransportEvent> = self.queue.lock().drain(..).collect();
        events.extend(self.waitset.drain_triggers());
        while events.is_empty() && !self.waitset.exit_requested() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = self.waitset.notified() => {}
                _ = tokio::time::sleep(remaining) => break,
            }
            events.extend(self.queue.lock().drain(..));
            events.extend(self.waitset.drain_triggers());
        }
        sort_events(&mut events);
        Ok(events)
    }

    async fn publish_uvn_info(&self, sample: &UvnInfoSample) -> Result<()> {
        self.hub.broadcast(
            &self.writer,
            TransportEvent::UvnInfo {
                sample: sample.clone(),
                instance: self.writer.clone(),
            },
            Some(Topic::UvnInfo),
        );
        Ok(())
    }

    async fn publish_cell_info(&self, sample: &CellInfoSample) -> Result<()> {
        self.hub.broadcast(
            &self.writer,
            TransportEvent::CellInfo {
                sample: sample.clone(),
                instance: self.writer.clone(),
            },
            Some(Topic::CellInfo),
        );
        Ok(())
    }

    async fn publish_backbone(&self, sample: &BackboneSample) -> Result<()> {
        self.hub.broadcast(
            &self.writer,
            TransportEvent::Backbone {
                sample: sample.clone(),
            },
            Some(Topic::Backbone),
        );
        Ok(())
    }

    async fn announce_offline(&self) -> Result<()> {
        let topics = self
            .hub
            .topics
            .lock()
            .get(&self.writer)
            .cloned()
            .unwrap_or_default();
        for topic in topics {
            self.hub.broadcast(
                &self.writer,
                TransportEvent::WriterOffline {
                    topic,
                    instance: self.writer.clone(),
                },
                None,
            );
        }
        Ok(())
    }

    fn waitset(&self) -> WaitSet {
        self.waitset.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cell_info(cell_id: ObjectId) -> CellInfoSample {
        CellInfoSample {
            uvn: "u1".into(),
            cell_id,
            config_id: "cfg".into(),
            ts_start: None,
            routed_networks: Vec::new(),
            known_networks: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_loopback_delivery_and_ordering() {
        let hub = LoopbackHub::new();
        let registry = hub.endpoint("uvn:u1");
        let mut cell = hub.endpoint("cell:1");

        // Published out of topic order; delivered readers-first in topic order
        registry
            .publish_backbone(&BackboneSample {
                uvn: "u1".into(),
                cell_id: 1,
                config_id: "cfg".into(),
                package: String::new(),
            })
            .await
            .unwrap();
        registry
            .publish_uvn_info(&UvnInfoSample {
                uvn: "u1".into(),
                config_id: "cfg".into(),
            })
            .await
            .unwrap();
        let trigger = cell.waitset().new_condition("probe");
        trigger.trigger();

        let events = cell.poll(Duration::from_millis(100)).await.unwrap();
        assert_eq!(events.len(), 3);
        assert!(matches!(events[0], TransportEvent::UvnInfo { .. }));
        assert!(matches!(events[1], TransportEvent::Backbone { .. }));
        assert!(matches!(events[2], TransportEvent::Trigger { .. }));
    }

    #[tokio::test]
    async fn test_loopback_offline_announcement() {
        let hub = LoopbackHub::new();
        let peer = hub.endpoint("cell:2");
        let mut observer = hub.endpoint("cell:1");

        peer.publish_cell_info(&cell_info(2)).await.unwrap();
        observer.poll(Duration::from_millis(50)).await.unwrap();

        peer.announce_offline().await.unwrap();
        let events = observer.poll(Duration::from_millis(50)).await.unwrap();
        assert!(events.iter().any(|e| matches!(
            e,
            TransportEvent::WriterOffline { topic: Topic::CellInfo, instance } if instance == "cell:2"
        )));
    }

    #[tokio::test]
    async fn test_exit_guard_unblocks_poll() {
        let hub = LoopbackHub::new();
        let mut cell = hub.endpoint("cell:1");
        let waitset = cell.waitset();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            waitset.request_exit();
        });
        let started = Instant::now();
        let events = cell.poll(Duration::from_secs(30)).await.unwrap();
        assert!(events.is_empty());
        assert!(started.elapsed() < Duration::from_secs(5));
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_udp_roundtrip() {
        let a_addr: SocketAddr = "127.0.0.1:39411".parse().unwrap();
        let b_addr: SocketAddr = "127.0.0.1:39412".parse().unwrap();
        let mut a = UdpTransport::new(UdpTransportConfig {
            bind: a_addr,
            peers: vec![b_addr],
            writer: "cell:1".into(),
            liveness_period: Duration::from_secs(5),
        });
        let mut b = UdpTransport::new(UdpTransportConfig {
            bind: b_addr,
            peers: vec![a_addr],
            writer: "cell:2".into(),
            liveness_period: Duration::from_secs(5),
        });
        a.start().await.unwrap();
        b.start().await.unwrap();

        a.publish_cell_info(&cell_info(1)).await.unwrap();
        let events = b.poll(Duration::from_secs(2)).await.unwrap();
        assert!(events.iter().any(|e| matches!(
            e,
            TransportEvent::CellInfo { sample, .. } if sample.cell_id == 1
        )));

        a.stop().await.unwrap();
        b.stop().await.unwrap();
    }
}
