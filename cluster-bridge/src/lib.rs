//! Optional cross-node replication. The bridge subscribes to a configured
//! set of topics and fans every event out to its peers, each behind its own
//! outbound queue, circuit breaker and per-channel-class variety quota.
//! Events arriving from peers are folded into the local HLC, tagged
//! `_from_cluster` and republished locally; tagged events are never
//! replicated again, so there are no replication loops. Partitions are
//! detected through the membership collaborator's quorum verdict.

pub mod wire;

use std::{
    collections::HashMap,
    sync::{Arc, Weak},
    time::Duration,
};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::{sync::mpsc, task::JoinHandle, time::Instant};
use vsm_bus::{AlgedonicChannel, EventBus, SubscribeOptions};
use vsm_protection::{BreakerConfig, CircuitBreaker};
use vsm_types::{
    metrics::{Counter, Gauge, Metrics},
    traits::{Membership, PartitionStatus},
    CoreResult, Event, NodeId, Severity, Topic,
};

use crate::wire::WireRecord;

/// How often the peer set and partition verdict are refreshed.
const MEMBERSHIP_POLL: Duration = Duration::from_secs(2);

/// Heartbeat cadence per peer; doubles as the breaker's recovery probe.
const HEARTBEAT_EVERY: Duration = Duration::from_secs(5);

/// Outbound queue length per peer.
const PEER_QUEUE: usize = 1024;

/// How a transport delivers one encoded frame to a peer. The concrete
/// transport (TCP, AMQP, whatever the deployment uses) is a collaborator.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn send(&self, peer: &NodeId, frame: Vec<u8>) -> CoreResult<()>;
}

/// Variety class of a replicated topic, each with its own per-second quota.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChannelClass {
    Algedonic,
    S1,
    S2,
    S3,
    S4,
    S5,
    General,
}

impl ChannelClass {
    pub fn for_topic(topic: &Topic) -> Self {
        match topic {
            Topic::AlgedonicPain
            | Topic::AlgedonicPleasure
            | Topic::EmergencyAlgedonic
            | Topic::VsmAlgedonic => Self::Algedonic,
            Topic::S1Operations => Self::S1,
            Topic::S2Coordination => Self::S2,
            Topic::S3Control => Self::S3,
            Topic::S4EnvironmentalSignal
            | Topic::PatternDetected
            | Topic::TemporalPatternDetected
            | Topic::PatternsIndexed => Self::S4,
            Topic::PolicyDirective => Self::S5,
            _ => Self::General,
        }
    }

    /// Events per second allowed toward one peer; `None` is unlimited.
    pub fn quota_per_second(self) -> Option<f64> {
        match self {
            Self::Algedonic => None,
            Self::S5 => Some(50.0),
            Self::S4 => Some(100.0),
            Self::S3 => Some(200.0),
            Self::S2 => Some(500.0),
            Self::S1 => Some(1000.0),
            Self::General => Some(100.0),
        }
    }
}

/// Continuous-refill quota bucket, one second of burst.
#[derive(Debug)]
struct QuotaBucket {
    tokens: f64,
    rate: f64,
    last_refill: Instant,
}

impl QuotaBucket {
    fn new(rate: f64) -> Self {
        Self {
            tokens: rate,
            rate,
            last_refill: Instant::now(),
        }
    }

    fn try_take(&mut self) -> bool {
        let now = Instant::now();
        self.tokens = (self.tokens + self.rate * now.duration_since(self.last_refill).as_secs_f64())
            .min(self.rate);
        self.last_refill = now;
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[derive(Clone, Debug)]
pub struct ClusterBridgeConfig {
    /// Topics replicated to peers.
    pub topics: Vec<Topic>,
}

impl Default for ClusterBridgeConfig {
    fn default() -> Self {
        Self {
            topics: Topic::canonical().to_vec(),
        }
    }
}

struct PeerState {
    queue: mpsc::Sender<WireRecord>,
    quotas: Mutex<HashMap<ChannelClass, QuotaBucket>>,
    breaker: CircuitBreaker,
    task: JoinHandle<()>,
}

impl Drop for PeerState {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct BridgeMetrics {
    replicated: Box<dyn Counter>,
    quota_dropped: Box<dyn Counter>,
    queue_dropped: Box<dyn Counter>,
    received: Box<dyn Counter>,
    rejected: Box<dyn Counter>,
    peers: Box<dyn Gauge>,
    partitioned: Box<dyn Gauge>,
}

struct BridgeInner {
    config: ClusterBridgeConfig,
    bus: EventBus,
    algedonic: AlgedonicChannel,
    membership: Arc<dyn Membership>,
    transport: Arc<dyn PeerTransport>,
    peers: DashMap<NodeId, PeerState>,
    metrics: BridgeMetrics,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Drop for BridgeInner {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

#[derive(Clone)]
pub struct ClusterBridge(Arc<BridgeInner>);

impl ClusterBridge {
    pub fn new(
        config: ClusterBridgeConfig,
        bus: EventBus,
        algedonic: AlgedonicChannel,
        membership: Arc<dyn Membership>,
        transport: Arc<dyn PeerTransport>,
        metrics: &(impl Metrics + ?Sized),
    ) -> Self {
        let metrics = metrics.subgroup("cluster".into());
        let inner = Arc::new(BridgeInner {
            config,
            bus,
            algedonic,
            membership,
            transport,
            peers: DashMap::new(),
            metrics: BridgeMetrics {
                replicated: metrics.create_counter("replicated".into(), None),
                quota_dropped: metrics.create_counter("quota_dropped".into(), None),
                queue_dropped: metrics.create_counter("queue_dropped".into(), None),
                received: metrics.create_counter("received".into(), None),
                rejected: metrics.create_counter("rejected".into(), None),
                peers: metrics.create_gauge("peers".into(), None),
                partitioned: metrics.create_gauge("partitioned".into(), None),
            },
            tasks: Mutex::new(vec![]),
        });

        let outbound = tokio::spawn(Self::outbound_loop(Arc::downgrade(&inner)));
        let membership_task = tokio::spawn(Self::membership_loop(Arc::downgrade(&inner)));
        inner.tasks.lock().extend([outbound, membership_task]);
        Self(inner)
    }

    pub fn peer_count(&self) -> usize {
        self.0.peers.len()
    }

    pub fn peer_breaker(&self, peer: &NodeId) -> Option<CircuitBreaker> {
        self.0.peers.get(peer).map(|p| p.breaker.clone())
    }

    /// Feed a frame received from the network into the local bus. Remote
    /// HLCs are folded into the local clock; events are tagged
    /// `_from_cluster` so they never replicate onward.
    pub fn handle_frame(&self, bytes: &[u8]) -> CoreResult<()> {
        let (record, _consumed) = WireRecord::decode(bytes).inspect_err(|_| {
            self.0.metrics.rejected.increment();
        })?;
        if record.source_node == *self.0.bus.clock().node() {
            return Ok(());
        }
        match record.kind {
            wire::RecordKind::Heartbeat => {
                self.0.bus.clock().update(&record.hlc)?;
                Ok(())
            },
            wire::RecordKind::Event => {
                let mut event = record.decode_event().inspect_err(|_| {
                    self.0.metrics.rejected.increment();
                })?;
                // A drift-rejected stamp rejects the whole event; replaying
                // it would wreck ordered buffers downstream.
                self.0.bus.clock().update(&event.hlc).inspect_err(|_| {
                    self.0.metrics.rejected.increment();
                })?;
                event.metadata.from_cluster = true;
                self.0.metrics.received.increment();
                self.0.bus.publish_event(event);
                Ok(())
            },
        }
    }

    async fn outbound_loop(inner: Weak<BridgeInner>) {
        let mut receivers = {
            let Some(inner) = inner.upgrade() else {
                return;
            };
            inner
                .config
                .topics
                .iter()
                .map(|topic| {
                    inner.bus.subscribe(
                        topic.clone(),
                        format!("cluster_bridge/{topic}"),
                        SubscribeOptions::default(),
                    )
                })
                .collect::<Vec<_>>()
        };

        loop {
            // Poll every replicated topic's mailbox; a simple select over a
            // dynamic set.
            let message = {
                let polls = receivers.iter_mut().map(|rx| Box::pin(rx.recv()));
                futures_select_all(polls).await
            };
            let Some(message) = message else {
                return;
            };
            let Some(inner) = inner.upgrade() else {
                return;
            };
            for event in message.into_events() {
                Self::replicate(&inner, &event);
            }
        }
    }

    fn replicate(inner: &Arc<BridgeInner>, event: &Event) {
        // Never re-replicate events that came from another node.
        if event.metadata.from_cluster {
            return;
        }
        let class = ChannelClass::for_topic(&event.topic);
        let node = inner.bus.clock().node().clone();
        let record = match WireRecord::event(event, node) {
            Ok(record) => record,
            Err(err) => {
                tracing::warn!(%err, "failed to encode event for replication");
                inner.metrics.rejected.increment();
                return;
            },
        };

        for peer in inner.peers.iter() {
            // Per-peer, per-class variety quota.
            if let Some(rate) = class.quota_per_second() {
                let mut quotas = peer.quotas.lock();
                let bucket = quotas
                    .entry(class)
                    .or_insert_with(|| QuotaBucket::new(rate));
                if !bucket.try_take() {
                    inner.metrics.quota_dropped.increment();
                    continue;
                }
            }
            match peer.queue.try_send(record.clone()) {
                Ok(()) => inner.metrics.replicated.increment(),
                Err(_) => inner.metrics.queue_dropped.increment(),
            }
        }
    }

    async fn membership_loop(inner: Weak<BridgeInner>) {
        let mut was_partitioned = false;
        loop {
            tokio::time::sleep(MEMBERSHIP_POLL).await;
            let Some(inner) = inner.upgrade() else {
                return;
            };

            let peers = inner.membership.peers().await;
            let local = inner.bus.clock().node().clone();

            // Add newly-discovered peers.
            for peer in &peers {
                if *peer == local || inner.peers.contains_key(peer) {
                    continue;
                }
                Self::add_peer(&inner, peer.clone());
            }
            // Drop peers that left.
            inner
                .peers
                .retain(|node, _| peers.contains(node));
            inner.metrics.peers.set(inner.peers.len() as i64);

            // Partition verdict from the quorum collaborator.
            let status = inner.membership.partition_status().await;
            let partitioned = status == PartitionStatus::Partitioned;
            inner.metrics.partitioned.set(i64::from(partitioned));
            if partitioned && !was_partitioned {
                tracing::error!("cluster partition detected");
                inner.algedonic.pain(
                    "cluster_bridge",
                    "partition_detected",
                    Severity::Critical,
                    serde_json::json!({ "peers": peers.len() }),
                );
            } else if !partitioned && was_partitioned {
                inner.algedonic.pleasure(
                    "cluster_bridge",
                    "partition_healed",
                    Severity::Low,
                    serde_json::json!({}),
                );
            }
            was_partitioned = partitioned;
        }
    }

    fn add_peer(inner: &Arc<BridgeInner>, peer: NodeId) {
        let (tx, rx) = mpsc::channel(PEER_QUEUE);
        let breaker = CircuitBreaker::new(
            BreakerConfig::new(format!("peer/{peer}")),
            inner.algedonic.clone(),
            &vsm_types::metrics::NoMetrics,
        );
        let task = tokio::spawn(Self::peer_loop(
            Arc::downgrade(inner),
            peer.clone(),
            rx,
            breaker.clone(),
        ));
        tracing::info!(%peer, "cluster peer added");
        inner.peers.insert(
            peer,
            PeerState {
                queue: tx,
                quotas: Mutex::new(HashMap::new()),
                breaker,
                task,
            },
        );
    }

    /// Drains one peer's outbound queue through its breaker, interleaving
    /// heartbeats that double as recovery probes.
    async fn peer_loop(
        inner: Weak<BridgeInner>,
        peer: NodeId,
        mut rx: mpsc::Receiver<WireRecord>,
        breaker: CircuitBreaker,
    ) {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_EVERY);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            let record = tokio::select! {
                maybe = rx.recv() => match maybe {
                    Some(record) => record,
                    None => return,
                },
                _ = heartbeat.tick() => {
                    let Some(inner) = inner.upgrade() else {
                        return;
                    };
                    let clock = inner.bus.clock();
                    WireRecord::heartbeat(clock.now(), clock.node().clone())
                },
            };
            let Some(inner) = inner.upgrade() else {
                return;
            };
            let frame = match record.encode() {
                Ok(frame) => frame,
                Err(err) => {
                    tracing::warn!(%peer, %err, "failed to encode outbound frame");
                    continue;
                },
            };
            let transport = Arc::clone(&inner.transport);
            let target = peer.clone();
            let result = breaker
                .call(move || async move { transport.send(&target, frame).await })
                .await;
            if let Err(err) = result {
                // The breaker has already counted the failure (and emitted
                // pain if it tripped); the frame is dropped, at-most-once.
                tracing::debug!(%peer, %err, "replication send failed");
                inner.metrics.queue_dropped.increment();
            }
        }
    }
}

/// Await the first mailbox with a message. A tiny select-all so the bridge
/// does not need one task per replicated topic.
async fn futures_select_all<F>(polls: impl Iterator<Item = F>) -> Option<vsm_bus::BusMessage>
where
    F: std::future::Future<Output = Option<vsm_bus::BusMessage>> + Unpin,
{
    let polls: Vec<F> = polls.collect();
    if polls.is_empty() {
        return None;
    }
    let (message, _index, _rest) = futures::future::select_all(polls).await;
    message
}
