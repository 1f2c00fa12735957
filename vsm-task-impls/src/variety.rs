// Copyright (c) 2024-2025 Viable Systems (viablesystems.io)
// This file is part of the VSM repository.

// You should have received a copy of the MIT License
// along with the VSM repository. If not, see <https://mit-license.org/>.

//! Variety channels: typed transformers between adjacent subsystems. A
//! channel subscribes to its upstream topic, applies its transformer and
//! republishes downstream. Capacity is enforced on the channel's internal
//! backlog; when the backlog exceeds capacity the configured damping policy
//! applies. A blocked channel stops forwarding but keeps accounting and
//! emits pain, so the loop never stalls silently.

use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc, Weak,
};

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use vsm_bus::{AlgedonicChannel, EventBus, SubscribeOptions};
use vsm_types::{
    metrics::{Counter, Gauge, Metrics},
    Severity, SubsystemKind, Topic, VsmEvent, VsmEventType,
};

/// What to do with backlog beyond capacity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DampingPolicy {
    /// Shed the oldest queued events.
    Drop,
    /// Merge the two oldest queued events into one.
    Coalesce,
    /// Shed the oldest and scream about it.
    EmitPain,
}

#[derive(Clone, Debug)]
pub struct VarietyChannelConfig {
    pub from: SubsystemKind,
    pub to: SubsystemKind,
    pub capacity: usize,
    pub policy: DampingPolicy,
}

impl VarietyChannelConfig {
    pub fn new(from: SubsystemKind, to: SubsystemKind) -> Self {
        Self {
            from,
            to,
            capacity: 128,
            policy: DampingPolicy::EmitPain,
        }
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_policy(mut self, policy: DampingPolicy) -> Self {
        self.policy = policy;
        self
    }
}

type Transformer = Box<dyn Fn(&VsmEvent) -> Option<VsmEvent> + Send + Sync>;

struct ChannelMetrics {
    forwarded: Box<dyn Counter>,
    damped: Box<dyn Counter>,
    coalesced: Box<dyn Counter>,
    pressure: Box<dyn Gauge>,
}

struct ChannelInner {
    from: SubsystemKind,
    to: SubsystemKind,
    capacity: AtomicUsize,
    policy: DampingPolicy,
    transformer: Transformer,
    backlog: AtomicUsize,
    blocked: AtomicBool,
    bus: EventBus,
    algedonic: AlgedonicChannel,
    metrics: ChannelMetrics,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for ChannelInner {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}

#[derive(Clone)]
pub struct VarietyChannel(Arc<ChannelInner>);

impl VarietyChannel {
    pub fn new(
        config: VarietyChannelConfig,
        transformer: impl Fn(&VsmEvent) -> Option<VsmEvent> + Send + Sync + 'static,
        bus: EventBus,
        algedonic: AlgedonicChannel,
        metrics: &(impl Metrics + ?Sized),
    ) -> Self {
        let metrics = metrics.subgroup(format!("channel.{}_{}", config.from, config.to));
        let inner = Arc::new(ChannelInner {
            from: config.from,
            to: config.to,
            capacity: AtomicUsize::new(config.capacity),
            policy: config.policy,
            transformer: Box::new(transformer),
            backlog: AtomicUsize::new(0),
            blocked: AtomicBool::new(false),
            bus,
            algedonic,
            metrics: ChannelMetrics {
                forwarded: metrics.create_counter("forwarded".into(), None),
                damped: metrics.create_counter("damped".into(), None),
                coalesced: metrics.create_counter("coalesced".into(), None),
                pressure: metrics.create_gauge("pressure_pct".into(), None),
            },
            task: Mutex::new(None),
        });
        let task = tokio::spawn(Self::run(Arc::downgrade(&inner)));
        *inner.task.lock() = Some(task);
        Self(inner)
    }

    pub fn name(&self) -> String {
        format!("channel/{}_{}", self.0.from, self.0.to)
    }

    pub fn from(&self) -> SubsystemKind {
        self.0.from
    }

    pub fn to(&self) -> SubsystemKind {
        self.0.to
    }

    /// Backlog over capacity, in `[0, 1]`.
    pub fn pressure(&self) -> f64 {
        let capacity = self.0.capacity.load(Ordering::Relaxed).max(1);
        let backlog = self.0.backlog.load(Ordering::Relaxed);
        (backlog as f64 / capacity as f64).clamp(0.0, 1.0)
    }

    pub fn capacity(&self) -> usize {
        self.0.capacity.load(Ordering::Relaxed)
    }

    /// Adjust capacity (S3 control does this) and announce the change.
    pub fn set_capacity(&self, capacity: usize) {
        self.0.capacity.store(capacity.max(1), Ordering::Relaxed);
        self.0.bus.publish(
            Topic::ChannelCapacityChange,
            serde_json::json!({
                "channel": self.name(),
                "capacity": capacity,
            }),
        );
    }

    pub fn is_blocked(&self) -> bool {
        self.0.blocked.load(Ordering::Relaxed)
    }

    /// Block or unblock forwarding. Blocking emits pain; a broken channel
    /// must never go quiet.
    pub fn set_blocked(&self, blocked: bool) {
        let was = self.0.blocked.swap(blocked, Ordering::Relaxed);
        if blocked && !was {
            tracing::warn!(channel = %self.name(), "variety channel blocked");
            self.0.algedonic.pain(
                self.name(),
                "channel_blocked",
                Severity::High,
                serde_json::json!({ "from": self.0.from.as_str(), "to": self.0.to.as_str() }),
            );
        } else if !blocked && was {
            tracing::info!(channel = %self.name(), "variety channel unblocked");
        }
    }

    async fn run(inner: Weak<ChannelInner>) {
        let (mut rx, name) = {
            let Some(inner) = inner.upgrade() else {
                return;
            };
            let name = format!("channel/{}_{}", inner.from, inner.to);
            let rx = inner.bus.subscribe(
                inner.from.topic(),
                name.clone(),
                SubscribeOptions::default(),
            );
            (rx, name)
        };

        let mut queue: std::collections::VecDeque<VsmEvent> = std::collections::VecDeque::new();
        while let Some(message) = rx.recv().await {
            let Some(inner) = inner.upgrade() else {
                return;
            };
            for event in message.into_events() {
                let Some(vsm) = VsmEvent::from_value(&event.data) else {
                    continue;
                };
                let Some(transformed) = (inner.transformer)(&vsm) else {
                    continue;
                };
                queue.push_back(transformed);
            }

            // Capacity enforcement on the queued backlog.
            let capacity = inner.capacity.load(Ordering::Relaxed).max(1);
            while queue.len() > capacity {
                match inner.policy {
                    DampingPolicy::Drop => {
                        queue.pop_front();
                        inner.metrics.damped.increment();
                    },
                    DampingPolicy::Coalesce => {
                        if let (Some(old), Some(newer)) = (queue.pop_front(), queue.pop_front()) {
                            queue.push_front(coalesce(old, newer));
                            inner.metrics.coalesced.increment();
                        }
                    },
                    DampingPolicy::EmitPain => {
                        queue.pop_front();
                        inner.metrics.damped.increment();
                        inner.algedonic.pain(
                            name.clone(),
                            "variety_overflow",
                            Severity::Medium,
                            serde_json::json!({ "capacity": capacity }),
                        );
                    },
                }
            }

            // Forward unless blocked; blocked backlog stays queued and is
            // damped above, so pressure (and pain) stay visible.
            if !inner.blocked.load(Ordering::Relaxed) {
                let to_topic = inner.to.topic();
                while let Some(out) = queue.pop_front() {
                    inner.bus.publish(to_topic.clone(), out.to_value());
                    inner.metrics.forwarded.increment();
                }
            }
            inner.backlog.store(queue.len(), Ordering::Relaxed);
            inner
                .metrics
                .pressure
                .set(((queue.len() * 100) / capacity.max(1)) as i64);
        }
    }
}

/// Merge two queued events, keeping the newer payload and summing the
/// magnitudes so no variety is lost from the accounting.
fn coalesce(old: VsmEvent, newer: VsmEvent) -> VsmEvent {
    let mut merged = newer;
    let old_magnitude = old.data["magnitude"].as_f64().unwrap_or(0.0);
    if let Some(object) = merged.data.as_object_mut() {
        let magnitude = object
            .get("magnitude")
            .and_then(serde_json::Value::as_f64)
            .unwrap_or(0.0);
        object.insert(
            "magnitude".into(),
            serde_json::json!(magnitude + old_magnitude),
        );
        let coalesced = object
            .get("coalesced")
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(1);
        object.insert("coalesced".into(), serde_json::json!(coalesced + 1));
    }
    merged
}

/// The canonical S1 → S2 aggregation channel.
pub fn s1_to_s2(
    bus: EventBus,
    algedonic: AlgedonicChannel,
    metrics: &(impl Metrics + ?Sized),
) -> VarietyChannel {
    let clock = Arc::clone(bus.clock());
    VarietyChannel::new(
        VarietyChannelConfig::new(SubsystemKind::S1, SubsystemKind::S2),
        move |event| {
            (event.kind == VsmEventType::Operational).then(|| {
                VsmEvent::new(
                    SubsystemKind::S2,
                    VsmEventType::Aggregated,
                    event.data.clone(),
                    clock.now(),
                )
            })
        },
        bus,
        algedonic,
        metrics,
    )
}

/// The canonical S2 → S3 channel: coordinated variety becomes control-ready
/// input.
pub fn s2_to_s3(
    bus: EventBus,
    algedonic: AlgedonicChannel,
    metrics: &(impl Metrics + ?Sized),
) -> VarietyChannel {
    let clock = Arc::clone(bus.clock());
    VarietyChannel::new(
        VarietyChannelConfig::new(SubsystemKind::S2, SubsystemKind::S3),
        move |event| {
            (event.kind == VsmEventType::Coordinated).then(|| {
                VsmEvent::new(
                    SubsystemKind::S3,
                    VsmEventType::ControlReady,
                    event.data.clone(),
                    clock.now(),
                )
            })
        },
        bus,
        algedonic,
        metrics,
    )
}

/// The canonical S3 → S1 command channel, closing the loop.
pub fn s3_to_s1(
    bus: EventBus,
    algedonic: AlgedonicChannel,
    metrics: &(impl Metrics + ?Sized),
) -> VarietyChannel {
    let clock = Arc::clone(bus.clock());
    VarietyChannel::new(
        VarietyChannelConfig::new(SubsystemKind::S3, SubsystemKind::S1),
        move |event| {
            (event.kind == VsmEventType::ControlCommand).then(|| {
                VsmEvent::new(
                    SubsystemKind::S1,
                    VsmEventType::ControlCommand,
                    event.data.clone(),
                    clock.now(),
                )
            })
        },
        bus,
        algedonic,
        metrics,
    )
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use pretty_assertions::assert_eq;
    use serde_json::json;
    use vsm_bus::BusConfig;
    use vsm_types::{metrics::InMemoryMetrics, HlcClock};
    use vsm_utils::test_utils::setup_test;

    use super::*;

    fn setup() -> (EventBus, AlgedonicChannel, InMemoryMetrics, Arc<HlcClock>) {
        let metrics = InMemoryMetrics::new();
        let clock = Arc::new(HlcClock::new("test-node"));
        let bus = EventBus::new(Arc::clone(&clock), BusConfig::default(), &metrics);
        let algedonic = AlgedonicChannel::new(bus.clone(), Duration::from_millis(10), &metrics);
        (bus, algedonic, metrics, clock)
    }

    #[tokio::test]
    async fn test_transforms_operational_into_aggregated() {
        setup_test();
        let (bus, algedonic, metrics, clock) = setup();
        let _channel = s1_to_s2(bus.clone(), algedonic, &metrics);
        let mut rx = bus.subscribe(
            Topic::S2Coordination,
            "observer",
            SubscribeOptions::default(),
        );

        let vsm = VsmEvent::new(
            SubsystemKind::S1,
            VsmEventType::Operational,
            json!({"unit": "unit-1", "magnitude": 0.7}),
            clock.now(),
        );
        bus.publish(Topic::S1Operations, vsm.to_value());

        let msg = tokio::time::timeout(Duration::from_millis(500), rx.recv())
            .await
            .expect("transformed event forwarded")
            .unwrap();
        let out = VsmEvent::from_value(&msg.into_events()[0].data).unwrap();
        assert_eq!(out.kind, VsmEventType::Aggregated);
        assert_eq!(out.subsystem, SubsystemKind::S2);
        assert_eq!(out.data["unit"], json!("unit-1"));
    }

    #[tokio::test]
    async fn test_non_matching_kinds_are_ignored() {
        setup_test();
        let (bus, algedonic, metrics, clock) = setup();
        let _channel = s1_to_s2(bus.clone(), algedonic, &metrics);
        let mut rx = bus.subscribe(
            Topic::S2Coordination,
            "observer",
            SubscribeOptions::default(),
        );
        let vsm = VsmEvent::new(
            SubsystemKind::S1,
            VsmEventType::ControlCommand,
            json!({}),
            clock.now(),
        );
        bus.publish(Topic::S1Operations, vsm.to_value());
        assert!(
            tokio::time::timeout(Duration::from_millis(150), rx.recv())
                .await
                .is_err(),
            "commands are not aggregated"
        );
    }

    #[tokio::test]
    async fn test_blocked_channel_emits_pain_and_damps() {
        setup_test();
        let (bus, algedonic, metrics, clock) = setup();
        let channel = VarietyChannel::new(
            VarietyChannelConfig::new(SubsystemKind::S1, SubsystemKind::S2).with_capacity(2),
            {
                let clock = Arc::clone(&clock);
                move |event: &VsmEvent| {
                    Some(VsmEvent::new(
                        SubsystemKind::S2,
                        VsmEventType::Aggregated,
                        event.data.clone(),
                        clock.now(),
                    ))
                }
            },
            bus.clone(),
            algedonic.clone(),
            &metrics,
        );
        let mut pain_rx = bus.subscribe(Topic::AlgedonicPain, "observer", SubscribeOptions::default());

        channel.set_blocked(true);
        // Blocking itself screams.
        let msg = tokio::time::timeout(Duration::from_millis(500), pain_rx.recv())
            .await
            .expect("blocked channel emits pain")
            .unwrap();
        assert_eq!(
            msg.into_events()[0].metadata.reason.as_deref(),
            Some("channel_blocked")
        );

        // Overfill past capacity; overflow damping emits more pain.
        for n in 0..5 {
            let vsm = VsmEvent::new(
                SubsystemKind::S1,
                VsmEventType::Operational,
                json!({ "n": n }),
                clock.now(),
            );
            bus.publish(Topic::S1Operations, vsm.to_value());
        }
        let msg = tokio::time::timeout(Duration::from_millis(500), pain_rx.recv())
            .await
            .expect("overflow emits pain")
            .unwrap();
        assert_eq!(
            msg.into_events()[0].metadata.reason.as_deref(),
            Some("variety_overflow")
        );
        assert!(channel.pressure() > 0.0);

        // Unblocking drains the surviving backlog downstream.
        let mut down_rx = bus.subscribe(
            Topic::S2Coordination,
            "downstream",
            SubscribeOptions::default(),
        );
        channel.set_blocked(false);
        let vsm = VsmEvent::new(
            SubsystemKind::S1,
            VsmEventType::Operational,
            json!({"n": 99}),
            clock.now(),
        );
        bus.publish(Topic::S1Operations, vsm.to_value());
        let msg = tokio::time::timeout(Duration::from_millis(500), down_rx.recv())
            .await
            .expect("unblocked channel forwards")
            .unwrap();
        assert!(!msg.into_events().is_empty());
    }

    #[tokio::test]
    async fn test_set_capacity_publishes_change() {
        setup_test();
        let (bus, algedonic, metrics, _clock) = setup();
        let channel = s1_to_s2(bus.clone(), algedonic, &metrics);
        let mut rx = bus.subscribe(
            Topic::ChannelCapacityChange,
            "observer",
            SubscribeOptions::default(),
        );
        channel.set_capacity(64);
        let msg = tokio::time::timeout(Duration::from_millis(500), rx.recv())
            .await
            .expect("capacity change announced")
            .unwrap();
        let event = &msg.into_events()[0];
        assert_eq!(event.data["capacity"], json!(64));
        assert_eq!(channel.capacity(), 64);
    }

    #[test]
    fn test_coalesce_sums_magnitudes() {
        let clock = HlcClock::new("n");
        let old = VsmEvent::new(
            SubsystemKind::S2,
            VsmEventType::Aggregated,
            json!({"magnitude": 0.4}),
            clock.now(),
        );
        let newer = VsmEvent::new(
            SubsystemKind::S2,
            VsmEventType::Aggregated,
            json!({"magnitude": 0.5}),
            clock.now(),
        );
        let merged = coalesce(old, newer);
        assert_eq!(merged.data["magnitude"], json!(0.9));
        assert_eq!(merged.data["coalesced"], json!(2));
    }
}
