// Copyright (c) 2024-2025 Viable Systems (viablesystems.io)
// This file is part of the VSM repository.

// You should have received a copy of the MIT License
// along with the VSM repository. If not, see <https://mit-license.org/>.

//! The control loop: a periodic driver that polls subsystem health, marks
//! channels whose source has failed, runs the cognitive cycle S1 → S5
//! (bypassing S2/S4 in emergency mode) and keeps the operator-facing system
//! status. Emergency mode engages on critical viability threats or an
//! emergency algedonic scream.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::{sync::watch, task::JoinHandle, time::Instant};
use vsm_bus::{AlgedonicChannel, EventBus, SubscribeOptions};
use vsm_task::Supervisor;
use vsm_types::{
    metrics::{Counter, Histogram, Metrics},
    CoreOptions, Severity, SubsystemKind, SubsystemStatus, Topic,
};

use crate::{variety::VarietyChannel, WorkerCommand, WorkerHandle};

/// Shared emergency flag, watchable by anything that needs to react.
#[derive(Debug)]
pub struct EmergencyMode {
    flag: AtomicBool,
    tx: watch::Sender<bool>,
}

impl EmergencyMode {
    pub fn new() -> Arc<Self> {
        let (tx, _) = watch::channel(false);
        Arc::new(Self {
            flag: AtomicBool::new(false),
            tx,
        })
    }

    /// Returns true when this call actually flipped the flag on.
    pub fn enable(&self) -> bool {
        let flipped = !self.flag.swap(true, Ordering::SeqCst);
        if flipped {
            self.tx.send_replace(true);
        }
        flipped
    }

    pub fn disable(&self) -> bool {
        let flipped = self.flag.swap(false, Ordering::SeqCst);
        if flipped {
            self.tx.send_replace(false);
        }
        flipped
    }

    pub fn is_on(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn watch(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

#[derive(Clone, Debug)]
pub struct ControlLoopConfig {
    pub cycle: Duration,
    pub emergency_on_start: bool,
}

impl Default for ControlLoopConfig {
    fn default() -> Self {
        Self {
            cycle: Duration::from_secs(1),
            emergency_on_start: false,
        }
    }
}

impl From<&CoreOptions> for ControlLoopConfig {
    fn from(opt: &CoreOptions) -> Self {
        Self {
            cycle: opt.cycle(),
            emergency_on_start: opt.emergency_on_start,
        }
    }
}

/// Operator-facing health report.
#[derive(Clone, Debug, Serialize)]
pub struct SystemStatus {
    pub emergency: bool,
    pub cycle_count: u64,
    pub subsystems: HashMap<String, SubsystemStatus>,
    pub channels: Vec<ChannelStatus>,
}

#[derive(Clone, Debug, Serialize)]
pub struct ChannelStatus {
    pub name: String,
    pub from: SubsystemKind,
    pub to: SubsystemKind,
    pub pressure: f64,
    pub blocked: bool,
    pub capacity: usize,
}

struct LoopMetrics {
    cycles: Box<dyn Counter>,
    emergencies: Box<dyn Counter>,
    cycle_time_ms: Box<dyn Histogram>,
}

struct LoopInner {
    config: ControlLoopConfig,
    supervisor: Supervisor,
    workers: Vec<WorkerHandle>,
    channels: Vec<VarietyChannel>,
    emergency: Arc<EmergencyMode>,
    bus: EventBus,
    algedonic: AlgedonicChannel,
    cycle_count: AtomicU64,
    last_health: RwLock<HashMap<String, SubsystemStatus>>,
    metrics: LoopMetrics,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Drop for LoopInner {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

#[derive(Clone)]
pub struct ControlLoop(Arc<LoopInner>);

impl ControlLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ControlLoopConfig,
        supervisor: Supervisor,
        mut workers: Vec<WorkerHandle>,
        channels: Vec<VarietyChannel>,
        emergency: Arc<EmergencyMode>,
        bus: EventBus,
        algedonic: AlgedonicChannel,
        metrics: &(impl Metrics + ?Sized),
    ) -> Self {
        let metrics = metrics.subgroup("control_loop".into());
        // The cognitive cycle runs in subsystem order.
        workers.sort_by_key(|w| w.kind);
        let inner = Arc::new(LoopInner {
            config,
            supervisor,
            workers,
            channels,
            emergency,
            bus,
            algedonic,
            cycle_count: AtomicU64::new(0),
            last_health: RwLock::new(HashMap::new()),
            metrics: LoopMetrics {
                cycles: metrics.create_counter("cycles".into(), None),
                emergencies: metrics.create_counter("emergencies".into(), None),
                cycle_time_ms: metrics.create_histogram("cycle_time_ms".into(), None),
            },
            tasks: Mutex::new(vec![]),
        });

        let this = Self(Arc::clone(&inner));
        if inner.config.emergency_on_start {
            this.enable_emergency_mode();
        }
        let ticker = tokio::spawn(Self::tick_loop(Arc::downgrade(&inner)));
        let listener = tokio::spawn(Self::threat_listener(Arc::downgrade(&inner)));
        inner.tasks.lock().extend([ticker, listener]);
        this
    }

    pub fn is_emergency(&self) -> bool {
        self.0.emergency.is_on()
    }

    pub fn cycle_count(&self) -> u64 {
        self.0.cycle_count.load(Ordering::Relaxed)
    }

    /// Run one control cycle now, outside the periodic schedule.
    pub async fn trigger_control_cycle(&self) {
        Self::tick(&self.0).await;
    }

    pub fn enable_emergency_mode(&self) {
        if self.0.emergency.enable() {
            self.0.metrics.emergencies.increment();
            tracing::error!("control loop entering emergency mode");
            // S5 must know; the algedonic channel carries the broadcast.
            for worker in &self.0.workers {
                if worker.kind == SubsystemKind::S5 {
                    worker.set_emergency(true);
                }
            }
            self.0.algedonic.pain(
                "control_loop",
                "emergency_mode",
                Severity::High,
                serde_json::json!({}),
            );
        }
    }

    pub fn disable_emergency_mode(&self) {
        if self.0.emergency.disable() {
            tracing::info!("control loop leaving emergency mode");
            for worker in &self.0.workers {
                worker.set_emergency(false);
            }
        }
    }

    pub async fn get_system_status(&self) -> SystemStatus {
        SystemStatus {
            emergency: self.0.emergency.is_on(),
            cycle_count: self.cycle_count(),
            subsystems: self.0.last_health.read().clone(),
            channels: self
                .0
                .channels
                .iter()
                .map(|channel| ChannelStatus {
                    name: channel.name(),
                    from: channel.from(),
                    to: channel.to(),
                    pressure: channel.pressure(),
                    blocked: channel.is_blocked(),
                    capacity: channel.capacity(),
                })
                .collect(),
        }
    }

    async fn tick_loop(inner: Weak<LoopInner>) {
        let cycle = {
            let Some(inner) = inner.upgrade() else {
                return;
            };
            inner.config.cycle
        };
        let mut ticker = tokio::time::interval(cycle);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let Some(inner) = inner.upgrade() else {
                return;
            };
            Self::tick(&inner).await;
        }
    }

    async fn tick(inner: &Arc<LoopInner>) {
        let started = Instant::now();

        // 1. Poll subsystem health.
        let health = inner.supervisor.health_check().await;
        *inner.last_health.write() = health.clone();

        // 2. Block channels whose source subsystem has failed.
        for channel in &inner.channels {
            let source_failed = health
                .get(channel.from().as_str())
                .is_some_and(|status| status.is_failed());
            if source_failed && !channel.is_blocked() {
                channel.set_blocked(true);
                inner.bus.publish(
                    Topic::ViabilityThreat,
                    serde_json::json!({
                        "channel": channel.name(),
                        "reason": "source_failed",
                        "severity": "high",
                    }),
                );
            } else if !source_failed && channel.is_blocked() {
                channel.set_blocked(false);
            }
        }

        // 3. Cognitive cycle; S2 and S4 are bypassed in emergency mode in
        //    favor of direct S3 → S1 control.
        let emergency = inner.emergency.is_on();
        for worker in &inner.workers {
            if emergency && matches!(worker.kind, SubsystemKind::S2 | SubsystemKind::S4) {
                continue;
            }
            if !worker.trigger_cycle() {
                tracing::debug!(worker = %worker.name, "worker mailbox full, cycle skipped");
            }
        }

        // 4. Cycle bookkeeping.
        inner.cycle_count.fetch_add(1, Ordering::Relaxed);
        inner.metrics.cycles.increment();
        inner
            .metrics
            .cycle_time_ms
            .add_point(started.elapsed().as_secs_f64() * 1000.0);
    }

    /// Watches for conditions that demand emergency mode.
    async fn threat_listener(inner: Weak<LoopInner>) {
        let (mut threat_rx, mut vsm_threat_rx, mut emergency_rx) = {
            let Some(inner) = inner.upgrade() else {
                return;
            };
            (
                inner.bus.subscribe(
                    Topic::ViabilityThreat,
                    "control_loop",
                    SubscribeOptions::default(),
                ),
                inner.bus.subscribe(
                    Topic::VsmViabilityThreat,
                    "control_loop",
                    SubscribeOptions::default(),
                ),
                inner.bus.subscribe(
                    Topic::EmergencyAlgedonic,
                    "control_loop",
                    SubscribeOptions::default(),
                ),
            )
        };

        loop {
            let message = tokio::select! {
                maybe = threat_rx.recv() => maybe.map(|m| (false, m)),
                maybe = vsm_threat_rx.recv() => maybe.map(|m| (false, m)),
                maybe = emergency_rx.recv() => maybe.map(|m| (true, m)),
            };
            let Some((scream, message)) = message else {
                return;
            };
            let Some(inner) = inner.upgrade() else {
                return;
            };
            let this = ControlLoop(inner);
            for event in message.into_events() {
                let critical = scream
                    || event.metadata.severity == Some(Severity::Critical)
                    || event.data["severity"].as_str() == Some("critical");
                if critical {
                    this.enable_emergency_mode();
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use vsm_bus::BusConfig;
    use vsm_task::{RestartPolicy, Supervised};
    use vsm_types::{metrics::InMemoryMetrics, CoreResult, HlcClock};
    use vsm_utils::test_utils::setup_test;

    use super::*;
    use crate::{s1::S1Operations, variety};

    struct Harness {
        control: ControlLoop,
        bus: EventBus,
        supervisor: Supervisor,
        emergency: Arc<EmergencyMode>,
        metrics: InMemoryMetrics,
    }

    /// A worker that refuses to run, for failure-path tests.
    struct Broken;

    #[async_trait]
    impl Supervised for Broken {
        fn name(&self) -> String {
            "s1".into()
        }

        async fn run(
            self: Arc<Self>,
            _shutdown: watch::Receiver<bool>,
        ) -> CoreResult<()> {
            Err(vsm_types::CoreError::Internal("wrecked".into()))
        }

        async fn status(&self) -> SubsystemStatus {
            SubsystemStatus::Failed
        }
    }

    async fn harness(cycle: Duration, broken_s1: bool) -> Harness {
        let metrics = InMemoryMetrics::new();
        let clock = Arc::new(HlcClock::new("test-node"));
        let bus = EventBus::new(clock, BusConfig::default(), &metrics);
        let algedonic = AlgedonicChannel::new(bus.clone(), Duration::from_millis(10), &metrics);
        let supervisor = Supervisor::new(
            RestartPolicy {
                max_restarts: 1,
                window: Duration::from_secs(60),
            },
            bus.clone(),
        );
        let emergency = EmergencyMode::new();

        let mut workers = vec![];
        if broken_s1 {
            supervisor.supervise(Arc::new(Broken));
        } else {
            let (s1, s1_handle) = S1Operations::new(bus.clone(), algedonic.clone(), &metrics);
            supervisor.supervise(s1 as Arc<dyn Supervised>);
            workers.push(s1_handle);
        }
        let channels = vec![variety::s1_to_s2(bus.clone(), algedonic.clone(), &metrics)];

        let control = ControlLoop::new(
            ControlLoopConfig {
                cycle,
                emergency_on_start: false,
            },
            supervisor.clone(),
            workers,
            channels,
            Arc::clone(&emergency),
            bus.clone(),
            algedonic,
            &metrics,
        );
        Harness {
            control,
            bus,
            supervisor,
            emergency,
            metrics,
        }
    }

    #[tokio::test]
    async fn test_cycles_advance_on_schedule() {
        setup_test();
        let harness = harness(Duration::from_millis(50), false).await;
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(harness.control.cycle_count() >= 3);
        assert!(harness.metrics.value("control_loop.cycles") >= 3);
        harness.supervisor.shutdown();
    }

    #[tokio::test]
    async fn test_failed_source_blocks_channel_and_reports_threat() {
        setup_test();
        let harness = harness(Duration::from_millis(50), true).await;
        let mut threat_rx = harness.bus.subscribe(
            Topic::ViabilityThreat,
            "observer",
            SubscribeOptions::default(),
        );

        // Give the supervisor time to exhaust restarts and the loop time to
        // notice.
        tokio::time::sleep(Duration::from_millis(600)).await;
        let status = harness.control.get_system_status().await;
        assert_eq!(status.subsystems["s1"], SubsystemStatus::Failed);
        assert!(status.channels[0].blocked);

        let msg = tokio::time::timeout(Duration::from_millis(500), threat_rx.recv())
            .await
            .expect("blocked channel publishes viability threat")
            .unwrap();
        let event = &msg.into_events()[0];
        assert_eq!(event.data["reason"], json!("source_failed"));
        harness.supervisor.shutdown();
    }

    #[tokio::test]
    async fn test_emergency_engages_on_critical_threat() {
        setup_test();
        let harness = harness(Duration::from_millis(100), false).await;
        assert!(!harness.control.is_emergency());
        harness.bus.publish(
            Topic::VsmViabilityThreat,
            json!({"reason": "meltdown", "severity": "critical"}),
        );
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(harness.control.is_emergency());
        assert!(harness.emergency.is_on());

        harness.control.disable_emergency_mode();
        assert!(!harness.control.is_emergency());
        harness.supervisor.shutdown();
    }

    #[tokio::test]
    async fn test_emergency_scream_engages_emergency_mode() {
        setup_test();
        let harness = harness(Duration::from_millis(100), false).await;
        harness.bus.publish_with_metadata(
            Topic::EmergencyAlgedonic,
            json!({"message": "fire"}),
            vsm_types::EventMetadata::algedonic("test", Severity::Critical),
        );
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(harness.control.is_emergency());
        harness.supervisor.shutdown();
    }
}
