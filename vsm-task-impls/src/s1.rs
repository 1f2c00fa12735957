// Copyright (c) 2024-2025 Viable Systems (viablesystems.io)
// This file is part of the VSM repository.

// You should have received a copy of the MIT License
// along with the VSM repository. If not, see <https://mit-license.org/>.

//! S1 Operations: absorbs environmental variety into operational events and
//! applies control commands coming back around the loop. Under pain, S1
//! attenuates: low-magnitude variety is shed before it spends downstream
//! capacity.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::{mpsc, watch, Mutex};
use vsm_bus::{AlgedonicChannel, BusMessage, EventBus, SubscribeOptions};
use vsm_task::Supervised;
use vsm_types::{
    metrics::{Counter, Metrics},
    CoreResult, SubsystemKind, SubsystemStatus, Topic, VsmEvent, VsmEventType,
};

use crate::{WorkerCommand, WorkerHandle};

/// Pain level above which low-magnitude variety is attenuated away.
const ATTENUATION_PAIN: f64 = 0.7;

/// Magnitude below which attenuated variety is dropped.
const ATTENUATION_FLOOR: f64 = 0.2;

#[derive(Clone, Debug, Default)]
pub struct S1Snapshot {
    pub status: SubsystemStatus,
    pub absorbed: u64,
    pub commands_applied: u64,
    pub attenuated: u64,
    pub pain_level: f64,
    pub emergency: bool,
    /// Per-unit throttle factors installed by control commands.
    pub throttle: HashMap<String, f64>,
}

struct S1Metrics {
    absorbed: Box<dyn Counter>,
    emitted: Box<dyn Counter>,
    commands_applied: Box<dyn Counter>,
    attenuated: Box<dyn Counter>,
}

pub struct S1Operations {
    bus: EventBus,
    algedonic: AlgedonicChannel,
    state: RwLock<S1Snapshot>,
    commands: Mutex<mpsc::Receiver<WorkerCommand>>,
    metrics: S1Metrics,
    /// Variety absorbed since the last cognitive cycle.
    cycle_magnitude: RwLock<f64>,
}

impl S1Operations {
    pub fn new(
        bus: EventBus,
        algedonic: AlgedonicChannel,
        metrics: &(impl Metrics + ?Sized),
    ) -> (Arc<Self>, WorkerHandle) {
        let metrics = metrics.subgroup("s1".into());
        let (tx, rx) = mpsc::channel(16);
        let worker = Arc::new(Self {
            bus,
            algedonic,
            state: RwLock::new(S1Snapshot {
                status: SubsystemStatus::Starting,
                ..S1Snapshot::default()
            }),
            commands: Mutex::new(rx),
            metrics: S1Metrics {
                absorbed: metrics.create_counter("absorbed".into(), None),
                emitted: metrics.create_counter("emitted".into(), None),
                commands_applied: metrics.create_counter("commands_applied".into(), None),
                attenuated: metrics.create_counter("attenuated".into(), None),
            },
            cycle_magnitude: RwLock::new(0.0),
        });
        let handle = WorkerHandle::new(SubsystemKind::S1, "s1".into(), tx);
        (worker, handle)
    }

    pub fn snapshot(&self) -> S1Snapshot {
        self.state.read().clone()
    }

    fn handle_event(&self, event: &vsm_types::Event) {
        match VsmEvent::from_value(&event.data) {
            Some(vsm) => match vsm.kind {
                VsmEventType::OperationStarted => {
                    self.absorb(
                        vsm.data["unit"].as_str().unwrap_or("unknown"),
                        vsm.data["magnitude"].as_f64().unwrap_or(1.0),
                    );
                },
                VsmEventType::ControlCommand => self.apply_command(&vsm.data),
                // Our own output and other traffic on the topic.
                _ => {},
            },
            // Raw payloads on the operations topic are environmental
            // variety too.
            None => {
                self.absorb(
                    event.data["unit"].as_str().unwrap_or("unknown"),
                    event.data["magnitude"].as_f64().unwrap_or(1.0),
                );
            },
        }
    }

    /// Take one unit of environmental variety in and emit it as operational
    /// variety, throttled and attenuated as currently commanded.
    fn absorb(&self, unit: &str, magnitude: f64) {
        let (factor, attenuate) = {
            let mut state = self.state.write();
            state.absorbed += 1;
            let factor = state.throttle.get(unit).copied().unwrap_or(1.0);
            let attenuate =
                state.pain_level >= ATTENUATION_PAIN && magnitude < ATTENUATION_FLOOR;
            if attenuate {
                state.attenuated += 1;
            }
            (factor, attenuate)
        };
        self.metrics.absorbed.increment();
        if attenuate {
            self.metrics.attenuated.increment();
            return;
        }

        let out_magnitude = magnitude * factor;
        *self.cycle_magnitude.write() += out_magnitude;
        let vsm = VsmEvent::new(
            SubsystemKind::S1,
            VsmEventType::Operational,
            serde_json::json!({
                "unit": unit,
                "magnitude": out_magnitude,
            }),
            self.bus.clock().now(),
        );
        self.bus.publish(Topic::S1Operations, vsm.to_value());
        self.metrics.emitted.increment();
    }

    fn apply_command(&self, data: &serde_json::Value) {
        let target = data["target"].as_str().unwrap_or("system").to_string();
        let action = data["action"].as_str().unwrap_or("steady");
        let factor = data["factor"].as_f64().unwrap_or(1.0);
        {
            let mut state = self.state.write();
            match action {
                "throttle" => {
                    state.throttle.insert(target.clone(), factor.clamp(0.0, 1.0));
                },
                "steady" | "resume" => {
                    state.throttle.remove(&target);
                },
                other => {
                    tracing::debug!(action = other, "ignoring unknown control action");
                    return;
                },
            }
            state.commands_applied += 1;
        }
        self.metrics.commands_applied.increment();
        tracing::debug!(unit = %target, action, factor, "applied control command");
    }

    fn handle_command(&self, command: WorkerCommand) {
        match command {
            WorkerCommand::RunCycle => {
                // Decay pain and emit the cycle's absorbed variety summary.
                let pending = {
                    let mut state = self.state.write();
                    state.pain_level *= 0.8;
                    std::mem::take(&mut *self.cycle_magnitude.write())
                };
                if pending > 0.0 {
                    let vsm = VsmEvent::new(
                        SubsystemKind::S1,
                        VsmEventType::Operational,
                        serde_json::json!({
                            "unit": "s1",
                            "magnitude": pending,
                            "summary": true,
                        }),
                        self.bus.clock().now(),
                    );
                    self.bus.publish(Topic::S1Operations, vsm.to_value());
                }
            },
            WorkerCommand::SetEmergency(on) => {
                self.state.write().emergency = on;
            },
        }
    }

    fn note_pain(&self, intensity: f64, pleasure: bool) {
        let mut state = self.state.write();
        if pleasure {
            state.pain_level *= 0.5;
        } else {
            state.pain_level = state.pain_level.max(intensity);
        }
    }
}

#[async_trait]
impl Supervised for S1Operations {
    fn name(&self) -> String {
        "s1".into()
    }

    async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> CoreResult<()> {
        let mut ops_rx = self.bus.subscribe(
            Topic::S1Operations,
            "worker/s1",
            SubscribeOptions::default(),
        );
        let mut pain_rx = self.bus.subscribe(
            Topic::AlgedonicPain,
            "worker/s1",
            SubscribeOptions::default(),
        );
        let mut pleasure_rx = self.bus.subscribe(
            Topic::AlgedonicPleasure,
            "worker/s1",
            SubscribeOptions::default(),
        );
        let mut commands = self.commands.lock().await;
        self.state.write().status = SubsystemStatus::Healthy;

        loop {
            tokio::select! {
                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        return Ok(());
                    }
                },
                maybe = ops_rx.recv() => {
                    let Some(message) = maybe else {
                        return Ok(());
                    };
                    for event in message.into_events() {
                        self.handle_event(&event);
                    }
                },
                maybe = pain_rx.recv() => {
                    if let Some(message) = maybe {
                        self.apply_algedonic(message, false);
                    }
                },
                maybe = pleasure_rx.recv() => {
                    if let Some(message) = maybe {
                        self.apply_algedonic(message, true);
                    }
                },
                maybe = commands.recv() => {
                    let Some(command) = maybe else {
                        return Ok(());
                    };
                    self.handle_command(command);
                },
            }
        }
    }

    async fn status(&self) -> SubsystemStatus {
        self.state.read().status
    }
}

impl S1Operations {
    fn apply_algedonic(&self, message: BusMessage, pleasure: bool) {
        for event in message.into_events() {
            self.note_pain(event.metadata.effective_intensity(), pleasure);
        }
    }
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

    async fn start_worker() -> (Arc<S1Operations>, WorkerHandle, EventBus, watch::Sender<bool>) {
        let metrics = InMemoryMetrics::new();
        let clock = Arc::new(HlcClock::new("test-node"));
        let bus = EventBus::new(clock, BusConfig::default(), &metrics);
        let algedonic = AlgedonicChannel::new(bus.clone(), Duration::from_millis(10), &metrics);
        let (worker, handle) = S1Operations::new(bus.clone(), algedonic, &metrics);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(Arc::clone(&worker).run(shutdown_rx));
        tokio::time::sleep(Duration::from_millis(50)).await;
        (worker, handle, bus, shutdown_tx)
    }

    #[tokio::test]
    async fn test_absorbs_variety_into_operational_events() {
        setup_test();
        let (worker, _handle, bus, _shutdown) = start_worker().await;
        let mut rx = bus.subscribe(Topic::S1Operations, "observer", SubscribeOptions::default());

        let vsm = VsmEvent::new(
            SubsystemKind::S1,
            VsmEventType::OperationStarted,
            json!({"unit": "unit-1", "magnitude": 0.5}),
            bus.clock().now(),
        );
        bus.publish(Topic::S1Operations, vsm.to_value());

        // The observer sees the input and then S1's operational output.
        let mut operational = None;
        for _ in 0..3 {
            let Ok(Some(msg)) =
                tokio::time::timeout(Duration::from_millis(500), rx.recv()).await
            else {
                break;
            };
            for event in msg.into_events() {
                if let Some(out) = VsmEvent::from_value(&event.data) {
                    if out.kind == VsmEventType::Operational {
                        operational = Some(out);
                    }
                }
            }
            if operational.is_some() {
                break;
            }
        }
        let operational = operational.expect("s1 emits operational variety");
        assert_eq!(operational.data["unit"], json!("unit-1"));
        assert_eq!(operational.data["magnitude"], json!(0.5));
        assert_eq!(worker.snapshot().absorbed, 1);
    }

    #[tokio::test]
    async fn test_applies_throttle_commands() {
        setup_test();
        let (worker, _handle, bus, _shutdown) = start_worker().await;

        let command = VsmEvent::new(
            SubsystemKind::S1,
            VsmEventType::ControlCommand,
            json!({"target": "unit-1", "action": "throttle", "factor": 0.25}),
            bus.clock().now(),
        );
        bus.publish(Topic::S1Operations, command.to_value());
        tokio::time::sleep(Duration::from_millis(100)).await;

        let snapshot = worker.snapshot();
        assert_eq!(snapshot.commands_applied, 1);
        assert_eq!(snapshot.throttle.get("unit-1"), Some(&0.25));

        // Subsequent variety from that unit is throttled.
        let mut rx = bus.subscribe(Topic::S1Operations, "observer", SubscribeOptions::default());
        let vsm = VsmEvent::new(
            SubsystemKind::S1,
            VsmEventType::OperationStarted,
            json!({"unit": "unit-1", "magnitude": 1.0}),
            bus.clock().now(),
        );
        bus.publish(Topic::S1Operations, vsm.to_value());

        let mut throttled = None;
        for _ in 0..3 {
            let Ok(Some(msg)) =
                tokio::time::timeout(Duration::from_millis(500), rx.recv()).await
            else {
                break;
            };
            for event in msg.into_events() {
                if let Some(out) = VsmEvent::from_value(&event.data) {
                    if out.kind == VsmEventType::Operational {
                        throttled = Some(out);
                    }
                }
            }
            if throttled.is_some() {
                break;
            }
        }
        assert_eq!(throttled.unwrap().data["magnitude"], json!(0.25));
    }

    #[tokio::test]
    async fn test_pain_attenuates_low_magnitude_variety() {
        setup_test();
        let (worker, _handle, bus, _shutdown) = start_worker().await;
        // Raise the pain level directly.
        worker.note_pain(0.9, false);

        let vsm = VsmEvent::new(
            SubsystemKind::S1,
            VsmEventType::OperationStarted,
            json!({"unit": "noise", "magnitude": 0.05}),
            bus.clock().now(),
        );
        bus.publish(Topic::S1Operations, vsm.to_value());
        tokio::time::sleep(Duration::from_millis(100)).await;

        let snapshot = worker.snapshot();
        assert_eq!(snapshot.attenuated, 1);
    }
}
