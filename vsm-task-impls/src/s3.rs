// Copyright (c) 2024-2025 Viable Systems (viablesystems.io)
// This file is part of the VSM repository.

// You should have received a copy of the MIT License
// along with the VSM repository. If not, see <https://mit-license.org/>.

//! S3 Control: turns coordination verdicts into resource policy and control
//! commands aimed back at S1, and keeps health scores per operational unit.

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

/// Damping above which units get throttled rather than left steady.
const CONTROL_THRESHOLD: f64 = 0.3;

/// How much sustained pain tightens the control threshold.
const PAIN_TIGHTENING: f64 = 0.1;

#[derive(Clone, Debug, Default)]
pub struct S3Snapshot {
    pub status: SubsystemStatus,
    pub commands_issued: u64,
    pub pain_level: f64,
    pub emergency: bool,
    /// Health score per unit in `[0, 1]`, higher is healthier.
    pub health_scores: HashMap<String, f64>,
}

struct S3Metrics {
    control_ready: Box<dyn Counter>,
    commands: Box<dyn Counter>,
}

pub struct S3Control {
    bus: EventBus,
    algedonic: AlgedonicChannel,
    state: RwLock<S3Snapshot>,
    commands: Mutex<mpsc::Receiver<WorkerCommand>>,
    metrics: S3Metrics,
}

impl S3Control {
    pub fn new(
        bus: EventBus,
        algedonic: AlgedonicChannel,
        metrics: &(impl Metrics + ?Sized),
    ) -> (Arc<Self>, WorkerHandle) {
        let metrics = metrics.subgroup("s3".into());
        let (tx, rx) = mpsc::channel(16);
        let worker = Arc::new(Self {
            bus,
            algedonic,
            state: RwLock::new(S3Snapshot::default()),
            commands: Mutex::new(rx),
            metrics: S3Metrics {
                control_ready: metrics.create_counter("control_ready".into(), None),
                commands: metrics.create_counter("commands_issued".into(), None),
            },
        });
        let handle = WorkerHandle::new(SubsystemKind::S3, "s3".into(), tx);
        (worker, handle)
    }

    pub fn snapshot(&self) -> S3Snapshot {
        self.state.read().clone()
    }

    pub fn health_score(&self, unit: &str) -> Option<f64> {
        self.state.read().health_scores.get(unit).copied()
    }

    /// Enforce policy on a control-ready verdict: update health scores and
    /// issue one command per affected unit.
    fn handle_control_ready(&self, vsm: &VsmEvent) {
        self.metrics.control_ready.increment();
        let damping = vsm.data["damping_factor"].as_f64().unwrap_or(0.0);
        let units: Vec<String> = vsm.data["units"]
            .as_array()
            .map(|units| {
                units
                    .iter()
                    .filter_map(|u| u.as_str().map(str::to_string))
                    .collect()
            })
            .filter(|units: &Vec<String>| !units.is_empty())
            .unwrap_or_else(|| vec!["system".to_string()]);

        let threshold = {
            let mut state = self.state.write();
            let health = (1.0 - damping).clamp(0.0, 1.0);
            for unit in &units {
                state.health_scores.insert(unit.clone(), health);
            }
            // Pain tightens control: throttle earlier under systemic stress.
            (CONTROL_THRESHOLD - state.pain_level * PAIN_TIGHTENING).max(0.05)
        };

        for unit in &units {
            let (action, factor) = if damping > threshold {
                ("throttle", (1.0 - damping).max(0.1))
            } else {
                ("steady", 1.0)
            };
            let command = VsmEvent::new(
                SubsystemKind::S3,
                VsmEventType::ControlCommand,
                serde_json::json!({
                    "target": unit,
                    "action": action,
                    "factor": factor,
                    "damping_factor": damping,
                }),
                self.bus.clock().now(),
            );
            self.bus.publish(Topic::S3Control, command.to_value());
            self.state.write().commands_issued += 1;
            self.metrics.commands.increment();
        }
    }

    fn handle_command(&self, command: WorkerCommand) {
        match command {
            WorkerCommand::RunCycle => {
                self.state.write().pain_level *= 0.8;
            },
            WorkerCommand::SetEmergency(on) => {
                self.state.write().emergency = on;
            },
        }
    }

    fn apply_algedonic(&self, message: BusMessage, pleasure: bool) {
        for event in message.into_events() {
            let mut state = self.state.write();
            if pleasure {
                state.pain_level *= 0.5;
            } else {
                state.pain_level = state.pain_level.max(event.metadata.effective_intensity());
            }
        }
    }
}

#[async_trait]
impl Supervised for S3Control {
    fn name(&self) -> String {
        "s3".into()
    }

    async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> CoreResult<()> {
        let mut control_rx = self.bus.subscribe(
            Topic::S3Control,
            "worker/s3",
            SubscribeOptions::default(),
        );
        let mut pain_rx = self.bus.subscribe(
            Topic::AlgedonicPain,
            "worker/s3",
            SubscribeOptions::default(),
        );
        let mut pleasure_rx = self.bus.subscribe(
            Topic::AlgedonicPleasure,
            "worker/s3",
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
                maybe = control_rx.recv() => {
                    let Some(message) = maybe else {
                        return Ok(());
                    };
                    for event in message.into_events() {
                        if let Some(vsm) = VsmEvent::from_value(&event.data) {
                            // EnvironmentalAlert arrives here from S4; it is
                            // treated as maximum damping on the whole system.
                            match vsm.kind {
                                VsmEventType::ControlReady => self.handle_control_ready(&vsm),
                                VsmEventType::EnvironmentalAlert => {
                                    let mut alert = vsm.clone();
                                    if let Some(object) = alert.data.as_object_mut() {
                                        object.insert(
                                            "damping_factor".into(),
                                            serde_json::json!(0.9),
                                        );
                                    }
                                    self.handle_control_ready(&alert);
                                },
                                _ => {},
                            }
                        }
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

#[cfg(test)]
mod test {
    use std::time::Duration;

    use pretty_assertions::assert_eq;
    use serde_json::json;
    use vsm_bus::BusConfig;
    use vsm_types::{metrics::InMemoryMetrics, HlcClock};
    use vsm_utils::test_utils::setup_test;

    use super::*;

    async fn start_worker() -> (Arc<S3Control>, EventBus, watch::Sender<bool>) {
        let metrics = InMemoryMetrics::new();
        let clock = Arc::new(HlcClock::new("test-node"));
        let bus = EventBus::new(clock, BusConfig::default(), &metrics);
        let algedonic = AlgedonicChannel::new(bus.clone(), Duration::from_millis(10), &metrics);
        let (worker, _handle) = S3Control::new(bus.clone(), algedonic, &metrics);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(Arc::clone(&worker).run(shutdown_rx));
        tokio::time::sleep(Duration::from_millis(50)).await;
        (worker, bus, shutdown_tx)
    }

    async fn recv_command(
        rx: &mut mpsc::Receiver<BusMessage>,
    ) -> Option<VsmEvent> {
        for _ in 0..10 {
            let msg = tokio::time::timeout(Duration::from_millis(500), rx.recv())
                .await
                .ok()??;
            for event in msg.into_events() {
                if let Some(vsm) = VsmEvent::from_value(&event.data) {
                    if vsm.kind == VsmEventType::ControlCommand {
                        return Some(vsm);
                    }
                }
            }
        }
        None
    }

    #[tokio::test]
    async fn test_high_damping_issues_throttle_command() {
        setup_test();
        let (worker, bus, _shutdown) = start_worker().await;
        let mut rx = bus.subscribe(Topic::S3Control, "observer", SubscribeOptions::default());

        let ready = VsmEvent::new(
            SubsystemKind::S3,
            VsmEventType::ControlReady,
            json!({"units": ["unit-1"], "damping_factor": 0.8}),
            bus.clock().now(),
        );
        bus.publish(Topic::S3Control, ready.to_value());

        let command = recv_command(&mut rx).await.expect("command issued");
        assert_eq!(command.data["target"], json!("unit-1"));
        assert_eq!(command.data["action"], json!("throttle"));
        let factor = command.data["factor"].as_f64().unwrap();
        assert!(factor < 1.0);

        let snapshot = worker.snapshot();
        assert_eq!(snapshot.commands_issued, 1);
        assert!(snapshot.health_scores["unit-1"] < 0.5);
    }

    #[tokio::test]
    async fn test_low_damping_issues_steady_command() {
        setup_test();
        let (worker, bus, _shutdown) = start_worker().await;
        let mut rx = bus.subscribe(Topic::S3Control, "observer", SubscribeOptions::default());

        let ready = VsmEvent::new(
            SubsystemKind::S3,
            VsmEventType::ControlReady,
            json!({"units": ["unit-1"], "damping_factor": 0.1}),
            bus.clock().now(),
        );
        bus.publish(Topic::S3Control, ready.to_value());

        let command = recv_command(&mut rx).await.expect("command issued");
        assert_eq!(command.data["action"], json!("steady"));
        assert!(worker.health_score("unit-1").unwrap() > 0.8);
    }
}
