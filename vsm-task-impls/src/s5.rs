// Copyright (c) 2024-2025 Viable Systems (viablesystems.io)
// This file is part of the VSM repository.

// You should have received a copy of the MIT License
// along with the VSM repository. If not, see <https://mit-license.org/>.

//! S5 Policy: holds the system's core values, validates strategic goals,
//! approves or rejects actions and answers viability threats with policy
//! directives. Critical threats force the control loop into emergency mode.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::{mpsc, watch, Mutex};
use vsm_bus::{AlgedonicChannel, BusMessage, EventBus, SubscribeOptions};
use vsm_task::Supervised;
use vsm_types::{
    metrics::{Counter, Metrics},
    CoreResult, Severity, SubsystemKind, SubsystemStatus, Topic, VsmEvent, VsmEventType,
};

use crate::{control_loop::EmergencyMode, WorkerCommand, WorkerHandle};

/// Alignment score below which a strategic goal is rejected.
const GOAL_THRESHOLD: f64 = 0.5;

/// Score below which an action is rejected.
const ACTION_THRESHOLD: f64 = 0.6;

#[derive(Clone, Debug, Default)]
pub struct S5Snapshot {
    pub status: SubsystemStatus,
    pub core_values: HashMap<String, f64>,
    pub directives_issued: u64,
    pub threats_seen: u64,
    pub pain_level: f64,
    pub emergency: bool,
}

struct S5Metrics {
    directives: Box<dyn Counter>,
    goals_validated: Box<dyn Counter>,
    goals_rejected: Box<dyn Counter>,
}

pub struct S5Policy {
    bus: EventBus,
    algedonic: AlgedonicChannel,
    emergency: Arc<EmergencyMode>,
    state: RwLock<S5Snapshot>,
    commands: Mutex<mpsc::Receiver<WorkerCommand>>,
    metrics: S5Metrics,
}

impl S5Policy {
    pub fn new(
        bus: EventBus,
        algedonic: AlgedonicChannel,
        emergency: Arc<EmergencyMode>,
        metrics: &(impl Metrics + ?Sized),
    ) -> (Arc<Self>, WorkerHandle) {
        let metrics = metrics.subgroup("s5".into());
        let (tx, rx) = mpsc::channel(16);
        let mut core_values = HashMap::new();
        core_values.insert("viability".to_string(), 0.9);
        core_values.insert("adaptation".to_string(), 0.7);
        core_values.insert("efficiency".to_string(), 0.6);
        let worker = Arc::new(Self {
            bus,
            algedonic,
            emergency,
            state: RwLock::new(S5Snapshot {
                core_values,
                ..S5Snapshot::default()
            }),
            commands: Mutex::new(rx),
            metrics: S5Metrics {
                directives: metrics.create_counter("directives".into(), None),
                goals_validated: metrics.create_counter("goals_validated".into(), None),
                goals_rejected: metrics.create_counter("goals_rejected".into(), None),
            },
        });
        let handle = WorkerHandle::new(SubsystemKind::S5, "s5".into(), tx);
        (worker, handle)
    }

    pub fn snapshot(&self) -> S5Snapshot {
        self.state.read().clone()
    }

    /// Set a core value weight, clamped to `[0, 1]`.
    pub fn set_core_value(&self, name: impl Into<String>, weight: f64) {
        self.state
            .write()
            .core_values
            .insert(name.into(), weight.clamp(0.0, 1.0));
    }

    /// Alignment of a goal's declared value weights against the core
    /// values: the mean closeness over every core value the goal mentions.
    pub fn alignment_score(&self, goal: &serde_json::Value) -> f64 {
        let Some(declared) = goal["values"].as_object() else {
            return 0.0;
        };
        let state = self.state.read();
        let core = &state.core_values;
        let mut score = 0.0;
        let mut counted = 0u32;
        for (name, weight) in declared {
            let Some(weight) = weight.as_f64() else {
                continue;
            };
            let Some(core_weight) = core.get(name) else {
                continue;
            };
            score += 1.0 - (core_weight - weight.clamp(0.0, 1.0)).abs();
            counted += 1;
        }
        if counted == 0 {
            0.0
        } else {
            score / f64::from(counted)
        }
    }

    /// Validate a strategic goal against the core values.
    pub fn validate_goal(&self, goal: &serde_json::Value) -> bool {
        let aligned = self.alignment_score(goal) >= GOAL_THRESHOLD;
        if aligned {
            self.metrics.goals_validated.increment();
        } else {
            self.metrics.goals_rejected.increment();
        }
        aligned
    }

    /// Score an action's declared impacts (each in `[-1, 1]`) weighted by
    /// the core values, mapped into `[0, 1]`.
    pub fn action_score(&self, action: &serde_json::Value) -> f64 {
        let Some(impacts) = action["impacts"].as_object() else {
            return 0.0;
        };
        let state = self.state.read();
        let core = &state.core_values;
        let mut weighted = 0.0;
        let mut total_weight = 0.0;
        for (name, impact) in impacts {
            let Some(impact) = impact.as_f64() else {
                continue;
            };
            let weight = core.get(name).copied().unwrap_or(0.0);
            weighted += weight * impact.clamp(-1.0, 1.0);
            total_weight += weight;
        }
        if total_weight == 0.0 {
            0.0
        } else {
            (weighted / total_weight + 1.0) / 2.0
        }
    }

    pub fn approve_action(&self, action: &serde_json::Value) -> bool {
        self.action_score(action) >= ACTION_THRESHOLD
    }

    /// Answer a viability threat with a policy directive; critical threats
    /// force emergency mode.
    fn handle_threat(&self, data: &serde_json::Value, severity: Severity) {
        {
            let mut state = self.state.write();
            state.threats_seen += 1;
            state.directives_issued += 1;
        }
        self.metrics.directives.increment();

        let critical = severity == Severity::Critical
            || data["severity"].as_str() == Some("critical");
        if critical && self.emergency.enable() {
            tracing::error!("critical viability threat, forcing emergency mode");
            self.algedonic.pain(
                "s5",
                "emergency_mode_forced",
                Severity::Critical,
                data.clone(),
            );
        }

        let directive = VsmEvent::new(
            SubsystemKind::S5,
            VsmEventType::PolicyDirective,
            serde_json::json!({
                "directive": if critical { "enter_emergency" } else { "stabilize" },
                "threat": data,
            }),
            self.bus.clock().now(),
        );
        self.bus.publish(Topic::PolicyDirective, directive.to_value());
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

    fn apply_algedonic(&self, message: BusMessage) {
        for event in message.into_events() {
            let mut state = self.state.write();
            state.pain_level = state.pain_level.max(event.metadata.effective_intensity());
        }
    }
}

#[async_trait]
impl Supervised for S5Policy {
    fn name(&self) -> String {
        "s5".into()
    }

    async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> CoreResult<()> {
        let mut threat_rx = self.bus.subscribe(
            Topic::VsmViabilityThreat,
            "worker/s5",
            SubscribeOptions::default(),
        );
        let mut generic_threat_rx = self.bus.subscribe(
            Topic::ViabilityThreat,
            "worker/s5",
            SubscribeOptions::default(),
        );
        let mut pain_rx = self.bus.subscribe(
            Topic::AlgedonicPain,
            "worker/s5",
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
                maybe = threat_rx.recv() => {
                    let Some(message) = maybe else {
                        return Ok(());
                    };
                    for event in message.into_events() {
                        let severity = event.metadata.severity.unwrap_or(Severity::High);
                        let data = match VsmEvent::from_value(&event.data) {
                            Some(vsm) => vsm.data,
                            None => event.data.clone(),
                        };
                        self.handle_threat(&data, severity);
                    }
                },
                maybe = generic_threat_rx.recv() => {
                    if let Some(message) = maybe {
                        for event in message.into_events() {
                            let severity = event.metadata.severity.unwrap_or(Severity::High);
                            self.handle_threat(&event.data, severity);
                        }
                    }
                },
                maybe = pain_rx.recv() => {
                    if let Some(message) = maybe {
                        self.apply_algedonic(message);
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

    async fn start_worker() -> (
        Arc<S5Policy>,
        Arc<EmergencyMode>,
        EventBus,
        watch::Sender<bool>,
    ) {
        let metrics = InMemoryMetrics::new();
        let clock = Arc::new(HlcClock::new("test-node"));
        let bus = EventBus::new(clock, BusConfig::default(), &metrics);
        let algedonic = AlgedonicChannel::new(bus.clone(), Duration::from_millis(10), &metrics);
        let emergency = EmergencyMode::new();
        let (worker, _handle) =
            S5Policy::new(bus.clone(), algedonic, Arc::clone(&emergency), &metrics);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(Arc::clone(&worker).run(shutdown_rx));
        tokio::time::sleep(Duration::from_millis(50)).await;
        (worker, emergency, bus, shutdown_tx)
    }

    #[tokio::test]
    async fn test_goal_validation_thresholds() {
        setup_test();
        let (worker, _, _, _shutdown) = start_worker().await;
        // A goal aligned with the core values passes.
        assert!(worker.validate_goal(&json!({
            "values": {"viability": 0.85, "efficiency": 0.6}
        })));
        // A goal opposing them is rejected.
        assert!(!worker.validate_goal(&json!({
            "values": {"viability": 0.0}
        })));
        // A goal naming no known values cannot be validated.
        assert!(!worker.validate_goal(&json!({"values": {"fun": 1.0}})));
        assert!(!worker.validate_goal(&json!({})));
    }

    #[tokio::test]
    async fn test_action_approval_thresholds() {
        setup_test();
        let (worker, _, _, _shutdown) = start_worker().await;
        // Strongly positive impact on a heavy value: approved.
        assert!(worker.approve_action(&json!({
            "impacts": {"viability": 0.9}
        })));
        // Harmful impact: rejected.
        assert!(!worker.approve_action(&json!({
            "impacts": {"viability": -0.8}
        })));
        // No declared impacts: rejected.
        assert!(!worker.approve_action(&json!({})));
    }

    #[tokio::test]
    async fn test_core_value_updates_change_scoring() {
        setup_test();
        let (worker, _, _, _shutdown) = start_worker().await;
        let goal = json!({"values": {"resilience": 0.9}});
        assert!(!worker.validate_goal(&goal), "unknown value scores zero");
        worker.set_core_value("resilience", 0.9);
        assert!(worker.validate_goal(&goal));
    }

    #[tokio::test]
    async fn test_critical_threat_forces_emergency_and_directive() {
        setup_test();
        let (worker, emergency, bus, _shutdown) = start_worker().await;
        let mut directive_rx = bus.subscribe(
            Topic::PolicyDirective,
            "observer",
            SubscribeOptions::default(),
        );
        assert!(!emergency.is_on());

        bus.publish(
            Topic::VsmViabilityThreat,
            json!({"reason": "loop broken", "severity": "critical"}),
        );

        let msg = tokio::time::timeout(Duration::from_millis(500), directive_rx.recv())
            .await
            .expect("directive published")
            .unwrap();
        let vsm = VsmEvent::from_value(&msg.into_events()[0].data).unwrap();
        assert_eq!(vsm.kind, VsmEventType::PolicyDirective);
        assert_eq!(vsm.data["directive"], json!("enter_emergency"));
        assert!(emergency.is_on());
        assert_eq!(worker.snapshot().threats_seen, 1);
    }
}
