// Copyright (c) 2024-2025 Viable Systems (viablesystems.io)
// This file is part of the VSM repository.

// You should have received a copy of the MIT License
// along with the VSM repository. If not, see <https://mit-license.org/>.

//! S4 Intelligence: watches environmental signals and detected patterns,
//! maintains an environmental model and a monitoring strategy, escalates
//! high-urgency signals toward S3/S5 and persists representative patterns
//! through the vector store collaborator.

use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::{mpsc, watch, Mutex};
use vsm_bus::{EventBus, SubscribeOptions};
use vsm_task::Supervised;
use vsm_types::{
    metrics::{Counter, Metrics},
    traits::VectorStore,
    CoreResult, Severity, SubsystemKind, SubsystemStatus, Topic, VsmEvent, VsmEventType,
};

use crate::{WorkerCommand, WorkerHandle};

/// Urgency at which the monitoring strategy flips to emergency posture.
const STRATEGY_URGENCY: f64 = 0.8;

/// Urgency at which S4 alerts S5 and S3 outright.
const ALERT_URGENCY: f64 = 0.9;

/// Confidence at which a pattern is worth persisting to the vector store.
const PERSIST_CONFIDENCE: f64 = 0.8;

/// Severity history entries kept in the environmental model.
const HISTORY_LIMIT: usize = 100;

/// Timeout on vector store calls.
const STORE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Debug, PartialEq)]
pub struct Strategy {
    pub monitoring_intensity: String,
    pub horizon: String,
    pub alert_threshold: f64,
    pub mode: String,
    pub algedonic_bypass: bool,
}

impl Default for Strategy {
    fn default() -> Self {
        Self {
            monitoring_intensity: "normal".into(),
            horizon: "long_term".into(),
            alert_threshold: 0.7,
            mode: "normal".into(),
            algedonic_bypass: false,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct S4Snapshot {
    pub status: SubsystemStatus,
    pub strategy: Strategy,
    /// Observations per pattern type.
    pub model: HashMap<String, u64>,
    pub filtered_out: u64,
    pub persisted: u64,
    pub alerts: u64,
    pub pain_level: f64,
    pub emergency: bool,
}

struct S4Metrics {
    signals: Box<dyn Counter>,
    filtered: Box<dyn Counter>,
    persisted: Box<dyn Counter>,
    persist_failures: Box<dyn Counter>,
    alerts: Box<dyn Counter>,
}

pub struct S4Intelligence {
    bus: EventBus,
    vector_store: Option<Arc<dyn VectorStore>>,
    confidence_threshold: f64,
    state: RwLock<S4Snapshot>,
    severity_history: RwLock<VecDeque<(String, f64)>>,
    commands: Mutex<mpsc::Receiver<WorkerCommand>>,
    metrics: S4Metrics,
    /// Patterns persisted since the last cycle, announced as
    /// `patterns_indexed`.
    newly_indexed: RwLock<u64>,
}

impl S4Intelligence {
    pub fn new(
        bus: EventBus,
        vector_store: Option<Arc<dyn VectorStore>>,
        metrics: &(impl Metrics + ?Sized),
    ) -> (Arc<Self>, WorkerHandle) {
        let metrics = metrics.subgroup("s4".into());
        let (tx, rx) = mpsc::channel(16);
        let worker = Arc::new(Self {
            bus,
            vector_store,
            confidence_threshold: 0.6,
            state: RwLock::new(S4Snapshot::default()),
            severity_history: RwLock::new(VecDeque::new()),
            commands: Mutex::new(rx),
            metrics: S4Metrics {
                signals: metrics.create_counter("signals".into(), None),
                filtered: metrics.create_counter("filtered".into(), None),
                persisted: metrics.create_counter("persisted".into(), None),
                persist_failures: metrics.create_counter("persist_failures".into(), None),
                alerts: metrics.create_counter("alerts".into(), None),
            },
            newly_indexed: RwLock::new(0),
        });
        let handle = WorkerHandle::new(SubsystemKind::S4, "s4".into(), tx);
        (worker, handle)
    }

    pub fn snapshot(&self) -> S4Snapshot {
        self.state.read().clone()
    }

    pub fn severity_history(&self) -> Vec<(String, f64)> {
        self.severity_history.read().iter().cloned().collect()
    }

    async fn handle_signal(&self, data: &serde_json::Value, urgency_hint: Option<f64>) {
        self.metrics.signals.increment();
        let confidence = data["confidence"].as_f64().unwrap_or(0.0);
        if confidence < self.confidence_threshold {
            self.metrics.filtered.increment();
            self.state.write().filtered_out += 1;
            return;
        }

        let pattern_type = data["pattern_type"]
            .as_str()
            .unwrap_or("unclassified")
            .to_string();
        let severity = data["severity"]
            .as_str()
            .map(|s| match s {
                "critical" => Severity::Critical,
                "high" => Severity::High,
                "medium" => Severity::Medium,
                _ => Severity::Low,
            })
            .unwrap_or(Severity::Low);
        let urgency = data["urgency"].as_f64().or(urgency_hint).unwrap_or(0.0);

        // Update the environmental model.
        {
            let mut state = self.state.write();
            *state.model.entry(pattern_type.clone()).or_insert(0) += 1;
            if severity == Severity::Critical {
                state.strategy.monitoring_intensity = "maximum".into();
                state.strategy.horizon = "short_term".into();
                state.strategy.alert_threshold = 0.3;
            }
            if urgency >= STRATEGY_URGENCY {
                state.strategy.mode = "emergency".into();
                state.strategy.algedonic_bypass = true;
            }
        }
        {
            let mut history = self.severity_history.write();
            history.push_back((pattern_type.clone(), severity.intensity()));
            if history.len() > HISTORY_LIMIT {
                history.pop_front();
            }
        }

        if urgency >= ALERT_URGENCY {
            self.alert(&pattern_type, severity, urgency, data);
        }

        if confidence >= PERSIST_CONFIDENCE {
            self.persist(&pattern_type, confidence, urgency, severity, data)
                .await;
        }
    }

    /// Escalate to S3 (control) and S5 (policy).
    fn alert(
        &self,
        pattern_type: &str,
        severity: Severity,
        urgency: f64,
        data: &serde_json::Value,
    ) {
        self.metrics.alerts.increment();
        self.state.write().alerts += 1;
        let payload = serde_json::json!({
            "pattern_type": pattern_type,
            "severity": severity.as_str(),
            "urgency": urgency,
            "signal": data,
        });
        let alert = VsmEvent::new(
            SubsystemKind::S4,
            VsmEventType::EnvironmentalAlert,
            payload.clone(),
            self.bus.clock().now(),
        );
        self.bus.publish(Topic::S3Control, alert.to_value());

        let threat = VsmEvent::new(
            SubsystemKind::S4,
            VsmEventType::ViabilityThreat,
            payload,
            self.bus.clock().now(),
        );
        self.bus.publish(Topic::VsmViabilityThreat, threat.to_value());
        tracing::warn!(pattern_type, urgency, "s4 escalated environmental alert");
    }

    /// Persist a representative pattern. Failures are telemetry, not pain;
    /// pattern memory is a cache, not a ledger.
    async fn persist(
        &self,
        pattern_type: &str,
        confidence: f64,
        urgency: f64,
        severity: Severity,
        data: &serde_json::Value,
    ) {
        let Some(store) = &self.vector_store else {
            return;
        };
        let vector: Vec<f32> = data["vector"]
            .as_array()
            .map(|values| {
                values
                    .iter()
                    .filter_map(|v| v.as_f64().map(|f| f as f32))
                    .collect()
            })
            .unwrap_or_else(|| {
                vec![
                    confidence as f32,
                    urgency as f32,
                    severity.intensity() as f32,
                ]
            });
        let metadata = serde_json::json!({
            "pattern_type": pattern_type,
            "confidence": confidence,
            "observed_at": vsm_types::HlcClock::wall_ms(),
        });
        match tokio::time::timeout(STORE_TIMEOUT, store.insert(vector, metadata)).await {
            Ok(Ok(_id)) => {
                self.metrics.persisted.increment();
                self.state.write().persisted += 1;
                *self.newly_indexed.write() += 1;
            },
            Ok(Err(err)) => {
                self.metrics.persist_failures.increment();
                tracing::warn!(%err, "vector store insert failed");
            },
            Err(_) => {
                self.metrics.persist_failures.increment();
                tracing::warn!("vector store insert timed out");
            },
        }
    }

    fn handle_command(&self, command: WorkerCommand) {
        match command {
            WorkerCommand::RunCycle => {
                self.state.write().pain_level *= 0.8;
                let indexed = std::mem::take(&mut *self.newly_indexed.write());
                if indexed > 0 {
                    self.bus.publish(
                        Topic::PatternsIndexed,
                        serde_json::json!({ "count": indexed }),
                    );
                }
            },
            WorkerCommand::SetEmergency(on) => {
                let mut state = self.state.write();
                state.emergency = on;
                if on {
                    state.strategy.mode = "emergency".into();
                    state.strategy.algedonic_bypass = true;
                } else {
                    state.strategy.mode = "normal".into();
                    state.strategy.algedonic_bypass = false;
                }
            },
        }
    }

    fn note_pain(&self, intensity: f64, pleasure: bool) {
        let mut state = self.state.write();
        if pleasure {
            state.pain_level *= 0.5;
        } else {
            state.pain_level = state.pain_level.max(intensity);
            // Sustained pain raises vigilance.
            if state.pain_level >= 0.8 && state.strategy.monitoring_intensity == "normal" {
                state.strategy.monitoring_intensity = "elevated".into();
            }
        }
    }
}

#[async_trait]
impl Supervised for S4Intelligence {
    fn name(&self) -> String {
        "s4".into()
    }

    async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> CoreResult<()> {
        let mut env_rx = self.bus.subscribe(
            Topic::S4EnvironmentalSignal,
            "worker/s4",
            SubscribeOptions::default(),
        );
        let mut pattern_rx = self.bus.subscribe(
            Topic::PatternDetected,
            "worker/s4",
            SubscribeOptions::default(),
        );
        let mut temporal_rx = self.bus.subscribe(
            Topic::TemporalPatternDetected,
            "worker/s4",
            SubscribeOptions::default(),
        );
        let mut pain_rx = self.bus.subscribe(
            Topic::AlgedonicPain,
            "worker/s4",
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
                maybe = env_rx.recv() => {
                    let Some(message) = maybe else {
                        return Ok(());
                    };
                    for event in message.into_events() {
                        let urgency = event.metadata.urgency;
                        let data = match VsmEvent::from_value(&event.data) {
                            Some(vsm) => vsm.data,
                            None => event.data.clone(),
                        };
                        self.handle_signal(&data, urgency).await;
                    }
                },
                maybe = pattern_rx.recv() => {
                    if let Some(message) = maybe {
                        for event in message.into_events() {
                            self.handle_signal(&event.data, event.metadata.urgency).await;
                        }
                    }
                },
                maybe = temporal_rx.recv() => {
                    if let Some(message) = maybe {
                        for event in message.into_events() {
                            self.handle_signal(&event.data, event.metadata.urgency).await;
                        }
                    }
                },
                maybe = pain_rx.recv() => {
                    if let Some(message) = maybe {
                        for event in message.into_events() {
                            self.note_pain(event.metadata.effective_intensity(), false);
                        }
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
