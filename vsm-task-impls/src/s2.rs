// Copyright (c) 2024-2025 Viable Systems (viablesystems.io)
// This file is part of the VSM repository.

// You should have received a copy of the MIT License
// along with the VSM repository. If not, see <https://mit-license.org/>.

//! S2 Coordination: watches aggregated variety from S1 for oscillation and
//! publishes a damping factor. Oscillation detection is a zero-crossing
//! count on a rolling magnitude window; the dominant frequency is estimated
//! from the peak count.

use std::{collections::VecDeque, sync::Arc};

use async_trait::async_trait;
use circular_buffer::CircularBuffer;
use parking_lot::RwLock;
use tokio::sync::{mpsc, watch, Mutex};
use vsm_bus::{AlgedonicChannel, BusMessage, EventBus, SubscribeOptions};
use vsm_task::Supervised;
use vsm_types::{
    metrics::{Counter, Metrics},
    CoreResult, Severity, SubsystemKind, SubsystemStatus, Topic, VsmEvent, VsmEventType,
};

use crate::{WorkerCommand, WorkerHandle};

/// Rolling window of magnitude samples.
const WINDOW: usize = 64;

/// Minimum samples before oscillation analysis runs.
const MIN_SAMPLES: usize = 8;

/// Zero-crossing ratio above which the window counts as oscillating.
const OSCILLATION_RATIO: f64 = 0.35;

/// Damping above which S2 reports a coordination conflict.
const CONFLICT_DAMPING: f64 = 0.7;

/// Units remembered for the coordinated output.
const UNIT_MEMORY: usize = 32;

/// Result of analyzing a magnitude window.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct OscillationAnalysis {
    pub crossings: u32,
    pub peaks: u32,
    /// Peaks per sample, a cheap stand-in for the dominant frequency.
    pub dominant_frequency: f64,
    pub oscillating: bool,
    pub damping_factor: f64,
}

/// Zero-crossing analysis over deviations from the window mean.
pub fn analyze(samples: &[f64]) -> OscillationAnalysis {
    if samples.len() < 2 {
        return OscillationAnalysis::default();
    }
    let mean = samples.iter().sum::<f64>() / samples.len() as f64;
    let mut crossings = 0u32;
    let mut last_sign = 0i8;
    for sample in samples {
        let deviation = sample - mean;
        let sign = if deviation > f64::EPSILON {
            1
        } else if deviation < -f64::EPSILON {
            -1
        } else {
            0
        };
        if sign != 0 {
            if last_sign != 0 && sign != last_sign {
                crossings += 1;
            }
            last_sign = sign;
        }
    }
    let peaks = crossings / 2;
    let ratio = f64::from(crossings) / (samples.len() - 1) as f64;
    let oscillating = ratio > OSCILLATION_RATIO;
    let damping_factor = if oscillating {
        (0.2 + 0.6 * ratio).clamp(0.0, 0.9)
    } else {
        0.1
    };
    OscillationAnalysis {
        crossings,
        peaks,
        dominant_frequency: f64::from(peaks) / samples.len() as f64,
        oscillating,
        damping_factor,
    }
}

#[derive(Clone, Debug, Default)]
pub struct S2Snapshot {
    pub status: SubsystemStatus,
    pub samples: usize,
    pub damping_factor: f64,
    pub oscillating: bool,
    pub conflicts: u64,
    pub pain_level: f64,
    pub emergency: bool,
}

struct S2Metrics {
    aggregated: Box<dyn Counter>,
    coordinated: Box<dyn Counter>,
    conflicts: Box<dyn Counter>,
}

struct S2Inner {
    window: CircularBuffer<WINDOW, f64>,
    units: VecDeque<String>,
}

pub struct S2Coordination {
    bus: EventBus,
    algedonic: AlgedonicChannel,
    state: RwLock<S2Snapshot>,
    inner: RwLock<S2Inner>,
    commands: Mutex<mpsc::Receiver<WorkerCommand>>,
    metrics: S2Metrics,
}

impl S2Coordination {
    pub fn new(
        bus: EventBus,
        algedonic: AlgedonicChannel,
        metrics: &(impl Metrics + ?Sized),
    ) -> (Arc<Self>, WorkerHandle) {
        let metrics = metrics.subgroup("s2".into());
        let (tx, rx) = mpsc::channel(16);
        let worker = Arc::new(Self {
            bus,
            algedonic,
            state: RwLock::new(S2Snapshot::default()),
            inner: RwLock::new(S2Inner {
                window: CircularBuffer::new(),
                units: VecDeque::new(),
            }),
            commands: Mutex::new(rx),
            metrics: S2Metrics {
                aggregated: metrics.create_counter("aggregated".into(), None),
                coordinated: metrics.create_counter("coordinated".into(), None),
                conflicts: metrics.create_counter("conflicts".into(), None),
            },
        });
        let handle = WorkerHandle::new(SubsystemKind::S2, "s2".into(), tx);
        (worker, handle)
    }

    pub fn snapshot(&self) -> S2Snapshot {
        self.state.read().clone()
    }

    fn handle_aggregated(&self, vsm: &VsmEvent) {
        self.metrics.aggregated.increment();
        let magnitude = vsm.data["magnitude"].as_f64().unwrap_or(0.0);
        let unit = vsm.data["unit"].as_str().unwrap_or("unknown").to_string();
        {
            let mut inner = self.inner.write();
            inner.window.push_back(magnitude);
            if !inner.units.contains(&unit) {
                inner.units.push_back(unit);
                if inner.units.len() > UNIT_MEMORY {
                    inner.units.pop_front();
                }
            }
        }
        self.coordinate();
    }

    /// Analyze the window and publish the coordinated damping verdict.
    fn coordinate(&self) {
        let (analysis, units, pain_level) = {
            let inner = self.inner.read();
            if inner.window.len() < MIN_SAMPLES {
                return;
            }
            let samples: Vec<f64> = inner.window.iter().copied().collect();
            (
                analyze(&samples),
                inner.units.iter().cloned().collect::<Vec<_>>(),
                self.state.read().pain_level,
            )
        };
        // Pain raises the damping posture.
        let damping = (analysis.damping_factor + pain_level * 0.2).clamp(0.0, 0.95);

        {
            let mut state = self.state.write();
            state.samples = WINDOW.min(state.samples + 1);
            state.damping_factor = damping;
            state.oscillating = analysis.oscillating;
        }

        let vsm = VsmEvent::new(
            SubsystemKind::S2,
            VsmEventType::Coordinated,
            serde_json::json!({
                "units": units,
                "damping_factor": damping,
                "oscillating": analysis.oscillating,
                "dominant_frequency": analysis.dominant_frequency,
            }),
            self.bus.clock().now(),
        );
        self.bus.publish(Topic::S2Coordination, vsm.to_value());
        self.metrics.coordinated.increment();

        if damping > CONFLICT_DAMPING {
            self.report_conflict(damping, &vsm.data);
        }
    }

    fn report_conflict(&self, damping: f64, data: &serde_json::Value) {
        self.state.write().conflicts += 1;
        self.metrics.conflicts.increment();
        let vsm = VsmEvent::new(
            SubsystemKind::S2,
            VsmEventType::CoordinationConflict,
            data.clone(),
            self.bus.clock().now(),
        );
        self.bus.publish(Topic::S2Coordination, vsm.to_value());
        self.algedonic.pain(
            "s2",
            "oscillation",
            Severity::Medium,
            serde_json::json!({ "damping_factor": damping }),
        );
    }

    fn handle_command(&self, command: WorkerCommand) {
        match command {
            WorkerCommand::RunCycle => {
                self.state.write().pain_level *= 0.8;
                self.coordinate();
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
impl Supervised for S2Coordination {
    fn name(&self) -> String {
        "s2".into()
    }

    async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> CoreResult<()> {
        let mut agg_rx = self.bus.subscribe(
            Topic::S2Coordination,
            "worker/s2",
            SubscribeOptions::default(),
        );
        let mut pain_rx = self.bus.subscribe(
            Topic::AlgedonicPain,
            "worker/s2",
            SubscribeOptions::default(),
        );
        let mut pleasure_rx = self.bus.subscribe(
            Topic::AlgedonicPleasure,
            "worker/s2",
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
                maybe = agg_rx.recv() => {
                    let Some(message) = maybe else {
                        return Ok(());
                    };
                    for event in message.into_events() {
                        if let Some(vsm) = VsmEvent::from_value(&event.data) {
                            if vsm.kind == VsmEventType::Aggregated {
                                self.handle_aggregated(&vsm);
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
