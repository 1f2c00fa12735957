// Copyright (c) 2024-2025 Viable Systems (viablesystems.io)
// This file is part of the VSM repository.

// You should have received a copy of the MIT License
// along with the VSM repository. If not, see <https://mit-license.org/>.

//! Three-state circuit breaker with pain integration. Besides the classic
//! consecutive-failure trigger, a breaker listens to `algedonic_pain` and
//! opens when the aggregated pain score in its rolling window crosses the
//! pain threshold. Its own pain emissions are ignored on the way back in, so
//! a breaker can never talk itself open. A bounded, reversible learning term
//! tightens the pain threshold when sub-threshold pain keeps preceding real
//! failures.

use std::{
    collections::VecDeque,
    future::Future,
    sync::{Arc, Weak},
    time::Duration,
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{timeout, Instant},
};
use vsm_bus::{AlgedonicChannel, EmergencyTarget, SubscribeOptions};
use vsm_types::{
    metrics::{Counter, Metrics},
    CoreError, CoreResult, Severity, Topic,
};

/// Pain intensity that re-opens a half-open breaker outright.
const HALF_OPEN_PAIN: f64 = 0.8;

/// Correlation gained each time sub-threshold pain precedes a failure.
const LEARNING_STEP: f64 = 0.1;

/// Correlation shed on every success, keeping the learning reversible.
const LEARNING_DECAY: f64 = 0.02;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Clone, Debug)]
pub struct BreakerConfig {
    pub name: String,
    /// Consecutive failures within `failure_window` that open the breaker.
    pub failure_threshold: u32,
    pub failure_window: Duration,
    /// Time in open state, free of reinforcing pain, before probing.
    pub recovery_time: Duration,
    /// Aggregated pain score that opens the breaker.
    pub pain_threshold: f64,
    pub pain_window: Duration,
    /// Timeout applied to every wrapped call.
    pub call_timeout: Duration,
    /// Enable threshold tightening from pain/failure correlation.
    pub learning: bool,
}

impl BreakerConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            failure_threshold: 5,
            failure_window: Duration::from_secs(10),
            recovery_time: Duration::from_secs(5),
            pain_threshold: 0.8,
            pain_window: Duration::from_secs(10),
            call_timeout: Duration::from_secs(5),
            learning: true,
        }
    }

    pub fn with_pain_threshold(mut self, threshold: f64) -> Self {
        self.pain_threshold = threshold;
        self
    }

    pub fn with_pain_window(mut self, window: Duration) -> Self {
        self.pain_window = window;
        self
    }

    pub fn with_recovery_time(mut self, recovery: Duration) -> Self {
        self.recovery_time = recovery;
        self
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }
}

#[derive(Debug, Default)]
struct Learning {
    /// Rolling pain/failure correlation in `[0, 1]`.
    correlation: f64,
    /// Most recent sub-threshold pain not yet matched with a failure.
    pending_pain: Option<Instant>,
}

struct BreakerCore {
    state: BreakerState,
    failures: u32,
    first_failure: Option<Instant>,
    opened_at: Option<Instant>,
    last_pain: Option<Instant>,
    probing: bool,
    pain_window: VecDeque<(Instant, f64)>,
    learning: Learning,
}

struct BreakerMetrics {
    opened: Box<dyn Counter>,
    closed: Box<dyn Counter>,
    fast_fails: Box<dyn Counter>,
    probes: Box<dyn Counter>,
}

struct BreakerShared {
    cfg: BreakerConfig,
    core: Mutex<BreakerCore>,
    state_tx: watch::Sender<BreakerState>,
    algedonic: AlgedonicChannel,
    metrics: BreakerMetrics,
    pain_task: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for BreakerShared {
    fn drop(&mut self) {
        if let Some(task) = self.pain_task.get_mut().take() {
            task.abort();
        }
    }
}

/// Cheaply clonable breaker handle.
#[derive(Clone)]
pub struct CircuitBreaker(Arc<BreakerShared>);

/// Outcome of a state-mutating step, performed after the core lock drops.
enum Emission {
    None,
    Opened { reason: String },
    Recovered,
}

impl CircuitBreaker {
    /// Create a breaker and start its pain listener. Must run inside a tokio
    /// runtime.
    pub fn new(
        cfg: BreakerConfig,
        algedonic: AlgedonicChannel,
        metrics: &(impl Metrics + ?Sized),
    ) -> Self {
        let metrics = metrics.subgroup(format!("breaker.{}", cfg.name));
        let (state_tx, _) = watch::channel(BreakerState::Closed);
        let shared = Arc::new(BreakerShared {
            cfg,
            core: Mutex::new(BreakerCore {
                state: BreakerState::Closed,
                failures: 0,
                first_failure: None,
                opened_at: None,
                last_pain: None,
                probing: false,
                pain_window: VecDeque::new(),
                learning: Learning::default(),
            }),
            state_tx,
            algedonic,
            metrics: BreakerMetrics {
                opened: metrics.create_counter("opened".into(), None),
                closed: metrics.create_counter("closed".into(), None),
                fast_fails: metrics.create_counter("fast_fails".into(), None),
                probes: metrics.create_counter("probes".into(), None),
            },
            pain_task: Mutex::new(None),
        });

        let task = tokio::spawn(Self::pain_loop(Arc::downgrade(&shared)));
        *shared.pain_task.lock() = Some(task);
        Self(shared)
    }

    pub fn name(&self) -> &str {
        &self.0.cfg.name
    }

    pub fn state(&self) -> BreakerState {
        self.0.core.lock().state
    }

    /// Watchable state, for operators and the control loop.
    pub fn watch(&self) -> watch::Receiver<BreakerState> {
        self.0.state_tx.subscribe()
    }

    /// Aggregated pain score over the rolling window: the larger of the
    /// decayed sum and the strongest single signal.
    pub fn pain_score(&self) -> f64 {
        let mut core = self.0.core.lock();
        Self::prune_pain(&mut core, &self.0.cfg);
        Self::aggregate(&core, &self.0.cfg)
    }

    /// Wrap a call. Fails fast with [`CoreError::CircuitOpen`] while open;
    /// in half-open state exactly one probe is let through.
    pub async fn call<T, Fut>(&self, f: impl FnOnce() -> Fut) -> CoreResult<T>
    where
        Fut: Future<Output = CoreResult<T>>,
    {
        if !self.try_acquire() {
            self.0.metrics.fast_fails.increment();
            let err = CoreError::CircuitOpen(self.0.cfg.name.clone());
            if let Some(severity) = err.pain_severity() {
                self.0.algedonic.pain(
                    format!("breaker/{}", self.0.cfg.name),
                    "circuit_open",
                    severity,
                    serde_json::json!({}),
                );
            }
            return Err(err);
        }

        match timeout(self.0.cfg.call_timeout, f()).await {
            Ok(Ok(value)) => {
                self.record_success();
                Ok(value)
            },
            Ok(Err(err)) => {
                self.record_failure();
                Err(err)
            },
            Err(_) => {
                // A timeout consumes a failure token like any other failure.
                self.record_failure();
                Err(CoreError::Timeout(self.0.cfg.call_timeout))
            },
        }
    }

    pub fn record_success(&self) {
        let emission = {
            let mut core = self.0.core.lock();
            core.failures = 0;
            core.first_failure = None;
            if self.0.cfg.learning {
                core.learning.correlation =
                    (core.learning.correlation - LEARNING_DECAY).max(0.0);
                core.learning.pending_pain = None;
            }
            if core.state == BreakerState::HalfOpen {
                core.state = BreakerState::Closed;
                core.probing = false;
                core.opened_at = None;
                Emission::Recovered
            } else {
                Emission::None
            }
        };
        self.emit(emission);
    }

    pub fn record_failure(&self) {
        let now = Instant::now();
        let emission = {
            let mut core = self.0.core.lock();
            match core.first_failure {
                Some(first) if now.duration_since(first) <= self.0.cfg.failure_window => {},
                _ => {
                    core.first_failure = Some(now);
                    core.failures = 0;
                },
            }
            core.failures += 1;

            if self.0.cfg.learning {
                if let Some(pain_at) = core.learning.pending_pain.take() {
                    if now.duration_since(pain_at) <= self.0.cfg.failure_window {
                        core.learning.correlation =
                            (core.learning.correlation + LEARNING_STEP).min(1.0);
                    }
                }
            }

            match core.state {
                BreakerState::HalfOpen => {
                    core.probing = false;
                    Self::open_locked(&mut core, now)
                        .then_some(Emission::Opened {
                            reason: "probe_failed".into(),
                        })
                        .unwrap_or(Emission::None)
                },
                BreakerState::Closed if core.failures >= self.0.cfg.failure_threshold => {
                    Self::open_locked(&mut core, now)
                        .then_some(Emission::Opened {
                            reason: "failure_threshold".into(),
                        })
                        .unwrap_or(Emission::None)
                },
                _ => Emission::None,
            }
        };
        self.emit(emission);
    }

    /// Hard-open directive, e.g. from an emergency scream.
    pub fn force_open(&self, reason: &str) {
        let emission = {
            let mut core = self.0.core.lock();
            if Self::open_locked(&mut core, Instant::now()) {
                Emission::Opened {
                    reason: reason.to_string(),
                }
            } else {
                Emission::None
            }
        };
        self.emit(emission);
    }

    /// Feed a pain signal into the breaker. Called from the pain listener
    /// and, for system-wide signals, by the registry.
    pub fn apply_pain(&self, intensity: f64) {
        let now = Instant::now();
        let emission = {
            let mut core = self.0.core.lock();
            core.pain_window.push_back((now, intensity));
            core.last_pain = Some(now);
            Self::prune_pain(&mut core, &self.0.cfg);

            let aggregate = Self::aggregate(&core, &self.0.cfg);
            let threshold = Self::effective_threshold(&core, &self.0.cfg);

            if core.state == BreakerState::HalfOpen && intensity >= HALF_OPEN_PAIN {
                core.probing = false;
                Self::open_locked(&mut core, now)
                    .then_some(Emission::Opened {
                        reason: "pain_during_probe".into(),
                    })
                    .unwrap_or(Emission::None)
            } else if aggregate > threshold {
                Self::open_locked(&mut core, now)
                    .then_some(Emission::Opened {
                        reason: "pain_threshold".into(),
                    })
                    .unwrap_or(Emission::None)
            } else {
                if self.0.cfg.learning && intensity > 0.0 {
                    // Remember sub-threshold pain; a failure soon after
                    // reinforces the correlation.
                    core.learning.pending_pain = Some(now);
                }
                Emission::None
            }
        };
        self.emit(emission);
    }

    /// Current effective pain threshold after learning.
    pub fn effective_pain_threshold(&self) -> f64 {
        let core = self.0.core.lock();
        Self::effective_threshold(&core, &self.0.cfg)
    }

    fn try_acquire(&self) -> bool {
        let mut core = self.0.core.lock();
        match core.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let since = match (core.opened_at, core.last_pain) {
                    (Some(opened), Some(pain)) => Some(opened.max(pain)),
                    (Some(opened), None) => Some(opened),
                    _ => None,
                };
                match since {
                    Some(since) if since.elapsed() >= self.0.cfg.recovery_time => {
                        core.state = BreakerState::HalfOpen;
                        core.probing = true;
                        self.0.metrics.probes.increment();
                        self.0.state_tx.send_replace(BreakerState::HalfOpen);
                        tracing::info!(breaker = %self.0.cfg.name, "probing for recovery");
                        true
                    },
                    _ => false,
                }
            },
            BreakerState::HalfOpen => {
                if core.probing {
                    false
                } else {
                    core.probing = true;
                    self.0.metrics.probes.increment();
                    true
                }
            },
        }
    }

    /// Transition to open. Returns false when already open.
    fn open_locked(core: &mut BreakerCore, now: Instant) -> bool {
        if core.state == BreakerState::Open {
            // Re-arm the recovery clock; reinforcing events keep us open.
            core.opened_at = Some(now);
            return false;
        }
        core.state = BreakerState::Open;
        core.opened_at = Some(now);
        true
    }

    fn prune_pain(core: &mut BreakerCore, cfg: &BreakerConfig) {
        let now = Instant::now();
        while let Some((at, _)) = core.pain_window.front() {
            if now.duration_since(*at) > cfg.pain_window {
                core.pain_window.pop_front();
            } else {
                break;
            }
        }
    }

    fn aggregate(core: &BreakerCore, cfg: &BreakerConfig) -> f64 {
        let now = Instant::now();
        let window = cfg.pain_window.as_secs_f64();
        let mut decayed_sum = 0.0;
        let mut peak: f64 = 0.0;
        for (at, intensity) in &core.pain_window {
            let age = now.duration_since(*at).as_secs_f64();
            let weight = (1.0 - age / window).max(0.0);
            decayed_sum += intensity * weight;
            peak = peak.max(*intensity);
        }
        decayed_sum.max(peak)
    }

    fn effective_threshold(core: &BreakerCore, cfg: &BreakerConfig) -> f64 {
        if !cfg.learning {
            return cfg.pain_threshold;
        }
        // Tightens linearly with correlation, floored at half the original.
        cfg.pain_threshold * (1.0 - 0.5 * core.learning.correlation)
    }

    fn emit(&self, emission: Emission) {
        match emission {
            Emission::None => {},
            Emission::Opened { reason } => {
                self.0.metrics.opened.increment();
                self.0.state_tx.send_replace(BreakerState::Open);
                tracing::warn!(breaker = %self.0.cfg.name, %reason, "circuit opened");
                self.0.algedonic.pain(
                    format!("breaker/{}", self.0.cfg.name),
                    format!("breaker_open:{reason}"),
                    Severity::High,
                    serde_json::json!({ "breaker": self.0.cfg.name }),
                );
            },
            Emission::Recovered => {
                self.0.metrics.closed.increment();
                self.0.state_tx.send_replace(BreakerState::Closed);
                tracing::info!(breaker = %self.0.cfg.name, "circuit closed");
                self.0.algedonic.pleasure(
                    format!("breaker/{}", self.0.cfg.name),
                    "service_recovered",
                    Severity::Low,
                    serde_json::json!({ "breaker": self.0.cfg.name }),
                );
            },
        }
    }

    async fn pain_loop(shared: Weak<BreakerShared>) {
        let (name, mut pain_rx, mut emergency_rx) = {
            let Some(shared) = shared.upgrade() else {
                return;
            };
            let name = shared.cfg.name.clone();
            let bus = shared.algedonic.bus();
            let pain_rx = bus.subscribe(
                Topic::AlgedonicPain,
                format!("breaker/{name}"),
                SubscribeOptions::default(),
            );
            let emergency_rx = bus.subscribe(
                Topic::EmergencyAlgedonic,
                format!("breaker/{name}"),
                SubscribeOptions::default(),
            );
            (name, pain_rx, emergency_rx)
        };
        let own_source = format!("breaker/{name}");

        loop {
            let message = tokio::select! {
                maybe = pain_rx.recv() => match maybe {
                    Some(msg) => Some((false, msg)),
                    None => None,
                },
                maybe = emergency_rx.recv() => match maybe {
                    Some(msg) => Some((true, msg)),
                    None => None,
                },
            };
            let Some((emergency, message)) = message else {
                return;
            };
            let Some(shared) = shared.upgrade() else {
                return;
            };
            let breaker = CircuitBreaker(shared);
            for event in message.into_events() {
                if emergency {
                    breaker.force_open("emergency_algedonic");
                    continue;
                }
                // Never feed our own pain back into the trigger.
                if event.metadata.source.as_deref() == Some(own_source.as_str()) {
                    continue;
                }
                // System-wide pain is routed by the registry to a single
                // victim, precisely to avoid opening every breaker at once.
                if event.metadata.scope.as_deref() == Some("system_wide") {
                    continue;
                }
                breaker.apply_pain(event.metadata.effective_intensity());
            }
        }
    }
}

impl EmergencyTarget for CircuitBreaker {
    fn name(&self) -> String {
        self.0.cfg.name.clone()
    }

    fn force_open(&self, reason: &str) {
        CircuitBreaker::force_open(self, reason);
    }
}
