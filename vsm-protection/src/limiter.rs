// Copyright (c) 2024-2025 Viable Systems (viablesystems.io)
// This file is part of the VSM repository.

// You should have received a copy of the MIT License
// along with the VSM repository. If not, see <https://mit-license.org/>.

//! Rate limiting with a sliding-window estimator. The authoritative store is
//! a distributed KV collaborator reached through a circuit breaker; while
//! that breaker is open, checks fall back to a local token bucket over the
//! same rule so callers never have to branch. Denials emit pain scaled by
//! saturation, recovery below the pleasure threshold emits pleasure, and a
//! feedback loop adapts per-rule limits to observed rejection and
//! utilization, as well as to external pain and pleasure.

use std::{
    collections::VecDeque,
    sync::{Arc, Weak},
    time::Duration,
};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::{task::JoinHandle, time::Instant};
use vsm_bus::{AlgedonicChannel, BusMessage, SubscribeOptions};
use vsm_types::{
    metrics::{Counter, Metrics},
    traits::DistributedKv,
    CoreError, CoreResult, HlcClock, Severity, Topic, Usage,
};

use crate::breaker::CircuitBreaker;

/// Server-side script evaluated on the distributed KV for an atomic
/// check-and-increment. Args: window_ms, max_requests, cost, now_ms.
const SLIDING_WINDOW_SCRIPT: &str = "sliding_window_check_and_track";

/// Sub-buckets covering one rule window.
const NUM_BUCKETS: u32 = 10;

/// Ceiling on adaptive scaling so pleasure cannot grow a limit without
/// bound.
const MAX_SCALE: f64 = 2.0;

#[derive(Clone, Debug)]
pub struct RateLimitRule {
    pub name: String,
    pub window: Duration,
    pub max_requests: u32,
    /// Floor the adaptive feedback may never cut below.
    pub min_limit: u32,
}

impl RateLimitRule {
    pub fn new(name: impl Into<String>, window: Duration, max_requests: u32) -> Self {
        Self {
            name: name.into(),
            window,
            max_requests,
            min_limit: (max_requests / 10).max(1),
        }
    }

    pub fn with_min_limit(mut self, min_limit: u32) -> Self {
        self.min_limit = min_limit;
        self
    }
}

#[derive(Clone, Debug)]
pub struct RateLimiterConfig {
    /// Usage fraction below which a recently-denied rule emits pleasure.
    pub pleasure_threshold: f64,
    /// Period of the VSM feedback adaptation.
    pub adaptation_interval: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            pleasure_threshold: 0.3,
            adaptation_interval: Duration::from_secs(10),
        }
    }
}

/// Sliding-window counter over sub-buckets. The effective count weights the
/// oldest, partially-expired bucket by its overlap with the window and
/// floors the total, which makes the estimator exact at bucket granularity.
#[derive(Debug, Default)]
pub(crate) struct SlidingWindow {
    /// `(bucket_start_ms, count)`, oldest first.
    buckets: VecDeque<(i64, f64)>,
}

impl SlidingWindow {
    fn bucket_ms(window_ms: i64) -> i64 {
        (window_ms / i64::from(NUM_BUCKETS)).max(1)
    }

    fn evict(&mut self, now_ms: i64, window_ms: i64) {
        let bucket_ms = Self::bucket_ms(window_ms);
        while let Some((start, _)) = self.buckets.front() {
            if start + bucket_ms <= now_ms - window_ms {
                self.buckets.pop_front();
            } else {
                break;
            }
        }
    }

    fn weighted_count(&self, now_ms: i64, window_ms: i64) -> f64 {
        let bucket_ms = Self::bucket_ms(window_ms);
        let window_start = now_ms - window_ms;
        self.buckets
            .iter()
            .map(|(start, count)| {
                if *start >= window_start {
                    *count
                } else {
                    let overlap = (start + bucket_ms - window_start) as f64 / bucket_ms as f64;
                    count * overlap.clamp(0.0, 1.0)
                }
            })
            .sum()
    }

    /// Check `cost` against the limit and increment atomically on success.
    pub(crate) fn check_and_track(
        &mut self,
        now_ms: i64,
        window_ms: i64,
        max: u32,
        cost: u32,
    ) -> (bool, Usage) {
        self.evict(now_ms, window_ms);
        let effective = self.weighted_count(now_ms, window_ms).floor();
        let allowed = effective + f64::from(cost) <= f64::from(max);
        if allowed {
            let bucket_ms = Self::bucket_ms(window_ms);
            let start = now_ms - now_ms.rem_euclid(bucket_ms);
            match self.buckets.back_mut() {
                Some((last, count)) if *last == start => *count += f64::from(cost),
                _ => self.buckets.push_back((start, f64::from(cost))),
            }
        }
        let current = if allowed {
            effective + f64::from(cost)
        } else {
            effective
        };
        let reset_at_ms = self
            .buckets
            .front()
            .map(|(start, _)| start + window_ms)
            .unwrap_or(now_ms);
        (
            allowed,
            Usage {
                current,
                max,
                remaining: (f64::from(max) - current).max(0.0),
                reset_at_ms,
            },
        )
    }

    pub(crate) fn usage(&mut self, now_ms: i64, window_ms: i64, max: u32) -> Usage {
        self.evict(now_ms, window_ms);
        let current = self.weighted_count(now_ms, window_ms);
        let reset_at_ms = self
            .buckets
            .front()
            .map(|(start, _)| start + window_ms)
            .unwrap_or(now_ms);
        Usage {
            current,
            max,
            remaining: (f64::from(max) - current).max(0.0),
            reset_at_ms,
        }
    }
}

/// Local token bucket used while the distributed backend is unreachable.
/// Same rule, continuous refill; close enough that callers don't branch.
#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(max: u32) -> Self {
        Self {
            tokens: f64::from(max),
            last_refill: Instant::now(),
        }
    }

    fn check_and_track(&mut self, window: Duration, max: u32, cost: u32) -> (bool, Usage) {
        let now = Instant::now();
        let refill =
            f64::from(max) * now.duration_since(self.last_refill).as_secs_f64()
                / window.as_secs_f64();
        self.tokens = (self.tokens + refill).min(f64::from(max));
        self.last_refill = now;

        let allowed = self.tokens >= f64::from(cost);
        if allowed {
            self.tokens -= f64::from(cost);
        }
        let current = f64::from(max) - self.tokens;
        (
            allowed,
            Usage {
                current,
                max,
                remaining: self.tokens,
                reset_at_ms: HlcClock::wall_ms() + window.as_millis() as i64,
            },
        )
    }
}

struct RuleState {
    rule: RateLimitRule,
    /// Adaptive scaling applied to `max_requests`.
    scale: f64,
    allowed: u64,
    denied: u64,
    peak_usage: f64,
    recently_denied: bool,
}

impl RuleState {
    fn effective_max(&self) -> u32 {
        let scaled = (f64::from(self.rule.max_requests) * self.scale).round() as u32;
        scaled.max(self.rule.min_limit)
    }
}

struct LimiterMetrics {
    allowed: Box<dyn Counter>,
    denied: Box<dyn Counter>,
    fallback_checks: Box<dyn Counter>,
    adaptations: Box<dyn Counter>,
}

struct LimiterInner {
    cfg: RateLimiterConfig,
    rules: DashMap<String, RuleState>,
    windows: DashMap<String, SlidingWindow>,
    fallback: DashMap<String, TokenBucket>,
    backend: Option<(Arc<dyn DistributedKv>, CircuitBreaker)>,
    algedonic: AlgedonicChannel,
    metrics: LimiterMetrics,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Drop for LimiterInner {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

#[derive(Clone)]
pub struct RateLimiter(Arc<LimiterInner>);

impl RateLimiter {
    /// A limiter holding all rules locally.
    pub fn new(
        cfg: RateLimiterConfig,
        algedonic: AlgedonicChannel,
        metrics: &(impl Metrics + ?Sized),
    ) -> Self {
        Self::build(cfg, None, algedonic, metrics)
    }

    /// A limiter backed by a distributed KV, guarded by the given breaker.
    /// While the breaker is open, checks run on the local fallback.
    pub fn with_backend(
        cfg: RateLimiterConfig,
        backend: Arc<dyn DistributedKv>,
        breaker: CircuitBreaker,
        algedonic: AlgedonicChannel,
        metrics: &(impl Metrics + ?Sized),
    ) -> Self {
        Self::build(cfg, Some((backend, breaker)), algedonic, metrics)
    }

    fn build(
        cfg: RateLimiterConfig,
        backend: Option<(Arc<dyn DistributedKv>, CircuitBreaker)>,
        algedonic: AlgedonicChannel,
        metrics: &(impl Metrics + ?Sized),
    ) -> Self {
        let metrics = metrics.subgroup("limiter".into());
        let inner = Arc::new(LimiterInner {
            cfg,
            rules: DashMap::new(),
            windows: DashMap::new(),
            fallback: DashMap::new(),
            backend,
            algedonic,
            metrics: LimiterMetrics {
                allowed: metrics.create_counter("allowed".into(), None),
                denied: metrics.create_counter("denied".into(), None),
                fallback_checks: metrics.create_counter("fallback_checks".into(), None),
                adaptations: metrics.create_counter("adaptations".into(), None),
            },
            tasks: Mutex::new(vec![]),
        });
        let adaptation = tokio::spawn(Self::adaptation_loop(Arc::downgrade(&inner)));
        let feedback = tokio::spawn(Self::algedonic_loop(Arc::downgrade(&inner)));
        inner.tasks.lock().extend([adaptation, feedback]);
        Self(inner)
    }

    pub fn add_rule(&self, rule: RateLimitRule) {
        self.0.rules.insert(
            rule.name.clone(),
            RuleState {
                rule,
                scale: 1.0,
                allowed: 0,
                denied: 0,
                peak_usage: 0.0,
                recently_denied: false,
            },
        );
    }

    /// Current effective limit of a rule after adaptation.
    pub fn effective_limit(&self, rule_name: &str) -> Option<u32> {
        self.0.rules.get(rule_name).map(|r| r.effective_max())
    }

    /// Read-only usage estimate from the local window.
    pub fn usage(&self, identifier: &str, rule_name: &str) -> Option<Usage> {
        let state = self.0.rules.get(rule_name)?;
        let (window_ms, max) = (state.rule.window.as_millis() as i64, state.effective_max());
        drop(state);
        let key = format!("{rule_name}:{identifier}");
        let mut window = self.0.windows.entry(key).or_default();
        Some(window.usage(HlcClock::wall_ms(), window_ms, max))
    }

    /// Check a request of `cost` tokens against a rule. On success the usage
    /// is tracked atomically; on denial the caller gets
    /// [`CoreError::RateLimited`] with a usage snapshot and pain is emitted.
    pub async fn check_and_track(
        &self,
        identifier: &str,
        rule_name: &str,
        cost: u32,
    ) -> CoreResult<Usage> {
        let (window, window_ms, max) = {
            let state = self
                .0
                .rules
                .get(rule_name)
                .ok_or_else(|| CoreError::InvalidInput(format!("unknown rule: {rule_name}")))?;
            (
                state.rule.window,
                state.rule.window.as_millis() as i64,
                state.effective_max(),
            )
        };
        let key = format!("{rule_name}:{identifier}");

        let (allowed, usage) = match &self.0.backend {
            Some((backend, breaker)) => {
                let attempt = breaker
                    .call(|| Self::backend_check(Arc::clone(backend), key.clone(), window_ms, max, cost))
                    .await;
                match attempt {
                    Ok(decision) => decision,
                    Err(err) => {
                        // Backend down or breaker open: same rule, local
                        // token bucket. Only telemetry differs.
                        tracing::debug!(rule = rule_name, %err, "falling back to local bucket");
                        self.0.metrics.fallback_checks.increment();
                        self.0
                            .fallback
                            .entry(key)
                            .or_insert_with(|| TokenBucket::new(max))
                            .check_and_track(window, max, cost)
                    },
                }
            },
            None => self
                .0
                .windows
                .entry(key)
                .or_default()
                .check_and_track(HlcClock::wall_ms(), window_ms, max, cost),
        };

        if allowed {
            self.0.metrics.allowed.increment();
            self.note_allowed(rule_name, &usage, max);
            Ok(usage)
        } else {
            self.0.metrics.denied.increment();
            self.note_denied(rule_name, &usage);
            Err(CoreError::RateLimited { usage })
        }
    }

    async fn backend_check(
        backend: Arc<dyn DistributedKv>,
        key: String,
        window_ms: i64,
        max: u32,
        cost: u32,
    ) -> CoreResult<(bool, Usage)> {
        let result = backend
            .eval_script(
                SLIDING_WINDOW_SCRIPT,
                &[key],
                &[
                    window_ms.to_string(),
                    max.to_string(),
                    cost.to_string(),
                    HlcClock::wall_ms().to_string(),
                ],
            )
            .await?;
        let malformed = || CoreError::BackendUnavailable("malformed limiter response".into());
        let allowed = result["allowed"].as_bool().ok_or_else(malformed)?;
        Ok((
            allowed,
            Usage {
                current: result["current"].as_f64().ok_or_else(malformed)?,
                max,
                remaining: result["remaining"].as_f64().unwrap_or(0.0),
                reset_at_ms: result["reset_at_ms"].as_i64().unwrap_or(0),
            },
        ))
    }

    fn note_allowed(&self, rule_name: &str, usage: &Usage, max: u32) {
        let mut pleasure = false;
        if let Some(mut state) = self.0.rules.get_mut(rule_name) {
            state.allowed += 1;
            let utilization = usage.current / f64::from(max);
            state.peak_usage = state.peak_usage.max(utilization);
            if state.recently_denied && utilization < self.0.cfg.pleasure_threshold {
                state.recently_denied = false;
                pleasure = true;
            }
        }
        if pleasure {
            self.0.algedonic.pleasure(
                format!("limiter/{rule_name}"),
                "limit_pressure_relieved",
                Severity::Low,
                serde_json::json!({ "rule": rule_name }),
            );
        }
    }

    fn note_denied(&self, rule_name: &str, usage: &Usage) {
        if let Some(mut state) = self.0.rules.get_mut(rule_name) {
            state.denied += 1;
            state.recently_denied = true;
        }
        let err = CoreError::RateLimited {
            usage: usage.clone(),
        };
        if let Some(severity) = err.pain_severity() {
            self.0.algedonic.pain(
                format!("limiter/{rule_name}"),
                "rate_limited",
                severity,
                serde_json::json!({
                    "rule": rule_name,
                    "current": usage.current,
                    "max": usage.max,
                }),
            );
        }
    }

    /// Periodic VSM feedback: shrink rules that reject too much, grow rules
    /// that sit idle.
    async fn adaptation_loop(inner: Weak<LimiterInner>) {
        let interval = {
            let Some(inner) = inner.upgrade() else {
                return;
            };
            inner.cfg.adaptation_interval
        };
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let Some(inner) = inner.upgrade() else {
                return;
            };
            for mut state in inner.rules.iter_mut() {
                let total = state.allowed + state.denied;
                if total > 0 {
                    let rejection = state.denied as f64 / total as f64;
                    if rejection > 0.2 {
                        state.scale *= 0.9;
                    } else if state.peak_usage < 0.3 {
                        state.scale *= 1.1;
                    }
                    Self::clamp_scale(&mut state);
                    tracing::debug!(
                        rule = state.rule.name,
                        rejection,
                        peak = state.peak_usage,
                        scale = state.scale,
                        "limiter adaptation"
                    );
                }
                state.allowed = 0;
                state.denied = 0;
                state.peak_usage = 0.0;
            }
            inner.metrics.adaptations.increment();
        }
    }

    /// External pain shrinks limits, pleasure relaxes them.
    async fn algedonic_loop(inner: Weak<LimiterInner>) {
        let (mut pain_rx, mut pleasure_rx) = {
            let Some(inner) = inner.upgrade() else {
                return;
            };
            let bus = inner.algedonic.bus();
            (
                bus.subscribe(
                    Topic::AlgedonicPain,
                    "limiter_feedback",
                    SubscribeOptions::default(),
                ),
                bus.subscribe(
                    Topic::AlgedonicPleasure,
                    "limiter_feedback",
                    SubscribeOptions::default(),
                ),
            )
        };
        loop {
            let message: Option<(bool, BusMessage)> = tokio::select! {
                maybe = pain_rx.recv() => maybe.map(|m| (true, m)),
                maybe = pleasure_rx.recv() => maybe.map(|m| (false, m)),
            };
            let Some((pain, message)) = message else {
                return;
            };
            let Some(inner) = inner.upgrade() else {
                return;
            };
            for event in message.into_events() {
                // Our own emissions must not feed back into the scaling.
                if event
                    .metadata
                    .source
                    .as_deref()
                    .is_some_and(|s| s.starts_with("limiter/"))
                {
                    continue;
                }
                let factor = if pain {
                    match event.metadata.severity.unwrap_or(Severity::Medium) {
                        Severity::Critical => 0.5,
                        Severity::High => 0.8,
                        Severity::Medium => 0.9,
                        Severity::Low => 0.95,
                    }
                } else {
                    1.05
                };
                for mut state in inner.rules.iter_mut() {
                    state.scale *= factor;
                    Self::clamp_scale(&mut state);
                }
            }
        }
    }

    fn clamp_scale(state: &mut RuleState) {
        let min_scale = f64::from(state.rule.min_limit) / f64::from(state.rule.max_requests);
        state.scale = state.scale.clamp(min_scale, MAX_SCALE);
    }
}
