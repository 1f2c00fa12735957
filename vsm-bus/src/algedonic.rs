// Copyright (c) 2024-2025 Viable Systems (viablesystems.io)
// This file is part of the VSM repository.

// You should have received a copy of the MIT License
// along with the VSM repository. If not, see <https://mit-license.org/>.

//! The algedonic channel: pain and pleasure signals routed with priority
//! above normal traffic, plus the system-wide emergency scream. Repeated
//! signals from the same source for the same reason collapse into one
//! delivery inside the repeat window; critical signals always go through.

use std::{
    num::NonZeroUsize,
    sync::Arc,
    time::Duration,
};

use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use tokio::time::Instant;
use vsm_types::{
    metrics::{Counter, Metrics},
    Event, EventMetadata, Severity, Topic,
};

use crate::EventBus;

/// Remembered `(source, reason, severity)` triples for repeat collapsing.
const REPEAT_CAPACITY: usize = 1024;

/// A component that must be reachable synchronously during an emergency
/// scream, typically a circuit breaker accepting a hard-open directive.
pub trait EmergencyTarget: Send + Sync {
    fn name(&self) -> String;

    /// Hard-open directive; must not block.
    fn force_open(&self, reason: &str);
}

#[derive(Clone, PartialEq, Eq, Hash)]
struct RepeatKey {
    source: String,
    reason: String,
    severity: Severity,
}

struct AlgedonicMetrics {
    pain: Box<dyn Counter>,
    pleasure: Box<dyn Counter>,
    screams: Box<dyn Counter>,
    collapsed: Box<dyn Counter>,
}

struct ChannelInner {
    bus: EventBus,
    repeat_window: Duration,
    recent: Mutex<LruCache<RepeatKey, Instant>>,
    targets: RwLock<Vec<Arc<dyn EmergencyTarget>>>,
    metrics: AlgedonicMetrics,
}

/// Cheaply clonable handle to the channel.
#[derive(Clone)]
pub struct AlgedonicChannel(Arc<ChannelInner>);

impl AlgedonicChannel {
    pub fn new(
        bus: EventBus,
        repeat_window: Duration,
        metrics: &(impl Metrics + ?Sized),
    ) -> Self {
        let metrics = metrics.subgroup("algedonic".into());
        Self(Arc::new(ChannelInner {
            bus,
            repeat_window,
            recent: Mutex::new(LruCache::new(
                NonZeroUsize::new(REPEAT_CAPACITY).expect("nonzero capacity"),
            )),
            targets: RwLock::new(vec![]),
            metrics: AlgedonicMetrics {
                pain: metrics.create_counter("pain".into(), None),
                pleasure: metrics.create_counter("pleasure".into(), None),
                screams: metrics.create_counter("screams".into(), None),
                collapsed: metrics.create_counter("collapsed".into(), None),
            },
        }))
    }

    pub fn bus(&self) -> &EventBus {
        &self.0.bus
    }

    /// Register a target of emergency hard-open directives.
    pub fn register_target(&self, target: Arc<dyn EmergencyTarget>) {
        self.0.targets.write().push(target);
    }

    /// Emit a pain signal. Returns the published event, or `None` when the
    /// signal was collapsed as a repeat.
    pub fn pain(
        &self,
        source: impl Into<String>,
        reason: impl Into<String>,
        severity: Severity,
        meta: serde_json::Value,
    ) -> Option<Event> {
        self.signal(Topic::AlgedonicPain, source.into(), reason.into(), severity, None, meta)
    }

    /// Pain with an explicit intensity overriding the severity mapping.
    pub fn pain_with_intensity(
        &self,
        source: impl Into<String>,
        reason: impl Into<String>,
        intensity: f64,
        meta: serde_json::Value,
    ) -> Option<Event> {
        let severity = Severity::from_intensity(intensity);
        self.signal(
            Topic::AlgedonicPain,
            source.into(),
            reason.into(),
            severity,
            Some(intensity),
            meta,
        )
    }

    pub fn pleasure(
        &self,
        source: impl Into<String>,
        reason: impl Into<String>,
        severity: Severity,
        meta: serde_json::Value,
    ) -> Option<Event> {
        self.signal(
            Topic::AlgedonicPleasure,
            source.into(),
            reason.into(),
            severity,
            None,
            meta,
        )
    }

    /// System-wide scream: publishes `emergency_algedonic` and synchronously
    /// hands every registered target a hard-open directive.
    pub fn emergency_scream(&self, source: impl Into<String>, message: impl Into<String>) -> Event {
        let source = source.into();
        let message = message.into();
        self.0.metrics.screams.increment();
        tracing::error!(%source, %message, "emergency algedonic scream");

        let data = serde_json::json!({
            "source": source,
            "message": message,
        });
        let metadata = EventMetadata::algedonic(source.clone(), Severity::Critical)
            .with_reason("emergency_scream")
            .with_scope("system_wide");
        let event = self
            .0
            .bus
            .publish_with_metadata(Topic::EmergencyAlgedonic, data, metadata);

        for target in self.0.targets.read().iter() {
            target.force_open("emergency_scream");
        }
        event
    }

    fn signal(
        &self,
        topic: Topic,
        source: String,
        reason: String,
        severity: Severity,
        intensity: Option<f64>,
        meta: serde_json::Value,
    ) -> Option<Event> {
        if self.collapsed(&source, &reason, severity) {
            self.0.metrics.collapsed.increment();
            return None;
        }
        match topic {
            Topic::AlgedonicPain => self.0.metrics.pain.increment(),
            _ => self.0.metrics.pleasure.increment(),
        }

        let data = serde_json::json!({
            "source": source,
            "reason": reason,
            "severity": severity.as_str(),
            "meta": meta,
        });
        let mut metadata =
            EventMetadata::algedonic(source, severity).with_reason(reason);
        if let Some(intensity) = intensity {
            metadata = metadata.with_intensity(intensity);
        }
        Some(self.0.bus.publish_with_metadata(topic, data, metadata))
    }

    /// Whether this signal repeats a recent one and should collapse.
    /// Critical signals are always delivered.
    fn collapsed(&self, source: &str, reason: &str, severity: Severity) -> bool {
        if severity == Severity::Critical {
            return false;
        }
        let key = RepeatKey {
            source: source.to_string(),
            reason: reason.to_string(),
            severity,
        };
        let now = Instant::now();
        let mut recent = self.0.recent.lock();
        if let Some(last) = recent.get(&key) {
            if now.duration_since(*last) < self.0.repeat_window {
                return true;
            }
        }
        recent.put(key, now);
        false
    }
}
