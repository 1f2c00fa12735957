// Copyright (c) 2024-2025 Viable Systems (viablesystems.io)
// This file is part of the VSM repository.

// You should have received a copy of the MIT License
// along with the VSM repository. If not, see <https://mit-license.org/>.

//! Coordination across breakers. The registry keeps cascades from happening:
//! system-wide pain is routed to the single breaker already carrying the
//! most pain instead of tripping all of them, and an emergency scream is
//! answered with one `circuit_breaker_emergency_cascade` event naming the
//! affected breakers for operator awareness. Registered breakers are also
//! wired up as hard-open targets of the algedonic channel.

use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use vsm_bus::{AlgedonicChannel, EmergencyTarget, SubscribeOptions};
use vsm_types::Topic;

use crate::breaker::CircuitBreaker;

struct RegistryInner {
    algedonic: AlgedonicChannel,
    breakers: RwLock<Vec<CircuitBreaker>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for RegistryInner {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}

#[derive(Clone)]
pub struct BreakerRegistry(Arc<RegistryInner>);

impl BreakerRegistry {
    pub fn new(algedonic: AlgedonicChannel) -> Self {
        let inner = Arc::new(RegistryInner {
            algedonic,
            breakers: RwLock::new(vec![]),
            task: Mutex::new(None),
        });
        let task = tokio::spawn(Self::run(Arc::downgrade(&inner)));
        *inner.task.lock() = Some(task);
        Self(inner)
    }

    /// Register a breaker for coordination and as an emergency hard-open
    /// target.
    pub fn register(&self, breaker: CircuitBreaker) {
        self.0
            .algedonic
            .register_target(Arc::new(breaker.clone()) as Arc<dyn EmergencyTarget>);
        self.0.breakers.write().push(breaker);
    }

    pub fn get(&self, name: &str) -> Option<CircuitBreaker> {
        self.0
            .breakers
            .read()
            .iter()
            .find(|b| b.name() == name)
            .cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.0
            .breakers
            .read()
            .iter()
            .map(|b| b.name().to_string())
            .collect()
    }

    async fn run(inner: Weak<RegistryInner>) {
        let (mut pain_rx, mut emergency_rx) = {
            let Some(inner) = inner.upgrade() else {
                return;
            };
            let bus = inner.algedonic.bus();
            (
                bus.subscribe(
                    Topic::AlgedonicPain,
                    "breaker_registry",
                    SubscribeOptions::default(),
                ),
                bus.subscribe(
                    Topic::EmergencyAlgedonic,
                    "breaker_registry",
                    SubscribeOptions::default(),
                ),
            )
        };

        loop {
            let message = tokio::select! {
                maybe = pain_rx.recv() => maybe.map(|m| (false, m)),
                maybe = emergency_rx.recv() => maybe.map(|m| (true, m)),
            };
            let Some((emergency, message)) = message else {
                return;
            };
            let Some(inner) = inner.upgrade() else {
                return;
            };
            let registry = BreakerRegistry(inner);
            for event in message.into_events() {
                if emergency {
                    registry.broadcast_cascade(
                        event.metadata.source.as_deref().unwrap_or("unknown"),
                    );
                } else if event.metadata.scope.as_deref() == Some("system_wide") {
                    registry.route_system_wide(event.metadata.effective_intensity());
                }
            }
        }
    }

    /// Deliver system-wide pain to the breaker already under the most
    /// pressure (first registered on a tie). The rest stay closed; that is
    /// the point.
    fn route_system_wide(&self, intensity: f64) {
        let victim = {
            let breakers = self.0.breakers.read();
            breakers
                .iter()
                .map(|b| (b.pain_score(), b))
                .max_by(|(a, _), (b, _)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
                .map(|(_, b)| b.clone())
        };
        if let Some(victim) = victim {
            tracing::warn!(
                breaker = victim.name(),
                intensity,
                "routing system-wide pain to most-pressured breaker"
            );
            victim.apply_pain(intensity);
        }
    }

    /// Announce which breakers an emergency affected. Operator awareness
    /// only; every breaker already hard-opens itself.
    fn broadcast_cascade(&self, source: &str) {
        let names = self.names();
        self.0.algedonic.bus().publish(
            Topic::CircuitBreakerEmergencyCascade,
            serde_json::json!({
                "source": source,
                "breakers": names,
            }),
        );
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use pretty_assertions::assert_eq;
    use serde_json::json;
    use vsm_bus::{BusConfig, BusMessage, EventBus};
    use vsm_types::{metrics::InMemoryMetrics, EventMetadata, HlcClock, Severity};
    use vsm_utils::test_utils::setup_test;

    use super::*;
    use crate::breaker::{BreakerConfig, BreakerState};

    fn setup() -> (BreakerRegistry, AlgedonicChannel, EventBus, InMemoryMetrics) {
        let metrics = InMemoryMetrics::new();
        let clock = Arc::new(HlcClock::new("test-node"));
        let bus = EventBus::new(clock, BusConfig::default(), &metrics);
        let algedonic = AlgedonicChannel::new(bus.clone(), Duration::from_millis(10), &metrics);
        let registry = BreakerRegistry::new(algedonic.clone());
        (registry, algedonic, bus, metrics)
    }

    fn breaker(name: &str, algedonic: &AlgedonicChannel, metrics: &InMemoryMetrics) -> CircuitBreaker {
        CircuitBreaker::new(
            BreakerConfig::new(name).with_pain_window(Duration::from_millis(2000)),
            algedonic.clone(),
            metrics,
        )
    }

    #[tokio::test]
    async fn test_system_wide_pain_opens_one_not_all() {
        setup_test();
        let (registry, algedonic, bus, metrics) = setup();
        for name in ["api", "db", "cache"] {
            registry.register(breaker(name, &algedonic, &metrics));
        }

        bus.publish_with_metadata(
            Topic::AlgedonicPain,
            json!({"source": "health_monitor"}),
            EventMetadata::algedonic("health_monitor", Severity::Critical)
                .with_scope("system_wide"),
        );
        tokio::time::sleep(Duration::from_millis(100)).await;

        let states: Vec<_> = registry
            .names()
            .iter()
            .map(|n| registry.get(n).unwrap().state())
            .collect();
        let open = states.iter().filter(|s| **s == BreakerState::Open).count();
        assert!(open >= 1, "at least one breaker absorbed the pain");
        assert!(
            states.iter().any(|s| *s == BreakerState::Closed),
            "cascade prevention keeps at least one closed"
        );
    }

    #[tokio::test]
    async fn test_emergency_opens_all_and_cascade_event_is_published() {
        setup_test();
        let (registry, algedonic, bus, metrics) = setup();
        let mut cascade_rx = bus.subscribe(
            Topic::CircuitBreakerEmergencyCascade,
            "observer",
            SubscribeOptions::default(),
        );
        for name in ["api", "db", "cache"] {
            registry.register(breaker(name, &algedonic, &metrics));
        }

        algedonic.emergency_scream("test", "meltdown");
        tokio::time::sleep(Duration::from_millis(100)).await;

        for name in registry.names() {
            assert_eq!(registry.get(&name).unwrap().state(), BreakerState::Open);
        }

        let msg = tokio::time::timeout(Duration::from_millis(500), cascade_rx.recv())
            .await
            .expect("cascade event published")
            .unwrap();
        let BusMessage::Event(event) = msg else {
            panic!("immediate delivery expected");
        };
        let names = event.data["breakers"].as_array().unwrap();
        assert_eq!(names.len(), 3);
    }
}
