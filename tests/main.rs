//! End-to-end scenarios exercising the assembled control plane: breakers
//! under pain, emergency screams, ordered delivery, the algedonic bypass,
//! rate limiting and closure of the S1 → S2 → S3 → S1 variety loop.

use std::{sync::Arc, time::Duration};

use pretty_assertions::assert_eq;
use serde_json::json;
use tokio::time::{sleep, timeout, Instant};
use vsm_bus::{
    AlgedonicChannel, BusConfig, BusMessage, EventBus, SubscribeOptions,
};
use vsm_protection::{
    BreakerConfig, BreakerRegistry, BreakerState, CircuitBreaker, RateLimitRule, RateLimiter,
    RateLimiterConfig,
};
use vsm_task::{RestartPolicy, Supervised, Supervisor};
use vsm_task_impls::{
    control_loop::{ControlLoop, ControlLoopConfig, EmergencyMode},
    s1::S1Operations,
    s2::S2Coordination,
    s3::S3Control,
    s4::S4Intelligence,
    s5::S5Policy,
    variety,
};
use vsm_types::{
    metrics::InMemoryMetrics, CoreError, EventMetadata, HlcClock, Severity, SubsystemKind, Topic,
    VsmEvent, VsmEventType,
};
use vsm_utils::test_utils::setup_test;

fn plumbing() -> (EventBus, AlgedonicChannel, InMemoryMetrics, Arc<HlcClock>) {
    let metrics = InMemoryMetrics::new();
    let clock = Arc::new(HlcClock::new("test-node"));
    let bus = EventBus::new(Arc::clone(&clock), BusConfig::default(), &metrics);
    let algedonic = AlgedonicChannel::new(bus.clone(), Duration::from_millis(50), &metrics);
    (bus, algedonic, metrics, clock)
}

fn protected_breaker(
    name: &str,
    algedonic: &AlgedonicChannel,
    metrics: &InMemoryMetrics,
) -> CircuitBreaker {
    CircuitBreaker::new(
        BreakerConfig::new(name)
            .with_pain_threshold(0.8)
            .with_pain_window(Duration::from_millis(2000)),
        algedonic.clone(),
        metrics,
    )
}

/// Scenario 1: critical system-wide pain trips one breaker, not all of
/// them.
#[tokio::test]
async fn test_critical_pain_trips_one_breaker_not_all() {
    setup_test();
    let (bus, algedonic, metrics, _clock) = plumbing();
    let registry = BreakerRegistry::new(algedonic.clone());
    for name in ["api", "db", "cache"] {
        registry.register(protected_breaker(name, &algedonic, &metrics));
    }
    sleep(Duration::from_millis(50)).await;

    bus.publish_with_metadata(
        Topic::AlgedonicPain,
        json!({"source": "health_monitor", "scope": "system_wide"}),
        EventMetadata::algedonic("health_monitor", Severity::Critical).with_scope("system_wide"),
    );

    // At least one breaker opens within 100 ms.
    let deadline = Instant::now() + Duration::from_millis(100);
    let opened = loop {
        let states: Vec<BreakerState> = ["api", "db", "cache"]
            .iter()
            .map(|n| registry.get(n).unwrap().state())
            .collect();
        let open = states.iter().filter(|s| **s == BreakerState::Open).count();
        if open >= 1 {
            break states;
        }
        assert!(Instant::now() < deadline, "no breaker opened within 100ms");
        sleep(Duration::from_millis(5)).await;
    };

    // Cascade prevention: at least one breaker stays closed.
    assert!(
        opened.iter().any(|s| *s == BreakerState::Closed),
        "system-wide pain must not open every breaker: {opened:?}"
    );
}

/// Scenario 2: an emergency scream opens every breaker and announces the
/// cascade.
#[tokio::test]
async fn test_emergency_scream_opens_all_breakers() {
    setup_test();
    let (bus, algedonic, metrics, _clock) = plumbing();
    let mut cascade_rx = bus.subscribe(
        Topic::CircuitBreakerEmergencyCascade,
        "observer",
        SubscribeOptions::default(),
    );
    let registry = BreakerRegistry::new(algedonic.clone());
    for name in ["api", "db", "cache"] {
        registry.register(protected_breaker(name, &algedonic, &metrics));
    }
    sleep(Duration::from_millis(50)).await;

    algedonic.emergency_scream("test", "total meltdown");

    let deadline = Instant::now() + Duration::from_millis(200);
    loop {
        let all_open = ["api", "db", "cache"]
            .iter()
            .all(|n| registry.get(n).unwrap().state() == BreakerState::Open);
        if all_open {
            break;
        }
        assert!(
            Instant::now() < deadline,
            "all breakers must open within 200ms"
        );
        sleep(Duration::from_millis(5)).await;
    }

    let msg = timeout(Duration::from_millis(500), cascade_rx.recv())
        .await
        .expect("cascade event observed")
        .unwrap();
    let event = &msg.into_events()[0];
    assert_eq!(event.topic, Topic::CircuitBreakerEmergencyCascade);
    assert_eq!(event.data["breakers"].as_array().unwrap().len(), 3);
}

/// Scenario 3: shuffled input comes out of ordered delivery as one batch in
/// HLC order.
#[tokio::test]
async fn test_hlc_ordering_under_shuffled_input() {
    setup_test();
    let (bus, _algedonic, _metrics, clock) = plumbing();
    let mut rx = bus.subscribe(
        Topic::S1Operations,
        "ordered-sub",
        SubscribeOptions::ordered_with_window(Duration::from_millis(100)).with_batch(),
    );

    let e1 = vsm_types::Event::new(Topic::S1Operations, json!({"seq": 1}), clock.now());
    let e2 = vsm_types::Event::new(Topic::S1Operations, json!({"seq": 2}), clock.now());
    let e3 = vsm_types::Event::new(Topic::S1Operations, json!({"seq": 3}), clock.now());
    assert!(e1.hlc < e2.hlc && e2.hlc < e3.hlc);

    let started = Instant::now();
    for event in [&e3, &e1, &e2] {
        bus.publish_event(event.clone());
    }

    let msg = timeout(Duration::from_millis(1000), rx.recv())
        .await
        .expect("batch delivered")
        .unwrap();
    let elapsed = started.elapsed();
    let BusMessage::OrderedBatch(events) = msg else {
        panic!("expected one batch, got {msg:?}");
    };
    let seqs: Vec<_> = events
        .iter()
        .map(|e| e.data["seq"].as_i64().unwrap())
        .collect();
    assert_eq!(seqs, vec![1, 2, 3]);
    // Delivery waits for the buffer window (with scheduling slack).
    assert!(elapsed >= Duration::from_millis(80), "flushed at {elapsed:?}");
}

/// Scenario 4: a high-intensity algedonic event overtakes the ordered
/// buffer.
#[tokio::test]
async fn test_algedonic_bypass_beats_the_window() {
    setup_test();
    let (bus, _algedonic, _metrics, clock) = plumbing();
    let mut rx = bus.subscribe(
        Topic::AlgedonicPain,
        "ordered-sub",
        SubscribeOptions::ordered_with_window(Duration::from_millis(100)),
    );

    let normal = vsm_types::Event::new(Topic::AlgedonicPain, json!({"kind": "normal"}), clock.now());
    bus.publish_event(normal.clone());
    sleep(Duration::from_millis(10)).await;

    let started = Instant::now();
    let bypass = vsm_types::Event::new(Topic::AlgedonicPain, json!({"kind": "bypass"}), clock.now())
        .with_metadata(
            EventMetadata::algedonic("monitor", Severity::Critical).with_intensity(0.99),
        );
    bus.publish_event(bypass.clone());

    let first = timeout(Duration::from_millis(100), rx.recv())
        .await
        .expect("bypass is immediate")
        .unwrap();
    assert_eq!(first.into_events()[0].id, bypass.id);
    assert!(
        started.elapsed() < Duration::from_millis(60),
        "bypass must not wait for the window"
    );

    let second = timeout(Duration::from_millis(1000), rx.recv())
        .await
        .expect("buffered event still arrives")
        .unwrap();
    assert_eq!(second.into_events()[0].id, normal.id);
}

/// Scenario 5: sliding-window rate limiting over a real timeline.
#[tokio::test]
async fn test_rate_limiter_sliding_window() -> anyhow::Result<()> {
    setup_test();
    let (_bus, algedonic, metrics, _clock) = plumbing();
    let limiter = RateLimiter::new(RateLimiterConfig::default(), algedonic, &metrics);
    limiter.add_rule(RateLimitRule::new("api", Duration::from_millis(1000), 5));

    // Five requests at 0, 100, .., 400 ms all pass.
    for _ in 0..5 {
        limiter.check_and_track("client", "api", 1).await?;
        sleep(Duration::from_millis(100)).await;
    }
    // The sixth at ~500 ms is denied with a usage snapshot.
    let err = limiter
        .check_and_track("client", "api", 1)
        .await
        .expect_err("sixth request is rate limited");
    let CoreError::RateLimited { usage } = err else {
        panic!("expected RateLimited, got {err:?}");
    };
    assert_eq!(usage.max, 5);
    assert_eq!(usage.remaining, 0.0);

    // After the first request leaves the window (~1050 ms), room again.
    sleep(Duration::from_millis(550)).await;
    limiter.check_and_track("client", "api", 1).await?;
    Ok(())
}

/// Scenario 6: operational variety published into S1 comes back as a
/// command targeting the originating unit within a few control cycles.
#[tokio::test]
async fn test_variety_loop_closes() {
    setup_test();
    let (bus, algedonic, metrics, clock) = plumbing();
    let supervisor = Supervisor::new(RestartPolicy::default(), bus.clone());
    let emergency = EmergencyMode::new();

    let (s1, s1_handle) = S1Operations::new(bus.clone(), algedonic.clone(), &metrics);
    let (s2, s2_handle) = S2Coordination::new(bus.clone(), algedonic.clone(), &metrics);
    let (s3, s3_handle) = S3Control::new(bus.clone(), algedonic.clone(), &metrics);
    let (s4, s4_handle) = S4Intelligence::new(bus.clone(), None, &metrics);
    let (s5, s5_handle) = S5Policy::new(
        bus.clone(),
        algedonic.clone(),
        Arc::clone(&emergency),
        &metrics,
    );
    supervisor.supervise(s1 as Arc<dyn Supervised>);
    supervisor.supervise(s2 as Arc<dyn Supervised>);
    supervisor.supervise(s3 as Arc<dyn Supervised>);
    supervisor.supervise(s4 as Arc<dyn Supervised>);
    supervisor.supervise(s5 as Arc<dyn Supervised>);

    let channels = vec![
        variety::s1_to_s2(bus.clone(), algedonic.clone(), &metrics),
        variety::s2_to_s3(bus.clone(), algedonic.clone(), &metrics),
        variety::s3_to_s1(bus.clone(), algedonic.clone(), &metrics),
    ];
    let cycle = Duration::from_millis(200);
    let _control = ControlLoop::new(
        ControlLoopConfig {
            cycle,
            emergency_on_start: false,
        },
        supervisor.clone(),
        vec![s1_handle, s2_handle, s3_handle, s4_handle, s5_handle],
        channels,
        emergency,
        bus.clone(),
        algedonic.clone(),
        &metrics,
    );
    sleep(Duration::from_millis(100)).await;

    let mut command_rx = bus.subscribe(
        Topic::S1Operations,
        "loop-observer",
        SubscribeOptions::default(),
    );

    // Oscillating operational variety from one unit; enough samples for S2
    // to see the oscillation and demand damping.
    for i in 0..16 {
        let vsm = VsmEvent::new(
            SubsystemKind::S1,
            VsmEventType::OperationStarted,
            json!({
                "unit": "unit-7",
                "magnitude": if i % 2 == 0 { 1.0 } else { 0.05 },
            }),
            clock.now(),
        );
        bus.publish(Topic::S1Operations, vsm.to_value());
        sleep(Duration::from_millis(10)).await;
    }

    // A command for the originating unit must appear on s1_operations
    // within 3 control cycles.
    let deadline = 3 * cycle + Duration::from_millis(500);
    let found = timeout(deadline, async {
        loop {
            let Some(msg) = command_rx.recv().await else {
                return None;
            };
            for event in msg.into_events() {
                let Some(vsm) = VsmEvent::from_value(&event.data) else {
                    continue;
                };
                if vsm.kind == VsmEventType::ControlCommand
                    && vsm.data["target"] == json!("unit-7")
                {
                    return Some(vsm);
                }
            }
        }
    })
    .await
    .expect("loop must close within 3 control cycles")
    .expect("bus alive");

    assert_eq!(found.subsystem, SubsystemKind::S1);
    supervisor.shutdown();
}
