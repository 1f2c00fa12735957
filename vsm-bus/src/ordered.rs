// Copyright (c) 2024-2025 Viable Systems (viablesystems.io)
// This file is part of the VSM repository.

// You should have received a copy of the MIT License
// along with the VSM repository. If not, see <https://mit-license.org/>.

//! HLC-ordered delivery. One instance runs per `(topic, subscriber)` pair
//! that opted in: it buffers admitted events in a min-heap keyed by HLC and
//! releases everything older than the buffer window on a timer, in ascending
//! HLC order. High-intensity algedonic events skip the buffer entirely, late
//! events are flushed through without buffering, duplicates are dropped, and
//! a full buffer forces out its oldest half. The window adapts to the
//! observed reorder ratio.

use std::{
    cmp::Reverse,
    collections::HashMap,
    num::NonZeroUsize,
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use lru::LruCache;
use priority_queue::PriorityQueue;
use serde::{Deserialize, Serialize};
use tokio::{
    sync::mpsc::{self, error::TrySendError},
    time::{sleep_until, Instant},
};
use vsm_types::{
    metrics::{Counter, Gauge, Metrics},
    Event, EventId, Hlc, HlcClock, Severity, Topic,
};

use crate::{BusMessage, PainReport};

/// Ids remembered for duplicate suppression, per instance.
const DEDUP_CAPACITY: usize = 8192;

/// Minimum admissions in one adjustment period before the window adapts.
const ADAPT_MIN_SAMPLES: u32 = 16;

/// Reorder ratio above which the window grows.
const REORDER_HIGH: f64 = 0.2;

/// Reorder ratio below which the window shrinks.
const REORDER_LOW: f64 = 0.02;

/// Sustained reorder ratio that jumps the window straight to its maximum.
const REORDER_PANIC: f64 = 0.5;

#[derive(Clone, Debug)]
pub(crate) struct OrderedParams {
    pub topic: Topic,
    pub subscriber: String,
    pub window: Duration,
    pub min_window: Duration,
    pub max_window: Duration,
    pub adaptive: bool,
    pub batch: bool,
    pub grace: Duration,
    pub max_buffer: usize,
    pub bypass_threshold: f64,
    pub snapshot_path: Option<PathBuf>,
}

pub(crate) struct OrderedMetrics {
    pub flushes: Box<dyn Counter>,
    pub dup_dropped: Box<dyn Counter>,
    pub late: Box<dyn Counter>,
    pub bypass: Box<dyn Counter>,
    pub forced_flushes: Box<dyn Counter>,
    pub dropped: Box<dyn Counter>,
    pub window_ms: Box<dyn Gauge>,
}

impl OrderedMetrics {
    pub fn new(metrics: &(impl Metrics + ?Sized)) -> Self {
        Self {
            flushes: metrics.create_counter("flushes".into(), None),
            dup_dropped: metrics.create_counter("dup_dropped".into(), None),
            late: metrics.create_counter("late".into(), None),
            bypass: metrics.create_counter("bypass".into(), None),
            forced_flushes: metrics.create_counter("forced_flushes".into(), None),
            dropped: metrics.create_counter("dropped".into(), None),
            window_ms: metrics.create_gauge("window_ms".into(), None),
        }
    }
}

/// Handle held by the bus. Dropping it closes the input, letting the
/// instance flush its snapshot and exit.
pub(crate) struct OrderedHandle {
    input: mpsc::UnboundedSender<Arc<Event>>,
}

impl OrderedHandle {
    /// Hand an event to the instance. Fails only when the instance has
    /// terminated, which the bus treats as subscriber death.
    pub fn admit(&self, event: Arc<Event>) -> Result<(), ()> {
        self.input.send(event).map_err(|_| ())
    }
}

/// Record of a buffered event in a shutdown snapshot.
#[derive(Serialize, Deserialize)]
struct SnapshotRecord {
    hlc: Hlc,
    topic: Topic,
    bytes: Vec<u8>,
}

pub(crate) fn spawn(
    params: OrderedParams,
    out: mpsc::Sender<BusMessage>,
    clock: Arc<HlcClock>,
    pain: mpsc::UnboundedSender<PainReport>,
    metrics: Arc<OrderedMetrics>,
) -> OrderedHandle {
    let (input_tx, input_rx) = mpsc::unbounded_channel();
    let instance = OrderedDelivery {
        window: params.window,
        params,
        heap: PriorityQueue::new(),
        events: HashMap::new(),
        seen: LruCache::new(NonZeroUsize::new(DEDUP_CAPACITY).expect("nonzero capacity")),
        max_seen: None,
        admissions: 0,
        reorders: 0,
        dead: false,
        out,
        clock,
        pain,
        metrics,
    };
    tokio::spawn(instance.run(input_rx));
    OrderedHandle { input: input_tx }
}

struct OrderedDelivery {
    params: OrderedParams,
    /// Current (possibly adapted) buffer window.
    window: Duration,
    heap: PriorityQueue<EventId, Reverse<Hlc>>,
    events: HashMap<EventId, Arc<Event>>,
    seen: LruCache<EventId, ()>,
    max_seen: Option<Hlc>,
    admissions: u32,
    reorders: u32,
    /// Set once the subscriber mailbox is closed; ends the run loop.
    dead: bool,
    out: mpsc::Sender<BusMessage>,
    clock: Arc<HlcClock>,
    pain: mpsc::UnboundedSender<PainReport>,
    metrics: Arc<OrderedMetrics>,
}

impl OrderedDelivery {
    fn name(&self) -> String {
        format!("ordered/{}/{}", self.params.topic, self.params.subscriber)
    }

    async fn run(mut self, mut input: mpsc::UnboundedReceiver<Arc<Event>>) {
        self.replay_snapshot();
        let mut deadline = Instant::now() + self.window;
        loop {
            tokio::select! {
                maybe = input.recv() => match maybe {
                    Some(event) => self.admit(event),
                    // Input closed: unsubscribed or bus gone.
                    None => break,
                },
                () = sleep_until(deadline) => {
                    self.flush_window();
                    self.adapt();
                    deadline = Instant::now() + self.window;
                },
            }
            if self.dead {
                tracing::debug!(instance = %self.name(), "subscriber gone, terminating");
                return;
            }
        }
        self.write_snapshot();
    }

    fn admit(&mut self, event: Arc<Event>) {
        if self.seen.put(event.id, ()).is_some() {
            self.metrics.dup_dropped.increment();
            return;
        }

        self.admissions += 1;
        if let Some(max_seen) = &self.max_seen {
            if event.hlc < *max_seen {
                self.reorders += 1;
            }
        }
        if self.max_seen.as_ref().map_or(true, |max| event.hlc > *max) {
            self.max_seen = Some(event.hlc.clone());
        }

        // Priority lane: high-intensity algedonic events overtake the buffer.
        if event.is_bypass(self.params.bypass_threshold) {
            self.metrics.bypass.increment();
            self.deliver_now(event);
            return;
        }

        // An event this far behind the window would only hold the buffer
        // hostage; release it untouched.
        let late_cutoff =
            HlcClock::wall_ms() - self.window.as_millis() as i64 - self.params.grace.as_millis() as i64;
        if event.hlc.physical < late_cutoff {
            self.metrics.late.increment();
            self.deliver_now(event);
            return;
        }

        let id = event.id;
        let hlc = event.hlc.clone();
        self.events.insert(id, event);
        self.heap.push(id, Reverse(hlc));

        if self.heap.len() >= self.params.max_buffer {
            self.forced_flush();
        }
    }

    /// Emit everything older than the window, in ascending HLC order.
    fn flush_window(&mut self) {
        let cutoff = HlcClock::wall_ms() - self.window.as_millis() as i64;
        let mut releasing = vec![];
        while let Some((_, Reverse(oldest))) = self.heap.peek() {
            if oldest.physical > cutoff {
                break;
            }
            let (id, _) = self.heap.pop().expect("peeked entry exists");
            if let Some(event) = self.events.remove(&id) {
                releasing.push(event);
            }
        }
        if !releasing.is_empty() {
            self.metrics.flushes.increment();
            self.deliver(releasing);
        }
    }

    /// The buffer hit its size bound: release the oldest half immediately.
    fn forced_flush(&mut self) {
        let count = (self.heap.len() / 2).max(1);
        let mut releasing = Vec::with_capacity(count);
        for _ in 0..count {
            let Some((id, _)) = self.heap.pop() else {
                break;
            };
            if let Some(event) = self.events.remove(&id) {
                releasing.push(event);
            }
        }
        self.metrics.forced_flushes.increment();
        self.pain
            .send(PainReport {
                source: self.name(),
                reason: "buffer_overflow".into(),
                severity: Severity::Medium,
            })
            .ok();
        tracing::warn!(
            instance = %self.name(),
            released = releasing.len(),
            "ordered buffer overflow, forcing partial flush"
        );
        self.deliver(releasing);
    }

    fn deliver_now(&mut self, event: Arc<Event>) {
        self.send(BusMessage::OrderedEvent(event));
    }

    fn deliver(&mut self, events: Vec<Arc<Event>>) {
        if events.is_empty() {
            return;
        }
        if self.params.batch {
            self.send(BusMessage::OrderedBatch(events));
        } else {
            for event in events {
                if self.dead {
                    // At-most-once: remaining events are dropped, counted.
                    self.metrics.dropped.increment();
                    continue;
                }
                self.send(BusMessage::OrderedEvent(event));
            }
        }
    }

    fn send(&mut self, message: BusMessage) {
        match self.out.try_send(message) {
            Ok(()) => {},
            Err(TrySendError::Full(_)) => {
                // Never block the instance on a slow subscriber.
                self.metrics.dropped.increment();
                tracing::warn!(instance = %self.name(), "mailbox full, dropping ordered delivery");
            },
            Err(TrySendError::Closed(_)) => {
                self.metrics.dropped.increment();
                self.dead = true;
            },
        }
    }

    /// Adjust the window from the reorder ratio observed since the last
    /// adjustment.
    fn adapt(&mut self) {
        if !self.params.adaptive || self.admissions < ADAPT_MIN_SAMPLES {
            return;
        }
        let ratio = f64::from(self.reorders) / f64::from(self.admissions);
        let current = self.window.as_secs_f64();
        let next = if ratio > REORDER_PANIC {
            self.params.max_window.as_secs_f64()
        } else if ratio > REORDER_HIGH {
            current * 1.25
        } else if ratio < REORDER_LOW {
            current * 0.8
        } else {
            current
        };
        let next = next.clamp(
            self.params.min_window.as_secs_f64(),
            self.params.max_window.as_secs_f64(),
        );
        if next != current {
            tracing::debug!(
                instance = %self.name(),
                reorder_ratio = ratio,
                window_ms = next * 1000.0,
                "adapting order window"
            );
            self.window = Duration::from_secs_f64(next);
        }
        self.metrics.window_ms.set(self.window.as_millis() as i64);
        self.admissions = 0;
        self.reorders = 0;
    }

    /// Write any still-buffered events to the snapshot file on graceful
    /// shutdown.
    fn write_snapshot(&mut self) {
        let Some(path) = self.params.snapshot_path.clone() else {
            return;
        };
        let mut records = vec![];
        while let Some((id, _)) = self.heap.pop() {
            let Some(event) = self.events.remove(&id) else {
                continue;
            };
            let Ok(bytes) = serde_json::to_vec(&*event) else {
                continue;
            };
            records.push(SnapshotRecord {
                hlc: event.hlc.clone(),
                topic: event.topic.clone(),
                bytes,
            });
        }
        if records.is_empty() {
            return;
        }
        match bincode::serialize(&records) {
            Ok(encoded) => {
                if let Err(err) = std::fs::write(&path, encoded) {
                    tracing::warn!(instance = %self.name(), %err, "failed to write snapshot");
                } else {
                    tracing::info!(
                        instance = %self.name(),
                        events = records.len(),
                        path = %path.display(),
                        "wrote ordered-delivery snapshot"
                    );
                }
            },
            Err(err) => {
                tracing::warn!(instance = %self.name(), %err, "failed to encode snapshot");
            },
        }
    }

    /// Replay a snapshot left by a previous instance into the buffer, then
    /// consume the file.
    fn replay_snapshot(&mut self) {
        let Some(path) = self.params.snapshot_path.clone() else {
            return;
        };
        let Ok(bytes) = std::fs::read(&path) else {
            return;
        };
        let records: Vec<SnapshotRecord> = match bincode::deserialize(&bytes) {
            Ok(records) => records,
            Err(err) => {
                tracing::warn!(instance = %self.name(), %err, "discarding unreadable snapshot");
                std::fs::remove_file(&path).ok();
                return;
            },
        };
        let mut replayed = 0usize;
        for record in records {
            if let Ok(event) = serde_json::from_slice::<Event>(&record.bytes) {
                self.admit(Arc::new(event));
                replayed += 1;
            }
        }
        std::fs::remove_file(&path).ok();
        tracing::info!(instance = %self.name(), replayed, "replayed ordered-delivery snapshot");
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tokio::time::timeout;
    use vsm_types::{metrics::InMemoryMetrics, EventMetadata, HlcClock};
    use vsm_utils::test_utils::setup_test;

    use super::*;
    use crate::{BusConfig, EventBus, SubscribeOptions};

    fn make_bus() -> (EventBus, InMemoryMetrics, Arc<HlcClock>) {
        let metrics = InMemoryMetrics::new();
        let clock = Arc::new(HlcClock::new("test-node"));
        let bus = EventBus::new(Arc::clone(&clock), BusConfig::default(), &metrics);
        (bus, metrics, clock)
    }

    fn stamped_event(clock: &HlcClock, n: i64) -> Event {
        Event::new(Topic::S1Operations, json!({ "n": n }), clock.now())
    }

    #[tokio::test]
    async fn test_shuffled_input_comes_out_in_hlc_order() {
        setup_test();
        let (bus, _, clock) = make_bus();
        let mut rx = bus.subscribe(
            Topic::S1Operations,
            "sub",
            SubscribeOptions::ordered_with_window(Duration::from_millis(100)).with_batch(),
        );

        let e1 = stamped_event(&clock, 1);
        let e2 = stamped_event(&clock, 2);
        let e3 = stamped_event(&clock, 3);
        assert!(e1.hlc < e2.hlc && e2.hlc < e3.hlc);

        // Submit out of order.
        for event in [&e3, &e1, &e2] {
            bus.publish_event(event.clone());
        }

        let msg = timeout(Duration::from_millis(500), rx.recv())
            .await
            .expect("flush within window")
            .expect("bus alive");
        let events = msg.into_events();
        let ns: Vec<_> = events.iter().map(|e| e.data["n"].as_i64().unwrap()).collect();
        assert_eq!(ns, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_duplicates_are_suppressed() {
        setup_test();
        let (bus, metrics, clock) = make_bus();
        let mut rx = bus.subscribe(
            Topic::S1Operations,
            "sub",
            SubscribeOptions::ordered_with_window(Duration::from_millis(50)),
        );
        let event = stamped_event(&clock, 1);
        bus.publish_event(event.clone());
        bus.publish_event(event.clone());

        let first = timeout(Duration::from_millis(500), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.into_events()[0].id, event.id);
        // No second delivery.
        assert!(
            timeout(Duration::from_millis(150), rx.recv()).await.is_err(),
            "duplicate must not be delivered"
        );
        assert_eq!(metrics.value("bus.ordered.dup_dropped"), 1);
    }

    #[tokio::test]
    async fn test_bypass_overtakes_buffered_events() {
        setup_test();
        let (bus, metrics, clock) = make_bus();
        let mut rx = bus.subscribe(
            Topic::AlgedonicPain,
            "sub",
            SubscribeOptions::ordered_with_window(Duration::from_millis(100)),
        );

        let normal = Event::new(Topic::AlgedonicPain, json!({"kind": "normal"}), clock.now());
        bus.publish_event(normal.clone());

        let bypass = Event::new(Topic::AlgedonicPain, json!({"kind": "bypass"}), clock.now())
            .with_metadata(
                EventMetadata::algedonic("monitor", Severity::Critical).with_intensity(0.99),
            );
        bus.publish_event(bypass.clone());

        // The bypass event arrives first despite the older HLC of `normal`.
        let first = timeout(Duration::from_millis(50), rx.recv())
            .await
            .expect("bypass must not wait for the window")
            .unwrap();
        assert_eq!(first.into_events()[0].id, bypass.id);

        let second = timeout(Duration::from_millis(500), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.into_events()[0].id, normal.id);
        assert_eq!(metrics.value("bus.ordered.bypass"), 1);
    }

    #[tokio::test]
    async fn test_late_event_flushes_through_immediately() {
        setup_test();
        let (bus, metrics, _clock) = make_bus();
        let mut rx = bus.subscribe(
            Topic::S1Operations,
            "sub",
            SubscribeOptions::ordered_with_window(Duration::from_millis(50)),
        );
        // An event stamped far in the past, beyond window + grace.
        let stale = Event::new(
            Topic::S1Operations,
            json!({"stale": true}),
            Hlc::new(HlcClock::wall_ms() - 10_000, 0, "elsewhere"),
        );
        bus.publish_event(stale.clone());
        let msg = timeout(Duration::from_millis(40), rx.recv())
            .await
            .expect("late events skip the buffer")
            .unwrap();
        assert_eq!(msg.into_events()[0].id, stale.id);
        assert_eq!(metrics.value("bus.ordered.late"), 1);
    }

    #[tokio::test]
    async fn test_overflow_forces_partial_flush_and_pain() {
        setup_test();
        let metrics = InMemoryMetrics::new();
        let clock = Arc::new(HlcClock::new("test-node"));
        let bus = EventBus::new(
            Arc::clone(&clock),
            BusConfig {
                order_max_buffer: 10,
                ..BusConfig::default()
            },
            &metrics,
        );
        let mut pain_rx = bus.subscribe(Topic::AlgedonicPain, "pain", SubscribeOptions::default());
        let mut rx = bus.subscribe(
            Topic::S1Operations,
            "sub",
            // A wide window so nothing flushes on time during the test.
            SubscribeOptions::ordered_with_window(Duration::from_secs(5)),
        );

        for n in 0..10 {
            bus.publish_event(stamped_event(&clock, n));
        }

        // Oldest half arrives without waiting for the window.
        let mut released = vec![];
        while released.len() < 5 {
            let msg = timeout(Duration::from_millis(500), rx.recv())
                .await
                .expect("forced flush releases events")
                .unwrap();
            released.extend(msg.into_events());
        }
        let ns: Vec<_> = released.iter().map(|e| e.data["n"].as_i64().unwrap()).collect();
        assert_eq!(ns, vec![0, 1, 2, 3, 4]);
        assert_eq!(metrics.value("bus.ordered.forced_flushes"), 1);

        // Overflow raised pain on the bus.
        let pain = timeout(Duration::from_millis(500), pain_rx.recv())
            .await
            .expect("overflow emits pain")
            .unwrap();
        let pain = &pain.into_events()[0];
        assert_eq!(pain.metadata.reason.as_deref(), Some("buffer_overflow"));
    }

    #[tokio::test]
    async fn test_snapshot_round_trip() {
        setup_test();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ordered.snapshot");
        let (bus, _, clock) = make_bus();

        let opts = SubscribeOptions {
            window: Duration::from_secs(5),
            adaptive_window: false,
            ..SubscribeOptions::ordered()
        }
        .with_snapshot(path.clone());

        let rx = bus.subscribe(Topic::S1Operations, "sub", opts.clone());
        let event = stamped_event(&clock, 42);
        bus.publish_event(event.clone());
        // Give the instance a beat to admit before unsubscribing.
        tokio::time::sleep(Duration::from_millis(50)).await;
        bus.unsubscribe(&Topic::S1Operations, "sub");
        drop(rx);
        // Wait for the instance to write its snapshot.
        for _ in 0..50 {
            if path.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(path.exists(), "snapshot written on graceful shutdown");

        // A fresh subscription replays the snapshot; the event was stamped
        // long enough ago by now that it flushes as late or on the first
        // window.
        let mut rx = bus.subscribe(
            Topic::S1Operations,
            "sub",
            SubscribeOptions::ordered_with_window(Duration::from_millis(20))
                .with_snapshot(path.clone()),
        );
        let msg = timeout(Duration::from_millis(500), rx.recv())
            .await
            .expect("replayed event delivered")
            .unwrap();
        assert_eq!(msg.into_events()[0].id, event.id);
        assert!(!path.exists(), "snapshot consumed on replay");
    }
}
