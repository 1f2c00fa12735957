// Copyright (c) 2024-2025 Viable Systems (viablesystems.io)
// This file is part of the VSM repository.

// You should have received a copy of the MIT License
// along with the VSM repository. If not, see <https://mit-license.org/>.

//! The in-process event bus. Publishers stamp events with the node's HLC and
//! hand them to every subscriber of the topic. Subscribers either get events
//! immediately in publish order, or opt into HLC-ordered delivery backed by a
//! per-subscription buffer task (see [`ordered`]). Publishing never blocks:
//! a full mailbox drops the event for that subscriber and counts the loss, a
//! closed mailbox removes the subscriber and everything it subscribed to.

pub mod algedonic;
pub mod ordered;

use std::{collections::HashMap, path::PathBuf, sync::Arc, time::Duration};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::{
    sync::mpsc::{self, error::TrySendError},
    task::JoinHandle,
};
use vsm_types::{
    metrics::{Counter, Gauge, Metrics},
    CoreOptions, Event, EventMetadata, HlcClock, Severity, Topic,
};

use crate::ordered::{OrderedHandle, OrderedParams};

pub use crate::algedonic::{AlgedonicChannel, EmergencyTarget};

/// What a subscriber receives in its mailbox.
#[derive(Clone, Debug)]
pub enum BusMessage {
    /// Immediate delivery, publish order.
    Event(Arc<Event>),
    /// One event released from an ordered buffer (or bypassing it).
    OrderedEvent(Arc<Event>),
    /// A whole flush cycle released as one batch, HLC ascending.
    OrderedBatch(Vec<Arc<Event>>),
}

impl BusMessage {
    /// Flatten into the carried events, batch or not.
    pub fn into_events(self) -> Vec<Arc<Event>> {
        match self {
            Self::Event(event) | Self::OrderedEvent(event) => vec![event],
            Self::OrderedBatch(events) => events,
        }
    }
}

/// Per-subscription delivery options.
#[derive(Clone, Debug)]
pub struct SubscribeOptions {
    pub ordered: bool,
    /// Initial buffer window for ordered delivery.
    pub window: Duration,
    /// Deliver each flush cycle as a single [`BusMessage::OrderedBatch`].
    pub batch: bool,
    pub adaptive_window: bool,
    pub min_window: Duration,
    pub max_window: Duration,
    /// Capacity of the subscriber mailbox.
    pub mailbox_capacity: usize,
    /// If set, the ordered buffer is snapshotted here on graceful shutdown
    /// and replayed on the next subscribe.
    pub snapshot_path: Option<PathBuf>,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            ordered: false,
            window: Duration::from_millis(50),
            batch: false,
            adaptive_window: true,
            min_window: Duration::from_millis(10),
            max_window: Duration::from_millis(500),
            mailbox_capacity: 256,
            snapshot_path: None,
        }
    }
}

impl SubscribeOptions {
    pub fn ordered() -> Self {
        Self {
            ordered: true,
            ..Self::default()
        }
    }

    pub fn ordered_with_window(window: Duration) -> Self {
        Self {
            ordered: true,
            window,
            adaptive_window: false,
            ..Self::default()
        }
    }

    pub fn with_batch(mut self) -> Self {
        self.batch = true;
        self
    }

    pub fn with_snapshot(mut self, path: PathBuf) -> Self {
        self.snapshot_path = Some(path);
        self
    }
}

/// Bus-wide tunables shared by all ordered subscriptions.
#[derive(Clone, Debug)]
pub struct BusConfig {
    pub bypass_threshold: f64,
    pub order_grace: Duration,
    pub order_max_buffer: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            bypass_threshold: vsm_types::event::BYPASS_THRESHOLD,
            order_grace: Duration::from_millis(50),
            order_max_buffer: 1000,
        }
    }
}

impl From<&CoreOptions> for BusConfig {
    fn from(opt: &CoreOptions) -> Self {
        Self {
            bypass_threshold: opt.bypass_threshold,
            order_grace: opt.order_grace(),
            order_max_buffer: opt.order_max_buffer,
        }
    }
}

/// A pain signal raised from inside the delivery machinery (overflow, drops).
/// Pumped onto the `algedonic_pain` topic by a background task so the raising
/// component never blocks on the bus.
#[derive(Clone, Debug)]
pub struct PainReport {
    pub source: String,
    pub reason: String,
    pub severity: Severity,
}

/// A row of the subscription registry, as reported by
/// [`EventBus::subscriptions`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubscriptionInfo {
    pub topic: Topic,
    pub subscriber: String,
    pub ordered: bool,
}

enum Delivery {
    Immediate(mpsc::Sender<BusMessage>),
    Ordered(OrderedHandle),
}

struct SubscriberEntry {
    delivery: Delivery,
}

struct BusMetrics {
    published: Box<dyn Counter>,
    delivered: Box<dyn Counter>,
    dropped: Box<dyn Counter>,
    subscribers_lost: Box<dyn Counter>,
    subscriptions: Box<dyn Gauge>,
}

impl BusMetrics {
    fn new(metrics: &(impl Metrics + ?Sized)) -> Self {
        Self {
            published: metrics.create_counter("events_published".into(), None),
            delivered: metrics.create_counter("events_delivered".into(), None),
            dropped: metrics.create_counter("events_dropped".into(), None),
            subscribers_lost: metrics.create_counter("subscribers_lost".into(), None),
            subscriptions: metrics.create_gauge("subscriptions".into(), None),
        }
    }
}

struct BusInner {
    clock: Arc<HlcClock>,
    config: BusConfig,
    topics: DashMap<Topic, HashMap<String, SubscriberEntry>>,
    metrics: BusMetrics,
    ordered_metrics: Arc<ordered::OrderedMetrics>,
    pain_tx: mpsc::UnboundedSender<PainReport>,
    pain_task: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for BusInner {
    fn drop(&mut self) {
        if let Some(task) = self.pain_task.get_mut().take() {
            task.abort();
        }
    }
}

/// Cheaply clonable handle to the bus.
#[derive(Clone)]
pub struct EventBus(Arc<BusInner>);

impl EventBus {
    /// Create a bus. Must run inside a tokio runtime: ordered subscriptions
    /// and the internal pain pump are spawned tasks.
    pub fn new(
        clock: Arc<HlcClock>,
        config: BusConfig,
        metrics: &(impl Metrics + ?Sized),
    ) -> Self {
        let bus_metrics = metrics.subgroup("bus".into());
        let (pain_tx, pain_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(BusInner {
            clock,
            config,
            topics: DashMap::new(),
            metrics: BusMetrics::new(&*bus_metrics),
            ordered_metrics: Arc::new(ordered::OrderedMetrics::new(
                &*bus_metrics.subgroup("ordered".into()),
            )),
            pain_tx,
            pain_task: Mutex::new(None),
        });
        let task = tokio::spawn(Self::pain_pump(Arc::downgrade(&inner), pain_rx));
        *inner.pain_task.lock() = Some(task);
        Self(inner)
    }

    pub fn clock(&self) -> &Arc<HlcClock> {
        &self.0.clock
    }

    pub fn config(&self) -> &BusConfig {
        &self.0.config
    }

    /// Sender used by delivery components to raise pain without re-entering
    /// the bus.
    pub(crate) fn pain_sender(&self) -> mpsc::UnboundedSender<PainReport> {
        self.0.pain_tx.clone()
    }

    /// Raise a pain report onto the `algedonic_pain` topic asynchronously.
    pub fn report_pain(&self, report: PainReport) {
        // The pump only dies with the bus itself; a send failure means we are
        // shutting down and the report can be dropped.
        self.0.pain_tx.send(report).ok();
    }

    /// Stamp and publish an event. Never blocks; returns the stamped event.
    pub fn publish(&self, topic: Topic, data: serde_json::Value) -> Event {
        self.publish_with_metadata(topic, data, EventMetadata::default())
    }

    pub fn publish_with_metadata(
        &self,
        topic: Topic,
        data: serde_json::Value,
        metadata: EventMetadata,
    ) -> Event {
        let hlc = self.0.clock.now();
        let event = Event::new(topic, data, hlc).with_metadata(metadata);
        self.publish_event(event.clone());
        event
    }

    /// Publish a pre-stamped event, e.g. one replicated from a peer node
    /// whose original HLC must survive.
    pub fn publish_event(&self, event: Event) {
        self.0.metrics.published.increment();
        self.0.route(Arc::new(event));
    }

    /// Register a subscriber mailbox for a topic. A second subscription under
    /// the same `(topic, subscriber)` replaces the first. Returns the
    /// receiving end of the mailbox; dropping it counts as subscriber death
    /// and removes the subscription on the next delivery attempt.
    pub fn subscribe(
        &self,
        topic: Topic,
        subscriber: impl Into<String>,
        opts: SubscribeOptions,
    ) -> mpsc::Receiver<BusMessage> {
        let subscriber = subscriber.into();
        let (tx, rx) = mpsc::channel(opts.mailbox_capacity);
        let delivery = if opts.ordered {
            let params = OrderedParams {
                topic: topic.clone(),
                subscriber: subscriber.clone(),
                window: opts.window,
                min_window: opts.min_window,
                max_window: opts.max_window,
                adaptive: opts.adaptive_window,
                batch: opts.batch,
                grace: self.0.config.order_grace,
                max_buffer: self.0.config.order_max_buffer,
                bypass_threshold: self.0.config.bypass_threshold,
                snapshot_path: opts.snapshot_path,
            };
            Delivery::Ordered(ordered::spawn(
                params,
                tx,
                Arc::clone(&self.0.clock),
                self.pain_sender(),
                Arc::clone(&self.0.ordered_metrics),
            ))
        } else {
            Delivery::Immediate(tx)
        };

        let mut subs = self.0.topics.entry(topic).or_default();
        subs.insert(subscriber, SubscriberEntry { delivery });
        self.0.metrics.subscriptions.update(1);
        rx
    }

    /// Remove one subscription. Ordered instances shut down gracefully
    /// (snapshotting if configured).
    pub fn unsubscribe(&self, topic: &Topic, subscriber: &str) {
        if let Some(mut subs) = self.0.topics.get_mut(topic) {
            if subs.remove(subscriber).is_some() {
                self.0.metrics.subscriptions.update(-1);
            }
        }
    }

    /// Remove every subscription held by a subscriber.
    pub fn unsubscribe_all(&self, subscriber: &str) {
        for mut entry in self.0.topics.iter_mut() {
            if entry.value_mut().remove(subscriber).is_some() {
                self.0.metrics.subscriptions.update(-1);
            }
        }
    }

    pub fn subscriptions(&self) -> Vec<SubscriptionInfo> {
        let mut out = vec![];
        for entry in self.0.topics.iter() {
            for (subscriber, sub) in entry.value() {
                out.push(SubscriptionInfo {
                    topic: entry.key().clone(),
                    subscriber: subscriber.clone(),
                    ordered: matches!(sub.delivery, Delivery::Ordered(_)),
                });
            }
        }
        out
    }

    pub fn topic_subscriber_count(&self, topic: &Topic) -> usize {
        self.0.topics.get(topic).map(|s| s.len()).unwrap_or(0)
    }

    async fn pain_pump(
        bus: std::sync::Weak<BusInner>,
        mut rx: mpsc::UnboundedReceiver<PainReport>,
    ) {
        while let Some(report) = rx.recv().await {
            let Some(inner) = bus.upgrade() else {
                return;
            };
            let hlc = inner.clock.now();
            let data = serde_json::json!({
                "source": report.source,
                "reason": report.reason,
                "severity": report.severity.as_str(),
            });
            let metadata = EventMetadata::algedonic(report.source.clone(), report.severity)
                .with_reason(report.reason.clone());
            let event = Event::new(Topic::AlgedonicPain, data, hlc).with_metadata(metadata);
            inner.metrics.published.increment();
            inner.route(Arc::new(event));
        }
    }
}

impl BusInner {
    fn route(&self, event: Arc<Event>) {
        let Some(mut subs) = self.topics.get_mut(&event.topic) else {
            return;
        };
        let mut dead = vec![];
        for (subscriber, entry) in subs.iter() {
            match &entry.delivery {
                Delivery::Immediate(tx) => {
                    match tx.try_send(BusMessage::Event(Arc::clone(&event))) {
                        Ok(()) => self.metrics.delivered.increment(),
                        Err(TrySendError::Full(_)) => {
                            self.metrics.dropped.increment();
                            tracing::warn!(
                                topic = %event.topic,
                                subscriber,
                                "subscriber mailbox full, dropping event"
                            );
                        },
                        Err(TrySendError::Closed(_)) => dead.push(subscriber.clone()),
                    }
                },
                Delivery::Ordered(handle) => {
                    if handle.admit(Arc::clone(&event)).is_err() {
                        dead.push(subscriber.clone());
                    }
                },
            }
        }
        for subscriber in dead {
            subs.remove(&subscriber);
            self.metrics.subscribers_lost.increment();
            self.metrics.subscriptions.update(-1);
            tracing::debug!(topic = %event.topic, subscriber, "removed dead subscriber");
        }
    }
}
