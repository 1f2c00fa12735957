// Copyright (c) 2024-2025 Viable Systems (viablesystems.io)
// This file is part of the VSM repository.

// You should have received a copy of the MIT License
// along with the VSM repository. If not, see <https://mit-license.org/>.

//! Abstraction over metrics collection. The core never writes to the console;
//! every counter, gauge and histogram it maintains goes through this trait so
//! operators can plug in their exporter of choice. [`NoMetrics`] discards
//! everything; [`InMemoryMetrics`] keeps readable values for tests and health
//! reports.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;

/// A metrics sink. Cloning via `subgroup` namespaces all metric names with a
/// `.`-separated prefix.
pub trait Metrics: Send + Sync {
    fn create_counter(&self, name: String, unit_label: Option<String>) -> Box<dyn Counter>;
    fn create_gauge(&self, name: String, unit_label: Option<String>) -> Box<dyn Gauge>;
    fn create_histogram(&self, name: String, unit_label: Option<String>) -> Box<dyn Histogram>;

    /// A family of counters sharing a name, distinguished by label values.
    fn counter_family(&self, name: String, labels: Vec<String>) -> Box<dyn CounterFamily>;

    fn subgroup(&self, subgroup_name: String) -> Box<dyn Metrics>;
}

pub trait Counter: Send + Sync {
    fn add(&self, amount: usize);

    fn increment(&self) {
        self.add(1);
    }
}

pub trait Gauge: Send + Sync {
    fn set(&self, amount: i64);
    fn update(&self, delta: i64);
}

pub trait Histogram: Send + Sync {
    fn add_point(&self, point: f64);
}

pub trait CounterFamily: Send + Sync {
    fn create(&self, label_values: Vec<String>) -> Box<dyn Counter>;
}

/// Discards all metrics.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoMetrics;

impl NoMetrics {
    pub fn boxed() -> Box<dyn Metrics> {
        Box::new(Self)
    }
}

impl Metrics for NoMetrics {
    fn create_counter(&self, _name: String, _unit_label: Option<String>) -> Box<dyn Counter> {
        Box::new(Self)
    }

    fn create_gauge(&self, _name: String, _unit_label: Option<String>) -> Box<dyn Gauge> {
        Box::new(Self)
    }

    fn create_histogram(&self, _name: String, _unit_label: Option<String>) -> Box<dyn Histogram> {
        Box::new(Self)
    }

    fn counter_family(&self, _name: String, _labels: Vec<String>) -> Box<dyn CounterFamily> {
        Box::new(Self)
    }

    fn subgroup(&self, _subgroup_name: String) -> Box<dyn Metrics> {
        Box::new(Self)
    }
}

impl Counter for NoMetrics {
    fn add(&self, _amount: usize) {}
}

impl Gauge for NoMetrics {
    fn set(&self, _amount: i64) {}
    fn update(&self, _delta: i64) {}
}

impl Histogram for NoMetrics {
    fn add_point(&self, _point: f64) {}
}

impl CounterFamily for NoMetrics {
    fn create(&self, _label_values: Vec<String>) -> Box<dyn Counter> {
        Box::new(Self)
    }
}

#[derive(Debug, Default)]
struct InMemoryState {
    values: Mutex<HashMap<String, Arc<AtomicI64>>>,
    histograms: Mutex<HashMap<String, Vec<f64>>>,
}

/// Metrics kept in process memory, readable by name. Values are stored flat
/// under their fully-prefixed names, e.g. `bus.ordered.flushes`.
#[derive(Clone, Debug, Default)]
pub struct InMemoryMetrics {
    state: Arc<InMemoryState>,
    prefix: String,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn full_name(&self, name: &str) -> String {
        if self.prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}.{}", self.prefix, name)
        }
    }

    fn cell(&self, name: String) -> Arc<AtomicI64> {
        Arc::clone(
            self.state
                .values
                .lock()
                .entry(name)
                .or_insert_with(|| Arc::new(AtomicI64::new(0))),
        )
    }

    /// Read a counter or gauge by its fully-prefixed name. Missing metrics
    /// read as zero, which keeps assertions on "never incremented" cheap.
    pub fn value(&self, name: &str) -> i64 {
        self.state
            .values
            .lock()
            .get(name)
            .map(|cell| cell.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn histogram(&self, name: &str) -> Vec<f64> {
        self.state
            .histograms
            .lock()
            .get(name)
            .cloned()
            .unwrap_or_default()
    }
}

struct InMemoryCounter(Arc<AtomicI64>);

impl Counter for InMemoryCounter {
    fn add(&self, amount: usize) {
        self.0.fetch_add(amount as i64, Ordering::Relaxed);
    }
}

struct InMemoryGauge(Arc<AtomicI64>);

impl Gauge for InMemoryGauge {
    fn set(&self, amount: i64) {
        self.0.store(amount, Ordering::Relaxed);
    }

    fn update(&self, delta: i64) {
        self.0.fetch_add(delta, Ordering::Relaxed);
    }
}

struct InMemoryHistogram {
    state: Arc<InMemoryState>,
    name: String,
}

impl Histogram for InMemoryHistogram {
    fn add_point(&self, point: f64) {
        self.state
            .histograms
            .lock()
            .entry(self.name.clone())
            .or_default()
            .push(point);
    }
}

struct InMemoryCounterFamily {
    metrics: InMemoryMetrics,
    name: String,
}

impl CounterFamily for InMemoryCounterFamily {
    fn create(&self, label_values: Vec<String>) -> Box<dyn Counter> {
        let suffix = label_values.join(".");
        let name = if suffix.is_empty() {
            self.name.clone()
        } else {
            format!("{}.{}", self.name, suffix)
        };
        Box::new(InMemoryCounter(self.metrics.cell(name)))
    }
}

impl Metrics for InMemoryMetrics {
    fn create_counter(&self, name: String, _unit_label: Option<String>) -> Box<dyn Counter> {
        Box::new(InMemoryCounter(self.cell(self.full_name(&name))))
    }

    fn create_gauge(&self, name: String, _unit_label: Option<String>) -> Box<dyn Gauge> {
        Box::new(InMemoryGauge(self.cell(self.full_name(&name))))
    }

    fn create_histogram(&self, name: String, _unit_label: Option<String>) -> Box<dyn Histogram> {
        Box::new(InMemoryHistogram {
            state: Arc::clone(&self.state),
            name: self.full_name(&name),
        })
    }

    fn counter_family(&self, name: String, _labels: Vec<String>) -> Box<dyn CounterFamily> {
        Box::new(InMemoryCounterFamily {
            metrics: self.clone(),
            name: self.full_name(&name),
        })
    }

    fn subgroup(&self, subgroup_name: String) -> Box<dyn Metrics> {
        Box::new(Self {
            state: Arc::clone(&self.state),
            prefix: self.full_name(&subgroup_name),
        })
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_in_memory_counters_and_gauges() {
        let metrics = InMemoryMetrics::new();
        let counter = metrics.create_counter("events".into(), None);
        counter.add(3);
        counter.increment();
        assert_eq!(metrics.value("events"), 4);

        let gauge = metrics.create_gauge("pressure".into(), None);
        gauge.set(10);
        gauge.update(-4);
        assert_eq!(metrics.value("pressure"), 6);
    }

    #[test]
    fn test_subgroups_prefix_names() {
        let metrics = InMemoryMetrics::new();
        let bus = metrics.subgroup("bus".into());
        let ordered = bus.subgroup("ordered".into());
        ordered.create_counter("flushes".into(), None).add(2);
        assert_eq!(metrics.value("bus.ordered.flushes"), 2);
        assert_eq!(metrics.value("flushes"), 0);
    }

    #[test]
    fn test_counter_family_labels() {
        let metrics = InMemoryMetrics::new();
        let family = metrics.counter_family("drops".into(), vec!["topic".into()]);
        family.create(vec!["s1_operations".into()]).add(5);
        assert_eq!(metrics.value("drops.s1_operations"), 5);
    }
}
