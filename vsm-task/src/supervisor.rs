// Copyright (c) 2024-2025 Viable Systems (viablesystems.io)
// This file is part of the VSM repository.

// You should have received a copy of the MIT License
// along with the VSM repository. If not, see <https://mit-license.org/>.

//! One-for-one supervision. Every registered service gets its own monitor:
//! when the service's task dies, only that service restarts, up to the
//! restart intensity bound. Exceeding the bound marks the service failed and
//! publishes a critical viability threat instead of looping forever.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Weak},
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::{
    sync::watch,
    task::{AbortHandle, JoinHandle},
    time::{timeout, Instant},
};
use vsm_bus::EventBus;
use vsm_types::{CoreResult, SubsystemStatus, Topic};

/// Pause between a crash and the restart, so a hot-crashing service does not
/// spin the scheduler.
const RESTART_BACKOFF: Duration = Duration::from_millis(100);

/// Timeout applied to child status probes in [`Supervisor::health_check`].
const STATUS_TIMEOUT: Duration = Duration::from_secs(5);

/// A long-lived service the supervisor can run and probe.
#[async_trait]
pub trait Supervised: Send + Sync + 'static {
    fn name(&self) -> String;

    /// The service body. Runs until graceful shutdown (watch flips to true,
    /// return `Ok`) or a crash (`Err`, or a panic, which the supervisor
    /// observes as a join error).
    async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> CoreResult<()>;

    /// Liveness probe. Implementations should answer from shared state, not
    /// from inside the run loop.
    async fn status(&self) -> SubsystemStatus {
        SubsystemStatus::Healthy
    }
}

#[derive(Clone, Copy, Debug)]
pub struct RestartPolicy {
    pub max_restarts: u32,
    pub window: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_restarts: 5,
            window: Duration::from_secs(60),
        }
    }
}

struct ChildState {
    service: Arc<dyn Supervised>,
    restarts: VecDeque<Instant>,
    status: SubsystemStatus,
    running: Option<AbortHandle>,
    monitor: Option<JoinHandle<()>>,
}

struct SupervisorInner {
    policy: RestartPolicy,
    children: Mutex<HashMap<String, ChildState>>,
    shutdown_tx: watch::Sender<bool>,
    bus: EventBus,
}

impl Drop for SupervisorInner {
    fn drop(&mut self) {
        for child in self.children.get_mut().values_mut() {
            if let Some(running) = child.running.take() {
                running.abort();
            }
            if let Some(monitor) = child.monitor.take() {
                monitor.abort();
            }
        }
    }
}

#[derive(Clone)]
pub struct Supervisor(Arc<SupervisorInner>);

impl Supervisor {
    pub fn new(policy: RestartPolicy, bus: EventBus) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self(Arc::new(SupervisorInner {
            policy,
            children: Mutex::new(HashMap::new()),
            shutdown_tx,
            bus,
        }))
    }

    /// Register a service under its own name and start it.
    pub fn supervise(&self, service: Arc<dyn Supervised>) {
        let name = service.name();
        {
            let mut children = self.0.children.lock();
            children.insert(
                name.clone(),
                ChildState {
                    service,
                    restarts: VecDeque::new(),
                    status: SubsystemStatus::Starting,
                    running: None,
                    monitor: None,
                },
            );
        }
        let monitor = tokio::spawn(Self::monitor(Arc::downgrade(&self.0), name.clone()));
        if let Some(child) = self.0.children.lock().get_mut(&name) {
            child.monitor = Some(monitor);
        }
    }

    /// Kill and restart one subsystem; its siblings are untouched.
    pub fn restart_subsystem(&self, name: &str) {
        let mut children = self.0.children.lock();
        if let Some(child) = children.get_mut(name) {
            tracing::info!(subsystem = %name, "manual restart requested");
            if let Some(running) = child.running.take() {
                running.abort();
            }
        }
    }

    /// Probe all children. A child that gave up restarting, or whose probe
    /// errors out or times out, reports failed.
    pub async fn health_check(&self) -> HashMap<String, SubsystemStatus> {
        let probes: Vec<(String, SubsystemStatus, Arc<dyn Supervised>)> = {
            let children = self.0.children.lock();
            children
                .iter()
                .map(|(name, child)| {
                    (name.clone(), child.status, Arc::clone(&child.service))
                })
                .collect()
        };

        let mut report = HashMap::new();
        for (name, tracked, service) in probes {
            let status = if tracked.is_failed() {
                SubsystemStatus::Failed
            } else {
                match timeout(STATUS_TIMEOUT, service.status()).await {
                    Ok(status) => status,
                    Err(_) => SubsystemStatus::Failed,
                }
            };
            report.insert(name, status);
        }
        report
    }

    pub fn status_of(&self, name: &str) -> Option<SubsystemStatus> {
        self.0.children.lock().get(name).map(|c| c.status)
    }

    pub fn names(&self) -> Vec<String> {
        self.0.children.lock().keys().cloned().collect()
    }

    /// Flip the shared shutdown flag; services exit their run loops
    /// gracefully and monitors stand down.
    pub fn shutdown(&self) {
        self.0.shutdown_tx.send_replace(true);
    }

    /// Count of restarts of a child inside the current intensity window.
    pub fn recent_restarts(&self, name: &str) -> u32 {
        self.0
            .children
            .lock()
            .get(name)
            .map(|c| c.restarts.len() as u32)
            .unwrap_or(0)
    }

    async fn monitor(inner: Weak<SupervisorInner>, name: String) {
        loop {
            // Launch (or relaunch) the service.
            let (mut shutdown_rx, handle) = {
                let Some(inner) = inner.upgrade() else {
                    return;
                };
                let shutdown_rx = inner.shutdown_tx.subscribe();
                let mut children = inner.children.lock();
                let Some(child) = children.get_mut(&name) else {
                    return;
                };
                let service = Arc::clone(&child.service);
                let handle = tokio::spawn(service.run(shutdown_rx.clone()));
                child.running = Some(handle.abort_handle());
                child.status = SubsystemStatus::Healthy;
                (shutdown_rx, handle)
            };

            let outcome = handle.await;
            let Some(inner) = inner.upgrade() else {
                return;
            };
            if *inner.shutdown_tx.borrow() {
                return;
            }

            match outcome {
                Ok(Ok(())) => {
                    // Graceful exit outside of shutdown: treat as done.
                    let mut children = inner.children.lock();
                    if let Some(child) = children.get_mut(&name) {
                        child.status = SubsystemStatus::Failed;
                        child.running = None;
                    }
                    tracing::info!(subsystem = %name, "service exited");
                    return;
                },
                Ok(Err(err)) => {
                    tracing::warn!(subsystem = %name, %err, "service crashed");
                },
                Err(join_err) if join_err.is_cancelled() => {
                    tracing::info!(subsystem = %name, "service aborted, restarting");
                },
                Err(join_err) => {
                    tracing::error!(subsystem = %name, %join_err, "service panicked");
                },
            }

            // Restart intensity bookkeeping.
            let gave_up = {
                let mut children = inner.children.lock();
                let Some(child) = children.get_mut(&name) else {
                    return;
                };
                let now = Instant::now();
                child
                    .restarts
                    .retain(|at| now.duration_since(*at) <= inner.policy.window);
                child.restarts.push_back(now);
                if child.restarts.len() as u32 > inner.policy.max_restarts {
                    child.status = SubsystemStatus::Failed;
                    child.running = None;
                    true
                } else {
                    child.status = SubsystemStatus::Restarting;
                    false
                }
            };

            if gave_up {
                tracing::error!(
                    subsystem = %name,
                    max = inner.policy.max_restarts,
                    "restart intensity exceeded, giving up"
                );
                inner.bus.publish(
                    Topic::VsmViabilityThreat,
                    serde_json::json!({
                        "subsystem": name,
                        "reason": "restart_intensity_exceeded",
                        "severity": "critical",
                    }),
                );
                return;
            }

            // Wait out the backoff, but leave immediately on shutdown.
            drop(inner);
            let backoff = tokio::time::sleep(RESTART_BACKOFF);
            tokio::select! {
                () = backoff => {},
                _ = shutdown_rx.changed() => return,
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicU32, Ordering};

    use pretty_assertions::assert_eq;
    use vsm_bus::{BusConfig, SubscribeOptions};
    use vsm_types::{metrics::InMemoryMetrics, CoreError, HlcClock};
    use vsm_utils::test_utils::setup_test;

    use super::*;

    fn make_bus() -> EventBus {
        let clock = Arc::new(HlcClock::new("test-node"));
        EventBus::new(clock, BusConfig::default(), &InMemoryMetrics::new())
    }

    /// Crashes `crashes` times, then runs until shutdown.
    struct Flaky {
        name: String,
        crashes: AtomicU32,
        runs: AtomicU32,
    }

    #[async_trait]
    impl Supervised for Flaky {
        fn name(&self) -> String {
            self.name.clone()
        }

        async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> CoreResult<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.crashes.load(Ordering::SeqCst) > 0 {
                self.crashes.fetch_sub(1, Ordering::SeqCst);
                return Err(CoreError::Internal("flaky crash".into()));
            }
            loop {
                if shutdown.changed().await.is_err() || *shutdown.borrow() {
                    return Ok(());
                }
            }
        }
    }

    #[tokio::test]
    async fn test_crashed_service_is_restarted() {
        setup_test();
        let supervisor = Supervisor::new(RestartPolicy::default(), make_bus());
        let flaky = Arc::new(Flaky {
            name: "s2".into(),
            crashes: AtomicU32::new(2),
            runs: AtomicU32::new(0),
        });
        supervisor.supervise(Arc::clone(&flaky) as Arc<dyn Supervised>);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(flaky.runs.load(Ordering::SeqCst), 3, "two crashes, three runs");
        assert_eq!(
            supervisor.status_of("s2"),
            Some(SubsystemStatus::Healthy)
        );
        supervisor.shutdown();
    }

    #[tokio::test]
    async fn test_one_for_one_isolation() {
        setup_test();
        let supervisor = Supervisor::new(RestartPolicy::default(), make_bus());
        let stable = Arc::new(Flaky {
            name: "s1".into(),
            crashes: AtomicU32::new(0),
            runs: AtomicU32::new(0),
        });
        let flaky = Arc::new(Flaky {
            name: "s2".into(),
            crashes: AtomicU32::new(3),
            runs: AtomicU32::new(0),
        });
        supervisor.supervise(Arc::clone(&stable) as Arc<dyn Supervised>);
        supervisor.supervise(Arc::clone(&flaky) as Arc<dyn Supervised>);

        tokio::time::sleep(Duration::from_millis(600)).await;
        // The death of s2 never restarted s1.
        assert_eq!(stable.runs.load(Ordering::SeqCst), 1);
        assert!(flaky.runs.load(Ordering::SeqCst) >= 3);
        supervisor.shutdown();
    }

    #[tokio::test]
    async fn test_restart_intensity_bound_escalates() {
        setup_test();
        let bus = make_bus();
        let mut threat_rx = bus.subscribe(
            Topic::VsmViabilityThreat,
            "observer",
            SubscribeOptions::default(),
        );
        let supervisor = Supervisor::new(
            RestartPolicy {
                max_restarts: 2,
                window: Duration::from_secs(60),
            },
            bus,
        );
        let hopeless = Arc::new(Flaky {
            name: "s3".into(),
            crashes: AtomicU32::new(u32::MAX),
            runs: AtomicU32::new(0),
        });
        supervisor.supervise(Arc::clone(&hopeless) as Arc<dyn Supervised>);

        tokio::time::sleep(Duration::from_millis(800)).await;
        assert_eq!(supervisor.status_of("s3"), Some(SubsystemStatus::Failed));
        // Bound: initial run + max_restarts relaunches, nothing more.
        assert_eq!(hopeless.runs.load(Ordering::SeqCst), 3);

        let msg = tokio::time::timeout(Duration::from_millis(500), threat_rx.recv())
            .await
            .expect("escalation publishes a viability threat")
            .unwrap();
        let event = &msg.into_events()[0];
        assert_eq!(event.data["reason"], "restart_intensity_exceeded");
        supervisor.shutdown();
    }

    #[tokio::test]
    async fn test_manual_restart() {
        setup_test();
        let supervisor = Supervisor::new(RestartPolicy::default(), make_bus());
        let service = Arc::new(Flaky {
            name: "s4".into(),
            crashes: AtomicU32::new(0),
            runs: AtomicU32::new(0),
        });
        supervisor.supervise(Arc::clone(&service) as Arc<dyn Supervised>);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(service.runs.load(Ordering::SeqCst), 1);

        supervisor.restart_subsystem("s4");
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(service.runs.load(Ordering::SeqCst), 2);
        assert_eq!(supervisor.status_of("s4"), Some(SubsystemStatus::Healthy));
        supervisor.shutdown();
    }
}
