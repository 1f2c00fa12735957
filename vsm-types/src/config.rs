// Copyright (c) 2024-2025 Viable Systems (viablesystems.io)
// This file is part of the VSM repository.

// You should have received a copy of the MIT License
// along with the VSM repository. If not, see <https://mit-license.org/>.

//! Operator-facing configuration of the core, parsed from flags or
//! environment variables.

use std::time::Duration;

use clap::Parser;

/// Tunables of the control plane. Every component takes its slice of this
/// struct at construction; defaults match the specification of each
/// component.
#[derive(Parser, Clone, Debug)]
pub struct CoreOptions {
    /// Identifier of this node; must be unique within a cluster.
    #[clap(long, env = "CORE_NODE_ID", default_value = "node-0")]
    pub node_id: String,

    /// Control loop cycle period in milliseconds.
    #[clap(long, env = "CORE_CYCLE_MS", default_value = "1000")]
    pub cycle_ms: u64,

    /// Initial ordered-delivery buffer window in milliseconds.
    #[clap(long, env = "CORE_ORDER_WINDOW_MS", default_value = "50")]
    pub order_window_ms: u64,

    /// Lower clamp for the adaptive ordered-delivery window.
    #[clap(long, env = "CORE_ORDER_MIN_WINDOW_MS", default_value = "10")]
    pub order_min_window_ms: u64,

    /// Upper clamp for the adaptive ordered-delivery window.
    #[clap(long, env = "CORE_ORDER_MAX_WINDOW_MS", default_value = "500")]
    pub order_max_window_ms: u64,

    /// Grace period past the window before an event counts as late.
    #[clap(long, env = "CORE_ORDER_GRACE_MS", default_value = "50")]
    pub order_grace_ms: u64,

    /// Ordered buffer size that forces a partial flush.
    #[clap(long, env = "CORE_ORDER_MAX_BUFFER", default_value = "1000")]
    pub order_max_buffer: usize,

    /// Algedonic intensity at or above which events bypass ordered buffers.
    #[clap(long, env = "CORE_BYPASS_THRESHOLD", default_value = "0.9")]
    pub bypass_threshold: f64,

    /// Aggregated pain score that opens a circuit breaker.
    #[clap(long, env = "CORE_PAIN_THRESHOLD", default_value = "0.8")]
    pub pain_threshold: f64,

    /// Rolling window over which breaker pain is aggregated, milliseconds.
    #[clap(long, env = "CORE_PAIN_WINDOW_MS", default_value = "10000")]
    pub pain_window_ms: u64,

    /// Start the control loop in emergency mode.
    #[clap(long, env = "CORE_EMERGENCY_ON_START")]
    pub emergency_on_start: bool,

    /// Default timeout for inter-component calls, milliseconds.
    #[clap(long, env = "CORE_TIMEOUT_MS", default_value = "5000")]
    pub timeout_ms: u64,

    /// Interval of the rate limiter's VSM feedback adaptation, milliseconds.
    #[clap(long, env = "CORE_ADAPTATION_INTERVAL_MS", default_value = "10000")]
    pub adaptation_interval_ms: u64,

    /// Usage fraction below which a recently-denied limiter emits pleasure.
    #[clap(long, env = "CORE_PLEASURE_THRESHOLD", default_value = "0.3")]
    pub pleasure_threshold: f64,

    /// Window in which repeated algedonic signals are collapsed,
    /// milliseconds.
    #[clap(long, env = "CORE_REPEAT_WINDOW_MS", default_value = "5000")]
    pub repeat_window_ms: u64,

    /// Maximum tolerated clock drift for remote HLC updates, milliseconds.
    #[clap(long, env = "CORE_MAX_DRIFT_MS", default_value = "60000")]
    pub max_drift_ms: i64,
}

impl Default for CoreOptions {
    fn default() -> Self {
        // Parsing an empty argument list applies the clap defaults and any
        // environment overrides, same as a real invocation.
        Self::parse_from(std::iter::empty::<String>())
    }
}

impl CoreOptions {
    pub fn cycle(&self) -> Duration {
        Duration::from_millis(self.cycle_ms)
    }

    pub fn order_window(&self) -> Duration {
        Duration::from_millis(self.order_window_ms)
    }

    pub fn order_min_window(&self) -> Duration {
        Duration::from_millis(self.order_min_window_ms)
    }

    pub fn order_max_window(&self) -> Duration {
        Duration::from_millis(self.order_max_window_ms)
    }

    pub fn order_grace(&self) -> Duration {
        Duration::from_millis(self.order_grace_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn adaptation_interval(&self) -> Duration {
        Duration::from_millis(self.adaptation_interval_ms)
    }

    pub fn repeat_window(&self) -> Duration {
        Duration::from_millis(self.repeat_window_ms)
    }

    pub fn pain_window(&self) -> Duration {
        Duration::from_millis(self.pain_window_ms)
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_defaults() {
        let opt = CoreOptions::default();
        assert_eq!(opt.cycle_ms, 1000);
        assert_eq!(opt.order_window_ms, 50);
        assert_eq!(opt.order_grace_ms, 50);
        assert_eq!(opt.bypass_threshold, 0.9);
        assert_eq!(opt.pain_threshold, 0.8);
        assert_eq!(opt.timeout_ms, 5000);
        assert_eq!(opt.pleasure_threshold, 0.3);
        assert_eq!(opt.max_drift_ms, 60_000);
        assert!(!opt.emergency_on_start);
    }

    #[test]
    fn test_flags_override_defaults() {
        let opt = CoreOptions::parse_from([
            "core",
            "--cycle-ms",
            "250",
            "--emergency-on-start",
            "--node-id",
            "node-9",
        ]);
        assert_eq!(opt.cycle(), Duration::from_millis(250));
        assert!(opt.emergency_on_start);
        assert_eq!(opt.node_id, "node-9");
    }
}
