// Copyright (c) 2024-2025 Viable Systems (viablesystems.io)
// This file is part of the VSM repository.

// You should have received a copy of the MIT License
// along with the VSM repository. If not, see <https://mit-license.org/>.

//! The error taxonomy of the core. Callers always see structured values,
//! never panics; errors that represent systemic stress additionally map to
//! pain severities via [`CoreError::pain_severity`].

use std::{fmt, time::Duration};

use serde::{Deserialize, Serialize};

use crate::event::Severity;

pub type CoreResult<T> = Result<T, CoreError>;

/// Rate limit usage snapshot returned with denials and queries.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    /// Effective request count in the current window.
    pub current: f64,
    /// Allowed requests per window.
    pub max: u32,
    /// Requests remaining before denial.
    pub remaining: f64,
    /// Unix milliseconds at which the oldest tracked request leaves the
    /// window.
    pub reset_at_ms: i64,
}

impl fmt::Display for Usage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:.1}/{} used, {:.1} remaining, resets at {}",
            self.current, self.max, self.remaining, self.reset_at_ms
        )
    }
}

#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum CoreError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("rate limited: {usage}")]
    RateLimited { usage: Usage },

    #[error("circuit {0} is open")]
    CircuitOpen(String),

    #[error(
        "clock drift exceeded: remote {remote_ms}ms vs wall {wall_ms}ms \
         (max {max_drift_ms}ms)"
    )]
    ClockDriftExceeded {
        remote_ms: i64,
        wall_ms: i64,
        max_drift_ms: i64,
    },

    #[error("buffer overflow in {0}")]
    BufferOverflow(String),

    #[error("subscriber {0} is gone")]
    SubscriberGone(String),

    #[error("channel {0} is blocked")]
    ChannelBlocked(String),

    #[error("viability threat ({severity}): {reason}")]
    ViabilityThreat { severity: Severity, reason: String },

    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Pain severity emitted alongside this error, if any. Errors that are
    /// purely a caller concern map to `None`.
    pub fn pain_severity(&self) -> Option<Severity> {
        match self {
            Self::InvalidInput(_) => None,
            Self::Timeout(_) => Some(Severity::Medium),
            Self::BackendUnavailable(_) => Some(Severity::High),
            Self::RateLimited { usage } => {
                // Severity scales with how far past the limit the caller is.
                let saturation = if usage.max == 0 {
                    1.0
                } else {
                    usage.current / f64::from(usage.max)
                };
                Some(if saturation >= 1.5 {
                    Severity::High
                } else {
                    Severity::Medium
                })
            },
            Self::CircuitOpen(_) => Some(Severity::High),
            Self::ClockDriftExceeded { .. } => Some(Severity::Low),
            Self::BufferOverflow(_) => Some(Severity::Medium),
            Self::SubscriberGone(_) => None,
            Self::ChannelBlocked(_) => Some(Severity::High),
            Self::ViabilityThreat { severity, .. } => Some(*severity),
            Self::Internal(_) => Some(Severity::High),
        }
    }

    pub fn internal(err: impl fmt::Display) -> Self {
        Self::Internal(err.to_string())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_pain_severity_mapping() {
        assert_eq!(
            CoreError::CircuitOpen("api".into()).pain_severity(),
            Some(Severity::High)
        );
        assert_eq!(CoreError::InvalidInput("x".into()).pain_severity(), None);
        assert_eq!(
            CoreError::ViabilityThreat {
                severity: Severity::Critical,
                reason: "loop broken".into()
            }
            .pain_severity(),
            Some(Severity::Critical)
        );
    }

    #[test]
    fn test_rate_limited_severity_scales_with_saturation() {
        let mild = CoreError::RateLimited {
            usage: Usage {
                current: 6.0,
                max: 5,
                remaining: 0.0,
                reset_at_ms: 0,
            },
        };
        let harsh = CoreError::RateLimited {
            usage: Usage {
                current: 9.0,
                max: 5,
                remaining: 0.0,
                reset_at_ms: 0,
            },
        };
        assert_eq!(mild.pain_severity(), Some(Severity::Medium));
        assert_eq!(harsh.pain_severity(), Some(Severity::High));
    }
}
