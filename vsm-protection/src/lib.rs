// Copyright (c) 2024-2025 Viable Systems (viablesystems.io)
// This file is part of the VSM repository.

// You should have received a copy of the MIT License
// along with the VSM repository. If not, see <https://mit-license.org/>.

//! The protection layer: circuit breakers that open on failure streaks or on
//! aggregated pain, a registry coordinating them without cascading, and rate
//! limiters with a distributed backend and a local fallback. Pain trips
//! breakers, breaker trips and limiter denials emit pain, recoveries emit
//! pleasure.

pub mod breaker;
pub mod limiter;
pub mod registry;

pub use breaker::{BreakerConfig, BreakerState, CircuitBreaker};
pub use limiter::{RateLimitRule, RateLimiter, RateLimiterConfig};
pub use registry::BreakerRegistry;
