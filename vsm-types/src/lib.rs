// Copyright (c) 2024-2025 Viable Systems (viablesystems.io)
// This file is part of the VSM repository.

// You should have received a copy of the MIT License
// along with the VSM repository. If not, see <https://mit-license.org/>.

//! Shared types for the viable-system control plane: hybrid logical clocks,
//! bus events and topics, the VSM subsystem vocabulary, the error taxonomy,
//! metrics traits and the interfaces of external collaborators.

pub mod config;
pub mod error;
pub mod event;
pub mod hlc;
pub mod metrics;
pub mod traits;
pub mod vsm;

pub use config::CoreOptions;
pub use error::{CoreError, CoreResult, Usage};
pub use event::{Event, EventId, EventMetadata, Priority, Severity, Topic};
pub use hlc::{Hlc, HlcClock, NodeId};
pub use vsm::{SubsystemId, SubsystemKind, SubsystemStatus, VsmEvent, VsmEventType};
