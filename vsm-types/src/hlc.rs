// Copyright (c) 2024-2025 Viable Systems (viablesystems.io)
// This file is part of the VSM repository.

// You should have received a copy of the MIT License
// along with the VSM repository. If not, see <https://mit-license.org/>.

//! Hybrid logical clocks.
//!
//! Every event stamped by a node carries an [`Hlc`]: wall-clock milliseconds
//! plus a logical counter that breaks ties within a millisecond, plus the node
//! id as the final tie breaker. The result is a total order that respects
//! causality across nodes as long as remote timestamps are folded back in via
//! [`HlcClock::update`].

use std::{
    fmt,
    str::FromStr,
    time::{SystemTime, UNIX_EPOCH},
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Largest tolerated gap between a remote physical timestamp and our wall
/// clock before the update is rejected.
pub const DEFAULT_MAX_DRIFT_MS: i64 = 60_000;

/// Identifier of a node in the cluster. Node ids must be unique for event ids
/// to be globally unique.
#[derive(
    Clone,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    derive_more::Display,
)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for NodeId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// A hybrid logical timestamp. Total order is lexicographic over
/// `(physical, logical, node)`; the derived `Ord` relies on exactly that field
/// order.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Hlc {
    /// Wall-clock component in milliseconds since the unix epoch.
    pub physical: i64,

    /// Logical counter disambiguating events within one millisecond.
    pub logical: u32,

    /// Originating node, the final tie breaker.
    pub node: NodeId,
}

impl Hlc {
    /// Size of the fixed wire encoding: physical (8 bytes BE) + logical
    /// (4 bytes BE). The node id travels separately in wire records.
    pub const WIRE_LEN: usize = 12;

    pub fn new(physical: i64, logical: u32, node: impl Into<NodeId>) -> Self {
        Self {
            physical,
            logical,
            node: node.into(),
        }
    }

    /// Strict happens-before on the total order.
    pub fn before(&self, other: &Hlc) -> bool {
        self < other
    }

    pub fn to_wire(&self) -> [u8; Self::WIRE_LEN] {
        let mut buf = [0u8; Self::WIRE_LEN];
        buf[..8].copy_from_slice(&self.physical.to_be_bytes());
        buf[8..].copy_from_slice(&self.logical.to_be_bytes());
        buf
    }

    pub fn from_wire(buf: [u8; Self::WIRE_LEN], node: NodeId) -> Self {
        let mut physical = [0u8; 8];
        physical.copy_from_slice(&buf[..8]);
        let mut logical = [0u8; 4];
        logical.copy_from_slice(&buf[8..]);
        Self {
            physical: i64::from_be_bytes(physical),
            logical: u32::from_be_bytes(logical),
            node,
        }
    }
}

impl fmt::Display for Hlc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}@{}", self.physical, self.logical, self.node)
    }
}

impl FromStr for Hlc {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || CoreError::InvalidInput(format!("malformed HLC: {s}"));
        let (stamp, node) = s.split_once('@').ok_or_else(invalid)?;
        let (physical, logical) = stamp.split_once('.').ok_or_else(invalid)?;
        if node.is_empty() {
            return Err(invalid());
        }
        Ok(Self {
            physical: physical.parse().map_err(|_| invalid())?,
            logical: logical.parse().map_err(|_| invalid())?,
            node: NodeId::from(node),
        })
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct LastTimestamp {
    physical: i64,
    logical: u32,
}

/// The per-node clock state. All timestamp generation for a node funnels
/// through one instance; handing out `Arc<HlcClock>` keeps the monotonicity
/// invariant without a dedicated task.
#[derive(Debug)]
pub struct HlcClock {
    node: NodeId,
    max_drift_ms: i64,
    last: Mutex<LastTimestamp>,
}

impl HlcClock {
    pub fn new(node: impl Into<NodeId>) -> Self {
        Self::with_max_drift(node, DEFAULT_MAX_DRIFT_MS)
    }

    pub fn with_max_drift(node: impl Into<NodeId>, max_drift_ms: i64) -> Self {
        Self {
            node: node.into(),
            max_drift_ms,
            last: Mutex::new(LastTimestamp::default()),
        }
    }

    pub fn node(&self) -> &NodeId {
        &self.node
    }

    /// Current wall clock in milliseconds since the unix epoch.
    pub fn wall_ms() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64
    }

    /// Generate the next local timestamp. Strictly greater than every
    /// timestamp previously returned by this clock.
    pub fn now(&self) -> Hlc {
        let wall = Self::wall_ms();
        let mut last = self.last.lock();
        if wall > last.physical {
            last.physical = wall;
            last.logical = 0;
        } else {
            last.logical += 1;
        }
        Hlc {
            physical: last.physical,
            logical: last.logical,
            node: self.node.clone(),
        }
    }

    /// Fold a remote timestamp into the local state. The returned timestamp
    /// is strictly greater than both the remote one and anything previously
    /// issued locally. Remote stamps further than the drift bound from our
    /// wall clock are rejected without touching the state.
    pub fn update(&self, remote: &Hlc) -> Result<Hlc, CoreError> {
        let wall = Self::wall_ms();
        if (remote.physical - wall).abs() > self.max_drift_ms {
            return Err(CoreError::ClockDriftExceeded {
                remote_ms: remote.physical,
                wall_ms: wall,
                max_drift_ms: self.max_drift_ms,
            });
        }

        let mut last = self.last.lock();
        let physical = wall.max(last.physical).max(remote.physical);
        let logical = if physical == last.physical && physical == remote.physical {
            last.logical.max(remote.logical) + 1
        } else if physical == remote.physical {
            remote.logical + 1
        } else if physical == last.physical {
            last.logical + 1
        } else {
            0
        };
        last.physical = physical;
        last.logical = logical;
        Ok(Hlc {
            physical,
            logical,
            node: self.node.clone(),
        })
    }
}
