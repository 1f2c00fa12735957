// Copyright (c) 2024-2025 Viable Systems (viablesystems.io)
// This file is part of the VSM repository.

// You should have received a copy of the MIT License
// along with the VSM repository. If not, see <https://mit-license.org/>.

//! Cluster membership collaborator. The bridge consumes a peer list and a
//! quorum-based partition verdict; discovery itself is out of scope.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::hlc::NodeId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitionStatus {
    Healthy,
    Degraded,
    Partitioned,
}

#[async_trait]
pub trait Membership: Send + Sync {
    /// Current peers, excluding the local node.
    async fn peers(&self) -> Vec<NodeId>;

    /// Health score of a peer in `[0, 1]`.
    async fn health_score(&self, node: &NodeId) -> f64;

    /// Quorum verdict on the cluster's connectivity.
    async fn partition_status(&self) -> PartitionStatus;
}
