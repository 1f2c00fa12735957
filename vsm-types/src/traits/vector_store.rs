// Copyright (c) 2024-2025 Viable Systems (viablesystems.io)
// This file is part of the VSM repository.

// You should have received a copy of the MIT License
// along with the VSM repository. If not, see <https://mit-license.org/>.

//! Vector store consumed by S4 Intelligence for pattern memory. Dimensions
//! are fixed per instance; distance is cosine or euclidean, chosen by the
//! implementation.

use std::path::Path;

use async_trait::async_trait;

use crate::error::CoreResult;

/// A nearest-neighbour match returned by [`VectorStore::search`].
#[derive(Clone, Debug, PartialEq)]
pub struct VectorMatch {
    pub distance: f32,
    pub id: u64,
    pub metadata: serde_json::Value,
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Insert a vector with its metadata, returning the assigned id.
    async fn insert(&self, vector: Vec<f32>, metadata: serde_json::Value) -> CoreResult<u64>;

    /// Return the `k` nearest neighbours of `vector`. `ef` tunes the search
    /// accuracy/cost tradeoff where the backend supports it.
    async fn search(
        &self,
        vector: Vec<f32>,
        k: usize,
        ef: Option<usize>,
    ) -> CoreResult<Vec<VectorMatch>>;

    /// Persist the index. Atomicity across crashes is a backend concern.
    async fn save(&self, path: &Path) -> CoreResult<()>;

    async fn load(&self, path: &Path) -> CoreResult<()>;

    /// Drop entries older than the given unix-millisecond timestamp,
    /// returning how many were removed.
    async fn prune(&self, before_ts: i64) -> CoreResult<usize>;
}
