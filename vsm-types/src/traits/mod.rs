// Copyright (c) 2024-2025 Viable Systems (viablesystems.io)
// This file is part of the VSM repository.

// You should have received a copy of the MIT License
// along with the VSM repository. If not, see <https://mit-license.org/>.

//! Interfaces of external collaborators consumed by the core. The core only
//! depends on these traits; concrete backends (HNSW index, distributed KV,
//! cluster membership) live outside the repository.

pub mod kv;
pub mod membership;
pub mod vector_store;

pub use kv::DistributedKv;
pub use membership::{Membership, PartitionStatus};
pub use vector_store::{VectorMatch, VectorStore};
