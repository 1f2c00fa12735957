// Copyright (c) 2024-2025 Viable Systems (viablesystems.io)
// This file is part of the VSM repository.

// You should have received a copy of the MIT License
// along with the VSM repository. If not, see <https://mit-license.org/>.

//! Distributed key-value collaborator backing the rate limiter. The single
//! entry point is server-side script evaluation, which gives the limiter
//! atomic sliding-window increments.

use async_trait::async_trait;

use crate::error::CoreResult;

#[async_trait]
pub trait DistributedKv: Send + Sync {
    /// Evaluate a server-side script against `keys` with `args`, atomically.
    /// The limiter relies on this for its check-and-increment; results are
    /// JSON values shaped by the script.
    async fn eval_script(
        &self,
        script: &str,
        keys: &[String],
        args: &[String],
    ) -> CoreResult<serde_json::Value>;
}
