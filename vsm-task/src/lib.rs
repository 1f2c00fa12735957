// Copyright (c) 2024-2025 Viable Systems (viablesystems.io)
// This file is part of the VSM repository.

// You should have received a copy of the MIT License
// along with the VSM repository. If not, see <https://mit-license.org/>.

//! Task plumbing shared by the long-lived components of the control plane,
//! and the supervisor that keeps them alive.

pub mod supervisor;
pub mod task;

pub use supervisor::{RestartPolicy, Supervised, Supervisor};
pub use task::TaskHandle;
