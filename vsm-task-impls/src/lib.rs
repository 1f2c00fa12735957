// Copyright (c) 2024-2025 Viable Systems (viablesystems.io)
// This file is part of the VSM repository.

// You should have received a copy of the MIT License
// along with the VSM repository. If not, see <https://mit-license.org/>.

//! Implementations of the five VSM subsystem workers, the variety channels
//! connecting them, and the control loop that drives the whole arrangement.
//! Every worker is a supervised task consuming bus subscriptions and
//! emitting typed [`vsm_types::VsmEvent`] payloads; the channels close the
//! S1 → S2 → S3 → S1 feedback loop.

pub mod control_loop;
pub mod s1;
pub mod s2;
pub mod s3;
pub mod s4;
pub mod s5;
pub mod variety;

use tokio::sync::mpsc;
use vsm_types::SubsystemKind;

pub use control_loop::{ControlLoop, ControlLoopConfig, EmergencyMode, SystemStatus};
pub use variety::{DampingPolicy, VarietyChannel, VarietyChannelConfig};

/// Command sent from the control loop into a worker's mailbox.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerCommand {
    /// Run one step of the cognitive cycle.
    RunCycle,
    /// Enter or leave emergency posture.
    SetEmergency(bool),
}

/// Handle to a running worker, used by the control loop to drive cycles.
#[derive(Clone, Debug)]
pub struct WorkerHandle {
    pub kind: SubsystemKind,
    pub name: String,
    commands: mpsc::Sender<WorkerCommand>,
}

impl WorkerHandle {
    pub(crate) fn new(
        kind: SubsystemKind,
        name: String,
        commands: mpsc::Sender<WorkerCommand>,
    ) -> Self {
        Self {
            kind,
            name,
            commands,
        }
    }

    /// Best-effort command delivery; a full worker mailbox drops the
    /// command rather than stalling the control loop.
    pub fn send(&self, command: WorkerCommand) -> bool {
        self.commands.try_send(command).is_ok()
    }

    pub fn trigger_cycle(&self) -> bool {
        self.send(WorkerCommand::RunCycle)
    }

    pub fn set_emergency(&self, on: bool) -> bool {
        self.send(WorkerCommand::SetEmergency(on))
    }
}
