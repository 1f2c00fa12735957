// Copyright (c) 2024-2025 Viable Systems (viablesystems.io)
// This file is part of the VSM repository.

// You should have received a copy of the MIT License
// along with the VSM repository. If not, see <https://mit-license.org/>.

//! The viable-system vocabulary: subsystem identities and the typed events
//! subsystems exchange over the bus.

use std::fmt;

use serde::{Deserialize, Serialize};
use strum::EnumIter;

use crate::{event::Topic, hlc::Hlc};

/// The five subsystems of the viable system model.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, EnumIter,
)]
#[serde(rename_all = "lowercase")]
pub enum SubsystemKind {
    /// Operations: absorbs environmental variety.
    S1,
    /// Coordination: dampens oscillation between operational units.
    S2,
    /// Control: enforces resource policy, closes the loop back to S1.
    S3,
    /// Intelligence: watches the environment, maintains pattern memory.
    S4,
    /// Policy: core values, goal validation, ultimate authority.
    S5,
}

impl SubsystemKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::S1 => "s1",
            Self::S2 => "s2",
            Self::S3 => "s3",
            Self::S4 => "s4",
            Self::S5 => "s5",
        }
    }

    /// The bus topic this subsystem publishes and consumes on.
    pub fn topic(self) -> Topic {
        match self {
            Self::S1 => Topic::S1Operations,
            Self::S2 => Topic::S2Coordination,
            Self::S3 => Topic::S3Control,
            Self::S4 => Topic::S4EnvironmentalSignal,
            Self::S5 => Topic::PolicyDirective,
        }
    }
}

impl fmt::Display for SubsystemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity record of a running subsystem instance.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubsystemId {
    pub kind: SubsystemKind,
    pub id: String,
}

impl SubsystemId {
    pub fn new(kind: SubsystemKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }
}

impl fmt::Display for SubsystemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.id)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubsystemStatus {
    #[default]
    Starting,
    Healthy,
    Degraded,
    Failed,
    Restarting,
}

impl SubsystemStatus {
    pub fn is_failed(self) -> bool {
        matches!(self, Self::Failed)
    }
}

/// The type of a typed inter-subsystem event. `Generic` carries forward
/// compatibility for types introduced at runtime.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum VsmEventType {
    OperationStarted,
    /// Raw operational variety emitted by S1.
    Operational,
    /// S1 variety aggregated for S2 by the S1→S2 channel.
    Aggregated,
    CoordinationConflict,
    /// S2 damping output.
    Coordinated,
    /// Coordination data prepared for S3 by the S2→S3 channel.
    ControlReady,
    ControlCommand,
    PolicyDirective,
    PatternDetected,
    EnvironmentalSignal,
    /// S4 escalation toward S5/S3 on high-urgency signals.
    EnvironmentalAlert,
    AlgedonicPain,
    AlgedonicPleasure,
    ViabilityThreat,
    Generic(String),
}

impl VsmEventType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::OperationStarted => "operation_started",
            Self::Operational => "operational",
            Self::Aggregated => "aggregated",
            Self::CoordinationConflict => "coordination_conflict",
            Self::Coordinated => "coordinated",
            Self::ControlReady => "control_ready",
            Self::ControlCommand => "control_command",
            Self::PolicyDirective => "policy_directive",
            Self::PatternDetected => "pattern_detected",
            Self::EnvironmentalSignal => "environmental_signal",
            Self::EnvironmentalAlert => "environmental_alert",
            Self::AlgedonicPain => "algedonic_pain",
            Self::AlgedonicPleasure => "algedonic_pleasure",
            Self::ViabilityThreat => "viability_threat",
            Self::Generic(name) => name,
        }
    }
}

impl From<&str> for VsmEventType {
    fn from(name: &str) -> Self {
        match name {
            "operation_started" => Self::OperationStarted,
            "operational" => Self::Operational,
            "aggregated" => Self::Aggregated,
            "coordination_conflict" => Self::CoordinationConflict,
            "coordinated" => Self::Coordinated,
            "control_ready" => Self::ControlReady,
            "control_command" => Self::ControlCommand,
            "policy_directive" => Self::PolicyDirective,
            "pattern_detected" => Self::PatternDetected,
            "environmental_signal" => Self::EnvironmentalSignal,
            "environmental_alert" => Self::EnvironmentalAlert,
            "algedonic_pain" => Self::AlgedonicPain,
            "algedonic_pleasure" => Self::AlgedonicPleasure,
            "viability_threat" => Self::ViabilityThreat,
            other => Self::Generic(other.to_string()),
        }
    }
}

impl From<String> for VsmEventType {
    fn from(name: String) -> Self {
        Self::from(name.as_str())
    }
}

impl From<VsmEventType> for String {
    fn from(kind: VsmEventType) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for VsmEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed event passed between subsystems. Travels on the bus as the `data`
/// payload of a plain [`crate::Event`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VsmEvent {
    pub subsystem: SubsystemKind,
    #[serde(rename = "type")]
    pub kind: VsmEventType,
    pub data: serde_json::Value,
    pub hlc: Hlc,
    /// Unix milliseconds at creation, for operator display only; ordering
    /// always uses the HLC.
    pub created_at: i64,
}

impl VsmEvent {
    pub fn new(
        subsystem: SubsystemKind,
        kind: VsmEventType,
        data: serde_json::Value,
        hlc: Hlc,
    ) -> Self {
        let created_at = hlc.physical;
        Self {
            subsystem,
            kind,
            data,
            hlc,
            created_at,
        }
    }

    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    /// Parse a bus payload back into a typed event. Payloads that are not
    /// VSM events yield `None`; they are legal on shared topics.
    pub fn from_value(value: &serde_json::Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }
}
