// Copyright (c) 2024-2025 Viable Systems (viablesystems.io)
// This file is part of the VSM repository.

// You should have received a copy of the MIT License
// along with the VSM repository. If not, see <https://mit-license.org/>.

//! Bus events, topics and the algedonic metadata the bus interprets.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::hlc::Hlc;

/// Intensity above which an algedonic event bypasses ordered buffering.
pub const BYPASS_THRESHOLD: f64 = 0.9;

/// A topic on the event bus. The named variants form the canonical contract
/// shared with external collaborators; [`Topic::Custom`] is the escape hatch
/// for topics introduced at runtime, provided they do not collide with the
/// canonical names.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Topic {
    AlgedonicPain,
    AlgedonicPleasure,
    EmergencyAlgedonic,
    S1Operations,
    S2Coordination,
    S3Control,
    S4EnvironmentalSignal,
    PatternDetected,
    TemporalPatternDetected,
    PatternsIndexed,
    VsmAlgedonic,
    VsmViabilityThreat,
    ViabilityThreat,
    ChannelCapacityChange,
    CircuitBreakerEmergencyCascade,
    PolicyDirective,
    Custom(String),
}

impl Topic {
    pub fn as_str(&self) -> &str {
        match self {
            Self::AlgedonicPain => "algedonic_pain",
            Self::AlgedonicPleasure => "algedonic_pleasure",
            Self::EmergencyAlgedonic => "emergency_algedonic",
            Self::S1Operations => "s1_operations",
            Self::S2Coordination => "s2_coordination",
            Self::S3Control => "s3_control",
            Self::S4EnvironmentalSignal => "s4_environmental_signal",
            Self::PatternDetected => "pattern_detected",
            Self::TemporalPatternDetected => "temporal_pattern_detected",
            Self::PatternsIndexed => "patterns_indexed",
            Self::VsmAlgedonic => "vsm_algedonic",
            Self::VsmViabilityThreat => "vsm_viability_threat",
            Self::ViabilityThreat => "viability_threat",
            Self::ChannelCapacityChange => "channel_capacity_change",
            Self::CircuitBreakerEmergencyCascade => "circuit_breaker_emergency_cascade",
            Self::PolicyDirective => "policy_directive",
            Self::Custom(name) => name,
        }
    }

    /// The canonical topics of the external contract.
    pub fn canonical() -> [Topic; 12] {
        [
            Self::AlgedonicPain,
            Self::AlgedonicPleasure,
            Self::EmergencyAlgedonic,
            Self::S1Operations,
            Self::S2Coordination,
            Self::S3Control,
            Self::S4EnvironmentalSignal,
            Self::PatternDetected,
            Self::TemporalPatternDetected,
            Self::PatternsIndexed,
            Self::VsmAlgedonic,
            Self::VsmViabilityThreat,
        ]
    }
}

impl From<&str> for Topic {
    fn from(name: &str) -> Self {
        match name {
            "algedonic_pain" => Self::AlgedonicPain,
            "algedonic_pleasure" => Self::AlgedonicPleasure,
            "emergency_algedonic" => Self::EmergencyAlgedonic,
            "s1_operations" => Self::S1Operations,
            "s2_coordination" => Self::S2Coordination,
            "s3_control" => Self::S3Control,
            "s4_environmental_signal" => Self::S4EnvironmentalSignal,
            "pattern_detected" => Self::PatternDetected,
            "temporal_pattern_detected" => Self::TemporalPatternDetected,
            "patterns_indexed" => Self::PatternsIndexed,
            "vsm_algedonic" => Self::VsmAlgedonic,
            "vsm_viability_threat" => Self::VsmViabilityThreat,
            "viability_threat" => Self::ViabilityThreat,
            "channel_capacity_change" => Self::ChannelCapacityChange,
            "circuit_breaker_emergency_cascade" => Self::CircuitBreakerEmergencyCascade,
            "policy_directive" => Self::PolicyDirective,
            other => Self::Custom(other.to_string()),
        }
    }
}

impl From<String> for Topic {
    fn from(name: String) -> Self {
        Self::from(name.as_str())
    }
}

impl From<Topic> for String {
    fn from(topic: Topic) -> Self {
        topic.as_str().to_string()
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity of a pain or pleasure signal and its numeric intensity mapping.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn intensity(self) -> f64 {
        match self {
            Self::Critical => 1.0,
            Self::High => 0.8,
            Self::Medium => 0.5,
            Self::Low => 0.2,
        }
    }

    /// Inverse of [`Severity::intensity`], bucketing arbitrary intensities.
    pub fn from_intensity(intensity: f64) -> Self {
        if intensity >= 0.9 {
            Self::Critical
        } else if intensity >= 0.65 {
            Self::High
        } else if intensity >= 0.35 {
            Self::Medium
        } else {
            Self::Low
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delivery priority of an event.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

/// Event metadata. The bus itself interprets only `algedonic` and
/// `intensity`; everything else is carried for subscribers.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EventMetadata {
    #[serde(default)]
    pub algedonic: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intensity: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub urgency: Option<f64>,

    #[serde(default)]
    pub priority: Priority,

    /// Component that emitted the signal, e.g. a circuit breaker name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Blast radius of a signal, e.g. `system_wide`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,

    /// Set on events replicated from another node; such events are never
    /// re-replicated.
    #[serde(default, rename = "_from_cluster")]
    pub from_cluster: bool,
}

impl EventMetadata {
    /// Metadata for an algedonic signal at the given severity.
    pub fn algedonic(source: impl Into<String>, severity: Severity) -> Self {
        Self {
            algedonic: true,
            intensity: Some(severity.intensity()),
            priority: if severity == Severity::Critical {
                Priority::Critical
            } else {
                Priority::High
            },
            source: Some(source.into()),
            severity: Some(severity),
            ..Self::default()
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    pub fn with_intensity(mut self, intensity: f64) -> Self {
        self.intensity = Some(intensity.clamp(0.0, 1.0));
        self
    }

    pub fn with_urgency(mut self, urgency: f64) -> Self {
        self.urgency = Some(urgency.clamp(0.0, 1.0));
        self
    }

    /// The intensity of the signal: the explicit field if present, otherwise
    /// derived from the severity mapping.
    pub fn effective_intensity(&self) -> f64 {
        self.intensity
            .or_else(|| self.severity.map(Severity::intensity))
            .unwrap_or(0.0)
    }
}

/// Content-addressed event id: a hash over topic, payload and HLC. Globally
/// unique as long as node ids are unique.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventId([u8; 32]);

impl EventId {
    pub fn compute(topic: &Topic, data: &serde_json::Value, hlc: &Hlc) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(topic.as_str().as_bytes());
        hasher.update(data.to_string().as_bytes());
        hasher.update(hlc.to_string().as_bytes());
        Self(*hasher.finalize().as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventId({}..)", &hex::encode(&self.0[..8]))
    }
}

impl Serialize for EventId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for EventId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("event id must be 32 bytes"))?;
        Ok(Self(bytes))
    }
}

/// An immutable event on the bus.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub topic: Topic,
    pub data: serde_json::Value,
    pub hlc: Hlc,
    #[serde(default)]
    pub metadata: EventMetadata,
}

impl Event {
    pub fn new(topic: Topic, data: serde_json::Value, hlc: Hlc) -> Self {
        let id = EventId::compute(&topic, &data, &hlc);
        Self {
            id,
            topic,
            data,
            hlc,
            metadata: EventMetadata::default(),
        }
    }

    pub fn with_metadata(mut self, metadata: EventMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Whether this event takes the algedonic bypass lane in ordered
    /// delivery.
    pub fn is_bypass(&self, threshold: f64) -> bool {
        self.metadata.algedonic && self.metadata.effective_intensity() >= threshold
    }
}
