//! Shared types used across the migration resources

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Status of a condition
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition holds
    True,
    /// Condition does not hold
    False,
    /// Condition state is not known
    #[default]
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Kubernetes-style condition
///
/// Used by both migrations and workload instances. The type is kept as a
/// string so conditions written by other components round-trip unchanged.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition (e.g. AbortRequested)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition
    pub status: ConditionStatus,

    /// Machine-readable reason
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Human-readable message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Last time the condition was probed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_probe_time: Option<DateTime<Utc>>,

    /// Last time the condition transitioned
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

impl Condition {
    /// Create a condition probed now
    pub fn new(type_: impl Into<String>, status: ConditionStatus) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: None,
            message: None,
            last_probe_time: Some(Utc::now()),
            last_transition_time: None,
        }
    }
}

/// Helpers over a list of conditions
pub trait ConditionsExt {
    /// Whether a condition of the given type is present
    fn has_condition(&self, type_: &str) -> bool;

    /// Whether a condition of the given type is present with the given status
    fn has_condition_with_status(&self, type_: &str, status: ConditionStatus) -> bool;
}

impl ConditionsExt for [Condition] {
    fn has_condition(&self, type_: &str) -> bool {
        self.iter().any(|c| c.type_ == type_)
    }

    fn has_condition_with_status(&self, type_: &str, status: ConditionStatus) -> bool {
        self.iter().any(|c| c.type_ == type_ && c.status == status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_condition_serializes_type_field() {
        let cond = Condition::new("AbortRequested", ConditionStatus::True);
        let json = serde_json::to_value(&cond).unwrap();
        assert_eq!(json["type"], "AbortRequested");
        assert_eq!(json["status"], "True");
        assert!(json.get("reason").is_none());
    }

    #[test]
    fn test_conditions_lookup() {
        let conditions = vec![
            Condition::new("MemoryChange", ConditionStatus::False),
            Condition::new("VCPUChange", ConditionStatus::True),
        ];
        assert!(conditions.has_condition("MemoryChange"));
        assert!(!conditions.has_condition_with_status("MemoryChange", ConditionStatus::True));
        assert!(conditions.has_condition_with_status("VCPUChange", ConditionStatus::True));
        assert!(!conditions.has_condition("MigrationRequired"));
    }
}
