//! VirtualMachineInstanceMigration resource

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::Condition;
use super::vmi::MigrationState;

/// Specification of one migration attempt
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "kubevirt.io",
    version = "v1",
    kind = "VirtualMachineInstanceMigration",
    plural = "virtualmachineinstancemigrations",
    shortname = "vmim",
    namespaced,
    status = "VirtualMachineInstanceMigrationStatus",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"VMI","type":"string","jsonPath":".spec.vmiName"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineInstanceMigrationSpec {
    /// Name of the workload instance to migrate, in the migration's namespace
    pub vmi_name: String,

    /// Extra node selector terms for the target pod
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub added_node_selector: Option<BTreeMap<String, String>>,

    /// Decentralized source: where to send the workload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub send_to: Option<MigrationSendTo>,

    /// Decentralized target: which remote migration to receive
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receive: Option<MigrationReceive>,
}

/// Connection info for the sending side of a decentralized migration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MigrationSendTo {
    /// Synchronization address of the receiving control plane
    pub connect_url: String,
    /// Identifier shared by both sides
    pub migration_id: String,
}

/// Receiving side of a decentralized migration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MigrationReceive {
    /// Identifier shared by both sides
    pub migration_id: String,
}

/// Phase of a migration
///
/// Transitions only move forward along
/// `Unset -> {Pending | WaitingForSync | Synchronizing} -> Scheduling ->
/// Scheduled -> PreparingTarget -> TargetReady -> Running -> Succeeded`,
/// with `Failed` reachable from every non-final phase.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum MigrationPhase {
    /// Not yet observed by the controller
    #[default]
    #[serde(rename = "")]
    Unset,
    /// Accepted, waiting for a target pod
    Pending,
    /// Decentralized target waiting for the source side
    WaitingForSync,
    /// Decentralized source waiting for the target side
    Synchronizing,
    /// Target pod created, waiting for it to become ready
    Scheduling,
    /// Target pod ready, handoff pending
    Scheduled,
    /// Target agent preparing the destination
    PreparingTarget,
    /// Destination ready to receive
    TargetReady,
    /// Transfer in progress
    Running,
    /// Transfer completed
    Succeeded,
    /// Migration failed
    Failed,
}

impl MigrationPhase {
    /// Succeeded or Failed
    pub fn is_final(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    /// Whether a phase change from `self` to `next` follows the phase graph
    pub fn can_transition_to(self, next: MigrationPhase) -> bool {
        use MigrationPhase::*;
        if self == next {
            return true;
        }
        if next == Failed {
            return !self.is_final();
        }
        matches!(
            (self, next),
            (Unset, Pending | WaitingForSync | Synchronizing)
                | (WaitingForSync | Synchronizing, Pending)
                | (Pending, Scheduling)
                | (Scheduling, Scheduled)
                | (Scheduled, PreparingTarget)
                | (PreparingTarget, TargetReady)
                | (TargetReady, Running)
                | (Running, Succeeded)
        )
    }
}

impl std::fmt::Display for MigrationPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Unset => "Unset",
            Self::Pending => "Pending",
            Self::WaitingForSync => "WaitingForSync",
            Self::Synchronizing => "Synchronizing",
            Self::Scheduling => "Scheduling",
            Self::Scheduled => "Scheduled",
            Self::PreparingTarget => "PreparingTarget",
            Self::TargetReady => "TargetReady",
            Self::Running => "Running",
            Self::Succeeded => "Succeeded",
            Self::Failed => "Failed",
        };
        write!(f, "{s}")
    }
}

/// When a phase was entered
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PhaseTransitionTimestamp {
    /// Phase entered
    pub phase: MigrationPhase,
    /// Time of entry
    pub phase_transition_timestamp: DateTime<Utc>,
}

/// Observed state of a migration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineInstanceMigrationStatus {
    /// Current phase
    #[serde(default)]
    pub phase: MigrationPhase,

    /// Conditions (AbortRequested, RejectedByResourceQuota)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Copy of the workload's migration state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub migration_state: Option<MigrationState>,

    /// Phase entry times, one per phase
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub phase_transition_timestamps: Vec<PhaseTransitionTimestamp>,

    /// Synchronization address of this control plane
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synchronization_address: Option<String>,

    /// All synchronization addresses of this control plane
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub synchronization_addresses: Vec<String>,
}

impl VirtualMachineInstanceMigration {
    /// Status, or the empty default for a migration never reconciled
    pub fn status_or_default(&self) -> VirtualMachineInstanceMigrationStatus {
        self.status.clone().unwrap_or_default()
    }

    /// Current phase
    pub fn phase(&self) -> MigrationPhase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }

    /// UID, empty when not yet assigned
    pub fn uid_str(&self) -> &str {
        self.metadata.uid.as_deref().unwrap_or_default()
    }

    /// Queue key: `namespace/name`
    pub fn key(&self) -> String {
        super::object_key(self.namespace().as_deref().unwrap_or_default(), &self.name_any())
    }

    /// Key of the workload instance this migration moves
    pub fn vmi_key(&self) -> String {
        super::object_key(
            self.namespace().as_deref().unwrap_or_default(),
            &self.spec.vmi_name,
        )
    }

    /// Succeeded or Failed
    pub fn is_final(&self) -> bool {
        self.phase().is_final()
    }

    /// Counted against parallelism ceilings without needing a target pod
    pub fn is_running(&self) -> bool {
        !matches!(
            self.phase(),
            MigrationPhase::Failed
                | MigrationPhase::Pending
                | MigrationPhase::Unset
                | MigrationPhase::Succeeded
        )
    }

    /// The phase implies a target pod was already created
    pub fn target_is_created(&self) -> bool {
        !matches!(self.phase(), MigrationPhase::Unset | MigrationPhase::Pending)
    }

    /// The phase implies the node agent owns progress
    pub fn target_is_handed_off(&self) -> bool {
        !matches!(
            self.phase(),
            MigrationPhase::Unset
                | MigrationPhase::Pending
                | MigrationPhase::Scheduling
                | MigrationPhase::Scheduled
        )
    }

    /// Whether deletion was requested
    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Source side of a cross-cluster migration
    pub fn is_decentralized_source(&self) -> bool {
        self.spec.send_to.is_some()
    }

    /// Target side of a cross-cluster migration
    pub fn is_decentralized_target(&self) -> bool {
        self.spec.receive.is_some()
    }

    /// Either side of a cross-cluster migration
    pub fn is_decentralized(&self) -> bool {
        self.is_decentralized_source() || self.is_decentralized_target()
    }

    /// This control plane creates the target pod
    pub fn is_local_or_decentralized_target(&self) -> bool {
        !self.is_decentralized_source()
    }

    /// This control plane owns the source
    pub fn is_local_or_decentralized_source(&self) -> bool {
        !self.is_decentralized_target()
    }

    /// Whether the annotation is present, whatever its value
    pub fn has_annotation(&self, key: &str) -> bool {
        self.metadata
            .annotations
            .as_ref()
            .is_some_and(|a| a.contains_key(key))
    }

    /// Annotation value
    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(key))
            .map(String::as_str)
    }

    /// Current conditions
    pub fn conditions(&self) -> &[Condition] {
        self.status
            .as_ref()
            .map(|s| s.conditions.as_slice())
            .unwrap_or_default()
    }

    /// When the migration entered `phase`
    pub fn phase_transition_time(&self, phase: MigrationPhase) -> Option<DateTime<Utc>> {
        self.status.as_ref().and_then(|s| {
            s.phase_transition_timestamps
                .iter()
                .find(|ts| ts.phase == phase)
                .map(|ts| ts.phase_transition_timestamp)
        })
    }

    /// Creation time as recorded by the API server
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.metadata.creation_timestamp.as_ref().map(|t| t.0)
    }
}

/// Order migrations oldest first
///
/// Ties on creation time (second granularity) fall back to the name so
/// the order is stable across reconciles.
pub fn oldest_first(a: &VirtualMachineInstanceMigration, b: &VirtualMachineInstanceMigration) -> std::cmp::Ordering {
    a.created_at()
        .cmp(&b.created_at())
        .then_with(|| a.name_any().cmp(&b.name_any()))
}
