//! VirtualMachineInstance resource
//!
//! Only the parts of the workload instance the migration controller reads
//! or writes are modelled. The migration state keeps unknown fields so a
//! test-then-replace patch compares against exactly what the server holds.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::migration::VirtualMachineInstanceMigration;
use super::types::Condition;

/// Specification of a virtual machine instance
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "kubevirt.io",
    version = "v1",
    kind = "VirtualMachineInstance",
    plural = "virtualmachineinstances",
    shortname = "vmi",
    namespaced,
    status = "VirtualMachineInstanceStatus",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Node","type":"string","jsonPath":".status.nodeName"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineInstanceSpec {
    /// Domain (hardware) specification
    #[serde(default)]
    pub domain: DomainSpec,

    /// Volumes attached to the instance
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<Volume>,
}

/// Domain specification
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DomainSpec {
    /// CPU topology and model
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<CpuSpec>,

    /// Devices
    #[serde(default)]
    pub devices: Devices,

    /// Firmware configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firmware: Option<Firmware>,
}

/// CPU model requested by the instance
pub const CPU_MODE_HOST_MODEL: &str = "host-model";

/// Runtime user of an instance launched as root
pub const ROOT_UID: u64 = 0;

/// Runtime user of an instance launched as non-root
pub const NON_ROOT_UID: u64 = 107;

/// CPU specification
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CpuSpec {
    /// CPU model, e.g. "host-model"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Whether vCPUs are pinned to dedicated host CPUs
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub dedicated_cpu_placement: bool,
}

/// Devices
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Devices {
    /// Emulated TPM
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tpm: Option<PersistableDevice>,
}

/// Firmware
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Firmware {
    /// Bootloader
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bootloader: Option<Bootloader>,
}

/// Bootloader
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Bootloader {
    /// EFI boot
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub efi: Option<PersistableDevice>,
}

/// A device whose state can be kept on a backend-storage volume
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PersistableDevice {
    /// Keep device state across restarts and migrations
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent: Option<bool>,
}

/// A volume attached to the instance
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    /// Volume name
    pub name: String,

    /// Backed by a PVC
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent_volume_claim: Option<ClaimVolumeSource>,

    /// Backed by a data volume
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_volume: Option<DataVolumeSource>,
}

/// PVC volume source
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClaimVolumeSource {
    /// Claim name
    pub claim_name: String,
    /// Whether the volume was hotplugged
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub hotpluggable: bool,
}

/// Data volume source
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DataVolumeSource {
    /// Data volume name
    pub name: String,
    /// Whether the volume was hotplugged
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub hotpluggable: bool,
}

/// Lifecycle phase of the instance
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum VmiPhase {
    /// Accepted, not yet scheduled
    #[default]
    Pending,
    /// Being scheduled
    Scheduling,
    /// Scheduled onto a node
    Scheduled,
    /// Guest is running
    Running,
    /// Guest shut down cleanly
    Succeeded,
    /// Guest failed
    Failed,
    /// State could not be determined
    Unknown,
}

/// Observed state of the instance
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineInstanceStatus {
    /// Lifecycle phase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<VmiPhase>,

    /// Node currently running the instance
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,

    /// Conditions (VCPUChange, MemoryChange, MigrationRequired, ...)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// State of the active or most recent migration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub migration_state: Option<MigrationState>,

    /// Per-volume status
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_status: Vec<VolumeStatus>,

    /// SELinux context of the running launcher
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selinux_context: Option<String>,

    /// User the launcher runs the instance as
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_user: Option<u64>,
}

/// Per-volume status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeStatus {
    /// Volume name
    pub name: String,

    /// Hotplug details, present for hotplugged volumes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hotplug_volume: Option<HotplugVolumeStatus>,

    /// Claim backing the volume
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent_volume_claim_name: Option<String>,
}

/// Hotplug volume status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HotplugVolumeStatus {
    /// Attachment pod name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attach_pod_name: Option<String>,
    /// Attachment pod UID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attach_pod_uid: Option<String>,
}

/// Migration state on the workload instance
///
/// Written by the controller at handoff and afterwards by the node agents
/// reporting progress.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MigrationState {
    /// UID of the migration owning this state
    #[serde(default, rename = "migrationUid", skip_serializing_if = "Option::is_none")]
    pub migration_uid: Option<String>,

    /// Node the instance migrates from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_node: Option<String>,

    /// Node the instance migrates to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_node: Option<String>,

    /// Launcher pod on the source node
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_pod: Option<String>,

    /// Launcher pod on the target node
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_pod: Option<String>,

    /// Address of the target node agent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_node_address: Option<String>,

    /// When the target domain was ready to receive
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_node_domain_ready_timestamp: Option<DateTime<Utc>>,

    /// When the transfer started
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_timestamp: Option<DateTime<Utc>>,

    /// When the transfer ended
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_timestamp: Option<DateTime<Utc>>,

    /// Transfer finished
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub completed: bool,

    /// Transfer failed
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub failed: bool,

    /// Cancellation requested by the controller
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub abort_requested: bool,

    /// Why the transfer failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,

    /// UID of the target attachment pod for hotplugged volumes
    #[serde(default, rename = "targetAttachmentPodUid", skip_serializing_if = "Option::is_none")]
    pub target_attachment_pod_uid: Option<String>,

    /// Effective migration tuning
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub migration_configuration: Option<super::kubevirt::MigrationConfiguration>,

    /// Name of the policy that shaped `migration_configuration`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub migration_policy_name: Option<String>,

    /// Backend-storage PVC on the source side
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_persistent_state_pvc_name: Option<String>,

    /// Backend-storage PVC on the target side
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_persistent_state_pvc_name: Option<String>,

    /// Decentralized source side
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_state: Option<MigrationSourceState>,

    /// Decentralized target side
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_state: Option<MigrationTargetState>,

    /// Volumes moved by the migration
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub migrated_volumes: Vec<MigratedVolume>,

    /// Fields written by other components
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Source side of a decentralized migration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MigrationSourceState {
    /// Migration UID on the source cluster
    #[serde(default, rename = "migrationUid", skip_serializing_if = "Option::is_none")]
    pub migration_uid: Option<String>,
    /// Source node
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
    /// Source pod
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod: Option<String>,
    /// Synchronization address of the source controller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_address: Option<String>,
    /// Node selectors of the source pod
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selectors: BTreeMap<String, String>,
    /// SELinux context on the source
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selinux_context: Option<String>,
    /// Backend-storage PVC on the source
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent_state_pvc_name: Option<String>,
}

/// Target side of a decentralized migration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MigrationTargetState {
    /// Migration UID on the target cluster
    #[serde(default, rename = "migrationUid", skip_serializing_if = "Option::is_none")]
    pub migration_uid: Option<String>,
    /// Target node
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
    /// Target pod
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod: Option<String>,
    /// Synchronization address of the target controller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_address: Option<String>,
    /// Address of the target node agent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_address: Option<String>,
    /// UID of the target instance
    #[serde(default, rename = "virtualMachineInstanceUid", skip_serializing_if = "Option::is_none")]
    pub virtual_machine_instance_uid: Option<String>,
    /// Namespace of the target domain
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain_namespace: Option<String>,
    /// Name of the target domain
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain_name: Option<String>,
}

/// A volume moved by the migration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MigratedVolume {
    /// Volume name
    pub volume_name: String,
    /// Claim on the source
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_pvc: Option<String>,
    /// Claim on the destination
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_pvc: Option<String>,
}

impl MigrationState {
    /// Whether this state belongs to the migration with the given UID
    pub fn is_owned_by(&self, uid: &str) -> bool {
        self.migration_uid.as_deref() == Some(uid)
    }
}

fn non_empty(value: &Option<String>) -> bool {
    value.as_deref().is_some_and(|v| !v.is_empty())
}

impl VirtualMachineInstance {
    /// Status, or an empty default when not yet reported
    pub fn status_or_default(&self) -> VirtualMachineInstanceStatus {
        self.status.clone().unwrap_or_default()
    }

    /// User the instance runs as, root when unreported
    pub fn runtime_user(&self) -> u64 {
        self.status
            .as_ref()
            .and_then(|s| s.runtime_user)
            .unwrap_or(ROOT_UID)
    }

    /// Current lifecycle phase
    pub fn phase(&self) -> Option<VmiPhase> {
        self.status.as_ref().and_then(|s| s.phase)
    }

    /// Node currently running the instance, empty if none
    pub fn node_name(&self) -> &str {
        self.status
            .as_ref()
            .and_then(|s| s.node_name.as_deref())
            .unwrap_or_default()
    }

    /// The current migration state, if any
    pub fn migration_state(&self) -> Option<&MigrationState> {
        self.status.as_ref().and_then(|s| s.migration_state.as_ref())
    }

    /// Conditions on the instance
    pub fn conditions(&self) -> &[Condition] {
        self.status
            .as_ref()
            .map(|s| s.conditions.as_slice())
            .unwrap_or_default()
    }

    /// Succeeded or Failed
    pub fn is_final(&self) -> bool {
        matches!(self.phase(), Some(VmiPhase::Succeeded | VmiPhase::Failed))
    }

    /// Guest is running
    pub fn is_running(&self) -> bool {
        self.phase() == Some(VmiPhase::Running)
    }

    /// Whether deletion was requested
    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Whether the state describes a cross-cluster migration
    pub fn is_decentralized_migration(&self) -> bool {
        self.migration_state().is_some_and(|s| {
            s.source_state.as_ref().is_some_and(|src| non_empty(&src.sync_address))
                || s.target_state.as_ref().is_some_and(|t| non_empty(&t.sync_address))
        })
    }

    /// Whether this instance is the running source of a decentralized migration
    pub fn is_migration_source(&self) -> bool {
        self.migration_state()
            .and_then(|s| s.source_state.as_ref())
            .is_some_and(|src| {
                non_empty(&src.sync_address)
                    && src.node.as_deref().is_some_and(|n| n == self.node_name())
            })
    }

    /// Whether the migration state reflects the given migration
    ///
    /// Local migrations are synchronized as soon as a state exists. A
    /// decentralized migration additionally needs its own UID recorded on
    /// the source or target side.
    pub fn is_migration_synchronized(&self, migration: &VirtualMachineInstanceMigration) -> bool {
        let Some(state) = self.migration_state() else {
            return false;
        };
        if !migration.is_decentralized() {
            return true;
        }
        let uid = migration.uid_str();
        state
            .source_state
            .as_ref()
            .is_some_and(|s| s.migration_uid.as_deref() == Some(uid))
            || state
                .target_state
                .as_ref()
                .is_some_and(|t| t.migration_uid.as_deref() == Some(uid))
    }

    /// Whether the remote source side has reported itself
    pub fn is_migration_source_synchronized(&self) -> bool {
        self.migration_state()
            .and_then(|s| s.source_state.as_ref())
            .is_some_and(|src| non_empty(&src.migration_uid) && non_empty(&src.node))
    }

    /// Whether the target agent has picked up the handoff
    pub fn is_target_preparing(&self, migration: &VirtualMachineInstanceMigration) -> bool {
        self.is_migration_synchronized(migration)
            && self.migration_state().is_some_and(|s| {
                s.is_owned_by(migration.uid_str()) && non_empty(&s.target_node)
            })
    }

    /// Whether any volume is hotplugged
    pub fn has_hotplug_volumes(&self) -> bool {
        let status_hotplug = self
            .status
            .as_ref()
            .is_some_and(|s| s.volume_status.iter().any(|v| v.hotplug_volume.is_some()));
        status_hotplug
            || self.spec.volumes.iter().any(|v| {
                v.data_volume.as_ref().is_some_and(|d| d.hotpluggable)
                    || v.persistent_volume_claim
                        .as_ref()
                        .is_some_and(|p| p.hotpluggable)
            })
    }

    /// Whether a device needs a persistent backend-storage volume
    pub fn needs_backend_storage(&self) -> bool {
        let tpm = self
            .spec
            .domain
            .devices
            .tpm
            .as_ref()
            .is_some_and(|t| t.persistent == Some(true));
        let efi = self
            .spec
            .domain
            .firmware
            .as_ref()
            .and_then(|f| f.bootloader.as_ref())
            .and_then(|b| b.efi.as_ref())
            .is_some_and(|e| e.persistent == Some(true));
        tpm || efi
    }

    /// Whether the guest requests the host-model CPU
    pub fn uses_host_model_cpu(&self) -> bool {
        self.spec
            .domain
            .cpu
            .as_ref()
            .and_then(|c| c.model.as_deref())
            == Some(CPU_MODE_HOST_MODEL)
    }

    /// Whether vCPUs are pinned to dedicated host CPUs
    pub fn is_cpu_dedicated(&self) -> bool {
        self.spec
            .domain
            .cpu
            .as_ref()
            .is_some_and(|c| c.dedicated_cpu_placement)
    }

    /// Backend-storage PVC currently used by the instance
    pub fn current_backend_pvc_name(&self) -> Option<String> {
        self.status.as_ref().and_then(|s| {
            s.volume_status
                .iter()
                .find(|v| v.name.starts_with(super::BACKEND_STORAGE_PREFIX))
                .and_then(|v| v.persistent_volume_claim_name.clone())
        })
    }
}
