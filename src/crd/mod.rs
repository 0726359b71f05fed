//! Resource definitions used by the migration controller
//!
//! The migration and policy resources are owned by this controller; the
//! workload instance and KubeVirt resources are read (and partially
//! patched) but installed by other components.

mod kubevirt;
mod migration;
mod policy;
mod types;
mod vmi;

pub use kubevirt::{
    DeveloperConfiguration, KubeVirt, KubeVirtConfiguration, KubeVirtSpec, KubeVirtStatus,
    MigrationConfiguration, ROOT_FEATURE_GATE,
};
pub use migration::{
    oldest_first, MigrationPhase, MigrationReceive, MigrationSendTo, PhaseTransitionTimestamp,
    VirtualMachineInstanceMigration, VirtualMachineInstanceMigrationSpec,
    VirtualMachineInstanceMigrationStatus,
};
pub use policy::{MigrationPolicy, MigrationPolicySpec, PolicySelectors};
pub use types::{Condition, ConditionStatus, ConditionsExt};
pub use vmi::{
    Bootloader, ClaimVolumeSource, CpuSpec, DataVolumeSource, Devices, DomainSpec, Firmware,
    HotplugVolumeStatus, MigratedVolume, MigrationSourceState, MigrationState,
    MigrationTargetState, PersistableDevice, VirtualMachineInstance, VirtualMachineInstanceSpec,
    VirtualMachineInstanceStatus, VmiPhase, Volume, VolumeStatus, CPU_MODE_HOST_MODEL,
    NON_ROOT_UID, ROOT_UID,
};

/// Name prefix of backend-storage PVCs
pub const BACKEND_STORAGE_PREFIX: &str = "persistent-state-for";

/// Build a `namespace/name` key
pub fn object_key(namespace: &str, name: &str) -> String {
    if namespace.is_empty() {
        name.to_string()
    } else {
        format!("{namespace}/{name}")
    }
}

/// Split a `namespace/name` key
pub fn split_key(key: &str) -> (&str, &str) {
    key.split_once('/').unwrap_or(("", key))
}

/// Well-known label keys
pub mod labels {
    /// Selects migrations of a workload instance
    pub const MIGRATION_SELECTOR: &str = "kubevirt.io/vmi-name";
    /// UID of the workload that created a pod
    pub const CREATED_BY: &str = "kubevirt.io/created-by";
    /// Application label key
    pub const APP: &str = "kubevirt.io";
    /// Application label value of launcher pods
    pub const APP_VIRT_LAUNCHER: &str = "virt-launcher";
    /// UID of the migration owning a target or attachment pod
    pub const MIGRATION_JOB_UID: &str = "kubevirt.io/migrationJobUID";
    /// Name of the migration owning a backend-storage PVC
    pub const MIGRATION_NAME: &str = "kubevirt.io/migrationName";
    /// Target node, watched by the destination node agent
    pub const MIGRATION_TARGET_NODE_NAME: &str = "kubevirt.io/migrationTargetNodeName";
    /// Host name topology key
    pub const HOSTNAME: &str = "kubernetes.io/hostname";
    /// Host-model CPU advertised by a node
    pub const HOST_MODEL_CPU: &str = "host-model-cpu.node.kubevirt.io/";
    /// Features the host-model CPU requires
    pub const HOST_MODEL_REQUIRED_FEATURES: &str = "host-model-required-features.node.kubevirt.io/";
    /// Host-model CPUs a node can accept as migration target
    pub const SUPPORTED_HOST_MODEL_MIGRATION_CPU: &str = "cpu-model-migration.node.kubevirt.io/";
    /// CPU feature supported by a node
    pub const CPU_FEATURE: &str = "cpu-feature.node.kubevirt.io/";
}

/// Well-known annotation keys
pub mod annotations {
    /// Name of the migration owning a target or attachment pod
    pub const MIGRATION_JOB_NAME: &str = "kubevirt.io/migrationJobName";
    /// Migration created by node evacuation
    pub const EVACUATION_MIGRATION: &str = "kubevirt.io/evacuationMigration";
    /// Migration created by the workload updater
    pub const WORKLOAD_UPDATE_MIGRATION: &str = "kubevirt.io/workloadUpdateMigration";
    /// Override of the unschedulable target pod timeout, in seconds
    pub const UNSCHEDULABLE_POD_TIMEOUT_SECONDS: &str =
        "kubevirt.io/migrationUnschedulablePodTimeoutSeconds";
    /// Override of the catch-all pending target pod timeout, in seconds
    pub const PENDING_POD_TIMEOUT_SECONDS: &str = "kubevirt.io/migrationPendingPodTimeoutSeconds";
    /// Test-only: skip migration backoff
    pub const FUNC_TEST_IGNORE_BACKOFF: &str = "kubevirt.io/func-test-ignore-migration-backoff";
    /// Test-only: replace the compute image of the target pod
    pub const FUNC_TEST_TARGET_IMAGE_OVERRIDE: &str =
        "kubevirt.io/func-test-migration-target-image-override";
    /// Set on the target pod once its domain is ready
    pub const MIGRATION_TARGET_READY_TIMESTAMP: &str =
        "kubevirt.io/migration-target-ready-timestamp";
    /// Marks an instance running as the non-root user
    pub const NON_ROOT: &str = "kubevirt.io/nonroot";
}

/// Finalizer kept on migrations until they are final
pub const MIGRATION_FINALIZER: &str = "kubevirt.io/migrationJobFinalize";

/// Condition types
pub mod conditions {
    /// Cancellation of the migration was requested
    pub const ABORT_REQUESTED: &str = "AbortRequested";
    /// Target pod creation was rejected by a resource quota
    pub const REJECTED_BY_RESOURCE_QUOTA: &str = "RejectedByResourceQuota";
    /// Workload has a pending vCPU hotplug
    pub const VCPU_CHANGE: &str = "VCPUChange";
    /// Workload has a pending memory hotplug
    pub const MEMORY_CHANGE: &str = "MemoryChange";
    /// Workload needs another migration
    pub const MIGRATION_REQUIRED: &str = "MigrationRequired";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_round_trip() {
        assert_eq!(object_key("default", "vmi-a"), "default/vmi-a");
        assert_eq!(split_key("default/vmi-a"), ("default", "vmi-a"));
        assert_eq!(object_key("", "node-1"), "node-1");
        assert_eq!(split_key("node-1"), ("", "node-1"));
    }
}
