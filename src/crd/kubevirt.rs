//! KubeVirt cluster configuration resource
//!
//! The controller reads a single KubeVirt resource for the cluster-wide
//! migration tuning and the synchronization addresses it publishes on
//! migrations.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Default ceiling on migrations running cluster-wide
pub const DEFAULT_PARALLEL_MIGRATIONS_PER_CLUSTER: u32 = 5;

/// Default ceiling on outbound migrations per source node
pub const DEFAULT_PARALLEL_OUTBOUND_MIGRATIONS_PER_NODE: u32 = 2;

/// Default bandwidth per migration (0 = unlimited)
pub const DEFAULT_BANDWIDTH_PER_MIGRATION: &str = "0Mi";

/// Default completion timeout per GiB of guest memory, in seconds
pub const DEFAULT_COMPLETION_TIMEOUT_PER_GIB: i64 = 150;

/// Default time without progress before aborting, in seconds
pub const DEFAULT_PROGRESS_TIMEOUT: i64 = 150;

/// Feature gate letting launchers run instances as root
pub const ROOT_FEATURE_GATE: &str = "Root";

/// KubeVirt installation
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "kubevirt.io",
    version = "v1",
    kind = "KubeVirt",
    plural = "kubevirts",
    shortname = "kv",
    namespaced,
    status = "KubeVirtStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct KubeVirtSpec {
    /// Cluster configuration
    #[serde(default)]
    pub configuration: KubeVirtConfiguration,
}

/// Cluster configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KubeVirtConfiguration {
    /// Migration tuning
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub migrations: Option<MigrationConfiguration>,

    /// Feature gates and other developer switches
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub developer_configuration: Option<DeveloperConfiguration>,
}

/// Developer switches
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeveloperConfiguration {
    /// Enabled feature gates
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub feature_gates: Vec<String>,
}

/// Published state of the installation
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KubeVirtStatus {
    /// Synchronization address for decentralized migrations
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synchronization_address: Option<String>,

    /// All synchronization addresses
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub synchronization_addresses: Vec<String>,
}

/// Migration tuning, cluster-wide or as resolved for one migration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MigrationConfiguration {
    /// Ceiling on migrations running cluster-wide
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel_migrations_per_cluster: Option<u32>,

    /// Ceiling on outbound migrations per source node
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel_outbound_migrations_per_node: Option<u32>,

    /// Bandwidth limit per migration, as a quantity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bandwidth_per_migration: Option<String>,

    /// Completion timeout per GiB of guest memory, in seconds
    #[serde(default, rename = "completionTimeoutPerGiB", skip_serializing_if = "Option::is_none")]
    pub completion_timeout_per_gib: Option<i64>,

    /// Time without progress before aborting, in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress_timeout: Option<i64>,

    /// Allow auto-converge (CPU throttling)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_auto_converge: Option<bool>,

    /// Allow post-copy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_post_copy: Option<bool>,

    /// Allow disrupting the workload to finish the migration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_workload_disruption: Option<bool>,

    /// Give the target pod the same SELinux level as the source
    #[serde(default, rename = "matchSELinuxLevelOnMigration", skip_serializing_if = "Option::is_none")]
    pub match_selinux_level_on_migration: Option<bool>,
}

impl MigrationConfiguration {
    /// Fill every unset field with its default
    pub fn with_defaults(mut self) -> Self {
        self.parallel_migrations_per_cluster
            .get_or_insert(DEFAULT_PARALLEL_MIGRATIONS_PER_CLUSTER);
        self.parallel_outbound_migrations_per_node
            .get_or_insert(DEFAULT_PARALLEL_OUTBOUND_MIGRATIONS_PER_NODE);
        self.bandwidth_per_migration
            .get_or_insert_with(|| DEFAULT_BANDWIDTH_PER_MIGRATION.to_string());
        self.completion_timeout_per_gib
            .get_or_insert(DEFAULT_COMPLETION_TIMEOUT_PER_GIB);
        self.progress_timeout.get_or_insert(DEFAULT_PROGRESS_TIMEOUT);
        self.allow_auto_converge.get_or_insert(false);
        self.allow_post_copy.get_or_insert(false);
        self.allow_workload_disruption.get_or_insert(false);
        self.match_selinux_level_on_migration.get_or_insert(true);
        self
    }

    /// Cluster-wide ceiling, defaulted
    pub fn parallel_per_cluster(&self) -> u32 {
        self.parallel_migrations_per_cluster
            .unwrap_or(DEFAULT_PARALLEL_MIGRATIONS_PER_CLUSTER)
    }

    /// Per-node outbound ceiling, defaulted
    pub fn parallel_outbound_per_node(&self) -> u32 {
        self.parallel_outbound_migrations_per_node
            .unwrap_or(DEFAULT_PARALLEL_OUTBOUND_MIGRATIONS_PER_NODE)
    }

    /// Whether to copy the SELinux level onto the target pod
    pub fn match_selinux_level(&self) -> bool {
        self.match_selinux_level_on_migration.unwrap_or(true)
    }
}

impl KubeVirt {
    /// Effective migration configuration with defaults filled
    pub fn migration_configuration(&self) -> MigrationConfiguration {
        self.spec
            .configuration
            .migrations
            .clone()
            .unwrap_or_default()
            .with_defaults()
    }

    /// Whether `gate` is listed in the developer configuration
    pub fn feature_gate_enabled(&self, gate: &str) -> bool {
        self.spec
            .configuration
            .developer_configuration
            .as_ref()
            .is_some_and(|dev| dev.feature_gates.iter().any(|g| g == gate))
    }

    /// Whether instances run as root
    pub fn root_enabled(&self) -> bool {
        self.feature_gate_enabled(ROOT_FEATURE_GATE)
    }

    /// Published synchronization address, empty if none
    pub fn synchronization_address(&self) -> &str {
        self.status
            .as_ref()
            .and_then(|s| s.synchronization_address.as_deref())
            .unwrap_or_default()
    }

    /// Published synchronization addresses
    pub fn synchronization_addresses(&self) -> &[String] {
        self.status
            .as_ref()
            .map(|s| s.synchronization_addresses.as_slice())
            .unwrap_or_default()
    }
}
