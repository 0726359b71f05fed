//! MigrationPolicy resource

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::kubevirt::MigrationConfiguration;

/// Migration tuning applied to workloads matched by label selectors
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "migrations.kubevirt.io",
    version = "v1alpha1",
    kind = "MigrationPolicy",
    plural = "migrationpolicies"
)]
#[serde(rename_all = "camelCase")]
pub struct MigrationPolicySpec {
    /// Which workloads the policy applies to
    #[serde(default)]
    pub selectors: PolicySelectors,

    /// Override for auto-converge
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_auto_converge: Option<bool>,

    /// Override for bandwidth per migration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bandwidth_per_migration: Option<String>,

    /// Override for completion timeout per GiB
    #[serde(default, rename = "completionTimeoutPerGiB", skip_serializing_if = "Option::is_none")]
    pub completion_timeout_per_gib: Option<i64>,

    /// Override for post-copy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_post_copy: Option<bool>,

    /// Override for workload disruption
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_workload_disruption: Option<bool>,
}

/// Label selectors of a policy
///
/// Every listed label must match for the policy to apply.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PolicySelectors {
    /// Labels the workload's namespace must carry
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub namespace_selector: BTreeMap<String, String>,

    /// Labels the workload must carry
    #[serde(default, rename = "virtualMachineInstanceSelector", skip_serializing_if = "BTreeMap::is_empty")]
    pub vmi_selector: BTreeMap<String, String>,
}

impl MigrationPolicySpec {
    /// Apply the policy's overrides onto `config`
    ///
    /// Returns whether any field was overridden.
    pub fn apply_to(&self, config: &mut MigrationConfiguration) -> bool {
        let mut changed = false;
        if let Some(v) = self.allow_auto_converge {
            config.allow_auto_converge = Some(v);
            changed = true;
        }
        if let Some(v) = &self.bandwidth_per_migration {
            config.bandwidth_per_migration = Some(v.clone());
            changed = true;
        }
        if let Some(v) = self.completion_timeout_per_gib {
            config.completion_timeout_per_gib = Some(v);
            changed = true;
        }
        if let Some(v) = self.allow_post_copy {
            config.allow_post_copy = Some(v);
            changed = true;
        }
        if let Some(v) = self.allow_workload_disruption {
            config.allow_workload_disruption = Some(v);
            changed = true;
        }
        changed
    }
}
