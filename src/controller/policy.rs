//! Policy Matcher
//!
//! Picks the migration policy whose selectors match the workload and its
//! namespace most specifically, and folds it over the cluster defaults.

use std::collections::BTreeMap;
use std::sync::Arc;

use kube::ResourceExt;

use crate::crd::{MigrationConfiguration, MigrationPolicy, MigrationState};

fn selector_matches(
    selector: &BTreeMap<String, String>,
    object_labels: &BTreeMap<String, String>,
) -> Option<usize> {
    selector
        .iter()
        .all(|(k, v)| object_labels.get(k) == Some(v))
        .then_some(selector.len())
}

/// Number of matched selector labels, or `None` if the policy does not apply
fn score(
    policy: &MigrationPolicy,
    vmi_labels: &BTreeMap<String, String>,
    namespace_labels: &BTreeMap<String, String>,
) -> Option<usize> {
    let selectors = &policy.spec.selectors;
    if selectors.vmi_selector.is_empty() && selectors.namespace_selector.is_empty() {
        return None;
    }
    let vmi = selector_matches(&selectors.vmi_selector, vmi_labels)?;
    let namespace = selector_matches(&selectors.namespace_selector, namespace_labels)?;
    Some(vmi + namespace)
}

/// Most specific matching policy
///
/// Ties on the number of matched labels go to the lexicographically
/// smallest policy name.
pub fn match_policy<'a>(
    policies: &'a [Arc<MigrationPolicy>],
    vmi_labels: &BTreeMap<String, String>,
    namespace_labels: &BTreeMap<String, String>,
) -> Option<&'a MigrationPolicy> {
    let mut best: Option<(usize, &MigrationPolicy)> = None;
    for policy in policies {
        let Some(matched) = score(policy, vmi_labels, namespace_labels) else {
            continue;
        };
        let better = match best {
            None => true,
            Some((best_score, current)) => {
                matched > best_score
                    || (matched == best_score && policy.name_any() < current.name_any())
            }
        };
        if better {
            best = Some((matched, policy.as_ref()));
        }
    }
    best.map(|(_, p)| p)
}

/// Fill the effective configuration into a migration state
///
/// The policy name is only recorded when the policy changed something.
pub fn apply_configuration(
    state: &mut MigrationState,
    cluster: &MigrationConfiguration,
    policy: Option<&MigrationPolicy>,
) {
    let mut config = cluster.clone();
    if let Some(policy) = policy {
        if policy.spec.apply_to(&mut config) {
            state.migration_policy_name = Some(policy.name_any());
        }
    }
    state.migration_configuration = Some(config);
}
