//! Host-model CPU node selectors
//!
//! A guest using the host-model CPU can only land on a node that supports
//! the exact model and features of the node it runs on now. Nodes advertise
//! both through labels; these helpers turn one node's labels into the
//! selector a target pod must carry.

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt;

use crate::crd::labels;
use crate::{Error, Result};

/// Selector requiring the source node's model and features
///
/// Reads `host-model-cpu.node.kubevirt.io/<model>` and
/// `host-model-required-features.node.kubevirt.io/<feature>` labels.
pub fn host_cpu_model_selector(
    node_labels: &BTreeMap<String, String>,
) -> Result<BTreeMap<String, String>> {
    let mut selector = BTreeMap::new();
    let mut model = None;
    for (key, value) in node_labels {
        if let Some(m) = key.strip_prefix(labels::HOST_MODEL_CPU) {
            model = Some((m, value));
        } else if let Some(feature) = key.strip_prefix(labels::HOST_MODEL_REQUIRED_FEATURES) {
            selector.insert(format!("{}{feature}", labels::CPU_FEATURE), value.clone());
        }
    }
    let Some((model, value)) = model else {
        return Err(Error::validation(format!(
            "unable to locate host cpu model, does not contain label \"{}\" with information",
            labels::HOST_MODEL_CPU
        )));
    };
    selector.insert(
        format!("{}{model}", labels::SUPPORTED_HOST_MODEL_MIGRATION_CPU),
        value.clone(),
    );
    Ok(selector)
}

/// Selector for a target pod of a host-model workload
///
/// The source pod's own CPU selectors are reused when present; otherwise
/// they are derived from the labels of the node the workload runs on.
pub fn prepare_node_selector(
    node: &Node,
    source_pod_selector: Option<&BTreeMap<String, String>>,
) -> Result<BTreeMap<String, String>> {
    let copied: BTreeMap<String, String> = source_pod_selector
        .into_iter()
        .flatten()
        .filter(|(k, _)| {
            k.contains(labels::CPU_FEATURE) || k.contains(labels::SUPPORTED_HOST_MODEL_MIGRATION_CPU)
        })
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    if !copied.is_empty() {
        return Ok(copied);
    }
    host_cpu_model_selector(node.labels())
}

/// CPU labels of a target pod selector a candidate node must carry
pub fn required_cpu_labels(selector: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    selector
        .iter()
        .filter(|(k, _)| {
            k.starts_with(labels::SUPPORTED_HOST_MODEL_MIGRATION_CPU)
                || k.starts_with(labels::CPU_FEATURE)
        })
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Whether some node other than `source_node` carries every required label
pub fn any_suitable_node(
    nodes: &[Arc<Node>],
    source_node: &str,
    required: &BTreeMap<String, String>,
) -> bool {
    nodes
        .iter()
        .filter(|n| n.name_any() != source_node)
        .any(|n| {
            let node_labels = n.labels();
            required
                .iter()
                .all(|(k, v)| node_labels.get(k) == Some(v))
        })
}
