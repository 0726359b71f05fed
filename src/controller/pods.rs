//! Pod predicates and lookups
//!
//! Everything here is pure and works on cached pods.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;

use crate::crd::{labels, object_key, VirtualMachineInstance, VirtualMachineInstanceMigration, Volume};

/// Name of the launcher's main container
pub const COMPUTE_CONTAINER: &str = "compute";

/// Sidecar that only has to be running, never ready
const ISTIO_PROXY_CONTAINER: &str = "istio-proxy";

/// `namespace/name` of a pod
pub fn pod_key(pod: &Pod) -> String {
    object_key(pod.namespace().as_deref().unwrap_or_default(), &pod.name_any())
}

fn phase(pod: &Pod) -> &str {
    pod.status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .unwrap_or_default()
}

/// Pod phase is Succeeded or Failed
pub fn is_pod_down(pod: &Pod) -> bool {
    matches!(phase(pod), "Succeeded" | "Failed")
}

/// Pod phase is Pending
pub fn is_pod_pending(pod: &Pod) -> bool {
    phase(pod) == "Pending"
}

/// The compute container has terminated
pub fn is_compute_container_down(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref())
        .into_iter()
        .flatten()
        .filter(|c| c.name == COMPUTE_CONTAINER)
        .any(|c| c.state.as_ref().is_some_and(|st| st.terminated.is_some()))
}

/// Down, compute terminated, or deletion requested
pub fn is_pod_down_or_going_down(pod: &Pod) -> bool {
    is_pod_down(pod) || is_compute_container_down(pod) || pod.metadata.deletion_timestamp.is_some()
}

/// Running with every container usable
///
/// The compute container and the istio proxy only need to be running;
/// all other containers must report ready.
pub fn is_pod_ready(pod: &Pod) -> bool {
    if is_pod_down_or_going_down(pod) {
        return false;
    }
    let statuses = pod
        .status
        .as_ref()
        .and_then(|s| s.container_statuses.as_deref())
        .unwrap_or_default();
    for status in statuses {
        if status.name == COMPUTE_CONTAINER || status.name == ISTIO_PROXY_CONTAINER {
            if !status.state.as_ref().is_some_and(|s| s.running.is_some()) {
                return false;
            }
        } else if !status.ready {
            return false;
        }
    }
    phase(pod) == "Running"
}

/// PodScheduled=False with reason Unschedulable
pub fn is_unschedulable(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .into_iter()
        .flatten()
        .any(|c| {
            c.type_ == "PodScheduled"
                && c.status == "False"
                && c.reason.as_deref() == Some("Unschedulable")
        })
}

/// Creation time as recorded by the API server
pub fn created_at(pod: &Pod) -> Option<DateTime<Utc>> {
    pod.metadata.creation_timestamp.as_ref().map(|t| t.0)
}

/// Node the pod is bound to, empty if unscheduled
pub fn node_name(pod: &Pod) -> &str {
    pod.spec
        .as_ref()
        .and_then(|s| s.node_name.as_deref())
        .unwrap_or_default()
}

fn label<'a>(pod: &'a Pod, key: &str) -> Option<&'a str> {
    pod.metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(key))
        .map(String::as_str)
}

fn controller_uid(pod: &Pod) -> Option<&str> {
    pod.metadata
        .owner_references
        .as_ref()?
        .iter()
        .find(|r| r.controller == Some(true))
        .map(|r| r.uid.as_str())
}

/// Whether the workload owns the pod, by label or controller reference
pub fn is_controlled_by(pod: &Pod, vmi: &VirtualMachineInstance) -> bool {
    let Some(uid) = vmi.metadata.uid.as_deref() else {
        return false;
    };
    label(pod, labels::CREATED_BY) == Some(uid) || controller_uid(pod) == Some(uid)
}

/// Pods of the workload that are not finished
pub fn active_pods(pods: &[Arc<Pod>], vmi: &VirtualMachineInstance) -> Vec<Arc<Pod>> {
    pods.iter()
        .filter(|p| !is_pod_down(p) && is_controlled_by(p, vmi))
        .cloned()
        .collect()
}

/// The launcher pod currently running the workload
///
/// Newest controlled pod on the workload's node, or the newest controlled
/// pod at all while the workload has no node.
pub fn current_vmi_pod(pods: &[Arc<Pod>], vmi: &VirtualMachineInstance) -> Option<Arc<Pod>> {
    let node = vmi.node_name();
    pods.iter()
        .filter(|p| is_controlled_by(p, vmi))
        .filter(|p| node.is_empty() || node_name(p) == node)
        .max_by(|a, b| {
            created_at(a)
                .cmp(&created_at(b))
                .then_with(|| a.name_any().cmp(&b.name_any()))
        })
        .cloned()
}

/// Target pods created for `migration`
pub fn target_pods(
    pods: &[Arc<Pod>],
    vmi: &VirtualMachineInstance,
    migration: &VirtualMachineInstanceMigration,
) -> Vec<Arc<Pod>> {
    let Some(vmi_uid) = vmi.metadata.uid.as_deref() else {
        return Vec::new();
    };
    pods.iter()
        .filter(|p| {
            label(p, labels::CREATED_BY) == Some(vmi_uid)
                && label(p, labels::APP) == Some(labels::APP_VIRT_LAUNCHER)
                && label(p, labels::MIGRATION_JOB_UID) == Some(migration.uid_str())
        })
        .cloned()
        .collect()
}

/// Attachment pods controlled by `target`
pub fn attachment_pods(pods: &[Arc<Pod>], target: &Pod) -> Vec<Arc<Pod>> {
    let Some(uid) = target.metadata.uid.as_deref() else {
        return Vec::new();
    };
    pods.iter()
        .filter(|p| controller_uid(p) == Some(uid))
        .cloned()
        .collect()
}

/// Volumes of the workload the pod does not mount itself
pub fn hotplug_volumes(vmi: &VirtualMachineInstance, pod: &Pod) -> Vec<Volume> {
    let mounted: HashSet<&str> = pod
        .spec
        .as_ref()
        .and_then(|s| s.volumes.as_ref())
        .into_iter()
        .flatten()
        .map(|v| v.name.as_str())
        .collect();
    vmi.spec
        .volumes
        .iter()
        .filter(|v| v.persistent_volume_claim.is_some() || v.data_volume.is_some())
        .filter(|v| !mounted.contains(v.name.as_str()))
        .cloned()
        .collect()
}
