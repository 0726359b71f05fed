//! Pending target pod timeouts
//!
//! A target pod stuck in Pending is deleted once its budget runs out: a
//! short one while the scheduler reports it unschedulable, a long
//! catch-all one otherwise. Both can be overridden per migration through
//! annotations. The migration then fails through the regular status path
//! because its target pod went away.

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::events::EventType;
use kube::ResourceExt;
use std::time::Duration;
use tracing::{info, warn};

use super::host_model::{any_suitable_node, required_cpu_labels};
use super::migration::Context;
use super::pods::{self, pod_key};
use super::Requeue;
use crate::crd::{annotations, VirtualMachineInstance, VirtualMachineInstanceMigration};
use crate::events::reasons;
use crate::{Error, Result};

/// Timeout from `annotation`, or `default` when absent or unparsable
fn timeout_secs(migration: &VirtualMachineInstanceMigration, annotation: &str, default: i64) -> i64 {
    let Some(raw) = migration.annotation(annotation) else {
        return default;
    };
    match raw.parse::<i64>() {
        Ok(secs) => secs,
        Err(e) => {
            warn!(
                migration = %migration.key(),
                annotation,
                value = raw,
                error = %e,
                "Invalid pending timeout annotation, using default"
            );
            default
        }
    }
}

fn seconds_pending(pod: &Pod, now: DateTime<Utc>) -> Option<i64> {
    pods::created_at(pod).map(|created| (now - created).num_seconds().max(0))
}

fn requeue_in(secs: i64) -> Option<Requeue> {
    Some(Requeue::after(Duration::from_secs(secs.max(0) as u64)))
}

/// Delete `pod` if it exceeded its pending budget, otherwise schedule a re-check
pub async fn handle_pending_pod_timeout(
    ctx: &Context,
    migration: &VirtualMachineInstanceMigration,
    vmi: &VirtualMachineInstance,
    pod: &Pod,
    now: DateTime<Utc>,
) -> Result<Option<Requeue>> {
    if !pods::is_pod_pending(pod) || pod.metadata.deletion_timestamp.is_some() {
        return Ok(None);
    }
    let Some(pending) = seconds_pending(pod, now) else {
        return Ok(None);
    };

    let catch_all = timeout_secs(
        migration,
        annotations::PENDING_POD_TIMEOUT_SECONDS,
        ctx.config.catch_all_pending_timeout_secs,
    );
    let unschedulable = timeout_secs(
        migration,
        annotations::UNSCHEDULABLE_POD_TIMEOUT_SECONDS,
        ctx.config.unschedulable_pending_timeout_secs,
    );
    let pod_name = pod_key(pod);

    let mut requeue = None;
    if pods::is_unschedulable(pod) {
        alert_if_host_model_unschedulable(ctx, vmi, pod).await;
        ctx.record(
            migration,
            EventType::Warning,
            reasons::TARGET_POD_UNSCHEDULABLE,
            format!(
                "Migration target pod for VMI [{}] is currently unschedulable.",
                migration.vmi_key()
            ),
        )
        .await;
        warn!(migration = %migration.key(), pod = %pod_name, "Migration target pod is unschedulable");
        if pending >= unschedulable {
            let message = format!("unschedulable pod {pod_name} timeout period exceeded");
            return delete_timed_out_target_pod(ctx, migration, pod, message).await;
        }
        requeue = requeue_in(unschedulable - pending);
    }

    if pending >= catch_all {
        let message = format!("pending pod {pod_name} timeout period exceeded");
        return delete_timed_out_target_pod(ctx, migration, pod, message).await;
    }
    Ok(Requeue::earliest(requeue, requeue_in(catch_all - pending)))
}

async fn delete_timed_out_target_pod(
    ctx: &Context,
    migration: &VirtualMachineInstanceMigration,
    pod: &Pod,
    message: String,
) -> Result<Option<Requeue>> {
    let key = migration.key();
    let pod_name = pod_key(pod);
    let namespace = pod.namespace().unwrap_or_default();

    ctx.pod_expectations
        .expect_deletions(&key, std::slice::from_ref(&pod_name));
    if let Err(e) = ctx.client.delete_pod(&namespace, &pod.name_any()).await {
        ctx.pod_expectations.deletion_observed(&key, &pod_name);
        ctx.record(
            migration,
            EventType::Warning,
            reasons::FAILED_DELETE_POD,
            format!("Error deleted migration target pod: {e}"),
        )
        .await;
        return Err(Error::collaborator(
            "kubernetes",
            format!("failed to delete vmi migration target pod that reached pending pod timeout period.: {e}"),
        ));
    }
    info!(migration = %key, pod = %pod_name, "{message}");
    ctx.record(migration, EventType::Normal, reasons::SUCCESSFUL_DELETE_POD, message)
        .await;
    Ok(None)
}

/// Warn on the workload when no node can host its CPU model
async fn alert_if_host_model_unschedulable(ctx: &Context, vmi: &VirtualMachineInstance, pod: &Pod) {
    if !vmi.uses_host_model_cpu() {
        return;
    }
    let Some(selector) = pod.spec.as_ref().and_then(|s| s.node_selector.as_ref()) else {
        return;
    };
    let required = required_cpu_labels(selector);
    if required.is_empty() {
        return;
    }
    if any_suitable_node(&ctx.nodes.list(), vmi.node_name(), &required) {
        return;
    }
    let listed = required
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(", ");
    ctx.record(
        vmi,
        EventType::Warning,
        reasons::NO_SUITABLE_NODES_FOR_HOST_MODEL,
        format!(
            "Migration cannot proceed since no node is suitable to run the required CPU model / required features: {listed}"
        ),
    )
    .await;
}
