//! Per-phase actions
//!
//! [`sync`] performs the side effects a migration needs in its current
//! phase: creating the target and attachment pods, handing the migration
//! over to the target node agent, cancelling before the handoff and
//! signalling an abort after it. Values that end up in the migration status
//! (backend-storage PVC names) are written into the working status passed
//! in; the caller derives and writes the final status afterwards.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{
    NodeSelectorRequirement, NodeSelectorTerm, PersistentVolumeClaim, Pod, PodAffinityTerm,
    SELinuxOptions,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::runtime::events::EventType;
use kube::ResourceExt;
use tracing::{debug, error, info, warn};

use super::capacity::{outbound_from_node, running_migrations};
use super::host_model::{prepare_node_selector, required_cpu_labels};
use super::migration::Context;
use super::patch::{runtime_user_patch, vmi_patch, PatchBuilder};
use super::pods::{self, pod_key, COMPUTE_CONTAINER};
use super::policy::{apply_configuration, match_policy};
use super::status::can_migrate_vmi;
use super::{backoff, timeout, Requeue};
use crate::crd::{
    annotations, labels, MigrationPhase, MigrationState, VirtualMachineInstance,
    VirtualMachineInstanceMigration, VirtualMachineInstanceMigrationStatus, Volume, NON_ROOT_UID,
    ROOT_UID,
};
use crate::events::reasons;
use crate::{Error, Result};

/// Failure reason recorded when the target pod vanished before the transfer started
const TARGET_POD_DOWN: &str = "Target pod is down";

/// Field set by the node agent once direct migration ports are allocated
const DIRECT_MIGRATION_NODE_PORTS: &str = "targetDirectMigrationNodePorts";

/// SELinux context value meaning SELinux is not present on the node
const SELINUX_DISABLED: &str = "none";

/// Run the actions of the migration's current phase
///
/// Returns the requeue the phase asks for (backoff, capacity, pending
/// timeout). Errors are returned after any event describing them has been
/// published.
pub(crate) async fn sync(
    ctx: &Context,
    migration: &VirtualMachineInstanceMigration,
    vmi: &VirtualMachineInstance,
    target_pod: Option<&Pod>,
    status: &mut VirtualMachineInstanceMigrationStatus,
    now: DateTime<Utc>,
) -> Result<Option<Requeue>> {
    if vmi.is_deleting() {
        return Ok(None);
    }

    if is_finalized_on_vmi(migration, vmi) {
        if vmi.is_decentralized_migration() {
            stop_source_vm(ctx, vmi).await?;
        }
        return Ok(None);
    }

    let namespace = migration.namespace().unwrap_or_default();
    let namespace_migrations = ctx.migrations.list_namespaced(&namespace);
    if !can_migrate_vmi(migration, vmi, &namespace_migrations) {
        return Err(Error::ineligible(
            "vmi is ineligible for migration because another migration job is running",
        ));
    }

    match migration.phase() {
        MigrationPhase::Pending => {
            if migration.is_deleting() {
                return cancel_before_handoff(ctx, migration, target_pod).await;
            }
            if let Some(delay) = backoff::evaluate(migration, &namespace_migrations, now) {
                warn!(
                    migration = %migration.key(),
                    delay_secs = delay.as_secs(),
                    "vmi in migration backoff, re-enqueueing"
                );
                ctx.record(
                    vmi,
                    EventType::Warning,
                    reasons::MIGRATION_BACKOFF,
                    format!("backoff migrating vmi {}", migration.vmi_key()),
                )
                .await;
                return Ok(Some(Requeue::after(delay)));
            }
            if !migration.is_local_or_decentralized_target() {
                return Ok(None);
            }
            sync_pending_target(ctx, migration, vmi, target_pod, status, now).await
        }
        MigrationPhase::Scheduling => {
            if migration.is_deleting() {
                return cancel_before_handoff(ctx, migration, target_pod).await;
            }
            if migration.is_local_or_decentralized_source() && vmi.is_running() {
                refresh_source_state(ctx, vmi).await?;
            }
            match target_pod {
                Some(pod) => timeout::handle_pending_pod_timeout(ctx, migration, vmi, pod, now).await,
                None => Ok(None),
            }
        }
        MigrationPhase::Scheduled => {
            if migration.is_deleting() && !is_handed_off(ctx, migration, Some(vmi)) {
                return cancel_before_handoff(ctx, migration, target_pod).await;
            }
            if let Some(pod) = target_pod.filter(|p| pods::is_pod_ready(p)) {
                handle_target_pod_handoff(ctx, migration, vmi, pod, status).await?;
            }
            Ok(None)
        }
        MigrationPhase::PreparingTarget | MigrationPhase::TargetReady | MigrationPhase::Failed => {
            if target_lost_before_start(migration, vmi, target_pod) {
                mark_failed_on_vmi(ctx, migration, vmi, now).await?;
            }
            if migration.phase() == MigrationPhase::Failed {
                ctx.descheduler.mark_eviction_completed(migration).await?;
            }
            Ok(None)
        }
        MigrationPhase::Running => {
            if migration.is_deleting() && vmi.is_migration_synchronized(migration) {
                mark_abort_requested(ctx, migration, vmi).await?;
            }
            Ok(None)
        }
        MigrationPhase::WaitingForSync => {
            init_target_state(ctx, migration, vmi).await?;
            Ok(None)
        }
        MigrationPhase::Synchronizing => {
            init_source_state(ctx, migration, vmi).await?;
            Ok(None)
        }
        MigrationPhase::Unset | MigrationPhase::Succeeded => Ok(None),
    }
}

/// Whether the workload's state is synchronized with and owned by `migration`
fn is_owned_and_synchronized(
    migration: &VirtualMachineInstanceMigration,
    vmi: &VirtualMachineInstance,
) -> bool {
    vmi.is_migration_synchronized(migration)
        && vmi
            .migration_state()
            .is_some_and(|s| s.is_owned_by(migration.uid_str()))
}

fn is_finalized_on_vmi(migration: &VirtualMachineInstanceMigration, vmi: &VirtualMachineInstance) -> bool {
    is_owned_and_synchronized(migration, vmi)
        && vmi
            .migration_state()
            .is_some_and(|s| s.end_timestamp.is_some())
}

/// Whether the destination node agent owns the migration
///
/// True once the workload's state names the migration, or as soon as this
/// controller handed it off and the cache has not caught up yet.
pub(crate) fn is_handed_off(
    ctx: &Context,
    migration: &VirtualMachineInstanceMigration,
    vmi: Option<&VirtualMachineInstance>,
) -> bool {
    vmi.is_some_and(|v| is_owned_and_synchronized(migration, v))
        || ctx.handoffs.contains(&migration.key())
}

/// Annotate the target pod with the time its domain became ready
///
/// The backend-storage PVC is handed over first when the workload keeps
/// persistent device state.
pub(crate) async fn annotate_target_ready(
    ctx: &Context,
    migration: &VirtualMachineInstanceMigration,
    pod: &Pod,
    backend_handoff: bool,
    timestamp: DateTime<Utc>,
) -> Result<()> {
    if backend_handoff {
        ctx.backend_storage.migration_handoff(migration).await?;
    }
    let mut patch = PatchBuilder::new();
    patch.set_map_entry(
        "/metadata/annotations",
        pod.metadata.annotations.as_ref(),
        annotations::MIGRATION_TARGET_READY_TIMESTAMP,
        &timestamp.to_rfc3339(),
    );
    if let Some(patch) = patch.build()? {
        let namespace = pod.namespace().unwrap_or_default();
        ctx.client
            .patch_pod(&namespace, &pod.name_any(), &patch)
            .await?;
        debug!(migration = %migration.key(), pod = %pod_key(pod), "Annotated target pod as ready");
    }
    Ok(())
}

async fn patch_vmi_changes(
    ctx: &Context,
    original: &VirtualMachineInstance,
    updated: &VirtualMachineInstance,
) -> Result<()> {
    if let Some(patch) = vmi_patch(original, updated)? {
        let namespace = original.namespace().unwrap_or_default();
        ctx.client
            .patch_vmi(&namespace, &original.name_any(), &patch)
            .await?;
    }
    Ok(())
}

async fn stop_source_vm(ctx: &Context, vmi: &VirtualMachineInstance) -> Result<()> {
    let namespace = vmi.namespace().unwrap_or_default();
    match ctx.client.stop_vm(&namespace, &vmi.name_any()).await {
        Err(e) if !e.is_not_found() => Err(e),
        _ => {
            info!(vmi = %vmi.name_any(), "Stopped source of finalized decentralized migration");
            Ok(())
        }
    }
}

// =============================================================================
// Pending: target pod creation
// =============================================================================

async fn sync_pending_target(
    ctx: &Context,
    migration: &VirtualMachineInstanceMigration,
    vmi: &VirtualMachineInstance,
    target_pod: Option<&Pod>,
    status: &mut VirtualMachineInstanceMigrationStatus,
    now: DateTime<Utc>,
) -> Result<Option<Requeue>> {
    let namespace = migration.namespace().unwrap_or_default();
    let namespace_pods = ctx.pods.list_namespaced(&namespace);

    let Some(pod) = target_pod else {
        let source_pod = if migration.is_decentralized() {
            let rendered = ctx.templates.render_launch_manifest(vmi).map_err(|e| {
                Error::collaborator("template", format!("failed to render launch manifest: {e}"))
            })?;
            Arc::new(rendered)
        } else {
            match pods::current_vmi_pod(&namespace_pods, vmi) {
                Some(pod) => pod,
                None => {
                    debug!(migration = %migration.key(), "Source pod is gone, not creating a target pod");
                    return Ok(None);
                }
            }
        };
        if migration.has_annotation(annotations::EVACUATION_MIGRATION) {
            ctx.descheduler.mark_eviction_in_progress(&source_pod).await?;
        }
        let vmi = setup_runtime_user(ctx, vmi).await?;
        return handle_target_pod_creation(ctx, migration, &vmi, &source_pod, &namespace_pods, status)
            .await;
    };

    if pods::is_pod_ready(pod) {
        if vmi.has_hotplug_volumes() && pods::attachment_pods(&namespace_pods, pod).is_empty() {
            debug!(migration = %migration.key(), node = pods::node_name(pod), "Creating attachment pod");
            create_attachment_pod(ctx, migration, vmi, pod, &namespace_pods).await?;
        }
        return Ok(None);
    }
    timeout::handle_pending_pod_timeout(ctx, migration, vmi, pod, now).await
}

/// Move the workload to the runtime user the cluster launches with
///
/// Returns the workload the target pod is rendered from.
async fn setup_runtime_user<'a>(
    ctx: &Context,
    vmi: &'a VirtualMachineInstance,
) -> Result<Cow<'a, VirtualMachineInstance>> {
    let user = if ctx.root_enabled() { ROOT_UID } else { NON_ROOT_UID };
    let Some(patch) = runtime_user_patch(vmi, user)? else {
        return Ok(Cow::Borrowed(vmi));
    };
    let namespace = vmi.namespace().unwrap_or_default();
    ctx.client
        .patch_vmi(&namespace, &vmi.name_any(), &patch)
        .await?;
    debug!(vmi = %vmi.name_any(), user, "Set runtime user ahead of target pod creation");

    let mut updated = vmi.clone();
    updated.status.get_or_insert_with(Default::default).runtime_user = Some(user);
    let marks = updated.metadata.annotations.get_or_insert_with(Default::default);
    if user == ROOT_UID {
        marks.remove(annotations::NON_ROOT);
    } else {
        marks
            .entry(annotations::NON_ROOT.to_string())
            .or_insert_with(|| "true".to_string());
    }
    Ok(Cow::Owned(updated))
}

/// Gate, then create the target pod
///
/// Runs under the creation lock so the capacity seen by the gates is the
/// capacity consumed by the new pod.
async fn handle_target_pod_creation(
    ctx: &Context,
    migration: &VirtualMachineInstanceMigration,
    vmi: &VirtualMachineInstance,
    source_pod: &Pod,
    namespace_pods: &[Arc<Pod>],
    status: &mut VirtualMachineInstanceMigrationStatus,
) -> Result<Option<Requeue>> {
    let _creation = ctx.lock_creation().await;
    let key = migration.key();
    let config = ctx.migration_configuration();

    if ctx.pod_expectations.all_pending_creations() > 0 {
        debug!(migration = %key, "Waiting for pending target pod creations to be observed");
        return Ok(Some(Requeue::low_priority(ctx.config.expectation_requeue_delay)));
    }
    if pods::active_pods(namespace_pods, vmi).len() > 1 {
        info!(
            migration = %key,
            vmi = %migration.vmi_key(),
            "Waiting to schedule target pod because the vmi already has multiple running pods"
        );
        return Ok(Some(Requeue::low_priority(ctx.config.expectation_requeue_delay)));
    }

    let running = running_migrations(&ctx.migrations.list(), ctx.vmis.as_ref(), &ctx.pods.list());
    if running.len() >= config.parallel_per_cluster() as usize {
        info!(
            migration = %key,
            running = running.len(),
            "Waiting to schedule target pod because the cluster-wide parallel migration limit is reached"
        );
        return Ok(Some(Requeue::low_priority(ctx.config.capacity_requeue_delay)));
    }
    let source_node = vmi.node_name();
    let outbound = outbound_from_node(&running, ctx.vmis.as_ref(), source_node);
    if outbound >= config.parallel_outbound_per_node() as usize {
        info!(
            migration = %key,
            node = source_node,
            outbound,
            "Waiting to schedule target pod because the outbound migration limit of the node is reached"
        );
        return Ok(Some(Requeue::low_priority(ctx.config.capacity_requeue_delay)));
    }

    if !(vmi.is_running() || migration.is_decentralized_target()) {
        debug!(migration = %key, "vmi is not running, not creating a target pod");
        return Ok(None);
    }

    if !source_node.is_empty() && !ctx.permits.acquire(&key, source_node) {
        info!(migration = %key, node = source_node, "No outbound migration permit left on the node");
        return Ok(Some(Requeue::low_priority(ctx.config.capacity_requeue_delay)));
    }

    let created = match handle_backend_storage(ctx, migration, vmi, status).await {
        Ok(()) => create_target_pod(ctx, migration, vmi, source_pod).await,
        Err(e) => Err(e),
    };
    if let Err(e) = created {
        ctx.permits.release(&key);
        return Err(e);
    }
    Ok(None)
}

/// Record source and target backend-storage PVCs, creating the target if needed
async fn handle_backend_storage(
    ctx: &Context,
    migration: &VirtualMachineInstanceMigration,
    vmi: &VirtualMachineInstance,
    status: &mut VirtualMachineInstanceMigrationStatus,
) -> Result<()> {
    if !vmi.needs_backend_storage() {
        return Ok(());
    }
    let state = status.migration_state.get_or_insert_with(Default::default);
    let source = ctx
        .backend_storage
        .current_pvc_name(vmi)
        .filter(|name| !name.is_empty())
        .ok_or_else(|| {
            Error::collaborator("backend-storage", "no backend-storage PVC found in VMI volume status")
        })?;
    state.source_persistent_state_pvc_name = Some(source.clone());

    if let Some(pvc) = ctx.backend_storage.pvc_for_migration_target(migration) {
        state.target_persistent_state_pvc_name = Some(pvc.name_any());
    }
    if state
        .target_persistent_state_pvc_name
        .as_deref()
        .is_some_and(|name| !name.is_empty())
    {
        return Ok(());
    }

    let vmi_key = migration.vmi_key();
    ctx.pvc_expectations.expect_creations(&vmi_key, 1);
    let pvc = match ctx
        .backend_storage
        .create_pvc_for_migration_target(vmi, migration)
        .await
    {
        Ok(pvc) => pvc,
        Err(e) => {
            ctx.pvc_expectations.creation_observed(&vmi_key);
            return Err(e);
        }
    };
    let target = pvc.name_any();
    if target == source {
        // Shared PVC, no creation event will come
        ctx.pvc_expectations.creation_observed(&vmi_key);
    }
    state.target_persistent_state_pvc_name = Some(target);
    Ok(())
}

async fn create_target_pod(
    ctx: &Context,
    migration: &VirtualMachineInstanceMigration,
    vmi: &VirtualMachineInstance,
    source_pod: &Pod,
) -> Result<()> {
    if !ctx.pvc_expectations.satisfied(&migration.vmi_key()) {
        debug!(migration = %migration.key(), "Waiting for the backend-storage PVC to be observed");
        return Ok(());
    }

    let mut pod = ctx
        .templates
        .render_migration_manifest(vmi, migration, source_pod)
        .map_err(|e| Error::collaborator("template", format!("failed to render launch manifest: {e}")))?;

    let source_state = vmi.migration_state().and_then(|s| s.source_state.as_ref());
    let selinux_context = if migration.is_decentralized_target() {
        let source_node = source_state.and_then(|s| s.node.clone()).unwrap_or_default();
        add_source_node_anti_affinity(&mut pod, source_node);
        source_state.and_then(|s| s.selinux_context.clone())
    } else {
        add_vmi_pod_anti_affinity(&mut pod, vmi.metadata.uid.as_deref().unwrap_or_default());
        vmi.status.as_ref().and_then(|s| s.selinux_context.clone())
    };

    let mut node_selector = migration.spec.added_node_selector.clone().unwrap_or_default();
    let spec = pod.spec.get_or_insert_with(Default::default);
    node_selector.extend(spec.node_selector.take().unwrap_or_default());
    if vmi.uses_host_model_cpu() {
        node_selector.extend(host_model_selector(ctx, migration, vmi, source_pod)?);
    }
    spec.node_selector = Some(node_selector);

    if let Some(image) = migration
        .annotation(annotations::FUNC_TEST_TARGET_IMAGE_OVERRIDE)
        .filter(|image| !image.is_empty())
    {
        if let Some(compute) = spec.containers.iter_mut().find(|c| c.name == COMPUTE_CONTAINER) {
            compute.image = Some(image.to_string());
        }
    }

    if ctx.migration_configuration().match_selinux_level() {
        set_selinux_level(&mut pod, selinux_context.as_deref())?;
    }
    label_for_migration(&mut pod, migration);

    let key = migration.key();
    let namespace = vmi.namespace().unwrap_or_default();
    ctx.pod_expectations.expect_creations(&key, 1);
    match ctx.client.create_pod(&namespace, &pod).await {
        Ok(created) => {
            info!(
                migration = %key,
                pod = %created.name_any(),
                vmi = %migration.vmi_key(),
                "Created migration target pod"
            );
            ctx.record(
                migration,
                EventType::Normal,
                reasons::SUCCESSFUL_CREATE_POD,
                format!("Created migration target pod {}", created.name_any()),
            )
            .await;
            Ok(())
        }
        Err(e) => {
            ctx.pod_expectations.creation_observed(&key);
            if e.is_forbidden() && e.to_string().contains("violates PodSecurity") {
                let message = format!(
                    "failed to create target pod for vmi {}, it needs a privileged namespace to run: {e}",
                    migration.vmi_key()
                );
                ctx.record(vmi, EventType::Warning, reasons::FAILED_CREATE_POD, message.clone())
                    .await;
                return Err(Error::collaborator("kubernetes", message));
            }
            ctx.record(
                vmi,
                EventType::Warning,
                reasons::FAILED_CREATE_POD,
                format!("Error creating pod: {e}"),
            )
            .await;
            Err(Error::collaborator(
                "kubernetes",
                format!("failed to create vmi migration target pod: {e}"),
            ))
        }
    }
}

/// CPU selectors restricting the target to nodes that accept the guest's host model
fn host_model_selector(
    ctx: &Context,
    migration: &VirtualMachineInstanceMigration,
    vmi: &VirtualMachineInstance,
    source_pod: &Pod,
) -> Result<BTreeMap<String, String>> {
    if migration.is_decentralized_target() {
        let source_selectors = vmi
            .migration_state()
            .and_then(|s| s.source_state.as_ref())
            .map(|s| s.node_selectors.clone())
            .unwrap_or_default();
        let required = required_cpu_labels(&source_selectors);
        if required.is_empty() {
            return Err(Error::validation(format!(
                "unable to locate host cpu model in source node selectors of vmi {}",
                migration.vmi_key()
            )));
        }
        return Ok(required);
    }
    let node = ctx
        .nodes
        .get("", vmi.node_name())
        .ok_or_else(|| Error::not_found("Node", vmi.node_name()))?;
    prepare_node_selector(
        &node,
        source_pod.spec.as_ref().and_then(|s| s.node_selector.as_ref()),
    )
}

/// Keep the target off every node already running a pod of the workload
fn add_vmi_pod_anti_affinity(pod: &mut Pod, vmi_uid: &str) {
    let term = PodAffinityTerm {
        label_selector: Some(LabelSelector {
            match_labels: Some(BTreeMap::from([(
                labels::CREATED_BY.to_string(),
                vmi_uid.to_string(),
            )])),
            ..Default::default()
        }),
        topology_key: labels::HOSTNAME.to_string(),
        ..Default::default()
    };
    pod.spec
        .get_or_insert_with(Default::default)
        .affinity
        .get_or_insert_with(Default::default)
        .pod_anti_affinity
        .get_or_insert_with(Default::default)
        .required_during_scheduling_ignored_during_execution
        .get_or_insert_with(Vec::new)
        .push(term);
}

/// Keep a decentralized target off the node the remote source runs on
fn add_source_node_anti_affinity(pod: &mut Pod, source_node: String) {
    let terms = &mut pod
        .spec
        .get_or_insert_with(Default::default)
        .affinity
        .get_or_insert_with(Default::default)
        .node_affinity
        .get_or_insert_with(Default::default)
        .required_during_scheduling_ignored_during_execution
        .get_or_insert_with(Default::default)
        .node_selector_terms;
    if terms.is_empty() {
        terms.push(NodeSelectorTerm::default());
    }
    terms[0]
        .match_expressions
        .get_or_insert_with(Vec::new)
        .push(NodeSelectorRequirement {
            key: labels::HOSTNAME.to_string(),
            operator: "NotIn".to_string(),
            values: Some(vec![source_node]),
        });
}

/// Level part of an SELinux context (`user:role:type:level`)
fn selinux_level(context: &str) -> Result<&str> {
    let mut parts = context.splitn(4, ':');
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(_), Some(_), Some(_), Some(level)) => Ok(level),
        _ => Err(Error::validation(format!("invalid SELinux context {context:?}"))),
    }
}

/// Give the target the source's SELinux categories so shared volumes stay accessible
fn set_selinux_level(pod: &mut Pod, context: Option<&str>) -> Result<()> {
    let context = context.unwrap_or_default();
    if context == SELINUX_DISABLED {
        return Ok(());
    }
    if context.is_empty() {
        return Err(Error::validation("SELinux context not set on VMI status"));
    }
    let level = selinux_level(context)?;
    if level.is_empty() {
        return Ok(());
    }
    pod.spec
        .get_or_insert_with(Default::default)
        .security_context
        .get_or_insert_with(Default::default)
        .se_linux_options = Some(SELinuxOptions {
        level: Some(level.to_string()),
        ..Default::default()
    });
    Ok(())
}

/// Label and annotate a pod as owned by `migration`
fn label_for_migration(pod: &mut Pod, migration: &VirtualMachineInstanceMigration) {
    pod.metadata
        .labels
        .get_or_insert_with(Default::default)
        .insert(labels::MIGRATION_JOB_UID.to_string(), migration.uid_str().to_string());
    pod.metadata
        .annotations
        .get_or_insert_with(Default::default)
        .insert(annotations::MIGRATION_JOB_NAME.to_string(), migration.name_any());
}

fn claim_name(volume: &Volume) -> Option<String> {
    volume
        .persistent_volume_claim
        .as_ref()
        .map(|c| c.claim_name.clone())
        .or_else(|| volume.data_volume.as_ref().map(|d| d.name.clone()))
}

async fn create_attachment_pod(
    ctx: &Context,
    migration: &VirtualMachineInstanceMigration,
    vmi: &VirtualMachineInstance,
    target_pod: &Pod,
    namespace_pods: &[Arc<Pod>],
) -> Result<()> {
    let source_pod = pods::current_vmi_pod(namespace_pods, vmi)
        .ok_or_else(|| Error::not_found("Pod", format!("current pod of vmi {}", migration.vmi_key())))?;
    let volumes = pods::hotplug_volumes(vmi, &source_pod);

    let namespace = vmi.namespace().unwrap_or_default();
    let claims: BTreeMap<String, Arc<PersistentVolumeClaim>> = volumes
        .iter()
        .filter_map(claim_name)
        .filter_map(|name| ctx.pvcs.get(&namespace, &name).map(|pvc| (name, pvc)))
        .collect();

    // Empty volume status forces the attachment pod to mount every volume
    let mut template_vmi = vmi.clone();
    if let Some(status) = template_vmi.status.as_mut() {
        status.volume_status.clear();
    }
    let mut pod = ctx
        .templates
        .render_hotplug_attachment_pod(&volumes, target_pod, &template_vmi, &claims)
        .map_err(|e| {
            Error::collaborator("template", format!("failed to render attachment pod template: {e}"))
        })?;
    label_for_migration(&mut pod, migration);

    let key = migration.key();
    ctx.pod_expectations.expect_creations(&key, 1);
    match ctx.client.create_pod(&namespace, &pod).await {
        Ok(created) => {
            info!(migration = %key, pod = %created.name_any(), "Created attachment pod");
            ctx.record(
                migration,
                EventType::Normal,
                reasons::SUCCESSFUL_CREATE_POD,
                format!("Created attachment pod {}", created.name_any()),
            )
            .await;
            Ok(())
        }
        Err(e) => {
            ctx.pod_expectations.creation_observed(&key);
            ctx.record(
                vmi,
                EventType::Warning,
                reasons::FAILED_CREATE_POD,
                format!("Error creating attachment pod: {e}"),
            )
            .await;
            Err(Error::collaborator(
                "kubernetes",
                format!("failed to create attachment pod: {e}"),
            ))
        }
    }
}

// =============================================================================
// Cancellation and handoff
// =============================================================================

/// Delete the target pod (and its attachment pods) of a migration cancelled before handoff
async fn cancel_before_handoff(
    ctx: &Context,
    migration: &VirtualMachineInstanceMigration,
    target_pod: Option<&Pod>,
) -> Result<Option<Requeue>> {
    let Some(target_pod) = target_pod else {
        return Ok(None);
    };
    let key = migration.key();
    let namespace = target_pod.namespace().unwrap_or_default();
    let mut victims = vec![Arc::new(target_pod.clone())];
    victims.extend(pods::attachment_pods(
        &ctx.pods.list_namespaced(&namespace),
        target_pod,
    ));

    for pod in victims {
        let name = pod_key(&pod);
        ctx.pod_expectations
            .expect_deletions(&key, std::slice::from_ref(&name));
        match ctx.client.delete_pod(&namespace, &pod.name_any()).await {
            Ok(()) => {
                info!(migration = %key, pod = %name, "Deleted pending migration pod of canceled migration");
                ctx.record(
                    migration,
                    EventType::Normal,
                    reasons::SUCCESSFUL_DELETE_POD,
                    format!("migration canceled and pod {name} is deleted"),
                )
                .await;
            }
            Err(e) if e.is_not_found() => {
                ctx.pod_expectations.deletion_observed(&key, &name);
            }
            Err(e) => {
                ctx.pod_expectations.deletion_observed(&key, &name);
                ctx.record(
                    migration,
                    EventType::Warning,
                    reasons::FAILED_DELETE_POD,
                    format!("Error deleting canceled migration target pod: {e}"),
                )
                .await;
                return Err(Error::collaborator(
                    "kubernetes",
                    format!("cannot delete pending target pod {name} for migration although migration is aborted"),
                ));
            }
        }
    }
    Ok(None)
}

/// Write the workload's migration state so the target node agent takes over
///
/// A failed workload patch leaves nothing behind; the next reconcile builds
/// the state again from scratch.
async fn handle_target_pod_handoff(
    ctx: &Context,
    migration: &VirtualMachineInstanceMigration,
    vmi: &VirtualMachineInstance,
    pod: &Pod,
    status: &VirtualMachineInstanceMigrationStatus,
) -> Result<()> {
    if is_owned_and_synchronized(migration, vmi) {
        return Ok(());
    }

    let target_node = pods::node_name(pod).to_string();
    let namespace = vmi.namespace().unwrap_or_default();
    let mut updated = vmi.clone();
    let vmi_status = updated.status.get_or_insert_with(Default::default);

    let mut state = match vmi_status.migration_state.take() {
        Some(mut state) if migration.is_decentralized() => {
            state.completed = false;
            state.failed = false;
            state
        }
        _ => MigrationState::default(),
    };
    state.migration_uid = Some(migration.uid_str().to_string());
    state.target_node = Some(target_node.clone());
    state.source_node = Some(vmi.node_name().to_string());
    state.target_pod = Some(pod.name_any());

    if migration.is_decentralized() {
        let target_state = state.target_state.get_or_insert_with(Default::default);
        target_state.migration_uid = Some(migration.uid_str().to_string());
        target_state.node = Some(target_node.clone());
        target_state.pod = Some(pod.name_any());
        target_state.virtual_machine_instance_uid = vmi.metadata.uid.clone();
        target_state.domain_namespace = Some(namespace.clone());
        target_state.domain_name = Some(vmi.name_any());
        state.source_node = state.source_state.as_ref().and_then(|s| s.node.clone());
    }

    if let Some(recorded) = status.migration_state.as_ref() {
        state.source_pod = recorded.source_pod.clone();
        state.source_persistent_state_pvc_name = recorded.source_persistent_state_pvc_name.clone();
        state.target_persistent_state_pvc_name = recorded.target_persistent_state_pvc_name.clone();
    }

    if vmi.has_hotplug_volumes() {
        let attachment = pods::attachment_pods(&ctx.pods.list_namespaced(&namespace), pod)
            .into_iter()
            .next()
            .ok_or_else(|| Error::internal("target attachment pod not found"))?;
        info!(
            migration = %migration.key(),
            attachment_pod = %attachment.name_any(),
            "Found target attachment pod"
        );
        state.target_attachment_pod_uid = attachment.metadata.uid.clone();
    }

    let vmi_namespace = ctx
        .namespaces
        .get("", &namespace)
        .ok_or_else(|| Error::not_found("Namespace", namespace.clone()))?;
    let policies = ctx.policies.list();
    let policy = match_policy(&policies, vmi.labels(), vmi_namespace.labels());
    apply_configuration(&mut state, &ctx.migration_configuration(), policy);
    vmi_status.migration_state = Some(state);

    updated
        .labels_mut()
        .insert(labels::MIGRATION_TARGET_NODE_NAME.to_string(), target_node);
    if let Some(pvc) = ctx.backend_storage.pvc_for_migration_target(migration) {
        ctx.backend_storage.update_volume_status(&mut updated, &pvc);
    }

    if let Err(e) = patch_vmi_changes(ctx, vmi, &updated).await {
        ctx.record(
            migration,
            EventType::Warning,
            reasons::FAILED_HANDOVER_POD,
            format!("Failed to set MigrationStat in VMI status. :{e}"),
        )
        .await;
        return Err(e);
    }

    ctx.handoffs.add(&migration.key());
    info!(migration = %migration.key(), vmi = %migration.vmi_key(), "Handed off migration to target node agent");
    ctx.record(
        migration,
        EventType::Normal,
        reasons::SUCCESSFUL_HANDOVER_POD,
        "Migration target pod is ready for preparation by virt-handler.".to_string(),
    )
    .await;
    Ok(())
}

/// Ask the node agent to cancel a migration it already owns
async fn mark_abort_requested(
    ctx: &Context,
    migration: &VirtualMachineInstanceMigration,
    vmi: &VirtualMachineInstance,
) -> Result<()> {
    let mut updated = vmi.clone();
    let Some(state) = updated
        .status
        .as_mut()
        .and_then(|s| s.migration_state.as_mut())
    else {
        return Err(Error::internal(
            "migration state is nil when trying to mark migration abortion in vmi status",
        ));
    };
    state.abort_requested = true;

    let Some(patch) = vmi_patch(vmi, &updated)? else {
        return Ok(());
    };
    let namespace = vmi.namespace().unwrap_or_default();
    if let Err(e) = ctx.client.patch_vmi(&namespace, &vmi.name_any(), &patch).await {
        ctx.record(
            migration,
            EventType::Warning,
            reasons::FAILED_ABORT_MIGRATION,
            format!("failed to set MigrationState in VMI status. :{e}"),
        )
        .await;
        return Err(e);
    }
    info!(migration = %migration.key(), "Signaled migration to be aborted");
    ctx.record(
        migration,
        EventType::Normal,
        reasons::SUCCESSFUL_ABORT_MIGRATION,
        "Migration is ready to be canceled by virt-handler.".to_string(),
    )
    .await;
    Ok(())
}

// =============================================================================
// After handoff
// =============================================================================

/// The target pod vanished and the node agent never started the transfer
fn target_lost_before_start(
    migration: &VirtualMachineInstanceMigration,
    vmi: &VirtualMachineInstance,
    target_pod: Option<&Pod>,
) -> bool {
    if !migration.is_local_or_decentralized_target()
        || target_pod.is_some_and(|p| !pods::is_pod_down(p))
        || !vmi.is_migration_synchronized(migration)
    {
        return false;
    }
    vmi.migration_state().is_some_and(|s| {
        let has_direct_ports = s
            .extra
            .get(DIRECT_MIGRATION_NODE_PORTS)
            .and_then(|ports| ports.as_object())
            .is_some_and(|ports| !ports.is_empty());
        !has_direct_ports && s.start_timestamp.is_none() && !s.failed && !s.completed
    })
}

/// Finalize the workload's migration state on behalf of the node agent
async fn mark_failed_on_vmi(
    ctx: &Context,
    migration: &VirtualMachineInstanceMigration,
    vmi: &VirtualMachineInstance,
    now: DateTime<Utc>,
) -> Result<()> {
    let mut updated = vmi.clone();
    let Some(state) = updated
        .status
        .as_mut()
        .and_then(|s| s.migration_state.as_mut())
    else {
        return Ok(());
    };
    state.start_timestamp = Some(now);
    state.end_timestamp = Some(now);
    state.failed = true;
    state.completed = true;
    // The node agent may already have reported a better reason
    if state.failure_reason.as_deref().unwrap_or_default().is_empty() {
        state.failure_reason = Some(TARGET_POD_DOWN.to_string());
    }

    if let Err(e) = patch_vmi_changes(ctx, vmi, &updated).await {
        error!(migration = %migration.key(), error = %e, "Failed to mark migration failed on vmi");
        return Err(e);
    }
    info!(
        migration = %migration.key(),
        "Marked migration failed on vmi because the target pod disappeared before the migration started"
    );
    ctx.record(
        vmi,
        EventType::Warning,
        reasons::FAILED_MIGRATION,
        format!(
            "VirtualMachineInstance migration uid {} failed. reason: {TARGET_POD_DOWN}",
            migration.uid_str()
        ),
    )
    .await;
    Ok(())
}

/// Point the decentralized source state at the pod and node running the workload now
async fn refresh_source_state(ctx: &Context, vmi: &VirtualMachineInstance) -> Result<()> {
    if vmi
        .migration_state()
        .and_then(|s| s.source_state.as_ref())
        .is_none()
    {
        return Ok(());
    }
    let namespace = vmi.namespace().unwrap_or_default();
    let Some(source_pod) = pods::current_vmi_pod(&ctx.pods.list_namespaced(&namespace), vmi) else {
        return Ok(());
    };
    let mut updated = vmi.clone();
    if let Some(source_state) = updated
        .status
        .as_mut()
        .and_then(|s| s.migration_state.as_mut())
        .and_then(|s| s.source_state.as_mut())
    {
        source_state.pod = Some(source_pod.name_any());
        source_state.node = Some(vmi.node_name().to_string());
    }
    patch_vmi_changes(ctx, vmi, &updated).await
}

// =============================================================================
// Decentralized pre-stages
// =============================================================================

/// Publish the receiving side of a decentralized migration on the workload
async fn init_target_state(
    ctx: &Context,
    migration: &VirtualMachineInstanceMigration,
    vmi: &VirtualMachineInstance,
) -> Result<()> {
    let mut updated = vmi.clone();
    let target_state = updated
        .status
        .get_or_insert_with(Default::default)
        .migration_state
        .get_or_insert_with(Default::default)
        .target_state
        .get_or_insert_with(Default::default);
    target_state.migration_uid = Some(migration.uid_str().to_string());
    target_state.sync_address = ctx.synchronization_address();
    target_state.virtual_machine_instance_uid = vmi.metadata.uid.clone();
    target_state.domain_namespace = vmi.namespace();
    target_state.domain_name = Some(vmi.name_any());
    patch_vmi_changes(ctx, vmi, &updated).await
}

/// Publish the sending side of a decentralized migration on the workload
async fn init_source_state(
    ctx: &Context,
    migration: &VirtualMachineInstanceMigration,
    vmi: &VirtualMachineInstance,
) -> Result<()> {
    let namespace = vmi.namespace().unwrap_or_default();
    let source_pod = pods::current_vmi_pod(&ctx.pods.list_namespaced(&namespace), vmi);
    let pod_selector = source_pod
        .as_deref()
        .and_then(|p| p.spec.as_ref())
        .and_then(|s| s.node_selector.as_ref());
    let node_selectors = if vmi.uses_host_model_cpu() {
        let node = ctx
            .nodes
            .get("", vmi.node_name())
            .ok_or_else(|| Error::not_found("Node", vmi.node_name()))?;
        prepare_node_selector(&node, pod_selector)?
    } else {
        pod_selector.cloned().unwrap_or_default()
    };

    let mut updated = vmi.clone();
    let source_state = updated
        .status
        .get_or_insert_with(Default::default)
        .migration_state
        .get_or_insert_with(Default::default)
        .source_state
        .get_or_insert_with(Default::default);
    source_state.migration_uid = Some(migration.uid_str().to_string());
    source_state.node = Some(vmi.node_name().to_string());
    source_state.pod = source_pod.map(|p| p.name_any());
    source_state.sync_address = ctx.synchronization_address();
    source_state.node_selectors = node_selectors;
    source_state.selinux_context = vmi.status.as_ref().and_then(|s| s.selinux_context.clone());
    source_state.persistent_state_pvc_name = ctx.backend_storage.current_pvc_name(vmi);
    patch_vmi_changes(ctx, vmi, &updated).await
}
