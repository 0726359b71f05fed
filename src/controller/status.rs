//! Phase State Machine
//!
//! [`compute_status`] turns what the controller observes into the new
//! migration status. It performs no I/O: side effects that must happen
//! before the status is written (backend-storage cleanup, eviction markers,
//! the target-ready annotation) are returned as [`Effect`]s for the caller
//! to run, together with the events to publish.
//!
//! Failure checks run in a fixed order and short-circuit the phase switch:
//! final phase, missing workload, workload shut down, cancellation before
//! handoff, target pod down, target pod gone, migration state cleared,
//! migration state taken over, failure reported by the source node,
//! cancellation after handoff, attachment pod down.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::events::EventType;
use kube::ResourceExt;
use tracing::{error, info};

use super::pods;
use crate::crd::{
    annotations, conditions, Condition, ConditionStatus, ConditionsExt, KubeVirt, MigrationPhase,
    PhaseTransitionTimestamp, VirtualMachineInstance, VirtualMachineInstanceMigration,
    VirtualMachineInstanceMigrationStatus, MIGRATION_FINALIZER,
};
use crate::events::reasons;
use crate::{Error, Result};

/// Side effect the caller runs before writing the status
#[derive(Clone, Debug, PartialEq)]
pub enum Effect {
    /// Drop the target backend-storage PVC
    AbortBackendStorage,
    /// Settle backend-storage PVCs of an interrupted migration
    RecoverBackendStorage,
    /// Clear the descheduler eviction marker on the source pod
    MarkEvictionCompleted,
    /// Annotate the target pod once the agent reports the domain ready
    TargetDomainReady {
        /// Hand the backend-storage PVC over first
        backend_handoff: bool,
        /// Timestamp reported by the agent
        timestamp: DateTime<Utc>,
    },
}

/// Event to publish on the migration
#[derive(Clone, Debug)]
pub struct StatusEvent {
    /// Normal or Warning
    pub type_: EventType,
    /// Machine-readable reason
    pub reason: &'static str,
    /// Human-readable message
    pub note: String,
}

impl StatusEvent {
    fn warning(note: impl Into<String>) -> Self {
        Self {
            type_: EventType::Warning,
            reason: reasons::FAILED_MIGRATION,
            note: note.into(),
        }
    }
}

/// Everything [`compute_status`] looks at
pub struct StatusInput<'a> {
    /// The migration as cached
    pub migration: &'a VirtualMachineInstanceMigration,
    /// Status after this pass's sync step wrote into it
    pub working_status: VirtualMachineInstanceMigrationStatus,
    /// The workload, if it exists
    pub vmi: Option<&'a VirtualMachineInstance>,
    /// First target pod of the migration
    pub target_pod: Option<&'a Pod>,
    /// First attachment pod of the target pod
    pub attachment_pod: Option<&'a Pod>,
    /// The workload's current launcher pod
    pub source_pod: Option<&'a Pod>,
    /// Whether the node agent already owns the migration
    pub handed_off: bool,
    /// Whether no other live migration owns the workload
    pub can_migrate: bool,
    /// Error returned by this pass's sync step
    pub sync_error: Option<&'a Error>,
    /// Cached KubeVirt resources
    pub kubevirts: &'a [Arc<KubeVirt>],
    /// Evaluation time
    pub now: DateTime<Utc>,
}

/// Outcome of [`compute_status`]
#[derive(Debug)]
pub struct StatusDecision {
    /// New status
    pub status: VirtualMachineInstanceMigrationStatus,
    /// New finalizer list
    pub finalizers: Vec<String>,
    /// Events to publish
    pub events: Vec<StatusEvent>,
    /// Effects to run before writing
    pub effects: Vec<Effect>,
}

impl StatusDecision {
    /// Phase after this pass
    pub fn phase(&self) -> MigrationPhase {
        self.status.phase
    }
}

/// Whether no other non-final migration owns the workload
///
/// A workload whose migration state names a migration that no longer
/// exists, or one that already finished, can be taken over.
pub fn can_migrate_vmi(
    migration: &VirtualMachineInstanceMigration,
    vmi: &VirtualMachineInstance,
    namespace_migrations: &[Arc<VirtualMachineInstanceMigration>],
) -> bool {
    let Some(owner) = vmi
        .migration_state()
        .and_then(|s| s.migration_uid.as_deref())
        .filter(|uid| !uid.is_empty())
    else {
        return true;
    };
    if owner == migration.uid_str() {
        return true;
    }
    namespace_migrations
        .iter()
        .find(|m| m.uid_str() == owner)
        .map_or(true, |current| current.is_final())
}

struct Builder<'a> {
    input: &'a StatusInput<'a>,
    status: VirtualMachineInstanceMigrationStatus,
    events: Vec<StatusEvent>,
    effects: Vec<Effect>,
}

impl Builder<'_> {
    fn set_phase(&mut self, next: MigrationPhase) -> Result<()> {
        let current = self.input.migration.phase();
        if !current.can_transition_to(next) {
            return Err(Error::internal(format!(
                "migration {} cannot move from {current} to {next}",
                self.input.migration.key()
            )));
        }
        self.status.phase = next;
        Ok(())
    }

    fn add_condition(&mut self, type_: &str) {
        if self.input.migration.conditions().has_condition(type_) {
            return;
        }
        self.status.conditions.push(Condition {
            last_probe_time: Some(self.input.now),
            ..Condition::new(type_, ConditionStatus::True)
        });
    }

    fn fail(&mut self) -> Result<()> {
        self.effects.push(Effect::AbortBackendStorage);
        self.set_phase(MigrationPhase::Failed)
    }

    fn interrupt(&mut self, vmi: Option<&VirtualMachineInstance>) -> Result<()> {
        match vmi {
            Some(vmi) if vmi.needs_backend_storage() => {
                self.effects.push(Effect::RecoverBackendStorage);
                self.set_phase(MigrationPhase::Failed)
            }
            _ => self.fail(),
        }
    }

    fn warn(&mut self, note: impl Into<String>) {
        self.events.push(StatusEvent::warning(note));
    }
}

/// Compute the next status of a migration
pub fn compute_status(input: &StatusInput<'_>) -> Result<StatusDecision> {
    let migration = input.migration;
    let mut b = Builder {
        input,
        status: input.working_status.clone(),
        events: Vec::new(),
        effects: Vec::new(),
    };
    let mut finalizers = migration.finalizers().to_vec();

    let target_pod = input.target_pod;
    let attachment_pod = input.attachment_pod;

    if migration.is_final() {
        if let Some(vmi) = input.vmi {
            let owned = vmi
                .migration_state()
                .is_some_and(|s| s.is_owned_by(migration.uid_str()));
            if vmi.is_migration_synchronized(migration) && owned {
                b.status.migration_state = vmi.migration_state().cloned();
            }
        }
        finalizers.retain(|f| f != MIGRATION_FINALIZER);
    } else if let Some(vmi) = input.vmi {
        let state = vmi.migration_state();
        let synchronized = vmi.is_migration_synchronized(migration);
        let owned = state.is_some_and(|s| s.is_owned_by(migration.uid_str()));

        if vmi.is_final() && !vmi.is_migration_source() {
            b.interrupt(Some(vmi))?;
            b.warn("Migration failed vmi shutdown during migration.");
            error!(migration = %migration.key(), "Unable to migrate vmi because vmi is shutdown");
        } else if migration.is_deleting() && !input.handed_off {
            b.warn("Migration failed due to being canceled");
            b.add_condition(conditions::ABORT_REQUESTED);
            b.fail()?;
        } else if target_pod.is_some_and(pods::is_pod_down) {
            b.interrupt(Some(vmi))?;
            b.warn("Migration failed because target pod shutdown during migration");
            error!(migration = %migration.key(), "Target pod shutdown during migration");
        } else if migration.target_is_created()
            && target_pod.is_none()
            && migration.is_local_or_decentralized_target()
        {
            b.interrupt(Some(vmi))?;
            b.warn("Migration target pod was removed during active migration.");
            error!(migration = %migration.key(), "Target pod disappeared during migration");
        } else if migration.target_is_handed_off() && !synchronized {
            b.fail()?;
            b.warn("VMI's migration state was cleared during the active migration.");
            error!(migration = %migration.key(), "VMI migration state cleared during migration");
        } else if migration.target_is_handed_off() && synchronized && !owned {
            b.fail()?;
            b.warn("VMI's migration state was taken over by another migration job during active migration.");
            error!(migration = %migration.key(), "VMI migration state taken over by another migration");
        } else if synchronized && owned && state.is_some_and(|s| s.failed) {
            b.fail()?;
            b.warn("source node reported migration failed");
            error!(migration = %migration.key(), "VMI reported migration failed");
        } else if migration.is_deleting()
            && !migration.conditions().has_condition(conditions::ABORT_REQUESTED)
        {
            b.add_condition(conditions::ABORT_REQUESTED);
        } else if attachment_pod.is_some_and(pods::is_pod_down) {
            b.fail()?;
            b.warn("Migration failed because target attachment pod shutdown during migration");
            error!(migration = %migration.key(), "Target attachment pod shutdown during migration");
        } else {
            process_phase(&mut b, vmi)?;
        }
    } else {
        b.fail()?;
        b.warn("Migration failed because vmi does not exist.");
        error!(migration = %migration.key(), "VMI does not exist");
    }

    if b.status.phase == MigrationPhase::Failed {
        b.effects.push(Effect::MarkEvictionCompleted);
    }

    record_phase_transition(migration.phase(), &mut b.status, input.now);
    set_source_pod(&mut b.status, input.source_pod);
    set_synchronization_addresses(&mut b.status, input.kubevirts)?;

    Ok(StatusDecision {
        status: b.status,
        finalizers,
        events: b.events,
        effects: b.effects,
    })
}

fn process_phase(b: &mut Builder<'_>, vmi: &VirtualMachineInstance) -> Result<()> {
    let input = b.input;
    let migration = input.migration;
    let pod = input.target_pod;
    let attachment_ready = input.attachment_pod.is_some_and(pods::is_pod_ready);
    let state = vmi.migration_state();

    match migration.phase() {
        MigrationPhase::Unset => {
            if input.can_migrate {
                let next = if migration.is_decentralized_target() {
                    MigrationPhase::WaitingForSync
                } else if migration.is_decentralized_source() {
                    MigrationPhase::Synchronizing
                } else {
                    MigrationPhase::Pending
                };
                b.set_phase(next)?;
            } else {
                b.fail()?;
                b.warn("VMI is not eligible for migration because another migration job is in progress.");
                error!(migration = %migration.key(), "Migration not eligible because another job is in progress");
            }
        }
        MigrationPhase::Pending => {
            if migration.is_local_or_decentralized_target() {
                if pod.is_some() {
                    if !vmi.has_hotplug_volumes() || attachment_ready {
                        b.set_phase(MigrationPhase::Scheduling)?;
                    }
                } else if input
                    .sync_error
                    .is_some_and(|e| e.to_string().contains("exceeded quota"))
                {
                    b.add_condition(conditions::REJECTED_BY_RESOURCE_QUOTA);
                }
            } else if migration.is_decentralized_source() && vmi.is_running() {
                b.set_phase(MigrationPhase::Scheduling)?;
            }
        }
        MigrationPhase::WaitingForSync => {
            if vmi.is_migration_source_synchronized() {
                b.set_phase(MigrationPhase::Pending)?;
            }
        }
        MigrationPhase::Synchronizing => {
            if vmi.is_migration_synchronized(migration) {
                b.set_phase(MigrationPhase::Pending)?;
            }
        }
        MigrationPhase::Scheduling => {
            b.status
                .conditions
                .retain(|c| c.type_ != conditions::REJECTED_BY_RESOURCE_QUOTA);
            if migration.is_decentralized_source() {
                let remote_pod = state
                    .and_then(|s| s.target_state.as_ref())
                    .and_then(|t| t.pod.as_deref())
                    .is_some_and(|p| !p.is_empty());
                if remote_pod {
                    b.set_phase(MigrationPhase::Scheduled)?;
                }
            } else if pod.is_some_and(pods::is_pod_ready)
                && (!vmi.has_hotplug_volumes() || attachment_ready)
            {
                b.set_phase(MigrationPhase::Scheduled)?;
            }
        }
        MigrationPhase::Scheduled => {
            if vmi.is_target_preparing(migration) {
                b.set_phase(MigrationPhase::PreparingTarget)?;
            }
        }
        MigrationPhase::PreparingTarget => {
            let non_empty = |v: Option<&String>| v.is_some_and(|s| !s.is_empty());
            let source_ready = migration.is_local_or_decentralized_source()
                && vmi.is_migration_source_synchronized();
            let target_ready = migration.is_local_or_decentralized_target()
                && state.is_some_and(|s| {
                    non_empty(s.target_node.as_ref()) && non_empty(s.target_node_address.as_ref())
                });
            if source_ready || target_ready {
                b.set_phase(MigrationPhase::TargetReady)?;
            }
        }
        MigrationPhase::TargetReady => {
            if state.is_some_and(|s| s.start_timestamp.is_some()) {
                b.set_phase(MigrationPhase::Running)?;
            }
        }
        MigrationPhase::Running => {
            if migration.is_local_or_decentralized_target() {
                if let (Some(pod), Some(ready)) = (
                    pod,
                    state.and_then(|s| s.target_node_domain_ready_timestamp),
                ) {
                    if !pod
                        .annotations()
                        .contains_key(annotations::MIGRATION_TARGET_READY_TIMESTAMP)
                    {
                        b.effects.push(Effect::TargetDomainReady {
                            backend_handoff: vmi.needs_backend_storage(),
                            timestamp: ready,
                        });
                    }
                }
            }
            let vmi_conditions = vmi.conditions();
            let completed = state.is_some_and(|s| s.completed)
                && !vmi_conditions.has_condition(conditions::VCPU_CHANGE)
                && !vmi_conditions
                    .has_condition_with_status(conditions::MEMORY_CHANGE, ConditionStatus::True)
                && !vmi_conditions
                    .has_condition_with_status(conditions::MIGRATION_REQUIRED, ConditionStatus::True);
            if completed {
                b.set_phase(MigrationPhase::Succeeded)?;
                b.events.push(StatusEvent {
                    type_: EventType::Normal,
                    reason: reasons::SUCCESSFUL_MIGRATION,
                    note: "Source node reported migration succeeded".to_string(),
                });
                info!(migration = %migration.key(), "Migration succeeded");
            }
        }
        MigrationPhase::Succeeded | MigrationPhase::Failed => {}
    }
    Ok(())
}

/// Record when each phase was first entered
fn record_phase_transition(
    previous: MigrationPhase,
    status: &mut VirtualMachineInstanceMigrationStatus,
    now: DateTime<Utc>,
) {
    if previous == status.phase {
        return;
    }
    let phase = status.phase;
    if status
        .phase_transition_timestamps
        .iter()
        .any(|ts| ts.phase == phase)
    {
        return;
    }
    status.phase_transition_timestamps.push(PhaseTransitionTimestamp {
        phase,
        phase_transition_timestamp: now,
    });
}

fn set_source_pod(status: &mut VirtualMachineInstanceMigrationStatus, source_pod: Option<&Pod>) {
    if status.phase != MigrationPhase::Pending {
        return;
    }
    if let Some(pod) = source_pod {
        status
            .migration_state
            .get_or_insert_with(Default::default)
            .source_pod = Some(pod.name_any());
    }
}

fn set_synchronization_addresses(
    status: &mut VirtualMachineInstanceMigrationStatus,
    kubevirts: &[Arc<KubeVirt>],
) -> Result<()> {
    match kubevirts {
        [] => Ok(()),
        [kv] => {
            let kv_status = kv.status.as_ref();
            status.synchronization_address =
                kv_status.and_then(|s| s.synchronization_address.clone());
            status.synchronization_addresses = kv_status
                .map(|s| s.synchronization_addresses.clone())
                .unwrap_or_default();
            Ok(())
        }
        many => Err(Error::validation(format!(
            "more than one KubeVirt custom resource detected: {}",
            many.len()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::pods::tests::{pod, ready_pod, ts};
    use crate::crd::{
        MigrationReceive, MigrationState, VirtualMachineInstanceMigrationSpec,
        VirtualMachineInstanceSpec, VirtualMachineInstanceStatus, VmiPhase,
    };
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    fn migration(phase: MigrationPhase) -> VirtualMachineInstanceMigration {
        let mut m = VirtualMachineInstanceMigration::new(
            "mig",
            VirtualMachineInstanceMigrationSpec {
                vmi_name: "vmi".to_string(),
                ..Default::default()
            },
        );
        m.metadata.namespace = Some("default".to_string());
        m.metadata.uid = Some("mig-uid".to_string());
        m.metadata.finalizers = Some(vec![MIGRATION_FINALIZER.to_string()]);
        m.status = Some(VirtualMachineInstanceMigrationStatus {
            phase,
            ..Default::default()
        });
        m
    }

    fn running_vmi() -> VirtualMachineInstance {
        let mut vmi = VirtualMachineInstance::new("vmi", VirtualMachineInstanceSpec::default());
        vmi.metadata.namespace = Some("default".to_string());
        vmi.metadata.uid = Some("vmi-uid".to_string());
        vmi.status = Some(VirtualMachineInstanceStatus {
            phase: Some(VmiPhase::Running),
            node_name: Some("node-a".to_string()),
            ..Default::default()
        });
        vmi
    }

    fn owned_state(vmi: &mut VirtualMachineInstance, state: MigrationState) {
        vmi.status.as_mut().unwrap().migration_state = Some(MigrationState {
            migration_uid: Some("mig-uid".to_string()),
            ..state
        });
    }

    fn input<'a>(
        migration: &'a VirtualMachineInstanceMigration,
        vmi: Option<&'a VirtualMachineInstance>,
    ) -> StatusInput<'a> {
        StatusInput {
            migration,
            working_status: migration.status_or_default(),
            vmi,
            target_pod: None,
            attachment_pod: None,
            source_pod: None,
            handed_off: false,
            can_migrate: true,
            sync_error: None,
            kubevirts: &[],
            now: now(),
        }
    }

    mod admission {
        use super::*;

        /// Story: a brand-new migration of an idle workload is accepted
        #[test]
        fn story_new_migration_becomes_pending() {
            let m = migration(MigrationPhase::Unset);
            let vmi = running_vmi();
            let decision = compute_status(&input(&m, Some(&vmi))).unwrap();
            assert_eq!(decision.phase(), MigrationPhase::Pending);
            assert_eq!(decision.status.phase_transition_timestamps.len(), 1);
            assert_eq!(
                decision.status.phase_transition_timestamps[0].phase_transition_timestamp,
                now()
            );
            assert!(decision.effects.is_empty());
        }

        #[test]
        fn test_decentralized_target_waits_for_sync() {
            let mut m = migration(MigrationPhase::Unset);
            m.spec.receive = Some(MigrationReceive {
                migration_id: "x".to_string(),
            });
            let vmi = running_vmi();
            let decision = compute_status(&input(&m, Some(&vmi))).unwrap();
            assert_eq!(decision.phase(), MigrationPhase::WaitingForSync);
        }

        #[test]
        fn test_ineligible_migration_fails_with_abort() {
            let m = migration(MigrationPhase::Unset);
            let vmi = running_vmi();
            let mut i = input(&m, Some(&vmi));
            i.can_migrate = false;
            let decision = compute_status(&i).unwrap();
            assert_eq!(decision.phase(), MigrationPhase::Failed);
            assert_eq!(
                decision.effects,
                vec![Effect::AbortBackendStorage, Effect::MarkEvictionCompleted]
            );
            assert!(decision.events[0].note.contains("another migration job is in progress"));
        }

        #[test]
        fn test_takeover_allowed_when_owner_is_final_or_gone() {
            let m = migration(MigrationPhase::Unset);
            let mut vmi = running_vmi();
            vmi.status.as_mut().unwrap().migration_state = Some(MigrationState {
                migration_uid: Some("other-uid".to_string()),
                ..Default::default()
            });
            assert!(can_migrate_vmi(&m, &vmi, &[]));

            let mut other = migration(MigrationPhase::Running);
            other.metadata.name = Some("other".to_string());
            other.metadata.uid = Some("other-uid".to_string());
            let mut others = vec![Arc::new(other.clone())];
            assert!(!can_migrate_vmi(&m, &vmi, &others));

            other.status.as_mut().unwrap().phase = MigrationPhase::Failed;
            others[0] = Arc::new(other);
            assert!(can_migrate_vmi(&m, &vmi, &others));
        }
    }

    mod failures {
        use super::*;

        #[test]
        fn test_missing_vmi_fails_migration() {
            let m = migration(MigrationPhase::Pending);
            let decision = compute_status(&input(&m, None)).unwrap();
            assert_eq!(decision.phase(), MigrationPhase::Failed);
            assert_eq!(
                decision.events[0].note,
                "Migration failed because vmi does not exist."
            );
        }

        #[test]
        fn test_shutdown_vmi_with_backend_storage_recovers() {
            let m = migration(MigrationPhase::Scheduling);
            let mut vmi = running_vmi();
            vmi.status.as_mut().unwrap().phase = Some(VmiPhase::Succeeded);
            vmi.spec.domain.devices.tpm = Some(crate::crd::PersistableDevice {
                persistent: Some(true),
            });
            let decision = compute_status(&input(&m, Some(&vmi))).unwrap();
            assert_eq!(decision.phase(), MigrationPhase::Failed);
            assert_eq!(decision.effects[0], Effect::RecoverBackendStorage);
        }

        #[test]
        fn test_cancel_before_handoff_requests_abort() {
            let mut m = migration(MigrationPhase::Scheduling);
            m.metadata.deletion_timestamp = Some(ts(10));
            let vmi = running_vmi();
            let target = ready_pod("target");
            let mut i = input(&m, Some(&vmi));
            i.target_pod = Some(&target);
            let decision = compute_status(&i).unwrap();
            assert_eq!(decision.phase(), MigrationPhase::Failed);
            assert!(decision
                .status
                .conditions
                .has_condition_with_status(conditions::ABORT_REQUESTED, ConditionStatus::True));
            assert_eq!(decision.events[0].note, "Migration failed due to being canceled");
        }

        #[test]
        fn test_cancel_after_handoff_only_adds_condition() {
            let mut m = migration(MigrationPhase::Running);
            m.metadata.deletion_timestamp = Some(ts(10));
            let mut vmi = running_vmi();
            owned_state(&mut vmi, MigrationState::default());
            let target = ready_pod("target");
            let mut i = input(&m, Some(&vmi));
            i.target_pod = Some(&target);
            i.handed_off = true;
            let decision = compute_status(&i).unwrap();
            assert_eq!(decision.phase(), MigrationPhase::Running);
            assert!(decision.status.conditions.has_condition(conditions::ABORT_REQUESTED));
        }

        #[test]
        fn test_vanished_target_pod_interrupts() {
            let m = migration(MigrationPhase::Scheduled);
            let vmi = running_vmi();
            let decision = compute_status(&input(&m, Some(&vmi))).unwrap();
            assert_eq!(decision.phase(), MigrationPhase::Failed);
            assert!(decision.events[0].note.contains("target pod was removed"));
        }

        #[test]
        fn test_cleared_state_after_handoff_fails() {
            let m = migration(MigrationPhase::TargetReady);
            let vmi = running_vmi();
            let target = ready_pod("target");
            let mut i = input(&m, Some(&vmi));
            i.target_pod = Some(&target);
            let decision = compute_status(&i).unwrap();
            assert_eq!(decision.phase(), MigrationPhase::Failed);
            assert!(decision.events[0].note.contains("was cleared"));
        }

        #[test]
        fn test_source_reported_failure() {
            let m = migration(MigrationPhase::Running);
            let mut vmi = running_vmi();
            owned_state(
                &mut vmi,
                MigrationState {
                    failed: true,
                    ..Default::default()
                },
            );
            let target = ready_pod("target");
            let mut i = input(&m, Some(&vmi));
            i.target_pod = Some(&target);
            let decision = compute_status(&i).unwrap();
            assert_eq!(decision.phase(), MigrationPhase::Failed);
            assert_eq!(decision.events[0].note, "source node reported migration failed");
        }
    }

    mod progress {
        use super::*;

        #[test]
        fn test_pending_waits_for_attachment_pod_with_hotplug() {
            let m = migration(MigrationPhase::Pending);
            let mut vmi = running_vmi();
            vmi.spec.volumes.push(crate::crd::Volume {
                name: "hot".to_string(),
                persistent_volume_claim: Some(crate::crd::ClaimVolumeSource {
                    claim_name: "hot".to_string(),
                    hotpluggable: true,
                }),
                data_volume: None,
            });
            let target = pod("target", "Pending");
            let mut i = input(&m, Some(&vmi));
            i.target_pod = Some(&target);
            assert_eq!(compute_status(&i).unwrap().phase(), MigrationPhase::Pending);

            let attachment = ready_pod("hp");
            i.attachment_pod = Some(&attachment);
            assert_eq!(compute_status(&i).unwrap().phase(), MigrationPhase::Scheduling);
        }

        #[test]
        fn test_quota_error_adds_condition_until_scheduling() {
            let m = migration(MigrationPhase::Pending);
            let vmi = running_vmi();
            let err = Error::validation("pods \"x\" is forbidden: exceeded quota: q");
            let mut i = input(&m, Some(&vmi));
            i.sync_error = Some(&err);
            let decision = compute_status(&i).unwrap();
            assert!(decision
                .status
                .conditions
                .has_condition(conditions::REJECTED_BY_RESOURCE_QUOTA));

            let mut scheduling = migration(MigrationPhase::Scheduling);
            scheduling.status.as_mut().unwrap().conditions = decision.status.conditions.clone();
            let target = pod("target", "Pending");
            let mut i = input(&scheduling, Some(&vmi));
            i.target_pod = Some(&target);
            let decision = compute_status(&i).unwrap();
            assert!(decision.status.conditions.is_empty());
        }

        #[test]
        fn test_source_pod_recorded_while_pending() {
            let m = migration(MigrationPhase::Unset);
            let vmi = running_vmi();
            let source = ready_pod("virt-launcher-vmi-abc");
            let mut i = input(&m, Some(&vmi));
            i.source_pod = Some(&source);
            let decision = compute_status(&i).unwrap();
            assert_eq!(
                decision.status.migration_state.unwrap().source_pod.as_deref(),
                Some("virt-launcher-vmi-abc")
            );
        }

        /// Story: the agent reports the domain ready, then completion
        #[test]
        fn story_running_migration_annotates_then_succeeds() {
            let m = migration(MigrationPhase::Running);
            let mut vmi = running_vmi();
            owned_state(
                &mut vmi,
                MigrationState {
                    target_node_domain_ready_timestamp: Some(now()),
                    ..Default::default()
                },
            );
            let target = ready_pod("target");
            let mut i = input(&m, Some(&vmi));
            i.target_pod = Some(&target);
            i.handed_off = true;
            let decision = compute_status(&i).unwrap();
            assert_eq!(decision.phase(), MigrationPhase::Running);
            assert_eq!(
                decision.effects,
                vec![Effect::TargetDomainReady {
                    backend_handoff: false,
                    timestamp: now()
                }]
            );

            let mut annotated = ready_pod("target");
            annotated.metadata.annotations = Some(
                [(
                    annotations::MIGRATION_TARGET_READY_TIMESTAMP.to_string(),
                    now().to_rfc3339(),
                )]
                .into(),
            );
            owned_state(
                &mut vmi,
                MigrationState {
                    target_node_domain_ready_timestamp: Some(now()),
                    completed: true,
                    ..Default::default()
                },
            );
            let mut i = input(&m, Some(&vmi));
            i.target_pod = Some(&annotated);
            let decision = compute_status(&i).unwrap();
            assert_eq!(decision.phase(), MigrationPhase::Succeeded);
            assert!(decision.effects.is_empty());
            assert_eq!(decision.events[0].reason, reasons::SUCCESSFUL_MIGRATION);
        }

        #[test]
        fn test_pending_hotplug_cpu_change_blocks_success() {
            let m = migration(MigrationPhase::Running);
            let mut vmi = running_vmi();
            owned_state(
                &mut vmi,
                MigrationState {
                    completed: true,
                    ..Default::default()
                },
            );
            vmi.status
                .as_mut()
                .unwrap()
                .conditions
                .push(Condition::new(conditions::VCPU_CHANGE, ConditionStatus::False));
            let target = ready_pod("target");
            let mut i = input(&m, Some(&vmi));
            i.target_pod = Some(&target);
            assert_eq!(compute_status(&i).unwrap().phase(), MigrationPhase::Running);
        }
    }

    mod finalization {
        use super::*;

        #[test]
        fn test_final_migration_drops_finalizer_and_copies_state() {
            let m = migration(MigrationPhase::Succeeded);
            let mut vmi = running_vmi();
            owned_state(
                &mut vmi,
                MigrationState {
                    completed: true,
                    ..Default::default()
                },
            );
            let decision = compute_status(&input(&m, Some(&vmi))).unwrap();
            assert!(decision.finalizers.is_empty());
            assert!(decision.status.migration_state.unwrap().completed);
        }

        #[test]
        fn test_several_kubevirts_is_an_error() {
            let m = migration(MigrationPhase::Pending);
            let vmi = running_vmi();
            let kvs = vec![
                Arc::new(KubeVirt::new("a", Default::default())),
                Arc::new(KubeVirt::new("b", Default::default())),
            ];
            let mut i = input(&m, Some(&vmi));
            i.kubevirts = &kvs;
            let err = compute_status(&i).unwrap_err();
            assert!(err.to_string().contains("more than one KubeVirt"));
        }
    }
}
