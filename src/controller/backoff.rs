//! Backoff Evaluator
//!
//! Holds back automatically created migrations (node evacuation, workload
//! updates) after a run of failures, so a broken target does not turn into
//! a tight create/fail loop.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::crd::{
    annotations, oldest_first, MigrationPhase, VirtualMachineInstanceMigration,
};

/// Backoff after the first failed sibling
pub const INITIAL_BACKOFF: Duration = Duration::from_secs(20);

fn is_backoff_eligible(migration: &VirtualMachineInstanceMigration) -> bool {
    migration.has_annotation(annotations::EVACUATION_MIGRATION)
        || migration.has_annotation(annotations::WORKLOAD_UPDATE_MIGRATION)
}

/// Remaining delay before `migration` may create its target pod
///
/// `namespace_migrations` is every cached migration in the migration's
/// namespace (the migration itself included). Returns `None` when the
/// migration may proceed now.
pub fn evaluate(
    migration: &VirtualMachineInstanceMigration,
    namespace_migrations: &[Arc<VirtualMachineInstanceMigration>],
    now: DateTime<Utc>,
) -> Option<Duration> {
    if migration.has_annotation(annotations::FUNC_TEST_IGNORE_BACKOFF)
        || !is_backoff_eligible(migration)
    {
        return None;
    }

    let mut siblings: Vec<&VirtualMachineInstanceMigration> = namespace_migrations
        .iter()
        .map(Arc::as_ref)
        .filter(|m| m.spec.vmi_name == migration.spec.vmi_name && is_backoff_eligible(m))
        .collect();
    if siblings.len() < 2 {
        return None;
    }

    siblings.sort_by(|a, b| oldest_first(b, a));
    if siblings[0].uid_str() != migration.uid_str() {
        return None;
    }

    let mut backoff = Duration::ZERO;
    for older in &siblings[1..] {
        match older.phase() {
            MigrationPhase::Succeeded => break,
            _ if older.is_deleting() => continue,
            MigrationPhase::Failed => {
                backoff = if backoff.is_zero() {
                    INITIAL_BACKOFF
                } else {
                    backoff * 2
                };
            }
            _ => {}
        }
    }
    if backoff.is_zero() {
        return None;
    }

    // A sibling without a recorded failure time never holds anything back
    let last_failure = siblings[1].phase_transition_time(MigrationPhase::Failed)?;
    let backoff = chrono::Duration::from_std(backoff).ok()?;
    let remaining = (last_failure + backoff - now).to_std().ok()?;
    (!remaining.is_zero()).then_some(remaining)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{
        PhaseTransitionTimestamp, VirtualMachineInstanceMigrationSpec,
        VirtualMachineInstanceMigrationStatus,
    };
    use chrono::TimeZone;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).single().unwrap()
    }

    fn evacuation(name: &str, created: i64) -> VirtualMachineInstanceMigration {
        let mut m = VirtualMachineInstanceMigration::new(
            name,
            VirtualMachineInstanceMigrationSpec {
                vmi_name: "vmi".to_string(),
                ..Default::default()
            },
        );
        m.metadata.namespace = Some("default".to_string());
        m.metadata.uid = Some(format!("uid-{name}"));
        m.metadata.creation_timestamp = Some(Time(at(created)));
        m.metadata.annotations = Some(
            [(annotations::EVACUATION_MIGRATION.to_string(), "node-a".to_string())].into(),
        );
        m
    }

    fn failed_at(mut m: VirtualMachineInstanceMigration, secs: i64) -> VirtualMachineInstanceMigration {
        m.status = Some(VirtualMachineInstanceMigrationStatus {
            phase: MigrationPhase::Failed,
            phase_transition_timestamps: vec![PhaseTransitionTimestamp {
                phase: MigrationPhase::Failed,
                phase_transition_timestamp: at(secs),
            }],
            ..Default::default()
        });
        m
    }

    fn all(ms: Vec<VirtualMachineInstanceMigration>) -> Vec<Arc<VirtualMachineInstanceMigration>> {
        ms.into_iter().map(Arc::new).collect()
    }

    #[test]
    fn test_manual_migrations_never_back_off() {
        let mut current = evacuation("m2", 10);
        current.metadata.annotations = None;
        let ms = all(vec![failed_at(evacuation("m1", 0), 5), current.clone()]);
        assert_eq!(evaluate(&current, &ms, at(6)), None);
    }

    #[test]
    fn test_single_migration_never_backs_off() {
        let current = evacuation("m1", 0);
        let ms = all(vec![current.clone()]);
        assert_eq!(evaluate(&current, &ms, at(1)), None);
    }

    #[test]
    fn test_ignore_annotation_bypasses_backoff() {
        let mut current = evacuation("m2", 10);
        current
            .metadata
            .annotations
            .get_or_insert_with(Default::default)
            .insert(annotations::FUNC_TEST_IGNORE_BACKOFF.to_string(), String::new());
        let ms = all(vec![failed_at(evacuation("m1", 0), 5), current.clone()]);
        assert_eq!(evaluate(&current, &ms, at(6)), None);
    }

    #[test]
    fn test_only_newest_sibling_is_held_back() {
        let older = evacuation("m2", 10);
        let ms = all(vec![
            failed_at(evacuation("m1", 0), 5),
            older.clone(),
            evacuation("m3", 20),
        ]);
        assert_eq!(evaluate(&older, &ms, at(21)), None);
    }

    #[test]
    fn test_success_resets_backoff() {
        let mut succeeded = evacuation("m2", 10);
        succeeded.status = Some(VirtualMachineInstanceMigrationStatus {
            phase: MigrationPhase::Succeeded,
            ..Default::default()
        });
        let current = evacuation("m3", 20);
        let ms = all(vec![failed_at(evacuation("m1", 0), 5), succeeded, current.clone()]);
        assert_eq!(evaluate(&current, &ms, at(21)), None);
    }

    #[test]
    fn test_deleting_failures_are_skipped() {
        let mut deleting = failed_at(evacuation("m1", 0), 5);
        deleting.metadata.deletion_timestamp = Some(Time(at(6)));
        let current = evacuation("m2", 10);
        let ms = all(vec![deleting, current.clone()]);
        assert_eq!(evaluate(&current, &ms, at(11)), None);
    }

    mod growth {
        use super::*;

        /// Story: three evacuation attempts fail in a row; each retry waits longer
        #[test]
        fn story_consecutive_failures_double_the_wait() {
            let m1 = failed_at(evacuation("m1", 0), 10);

            // Second attempt: one failure behind it, 20s after that failure
            let m2 = evacuation("m2", 11);
            let ms = all(vec![m1.clone(), m2.clone()]);
            assert_eq!(evaluate(&m2, &ms, at(12)), Some(Duration::from_secs(18)));
            assert_eq!(evaluate(&m2, &ms, at(30)), None);

            // Third attempt: two failures behind it, 40s after the latest
            let m2 = failed_at(m2, 50);
            let m3 = evacuation("m3", 51);
            let ms = all(vec![m1, m2, m3.clone()]);
            assert_eq!(evaluate(&m3, &ms, at(51)), Some(Duration::from_secs(39)));
            assert!(evaluate(&m3, &ms, at(89)).is_some());
            assert_eq!(evaluate(&m3, &ms, at(90)), None);
            // 20s after the first failure is never enough
            assert!(evaluate(&m3, &ms, at(30)).is_some());
        }

        #[test]
        fn test_siblings_of_other_workloads_are_ignored() {
            let mut other = failed_at(evacuation("m1", 0), 5);
            other.spec.vmi_name = "other-vmi".to_string();
            let current = evacuation("m2", 10);
            let ms = all(vec![other, current.clone()]);
            assert_eq!(evaluate(&current, &ms, at(11)), None);
        }
    }
}
