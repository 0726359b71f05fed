//! Garbage collection of finalized migrations
//!
//! Only the newest finalized migrations of a workload are kept around for
//! inspection; older ones are deleted once a migration of that workload
//! reaches a final phase.

use std::sync::Arc;

use tracing::{debug, info};

use super::migration::Context;
use crate::crd::{oldest_first, VirtualMachineInstanceMigration};
use crate::Result;

/// Finalized, not-deleting migrations of `vmi_name` beyond the newest `keep`
pub fn collectable(
    namespace_migrations: &[Arc<VirtualMachineInstanceMigration>],
    vmi_name: &str,
    keep: usize,
) -> Vec<Arc<VirtualMachineInstanceMigration>> {
    let mut finalized: Vec<_> = namespace_migrations
        .iter()
        .filter(|m| m.spec.vmi_name == vmi_name && m.is_final() && !m.is_deleting())
        .cloned()
        .collect();
    if finalized.len() <= keep {
        return Vec::new();
    }
    finalized.sort_by(|a, b| oldest_first(a, b));
    let excess = finalized.len() - keep;
    finalized.truncate(excess);
    finalized
}

/// Delete the finalized migrations of the workload beyond the configured buffer
pub async fn garbage_collect_finalized(
    ctx: &Context,
    migration: &VirtualMachineInstanceMigration,
) -> Result<()> {
    let namespace = migration.metadata.namespace.as_deref().unwrap_or_default();
    let siblings = ctx.migrations.list_namespaced(namespace);
    let doomed = collectable(
        &siblings,
        &migration.spec.vmi_name,
        ctx.config.finalized_migration_gc_buffer,
    );
    for old in doomed {
        let name = old.metadata.name.as_deref().unwrap_or_default();
        match ctx.client.delete_migration(namespace, name).await {
            Ok(()) => debug!(migration = %old.key(), "Garbage collected finalized migration"),
            Err(e) if e.is_not_found() => {
                info!(migration = %old.key(), "Finalized migration already deleted");
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::client::MockMigrationClient;
    use crate::controller::migration::tests::context_with;
    use crate::controller::pods::tests::ts;
    use crate::crd::{
        MigrationPhase, VirtualMachineInstanceMigrationSpec, VirtualMachineInstanceMigrationStatus,
    };
    use crate::error::tests::api_error;
    use crate::store::MemoryStore;

    fn finished(name: &str, vmi: &str, created: i64, phase: MigrationPhase) -> VirtualMachineInstanceMigration {
        let mut m = VirtualMachineInstanceMigration::new(
            name,
            VirtualMachineInstanceMigrationSpec {
                vmi_name: vmi.to_string(),
                ..Default::default()
            },
        );
        m.metadata.namespace = Some("default".to_string());
        m.metadata.creation_timestamp = Some(ts(created));
        m.status = Some(VirtualMachineInstanceMigrationStatus {
            phase,
            ..Default::default()
        });
        m
    }

    #[test]
    fn test_only_oldest_beyond_buffer_are_collectable() {
        let mut all: Vec<_> = (0..8)
            .map(|i| Arc::new(finished(&format!("m{i}"), "vmi", i, MigrationPhase::Failed)))
            .collect();
        all.push(Arc::new(finished("other", "other-vmi", 0, MigrationPhase::Failed)));
        all.push(Arc::new(finished("live", "vmi", 0, MigrationPhase::Running)));
        let names: Vec<_> = collectable(&all, "vmi", 5)
            .iter()
            .map(|m| m.metadata.name.clone().unwrap())
            .collect();
        assert_eq!(names, vec!["m0", "m1", "m2"]);
    }

    #[test]
    fn test_deleting_migrations_are_skipped() {
        let mut deleting = finished("gone", "vmi", 0, MigrationPhase::Succeeded);
        deleting.metadata.deletion_timestamp = Some(ts(5));
        let all = vec![
            Arc::new(deleting),
            Arc::new(finished("kept", "vmi", 1, MigrationPhase::Succeeded)),
        ];
        assert!(collectable(&all, "vmi", 1).is_empty());
    }

    /// Story: the eighth finished migration of a workload trims history back to five
    #[tokio::test]
    async fn story_history_trimmed_to_buffer() {
        let mut client = MockMigrationClient::new();
        client
            .expect_delete_migration()
            .withf(|_, name| name == "m0")
            .returning(|_, _| Err(api_error(404, "not found")));
        client
            .expect_delete_migration()
            .withf(|_, name| name == "m1" || name == "m2")
            .times(2)
            .returning(|_, _| Ok(()));
        let (mut ctx, _events) = context_with(client);
        let store = MemoryStore::from_objects(
            (0..8).map(|i| finished(&format!("m{i}"), "vmi", i, MigrationPhase::Succeeded)),
        );
        ctx.migrations = Arc::new(store);
        let newest = finished("m7", "vmi", 7, MigrationPhase::Succeeded);
        garbage_collect_finalized(&ctx, &newest).await.unwrap();
    }
}
