//! Watch event handlers
//!
//! Every watched kind funnels into [`EventHandlers`], which turns a cache
//! change into migration keys on the shared queue and records the pod and
//! PVC observations the expectation tracker waits for.
//! [`run_informer`] drives one watch, keeps its cache current and calls the
//! handler with the previous object on updates.

use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::{Node, PersistentVolumeClaim, Pod, ResourceQuota};
use kube::runtime::reflector::{store::Writer, ObjectRef};
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::{Api, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use super::migration::Context;
use super::pods::pod_key;
use super::queue::PriorityQueue;
use crate::crd::{
    annotations, conditions, labels, ConditionsExt, KubeVirt, VirtualMachineInstance,
    VirtualMachineInstanceMigration, BACKEND_STORAGE_PREFIX,
};

/// Add, update and delete notifications for one kind
pub trait ResourceEventHandler<K>: Send + Sync {
    /// Object appeared in the cache
    fn on_add(&self, obj: &K);

    /// Object changed; `old` is the previously cached copy
    fn on_update(&self, old: &K, new: &K);

    /// Object left the cache
    fn on_delete(&self, obj: &K);
}

/// Maps cache changes of every watched kind to migration keys
pub struct EventHandlers {
    ctx: Arc<Context>,
    queue: Arc<PriorityQueue>,
}

impl EventHandlers {
    /// Handlers enqueueing into `queue`
    pub fn new(ctx: Arc<Context>, queue: Arc<PriorityQueue>) -> Self {
        Self { ctx, queue }
    }

    fn enqueue(&self, migration: &VirtualMachineInstanceMigration) {
        self.queue.add(&migration.key());
    }

    /// Migration owning a target or attachment pod
    ///
    /// The label carries the migration UID and the annotation its name; a
    /// migration recreated under the same name does not adopt the pod.
    fn pod_owner(&self, pod: &Pod) -> Option<Arc<VirtualMachineInstanceMigration>> {
        let uid = pod.labels().get(labels::MIGRATION_JOB_UID)?;
        let name = pod.annotations().get(annotations::MIGRATION_JOB_NAME)?;
        let namespace = pod.namespace().unwrap_or_default();
        self.ctx
            .migrations
            .get(&namespace, name)
            .filter(|m| m.uid_str() == uid.as_str())
    }

    fn pod_deleted(&self, pod: &Pod) {
        let Some(owner) = self.pod_owner(pod) else {
            return;
        };
        let key = owner.key();
        self.ctx.pod_expectations.deletion_observed(&key, &pod_key(pod));
        debug!(migration = %key, pod = %pod_key(pod), "Observed migration pod deletion");
        self.queue.add(&key);
    }

    fn enqueue_pod_owner(&self, pod: &Pod) {
        if let Some(owner) = self.pod_owner(pod) {
            self.enqueue(&owner);
        }
    }

    fn enqueue_migrations_of_vmi(&self, vmi: &VirtualMachineInstance) {
        let name = vmi.name_any();
        let namespace = vmi.namespace().unwrap_or_default();
        self.ctx
            .migrations
            .list_namespaced(&namespace)
            .iter()
            .filter(|m| m.labels().get(labels::MIGRATION_SELECTOR) == Some(&name))
            .for_each(|m| self.enqueue(m));
    }

    fn enqueue_quota_rejected(&self, quota: &ResourceQuota) {
        let namespace = quota.namespace().unwrap_or_default();
        for migration in self.ctx.migrations.list_namespaced(&namespace) {
            if migration
                .conditions()
                .has_condition(conditions::REJECTED_BY_RESOURCE_QUOTA)
            {
                debug!(migration = %migration.key(), quota = %quota.name_any(), "Quota changed, retrying rejected migration");
                self.enqueue(&migration);
            }
        }
    }

    fn adopt_outbound_limit(&self, kubevirt: &KubeVirt) {
        let max = kubevirt
            .migration_configuration()
            .parallel_outbound_per_node();
        self.ctx.permits.limiter().update_max_permits(max);
    }
}

impl ResourceEventHandler<VirtualMachineInstanceMigration> for EventHandlers {
    fn on_add(&self, obj: &VirtualMachineInstanceMigration) {
        self.enqueue(obj);
    }

    fn on_update(&self, _old: &VirtualMachineInstanceMigration, new: &VirtualMachineInstanceMigration) {
        self.enqueue(new);
    }

    fn on_delete(&self, obj: &VirtualMachineInstanceMigration) {
        self.enqueue(obj);
    }
}

impl ResourceEventHandler<Pod> for EventHandlers {
    fn on_add(&self, obj: &Pod) {
        if obj.metadata.deletion_timestamp.is_some() {
            // Restarted controller seeing a pod already on its way out
            self.pod_deleted(obj);
            return;
        }
        let Some(owner) = self.pod_owner(obj) else {
            return;
        };
        let key = owner.key();
        self.ctx.pod_expectations.creation_observed(&key);
        debug!(migration = %key, pod = %pod_key(obj), "Observed migration pod creation");
        self.queue.add(&key);
    }

    fn on_update(&self, old: &Pod, new: &Pod) {
        if old.resource_version() == new.resource_version() {
            return;
        }
        let labels_changed = old.labels() != new.labels();
        if new.metadata.deletion_timestamp.is_some() {
            self.pod_deleted(new);
            if labels_changed {
                self.enqueue_pod_owner(old);
            }
            return;
        }
        if labels_changed {
            self.enqueue_pod_owner(old);
        }
        self.enqueue_pod_owner(new);
    }

    fn on_delete(&self, obj: &Pod) {
        self.pod_deleted(obj);
    }
}

impl ResourceEventHandler<PersistentVolumeClaim> for EventHandlers {
    fn on_add(&self, obj: &PersistentVolumeClaim) {
        if !obj.name_any().contains(BACKEND_STORAGE_PREFIX) {
            return;
        }
        let Some(name) = obj.labels().get(labels::MIGRATION_NAME) else {
            return;
        };
        let namespace = obj.namespace().unwrap_or_default();
        let Some(migration) = self.ctx.migrations.get(&namespace, name) else {
            return;
        };
        self.ctx.pvc_expectations.creation_observed(&migration.vmi_key());
        debug!(migration = %migration.key(), pvc = %obj.name_any(), "Observed backend-storage PVC creation");
        self.enqueue(&migration);
    }

    fn on_update(&self, _old: &PersistentVolumeClaim, _new: &PersistentVolumeClaim) {}

    fn on_delete(&self, _obj: &PersistentVolumeClaim) {}
}

impl ResourceEventHandler<VirtualMachineInstance> for EventHandlers {
    fn on_add(&self, obj: &VirtualMachineInstance) {
        self.enqueue_migrations_of_vmi(obj);
    }

    fn on_update(&self, old: &VirtualMachineInstance, new: &VirtualMachineInstance) {
        if old.resource_version() == new.resource_version() {
            return;
        }
        self.enqueue_migrations_of_vmi(new);
    }

    fn on_delete(&self, obj: &VirtualMachineInstance) {
        self.enqueue_migrations_of_vmi(obj);
    }
}

impl ResourceEventHandler<ResourceQuota> for EventHandlers {
    fn on_add(&self, _obj: &ResourceQuota) {}

    fn on_update(&self, _old: &ResourceQuota, new: &ResourceQuota) {
        self.enqueue_quota_rejected(new);
    }

    fn on_delete(&self, obj: &ResourceQuota) {
        self.enqueue_quota_rejected(obj);
    }
}

impl ResourceEventHandler<KubeVirt> for EventHandlers {
    fn on_add(&self, obj: &KubeVirt) {
        self.adopt_outbound_limit(obj);
    }

    fn on_update(&self, old: &KubeVirt, new: &KubeVirt) {
        if old.synchronization_address() != new.synchronization_address() {
            info!(
                old = old.synchronization_address(),
                new = new.synchronization_address(),
                "Synchronization address changed, re-enqueueing active migrations"
            );
            self.ctx
                .migrations
                .list()
                .iter()
                .filter(|m| !m.is_final())
                .for_each(|m| self.enqueue(m));
        }
        self.adopt_outbound_limit(new);
    }

    fn on_delete(&self, _obj: &KubeVirt) {}
}

impl ResourceEventHandler<Node> for EventHandlers {
    fn on_add(&self, _obj: &Node) {}

    fn on_update(&self, _old: &Node, _new: &Node) {}

    fn on_delete(&self, obj: &Node) {
        debug!(node = %obj.name_any(), "Node deleted, dropping its permit bucket");
        self.ctx.permits.limiter().delete(&obj.name_any());
    }
}

/// Watch `api`, keep `writer`'s cache current and notify `handler`
///
/// Runs until the watch stream ends. Watch errors are logged; the stream
/// retries with the default backoff.
pub async fn run_informer<K>(
    api: Api<K>,
    mut writer: Writer<K>,
    handler: Arc<dyn ResourceEventHandler<K>>,
) where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    K::DynamicType: Default + Eq + Hash + Clone,
{
    let kind = K::kind(&K::DynamicType::default()).to_string();
    let reader = writer.as_reader();
    let mut events = watch_stream(api).boxed();
    while let Some(event) = events.next().await {
        let event = match event {
            Ok(event) => event,
            Err(e) => {
                warn!(kind = %kind, error = %e, "Watch failed, retrying");
                continue;
            }
        };
        let previous = match &event {
            Event::Apply(obj) | Event::InitApply(obj) => reader.get(&ObjectRef::from_obj(obj)),
            _ => None,
        };
        writer.apply_watcher_event(&event);
        match &event {
            Event::Apply(obj) | Event::InitApply(obj) => match previous {
                Some(old) => handler.on_update(&old, obj),
                None => handler.on_add(obj),
            },
            Event::Delete(obj) => handler.on_delete(obj),
            Event::Init => debug!(kind = %kind, "Watch relisting"),
            Event::InitDone => debug!(kind = %kind, "Watch relist complete"),
        }
    }
    info!(kind = %kind, "Watch stream ended");
}

fn watch_stream<K>(
    api: Api<K>,
) -> impl futures::Stream<Item = Result<Event<K>, watcher::Error>> + Send
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + 'static,
{
    watcher::watcher(api, watcher::Config::default()).default_backoff()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::client::MockMigrationClient;
    use crate::controller::limiter::NodeMigrationLimiter;
    use crate::controller::migration::tests::{builder_with, in_phase, migration, running_vmi};
    use crate::controller::pods::tests::pod;
    use crate::crd::{Condition, ConditionStatus, KubeVirtSpec, KubeVirtStatus, MigrationPhase};
    use crate::store::MemoryStore;
    use std::collections::BTreeMap;

    fn handlers(
        migrations: Vec<VirtualMachineInstanceMigration>,
        limiter: Arc<NodeMigrationLimiter>,
    ) -> (EventHandlers, Arc<Context>, Arc<PriorityQueue>) {
        let (builder, _events) = builder_with(MockMigrationClient::new());
        let ctx = Arc::new(
            builder
                .migrations(Arc::new(MemoryStore::from_objects(migrations)))
                .limiter(limiter)
                .build(),
        );
        let queue = Arc::new(PriorityQueue::default());
        (EventHandlers::new(ctx.clone(), queue.clone()), ctx, queue)
    }

    fn owned_pod(name: &str, migration_name: &str, uid: &str) -> Pod {
        let mut p = pod(name, "Pending");
        p.metadata.resource_version = Some("1".to_string());
        p.metadata.labels = Some(BTreeMap::from([(
            labels::MIGRATION_JOB_UID.to_string(),
            uid.to_string(),
        )]));
        p.metadata.annotations = Some(BTreeMap::from([(
            annotations::MIGRATION_JOB_NAME.to_string(),
            migration_name.to_string(),
        )]));
        p
    }

    fn kubevirt(sync_address: &str) -> KubeVirt {
        let mut kv = KubeVirt::new("kubevirt", KubeVirtSpec::default());
        kv.status = Some(KubeVirtStatus {
            synchronization_address: Some(sync_address.to_string()),
            ..Default::default()
        });
        kv
    }

    // ==========================================================================
    // Story Tests: Pod observations
    // ==========================================================================

    /// Story: the controller creates a target pod and the watch confirms it
    #[test]
    fn story_pod_creation_is_observed_by_its_migration() {
        let (handlers, ctx, queue) = handlers(vec![migration("mig", "vmi")], Arc::new(NodeMigrationLimiter::new(2)));
        ctx.pod_expectations.expect_creations("default/mig", 1);

        handlers.on_add(&owned_pod("target", "mig", "uid-mig"));

        assert!(ctx.pod_expectations.satisfied("default/mig"));
        assert!(queue.contains("default/mig"));
    }

    #[test]
    fn test_pod_of_recreated_migration_is_ignored() {
        let (handlers, ctx, queue) = handlers(vec![migration("mig", "vmi")], Arc::new(NodeMigrationLimiter::new(2)));
        ctx.pod_expectations.expect_creations("default/mig", 1);

        handlers.on_add(&owned_pod("target", "mig", "uid-previous"));

        assert!(!ctx.pod_expectations.satisfied("default/mig"));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_terminating_pod_counts_as_deletion() {
        let (handlers, ctx, queue) = handlers(vec![migration("mig", "vmi")], Arc::new(NodeMigrationLimiter::new(2)));
        ctx.pod_expectations
            .expect_deletions("default/mig", &["default/target".to_string()]);
        let mut p = owned_pod("target", "mig", "uid-mig");
        p.metadata.deletion_timestamp = Some(crate::controller::pods::tests::ts(1));

        handlers.on_add(&p);

        assert!(ctx.pod_expectations.satisfied("default/mig"));
        assert!(queue.contains("default/mig"));
    }

    #[test]
    fn test_pod_delete_is_observed() {
        let (handlers, ctx, _queue) = handlers(vec![migration("mig", "vmi")], Arc::new(NodeMigrationLimiter::new(2)));
        ctx.pod_expectations
            .expect_deletions("default/mig", &["default/target".to_string()]);

        handlers.on_delete(&owned_pod("target", "mig", "uid-mig"));

        assert!(ctx.pod_expectations.satisfied("default/mig"));
    }

    #[test]
    fn test_resync_with_same_resource_version_is_skipped() {
        let (handlers, _ctx, queue) = handlers(vec![migration("mig", "vmi")], Arc::new(NodeMigrationLimiter::new(2)));
        let p = owned_pod("target", "mig", "uid-mig");

        handlers.on_update(&p, &p);
        assert!(queue.is_empty());

        let mut changed = p.clone();
        changed.metadata.resource_version = Some("2".to_string());
        handlers.on_update(&p, &changed);
        assert!(queue.contains("default/mig"));
    }

    #[test]
    fn test_relabelled_pod_wakes_previous_owner() {
        let (handlers, _ctx, queue) = handlers(
            vec![migration("mig", "vmi"), migration("other", "vmi")],
            Arc::new(NodeMigrationLimiter::new(2)),
        );
        let old = owned_pod("target", "mig", "uid-mig");
        let mut new = owned_pod("target", "other", "uid-other");
        new.metadata.resource_version = Some("2".to_string());

        handlers.on_update(&old, &new);

        assert!(queue.contains("default/mig"));
        assert!(queue.contains("default/other"));
    }

    // ==========================================================================
    // Story Tests: Other kinds
    // ==========================================================================

    #[test]
    fn test_backend_storage_pvc_satisfies_vmi_expectation() {
        let (handlers, ctx, queue) = handlers(vec![migration("mig", "vmi")], Arc::new(NodeMigrationLimiter::new(2)));
        ctx.pvc_expectations.expect_creations("default/vmi", 1);
        let mut pvc = PersistentVolumeClaim::default();
        pvc.metadata.name = Some(format!("{BACKEND_STORAGE_PREFIX}-vmi-x2k4"));
        pvc.metadata.namespace = Some("default".to_string());
        pvc.metadata.labels = Some(BTreeMap::from([(
            labels::MIGRATION_NAME.to_string(),
            "mig".to_string(),
        )]));

        handlers.on_add(&pvc);

        assert!(ctx.pvc_expectations.satisfied("default/vmi"));
        assert!(queue.contains("default/mig"));
    }

    #[test]
    fn test_vmi_change_enqueues_its_migrations_only() {
        let (handlers, _ctx, queue) = handlers(
            vec![migration("mig", "vmi"), migration("elsewhere", "other-vmi")],
            Arc::new(NodeMigrationLimiter::new(2)),
        );

        let old = running_vmi("vmi");
        let mut new = old.clone();
        new.metadata.resource_version = Some("2".to_string());
        handlers.on_update(&old, &new);

        assert!(queue.contains("default/mig"));
        assert!(!queue.contains("default/elsewhere"));
    }

    #[test]
    fn test_vmi_resync_with_same_resource_version_is_skipped() {
        let (handlers, _ctx, queue) = handlers(vec![migration("mig", "vmi")], Arc::new(NodeMigrationLimiter::new(2)));
        let mut vmi = running_vmi("vmi");
        vmi.metadata.resource_version = Some("7".to_string());

        handlers.on_update(&vmi, &vmi.clone());

        assert!(queue.is_empty());
    }

    /// Story: raising a quota retries the migrations it rejected
    #[test]
    fn story_quota_update_retries_rejected_migrations() {
        let mut rejected = in_phase(migration("rejected", "vmi"), MigrationPhase::Pending);
        rejected.status.as_mut().unwrap().conditions = vec![Condition::new(
            conditions::REJECTED_BY_RESOURCE_QUOTA,
            ConditionStatus::True,
        )];
        let waiting = in_phase(migration("waiting", "vmi2"), MigrationPhase::Pending);
        let (handlers, _ctx, queue) = handlers(vec![rejected, waiting], Arc::new(NodeMigrationLimiter::new(2)));
        let mut quota = ResourceQuota::default();
        quota.metadata.name = Some("compute".to_string());
        quota.metadata.namespace = Some("default".to_string());

        handlers.on_update(&quota, &quota);

        assert!(queue.contains("default/rejected"));
        assert!(!queue.contains("default/waiting"));
    }

    #[test]
    fn test_sync_address_change_enqueues_active_migrations() {
        let done = in_phase(migration("done", "vmi"), MigrationPhase::Succeeded);
        let active = in_phase(migration("active", "vmi2"), MigrationPhase::Scheduling);
        let (handlers, _ctx, queue) = handlers(vec![done, active], Arc::new(NodeMigrationLimiter::new(2)));

        handlers.on_update(&kubevirt("a.example:9185"), &kubevirt("a.example:9185"));
        assert!(queue.is_empty());

        handlers.on_update(&kubevirt("a.example:9185"), &kubevirt("b.example:9185"));
        assert!(queue.contains("default/active"));
        assert!(!queue.contains("default/done"));
    }

    #[test]
    fn test_kubevirt_change_resizes_idle_node_buckets() {
        let limiter = Arc::new(NodeMigrationLimiter::new(1));
        let (handlers, _ctx, _queue) = handlers(vec![], limiter.clone());
        assert!(limiter.acquire("node-a"));
        assert!(limiter.release("node-a"));

        handlers.on_add(&kubevirt(""));

        // Cluster default of two outbound migrations per node
        assert_eq!(limiter.max_for("node-a"), 2);
    }

    #[test]
    fn test_node_delete_drops_bucket() {
        let limiter = Arc::new(NodeMigrationLimiter::new(2));
        let (handlers, _ctx, _queue) = handlers(vec![], limiter.clone());
        assert!(limiter.acquire("node-a"));
        let mut node = Node::default();
        node.metadata.name = Some("node-a".to_string());

        handlers.on_delete(&node);

        assert_eq!(limiter.in_use("node-a"), 0);
    }
}
