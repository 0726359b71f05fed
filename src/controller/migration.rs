//! Migration Controller
//!
//! One reconcile of a migration key reads the migration, its workload and
//! the pods around them from the caches, runs the per-phase actions in
//! [`super::sync`], derives the next status with
//! [`super::status::compute_status`] and writes back only what changed.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{Namespace, Node, PersistentVolumeClaim, Pod};
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tracing::{debug, info, instrument};

use super::capacity::OutboundPermits;
use super::client::MigrationClient;
use super::expectations::Expectations;
use super::handoff::HandoffRegistry;
use super::limiter::NodeMigrationLimiter;
use super::patch::{migration_metadata_patch, migration_status_patch};
use super::services::{
    AnnotationDescheduler, BackendStorage, Descheduler, LauncherTemplateService, PvcBackendStorage,
    TemplateService, DEFAULT_LAUNCHER_IMAGE,
};
use super::status::{can_migrate_vmi, compute_status, Effect, StatusInput};
use super::worker::Reconcile;
use super::{gc, pods, sync, ReconcileOutcome, Requeue};
use crate::config::ControllerConfig;
use crate::crd::{
    labels, split_key, KubeVirt, MigrationConfiguration, MigrationPolicy, VirtualMachineInstance,
    VirtualMachineInstanceMigration,
};
use crate::events::EventPublisher;
use crate::store::{MemoryStore, ObjectStore};
use crate::Result;

/// Controller context containing shared state, caches and collaborators
///
/// The context is shared by every worker. Registries carry their own
/// locks; target pod creation is additionally serialized by an internal
/// mutex so capacity is computed and consumed atomically.
///
/// Use [`ContextBuilder`] to construct instances:
///
/// ```ignore
/// let ctx = Context::builder(client, events)
///     .config(config)
///     .migrations(Arc::new(ReflectorStore::new(migration_reader)))
///     .build();
/// ```
pub struct Context {
    /// Process configuration
    pub config: ControllerConfig,
    /// Kubernetes writes (trait object for testability)
    pub client: Arc<dyn MigrationClient>,
    /// Kubernetes Event publisher
    pub events: Arc<dyn EventPublisher>,
    /// Cached migrations
    pub migrations: Arc<dyn ObjectStore<VirtualMachineInstanceMigration>>,
    /// Cached workload instances
    pub vmis: Arc<dyn ObjectStore<VirtualMachineInstance>>,
    /// Cached pods
    pub pods: Arc<dyn ObjectStore<Pod>>,
    /// Cached nodes
    pub nodes: Arc<dyn ObjectStore<Node>>,
    /// Cached persistent volume claims
    pub pvcs: Arc<dyn ObjectStore<PersistentVolumeClaim>>,
    /// Cached migration policies
    pub policies: Arc<dyn ObjectStore<MigrationPolicy>>,
    /// Cached namespaces, for policy namespace selectors
    pub namespaces: Arc<dyn ObjectStore<Namespace>>,
    /// Cached KubeVirt resources (at most one is expected)
    pub kubevirts: Arc<dyn ObjectStore<KubeVirt>>,
    /// Pod renderer
    pub templates: Arc<dyn TemplateService>,
    /// Persistent device state handling
    pub backend_storage: Arc<dyn BackendStorage>,
    /// Eviction markers for node-draining tools
    pub descheduler: Arc<dyn Descheduler>,
    /// Target and attachment pod expectations, keyed by migration key
    pub pod_expectations: Expectations,
    /// Backend-storage PVC expectations, keyed by workload key
    pub pvc_expectations: Expectations,
    /// Migrations the destination node agent owns
    pub handoffs: HandoffRegistry,
    /// Source-node permits held per migration
    pub permits: OutboundPermits,
    creation_lock: tokio::sync::Mutex<()>,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Arc<dyn MigrationClient>, events: Arc<dyn EventPublisher>) -> ContextBuilder {
        ContextBuilder::new(client, events)
    }

    /// Publish an event on `obj`
    pub async fn record<K>(&self, obj: &K, type_: EventType, reason: &str, note: String)
    where
        K: Resource<DynamicType = ()>,
    {
        self.events
            .publish(&obj.object_ref(&()), type_, reason, note)
            .await;
    }

    /// Cluster migration configuration with defaults filled
    pub fn migration_configuration(&self) -> MigrationConfiguration {
        self.kubevirts
            .list()
            .first()
            .map(|kv| kv.migration_configuration())
            .unwrap_or_else(|| MigrationConfiguration::default().with_defaults())
    }

    /// Whether the cluster runs instances as root
    pub fn root_enabled(&self) -> bool {
        self.kubevirts
            .list()
            .first()
            .is_some_and(|kv| kv.root_enabled())
    }

    /// Synchronization address published by the KubeVirt resource
    pub fn synchronization_address(&self) -> Option<String> {
        self.kubevirts
            .list()
            .first()
            .map(|kv| kv.synchronization_address().to_string())
            .filter(|addr| !addr.is_empty())
    }

    /// Serialize target pod creation across workers
    pub(crate) async fn lock_creation(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.creation_lock.lock().await
    }
}

/// Builder for constructing [`Context`] instances
///
/// Every cache defaults to an empty in-memory store and every collaborator
/// to its default implementation over the given client.
///
/// ```ignore
/// let ctx = Context::builder(Arc::new(mock_client), events)
///     .vmis(Arc::new(MemoryStore::from_objects([vmi])))
///     .templates(Arc::new(mock_templates))
///     .build();
/// ```
pub struct ContextBuilder {
    client: Arc<dyn MigrationClient>,
    events: Arc<dyn EventPublisher>,
    config: ControllerConfig,
    launcher_image: String,
    migrations: Option<Arc<dyn ObjectStore<VirtualMachineInstanceMigration>>>,
    vmis: Option<Arc<dyn ObjectStore<VirtualMachineInstance>>>,
    pods: Option<Arc<dyn ObjectStore<Pod>>>,
    nodes: Option<Arc<dyn ObjectStore<Node>>>,
    pvcs: Option<Arc<dyn ObjectStore<PersistentVolumeClaim>>>,
    policies: Option<Arc<dyn ObjectStore<MigrationPolicy>>>,
    namespaces: Option<Arc<dyn ObjectStore<Namespace>>>,
    kubevirts: Option<Arc<dyn ObjectStore<KubeVirt>>>,
    templates: Option<Arc<dyn TemplateService>>,
    backend_storage: Option<Arc<dyn BackendStorage>>,
    descheduler: Option<Arc<dyn Descheduler>>,
    limiter: Option<Arc<NodeMigrationLimiter>>,
}

impl ContextBuilder {
    fn new(client: Arc<dyn MigrationClient>, events: Arc<dyn EventPublisher>) -> Self {
        Self {
            client,
            events,
            config: ControllerConfig::default(),
            launcher_image: DEFAULT_LAUNCHER_IMAGE.to_string(),
            migrations: None,
            vmis: None,
            pods: None,
            nodes: None,
            pvcs: None,
            policies: None,
            namespaces: None,
            kubevirts: None,
            templates: None,
            backend_storage: None,
            descheduler: None,
            limiter: None,
        }
    }

    /// Set the process configuration
    pub fn config(mut self, config: ControllerConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the image of rendered launcher pods
    pub fn launcher_image(mut self, image: impl Into<String>) -> Self {
        self.launcher_image = image.into();
        self
    }

    /// Set the migration cache
    pub fn migrations(mut self, store: Arc<dyn ObjectStore<VirtualMachineInstanceMigration>>) -> Self {
        self.migrations = Some(store);
        self
    }

    /// Set the workload cache
    pub fn vmis(mut self, store: Arc<dyn ObjectStore<VirtualMachineInstance>>) -> Self {
        self.vmis = Some(store);
        self
    }

    /// Set the pod cache
    pub fn pods(mut self, store: Arc<dyn ObjectStore<Pod>>) -> Self {
        self.pods = Some(store);
        self
    }

    /// Set the node cache
    pub fn nodes(mut self, store: Arc<dyn ObjectStore<Node>>) -> Self {
        self.nodes = Some(store);
        self
    }

    /// Set the PVC cache
    pub fn pvcs(mut self, store: Arc<dyn ObjectStore<PersistentVolumeClaim>>) -> Self {
        self.pvcs = Some(store);
        self
    }

    /// Set the migration policy cache
    pub fn policies(mut self, store: Arc<dyn ObjectStore<MigrationPolicy>>) -> Self {
        self.policies = Some(store);
        self
    }

    /// Set the namespace cache
    pub fn namespaces(mut self, store: Arc<dyn ObjectStore<Namespace>>) -> Self {
        self.namespaces = Some(store);
        self
    }

    /// Set the KubeVirt cache
    pub fn kubevirts(mut self, store: Arc<dyn ObjectStore<KubeVirt>>) -> Self {
        self.kubevirts = Some(store);
        self
    }

    /// Override the template service (primarily for testing)
    pub fn templates(mut self, templates: Arc<dyn TemplateService>) -> Self {
        self.templates = Some(templates);
        self
    }

    /// Override the backend storage (primarily for testing)
    pub fn backend_storage(mut self, backend_storage: Arc<dyn BackendStorage>) -> Self {
        self.backend_storage = Some(backend_storage);
        self
    }

    /// Override the descheduler helper (primarily for testing)
    pub fn descheduler(mut self, descheduler: Arc<dyn Descheduler>) -> Self {
        self.descheduler = Some(descheduler);
        self
    }

    /// Share a node limiter with the event handlers
    pub fn limiter(mut self, limiter: Arc<NodeMigrationLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        let pods = self.pods.unwrap_or_else(|| Arc::new(MemoryStore::<Pod>::new()));
        let pvcs = self
            .pvcs
            .unwrap_or_else(|| Arc::new(MemoryStore::<PersistentVolumeClaim>::new()));
        let limiter = self
            .limiter
            .unwrap_or_else(|| Arc::new(NodeMigrationLimiter::new(self.config.node_max_permits)));
        let client = self.client;

        Context {
            backend_storage: self
                .backend_storage
                .unwrap_or_else(|| Arc::new(PvcBackendStorage::new(client.clone(), pvcs.clone()))),
            descheduler: self
                .descheduler
                .unwrap_or_else(|| Arc::new(AnnotationDescheduler::new(client.clone(), pods.clone()))),
            templates: self
                .templates
                .unwrap_or_else(|| Arc::new(LauncherTemplateService::new(self.launcher_image))),
            migrations: self
                .migrations
                .unwrap_or_else(|| Arc::new(MemoryStore::<VirtualMachineInstanceMigration>::new())),
            vmis: self
                .vmis
                .unwrap_or_else(|| Arc::new(MemoryStore::<VirtualMachineInstance>::new())),
            nodes: self.nodes.unwrap_or_else(|| Arc::new(MemoryStore::<Node>::new())),
            policies: self
                .policies
                .unwrap_or_else(|| Arc::new(MemoryStore::<MigrationPolicy>::new())),
            namespaces: self
                .namespaces
                .unwrap_or_else(|| Arc::new(MemoryStore::<Namespace>::new())),
            kubevirts: self
                .kubevirts
                .unwrap_or_else(|| Arc::new(MemoryStore::<KubeVirt>::new())),
            pods,
            pvcs,
            client,
            events: self.events,
            config: self.config,
            pod_expectations: Expectations::new(),
            pvc_expectations: Expectations::new(),
            handoffs: HandoffRegistry::new(),
            permits: OutboundPermits::new(limiter),
            creation_lock: tokio::sync::Mutex::new(()),
        }
    }
}

/// Reconciler of migration keys
pub struct MigrationController {
    ctx: Arc<Context>,
}

impl MigrationController {
    /// Controller over a shared context
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    /// Shared context
    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    /// Reconcile one migration key now
    pub async fn execute(&self, key: &str) -> Result<Option<Requeue>> {
        reconcile_migration(&self.ctx, key, Utc::now()).await
    }
}

#[async_trait]
impl Reconcile for MigrationController {
    async fn reconcile(&self, key: &str) -> ReconcileOutcome {
        self.execute(key).await.into()
    }
}

/// Reconcile a migration key as of `now`
///
/// The status write always happens, even when the sync step failed, so a
/// failure the state machine can classify (quota rejection, ineligible
/// workload) is recorded before the error is returned for retry.
#[instrument(skip(ctx, now), fields(migration = %key))]
pub(crate) async fn reconcile_migration(
    ctx: &Context,
    key: &str,
    now: DateTime<Utc>,
) -> Result<Option<Requeue>> {
    let (namespace, name) = split_key(key);
    let Some(migration) = ctx.migrations.get(namespace, name) else {
        debug!("Migration left the cache, dropping its bookkeeping");
        ctx.pod_expectations.delete(key);
        ctx.handoffs.remove(key);
        ctx.permits.release(key);
        return Ok(None);
    };

    if migration.labels().get(labels::MIGRATION_SELECTOR) != Some(&migration.spec.vmi_name) {
        return ensure_selector_label(ctx, &migration).await;
    }

    let vmi = ctx.vmis.get(namespace, &migration.spec.vmi_name);
    if vmi.is_none() && !migration.is_deleting() {
        info!(vmi = %migration.vmi_key(), "Deleting migration of deleted vmi");
        return match ctx.client.delete_migration(namespace, name).await {
            Err(e) if e.is_not_found() => Ok(None),
            other => other.map(|()| None),
        };
    }
    let vmi = vmi.as_deref();

    let namespace_pods = ctx.pods.list_namespaced(namespace);
    let (target_pod, source_pod) = match vmi {
        Some(vmi) => (
            pods::target_pods(&namespace_pods, vmi, &migration)
                .into_iter()
                .next(),
            pods::current_vmi_pod(&namespace_pods, vmi),
        ),
        None => (None, None),
    };
    let attachment_pod = target_pod
        .as_deref()
        .and_then(|target| pods::attachment_pods(&namespace_pods, target).into_iter().next());

    let mut working = migration.status_or_default();
    let mut sync_result = Ok(None);
    if let Some(vmi) = vmi {
        let needs_sync = ctx.pod_expectations.satisfied(key)
            && ctx.pvc_expectations.satisfied(&migration.vmi_key());
        debug!(needs_sync, has_target_pod = target_pod.is_some(), "Processing migration");
        if needs_sync {
            sync_result =
                sync::sync(ctx, &migration, vmi, target_pod.as_deref(), &mut working, now).await;
        }
    }
    let (requeue, sync_error) = match sync_result {
        Ok(requeue) => (requeue, None),
        Err(e) => (None, Some(e)),
    };

    let namespace_migrations = ctx.migrations.list_namespaced(namespace);
    let kubevirts = ctx.kubevirts.list();
    let decision = compute_status(&StatusInput {
        migration: &migration,
        working_status: working,
        vmi,
        target_pod: target_pod.as_deref(),
        attachment_pod: attachment_pod.as_deref(),
        source_pod: source_pod.as_deref(),
        handed_off: sync::is_handed_off(ctx, &migration, vmi),
        can_migrate: vmi.is_some_and(|v| can_migrate_vmi(&migration, v, &namespace_migrations)),
        sync_error: sync_error.as_ref(),
        kubevirts: &kubevirts,
        now,
    })?;

    let mut updated = migration.as_ref().clone();
    updated.status = Some(decision.status.clone());
    for effect in &decision.effects {
        run_effect(ctx, &updated, vmi, target_pod.as_deref(), effect).await?;
    }

    for event in decision.events.iter().cloned() {
        ctx.record(migration.as_ref(), event.type_, event.reason, event.note)
            .await;
    }

    if let Some(patch) = migration_status_patch(&migration, &decision.status)? {
        ctx.client
            .patch_migration_status(namespace, name, &patch)
            .await?;
        if decision.phase() != migration.phase() {
            info!(from = %migration.phase(), to = %decision.phase(), "Migration phase changed");
        }
    }
    if let Some(patch) = migration_metadata_patch(&migration, migration.labels(), &decision.finalizers)? {
        ctx.client.patch_migration(namespace, name, &patch).await?;
    }

    if decision.phase().is_final() {
        ctx.permits.release(key);
    }

    if let Some(e) = sync_error {
        return Err(e);
    }

    if migration.is_final() && vmi.is_some() {
        gc::garbage_collect_finalized(ctx, &migration).await?;
    }

    Ok(requeue)
}

/// Add the `kubevirt.io/vmi-name` selector label
async fn ensure_selector_label(
    ctx: &Context,
    migration: &VirtualMachineInstanceMigration,
) -> Result<Option<Requeue>> {
    let mut migration_labels = migration.labels().clone();
    migration_labels.insert(
        labels::MIGRATION_SELECTOR.to_string(),
        migration.spec.vmi_name.clone(),
    );
    if let Some(patch) = migration_metadata_patch(migration, &migration_labels, migration.finalizers())? {
        let namespace = migration.namespace().unwrap_or_default();
        ctx.client
            .patch_migration(&namespace, &migration.name_any(), &patch)
            .await?;
        debug!("Added selector label to migration");
    }
    Ok(None)
}

async fn run_effect(
    ctx: &Context,
    migration: &VirtualMachineInstanceMigration,
    vmi: Option<&VirtualMachineInstance>,
    target_pod: Option<&Pod>,
    effect: &Effect,
) -> Result<()> {
    match effect {
        Effect::AbortBackendStorage => ctx.backend_storage.migration_abort(migration).await,
        Effect::RecoverBackendStorage => match vmi {
            Some(vmi) => {
                ctx.backend_storage
                    .recover_from_broken_migration(migration, vmi)
                    .await
            }
            None => ctx.backend_storage.migration_abort(migration).await,
        },
        Effect::MarkEvictionCompleted => ctx.descheduler.mark_eviction_completed(migration).await,
        Effect::TargetDomainReady {
            backend_handoff,
            timestamp,
        } => match target_pod {
            Some(pod) => {
                sync::annotate_target_ready(ctx, migration, pod, *backend_handoff, *timestamp).await
            }
            None => Ok(()),
        },
    }
}
