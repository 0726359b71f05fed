//! Virt migration controller - live migration of virtual machine instances

use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use k8s_openapi::api::core::v1::{
    Namespace, Node, PersistentVolumeClaim, Pod, ResourceQuota,
};
use kube::runtime::reflector::store::Writer;
use kube::{Api, Client, CustomResourceExt, Resource};
use serde::de::DeserializeOwned;
use tokio::task::JoinSet;

use virt_migration_controller::config::ControllerConfig;
use virt_migration_controller::controller::client::KubeMigrationClient;
use virt_migration_controller::controller::handlers::{run_informer, EventHandlers, ResourceEventHandler};
use virt_migration_controller::controller::migration::{Context, MigrationController};
use virt_migration_controller::controller::queue::PriorityQueue;
use virt_migration_controller::controller::services::DEFAULT_LAUNCHER_IMAGE;
use virt_migration_controller::controller::worker::run_workers;
use virt_migration_controller::crd::{
    KubeVirt, MigrationPolicy, VirtualMachineInstance, VirtualMachineInstanceMigration,
};
use virt_migration_controller::events::KubeEventPublisher;
use virt_migration_controller::store::ReflectorStore;
use virt_migration_controller::telemetry::{init_telemetry, TelemetryConfig};
use virt_migration_controller::{
    CONTROLLER_NAME, DEFAULT_CATCH_ALL_PENDING_TIMEOUT_SECS,
    DEFAULT_FINALIZED_MIGRATION_GC_BUFFER, DEFAULT_NODE_MAX_PERMITS, DEFAULT_THREADINESS,
    DEFAULT_UNSCHEDULABLE_PENDING_TIMEOUT_SECS,
};

/// Virt migration controller - drives VirtualMachineInstanceMigrations to completion
#[derive(Parser, Debug)]
#[command(name = "virt-migration-controller", version, about, long_about = None)]
struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    crd: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run as controller (default mode)
    Controller(ControllerArgs),
}

/// Controller mode arguments
#[derive(Parser, Debug)]
struct ControllerArgs {
    /// Number of concurrent reconcile workers
    #[arg(long, env = "MIGRATION_THREADINESS", default_value_t = DEFAULT_THREADINESS)]
    threadiness: usize,

    /// Seconds a target pod may stay Pending and Unschedulable
    #[arg(
        long,
        env = "UNSCHEDULABLE_PENDING_TIMEOUT_SECONDS",
        default_value_t = DEFAULT_UNSCHEDULABLE_PENDING_TIMEOUT_SECS
    )]
    unschedulable_pending_timeout_seconds: i64,

    /// Seconds a target pod may stay Pending for any reason
    #[arg(
        long,
        env = "CATCH_ALL_PENDING_TIMEOUT_SECONDS",
        default_value_t = DEFAULT_CATCH_ALL_PENDING_TIMEOUT_SECS
    )]
    catch_all_pending_timeout_seconds: i64,

    /// Finalized migrations kept per workload
    #[arg(
        long,
        env = "FINALIZED_MIGRATION_GC_BUFFER",
        default_value_t = DEFAULT_FINALIZED_MIGRATION_GC_BUFFER
    )]
    finalized_migration_gc_buffer: usize,

    /// Outbound migration permits per node
    #[arg(long, env = "NODE_MAX_PERMITS", default_value_t = DEFAULT_NODE_MAX_PERMITS)]
    node_max_permits: u32,

    /// Image of rendered launcher and attachment pods
    #[arg(long, env = "LAUNCHER_IMAGE", default_value = DEFAULT_LAUNCHER_IMAGE)]
    launcher_image: String,
}

impl Default for ControllerArgs {
    fn default() -> Self {
        Self {
            threadiness: DEFAULT_THREADINESS,
            unschedulable_pending_timeout_seconds: DEFAULT_UNSCHEDULABLE_PENDING_TIMEOUT_SECS,
            catch_all_pending_timeout_seconds: DEFAULT_CATCH_ALL_PENDING_TIMEOUT_SECS,
            finalized_migration_gc_buffer: DEFAULT_FINALIZED_MIGRATION_GC_BUFFER,
            node_max_permits: DEFAULT_NODE_MAX_PERMITS,
            launcher_image: DEFAULT_LAUNCHER_IMAGE.to_string(),
        }
    }
}

impl ControllerArgs {
    fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            threadiness: self.threadiness,
            unschedulable_pending_timeout_secs: self.unschedulable_pending_timeout_seconds,
            catch_all_pending_timeout_secs: self.catch_all_pending_timeout_seconds,
            finalized_migration_gc_buffer: self.finalized_migration_gc_buffer,
            node_max_permits: self.node_max_permits,
            ..Default::default()
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        let crds = [
            serde_yaml::to_string(&VirtualMachineInstanceMigration::crd()),
            serde_yaml::to_string(&MigrationPolicy::crd()),
        ];
        for crd in crds {
            let crd = crd.map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
            println!("---\n{crd}");
        }
        return Ok(());
    }

    init_telemetry(TelemetryConfig::default())
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    match cli.command {
        Some(Commands::Controller(args)) => run_controller(args).await,
        None => run_controller(ControllerArgs::default()).await,
    }
}

/// Cache of one watched kind: the reader half for the context, the writer for its informer
fn cache<K>() -> (Writer<K>, Arc<ReflectorStore<K>>)
where
    K: Resource + Clone + Send + Sync + Debug + 'static,
    K::DynamicType: Default + Eq + Hash + Clone,
{
    let writer = Writer::default();
    let store = Arc::new(ReflectorStore::new(writer.as_reader()));
    (writer, store)
}

fn spawn_informer<K>(
    informers: &mut JoinSet<()>,
    api: Api<K>,
    writer: Writer<K>,
    handlers: &Arc<EventHandlers>,
) where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    K::DynamicType: Default + Eq + Hash + Clone + Send + Sync,
    EventHandlers: ResourceEventHandler<K>,
{
    let handler: Arc<dyn ResourceEventHandler<K>> = handlers.clone();
    informers.spawn(run_informer(api, writer, handler));
}

/// Run the migration controller until interrupted
async fn run_controller(args: ControllerArgs) -> anyhow::Result<()> {
    let config = args.controller_config();
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    let (migrations_writer, migrations) = cache::<VirtualMachineInstanceMigration>();
    let (vmis_writer, vmis) = cache::<VirtualMachineInstance>();
    let (pods_writer, pods) = cache::<Pod>();
    let (nodes_writer, nodes) = cache::<Node>();
    let (pvcs_writer, pvcs) = cache::<PersistentVolumeClaim>();
    let (policies_writer, policies) = cache::<MigrationPolicy>();
    let (namespaces_writer, namespaces) = cache::<Namespace>();
    let (kubevirts_writer, kubevirts) = cache::<KubeVirt>();
    let quotas_writer = Writer::<ResourceQuota>::default();

    let ctx = Arc::new(
        Context::builder(
            Arc::new(KubeMigrationClient::new(client.clone())),
            Arc::new(KubeEventPublisher::new(client.clone(), CONTROLLER_NAME)),
        )
        .config(config.clone())
        .launcher_image(args.launcher_image)
        .migrations(migrations)
        .vmis(vmis)
        .pods(pods)
        .nodes(nodes)
        .pvcs(pvcs)
        .policies(policies)
        .namespaces(namespaces)
        .kubevirts(kubevirts)
        .build(),
    );
    let queue = Arc::new(PriorityQueue::default());
    let handlers = Arc::new(EventHandlers::new(ctx.clone(), queue.clone()));

    let mut informers = JoinSet::new();
    spawn_informer(&mut informers, Api::all(client.clone()), migrations_writer, &handlers);
    spawn_informer(&mut informers, Api::all(client.clone()), vmis_writer, &handlers);
    spawn_informer(&mut informers, Api::all(client.clone()), pods_writer, &handlers);
    spawn_informer(&mut informers, Api::all(client.clone()), nodes_writer, &handlers);
    spawn_informer(&mut informers, Api::all(client.clone()), pvcs_writer, &handlers);
    spawn_informer(&mut informers, Api::all(client.clone()), quotas_writer, &handlers);
    spawn_informer(&mut informers, Api::all(client.clone()), kubevirts_writer, &handlers);
    informers.spawn(run_informer::<MigrationPolicy>(
        Api::all(client.clone()),
        policies_writer,
        Arc::new(NoopHandler),
    ));
    informers.spawn(run_informer::<Namespace>(
        Api::all(client),
        namespaces_writer,
        Arc::new(NoopHandler),
    ));

    tracing::info!(
        threadiness = config.threadiness,
        node_max_permits = config.node_max_permits,
        "Starting migration controller"
    );
    let controller = Arc::new(MigrationController::new(ctx));
    let workers = tokio::spawn(run_workers(config.threadiness, queue.clone(), controller));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received interrupt, draining workers");
        }
        _ = informers.join_next() => {
            tracing::error!("A watch stopped unexpectedly, shutting down");
        }
    }

    queue.shutdown();
    informers.abort_all();
    workers
        .await
        .map_err(|e| anyhow::anyhow!("Worker pool failed: {}", e))?;

    tracing::info!("Migration controller shutting down");
    Ok(())
}

/// Handler for kinds that only feed a cache
struct NoopHandler;

impl<K> ResourceEventHandler<K> for NoopHandler {
    fn on_add(&self, _obj: &K) {}

    fn on_update(&self, _old: &K, _new: &K) {}

    fn on_delete(&self, _obj: &K) {}
}
