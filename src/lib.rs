//! Virt migration controller - priority-scheduled reconciler for live migration
//! of virtual machine instances
//!
//! The controller drives each `VirtualMachineInstanceMigration` through its
//! phase state machine: it creates the target pod, hands ownership of the
//! transfer to the destination node agent, observes the agent's progress on
//! the workload status and finalizes the migration record.
//!
//! # Architecture
//!
//! - Watch events enqueue migration keys on a shared priority queue
//! - A fixed pool of workers drains the queue, one in-flight reconcile per key
//! - Reads go through typed caches, writes through a mockable client
//! - Admission control happens in two layers: computed cluster/node ceilings
//!   and per-node permit buckets
//!
//! # Modules
//!
//! - [`crd`] - Resource definitions (migration, workload instance, policy, KubeVirt)
//! - [`controller`] - Reconciliation logic and its building blocks
//! - [`store`] - Typed read-only views over cached objects
//! - [`events`] - Kubernetes Event publishing
//! - [`retry`] - Per-key failure backoff
//! - [`config`] - Controller configuration
//! - [`telemetry`] - Logging initialization
//! - [`error`] - Error types for the controller

#![deny(missing_docs)]

pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod events;
pub mod retry;
pub mod store;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Default Configuration Constants
// =============================================================================
// Shared by the CLI defaults, `ControllerConfig::default` and test fixtures.

/// Name reported on events and used as field manager
pub const CONTROLLER_NAME: &str = "virt-migration-controller";

/// Default number of concurrent reconcile workers
pub const DEFAULT_THREADINESS: usize = 3;

/// Default budget for a target pod stuck Pending and Unschedulable, in seconds
pub const DEFAULT_UNSCHEDULABLE_PENDING_TIMEOUT_SECS: i64 = 300;

/// Default budget for a target pod stuck Pending for any reason, in seconds
pub const DEFAULT_CATCH_ALL_PENDING_TIMEOUT_SECS: i64 = 900;

/// Default number of finalized migrations kept per workload
pub const DEFAULT_FINALIZED_MIGRATION_GC_BUFFER: usize = 5;

/// Default number of permits per node in the admission limiter
pub const DEFAULT_NODE_MAX_PERMITS: u32 = 2;

/// Queue priority of capacity-blocked migrations
///
/// Lower than the default priority (0) so workers keep servicing active
/// migrations first.
pub const LOW_PRIORITY: i32 = -100;
