//! Capacity gates
//!
//! Counts of migrations occupying cluster and node capacity, and the
//! ledger of source-node permits held by each migration.

use std::collections::HashMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::Pod;
use parking_lot::Mutex;
use tracing::debug;

use super::limiter::NodeMigrationLimiter;
use super::pods::target_pods;
use crate::crd::{VirtualMachineInstance, VirtualMachineInstanceMigration};
use crate::store::ObjectStore;

/// Non-final migrations that hold capacity
///
/// A migration holds capacity once it is past Pending, or while Pending
/// as soon as a launcher pod of its workload labelled with its UID exists.
pub fn running_migrations(
    migrations: &[Arc<VirtualMachineInstanceMigration>],
    vmis: &dyn ObjectStore<VirtualMachineInstance>,
    pods: &[Arc<Pod>],
) -> Vec<Arc<VirtualMachineInstanceMigration>> {
    migrations
        .iter()
        .filter(|m| !m.is_final())
        .filter(|m| {
            if m.is_running() {
                return true;
            }
            let namespace = m.metadata.namespace.as_deref().unwrap_or_default();
            vmis.get(namespace, &m.spec.vmi_name)
                .is_some_and(|vmi| !target_pods(pods, &vmi, m).is_empty())
        })
        .cloned()
        .collect()
}

/// How many of `running` move a workload off `node`
pub fn outbound_from_node(
    running: &[Arc<VirtualMachineInstanceMigration>],
    vmis: &dyn ObjectStore<VirtualMachineInstance>,
    node: &str,
) -> usize {
    running
        .iter()
        .filter_map(|m| {
            let namespace = m.metadata.namespace.as_deref().unwrap_or_default();
            vmis.get(namespace, &m.spec.vmi_name)
        })
        .filter(|vmi| vmi.node_name() == node)
        .count()
}

/// Source-node permits taken per migration
///
/// Each migration holds at most one permit, on the node its workload
/// leaves. Release is keyed by migration so it works after the workload
/// is gone.
#[derive(Debug)]
pub struct OutboundPermits {
    limiter: Arc<NodeMigrationLimiter>,
    holders: Mutex<HashMap<String, String>>,
}

impl OutboundPermits {
    /// Ledger drawing permits from `limiter`
    pub fn new(limiter: Arc<NodeMigrationLimiter>) -> Self {
        Self {
            limiter,
            holders: Mutex::new(HashMap::new()),
        }
    }

    /// Underlying node limiter
    pub fn limiter(&self) -> &Arc<NodeMigrationLimiter> {
        &self.limiter
    }

    /// Take a permit on `node` for `key`; true if one is held afterwards
    pub fn acquire(&self, key: &str, node: &str) -> bool {
        let mut holders = self.holders.lock();
        if holders.contains_key(key) {
            return true;
        }
        if !self.limiter.acquire(node) {
            return false;
        }
        holders.insert(key.to_string(), node.to_string());
        debug!(migration = key, node, "Acquired outbound migration permit");
        true
    }

    /// Return the permit held by `key`, if any
    pub fn release(&self, key: &str) {
        let Some(node) = self.holders.lock().remove(key) else {
            return;
        };
        self.limiter.release(&node);
        debug!(migration = key, node = %node, "Released outbound migration permit");
    }

    /// Whether `key` holds a permit
    pub fn holds(&self, key: &str) -> bool {
        self.holders.lock().contains_key(key)
    }
}
