//! Controller configuration
//!
//! Process-level settings come from the command line (see `main.rs`).
//! Cluster-level migration tuning comes from the KubeVirt resource and is
//! read on every reconcile through [`crate::crd::KubeVirt::migration_configuration`].

use std::time::Duration;

use crate::{
    DEFAULT_CATCH_ALL_PENDING_TIMEOUT_SECS, DEFAULT_FINALIZED_MIGRATION_GC_BUFFER,
    DEFAULT_NODE_MAX_PERMITS, DEFAULT_THREADINESS, DEFAULT_UNSCHEDULABLE_PENDING_TIMEOUT_SECS,
};

/// Configuration of one controller instance
#[derive(Clone, Debug, PartialEq)]
pub struct ControllerConfig {
    /// Number of concurrent workers draining the queue
    pub threadiness: usize,

    /// How long a target pod may stay Pending+Unschedulable, in seconds
    pub unschedulable_pending_timeout_secs: i64,

    /// How long a target pod may stay Pending for any reason, in seconds
    pub catch_all_pending_timeout_secs: i64,

    /// Finalized migrations kept per workload
    pub finalized_migration_gc_buffer: usize,

    /// Permits per node in the admission limiter
    pub node_max_permits: u32,

    /// Delay before re-checking when expectations or active pods block creation
    pub expectation_requeue_delay: Duration,

    /// Delay before re-checking when a parallelism ceiling blocks creation
    pub capacity_requeue_delay: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            threadiness: DEFAULT_THREADINESS,
            unschedulable_pending_timeout_secs: DEFAULT_UNSCHEDULABLE_PENDING_TIMEOUT_SECS,
            catch_all_pending_timeout_secs: DEFAULT_CATCH_ALL_PENDING_TIMEOUT_SECS,
            finalized_migration_gc_buffer: DEFAULT_FINALIZED_MIGRATION_GC_BUFFER,
            node_max_permits: DEFAULT_NODE_MAX_PERMITS,
            expectation_requeue_delay: Duration::from_secs(1),
            capacity_requeue_delay: Duration::from_secs(5),
        }
    }
}

impl ControllerConfig {
    /// Reject settings the controller cannot run with
    pub fn validate(&self) -> crate::Result<()> {
        if self.threadiness == 0 {
            return Err(crate::Error::validation("threadiness must be at least 1"));
        }
        if self.unschedulable_pending_timeout_secs < 0 || self.catch_all_pending_timeout_secs < 0 {
            return Err(crate::Error::validation(
                "pending pod timeouts must not be negative",
            ));
        }
        if self.node_max_permits == 0 {
            return Err(crate::Error::validation("node max permits must be at least 1"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ControllerConfig::default();
        assert_eq!(config.threadiness, 3);
        assert_eq!(config.unschedulable_pending_timeout_secs, 300);
        assert_eq!(config.catch_all_pending_timeout_secs, 900);
        assert_eq!(config.finalized_migration_gc_buffer, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_workers_rejected() {
        let config = ControllerConfig {
            threadiness: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_negative_timeout_rejected() {
        let config = ControllerConfig {
            catch_all_pending_timeout_secs: -1,
            ..Default::default()
        };
        assert!(config
            .validate()
            .unwrap_err()
            .to_string()
            .contains("must not be negative"));
    }
}
