//! Admission Limiter
//!
//! Per-node counting semaphores bounding how many migrations may leave a
//! node at once. Buckets are created lazily on first use and are never
//! persisted.

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::warn;

#[derive(Debug)]
struct Bucket {
    max: u32,
    in_use: u32,
    /// Max to adopt once the bucket fully drains
    deferred_max: Option<u32>,
}

impl Bucket {
    fn new(max: u32) -> Self {
        Self {
            max,
            in_use: 0,
            deferred_max: None,
        }
    }
}

#[derive(Debug)]
struct LimiterState {
    max_permits: u32,
    buckets: HashMap<String, Bucket>,
}

/// Per-node migration permit buckets
#[derive(Debug)]
pub struct NodeMigrationLimiter {
    state: Mutex<LimiterState>,
}

impl NodeMigrationLimiter {
    /// Limiter granting at most `max_permits` permits per node
    pub fn new(max_permits: u32) -> Self {
        Self {
            state: Mutex::new(LimiterState {
                max_permits,
                buckets: HashMap::new(),
            }),
        }
    }

    /// Try to take a permit on `node`
    pub fn acquire(&self, node: &str) -> bool {
        let mut state = self.state.lock();
        let max = state.max_permits;
        let bucket = state
            .buckets
            .entry(node.to_string())
            .or_insert_with(|| Bucket::new(max));
        if bucket.in_use >= bucket.max {
            return false;
        }
        bucket.in_use += 1;
        true
    }

    /// Return a permit to `node`
    ///
    /// Returns false if the node held no permit.
    pub fn release(&self, node: &str) -> bool {
        let mut state = self.state.lock();
        let Some(bucket) = state.buckets.get_mut(node) else {
            return false;
        };
        if bucket.in_use == 0 {
            return false;
        }
        bucket.in_use -= 1;
        if bucket.in_use == 0 {
            if let Some(max) = bucket.deferred_max.take() {
                bucket.max = max;
            }
        }
        true
    }

    /// Drop the bucket of a node that left the cluster
    pub fn delete(&self, node: &str) {
        self.state.lock().buckets.remove(node);
    }

    /// Change the per-node budget
    ///
    /// Idle buckets resize immediately. Busy buckets keep their current max
    /// until every permit is released.
    pub fn update_max_permits(&self, max_permits: u32) {
        let mut state = self.state.lock();
        if state.max_permits == max_permits {
            return;
        }
        state.max_permits = max_permits;
        for (node, bucket) in state.buckets.iter_mut() {
            if bucket.in_use == 0 {
                bucket.max = max_permits;
                bucket.deferred_max = None;
            } else {
                warn!(
                    node = %node,
                    in_use = bucket.in_use,
                    current_max = bucket.max,
                    new_max = max_permits,
                    "Node has outstanding migration permits, deferring resize until drained"
                );
                bucket.deferred_max = Some(max_permits);
            }
        }
    }

    /// Permits currently held on `node`
    pub fn in_use(&self, node: &str) -> u32 {
        self.state
            .lock()
            .buckets
            .get(node)
            .map(|b| b.in_use)
            .unwrap_or(0)
    }

    /// Effective max of `node` (the global max for nodes not yet seen)
    pub fn max_for(&self, node: &str) -> u32 {
        let state = self.state.lock();
        state
            .buckets
            .get(node)
            .map(|b| b.max)
            .unwrap_or(state.max_permits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_acquire_until_full() {
        let limiter = NodeMigrationLimiter::new(2);
        assert!(limiter.acquire("node-a"));
        assert!(limiter.acquire("node-a"));
        assert!(!limiter.acquire("node-a"));
        assert!(limiter.acquire("node-b"));
        assert_eq!(limiter.in_use("node-a"), 2);
    }

    #[test]
    fn test_release_after_acquire_always_succeeds() {
        let limiter = NodeMigrationLimiter::new(1);
        assert!(limiter.acquire("node-a"));
        assert!(limiter.release("node-a"));
        assert!(!limiter.release("node-a"));
        assert!(!limiter.release("never-seen"));
        assert!(limiter.acquire("node-a"));
    }

    #[test]
    fn test_delete_discards_bucket() {
        let limiter = NodeMigrationLimiter::new(1);
        assert!(limiter.acquire("node-a"));
        limiter.delete("node-a");
        assert_eq!(limiter.in_use("node-a"), 0);
        assert!(limiter.acquire("node-a"));
    }

    mod resize {
        use super::*;

        #[test]
        fn test_idle_buckets_resize_immediately() {
            let limiter = NodeMigrationLimiter::new(1);
            assert!(limiter.acquire("node-a"));
            assert!(limiter.release("node-a"));
            limiter.update_max_permits(3);
            assert_eq!(limiter.max_for("node-a"), 3);
            assert_eq!(limiter.max_for("new-node"), 3);
        }

        /// Story: a busy node keeps its old budget until fully drained
        #[test]
        fn story_busy_bucket_adopts_new_max_after_drain() {
            let limiter = NodeMigrationLimiter::new(2);
            assert!(limiter.acquire("node-a"));
            assert!(limiter.acquire("node-a"));

            limiter.update_max_permits(4);
            assert_eq!(limiter.max_for("node-a"), 2);
            assert!(!limiter.acquire("node-a"));

            assert!(limiter.release("node-a"));
            assert_eq!(limiter.max_for("node-a"), 2);
            assert!(limiter.release("node-a"));
            assert_eq!(limiter.max_for("node-a"), 4);

            for _ in 0..4 {
                assert!(limiter.acquire("node-a"));
            }
            assert!(!limiter.acquire("node-a"));
        }

        #[test]
        fn test_shrinking_busy_bucket_never_revokes_permits() {
            let limiter = NodeMigrationLimiter::new(3);
            for _ in 0..3 {
                assert!(limiter.acquire("node-a"));
            }
            limiter.update_max_permits(1);
            assert_eq!(limiter.in_use("node-a"), 3);
            assert!(limiter.release("node-a"));
            assert!(!limiter.acquire("node-a"));
        }
    }

    #[test]
    fn test_concurrent_acquire_never_exceeds_max() {
        let limiter = Arc::new(NodeMigrationLimiter::new(3));
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let limiter = limiter.clone();
                std::thread::spawn(move || limiter.acquire("node-a"))
            })
            .collect();
        let granted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|g| *g)
            .count();
        assert_eq!(granted, 3);
        assert_eq!(limiter.in_use("node-a"), 3);
    }
}
