//! Worker pool draining the priority queue

use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use super::queue::{AddOpts, PriorityQueue};
use super::{ReconcileOutcome, DEFAULT_PRIORITY};

/// Something that reconciles one key at a time
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Reconcile: Send + Sync {
    /// Reconcile the object behind `key`
    async fn reconcile(&self, key: &str) -> ReconcileOutcome;
}

/// Apply a reconcile outcome to the queue
///
/// Failures are retried with the priority the key was handed out with.
pub fn handle_outcome(queue: &PriorityQueue, key: &str, priority: i32, outcome: ReconcileOutcome) {
    match outcome {
        ReconcileOutcome::Succeeded => queue.forget(key),
        ReconcileOutcome::Requeued(requeue) => {
            queue.forget(key);
            debug!(key, after = ?requeue.after, priority = requeue.priority, "Requeueing");
            queue.add_with_opts(
                key,
                AddOpts {
                    priority: requeue.priority,
                    after: Some(requeue.after),
                    rate_limited: false,
                },
            );
        }
        ReconcileOutcome::Failed(error) => {
            warn!(key, error = %error, retries = queue.num_requeues(key), "Reconcile failed, re-enqueuing");
            queue.add_with_opts(
                key,
                AddOpts {
                    priority,
                    after: None,
                    rate_limited: true,
                },
            );
        }
    }
}

async fn worker_loop(id: usize, queue: Arc<PriorityQueue>, reconciler: Arc<dyn Reconcile>) {
    while let Some(key) = queue.get().await {
        let priority = queue.in_flight_priority(&key).unwrap_or(DEFAULT_PRIORITY);
        let outcome = reconciler.reconcile(&key).await;
        handle_outcome(&queue, &key, priority, outcome);
        queue.done(&key);
    }
    debug!(worker = id, "Worker stopped");
}

/// Run `threadiness` workers until the queue shuts down
pub async fn run_workers(
    threadiness: usize,
    queue: Arc<PriorityQueue>,
    reconciler: Arc<dyn Reconcile>,
) {
    info!(threadiness, "Starting migration workers");
    let mut workers = JoinSet::new();
    for id in 0..threadiness {
        workers.spawn(worker_loop(id, queue.clone(), reconciler.clone()));
    }
    while let Some(result) = workers.join_next().await {
        if let Err(e) = result {
            warn!(error = %e, "Worker task ended abnormally");
        }
    }
    info!("Migration workers stopped");
}
