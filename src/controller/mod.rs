//! Migration controller and its building blocks
//!
//! The reconcile core lives in [`migration`]. Everything else is a small
//! component it composes: registries guarded by their own mutex, pure
//! decision functions, and the traits at the write-side seams.

pub mod backoff;
pub mod capacity;
pub mod client;
pub mod expectations;
pub mod gc;
pub mod handlers;
pub mod handoff;
pub mod host_model;
pub mod limiter;
pub mod migration;
pub mod patch;
pub mod pods;
pub mod policy;
pub mod queue;
pub mod services;
pub mod status;
pub mod sync;
pub mod timeout;
pub mod worker;

use std::time::Duration;

pub use client::{KubeMigrationClient, MigrationClient};
pub use expectations::Expectations;
pub use handoff::HandoffRegistry;
pub use limiter::NodeMigrationLimiter;
pub use migration::{Context, ContextBuilder, MigrationController};
pub use queue::{AddOpts, PriorityQueue};
pub use services::{BackendStorage, Descheduler, TemplateService};
pub use worker::{run_workers, Reconcile};

use crate::Error;

/// Default queue priority
pub const DEFAULT_PRIORITY: i32 = 0;

/// A deferred re-enqueue of the same key
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Requeue {
    /// Delay before the key becomes ready again
    pub after: Duration,
    /// Queue priority of the re-enqueued key
    pub priority: i32,
}

impl Requeue {
    /// Requeue at the default priority
    pub fn after(after: Duration) -> Self {
        Self {
            after,
            priority: DEFAULT_PRIORITY,
        }
    }

    /// Requeue behind active work
    pub fn low_priority(after: Duration) -> Self {
        Self {
            after,
            priority: crate::LOW_PRIORITY,
        }
    }

    /// Keep whichever requeue fires first
    pub fn earliest(a: Option<Requeue>, b: Option<Requeue>) -> Option<Requeue> {
        match (a, b) {
            (Some(a), Some(b)) => Some(if b.after < a.after { b } else { a }),
            (a, None) => a,
            (None, b) => b,
        }
    }
}

/// Result of one reconcile of a key
#[derive(Debug)]
pub enum ReconcileOutcome {
    /// Nothing left to do until the next watch event
    Succeeded,
    /// Come back later, without counting as a failure
    Requeued(Requeue),
    /// Reconcile failed, retry with rate-limited backoff
    Failed(Error),
}

impl From<crate::Result<Option<Requeue>>> for ReconcileOutcome {
    fn from(result: crate::Result<Option<Requeue>>) -> Self {
        match result {
            Ok(None) => Self::Succeeded,
            Ok(Some(requeue)) => Self::Requeued(requeue),
            Err(e) => Self::Failed(e),
        }
    }
}
