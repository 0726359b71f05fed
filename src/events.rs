//! Kubernetes Event recording for the migration controller.
//!
//! Events are fire-and-forget: failures are logged as warnings and never
//! propagate. A failed event must never break reconciliation.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Trait for publishing Kubernetes Events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a Kubernetes Event on the given resource.
    ///
    /// # Arguments
    ///
    /// * `resource_ref` - The Kubernetes object this event is about
    /// * `type_` - Normal or Warning
    /// * `reason` - Machine-readable reason string (e.g. "SuccessfulCreate")
    /// * `note` - Human-readable message
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        note: String,
    );
}

/// Production implementation wrapping `kube::runtime::events::Recorder`.
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a new publisher reporting as `controller_name`.
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        note: String,
    ) {
        let event = kube::runtime::events::Event {
            type_,
            reason: reason.to_string(),
            note: Some(note),
            action: actions::MIGRATE.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(reason, error = %e, "Failed to publish Kubernetes event");
        }
    }
}

/// Well-known event reason strings.
pub mod reasons {
    /// Target or attachment pod created
    pub const SUCCESSFUL_CREATE_POD: &str = "SuccessfulCreate";
    /// Target or attachment pod creation failed
    pub const FAILED_CREATE_POD: &str = "FailedCreate";
    /// Target pod deleted
    pub const SUCCESSFUL_DELETE_POD: &str = "SuccessfulDelete";
    /// Target pod deletion failed
    pub const FAILED_DELETE_POD: &str = "FailedDelete";
    /// Migration failed
    pub const FAILED_MIGRATION: &str = "FailedMigration";
    /// Migration succeeded
    pub const SUCCESSFUL_MIGRATION: &str = "SuccessfulMigration";
    /// Handoff to the target node agent done
    pub const SUCCESSFUL_HANDOVER_POD: &str = "SuccessfulHandOver";
    /// Handoff to the target node agent failed
    pub const FAILED_HANDOVER_POD: &str = "FailedHandOver";
    /// Abort signalled to the node agent
    pub const SUCCESSFUL_ABORT_MIGRATION: &str = "SuccessfulAbortMigration";
    /// Abort could not be signalled
    pub const FAILED_ABORT_MIGRATION: &str = "FailedAbortMigration";
    /// Migration held back by backoff
    pub const MIGRATION_BACKOFF: &str = "MigrationBackoff";
    /// Target pod cannot be scheduled
    pub const TARGET_POD_UNSCHEDULABLE: &str = "migrationTargetPodUnschedulable";
    /// No node can host the host-model CPU
    pub const NO_SUITABLE_NODES_FOR_HOST_MODEL: &str = "NoSuitableNodesForHostModelMigration";
}

/// Well-known event action strings.
pub mod actions {
    /// Migration reconciliation
    pub const MIGRATE: &str = "Migrate";
}

/// Test publisher that records every event.
#[cfg(test)]
pub mod testing {
    use super::*;
    use parking_lot::Mutex;

    /// One recorded event
    #[derive(Clone, Debug, PartialEq)]
    pub struct RecordedEvent {
        /// Object name the event is about
        pub object: String,
        /// Normal or Warning
        pub warning: bool,
        /// Reason
        pub reason: String,
        /// Message
        pub note: String,
    }

    /// Records events in memory
    #[derive(Default)]
    pub struct RecordingEventPublisher {
        events: Mutex<Vec<RecordedEvent>>,
    }

    impl RecordingEventPublisher {
        /// All events recorded so far
        pub fn events(&self) -> Vec<RecordedEvent> {
            self.events.lock().clone()
        }

        /// Whether any event note contains every fragment
        pub fn has_note_containing(&self, fragments: &[&str]) -> bool {
            self.events
                .lock()
                .iter()
                .any(|e| fragments.iter().all(|f| e.note.contains(f)))
        }

        /// Whether any event has the given reason
        pub fn has_reason(&self, reason: &str) -> bool {
            self.events.lock().iter().any(|e| e.reason == reason)
        }
    }

    #[async_trait]
    impl EventPublisher for RecordingEventPublisher {
        async fn publish(
            &self,
            resource_ref: &ObjectReference,
            type_: EventType,
            reason: &str,
            note: String,
        ) {
            self.events.lock().push(RecordedEvent {
                object: resource_ref.name.clone().unwrap_or_default(),
                warning: matches!(type_, EventType::Warning),
                reason: reason.to_string(),
                note,
            });
        }
    }
}
