//! Collaborators of the migration controller
//!
//! - [`TemplateService`] renders target and attachment pods
//! - [`BackendStorage`] moves persistent device state (TPM, EFI) between PVCs
//! - [`Descheduler`] marks source pods for external node-draining tools

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    Container, PersistentVolumeClaim, PersistentVolumeClaimSpec,
    PersistentVolumeClaimVolumeSource, Pod, PodSpec, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::ObjectMeta;
use kube::{Resource, ResourceExt};
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use super::client::MigrationClient;
use super::patch::{escape_json_pointer, PatchBuilder};
use super::pods::COMPUTE_CONTAINER;
use crate::crd::{
    labels, object_key, VirtualMachineInstance, VirtualMachineInstanceMigration, Volume,
    VolumeStatus, BACKEND_STORAGE_PREFIX,
};
use crate::store::ObjectStore;
use crate::{Error, Result};

/// Name of the container mounting hotplugged volumes
pub const HOTPLUG_CONTAINER: &str = "hotplug-disk";

/// Annotation telling the descheduler an eviction is being worked on
pub const EVICTION_IN_PROGRESS_ANNOTATION: &str = "descheduler.alpha.kubernetes.io/eviction-in-progress";

/// Size requested for new backend-storage PVCs
pub const BACKEND_STORAGE_SIZE: &str = "10Mi";

/// Launcher image used when none is configured
pub const DEFAULT_LAUNCHER_IMAGE: &str = "quay.io/kubevirt/virt-launcher:latest";

/// Renders pods for migrations
#[cfg_attr(test, automock)]
pub trait TemplateService: Send + Sync {
    /// Launcher pod for a workload, without migration context
    ///
    /// Used on the receiving side of a decentralized migration, where no
    /// local source pod exists.
    fn render_launch_manifest(&self, vmi: &VirtualMachineInstance) -> Result<Pod>;

    /// Target pod for a migration, derived from the source pod
    fn render_migration_manifest(
        &self,
        vmi: &VirtualMachineInstance,
        migration: &VirtualMachineInstanceMigration,
        source_pod: &Pod,
    ) -> Result<Pod>;

    /// Attachment pod mounting `volumes` next to `owner_pod`
    fn render_hotplug_attachment_pod(
        &self,
        volumes: &[Volume],
        owner_pod: &Pod,
        vmi: &VirtualMachineInstance,
        claims: &BTreeMap<String, Arc<PersistentVolumeClaim>>,
    ) -> Result<Pod>;

    /// Image of the launcher container
    fn launcher_image(&self) -> String;
}

fn vmi_controller_ref(vmi: &VirtualMachineInstance) -> Option<OwnerReference> {
    vmi.controller_owner_ref(&())
}

/// Template service producing plain launcher pods
pub struct LauncherTemplateService {
    launcher_image: String,
}

impl LauncherTemplateService {
    /// Render launcher containers with `launcher_image`
    pub fn new(launcher_image: impl Into<String>) -> Self {
        Self {
            launcher_image: launcher_image.into(),
        }
    }

    fn launcher_pod(&self, vmi: &VirtualMachineInstance) -> Result<Pod> {
        let uid = vmi
            .metadata
            .uid
            .clone()
            .ok_or_else(|| Error::validation(format!("vmi {} has no uid", vmi.name_any())))?;
        Ok(Pod {
            metadata: ObjectMeta {
                generate_name: Some(format!("virt-launcher-{}-", vmi.name_any())),
                namespace: vmi.namespace(),
                labels: Some(BTreeMap::from([
                    (labels::APP.to_string(), labels::APP_VIRT_LAUNCHER.to_string()),
                    (labels::CREATED_BY.to_string(), uid),
                ])),
                owner_references: vmi_controller_ref(vmi).map(|r| vec![r]),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: COMPUTE_CONTAINER.to_string(),
                    image: Some(self.launcher_image.clone()),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            status: None,
        })
    }
}

impl TemplateService for LauncherTemplateService {
    fn render_launch_manifest(&self, vmi: &VirtualMachineInstance) -> Result<Pod> {
        self.launcher_pod(vmi)
    }

    fn render_migration_manifest(
        &self,
        vmi: &VirtualMachineInstance,
        _migration: &VirtualMachineInstanceMigration,
        source_pod: &Pod,
    ) -> Result<Pod> {
        let mut pod = self.launcher_pod(vmi)?;
        if let (Some(spec), Some(source)) = (pod.spec.as_mut(), source_pod.spec.as_ref()) {
            spec.volumes = source.volumes.clone();
            spec.node_selector = source.node_selector.clone();
            spec.tolerations = source.tolerations.clone();
            spec.affinity = source.affinity.clone();
        }
        Ok(pod)
    }

    fn render_hotplug_attachment_pod(
        &self,
        volumes: &[Volume],
        owner_pod: &Pod,
        vmi: &VirtualMachineInstance,
        claims: &BTreeMap<String, Arc<PersistentVolumeClaim>>,
    ) -> Result<Pod> {
        let owner_uid = owner_pod
            .metadata
            .uid
            .clone()
            .ok_or_else(|| Error::validation("attachment owner pod has no uid"))?;
        let mut pod_volumes = Vec::with_capacity(volumes.len());
        for volume in volumes {
            let claim_name = volume
                .persistent_volume_claim
                .as_ref()
                .map(|c| c.claim_name.clone())
                .or_else(|| volume.data_volume.as_ref().map(|d| d.name.clone()))
                .ok_or_else(|| {
                    Error::validation(format!("volume {} is not backed by a claim", volume.name))
                })?;
            if !claims.contains_key(&claim_name) {
                return Err(Error::not_found(
                    "PersistentVolumeClaim",
                    object_key(vmi.namespace().as_deref().unwrap_or_default(), &claim_name),
                ));
            }
            pod_volumes.push(k8s_openapi::api::core::v1::Volume {
                name: volume.name.clone(),
                persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                    claim_name,
                    read_only: None,
                }),
                ..Default::default()
            });
        }

        Ok(Pod {
            metadata: ObjectMeta {
                generate_name: Some("hp-volume-".to_string()),
                namespace: vmi.namespace(),
                owner_references: Some(vec![OwnerReference {
                    api_version: "v1".to_string(),
                    kind: "Pod".to_string(),
                    name: owner_pod.name_any(),
                    uid: owner_uid,
                    controller: Some(true),
                    block_owner_deletion: Some(true),
                }]),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: HOTPLUG_CONTAINER.to_string(),
                    image: Some(self.launcher_image.clone()),
                    ..Default::default()
                }],
                node_name: owner_pod.spec.as_ref().and_then(|s| s.node_name.clone()),
                volumes: Some(pod_volumes),
                ..Default::default()
            }),
            status: None,
        })
    }

    fn launcher_image(&self) -> String {
        self.launcher_image.clone()
    }
}

/// Persistent device state handling during migrations
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BackendStorage: Send + Sync {
    /// Backend-storage PVC the workload uses now
    fn current_pvc_name(&self, vmi: &VirtualMachineInstance) -> Option<String>;

    /// Target-side PVC of a migration, if already created
    fn pvc_for_migration_target(
        &self,
        migration: &VirtualMachineInstanceMigration,
    ) -> Option<Arc<PersistentVolumeClaim>>;

    /// Create the target-side PVC (or reuse a shareable source PVC)
    async fn create_pvc_for_migration_target(
        &self,
        vmi: &VirtualMachineInstance,
        migration: &VirtualMachineInstanceMigration,
    ) -> Result<PersistentVolumeClaim>;

    /// Record the PVC in the workload's volume status
    fn update_volume_status(&self, vmi: &mut VirtualMachineInstance, pvc: &PersistentVolumeClaim);

    /// Make the target PVC the workload's PVC and drop the source
    async fn migration_handoff(&self, migration: &VirtualMachineInstanceMigration) -> Result<()>;

    /// Drop the target PVC of a failed migration
    async fn migration_abort(&self, migration: &VirtualMachineInstanceMigration) -> Result<()>;

    /// Settle the PVCs of a migration interrupted mid-flight
    async fn recover_from_broken_migration(
        &self,
        migration: &VirtualMachineInstanceMigration,
        vmi: &VirtualMachineInstance,
    ) -> Result<()>;
}

/// Backend storage managing PVCs through the migration client
pub struct PvcBackendStorage {
    client: Arc<dyn MigrationClient>,
    pvcs: Arc<dyn ObjectStore<PersistentVolumeClaim>>,
}

impl PvcBackendStorage {
    /// Backend storage writing through `client` and reading `pvcs`
    pub fn new(
        client: Arc<dyn MigrationClient>,
        pvcs: Arc<dyn ObjectStore<PersistentVolumeClaim>>,
    ) -> Self {
        Self { client, pvcs }
    }

    fn pvc_names(migration: &VirtualMachineInstanceMigration) -> (Option<String>, Option<String>) {
        let state = migration
            .status
            .as_ref()
            .and_then(|s| s.migration_state.as_ref());
        let non_empty = |v: Option<&String>| v.filter(|s| !s.is_empty()).cloned();
        (
            non_empty(state.and_then(|s| s.source_persistent_state_pvc_name.as_ref())),
            non_empty(state.and_then(|s| s.target_persistent_state_pvc_name.as_ref())),
        )
    }

    fn target_by_label(
        &self,
        migration: &VirtualMachineInstanceMigration,
    ) -> Option<Arc<PersistentVolumeClaim>> {
        let namespace = migration.namespace().unwrap_or_default();
        let name = migration.name_any();
        self.pvcs
            .list_namespaced(&namespace)
            .into_iter()
            .find(|pvc| pvc.labels().get(labels::MIGRATION_NAME) == Some(&name))
    }

    async fn delete_ignoring_missing(&self, namespace: &str, name: &str) -> Result<()> {
        match self.client.delete_pvc(namespace, name).await {
            Err(e) if e.is_not_found() => Ok(()),
            other => other,
        }
    }

    fn new_target_pvc(
        vmi: &VirtualMachineInstance,
        migration: &VirtualMachineInstanceMigration,
    ) -> PersistentVolumeClaim {
        let owner_references = match vmi.metadata.owner_references.as_ref() {
            Some(refs) if !refs.is_empty() => Some(refs.clone()),
            _ => vmi_controller_ref(vmi).map(|r| vec![r]),
        };
        PersistentVolumeClaim {
            metadata: ObjectMeta {
                generate_name: Some(format!("{BACKEND_STORAGE_PREFIX}-{}-", vmi.name_any())),
                namespace: vmi.namespace(),
                labels: Some(BTreeMap::from([(
                    labels::MIGRATION_NAME.to_string(),
                    migration.name_any(),
                )])),
                owner_references,
                ..Default::default()
            },
            spec: Some(PersistentVolumeClaimSpec {
                access_modes: Some(vec!["ReadWriteOnce".to_string()]),
                volume_mode: Some("Filesystem".to_string()),
                resources: Some(VolumeResourceRequirements {
                    requests: Some(BTreeMap::from([(
                        "storage".to_string(),
                        Quantity(BACKEND_STORAGE_SIZE.to_string()),
                    )])),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            status: None,
        }
    }
}

fn is_read_write_many(pvc: &PersistentVolumeClaim) -> bool {
    pvc.status
        .as_ref()
        .and_then(|s| s.access_modes.as_ref())
        .and_then(|modes| modes.first())
        .is_some_and(|m| m == "ReadWriteMany")
}

#[async_trait]
impl BackendStorage for PvcBackendStorage {
    fn current_pvc_name(&self, vmi: &VirtualMachineInstance) -> Option<String> {
        vmi.current_backend_pvc_name()
    }

    fn pvc_for_migration_target(
        &self,
        migration: &VirtualMachineInstanceMigration,
    ) -> Option<Arc<PersistentVolumeClaim>> {
        if let (_, Some(target)) = Self::pvc_names(migration) {
            return self
                .pvcs
                .get(migration.namespace().as_deref().unwrap_or_default(), &target);
        }
        self.target_by_label(migration)
    }

    async fn create_pvc_for_migration_target(
        &self,
        vmi: &VirtualMachineInstance,
        migration: &VirtualMachineInstanceMigration,
    ) -> Result<PersistentVolumeClaim> {
        let namespace = vmi.namespace().unwrap_or_default();
        if let Some(source) = self
            .current_pvc_name(vmi)
            .and_then(|name| self.pvcs.get(&namespace, &name))
        {
            if is_read_write_many(&source) {
                debug!(pvc = %source.name_any(), "Source backend-storage PVC is shareable, reusing it");
                return Ok(source.as_ref().clone());
            }
        }
        let pvc = Self::new_target_pvc(vmi, migration);
        let created = self.client.create_pvc(&namespace, &pvc).await?;
        info!(pvc = %created.name_any(), migration = %migration.key(), "Created target backend-storage PVC");
        Ok(created)
    }

    fn update_volume_status(&self, vmi: &mut VirtualMachineInstance, pvc: &PersistentVolumeClaim) {
        let name = pvc.name_any();
        let status = vmi.status.get_or_insert_with(Default::default);
        match status.volume_status.iter_mut().find(|v| v.name == name) {
            Some(entry) => entry.persistent_volume_claim_name = Some(name),
            None => status.volume_status.push(VolumeStatus {
                name: name.clone(),
                hotplug_volume: None,
                persistent_volume_claim_name: Some(name),
            }),
        }
    }

    async fn migration_handoff(&self, migration: &VirtualMachineInstanceMigration) -> Result<()> {
        let (Some(source), Some(target)) = Self::pvc_names(migration) else {
            return Err(Error::collaborator(
                "backend-storage",
                "missing source and/or target PVC name(s)",
            ));
        };
        if source == target {
            return Ok(());
        }

        let namespace = migration.namespace().unwrap_or_default();
        let Some(target_pvc) = self.target_by_label(migration) else {
            return Err(Error::collaborator(
                "backend-storage",
                format!("target PVC not found for migration {}", migration.key()),
            ));
        };
        let vmi_name = &migration.spec.vmi_name;
        if let Some(existing) = target_pvc.labels().get(BACKEND_STORAGE_PREFIX) {
            if existing != vmi_name {
                return Err(Error::collaborator(
                    "backend-storage",
                    format!("target PVC for {vmi_name} is already labelled for another VMI: {existing}"),
                ));
            }
        }

        let migration_label = format!("/metadata/labels/{}", escape_json_pointer(labels::MIGRATION_NAME));
        let mut patch = PatchBuilder::new();
        patch
            .add(
                &format!("/metadata/labels/{BACKEND_STORAGE_PREFIX}"),
                serde_json::Value::String(vmi_name.clone()),
            )
            .test(&migration_label, serde_json::Value::String(migration.name_any()))
            .remove(&migration_label);
        if let Some(patch) = patch.build()? {
            self.client.patch_pvc(&namespace, &target, &patch).await?;
        }

        self.delete_ignoring_missing(&namespace, &source).await
    }

    async fn migration_abort(&self, migration: &VirtualMachineInstanceMigration) -> Result<()> {
        let (source, Some(target)) = Self::pvc_names(migration) else {
            return Ok(());
        };
        if source.as_deref() == Some(target.as_str()) {
            return Ok(());
        }
        let namespace = migration.namespace().unwrap_or_default();
        self.delete_ignoring_missing(&namespace, &target).await
    }

    async fn recover_from_broken_migration(
        &self,
        migration: &VirtualMachineInstanceMigration,
        vmi: &VirtualMachineInstance,
    ) -> Result<()> {
        let (source, target) = Self::pvc_names(migration);
        if target.is_none() || source == target {
            return Ok(());
        }
        // The target PVC prevails only if the transfer itself finished
        let transferred = vmi.migration_state().is_some_and(|s| {
            s.is_owned_by(migration.uid_str()) && s.completed && !s.failed
        });
        if transferred {
            self.migration_handoff(migration).await
        } else {
            self.migration_abort(migration).await
        }
    }
}

/// Eviction bookkeeping for external node-draining tools
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Descheduler: Send + Sync {
    /// Flag the source pod as being evicted through this migration
    async fn mark_eviction_in_progress(&self, source_pod: &Pod) -> Result<()>;

    /// Clear the flag once the migration failed
    async fn mark_eviction_completed(&self, migration: &VirtualMachineInstanceMigration) -> Result<()>;
}

/// Descheduler helper annotating the source pod
pub struct AnnotationDescheduler {
    client: Arc<dyn MigrationClient>,
    pods: Arc<dyn ObjectStore<Pod>>,
}

impl AnnotationDescheduler {
    /// Helper patching pods through `client`
    pub fn new(client: Arc<dyn MigrationClient>, pods: Arc<dyn ObjectStore<Pod>>) -> Self {
        Self { client, pods }
    }
}

#[async_trait]
impl Descheduler for AnnotationDescheduler {
    async fn mark_eviction_in_progress(&self, source_pod: &Pod) -> Result<()> {
        let annotations = source_pod.metadata.annotations.as_ref();
        if annotations.is_some_and(|a| a.contains_key(EVICTION_IN_PROGRESS_ANNOTATION)) {
            return Ok(());
        }
        let mut patch = PatchBuilder::new();
        patch.set_map_entry(
            "/metadata/annotations",
            annotations,
            EVICTION_IN_PROGRESS_ANNOTATION,
            "kubevirt",
        );
        if let Some(patch) = patch.build()? {
            let namespace = source_pod.namespace().unwrap_or_default();
            self.client
                .patch_pod(&namespace, &source_pod.name_any(), &patch)
                .await?;
        }
        Ok(())
    }

    async fn mark_eviction_completed(&self, migration: &VirtualMachineInstanceMigration) -> Result<()> {
        let source_pod = migration
            .status
            .as_ref()
            .and_then(|s| s.migration_state.as_ref())
            .and_then(|s| s.source_pod.clone());
        let Some(source_pod) = source_pod else {
            return Ok(());
        };
        let namespace = migration.namespace().unwrap_or_default();
        let Some(pod) = self.pods.get(&namespace, &source_pod) else {
            return Ok(());
        };
        if !pod
            .annotations()
            .contains_key(EVICTION_IN_PROGRESS_ANNOTATION)
        {
            return Ok(());
        }
        let path = format!(
            "/metadata/annotations/{}",
            escape_json_pointer(EVICTION_IN_PROGRESS_ANNOTATION)
        );
        let mut patch = PatchBuilder::new();
        patch.remove(&path);
        if let Some(patch) = patch.build()? {
            self.client.patch_pod(&namespace, &source_pod, &patch).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::client::MockMigrationClient;
    use crate::crd::{
        MigrationState, VirtualMachineInstanceMigrationSpec, VirtualMachineInstanceMigrationStatus,
        VirtualMachineInstanceSpec,
    };
    use crate::error::tests::api_error;
    use crate::store::MemoryStore;
    use k8s_openapi::api::core::v1::PersistentVolumeClaimStatus;

    fn vmi() -> VirtualMachineInstance {
        let mut vmi = VirtualMachineInstance::new("vmi", VirtualMachineInstanceSpec::default());
        vmi.metadata.namespace = Some("default".to_string());
        vmi.metadata.uid = Some("vmi-uid".to_string());
        vmi
    }

    fn migration(source: Option<&str>, target: Option<&str>) -> VirtualMachineInstanceMigration {
        let mut m = VirtualMachineInstanceMigration::new(
            "mig",
            VirtualMachineInstanceMigrationSpec {
                vmi_name: "vmi".to_string(),
                ..Default::default()
            },
        );
        m.metadata.namespace = Some("default".to_string());
        m.metadata.uid = Some("mig-uid".to_string());
        m.status = Some(VirtualMachineInstanceMigrationStatus {
            migration_state: Some(MigrationState {
                source_persistent_state_pvc_name: source.map(str::to_string),
                target_persistent_state_pvc_name: target.map(str::to_string),
                ..Default::default()
            }),
            ..Default::default()
        });
        m
    }

    fn pvc(name: &str, pvc_labels: &[(&str, &str)], access_mode: &str) -> PersistentVolumeClaim {
        PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                labels: Some(
                    pvc_labels
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                ..Default::default()
            },
            spec: None,
            status: Some(PersistentVolumeClaimStatus {
                access_modes: Some(vec![access_mode.to_string()]),
                ..Default::default()
            }),
        }
    }

    fn storage(
        client: MockMigrationClient,
        pvcs: Vec<PersistentVolumeClaim>,
    ) -> PvcBackendStorage {
        PvcBackendStorage::new(Arc::new(client), Arc::new(MemoryStore::from_objects(pvcs)))
    }

    mod templates {
        use super::*;

        #[test]
        fn test_migration_manifest_inherits_source_scheduling() {
            let templates = LauncherTemplateService::new("launcher:v1");
            let mut source = Pod::default();
            source.spec = Some(PodSpec {
                node_selector: Some(BTreeMap::from([("zone".to_string(), "a".to_string())])),
                ..Default::default()
            });
            let pod = templates
                .render_migration_manifest(&vmi(), &migration(None, None), &source)
                .unwrap();
            let spec = pod.spec.unwrap();
            assert_eq!(spec.containers[0].name, COMPUTE_CONTAINER);
            assert_eq!(spec.node_selector.unwrap()["zone"], "a");
            assert_eq!(pod.metadata.labels.unwrap()[labels::CREATED_BY], "vmi-uid");
        }

        #[test]
        fn test_attachment_pod_requires_known_claims() {
            let templates = LauncherTemplateService::new("launcher:v1");
            let mut owner = Pod::default();
            owner.metadata.name = Some("target".to_string());
            owner.metadata.uid = Some("target-uid".to_string());
            let volumes = vec![Volume {
                name: "hot".to_string(),
                persistent_volume_claim: Some(crate::crd::ClaimVolumeSource {
                    claim_name: "hot-claim".to_string(),
                    hotpluggable: true,
                }),
                data_volume: None,
            }];

            let err = templates
                .render_hotplug_attachment_pod(&volumes, &owner, &vmi(), &BTreeMap::new())
                .unwrap_err();
            assert!(err.is_not_found());

            let claims = BTreeMap::from([(
                "hot-claim".to_string(),
                Arc::new(pvc("hot-claim", &[], "ReadWriteOnce")),
            )]);
            let pod = templates
                .render_hotplug_attachment_pod(&volumes, &owner, &vmi(), &claims)
                .unwrap();
            let owner_ref = &pod.metadata.owner_references.unwrap()[0];
            assert_eq!(owner_ref.uid, "target-uid");
            assert_eq!(owner_ref.controller, Some(true));
        }
    }

    mod backend_storage {
        use super::*;

        #[tokio::test]
        async fn test_shareable_source_pvc_is_reused() {
            let mut source_vmi = vmi();
            source_vmi.status = Some(crate::crd::VirtualMachineInstanceStatus {
                volume_status: vec![VolumeStatus {
                    name: "persistent-state-for-vmi-abc".to_string(),
                    hotplug_volume: None,
                    persistent_volume_claim_name: Some("persistent-state-for-vmi-abc".to_string()),
                }],
                ..Default::default()
            });
            let storage = storage(
                MockMigrationClient::new(),
                vec![pvc("persistent-state-for-vmi-abc", &[], "ReadWriteMany")],
            );
            let pvc = storage
                .create_pvc_for_migration_target(&source_vmi, &migration(None, None))
                .await
                .unwrap();
            assert_eq!(pvc.name_any(), "persistent-state-for-vmi-abc");
        }

        #[tokio::test]
        async fn test_new_target_pvc_is_labelled_with_migration() {
            let mut client = MockMigrationClient::new();
            client
                .expect_create_pvc()
                .withf(|ns, pvc| {
                    ns == "default"
                        && pvc.labels().get(labels::MIGRATION_NAME).map(String::as_str) == Some("mig")
                        && pvc.metadata.generate_name.as_deref() == Some("persistent-state-for-vmi-")
                })
                .returning(|_, pvc| {
                    let mut created = pvc.clone();
                    created.metadata.name = Some("persistent-state-for-vmi-xyz".to_string());
                    Ok(created)
                });
            let storage = storage(client, vec![]);
            let pvc = storage
                .create_pvc_for_migration_target(&vmi(), &migration(None, None))
                .await
                .unwrap();
            assert_eq!(pvc.name_any(), "persistent-state-for-vmi-xyz");
        }

        #[tokio::test]
        async fn test_handoff_requires_both_names() {
            let storage = storage(MockMigrationClient::new(), vec![]);
            let err = storage
                .migration_handoff(&migration(Some("src"), None))
                .await
                .unwrap_err();
            assert!(err.to_string().contains("missing source and/or target PVC name(s)"));
        }

        #[tokio::test]
        async fn test_shared_pvc_handoff_is_a_no_op() {
            let storage = storage(MockMigrationClient::new(), vec![]);
            storage
                .migration_handoff(&migration(Some("shared"), Some("shared")))
                .await
                .unwrap();
        }

        /// Story: after a successful transfer the target PVC takes over the workload's state
        #[tokio::test]
        async fn story_handoff_relabels_target_and_drops_source() {
            let mut client = MockMigrationClient::new();
            client
                .expect_patch_pvc()
                .withf(|_, name, patch| {
                    let ops = serde_json::to_value(patch).unwrap();
                    name == "tgt"
                        && ops[0]["path"] == "/metadata/labels/persistent-state-for"
                        && ops[2]["op"] == "remove"
                })
                .times(1)
                .returning(|_, _, _| Ok(()));
            client
                .expect_delete_pvc()
                .withf(|_, name| name == "src")
                .times(1)
                .returning(|_, _| Err(api_error(404, "gone")));
            let storage = storage(
                client,
                vec![pvc("tgt", &[(labels::MIGRATION_NAME, "mig")], "ReadWriteOnce")],
            );
            storage
                .migration_handoff(&migration(Some("src"), Some("tgt")))
                .await
                .unwrap();
        }

        #[tokio::test]
        async fn test_handoff_refuses_pvc_of_other_vmi() {
            let storage = storage(
                MockMigrationClient::new(),
                vec![pvc(
                    "tgt",
                    &[(labels::MIGRATION_NAME, "mig"), (BACKEND_STORAGE_PREFIX, "other")],
                    "ReadWriteOnce",
                )],
            );
            let err = storage
                .migration_handoff(&migration(Some("src"), Some("tgt")))
                .await
                .unwrap_err();
            assert!(err.to_string().contains("already labelled for another VMI"));
        }

        #[tokio::test]
        async fn test_abort_deletes_only_distinct_target() {
            let mut client = MockMigrationClient::new();
            client
                .expect_delete_pvc()
                .withf(|_, name| name == "tgt")
                .times(1)
                .returning(|_, _| Ok(()));
            let storage = storage(client, vec![]);
            storage.migration_abort(&migration(Some("src"), Some("tgt"))).await.unwrap();
            storage
                .migration_abort(&migration(Some("shared"), Some("shared")))
                .await
                .unwrap();
            storage.migration_abort(&migration(Some("src"), None)).await.unwrap();
        }

        #[tokio::test]
        async fn test_recovery_aborts_unfinished_transfer() {
            let mut client = MockMigrationClient::new();
            client
                .expect_delete_pvc()
                .withf(|_, name| name == "tgt")
                .times(1)
                .returning(|_, _| Ok(()));
            let storage = storage(client, vec![]);
            storage
                .recover_from_broken_migration(&migration(Some("src"), Some("tgt")), &vmi())
                .await
                .unwrap();
        }

        #[test]
        fn test_volume_status_upsert() {
            let storage = storage(MockMigrationClient::new(), vec![]);
            let mut target_vmi = vmi();
            let claim = pvc("persistent-state-for-vmi-new", &[], "ReadWriteOnce");
            storage.update_volume_status(&mut target_vmi, &claim);
            storage.update_volume_status(&mut target_vmi, &claim);
            let status = target_vmi.status.unwrap();
            assert_eq!(status.volume_status.len(), 1);
            assert_eq!(
                status.volume_status[0].persistent_volume_claim_name.as_deref(),
                Some("persistent-state-for-vmi-new")
            );
        }
    }

    mod descheduler {
        use super::*;

        #[tokio::test]
        async fn test_marking_is_idempotent() {
            let mut client = MockMigrationClient::new();
            client.expect_patch_pod().times(1).returning(|_, _, _| Ok(()));
            let descheduler = AnnotationDescheduler::new(Arc::new(client), Arc::new(MemoryStore::new()));

            let mut source = Pod::default();
            source.metadata.name = Some("source".to_string());
            source.metadata.namespace = Some("default".to_string());
            descheduler.mark_eviction_in_progress(&source).await.unwrap();

            source.metadata.annotations = Some(BTreeMap::from([(
                EVICTION_IN_PROGRESS_ANNOTATION.to_string(),
                "kubevirt".to_string(),
            )]));
            descheduler.mark_eviction_in_progress(&source).await.unwrap();
        }

        #[tokio::test]
        async fn test_completion_without_source_pod_is_a_no_op() {
            let descheduler = AnnotationDescheduler::new(
                Arc::new(MockMigrationClient::new()),
                Arc::new(MemoryStore::new()),
            );
            descheduler
                .mark_eviction_completed(&migration(None, None))
                .await
                .unwrap();
        }
    }
}
