//! Write-side Kubernetes operations
//!
//! Reads never go through this trait; they come from the typed caches in
//! [`crate::store`]. Keeping writes behind a trait lets the reconcile core
//! run against a mock in tests.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use kube::api::{Api, ApiResource, DeleteParams, DynamicObject, GroupVersionKind, Patch, PatchParams, PostParams};
use kube::Client;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::crd::{VirtualMachineInstance, VirtualMachineInstanceMigration};
use crate::{Error, CONTROLLER_NAME};

/// Kubernetes writes issued by the migration controller
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MigrationClient: Send + Sync {
    /// Create a pod, returning what the server stored
    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod, Error>;

    /// Delete a pod
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Apply a JSON patch to a pod
    async fn patch_pod(
        &self,
        namespace: &str,
        name: &str,
        patch: &json_patch::Patch,
    ) -> Result<(), Error>;

    /// Apply a JSON patch to a workload instance
    ///
    /// Covers both `/status/migrationState` and `/metadata/labels`; the
    /// instance resource has no separate status subresource for them.
    async fn patch_vmi(
        &self,
        namespace: &str,
        name: &str,
        patch: &json_patch::Patch,
    ) -> Result<(), Error>;

    /// Apply a JSON patch to a migration's metadata
    async fn patch_migration(
        &self,
        namespace: &str,
        name: &str,
        patch: &json_patch::Patch,
    ) -> Result<(), Error>;

    /// Apply a JSON patch to a migration's status subresource
    async fn patch_migration_status(
        &self,
        namespace: &str,
        name: &str,
        patch: &json_patch::Patch,
    ) -> Result<(), Error>;

    /// Delete a migration
    async fn delete_migration(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Halt the virtual machine owning a workload
    async fn stop_vm(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Create a PVC, returning what the server stored
    async fn create_pvc(
        &self,
        namespace: &str,
        pvc: &PersistentVolumeClaim,
    ) -> Result<PersistentVolumeClaim, Error>;

    /// Delete a PVC
    async fn delete_pvc(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Apply a JSON patch to a PVC
    async fn patch_pvc(
        &self,
        namespace: &str,
        name: &str,
        patch: &json_patch::Patch,
    ) -> Result<(), Error>;
}

/// Real implementation backed by a kube client
pub struct KubeMigrationClient {
    client: Client,
}

impl KubeMigrationClient {
    /// Wrap a kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn params() -> PatchParams {
        PatchParams {
            field_manager: Some(CONTROLLER_NAME.to_string()),
            ..Default::default()
        }
    }

    fn json(patch: &json_patch::Patch) -> Patch<()> {
        Patch::Json(patch.clone())
    }
}

#[async_trait]
impl MigrationClient for KubeMigrationClient {
    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod, Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.create(&PostParams::default(), pod).await?)
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        api.delete(name, &DeleteParams::default()).await?;
        Ok(())
    }

    async fn patch_pod(
        &self,
        namespace: &str,
        name: &str,
        patch: &json_patch::Patch,
    ) -> Result<(), Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        api.patch(name, &Self::params(), &Self::json(patch)).await?;
        Ok(())
    }

    async fn patch_vmi(
        &self,
        namespace: &str,
        name: &str,
        patch: &json_patch::Patch,
    ) -> Result<(), Error> {
        let api: Api<VirtualMachineInstance> = Api::namespaced(self.client.clone(), namespace);
        api.patch(name, &Self::params(), &Self::json(patch)).await?;
        Ok(())
    }

    async fn patch_migration(
        &self,
        namespace: &str,
        name: &str,
        patch: &json_patch::Patch,
    ) -> Result<(), Error> {
        let api: Api<VirtualMachineInstanceMigration> =
            Api::namespaced(self.client.clone(), namespace);
        api.patch(name, &Self::params(), &Self::json(patch)).await?;
        Ok(())
    }

    async fn patch_migration_status(
        &self,
        namespace: &str,
        name: &str,
        patch: &json_patch::Patch,
    ) -> Result<(), Error> {
        let api: Api<VirtualMachineInstanceMigration> =
            Api::namespaced(self.client.clone(), namespace);
        api.patch_status(name, &Self::params(), &Self::json(patch))
            .await?;
        Ok(())
    }

    async fn delete_migration(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let api: Api<VirtualMachineInstanceMigration> =
            Api::namespaced(self.client.clone(), namespace);
        api.delete(name, &DeleteParams::default()).await?;
        Ok(())
    }

    async fn stop_vm(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let gvk = GroupVersionKind::gvk("kubevirt.io", "v1", "VirtualMachine");
        let resource = ApiResource::from_gvk_with_plural(&gvk, "virtualmachines");
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), namespace, &resource);
        let halt = serde_json::json!({"spec": {"runStrategy": "Halted"}});
        api.patch(name, &Self::params(), &Patch::Merge(&halt)).await?;
        debug!(namespace, name, "Stopped virtual machine");
        Ok(())
    }

    async fn create_pvc(
        &self,
        namespace: &str,
        pvc: &PersistentVolumeClaim,
    ) -> Result<PersistentVolumeClaim, Error> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.create(&PostParams::default(), pvc).await?)
    }

    async fn delete_pvc(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        api.delete(name, &DeleteParams::default()).await?;
        Ok(())
    }

    async fn patch_pvc(
        &self,
        namespace: &str,
        name: &str,
        patch: &json_patch::Patch,
    ) -> Result<(), Error> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        api.patch(name, &Self::params(), &Self::json(patch)).await?;
        Ok(())
    }
}
