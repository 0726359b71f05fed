//! JSON patch construction
//!
//! Every write of controller-owned state is a test-then-replace JSON patch:
//! the old value is asserted before the new one is written, so a patch
//! built from a stale cache read fails with a conflict instead of
//! silently overwriting newer state. An unchanged value produces no patch
//! at all.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::{json, Value};

use crate::crd::{
    annotations, MigrationState, VirtualMachineInstance, VirtualMachineInstanceMigration,
    VirtualMachineInstanceMigrationStatus, ROOT_UID,
};
use crate::Result;

/// Escape a key for use as one JSON pointer segment
pub fn escape_json_pointer(segment: &str) -> String {
    segment.replace('~', "~0").replace('/', "~1")
}

/// Accumulates JSON patch operations
#[derive(Debug, Default, Clone)]
pub struct PatchBuilder {
    ops: Vec<Value>,
}

impl PatchBuilder {
    /// Empty patch
    pub fn new() -> Self {
        Self::default()
    }

    /// Assert `path` holds `value`
    pub fn test(&mut self, path: &str, value: Value) -> &mut Self {
        self.ops.push(json!({"op": "test", "path": path, "value": value}));
        self
    }

    /// Add `value` at `path`
    pub fn add(&mut self, path: &str, value: Value) -> &mut Self {
        self.ops.push(json!({"op": "add", "path": path, "value": value}));
        self
    }

    /// Replace the value at `path`
    pub fn replace(&mut self, path: &str, value: Value) -> &mut Self {
        self.ops.push(json!({"op": "replace", "path": path, "value": value}));
        self
    }

    /// Remove the value at `path`
    pub fn remove(&mut self, path: &str) -> &mut Self {
        self.ops.push(json!({"op": "remove", "path": path}));
        self
    }

    /// Test the old value, then write the new one
    ///
    /// A missing old value is tested as null and the new value added.
    pub fn test_and_set<T: Serialize>(
        &mut self,
        path: &str,
        old: Option<&T>,
        new: &T,
    ) -> Result<&mut Self> {
        let new = serde_json::to_value(new)?;
        match old {
            Some(old) => {
                let old = serde_json::to_value(old)?;
                self.test(path, old).replace(path, new);
            }
            None => {
                self.test(path, Value::Null).add(path, new);
            }
        }
        Ok(self)
    }

    /// Set `key` in the string map at `map_path`, creating the map if needed
    pub fn set_map_entry(
        &mut self,
        map_path: &str,
        map: Option<&BTreeMap<String, String>>,
        key: &str,
        value: &str,
    ) -> &mut Self {
        match map {
            Some(_) => self.add(
                &format!("{map_path}/{}", escape_json_pointer(key)),
                Value::String(value.to_string()),
            ),
            None => {
                let mut entries = serde_json::Map::new();
                entries.insert(key.to_string(), Value::String(value.to_string()));
                self.add(map_path, Value::Object(entries))
            }
        }
    }

    /// Whether no operation was recorded
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Raw operations
    pub fn ops(&self) -> &[Value] {
        &self.ops
    }

    /// Finish into a typed patch, `None` if empty
    pub fn build(&self) -> Result<Option<json_patch::Patch>> {
        if self.ops.is_empty() {
            return Ok(None);
        }
        let patch = serde_json::from_value(Value::Array(self.ops.clone()))?;
        Ok(Some(patch))
    }
}

/// Status patch, `None` if `status` equals what the cache holds
pub fn migration_status_patch(
    original: &VirtualMachineInstanceMigration,
    status: &VirtualMachineInstanceMigrationStatus,
) -> Result<Option<json_patch::Patch>> {
    if original.status.as_ref() == Some(status) {
        return Ok(None);
    }
    let mut patch = PatchBuilder::new();
    patch.test_and_set("/status", original.status.as_ref(), status)?;
    patch.build()
}

/// Labels and finalizers patch, `None` if both are unchanged
pub fn migration_metadata_patch(
    original: &VirtualMachineInstanceMigration,
    labels: &BTreeMap<String, String>,
    finalizers: &[String],
) -> Result<Option<json_patch::Patch>> {
    let mut patch = PatchBuilder::new();
    let old_labels = original.metadata.labels.as_ref();
    if old_labels.cloned().unwrap_or_default() != *labels {
        patch.test_and_set("/metadata/labels", old_labels, labels)?;
    }
    let old_finalizers = original.metadata.finalizers.as_ref();
    if old_finalizers.map(Vec::as_slice).unwrap_or_default() != finalizers {
        patch.test_and_set("/metadata/finalizers", old_finalizers, &finalizers.to_vec())?;
    }
    patch.build()
}

/// Workload patch for migration state, volume status and labels
///
/// Only the paths whose value differs from `original` are patched.
pub fn vmi_patch(
    original: &VirtualMachineInstance,
    updated: &VirtualMachineInstance,
) -> Result<Option<json_patch::Patch>> {
    let mut patch = PatchBuilder::new();

    let old_state = original.migration_state();
    let new_state = updated.migration_state();
    if old_state != new_state {
        match new_state {
            Some(state) => {
                patch.test_and_set::<MigrationState>("/status/migrationState", old_state, state)?;
            }
            None => {
                if let Some(old) = old_state {
                    patch
                        .test("/status/migrationState", serde_json::to_value(old)?)
                        .remove("/status/migrationState");
                }
            }
        }
    }

    let old_volumes = original
        .status
        .as_ref()
        .map(|s| &s.volume_status)
        .filter(|v| !v.is_empty());
    let new_volumes = updated
        .status
        .as_ref()
        .map(|s| s.volume_status.clone())
        .unwrap_or_default();
    if old_volumes.cloned().unwrap_or_default() != new_volumes {
        patch.test_and_set("/status/volumeStatus", old_volumes, &new_volumes)?;
    }

    let old_labels = original.metadata.labels.as_ref();
    let new_labels = updated.metadata.labels.clone().unwrap_or_default();
    if old_labels.cloned().unwrap_or_default() != new_labels {
        patch.test_and_set("/metadata/labels", old_labels, &new_labels)?;
    }

    patch.build()
}

/// Workload patch moving the runtime user to `user`, `None` if already there
///
/// The non-root annotation follows the user: present for a non-root user,
/// absent for root.
pub fn runtime_user_patch(
    original: &VirtualMachineInstance,
    user: u64,
) -> Result<Option<json_patch::Patch>> {
    let mut patch = PatchBuilder::new();

    if original.runtime_user() != user {
        let current = original.status.as_ref().and_then(|s| s.runtime_user);
        patch.test_and_set("/status/runtimeUser", current.as_ref(), &user)?;
    }

    let existing = original.metadata.annotations.as_ref();
    let marked = existing.is_some_and(|a| a.contains_key(annotations::NON_ROOT));
    if user == ROOT_UID && marked {
        patch.remove(&format!(
            "/metadata/annotations/{}",
            escape_json_pointer(annotations::NON_ROOT)
        ));
    } else if user != ROOT_UID && !marked {
        patch.set_map_entry("/metadata/annotations", existing, annotations::NON_ROOT, "true");
    }

    patch.build()
}
