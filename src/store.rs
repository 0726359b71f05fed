//! Typed read-only views over cached cluster objects
//!
//! The controller never talks to the API server for reads. Every read
//! goes through an [`ObjectStore`] parameterized by the resource type, so
//! a cache lookup can only ever yield the kind that was asked for.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

use kube::runtime::reflector::{self, ObjectRef};
use kube::{Resource, ResourceExt};
use parking_lot::RwLock;

use crate::crd::object_key;

/// Read-only view over a cache of `K`
pub trait ObjectStore<K>: Send + Sync {
    /// Object by namespace and name (namespace is ignored for cluster-scoped kinds)
    fn get(&self, namespace: &str, name: &str) -> Option<Arc<K>>;

    /// Every cached object
    fn list(&self) -> Vec<Arc<K>>;

    /// Cached objects in one namespace
    fn list_namespaced(&self, namespace: &str) -> Vec<Arc<K>>
    where
        K: Resource,
    {
        self.list()
            .into_iter()
            .filter(|o| o.meta().namespace.as_deref().unwrap_or_default() == namespace)
            .collect()
    }
}

/// Store backed by a kube-runtime reflector
pub struct ReflectorStore<K>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Eq + Hash + Clone,
{
    inner: reflector::Store<K>,
}

impl<K> ReflectorStore<K>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Eq + Hash + Clone,
{
    /// Wrap a reflector reader
    pub fn new(inner: reflector::Store<K>) -> Self {
        Self { inner }
    }
}

impl<K> ObjectStore<K> for ReflectorStore<K>
where
    K: Resource + Clone + Send + Sync + Debug + 'static,
    K::DynamicType: Default + Eq + Hash + Clone + Send + Sync,
{
    fn get(&self, namespace: &str, name: &str) -> Option<Arc<K>> {
        let mut obj_ref = ObjectRef::<K>::new(name);
        if !namespace.is_empty() {
            obj_ref = obj_ref.within(namespace);
        }
        self.inner.get(&obj_ref)
    }

    fn list(&self) -> Vec<Arc<K>> {
        self.inner.state()
    }
}

/// In-memory store keyed by `namespace/name`
///
/// Used where no watch is running, and as the cache in tests.
pub struct MemoryStore<K> {
    objects: RwLock<BTreeMap<String, Arc<K>>>,
}

impl<K> Default for MemoryStore<K> {
    fn default() -> Self {
        Self {
            objects: RwLock::new(BTreeMap::new()),
        }
    }
}

impl<K: Resource> MemoryStore<K> {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-filled with `objects`
    pub fn from_objects(objects: impl IntoIterator<Item = K>) -> Self {
        let store = Self::new();
        for obj in objects {
            store.insert(obj);
        }
        store
    }

    /// Insert or replace an object
    pub fn insert(&self, obj: K) {
        let key = object_key(
            obj.namespace().as_deref().unwrap_or_default(),
            &obj.name_any(),
        );
        self.objects.write().insert(key, Arc::new(obj));
    }

    /// Remove an object
    pub fn remove(&self, namespace: &str, name: &str) -> Option<Arc<K>> {
        self.objects.write().remove(&object_key(namespace, name))
    }
}

impl<K: Resource + Send + Sync> ObjectStore<K> for MemoryStore<K> {
    fn get(&self, namespace: &str, name: &str) -> Option<Arc<K>> {
        self.objects
            .read()
            .get(&object_key(namespace, name))
            .cloned()
    }

    fn list(&self) -> Vec<Arc<K>> {
        self.objects.read().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{Node, Pod};
    use kube::api::ObjectMeta;

    fn pod(ns: &str, name: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(ns.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_get_by_namespace_and_name() {
        let store = MemoryStore::from_objects([pod("a", "p1"), pod("b", "p1")]);
        assert!(store.get("a", "p1").is_some());
        assert!(store.get("c", "p1").is_none());
        assert_eq!(store.list().len(), 2);
    }

    #[test]
    fn test_list_namespaced_filters() {
        let store = MemoryStore::from_objects([pod("a", "p1"), pod("a", "p2"), pod("b", "p3")]);
        let names: Vec<_> = store
            .list_namespaced("a")
            .iter()
            .map(|p| p.name_any())
            .collect();
        assert_eq!(names, vec!["p1", "p2"]);
    }

    #[test]
    fn test_cluster_scoped_objects_use_bare_name() {
        let node = Node {
            metadata: ObjectMeta {
                name: Some("worker-1".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        let store = MemoryStore::from_objects([node]);
        assert!(store.get("", "worker-1").is_some());
        assert!(store.remove("", "worker-1").is_some());
        assert!(store.list().is_empty());
    }
}
