//! Handoff Registry
//!
//! Membership means the destination node agent, not this controller, owns
//! the migration's progress. It bridges the window between writing the
//! workload's migration state and that write showing up in the cache.

use std::collections::HashSet;

use parking_lot::Mutex;

/// Migration keys that completed handoff
#[derive(Debug, Default)]
pub struct HandoffRegistry {
    keys: Mutex<HashSet<String>>,
}

impl HandoffRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a completed handoff
    pub fn add(&self, key: &str) {
        self.keys.lock().insert(key.to_string());
    }

    /// Whether `key` was handed off
    pub fn contains(&self, key: &str) -> bool {
        self.keys.lock().contains(key)
    }

    /// Forget `key` once the migration left the cache
    pub fn remove(&self, key: &str) {
        self.keys.lock().remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_contains_remove() {
        let registry = HandoffRegistry::new();
        assert!(!registry.contains("ns/m"));
        registry.add("ns/m");
        registry.add("ns/m");
        assert!(registry.contains("ns/m"));
        registry.remove("ns/m");
        assert!(!registry.contains("ns/m"));
    }
}
