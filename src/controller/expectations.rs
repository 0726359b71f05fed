//! Expectation Tracker
//!
//! Records creations and deletions a reconcile has issued but the watch
//! cache has not reflected yet. A key with outstanding expectations must not
//! act again: the cache would still show the world as it was before the
//! previous pass, and acting on it would duplicate pods or volumes.
//!
//! Deletions are tracked by object key so a delete event observed twice
//! (update with deletion timestamp, then the actual delete) only counts once.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

/// Expectations older than this are considered satisfied
///
/// Guards against a lost watch event blocking a key forever.
pub const EXPECTATIONS_TTL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug)]
struct Expectation {
    add: i64,
    del: i64,
    pending_deletions: HashSet<String>,
    set_at: Instant,
}

impl Expectation {
    fn new() -> Self {
        Self {
            add: 0,
            del: 0,
            pending_deletions: HashSet::new(),
            set_at: Instant::now(),
        }
    }

    fn fulfilled(&self) -> bool {
        self.add <= 0 && self.del <= 0
    }

    fn expired(&self) -> bool {
        self.set_at.elapsed() > EXPECTATIONS_TTL
    }
}

/// Per-key creation/deletion expectations
#[derive(Debug, Default)]
pub struct Expectations {
    entries: Mutex<HashMap<String, Expectation>>,
}

impl Expectations {
    /// Empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Expect `count` creations for `key`
    pub fn expect_creations(&self, key: &str, count: i64) {
        let mut entries = self.entries.lock();
        let entry = entries.entry(key.to_string()).or_insert_with(Expectation::new);
        entry.add += count;
        entry.set_at = Instant::now();
        debug!(key, add = entry.add, del = entry.del, "Expecting creations");
    }

    /// Expect the deletion of the named objects for `key`
    pub fn expect_deletions(&self, key: &str, object_keys: &[String]) {
        let mut entries = self.entries.lock();
        let entry = entries.entry(key.to_string()).or_insert_with(Expectation::new);
        for object_key in object_keys {
            if entry.pending_deletions.insert(object_key.clone()) {
                entry.del += 1;
            }
        }
        entry.set_at = Instant::now();
        debug!(key, add = entry.add, del = entry.del, "Expecting deletions");
    }

    /// A creation for `key` was observed (or the create call failed)
    pub fn creation_observed(&self, key: &str) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(key) {
            entry.add -= 1;
        }
    }

    /// The deletion of `object_key` for `key` was observed (or the delete call failed)
    pub fn deletion_observed(&self, key: &str, object_key: &str) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(key) {
            if entry.pending_deletions.remove(object_key) {
                entry.del -= 1;
            }
        }
    }

    /// Whether `key` may act on the cache again
    pub fn satisfied(&self, key: &str) -> bool {
        match self.entries.lock().get(key) {
            None => true,
            Some(entry) => entry.fulfilled() || entry.expired(),
        }
    }

    /// Forget everything about `key`
    pub fn delete(&self, key: &str) {
        self.entries.lock().remove(key);
    }

    /// Unobserved creations across every key
    pub fn all_pending_creations(&self) -> i64 {
        self.entries
            .lock()
            .values()
            .filter(|e| !e.expired())
            .map(|e| e.add.max(0))
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_key_is_satisfied() {
        let exp = Expectations::new();
        assert!(exp.satisfied("ns/m"));
        assert_eq!(exp.all_pending_creations(), 0);
    }

    #[test]
    fn test_creation_blocks_until_observed() {
        let exp = Expectations::new();
        exp.expect_creations("ns/m", 1);
        assert!(!exp.satisfied("ns/m"));
        assert_eq!(exp.all_pending_creations(), 1);

        exp.creation_observed("ns/m");
        assert!(exp.satisfied("ns/m"));
        assert_eq!(exp.all_pending_creations(), 0);
    }

    #[test]
    fn test_pending_creations_sum_over_keys() {
        let exp = Expectations::new();
        exp.expect_creations("ns/a", 1);
        exp.expect_creations("ns/b", 2);
        assert_eq!(exp.all_pending_creations(), 3);
        exp.delete("ns/b");
        assert_eq!(exp.all_pending_creations(), 1);
    }

    mod deletions {
        use super::*;

        /// Story: a pod delete is seen twice (deletion timestamp, then gone)
        #[test]
        fn story_duplicate_delete_events_count_once() {
            let exp = Expectations::new();
            exp.expect_deletions("ns/m", &["ns/target".to_string()]);
            assert!(!exp.satisfied("ns/m"));

            exp.deletion_observed("ns/m", "ns/target");
            exp.deletion_observed("ns/m", "ns/target");
            assert!(exp.satisfied("ns/m"));

            // Second observation must not leave a negative balance that
            // would hide a later expectation
            exp.expect_deletions("ns/m", &["ns/other".to_string()]);
            assert!(!exp.satisfied("ns/m"));
        }

        #[test]
        fn test_unrelated_deletion_is_ignored() {
            let exp = Expectations::new();
            exp.expect_deletions("ns/m", &["ns/target".to_string()]);
            exp.deletion_observed("ns/m", "ns/someone-else");
            assert!(!exp.satisfied("ns/m"));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_expectations_expire() {
        let exp = Expectations::new();
        exp.expect_creations("ns/m", 1);
        tokio::time::advance(EXPECTATIONS_TTL + Duration::from_secs(1)).await;
        assert!(exp.satisfied("ns/m"));
        assert_eq!(exp.all_pending_creations(), 0);
    }
}
