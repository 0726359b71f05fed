//! Priority work queue
//!
//! Keys carry an integer priority and an optional ready time. Workers
//! always receive the highest-priority ready key, FIFO within a priority.
//!
//! A key handed to a worker is "processing" until [`PriorityQueue::done`].
//! Adding it again meanwhile only marks it dirty; it becomes ready again
//! once the worker is done, so no two workers ever hold the same key.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::DEFAULT_PRIORITY;
use crate::retry::{ItemRateLimiter, RetryConfig};

/// Options for [`PriorityQueue::add_with_opts`]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AddOpts {
    /// Priority, higher first
    pub priority: i32,
    /// Delay before the key becomes ready
    pub after: Option<Duration>,
    /// Apply the per-key failure backoff on top of `after`
    pub rate_limited: bool,
}

#[derive(Clone, Copy, Debug)]
struct Entry {
    priority: i32,
    ready_at: Instant,
    seq: u64,
}

impl Entry {
    fn merge(&mut self, other: Entry) {
        self.priority = self.priority.max(other.priority);
        if other.ready_at < self.ready_at {
            self.ready_at = other.ready_at;
        }
    }
}

#[derive(Debug, Default)]
struct QueueState {
    pending: HashMap<String, Entry>,
    processing: HashMap<String, i32>,
    dirty: HashMap<String, Entry>,
    next_seq: u64,
    shut_down: bool,
}

impl QueueState {
    fn pop_ready(&mut self, now: Instant) -> Option<String> {
        let key = self
            .pending
            .iter()
            .filter(|(_, e)| e.ready_at <= now)
            .max_by(|(_, a), (_, b)| a.priority.cmp(&b.priority).then(b.seq.cmp(&a.seq)))
            .map(|(k, _)| k.clone())?;
        if let Some(entry) = self.pending.remove(&key) {
            self.processing.insert(key.clone(), entry.priority);
        }
        Some(key)
    }

    fn next_ready_at(&self) -> Option<Instant> {
        self.pending.values().map(|e| e.ready_at).min()
    }
}

/// Shared priority queue of migration keys
#[derive(Debug)]
pub struct PriorityQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    rate_limiter: ItemRateLimiter,
}

impl Default for PriorityQueue {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

impl PriorityQueue {
    /// Queue whose failed keys back off per `retry`
    pub fn new(retry: RetryConfig) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            rate_limiter: ItemRateLimiter::new(retry),
        }
    }

    /// Add `key` at the default priority, ready now
    pub fn add(&self, key: &str) {
        self.add_with_opts(
            key,
            AddOpts {
                priority: DEFAULT_PRIORITY,
                ..Default::default()
            },
        );
    }

    /// Add `key` with a priority and an optional delay
    ///
    /// A key already queued keeps the higher of both priorities and the
    /// earlier of both ready times.
    pub fn add_with_opts(&self, key: &str, opts: AddOpts) {
        let mut after = opts.after.unwrap_or_default();
        if opts.rate_limited {
            after = after.max(self.rate_limiter.when(key));
        }

        let mut state = self.state.lock();
        if state.shut_down {
            return;
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        let entry = Entry {
            priority: opts.priority,
            ready_at: Instant::now() + after,
            seq,
        };

        let target = if state.processing.contains_key(key) {
            &mut state.dirty
        } else {
            &mut state.pending
        };
        target
            .entry(key.to_string())
            .and_modify(|e| e.merge(entry))
            .or_insert(entry);
        drop(state);
        self.notify.notify_waiters();
    }

    /// Wait for the next ready key
    ///
    /// Returns `None` once the queue is shut down.
    pub async fn get(&self) -> Option<String> {
        loop {
            let notified = self.notify.notified();
            let next_ready = {
                let mut state = self.state.lock();
                if state.shut_down {
                    return None;
                }
                if let Some(key) = state.pop_ready(Instant::now()) {
                    return Some(key);
                }
                state.next_ready_at()
            };

            match next_ready {
                Some(at) => {
                    tokio::select! {
                        _ = notified => {}
                        _ = tokio::time::sleep_until(at) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Mark a key returned by [`get`](Self::get) as finished
    pub fn done(&self, key: &str) {
        let mut state = self.state.lock();
        state.processing.remove(key);
        if let Some(entry) = state.dirty.remove(key) {
            state
                .pending
                .entry(key.to_string())
                .and_modify(|e| e.merge(entry))
                .or_insert(entry);
            drop(state);
            self.notify.notify_waiters();
        }
    }

    /// Reset the failure backoff of `key`
    pub fn forget(&self, key: &str) {
        self.rate_limiter.forget(key);
    }

    /// Consecutive failures recorded for `key`
    pub fn num_requeues(&self, key: &str) -> u32 {
        self.rate_limiter.num_requeues(key)
    }

    /// Whether `key` is waiting (ready or not), or will be once processed
    pub fn contains(&self, key: &str) -> bool {
        let state = self.state.lock();
        state.pending.contains_key(key) || state.dirty.contains_key(key)
    }

    /// Priority `key` is queued with
    pub fn priority_of(&self, key: &str) -> Option<i32> {
        let state = self.state.lock();
        state
            .pending
            .get(key)
            .or_else(|| state.dirty.get(key))
            .map(|e| e.priority)
    }

    /// Priority a key currently held by a worker was handed out with
    pub fn in_flight_priority(&self, key: &str) -> Option<i32> {
        self.state.lock().processing.get(key).copied()
    }

    /// Number of waiting keys
    pub fn len(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Whether no key is waiting
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop handing out keys and wake every waiting worker
    pub fn shutdown(&self) {
        self.state.lock().shut_down = true;
        self.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn opts(priority: i32, after: Option<Duration>) -> AddOpts {
        AddOpts {
            priority,
            after,
            rate_limited: false,
        }
    }

    #[tokio::test]
    async fn test_highest_priority_first_then_fifo() {
        let queue = PriorityQueue::default();
        queue.add_with_opts("ns/low", opts(crate::LOW_PRIORITY, None));
        queue.add("ns/a");
        queue.add("ns/b");
        queue.add_with_opts("ns/high", opts(10, None));

        assert_eq!(queue.get().await.as_deref(), Some("ns/high"));
        assert_eq!(queue.get().await.as_deref(), Some("ns/a"));
        assert_eq!(queue.get().await.as_deref(), Some("ns/b"));
        assert_eq!(queue.get().await.as_deref(), Some("ns/low"));
    }

    #[tokio::test]
    async fn test_readd_keeps_max_priority() {
        let queue = PriorityQueue::default();
        queue.add_with_opts("ns/m", opts(crate::LOW_PRIORITY, None));
        queue.add("ns/m");
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.priority_of("ns/m"), Some(DEFAULT_PRIORITY));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_key_waits_for_ready_time() {
        let queue = PriorityQueue::default();
        queue.add_with_opts("ns/later", opts(10, Some(Duration::from_secs(5))));
        queue.add("ns/now");

        let start = Instant::now();
        assert_eq!(queue.get().await.as_deref(), Some("ns/now"));
        assert_eq!(queue.get().await.as_deref(), Some("ns/later"));
        assert!(start.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_add_backs_off() {
        let queue = PriorityQueue::new(RetryConfig {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
        });
        queue.add_with_opts(
            "ns/m",
            AddOpts {
                rate_limited: true,
                ..Default::default()
            },
        );
        let start = Instant::now();
        assert_eq!(queue.get().await.as_deref(), Some("ns/m"));
        assert!(start.elapsed() >= Duration::from_secs(1));
        assert_eq!(queue.num_requeues("ns/m"), 1);
        queue.forget("ns/m");
        assert_eq!(queue.num_requeues("ns/m"), 0);
    }

    mod processing {
        use super::*;

        /// Story: a watch event arrives while the key is being reconciled
        #[tokio::test]
        async fn story_in_flight_key_is_handed_out_once() {
            let queue = PriorityQueue::default();
            queue.add("ns/m");
            let key = queue.get().await.unwrap();
            assert_eq!(queue.in_flight_priority(&key), Some(DEFAULT_PRIORITY));

            queue.add("ns/m");
            queue.add("ns/m");
            assert!(queue.contains("ns/m"));
            assert!(queue.is_empty(), "dirty key must not be ready while processing");

            queue.done(&key);
            assert_eq!(queue.len(), 1);
            assert_eq!(queue.get().await.as_deref(), Some("ns/m"));
            queue.done("ns/m");
            assert!(!queue.contains("ns/m"));
        }

        #[tokio::test]
        async fn test_waiting_worker_wakes_on_add() {
            let queue = Arc::new(PriorityQueue::default());
            let waiter = {
                let queue = queue.clone();
                tokio::spawn(async move { queue.get().await })
            };
            tokio::task::yield_now().await;
            queue.add("ns/m");
            assert_eq!(waiter.await.unwrap().as_deref(), Some("ns/m"));
        }
    }

    #[tokio::test]
    async fn test_shutdown_releases_waiters() {
        let queue = Arc::new(PriorityQueue::default());
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.get().await })
        };
        tokio::task::yield_now().await;
        queue.shutdown();
        assert_eq!(waiter.await.unwrap(), None);

        queue.add("ns/m");
        assert!(queue.is_empty());
    }
}
