//! Learner: executes committed actions against the store and keeps basic
//! success/failure statistics.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::time::{Duration, Instant};

use crate::server::{Action, Key, ReplicaId, Store};

/// Record of an applied commit, retained for introspection only.
#[derive(Debug, Clone)]
struct CommitRecord {
    #[allow(dead_code)]
    key: Key,

    #[allow(dead_code)]
    action: u8,

    #[allow(dead_code)]
    result: String,

    /// Application time, used for retention eviction.
    at: Instant,
}

/// Per-node learner module.
pub(crate) struct Learner {
    /// My replica ID.
    me: ReplicaId,

    /// Local store the commits execute against.
    store: Arc<Store>,

    /// Per-key record of the latest applied commit.
    history: Mutex<HashMap<Key, CommitRecord>>,

    /// Retention window for commit records.
    retention: Duration,

    total_commits: AtomicU64,
    successful_commits: AtomicU64,
    failed_commits: AtomicU64,
}

impl Learner {
    /// Creates a new learner module.
    pub(crate) fn new(
        me: ReplicaId,
        store: Arc<Store>,
        retention: Duration,
    ) -> Self {
        Learner {
            me,
            store,
            history: Mutex::new(HashMap::new()),
            retention,
            total_commits: AtomicU64::new(0),
            successful_commits: AtomicU64::new(0),
            failed_commits: AtomicU64::new(0),
        }
    }

    /// Applies a committed (key, action) pair to the store and returns the
    /// human-readable result. Re-delivery is permitted; the store's own
    /// sentinels make repeated commits yield the same class of result.
    /// Never consults proposal numbers.
    pub(crate) fn commit(&self, key: Key, action: u8) -> String {
        self.total_commits.fetch_add(1, Ordering::Relaxed);

        let Some(act) = Action::from_code(action) else {
            self.failed_commits.fetch_add(1, Ordering::Relaxed);
            pf_warn!(self.me; "invalid action {} requested for key {}",
                              action, key);
            return format!("invalid action code {}", action);
        };

        let reply = match act {
            Action::Read => self.store.read(key),
            Action::Insert => self.store.insert(key),
            Action::Remove => self.store.remove(key),
        };
        if reply.ok {
            self.successful_commits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed_commits.fetch_add(1, Ordering::Relaxed);
        }

        self.history.lock().unwrap().insert(
            key,
            CommitRecord {
                key,
                action,
                result: reply.msg.clone(),
                at: Instant::now(),
            },
        );

        pf_debug!(self.me; "committed key {} action {}: {}",
                           key, action, reply.msg);
        reply.msg
    }

    /// Evicts commit records past the retention window. Driven by the
    /// replica's maintenance ticker.
    pub(crate) fn sweep_old_records(&self) {
        let retention = self.retention;
        self.history
            .lock()
            .unwrap()
            .retain(|_, record| record.at.elapsed() <= retention);
    }

    /// Logs a one-line statistics summary if any commits have been seen.
    pub(crate) fn log_statistics(&self) {
        let total = self.total_commits.load(Ordering::Relaxed);
        if total > 0 {
            pf_info!(self.me;
                     "commits total {} successful {} failed {} rate {:.2}% records {}",
                     total,
                     self.successful_commits.load(Ordering::Relaxed),
                     self.failed_commits.load(Ordering::Relaxed),
                     self.success_rate(),
                     self.history_size());
        }
    }

    pub(crate) fn total_commits(&self) -> u64 {
        self.total_commits.load(Ordering::Relaxed)
    }

    pub(crate) fn successful_commits(&self) -> u64 {
        self.successful_commits.load(Ordering::Relaxed)
    }

    pub(crate) fn failed_commits(&self) -> u64 {
        self.failed_commits.load(Ordering::Relaxed)
    }

    /// Percentage of commits that reported the success sentinel.
    pub(crate) fn success_rate(&self) -> f64 {
        let total = self.total_commits();
        if total == 0 {
            0.0
        } else {
            self.successful_commits() as f64 / total as f64 * 100.0
        }
    }

    /// Number of commit records currently retained.
    pub(crate) fn history_size(&self) -> usize {
        self.history.lock().unwrap().len()
    }
}
