//! In-memory presence-bit store: a key's existence is its value.

use std::collections::HashSet;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

/// Store key type: a bounded non-negative integer identifying a store slot.
pub type Key = u64;

/// Client-visible action kinds with their fixed wire codes.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub enum Action {
    /// Query a key's presence.
    Read,

    /// Record a key's presence.
    Insert,

    /// Clear a key's presence.
    Remove,
}

impl Action {
    /// Decodes a wire-level action code; codes outside {1, 2, 3} yield
    /// `None` and must be surfaced as the invalid-action sentinel by the
    /// caller.
    pub fn from_code(code: u8) -> Option<Action> {
        match code {
            1 => Some(Action::Read),
            2 => Some(Action::Insert),
            3 => Some(Action::Remove),
            _ => None,
        }
    }

    /// Returns the wire-level action code.
    pub fn code(&self) -> u8 {
        match self {
            Action::Read => 1,
            Action::Insert => 2,
            Action::Remove => 3,
        }
    }
}

/// Outcome of a store operation: a classification flag used for the
/// learner's counters plus the client-visible sentinel text.
#[derive(Debug, PartialEq, Eq, Clone)]
pub(crate) struct StoreReply {
    /// True if the operation reported the success sentinel.
    pub(crate) ok: bool,

    /// Human-readable sentinel string.
    pub(crate) msg: String,
}

impl StoreReply {
    fn ok(msg: String) -> Self {
        StoreReply { ok: true, msg }
    }

    fn fail(msg: String) -> Self {
        StoreReply { ok: false, msg }
    }
}

/// The in-memory store, shared between the local learner (commit execution)
/// and the local acceptor (validation). All operations are atomic relative
/// to one another.
#[derive(Debug, Default)]
pub(crate) struct Store {
    keys: Mutex<HashSet<Key>>,
}

impl Store {
    /// Creates an empty store.
    pub(crate) fn new() -> Self {
        Store {
            keys: Mutex::new(HashSet::new()),
        }
    }

    /// Queries the presence of a key.
    pub(crate) fn read(&self, key: Key) -> StoreReply {
        if self.keys.lock().unwrap().contains(&key) {
            StoreReply::ok(format!("key {} found", key))
        } else {
            StoreReply::fail(format!("key {} not found", key))
        }
    }

    /// Records the presence of a key.
    pub(crate) fn insert(&self, key: Key) -> StoreReply {
        if self.keys.lock().unwrap().insert(key) {
            StoreReply::ok(format!("key {} inserted", key))
        } else {
            StoreReply::fail(format!("key {} already present", key))
        }
    }

    /// Clears the presence of a key.
    pub(crate) fn remove(&self, key: Key) -> StoreReply {
        if self.keys.lock().unwrap().remove(&key) {
            StoreReply::ok(format!("key {} removed", key))
        } else {
            StoreReply::fail(format!("key {} not found", key))
        }
    }

    /// Cheap advisory precondition check on a raw action code: INSERT is
    /// feasible iff the key is absent, REMOVE iff present, READ always.
    /// The authoritative outcome is still produced at commit time.
    pub(crate) fn validate(&self, key: Key, action: u8) -> bool {
        match Action::from_code(action) {
            Some(Action::Read) => true,
            Some(Action::Insert) => !self.keys.lock().unwrap().contains(&key),
            Some(Action::Remove) => self.keys.lock().unwrap().contains(&key),
            None => false,
        }
    }

    /// Queries the presence bit directly (no sentinel formatting).
    pub(crate) fn contains(&self, key: Key) -> bool {
        self.keys.lock().unwrap().contains(&key)
    }

    /// Number of keys currently present.
    #[allow(dead_code)]
    pub(crate) fn len(&self) -> usize {
        self.keys.lock().unwrap().len()
    }
}

#[cfg(test)]
mod store_tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn read_empty() {
        let store = Store::new();
        let reply = store.read(7);
        assert!(!reply.ok);
        assert!(reply.msg.contains("not found"));
    }

    #[test]
    fn insert_then_read() {
        let store = Store::new();
        assert!(store.insert(7).ok);
        let reply = store.read(7);
        assert!(reply.ok);
        assert!(reply.msg.contains("found"));
    }

    #[test]
    fn insert_twice() {
        let store = Store::new();
        assert!(store.insert(7).ok);
        let reply = store.insert(7);
        assert!(!reply.ok);
        assert!(reply.msg.contains("already present"));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn remove_present_and_absent() {
        let store = Store::new();
        assert!(store.insert(7).ok);
        assert!(store.remove(7).ok);
        let reply = store.remove(7);
        assert!(!reply.ok);
        assert!(reply.msg.contains("not found"));
    }

    #[test]
    fn validate_preconditions() {
        let store = Store::new();
        assert!(store.validate(7, Action::Read.code()));
        assert!(store.validate(7, Action::Insert.code()));
        assert!(!store.validate(7, Action::Remove.code()));
        store.insert(7);
        assert!(store.validate(7, Action::Read.code()));
        assert!(!store.validate(7, Action::Insert.code()));
        assert!(store.validate(7, Action::Remove.code()));
        // unknown codes are never feasible
        assert!(!store.validate(7, 4));
        assert!(!store.validate(7, 0));
    }

    #[test]
    fn action_code_round_trip() {
        for action in [Action::Read, Action::Insert, Action::Remove] {
            assert_eq!(Action::from_code(action.code()), Some(action));
        }
        assert_eq!(Action::from_code(0), None);
        assert_eq!(Action::from_code(4), None);
    }

    #[test]
    fn insert_remove_rand() {
        let store = Store::new();
        let mut ref_set = std::collections::HashSet::new();
        let mut rng = rand::thread_rng();
        for _ in 0..1000 {
            let key: Key = rng.gen_range(0..50);
            if rng.gen_bool(0.5) {
                assert_eq!(store.insert(key).ok, ref_set.insert(key));
            } else {
                assert_eq!(store.remove(key).ok, ref_set.remove(&key));
            }
        }
        for key in 0..50 {
            assert_eq!(store.contains(key), ref_set.contains(&key));
        }
    }
}
