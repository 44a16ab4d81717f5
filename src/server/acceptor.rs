//! Acceptor: per-node promise/accept state machine keyed off a single
//! monotone highest-proposal-seen counter.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use rand::Rng;
use tokio::time::{self, Duration, Instant};

use crate::server::{Key, ProposalNum, ReplicaId, Store};

/// A (key, action) pair remembered for a proposal number, with its arrival
/// time for TTL eviction.
#[derive(Debug, Clone)]
struct ProposalEntry {
    #[allow(dead_code)]
    key: Key,

    #[allow(dead_code)]
    action: u8,

    at: Instant,
}

/// Guarded acceptor state. Kept under one mutex so that each handler either
/// fully records its entry and advances `highest_seen`, or does neither.
#[derive(Debug, Default)]
struct AcceptorState {
    /// Highest proposal number seen in a granted prepare or accept.
    highest_seen: ProposalNum,

    /// Proposals for which a prepare has been granted.
    prepared: HashMap<ProposalNum, ProposalEntry>,

    /// Proposals for which an accept has been granted.
    accepted: HashMap<ProposalNum, ProposalEntry>,
}

/// Per-node acceptor module.
pub(crate) struct Acceptor {
    /// My replica ID.
    me: ReplicaId,

    /// Liveness gate flipped by the replica's start/stop.
    running: AtomicBool,

    /// Guarded promise/accept tables and highest-seen counter.
    state: Mutex<AcceptorState>,

    /// Local store consulted for action feasibility.
    store: Arc<Store>,

    /// Probability in [0, 1] of injecting an artificial stall per call.
    fail_rate: f64,

    /// Upper bound of injected stalls.
    fail_max_delay: Duration,

    /// Eviction age for prepared entries.
    prepared_ttl: Duration,

    /// Eviction age for accepted entries.
    accepted_ttl: Duration,
}

impl Acceptor {
    /// Creates a new acceptor module.
    pub(crate) fn new(
        me: ReplicaId,
        store: Arc<Store>,
        fail_rate: f64,
        fail_max_delay: Duration,
        prepared_ttl: Duration,
        accepted_ttl: Duration,
    ) -> Self {
        Acceptor {
            me,
            running: AtomicBool::new(false),
            state: Mutex::new(AcceptorState::default()),
            store,
            fail_rate,
            fail_max_delay,
            prepared_ttl,
            accepted_ttl,
        }
    }

    /// Flips the liveness gate.
    pub(crate) fn set_running(&self, on: bool) {
        self.running.store(on, Ordering::SeqCst);
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Handles a prepare message. Grants the promise iff the node is
    /// running, the id is not strictly below the highest seen, and the
    /// action is feasible against the local store.
    pub(crate) async fn prepare(
        &self,
        id: ProposalNum,
        key: Key,
        action: u8,
    ) -> bool {
        if !self.is_running() {
            pf_warn!(self.me; "not running, rejecting prepare for proposal {}", id);
            return false;
        }
        self.maybe_inject_delay().await;

        let mut state = self.state.lock().unwrap();
        if id < state.highest_seen {
            pf_trace!(self.me; "rejecting prepare {} (highest seen {})",
                               id, state.highest_seen);
            return false;
        }
        if !self.store.validate(key, action) {
            pf_warn!(self.me; "rejecting prepare {} (action {} infeasible for key {})",
                              id, action, key);
            return false;
        }

        state.prepared.insert(
            id,
            ProposalEntry {
                key,
                action,
                at: Instant::now(),
            },
        );
        state.highest_seen = id;
        pf_debug!(self.me; "prepared proposal {} for key {} action {}",
                           id, key, action);
        true
    }

    /// Handles an accept message. Grants iff the node is running, the id is
    /// not strictly below the highest seen, and a prepared entry exists for
    /// this id.
    pub(crate) async fn accept(
        &self,
        id: ProposalNum,
        key: Key,
        action: u8,
    ) -> bool {
        if !self.is_running() {
            pf_warn!(self.me; "not running, rejecting accept for proposal {}", id);
            return false;
        }
        self.maybe_inject_delay().await;

        let mut state = self.state.lock().unwrap();
        if id < state.highest_seen {
            pf_trace!(self.me; "rejecting accept {} (highest seen {})",
                               id, state.highest_seen);
            return false;
        }
        if !state.prepared.contains_key(&id) {
            pf_warn!(self.me; "rejecting accept {} (not prepared)", id);
            return false;
        }

        state.accepted.insert(
            id,
            ProposalEntry {
                key,
                action,
                at: Instant::now(),
            },
        );
        state.highest_seen = id;
        pf_debug!(self.me; "accepted proposal {} for key {} action {}",
                           id, key, action);
        true
    }

    /// Evicts prepared/accepted entries past their TTLs. Driven by the
    /// replica's maintenance ticker.
    pub(crate) fn sweep_expired(&self) {
        let mut state = self.state.lock().unwrap();
        let prepared_ttl = self.prepared_ttl;
        let accepted_ttl = self.accepted_ttl;
        state.prepared.retain(|_, entry| entry.at.elapsed() <= prepared_ttl);
        state.accepted.retain(|_, entry| entry.at.elapsed() <= accepted_ttl);
    }

    /// Injects a probabilistic artificial stall modeling peer flakiness.
    /// Gated by config; a rate of 0.0 disables injection entirely.
    async fn maybe_inject_delay(&self) {
        if self.fail_rate <= 0.0 {
            return;
        }
        let delay = {
            let mut rng = rand::thread_rng();
            if rng.gen::<f64>() >= self.fail_rate {
                return;
            }
            let max_ms = self.fail_max_delay.as_millis().max(100) as u64;
            Duration::from_millis(rng.gen_range(100..=max_ms))
        };
        pf_info!(self.me; "injecting {} ms stall", delay.as_millis());
        time::sleep(delay).await;
    }

    /// Highest proposal number seen so far.
    #[cfg(test)]
    fn highest_seen(&self) -> ProposalNum {
        self.state.lock().unwrap().highest_seen
    }

    #[cfg(test)]
    fn table_sizes(&self) -> (usize, usize) {
        let state = self.state.lock().unwrap();
        (state.prepared.len(), state.accepted.len())
    }
}
