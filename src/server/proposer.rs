//! Proposer: drives the three-phase prepare/accept/commit protocol across
//! the cluster and measures quorum.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use futures::future::join_all;
use tokio::sync::Semaphore;
use tokio::time::{Duration, Instant};

use crate::server::{
    call_peer, Key, PeerReply, PeerRequest, ProposalNum, ReplicaId,
};

/// Read-only snapshot of the proposer's performance counters.
#[derive(Debug, Clone, PartialEq)]
pub struct ProposerMetrics {
    /// Proposals started.
    pub total_proposals: u64,

    /// Proposals that completed all three phases.
    pub successful_proposals: u64,

    /// Proposals abandoned at a phase-quorum failure.
    pub failed_proposals: u64,

    /// Average end-to-end proposal latency in milliseconds.
    pub avg_latency_ms: f64,

    /// Proposals currently in flight.
    pub in_flight: usize,
}

/// In-flight bookkeeping for one proposal.
#[derive(Debug, Clone)]
struct InFlight {
    #[allow(dead_code)]
    key: Key,

    #[allow(dead_code)]
    action: u8,

    /// Submission time, used for expiry eviction.
    at: Instant,
}

/// Per-node proposer module, servicing many concurrent client calls.
pub(crate) struct Proposer {
    /// My replica ID.
    me: ReplicaId,

    /// Ordered peer p2p addresses, self included.
    membership: Vec<SocketAddr>,

    /// Majority quorum size.
    quorum: usize,

    /// Liveness gate flipped by the replica's start/stop.
    running: AtomicBool,

    /// Process-wide monotonic proposal number counter. Numbers are not
    /// globally unique across nodes; the acceptor's strict-less-than rule
    /// accommodates collisions.
    next_proposal: AtomicU64,

    /// Table of proposals currently in flight.
    in_flight: Mutex<HashMap<ProposalNum, InFlight>>,

    /// Serializes the three-phase pipeline: one proposal owns it from
    /// creation to removal. Intra-phase peer fanout still runs in parallel.
    phase_lock: tokio::sync::Mutex<()>,

    /// Bounded work pool for concurrent proposals.
    pool: Semaphore,

    /// Per-peer-RPC timeout.
    rpc_timeout: Duration,

    /// Age past which in-flight records are garbage-collected.
    expiry: Duration,

    total_proposals: AtomicU64,
    successful_proposals: AtomicU64,
    failed_proposals: AtomicU64,
    latency_total_ms: AtomicU64,
}

impl Proposer {
    /// Creates a new proposer module for the given cluster membership.
    pub(crate) fn new(
        me: ReplicaId,
        membership: Vec<SocketAddr>,
        rpc_timeout: Duration,
        expiry: Duration,
        max_concurrent: usize,
    ) -> Self {
        let population = membership.len();
        Proposer {
            me,
            membership,
            quorum: population / 2 + 1,
            running: AtomicBool::new(false),
            next_proposal: AtomicU64::new(0),
            in_flight: Mutex::new(HashMap::new()),
            phase_lock: tokio::sync::Mutex::new(()),
            pool: Semaphore::new(max_concurrent),
            rpc_timeout,
            expiry,
            total_proposals: AtomicU64::new(0),
            successful_proposals: AtomicU64::new(0),
            failed_proposals: AtomicU64::new(0),
            latency_total_ms: AtomicU64::new(0),
        }
    }

    /// Flips the liveness gate.
    pub(crate) fn set_running(&self, on: bool) {
        self.running.store(on, Ordering::SeqCst);
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Runs one full proposal for a (key, action) pair and returns the
    /// client-visible result string. May be invoked concurrently from many
    /// tasks; each call owns its proposal from creation to removal.
    pub(crate) async fn propose(&self, key: Key, action: u8) -> String {
        let _permit = match self.pool.acquire().await {
            Ok(permit) => permit,
            Err(e) => {
                pf_error!(self.me; "proposal pool closed: {}", e);
                return "error processing proposal".into();
            }
        };

        let _phase_guard = self.phase_lock.lock().await;

        let start = Instant::now();
        let id = self.next_proposal.fetch_add(1, Ordering::SeqCst) + 1;
        self.in_flight.lock().unwrap().insert(
            id,
            InFlight {
                key,
                action,
                at: start,
            },
        );
        self.total_proposals.fetch_add(1, Ordering::Relaxed);
        pf_debug!(self.me; "starting proposal {} for key {} action {}",
                           id, key, action);

        // phase 1: prepare. An abandoned proposal stays in the in-flight
        // table until the expiry sweep collects it.
        if !self
            .quorum_phase(
                PeerRequest::Prepare { id, key, action },
                "prepare",
            )
            .await
        {
            self.record_outcome(start, false);
            return format!(
                "failed to reach consensus in prepare phase for proposal {}",
                id
            );
        }

        // phase 2: accept
        if !self
            .quorum_phase(PeerRequest::Accept { id, key, action }, "accept")
            .await
        {
            self.record_outcome(start, false);
            return format!(
                "failed to reach consensus in accept phase for proposal {}",
                id
            );
        }

        // phase 3: commit
        let result = self.commit_phase(id, key, action).await;
        self.in_flight.lock().unwrap().remove(&id);
        self.record_outcome(start, true);
        result
    }

    /// Fans a slice of (key, action) pairs through concurrent proposals and
    /// collects the per-op results in order.
    pub(crate) async fn propose_batch(
        &self,
        ops: &[(Key, u8)],
    ) -> Vec<String> {
        join_all(
            ops.iter()
                .map(|&(key, action)| self.propose(key, action)),
        )
        .await
    }

    /// Folds a finished proposal's outcome into the metrics counters.
    fn record_outcome(&self, start: Instant, success: bool) {
        self.latency_total_ms.fetch_add(
            start.elapsed().as_millis() as u64,
            Ordering::Relaxed,
        );
        if success {
            self.successful_proposals.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed_proposals.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Fans one request out to every member in parallel and counts positive
    /// votes. Peer RPC failures (timeout, unreachable, remote error) count
    /// as negative votes and never abort the phase.
    async fn quorum_phase(&self, req: PeerRequest, phase: &str) -> bool {
        if !self.is_running() {
            return false;
        }

        let votes = join_all(self.membership.iter().map(|&addr| {
            let req = req.clone();
            async move {
                match call_peer(addr, &req, self.rpc_timeout).await {
                    Ok(PeerReply::Vote { granted }) => granted,
                    Ok(reply) => {
                        pf_warn!(self.me; "unexpected reply {:?} from '{}' during {}",
                                          reply, addr, phase);
                        false
                    }
                    Err(e) => {
                        pf_warn!(self.me; "peer '{}' failed during {}: {}",
                                          addr, phase, e);
                        false
                    }
                }
            }
        }))
        .await;

        let granted = votes.iter().filter(|&&vote| vote).count();
        if granted >= self.quorum {
            pf_debug!(self.me; "{} phase successful: {}/{} granted",
                               phase, granted, self.membership.len());
            true
        } else {
            pf_warn!(self.me; "{} phase failed: {}/{} granted, quorum {}",
                              phase, granted, self.membership.len(), self.quorum);
            false
        }
    }

    /// Broadcasts the commit to every member and returns the first
    /// non-empty reply. No quorum is required; peers that fail here are
    /// tolerated and may diverge on this operation.
    async fn commit_phase(
        &self,
        id: ProposalNum,
        key: Key,
        action: u8,
    ) -> String {
        let req = PeerRequest::Commit { key, action };
        let replies = join_all(self.membership.iter().map(|&addr| {
            let req = req.clone();
            async move {
                match call_peer(addr, &req, self.rpc_timeout).await {
                    Ok(PeerReply::Committed { result }) => Some(result),
                    Ok(reply) => {
                        pf_warn!(self.me; "unexpected reply {:?} from '{}' during commit",
                                          reply, addr);
                        None
                    }
                    Err(e) => {
                        pf_warn!(self.me; "peer '{}' failed during commit: {}",
                                          addr, e);
                        None
                    }
                }
            }
        }))
        .await;

        match replies.into_iter().flatten().find(|r| !r.is_empty()) {
            Some(result) => {
                pf_debug!(self.me; "commit phase for proposal {}: {}",
                                   id, result);
                result
            }
            None => {
                pf_warn!(self.me; "commit phase failed for proposal {}", id);
                format!("commit failed for proposal {}", id)
            }
        }
    }

    /// Evicts in-flight records past the expiry age. Expiry only
    /// garbage-collects the record; it never cancels the running proposal.
    pub(crate) fn sweep_expired(&self) {
        let expiry = self.expiry;
        self.in_flight
            .lock()
            .unwrap()
            .retain(|_, entry| entry.at.elapsed() <= expiry);
    }

    /// Takes a snapshot of the performance counters.
    pub(crate) fn metrics(&self) -> ProposerMetrics {
        let total = self.total_proposals.load(Ordering::Relaxed);
        let done = self.successful_proposals.load(Ordering::Relaxed)
            + self.failed_proposals.load(Ordering::Relaxed);
        ProposerMetrics {
            total_proposals: total,
            successful_proposals: self
                .successful_proposals
                .load(Ordering::Relaxed),
            failed_proposals: self.failed_proposals.load(Ordering::Relaxed),
            avg_latency_ms: if done == 0 {
                0.0
            } else {
                self.latency_total_ms.load(Ordering::Relaxed) as f64
                    / done as f64
            },
            in_flight: self.in_flight.lock().unwrap().len(),
        }
    }

    #[cfg(test)]
    fn in_flight_insert(&self, id: ProposalNum) {
        self.in_flight.lock().unwrap().insert(
            id,
            InFlight {
                key: 0,
                action: 1,
                at: Instant::now(),
            },
        );
    }
}

#[cfg(test)]
mod proposer_tests {
    use super::*;
    use crate::server::{
        spawn_peer_listener, Acceptor, Action, Learner, Store,
    };
    use crate::utils::{tcp_bind_with_retry, PaxKvError};
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use tokio::sync::watch;

    /// Spins up a standalone peer node (acceptor + learner + store behind a
    /// peer listener) on the given port. Returns its store handle plus the
    /// shutdown sender keeping the listener alive.
    async fn spawn_peer_node(
        id: ReplicaId,
        addr: SocketAddr,
    ) -> Result<(Arc<Store>, watch::Sender<bool>), PaxKvError> {
        let store = Arc::new(Store::new());
        let acceptor = Arc::new(Acceptor::new(
            id,
            store.clone(),
            0.0,
            Duration::from_millis(5000),
            Duration::from_secs(60),
            Duration::from_secs(120),
        ));
        acceptor.set_running(true);
        let learner =
            Arc::new(Learner::new(id, store.clone(), Duration::from_secs(300)));
        let listener = tcp_bind_with_retry(addr, 2).await?;
        let (tx_shutdown, rx_shutdown) = watch::channel(false);
        spawn_peer_listener(
            id,
            listener,
            Arc::new(AtomicBool::new(true)),
            acceptor,
            learner,
            rx_shutdown,
        );
        Ok((store, tx_shutdown))
    }

    fn test_proposer(membership: Vec<SocketAddr>) -> Proposer {
        let proposer = Proposer::new(
            0,
            membership,
            Duration::from_millis(500),
            Duration::from_secs(30),
            1000,
        );
        proposer.set_running(true);
        proposer
    }

    fn addrs(base_port: u16, n: u16) -> Vec<SocketAddr> {
        (0..n)
            .map(|i| {
                format!("127.0.0.1:{}", base_port + i).parse().unwrap()
            })
            .collect()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 3)]
    async fn all_healthy_put() -> Result<(), PaxKvError> {
        let membership = addrs(31800, 5);
        let mut nodes = vec![];
        for (i, &addr) in membership.iter().enumerate() {
            nodes.push(spawn_peer_node(i as ReplicaId, addr).await?);
        }
        let proposer = test_proposer(membership);

        let result = proposer.propose(7, Action::Insert.code()).await;
        assert!(result.contains("inserted"));
        for (store, _) in &nodes {
            assert!(store.contains(7));
        }

        let metrics = proposer.metrics();
        assert_eq!(metrics.total_proposals, 1);
        assert_eq!(metrics.successful_proposals, 1);
        assert_eq!(metrics.in_flight, 0);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 3)]
    async fn quorum_edge_succeeds_with_exactly_q() -> Result<(), PaxKvError> {
        // 3 of 5 members reachable: exactly quorum
        let membership = addrs(31810, 5);
        let mut nodes = vec![];
        for (i, &addr) in membership.iter().take(3).enumerate() {
            nodes.push(spawn_peer_node(i as ReplicaId, addr).await?);
        }
        let proposer = test_proposer(membership);

        let result = proposer.propose(7, Action::Insert.code()).await;
        assert!(result.contains("inserted"));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 3)]
    async fn below_quorum_fails_in_prepare() -> Result<(), PaxKvError> {
        // only 2 of 5 members reachable: one below quorum
        let membership = addrs(31820, 5);
        let mut nodes = vec![];
        for (i, &addr) in membership.iter().take(2).enumerate() {
            nodes.push(spawn_peer_node(i as ReplicaId, addr).await?);
        }
        let proposer = test_proposer(membership);

        let result = proposer.propose(7, Action::Insert.code()).await;
        assert!(result.contains("prepare phase"));
        // no state change on the reachable members
        for (store, _) in &nodes {
            assert!(!store.contains(7));
        }

        let metrics = proposer.metrics();
        assert_eq!(metrics.failed_proposals, 1);
        // the abandoned proposal lingers until the expiry sweep
        assert_eq!(metrics.in_flight, 1);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 3)]
    async fn proposal_numbers_increase() -> Result<(), PaxKvError> {
        let membership = addrs(31830, 3);
        let mut nodes = vec![];
        for (i, &addr) in membership.iter().enumerate() {
            nodes.push(spawn_peer_node(i as ReplicaId, addr).await?);
        }
        let proposer = test_proposer(membership);

        proposer.propose(1, Action::Insert.code()).await;
        proposer.propose(2, Action::Insert.code()).await;
        proposer.propose(3, Action::Insert.code()).await;
        assert_eq!(proposer.next_proposal.load(Ordering::SeqCst), 3);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 3)]
    async fn batch_collects_in_order() -> Result<(), PaxKvError> {
        let membership = addrs(31840, 3);
        let mut nodes = vec![];
        for (i, &addr) in membership.iter().enumerate() {
            nodes.push(spawn_peer_node(i as ReplicaId, addr).await?);
        }
        let proposer = test_proposer(membership);

        let results = proposer
            .propose_batch(&[
                (1, Action::Insert.code()),
                (2, Action::Insert.code()),
                (1, Action::Remove.code()),
            ])
            .await;
        assert_eq!(results.len(), 3);
        assert!(results[0].contains("key 1"));
        assert!(results[1].contains("key 2"));
        assert!(results[2].contains("key 1"));
        Ok(())
    }

    #[tokio::test]
    async fn sweep_evicts_expired_records() {
        let proposer = Proposer::new(
            0,
            addrs(31850, 1),
            Duration::from_millis(500),
            Duration::from_millis(20),
            1000,
        );
        proposer.in_flight_insert(1);
        assert_eq!(proposer.metrics().in_flight, 1);
        tokio::time::sleep(Duration::from_millis(30)).await;
        proposer.in_flight_insert(2);
        proposer.sweep_expired();
        assert_eq!(proposer.metrics().in_flight, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 3)]
    async fn infeasible_op_rejected_by_acceptors() -> Result<(), PaxKvError> {
        // a REMOVE of a key no member has ever inserted runs the full
        // prepare fanout and is vetoed by every acceptor's feasibility check
        let membership = addrs(31860, 3);
        let mut nodes = vec![];
        for (i, &addr) in membership.iter().enumerate() {
            nodes.push(spawn_peer_node(i as ReplicaId, addr).await?);
        }
        let proposer = test_proposer(membership);

        let result = proposer.propose(9, Action::Remove.code()).await;
        assert!(result.contains("prepare phase"), "unexpected: {}", result);
        let metrics = proposer.metrics();
        assert_eq!(metrics.total_proposals, 1);
        assert_eq!(metrics.failed_proposals, 1);
        Ok(())
    }
}
