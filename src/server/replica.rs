//! Replica: hosts the store, acceptor, learner, and proposer; exposes the
//! peer RPC surface and the client-facing operations.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::Deserialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, Instant, MissedTickBehavior};

use crate::server::{
    spawn_peer_listener, Acceptor, Action, ApiReply, ClientOp, ExternalApi,
    Key, Learner, Proposer, ProposerMetrics, ReplicaId, Store,
};
use crate::utils::{tcp_bind_with_retry, PaxKvError};

/// Configuration parameters struct.
#[derive(Debug, Clone, Deserialize)]
pub struct ReplicaConfig {
    /// Per-peer-RPC timeout in millisecs.
    pub rpc_timeout_ms: u64,

    /// Size of the bounded proposal work pool.
    pub max_concurrent_proposals: usize,

    /// Age in millisecs past which in-flight proposal records are
    /// garbage-collected.
    pub proposal_expiry_ms: u64,

    /// Interval of the proposer's expiry sweep in millisecs.
    pub proposer_sweep_interval_ms: u64,

    /// Eviction age for the acceptor's prepared entries in millisecs.
    pub prepared_ttl_ms: u64,

    /// Eviction age for the acceptor's accepted entries in millisecs.
    pub accepted_ttl_ms: u64,

    /// Interval of the acceptor's eviction sweep in millisecs.
    pub acceptor_sweep_interval_ms: u64,

    /// Retention window for the learner's commit records in millisecs.
    pub commit_retention_ms: u64,

    /// Interval of the learner's retention sweep in millisecs.
    pub learner_sweep_interval_ms: u64,

    /// Probability in [0, 1] of the acceptor injecting an artificial stall
    /// per call. 0.0 disables injection; testing affordance only.
    pub fail_rate: f64,

    /// Upper bound of injected stalls in millisecs.
    pub fail_max_delay_ms: u64,
}

#[allow(clippy::derivable_impls)]
impl Default for ReplicaConfig {
    fn default() -> Self {
        ReplicaConfig {
            rpc_timeout_ms: 2500,
            max_concurrent_proposals: 1000,
            proposal_expiry_ms: 30_000,
            proposer_sweep_interval_ms: 1000,
            prepared_ttl_ms: 60_000,
            accepted_ttl_ms: 120_000,
            acceptor_sweep_interval_ms: 2000,
            commit_retention_ms: 300_000,
            learner_sweep_interval_ms: 5000,
            fail_rate: 0.0,
            fail_max_delay_ms: 5000,
        }
    }
}

/// Replica lifecycle status. Transitions are idempotent and there is no
/// transition back from `Stopped`.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ReplicaStatus {
    Initialized,
    Running,
    Stopped,
}

/// A server node hosting one proposer, one acceptor, one learner, and one
/// store, participating in a fixed cluster.
pub struct Replica {
    /// My replica ID, the index into the membership list.
    id: ReplicaId,

    /// Address for client-facing API connections.
    api_addr: SocketAddr,

    /// Address for internal peer-to-peer RPCs.
    p2p_addr: SocketAddr,

    /// Configuration parameters struct.
    config: ReplicaConfig,

    /// Lifecycle status.
    status: Mutex<ReplicaStatus>,

    /// Liveness gate shared with the servant tasks.
    running: Arc<AtomicBool>,

    store: Arc<Store>,
    acceptor: Arc<Acceptor>,
    learner: Arc<Learner>,
    proposer: Arc<Proposer>,

    /// Shutdown signal sender watched by all background tasks.
    tx_shutdown: watch::Sender<bool>,

    /// Join handles of the long-lived background tasks.
    handles: Vec<JoinHandle<()>>,
}

impl Replica {
    /// Creates a new replica node for the given cluster membership. The
    /// membership is an ordered list of peer p2p addresses, self included;
    /// `id` indexes into it. Quorum size is derived as `⌊N/2⌋ + 1`.
    pub fn new_and_setup(
        id: ReplicaId,
        api_addr: SocketAddr,
        membership: Vec<SocketAddr>,
        config_str: Option<&str>,
    ) -> Result<Self, PaxKvError> {
        if (id as usize) >= membership.len() {
            return logged_err!(id; "invalid replica ID {} / {}",
                                   id, membership.len());
        }
        let p2p_addr = membership[id as usize];

        let config = parsed_config!(config_str => ReplicaConfig;
                                    rpc_timeout_ms, max_concurrent_proposals,
                                    proposal_expiry_ms,
                                    proposer_sweep_interval_ms,
                                    prepared_ttl_ms, accepted_ttl_ms,
                                    acceptor_sweep_interval_ms,
                                    commit_retention_ms,
                                    learner_sweep_interval_ms,
                                    fail_rate, fail_max_delay_ms)?;
        if config.rpc_timeout_ms == 0 {
            return logged_err!(id; "invalid config.rpc_timeout_ms '{}'",
                                   config.rpc_timeout_ms);
        }
        if config.max_concurrent_proposals == 0 {
            return logged_err!(id; "invalid config.max_concurrent_proposals '{}'",
                                   config.max_concurrent_proposals);
        }
        if !(0.0..=1.0).contains(&config.fail_rate) {
            return logged_err!(id; "invalid config.fail_rate '{}'",
                                   config.fail_rate);
        }

        let store = Arc::new(Store::new());
        let acceptor = Arc::new(Acceptor::new(
            id,
            store.clone(),
            config.fail_rate,
            Duration::from_millis(config.fail_max_delay_ms),
            Duration::from_millis(config.prepared_ttl_ms),
            Duration::from_millis(config.accepted_ttl_ms),
        ));
        let learner = Arc::new(Learner::new(
            id,
            store.clone(),
            Duration::from_millis(config.commit_retention_ms),
        ));
        let proposer = Arc::new(Proposer::new(
            id,
            membership,
            Duration::from_millis(config.rpc_timeout_ms),
            Duration::from_millis(config.proposal_expiry_ms),
            config.max_concurrent_proposals,
        ));

        let (tx_shutdown, _) = watch::channel(false);

        pf_info!(id; "replica initialized, p2p '{}' api '{}'",
                     p2p_addr, api_addr);
        Ok(Replica {
            id,
            api_addr,
            p2p_addr,
            config,
            status: Mutex::new(ReplicaStatus::Initialized),
            running: Arc::new(AtomicBool::new(false)),
            store,
            acceptor,
            learner,
            proposer,
            tx_shutdown,
            handles: vec![],
        })
    }

    /// Starts the replica: binds the peer RPC and client API listeners and
    /// spawns all background tasks. Idempotent while running; a stopped
    /// replica cannot be restarted.
    pub async fn start(&mut self) -> Result<(), PaxKvError> {
        match *self.status.lock().unwrap() {
            ReplicaStatus::Running => {
                pf_warn!(self.id; "start called while already running");
                return Ok(());
            }
            ReplicaStatus::Stopped => {
                return logged_err!(self.id; "cannot restart a stopped replica");
            }
            ReplicaStatus::Initialized => {}
        }

        let peer_listener = tcp_bind_with_retry(self.p2p_addr, 10).await?;
        let client_listener = tcp_bind_with_retry(self.api_addr, 10).await?;

        let rx_shutdown = self.tx_shutdown.subscribe();
        self.handles.push(spawn_peer_listener(
            self.id,
            peer_listener,
            self.running.clone(),
            self.acceptor.clone(),
            self.learner.clone(),
            rx_shutdown.clone(),
        ));

        let external_api = ExternalApi::new_and_setup(
            self.id,
            client_listener,
            rx_shutdown.clone(),
        );
        self.handles.push(tokio::spawn(Self::client_dispatcher(
            self.id,
            external_api,
            self.proposer.clone(),
            self.running.clone(),
            rx_shutdown.clone(),
        )));

        // background maintenance tickers
        let acceptor = self.acceptor.clone();
        self.handles.push(Self::spawn_sweeper(
            Duration::from_millis(self.config.acceptor_sweep_interval_ms),
            rx_shutdown.clone(),
            move || acceptor.sweep_expired(),
        ));
        let proposer = self.proposer.clone();
        self.handles.push(Self::spawn_sweeper(
            Duration::from_millis(self.config.proposer_sweep_interval_ms),
            rx_shutdown.clone(),
            move || proposer.sweep_expired(),
        ));
        let learner = self.learner.clone();
        self.handles.push(Self::spawn_sweeper(
            Duration::from_millis(self.config.learner_sweep_interval_ms),
            rx_shutdown,
            move || {
                learner.sweep_old_records();
                learner.log_statistics();
            },
        ));

        self.running.store(true, Ordering::SeqCst);
        self.acceptor.set_running(true);
        self.proposer.set_running(true);
        *self.status.lock().unwrap() = ReplicaStatus::Running;

        pf_info!(self.id; "replica started");
        Ok(())
    }

    /// Stops the replica: flips all liveness gates, signals shutdown, and
    /// waits for background tasks to exit, bounding teardown at 10 secs.
    /// Idempotent; a stopped replica stays stopped.
    pub async fn stop(&mut self) -> Result<(), PaxKvError> {
        {
            let mut status = self.status.lock().unwrap();
            if *status == ReplicaStatus::Stopped {
                return Ok(());
            }
            *status = ReplicaStatus::Stopped;
        }

        self.running.store(false, Ordering::SeqCst);
        self.acceptor.set_running(false);
        self.proposer.set_running(false);
        let _ = self.tx_shutdown.send(true);

        let deadline = Instant::now() + Duration::from_secs(10);
        for handle in self.handles.drain(..) {
            let abort = handle.abort_handle();
            let remaining = deadline.saturating_duration_since(Instant::now());
            if time::timeout(remaining, handle).await.is_err() {
                pf_warn!(self.id; "background task did not exit in time, aborting");
                abort.abort();
            }
        }

        pf_info!(self.id; "replica stopped");
        Ok(())
    }

    /// Current lifecycle status.
    pub fn status(&self) -> ReplicaStatus {
        *self.status.lock().unwrap()
    }

    /// My replica ID.
    pub fn id(&self) -> ReplicaId {
        self.id
    }

    /// Snapshot of the proposer's performance counters.
    pub fn metrics(&self) -> ProposerMetrics {
        self.proposer.metrics()
    }

    /// Learner commit counters: (total, successful, failed).
    pub fn commit_counts(&self) -> (u64, u64, u64) {
        (
            self.learner.total_commits(),
            self.learner.successful_commits(),
            self.learner.failed_commits(),
        )
    }

    /// Client-facing READ operation.
    pub async fn get(&self, key: Key) -> String {
        self.client_op(key, Action::Read).await
    }

    /// Client-facing INSERT operation.
    pub async fn put(&self, key: Key) -> String {
        self.client_op(key, Action::Insert).await
    }

    /// Client-facing REMOVE operation.
    pub async fn delete(&self, key: Key) -> String {
        self.client_op(key, Action::Remove).await
    }

    /// Fans a slice of (key, action) pairs through concurrent proposals and
    /// collects the per-op results in order.
    pub async fn propose_batch(&self, ops: &[(Key, Action)]) -> Vec<String> {
        if !self.running.load(Ordering::SeqCst) {
            pf_warn!(self.id; "batch op received while not running");
            return ops.iter().map(|_| "server not running".into()).collect();
        }
        let ops: Vec<(Key, u8)> =
            ops.iter().map(|&(key, action)| (key, action.code())).collect();
        self.proposer.propose_batch(&ops).await
    }

    async fn client_op(&self, key: Key, action: Action) -> String {
        if !self.running.load(Ordering::SeqCst) {
            pf_warn!(self.id; "client op received while not running");
            return "server not running".into();
        }
        self.proposer.propose(key, action.code()).await
    }

    /// Client request dispatcher: pairs each incoming API request with a
    /// spawned proposal task so that slow proposals never block the intake
    /// of new requests.
    async fn client_dispatcher(
        me: ReplicaId,
        mut external_api: ExternalApi,
        proposer: Arc<Proposer>,
        running: Arc<AtomicBool>,
        mut rx_shutdown: watch::Receiver<bool>,
    ) {
        pf_debug!(me; "client dispatcher task spawned");
        let router = external_api.router();
        loop {
            tokio::select! {
                req = external_api.get_request() => {
                    match req {
                        Ok((client, req)) => {
                            let router = router.clone();
                            let proposer = proposer.clone();
                            let running = running.clone();
                            tokio::spawn(async move {
                                let result = Self::serve_client_op(
                                    me,
                                    &req.op,
                                    proposer,
                                    running,
                                )
                                .await;
                                router.send_reply(
                                    client,
                                    ApiReply { id: req.id, result },
                                );
                            });
                        }
                        Err(e) => {
                            pf_error!(me; "error getting client request: {}", e);
                            break;
                        }
                    }
                },

                _ = rx_shutdown.changed() => break,
            }
        }
        pf_debug!(me; "client dispatcher task exited");
    }

    /// Serves one client operation through the local proposer.
    async fn serve_client_op(
        me: ReplicaId,
        op: &ClientOp,
        proposer: Arc<Proposer>,
        running: Arc<AtomicBool>,
    ) -> String {
        if !running.load(Ordering::SeqCst) {
            pf_warn!(me; "client op received while not running");
            return "server not running".into();
        }
        let (key, action) = match *op {
            ClientOp::Get { key } => (key, Action::Read),
            ClientOp::Put { key } => (key, Action::Insert),
            ClientOp::Delete { key } => (key, Action::Remove),
        };
        proposer.propose(key, action.code()).await
    }

    /// Spawns a background maintenance task running `sweep` on a fixed
    /// period until shutdown is signalled.
    fn spawn_sweeper(
        period: Duration,
        mut rx_shutdown: watch::Receiver<bool>,
        sweep: impl Fn() + Send + 'static,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => sweep(),
                    _ = rx_shutdown.changed() => break,
                }
            }
        })
    }
}

#[cfg(test)]
mod replica_tests {
    use super::*;
    use crate::server::{call_peer, PeerReply, PeerRequest};

    /// Builds and starts `live` replicas of a cluster whose membership
    /// lists `n` nodes; the remaining `n - live` members stay unreachable.
    async fn launch_cluster(
        base_port: u16,
        n: u8,
        live: u8,
    ) -> Result<Vec<Replica>, PaxKvError> {
        let membership: Vec<SocketAddr> = (0..n)
            .map(|i| {
                format!("127.0.0.1:{}", base_port + i as u16)
                    .parse()
                    .unwrap()
            })
            .collect();
        let mut replicas = vec![];
        for id in 0..live {
            let api_addr: SocketAddr =
                format!("127.0.0.1:{}", base_port + 50 + id as u16).parse()?;
            let mut replica = Replica::new_and_setup(
                id,
                api_addr,
                membership.clone(),
                Some("rpc_timeout_ms = 500"),
            )?;
            replica.start().await?;
            replicas.push(replica);
        }
        Ok(replicas)
    }

    async fn stop_cluster(mut replicas: Vec<Replica>) {
        for replica in replicas.iter_mut() {
            let _ = replica.stop().await;
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn healthy_cluster_put_then_get() -> Result<(), PaxKvError> {
        let replicas = launch_cluster(32000, 5, 5).await?;

        let result = replicas[0].put(7).await;
        assert!(result.contains("inserted"));

        // a subsequent READ on any replica sees the key. Peers are queried
        // before the origin: proposal numbers are per-node counters, so a
        // peer's first proposal must not trail the origin's second.
        for replica in replicas.iter().skip(1).chain(replicas.iter().take(1)) {
            let result = replica.get(7).await;
            assert!(result.contains("found"), "unexpected: {}", result);
            assert!(replica.store.contains(7));
        }

        stop_cluster(replicas).await;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn two_unreachable_still_live() -> Result<(), PaxKvError> {
        // 3 of 5 reachable: exactly quorum
        let replicas = launch_cluster(32100, 5, 3).await?;

        let result = replicas[0].put(7).await;
        assert!(result.contains("inserted"));

        // the reachable replicas end in identical state
        for replica in &replicas {
            assert!(replica.store.contains(7));
        }

        stop_cluster(replicas).await;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn three_unreachable_loses_quorum() -> Result<(), PaxKvError> {
        // 2 of 5 reachable: one below quorum
        let replicas = launch_cluster(32200, 5, 2).await?;

        let result = replicas[0].put(7).await;
        assert!(result.contains("prepare phase"), "unexpected: {}", result);

        // state unchanged on all reachable replicas
        for replica in &replicas {
            assert!(!replica.store.contains(7));
        }

        stop_cluster(replicas).await;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_puts_same_key() -> Result<(), PaxKvError> {
        let replicas = launch_cluster(32300, 3, 3).await?;

        let (r0, r1) =
            tokio::join!(replicas[0].put(7), replicas[1].put(7));
        let results = [r0, r1];

        // exactly one proposal wins the insert; the loser either observes
        // the applied insert or loses its consensus round against it
        let wins = results
            .iter()
            .filter(|r| r.contains("inserted"))
            .count();
        assert_eq!(wins, 1, "results: {:?}", results);
        let loser = results.iter().find(|r| !r.contains("inserted")).unwrap();
        assert!(
            loser.contains("already present") || loser.contains("phase"),
            "unexpected loser result: {}",
            loser
        );

        // key 7 present exactly once on every replica
        for replica in &replicas {
            assert!(replica.store.contains(7));
        }

        stop_cluster(replicas).await;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn delete_never_inserted_key() -> Result<(), PaxKvError> {
        let replicas = launch_cluster(32400, 3, 3).await?;

        // every acceptor's prepare-time feasibility check vetoes a REMOVE
        // of a key that was never inserted, so the round dies in prepare
        // and no state changes anywhere
        let result = replicas[0].delete(99).await;
        assert!(result.contains("prepare phase"), "unexpected: {}", result);
        for replica in &replicas {
            assert!(!replica.store.contains(99));
        }

        stop_cluster(replicas).await;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn invalid_action_code_at_commit_rpc() -> Result<(), PaxKvError> {
        let replicas = launch_cluster(32500, 3, 3).await?;

        // poke the commit RPC directly with an out-of-range action code
        let reply = call_peer(
            replicas[0].p2p_addr,
            &PeerRequest::Commit { key: 7, action: 4 },
            Duration::from_secs(2),
        )
        .await?;
        assert_eq!(
            reply,
            PeerReply::Committed {
                result: "invalid action code 4".into()
            }
        );
        let (total, _, failed) = replicas[0].commit_counts();
        assert_eq!(total, 1);
        assert_eq!(failed, 1);
        assert!(!replicas[0].store.contains(7));

        stop_cluster(replicas).await;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn read_idempotent_between_mutations() -> Result<(), PaxKvError> {
        let replicas = launch_cluster(32600, 3, 3).await?;

        assert!(replicas[0].put(5).await.contains("inserted"));
        let first = replicas[1].get(5).await;
        for _ in 0..3 {
            assert_eq!(replicas[1].get(5).await, first);
        }
        // replica 1's counter now leads the cluster, so it drives the rest
        assert!(replicas[1].delete(5).await.contains("removed"));
        assert!(replicas[1].get(5).await.contains("not found"));

        stop_cluster(replicas).await;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn lifecycle_transitions() -> Result<(), PaxKvError> {
        let membership: Vec<SocketAddr> = vec!["127.0.0.1:32700".parse()?];
        let mut replica = Replica::new_and_setup(
            0,
            "127.0.0.1:32750".parse()?,
            membership,
            None,
        )?;
        assert_eq!(replica.status(), ReplicaStatus::Initialized);

        // client ops before start are rejected
        assert_eq!(replica.get(7).await, "server not running");

        replica.start().await?;
        assert_eq!(replica.status(), ReplicaStatus::Running);
        // start is idempotent while running
        replica.start().await?;
        assert!(replica.put(7).await.contains("inserted"));

        replica.stop().await?;
        assert_eq!(replica.status(), ReplicaStatus::Stopped);
        // stop is idempotent
        replica.stop().await?;
        assert_eq!(replica.get(7).await, "server not running");
        // no transition back from stopped
        assert!(replica.start().await.is_err());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn metrics_accumulate() -> Result<(), PaxKvError> {
        let replicas = launch_cluster(32800, 3, 3).await?;

        assert!(replicas[0].put(1).await.contains("inserted"));
        assert!(replicas[0].put(2).await.contains("inserted"));
        assert!(replicas[0].get(1).await.contains("found"));

        let metrics = replicas[0].metrics();
        assert_eq!(metrics.total_proposals, 3);
        assert_eq!(metrics.successful_proposals, 3);
        assert_eq!(metrics.failed_proposals, 0);
        assert_eq!(metrics.in_flight, 0);

        let (total, successful, _) = replicas[0].commit_counts();
        assert_eq!(total, 3);
        assert_eq!(successful, 3);

        stop_cluster(replicas).await;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn client_stub_over_api_port() -> Result<(), PaxKvError> {
        let replicas = launch_cluster(33000, 3, 3).await?;

        let mut stub =
            crate::client::ClientStub::new_by_connect(replicas[0].api_addr)
                .await?;
        assert!(stub.put(7).await?.contains("inserted"));
        assert!(stub.get(7).await?.contains("found"));
        assert!(stub.delete(7).await?.contains("removed"));
        assert!(stub.get(7).await?.contains("not found"));

        stop_cluster(replicas).await;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn many_concurrent_proposals() -> Result<(), PaxKvError> {
        let replicas = launch_cluster(32900, 3, 3).await?;

        let ops: Vec<(Key, Action)> =
            (0..50).map(|key| (key, Action::Insert)).collect();
        let results = replicas[0].propose_batch(&ops).await;
        assert_eq!(results.len(), 50);
        for (key, result) in results.iter().enumerate() {
            assert!(
                result.contains("inserted"),
                "key {}: {}",
                key,
                result
            );
        }
        for replica in &replicas {
            for key in 0..50 {
                assert!(replica.store.contains(key));
            }
        }

        stop_cluster(replicas).await;
        Ok(())
    }
}
