//! Peer RPC surface: wire message types, the per-call client side, and the
//! listener/servant tasks hosting the server side.
//!
//! NOTE: peer connections are resolved per call from the membership list: a
//! call opens a fresh connection, sends one request, and awaits one reply,
//! all under a single bounded timeout. Any transport-level failure is the
//! caller's cue to count a negative vote; it is never propagated further.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};

use crate::server::{Acceptor, Key, Learner, ProposalNum, ReplicaId};
use crate::utils::{
    safe_tcp_read, safe_tcp_write, tcp_connect_with_retry, PaxKvError,
};

/// Peer-to-peer request type.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum PeerRequest {
    /// First-phase promise elicitation.
    Prepare {
        id: ProposalNum,
        key: Key,
        action: u8,
    },

    /// Second-phase acceptance request.
    Accept {
        id: ProposalNum,
        key: Key,
        action: u8,
    },

    /// Third-phase application broadcast.
    Commit { key: Key, action: u8 },
}

/// Peer-to-peer reply type.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum PeerReply {
    /// Vote on a prepare or accept request.
    Vote { granted: bool },

    /// Result string of a commit application.
    Committed { result: String },
}

/// Makes one peer RPC: fresh connection, one request, one reply, all within
/// `timeout`.
pub(crate) async fn call_peer(
    addr: SocketAddr,
    req: &PeerRequest,
    timeout: Duration,
) -> Result<PeerReply, PaxKvError> {
    match time::timeout(timeout, call_peer_inner(addr, req)).await {
        Ok(reply) => reply,
        Err(_) => Err(PaxKvError(format!(
            "rpc to '{}' timed out after {} ms",
            addr,
            timeout.as_millis()
        ))),
    }
}

async fn call_peer_inner(
    addr: SocketAddr,
    req: &PeerRequest,
) -> Result<PeerReply, PaxKvError> {
    let conn = tcp_connect_with_retry(addr, 0).await?;
    let (mut read_half, write_half) = conn.into_split();

    let mut write_buf = BytesMut::with_capacity(8 + 1024);
    let mut write_buf_cursor = 0;
    while !{
        let req_to_send = if write_buf.is_empty() { Some(req) } else { None };
        safe_tcp_write(&mut write_buf, &mut write_buf_cursor, &write_half, req_to_send)?
    } {
        write_half.writable().await?;
    }

    let mut read_buf = BytesMut::with_capacity(8 + 1024);
    safe_tcp_read(&mut read_buf, &mut read_half).await
}

/// Spawns the peer listener task: accepts peer connections and hands each
/// one to a servant task until shutdown is signalled.
pub(crate) fn spawn_peer_listener(
    me: ReplicaId,
    listener: TcpListener,
    running: Arc<AtomicBool>,
    acceptor: Arc<Acceptor>,
    learner: Arc<Learner>,
    rx_shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        pf_debug!(me; "peer listener task spawned");
        let mut rx_listener = rx_shutdown.clone();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((conn, addr)) => {
                            let mut servant = PeerServantTask::new(
                                me,
                                addr,
                                conn,
                                running.clone(),
                                acceptor.clone(),
                                learner.clone(),
                                rx_shutdown.clone(),
                            );
                            tokio::spawn(async move { servant.run().await });
                        }
                        Err(e) => {
                            pf_warn!(me; "error accepting peer connection: {}", e);
                        }
                    }
                },

                _ = rx_listener.changed() => break,
            }
        }
        pf_debug!(me; "peer listener task exited");
    })
}

/// Per-connection peer servant task.
struct PeerServantTask {
    me: ReplicaId,

    /// Calling peer's address.
    addr: SocketAddr,

    conn_read: OwnedReadHalf,
    conn_write: OwnedWriteHalf,

    read_buf: BytesMut,
    write_buf: BytesMut,
    write_buf_cursor: usize,

    /// Replica-level liveness gate; rejections happen here so the acceptor
    /// and learner are never consulted on a stopped node.
    running: Arc<AtomicBool>,

    acceptor: Arc<Acceptor>,
    learner: Arc<Learner>,

    rx_shutdown: watch::Receiver<bool>,
}

impl PeerServantTask {
    fn new(
        me: ReplicaId,
        addr: SocketAddr,
        conn: TcpStream,
        running: Arc<AtomicBool>,
        acceptor: Arc<Acceptor>,
        learner: Arc<Learner>,
        rx_shutdown: watch::Receiver<bool>,
    ) -> Self {
        let (conn_read, conn_write) = conn.into_split();
        PeerServantTask {
            me,
            addr,
            conn_read,
            conn_write,
            read_buf: BytesMut::with_capacity(8 + 1024),
            write_buf: BytesMut::with_capacity(8 + 1024),
            write_buf_cursor: 0,
            running,
            acceptor,
            learner,
            rx_shutdown,
        }
    }

    /// Dispatches one peer request to the hosted components.
    async fn handle_request(&self, req: PeerRequest) -> PeerReply {
        if !self.running.load(Ordering::SeqCst) {
            pf_warn!(self.me; "received peer request while not running");
            return match req {
                PeerRequest::Prepare { .. } | PeerRequest::Accept { .. } => {
                    PeerReply::Vote { granted: false }
                }
                PeerRequest::Commit { .. } => PeerReply::Committed {
                    result: "server not running".into(),
                },
            };
        }

        match req {
            PeerRequest::Prepare { id, key, action } => PeerReply::Vote {
                granted: self.acceptor.prepare(id, key, action).await,
            },
            PeerRequest::Accept { id, key, action } => PeerReply::Vote {
                granted: self.acceptor.accept(id, key, action).await,
            },
            PeerRequest::Commit { key, action } => PeerReply::Committed {
                result: self.learner.commit(key, action),
            },
        }
    }

    /// Writes a reply back to the calling peer, waiting out full buffers.
    async fn send_reply(&mut self, reply: PeerReply) -> Result<(), PaxKvError> {
        while !{
            let reply_to_send = if self.write_buf.is_empty() {
                Some(&reply)
            } else {
                None
            };
            safe_tcp_write(
                &mut self.write_buf,
                &mut self.write_buf_cursor,
                &self.conn_write,
                reply_to_send,
            )?
        } {
            self.conn_write.writable().await?;
        }
        Ok(())
    }

    /// Servant task loop: serves requests on this connection until the peer
    /// disconnects or shutdown is signalled.
    async fn run(&mut self) {
        pf_debug!(self.me; "peer servant for '{}' spawned", self.addr);
        loop {
            tokio::select! {
                req = safe_tcp_read(&mut self.read_buf, &mut self.conn_read) => {
                    match req {
                        Ok(req) => {
                            let reply = self.handle_request(req).await;
                            if let Err(e) = self.send_reply(reply).await {
                                pf_warn!(self.me; "error replying to '{}': {}",
                                                  self.addr, e);
                                break;
                            }
                        }
                        Err(_) => break, // peer closed the connection
                    }
                },

                _ = self.rx_shutdown.changed() => break,
            }
        }
        pf_debug!(self.me; "peer servant for '{}' exited", self.addr);
    }
}
