//! Client-facing API module: wire types plus the listener/servant tasks
//! feeding client requests to the replica's event loop.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::server::{Key, ReplicaId};
use crate::utils::{safe_tcp_read, safe_tcp_write, PaxKvError};

/// Client ID type, assigned server-side per connection.
pub type ClientId = u64;

/// Client request ID type, local to a client connection.
pub type RequestId = u64;

/// Client-facing operation kinds.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum ClientOp {
    /// Query a key's presence (consensus READ).
    Get { key: Key },

    /// Record a key's presence (consensus INSERT).
    Put { key: Key },

    /// Clear a key's presence (consensus REMOVE).
    Delete { key: Key },
}

/// Request received from a client.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct ApiRequest {
    /// Request ID.
    pub id: RequestId,

    /// Requested operation.
    pub op: ClientOp,
}

/// Reply back to a client.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct ApiReply {
    /// Request ID corresponding to this reply.
    pub id: RequestId,

    /// Client-visible result string.
    pub result: String,
}

/// Cloneable handle for routing replies back to connected clients. Shared
/// between the client acceptor task (which registers connections) and the
/// proposal tasks (which deliver results).
#[derive(Debug, Clone)]
pub(crate) struct ReplyRouter {
    me: ReplicaId,
    tx_replies: Arc<Mutex<HashMap<ClientId, mpsc::UnboundedSender<ApiReply>>>>,
}

impl ReplyRouter {
    fn new(me: ReplicaId) -> Self {
        ReplyRouter {
            me,
            tx_replies: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Sends a reply to the given client's servant. A client that has
    /// already disconnected is not an error.
    pub(crate) fn send_reply(&self, client: ClientId, reply: ApiReply) {
        let tx_replies = self.tx_replies.lock().unwrap();
        match tx_replies.get(&client) {
            Some(tx_reply) => {
                if tx_reply.send(reply).is_err() {
                    pf_debug!(self.me; "client {} servant gone", client);
                }
            }
            None => {
                pf_debug!(self.me; "client {} already disconnected", client);
            }
        }
    }

    fn register(&self, client: ClientId) -> mpsc::UnboundedReceiver<ApiReply> {
        let (tx_reply, rx_reply) = mpsc::unbounded_channel();
        self.tx_replies.lock().unwrap().insert(client, tx_reply);
        rx_reply
    }

    fn deregister(&self, client: ClientId) {
        self.tx_replies.lock().unwrap().remove(&client);
    }
}

/// The external client-facing API module.
pub(crate) struct ExternalApi {
    /// My replica ID.
    me: ReplicaId,

    /// Receiver side of the req channel.
    rx_req: mpsc::UnboundedReceiver<(ClientId, ApiRequest)>,

    /// Reply routing handle shared with proposal tasks.
    router: ReplyRouter,

    /// Join handle of the client acceptor task.
    _client_acceptor_handle: JoinHandle<()>,
}

impl ExternalApi {
    /// Creates the external API module listening on the given address and
    /// spawns the client acceptor task.
    pub(crate) fn new_and_setup(
        me: ReplicaId,
        client_listener: TcpListener,
        rx_shutdown: watch::Receiver<bool>,
    ) -> Self {
        let (tx_req, rx_req) = mpsc::unbounded_channel();
        let router = ReplyRouter::new(me);

        let mut acceptor = ClientAcceptorTask {
            me,
            client_listener,
            next_client: 0,
            tx_req,
            router: router.clone(),
            rx_shutdown,
        };
        let client_acceptor_handle =
            tokio::spawn(async move { acceptor.run().await });

        ExternalApi {
            me,
            rx_req,
            router,
            _client_acceptor_handle: client_acceptor_handle,
        }
    }

    /// Waits for the next client request.
    pub(crate) async fn get_request(
        &mut self,
    ) -> Result<(ClientId, ApiRequest), PaxKvError> {
        match self.rx_req.recv().await {
            Some((client, req)) => Ok((client, req)),
            None => logged_err!(self.me; "req channel has been closed"),
        }
    }

    /// Clones the reply routing handle.
    pub(crate) fn router(&self) -> ReplyRouter {
        self.router.clone()
    }
}

/// ExternalApi client acceptor task.
struct ClientAcceptorTask {
    me: ReplicaId,

    client_listener: TcpListener,

    /// Monotonic client ID assignment counter.
    next_client: ClientId,

    tx_req: mpsc::UnboundedSender<(ClientId, ApiRequest)>,
    router: ReplyRouter,

    rx_shutdown: watch::Receiver<bool>,
}

impl ClientAcceptorTask {
    /// Accepts a new client connection and spawns its servant task.
    fn accept_new_client(&mut self, stream: TcpStream, addr: SocketAddr) {
        self.next_client += 1;
        let client = self.next_client;

        let rx_reply = self.router.register(client);
        let mut servant = ClientServantTask::new(
            self.me,
            client,
            addr,
            stream,
            self.tx_req.clone(),
            rx_reply,
            self.router.clone(),
            self.rx_shutdown.clone(),
        );
        tokio::spawn(async move { servant.run().await });
        pf_debug!(self.me; "accepted client {} from '{}'", client, addr);
    }

    /// Starts the client acceptor task loop.
    async fn run(&mut self) {
        pf_debug!(self.me; "client acceptor task spawned");
        let mut rx_shutdown = self.rx_shutdown.clone();
        loop {
            tokio::select! {
                accepted = self.client_listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            self.accept_new_client(stream, addr);
                        }
                        Err(e) => {
                            pf_warn!(self.me; "error accepting client connection: {}", e);
                        }
                    }
                },

                _ = rx_shutdown.changed() => break,
            }
        }
        pf_debug!(self.me; "client acceptor task exited");
    }
}

/// ExternalApi per-client servant task.
struct ClientServantTask {
    me: ReplicaId,

    /// Corresponding client's ID.
    client: ClientId,
    /// Corresponding client's address.
    addr: SocketAddr,

    conn_read: OwnedReadHalf,
    conn_write: OwnedWriteHalf,

    read_buf: BytesMut,
    write_buf: BytesMut,
    write_buf_cursor: usize,

    tx_req: mpsc::UnboundedSender<(ClientId, ApiRequest)>,
    rx_reply: mpsc::UnboundedReceiver<ApiReply>,
    router: ReplyRouter,

    rx_shutdown: watch::Receiver<bool>,
}

impl ClientServantTask {
    #[allow(clippy::too_many_arguments)]
    fn new(
        me: ReplicaId,
        client: ClientId,
        addr: SocketAddr,
        conn: TcpStream,
        tx_req: mpsc::UnboundedSender<(ClientId, ApiRequest)>,
        rx_reply: mpsc::UnboundedReceiver<ApiReply>,
        router: ReplyRouter,
        rx_shutdown: watch::Receiver<bool>,
    ) -> Self {
        let (conn_read, conn_write) = conn.into_split();
        ClientServantTask {
            me,
            client,
            addr,
            conn_read,
            conn_write,
            read_buf: BytesMut::with_capacity(8 + 1024),
            write_buf: BytesMut::with_capacity(8 + 1024),
            write_buf_cursor: 0,
            tx_req,
            rx_reply,
            router,
            rx_shutdown,
        }
    }

    /// Writes a reply to the client, waiting out full buffers.
    async fn send_reply(&mut self, reply: ApiReply) -> Result<(), PaxKvError> {
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

    /// Servant task loop: forwards requests into the req channel and writes
    /// routed replies back, until the client disconnects or shutdown is
    /// signalled.
    async fn run(&mut self) {
        pf_debug!(self.me; "client servant for {} '{}' spawned",
                           self.client, self.addr);
        loop {
            tokio::select! {
                req = safe_tcp_read(&mut self.read_buf, &mut self.conn_read) => {
                    match req {
                        Ok(req) => {
                            if let Err(e) = self.tx_req.send((self.client, req)) {
                                pf_error!(self.me; "error sending to tx_req: {}", e);
                                break;
                            }
                        }
                        Err(_) => break, // client closed the connection
                    }
                },

                reply = self.rx_reply.recv() => {
                    match reply {
                        Some(reply) => {
                            if let Err(e) = self.send_reply(reply).await {
                                pf_warn!(self.me; "error replying to client {}: {}",
                                                  self.client, e);
                                break;
                            }
                        }
                        None => break, // reply channel closed
                    }
                },

                _ = self.rx_shutdown.changed() => break,
            }
        }

        self.router.deregister(self.client);
        pf_debug!(self.me; "client servant for {} '{}' exited",
                           self.client, self.addr);
    }
}
