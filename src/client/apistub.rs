//! Client API communication stub implementation.

use std::net::SocketAddr;

use bytes::BytesMut;

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

use crate::server::{ApiReply, ApiRequest, ClientOp, Key, RequestId};
use crate::utils::{
    safe_tcp_read, safe_tcp_write, tcp_connect_with_retry, PaxKvError,
};

/// Client API connection stub. Issues one request at a time over a
/// long-lived connection to a replica's API port.
pub struct ClientStub {
    /// Server address connected to.
    addr: SocketAddr,

    conn_read: OwnedReadHalf,
    conn_write: OwnedWriteHalf,

    /// Reply read buffer for cancellation safety.
    reply_buf: BytesMut,

    /// Request write buffer for deadlock avoidance.
    req_buf: BytesMut,

    /// Request write buffer cursor at first unwritten byte.
    req_buf_cursor: usize,

    /// Next request ID, monotonic within this connection.
    next_req: RequestId,
}

impl ClientStub {
    /// Connects to the given replica API address.
    pub async fn new_by_connect(
        addr: SocketAddr,
    ) -> Result<Self, PaxKvError> {
        pf_debug!("c"; "connecting to server '{}'...", addr);
        let stream = tcp_connect_with_retry(addr, 3).await?;
        let (conn_read, conn_write) = stream.into_split();

        Ok(ClientStub {
            addr,
            conn_read,
            conn_write,
            reply_buf: BytesMut::with_capacity(8 + 1024),
            req_buf: BytesMut::with_capacity(8 + 1024),
            req_buf_cursor: 0,
            next_req: 0,
        })
    }

    /// Issues an operation and waits for its reply, skipping any stale
    /// replies left over from earlier abandoned requests.
    pub async fn issue(&mut self, op: ClientOp) -> Result<String, PaxKvError> {
        self.next_req += 1;
        let req = ApiRequest {
            id: self.next_req,
            op,
        };

        while !{
            let req_to_send = if self.req_buf.is_empty() {
                Some(&req)
            } else {
                None
            };
            safe_tcp_write(
                &mut self.req_buf,
                &mut self.req_buf_cursor,
                &self.conn_write,
                req_to_send,
            )?
        } {
            self.conn_write.writable().await?;
        }

        loop {
            let reply: ApiReply =
                safe_tcp_read(&mut self.reply_buf, &mut self.conn_read)
                    .await?;
            if reply.id == req.id {
                return Ok(reply.result);
            }
            pf_warn!("c"; "ignoring stale reply {} from '{}'",
                          reply.id, self.addr);
        }
    }

    /// Issues a READ for the given key.
    pub async fn get(&mut self, key: Key) -> Result<String, PaxKvError> {
        self.issue(ClientOp::Get { key }).await
    }

    /// Issues an INSERT for the given key.
    pub async fn put(&mut self, key: Key) -> Result<String, PaxKvError> {
        self.issue(ClientOp::Put { key }).await
    }

    /// Issues a REMOVE for the given key.
    pub async fn delete(&mut self, key: Key) -> Result<String, PaxKvError> {
        self.issue(ClientOp::Delete { key }).await
    }
}
