//! Public interface to the PaxKV core library, linked by both the server
//! executable and the client executable.

#![allow(clippy::uninlined_format_args)]

#[macro_use]
mod utils;

mod client;
mod server;

pub use client::ClientStub;
pub use server::{
    Action, ApiReply, ApiRequest, ClientId, ClientOp, Key, PeerReply,
    PeerRequest, ProposalNum, ProposerMetrics, Replica, ReplicaConfig,
    ReplicaId, ReplicaStatus, RequestId,
};
pub use utils::PaxKvError;
