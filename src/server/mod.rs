//! PaxKV's server functionality modules.

mod acceptor;
mod external;
mod learner;
mod proposer;
mod replica;
mod store;
mod transport;

pub use external::{ApiReply, ApiRequest, ClientId, ClientOp, RequestId};
pub use proposer::ProposerMetrics;
pub use replica::{Replica, ReplicaConfig, ReplicaStatus};
pub use store::{Action, Key};
pub use transport::{PeerReply, PeerRequest};

pub(crate) use acceptor::Acceptor;
pub(crate) use external::ExternalApi;
pub(crate) use learner::Learner;
pub(crate) use proposer::Proposer;
pub(crate) use store::Store;
pub(crate) use transport::{call_peer, spawn_peer_listener};

/// Server replica ID type.
pub type ReplicaId = u8;

/// Proposal number type. Numbers are drawn from a process-wide monotonic
/// counter on the originating node; 0 is never issued.
pub type ProposalNum = u64;
