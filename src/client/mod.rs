//! PaxKV's client functionality modules.

mod apistub;

pub use apistub::ClientStub;
