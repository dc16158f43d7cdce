//! A Raft consensus peer: leader election, log replication and snapshot transfer over TCP.
//!
//! This module owns exactly the consensus layer. It knows nothing about what the replicated
//! commands mean — that's the job of whatever reads the `ApplyMsg` stream it produces.

pub mod log;
pub mod persister;
pub mod peer;
pub mod rpc;
pub mod state;
pub mod transport;

pub use peer::{RaftConfig, RaftPeer};
pub use persister::{FilePersister, MemoryPersister, Persister};
pub use rpc::{ApplyMsg, LogEntry};
