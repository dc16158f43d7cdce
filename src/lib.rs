//! A Raft-replicated, optimistic-concurrency key/value store.
//!
//! Three layers, each usable on its own: [`raft`] is the consensus engine and knows nothing
//! about keys or values; [`rsm`] turns its committed-entry stream into request/response pairs
//! for an arbitrary [`rsm::StateMachine`]; [`kv`] is that state machine, plus the client-facing
//! wire protocol and [`kv::client::Clerk`].

pub mod kv;
pub mod net;
pub mod raft;
pub mod rsm;

pub use kv::client::{Clerk, ClerkError};
pub use kv::KvStateMachine;
pub use raft::{RaftConfig, RaftPeer};
pub use rsm::{Rsm, RsmError, StateMachine};
