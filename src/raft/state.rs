use super::log::RaftLog;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

/// The subset of `PeerState` that must survive a crash, bincode-encoded as the
/// `Persister`'s `raft_state` blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistentState {
    pub current_term: u64,
    pub voted_for: Option<usize>,
    pub log: RaftLog,
}

pub struct PeerState {
    // Persistent.
    pub current_term: u64,
    pub voted_for: Option<usize>,
    pub log: RaftLog,
    pub snapshot: Vec<u8>,

    // Volatile, all peers.
    pub role: Role,
    pub commit_index: u64,
    pub last_applied: u64,
    pub last_heartbeat_at: Instant,

    // Volatile, leader only.
    pub next_index: HashMap<usize, u64>,
    pub match_index: HashMap<usize, u64>,
}

impl PeerState {
    pub fn new() -> Self {
        Self {
            current_term: 0,
            voted_for: None,
            log: RaftLog::new(),
            snapshot: Vec::new(),
            role: Role::Follower,
            commit_index: 0,
            last_applied: 0,
            last_heartbeat_at: Instant::now(),
            next_index: HashMap::new(),
            match_index: HashMap::new(),
        }
    }

    pub fn persistent_snapshot(&self) -> PersistentState {
        PersistentState {
            current_term: self.current_term,
            voted_for: self.voted_for,
            log: self.log.clone(),
        }
    }

    pub fn restore_persistent(&mut self, state: PersistentState) {
        self.current_term = state.current_term;
        self.voted_for = state.voted_for;
        self.log = state.log;
    }

    pub fn become_follower(&mut self, term: u64) {
        self.current_term = term;
        self.role = Role::Follower;
        self.voted_for = None;
    }
}

impl Default for PeerState {
    fn default() -> Self {
        Self::new()
    }
}
