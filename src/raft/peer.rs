//! `RaftPeer`: one node's share of the replicated log. Owns the persistent/volatile state
//! behind a single async mutex, runs the election, replication and apply tickers as
//! background tasks, and answers the three RPCs. Grounded on the teacher's `RaftNode` in
//! `raft.rs` (the ticker-task shape, the lock-around-state-mutate-then-persist pattern) and
//! on `raft_log.go`/`kvraft1` for the actual consensus rules the teacher's code lacked.

use super::log::RaftLog;
use super::persister::Persister;
use super::rpc::{
    AppendEntriesArgs, AppendEntriesReply, ApplyMsg, InstallSnapshotArgs, InstallSnapshotReply,
    RaftRpc, RequestVoteArgs, RequestVoteReply,
};
use super::state::{PeerState, PersistentState, Role};
use super::transport;
use log::{debug, info};
use rand::Rng;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};

#[derive(Debug, Clone)]
pub struct RaftConfig {
    pub me: usize,
    pub peer_addrs: Vec<SocketAddr>,
    pub election_timeout: (Duration, Duration),
    pub heartbeat_interval: Duration,
    pub rpc_timeout: Duration,
}

impl RaftConfig {
    pub fn new(me: usize, peer_addrs: Vec<SocketAddr>) -> Self {
        Self {
            me,
            peer_addrs,
            election_timeout: (Duration::from_millis(500), Duration::from_millis(900)),
            heartbeat_interval: Duration::from_millis(100),
            rpc_timeout: Duration::from_millis(300),
        }
    }
}

enum ReplicateAction {
    AppendEntries(AppendEntriesArgs),
    InstallSnapshot(InstallSnapshotArgs),
}

pub struct RaftPeer {
    me: usize,
    peers: Vec<SocketAddr>,
    config: RaftConfig,
    state: Mutex<PeerState>,
    persister: Arc<dyn Persister>,
    apply_tx: Mutex<Option<mpsc::Sender<ApplyMsg>>>,
    killed: AtomicBool,
}

impl RaftPeer {
    pub fn new(
        config: RaftConfig,
        persister: Arc<dyn Persister>,
        apply_tx: mpsc::Sender<ApplyMsg>,
    ) -> Arc<Self> {
        let mut state = PeerState::new();

        let raw = persister.read_state();
        if !raw.is_empty() {
            let persisted: PersistentState =
                bincode::deserialize(&raw).expect("corrupt persisted raft state");
            state.restore_persistent(persisted);
        }
        let snap = persister.read_snapshot();
        if !snap.is_empty() {
            state.snapshot = snap;
        }
        state.commit_index = state.log.first_index();
        state.last_applied = state.log.first_index();
        state.last_heartbeat_at = Instant::now();

        let me = config.me;
        let peers = config.peer_addrs.clone();

        Arc::new(Self {
            me,
            peers,
            config,
            state: Mutex::new(state),
            persister,
            apply_tx: Mutex::new(Some(apply_tx)),
            killed: AtomicBool::new(false),
        })
    }

    /// Spawn the election, replication and apply background tasks. Call once, right after
    /// construction.
    pub fn run(self: Arc<Self>) {
        tokio::spawn(self.clone().election_loop());
        tokio::spawn(self.clone().replication_loop());
        tokio::spawn(self.apply_loop());
    }

    /// Stop background work and close the apply stream so a listening `Rsm` exits its loop.
    pub async fn kill(&self) {
        self.killed.store(true, Ordering::SeqCst);
        *self.apply_tx.lock().await = None;
    }

    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    pub fn persisted_size(&self) -> usize {
        self.persister.raft_state_size()
    }

    pub async fn get_state(&self) -> (u64, bool) {
        let state = self.state.lock().await;
        (state.current_term, state.role == Role::Leader)
    }

    /// Append `command` if this peer currently believes itself the leader, returning the
    /// index and term it was appended at. Appending is not itself a guarantee of commit.
    pub async fn start(self: Arc<Self>, command: Vec<u8>) -> Option<(u64, u64)> {
        let result = {
            let mut state = self.state.lock().await;
            if state.role != Role::Leader {
                None
            } else {
                let term = state.current_term;
                let index = state.log.append(super::rpc::LogEntry { term, command });
                self.persist_locked(&state);
                Some((index, term))
            }
        };
        if result.is_some() {
            let this = self.clone();
            tokio::spawn(async move { this.broadcast_append_entries().await });
        }
        result
    }

    /// Install a snapshot covering everything up through `index`, discarding the log prefix
    /// it replaces. A no-op if `index` doesn't advance the log's compaction point.
    pub async fn snapshot(&self, index: u64, data: Vec<u8>) {
        let mut state = self.state.lock().await;
        if index <= state.log.first_index() {
            return;
        }
        state.log.trim_through(index);
        state.snapshot = data;
        self.persist_locked(&state);
    }

    fn persist_locked(&self, state: &PeerState) {
        let bytes = bincode::serialize(&state.persistent_snapshot())
            .expect("persistent state must serialize");
        self.persister.save(bytes, state.snapshot.clone());
    }

    fn majority(&self) -> usize {
        self.peers.len() / 2 + 1
    }

    fn become_leader_locked(&self, state: &mut PeerState) {
        state.role = Role::Leader;
        let next = state.log.last_index() + 1;
        for peer in 0..self.peers.len() {
            if peer == self.me {
                continue;
            }
            state.next_index.insert(peer, next);
            state.match_index.insert(peer, 0);
        }
        info!("[{}] became leader for term {}", self.me, state.current_term);
    }

    /// Advance `commit_index` to the highest `N` that a majority (counting ourselves) has
    /// replicated and that belongs to our current term, per the Figure 8 commit rule.
    fn recompute_commit_index(&self, state: &mut PeerState) {
        let mut n = state.log.last_index();
        while n > state.commit_index {
            if state.log.term_at(n) == Some(state.current_term) {
                let mut count = 1;
                for peer in 0..self.peers.len() {
                    if peer == self.me {
                        continue;
                    }
                    if *state.match_index.get(&peer).unwrap_or(&0) >= n {
                        count += 1;
                    }
                }
                if count >= self.majority() {
                    state.commit_index = n;
                    return;
                }
            }
            n -= 1;
        }
    }

    fn random_election_timeout(&self) -> Duration {
        let (min, max) = self.config.election_timeout;
        let ms = rand::thread_rng().gen_range(min.as_millis() as u64..=max.as_millis() as u64);
        Duration::from_millis(ms)
    }

    async fn election_loop(self: Arc<Self>) {
        loop {
            if self.is_killed() {
                return;
            }
            let timeout = self.random_election_timeout();
            tokio::time::sleep(timeout).await;
            if self.is_killed() {
                return;
            }
            let should_start = {
                let state = self.state.lock().await;
                state.role != Role::Leader && state.last_heartbeat_at.elapsed() >= timeout
            };
            if should_start {
                self.clone().start_election().await;
            }
        }
    }

    async fn start_election(self: Arc<Self>) {
        let (term, last_log_index, last_log_term) = {
            let mut state = self.state.lock().await;
            state.role = Role::Candidate;
            state.current_term += 1;
            state.voted_for = Some(self.me);
            state.last_heartbeat_at = Instant::now();
            self.persist_locked(&state);
            (state.current_term, state.log.last_index(), state.log.last_term())
        };
        debug!("[{}] starting election for term {}", self.me, term);

        let votes = Arc::new(std::sync::atomic::AtomicUsize::new(1));
        // A single-node cluster is its own majority, and no RequestVote task will ever be
        // spawned below to discover that.
        if votes.load(Ordering::SeqCst) >= self.majority() {
            let mut state = self.state.lock().await;
            if state.role == Role::Candidate && state.current_term == term {
                self.become_leader_locked(&mut state);
                drop(state);
                self.clone().broadcast_append_entries().await;
            }
            return;
        }
        for peer in 0..self.peers.len() {
            if peer == self.me {
                continue;
            }
            let this = self.clone();
            let votes = votes.clone();
            let addr = self.peers[peer];
            let args = RequestVoteArgs {
                term,
                candidate_id: self.me,
                last_log_index,
                last_log_term,
            };
            tokio::spawn(async move {
                let reply = match transport::call(addr, RaftRpc::RequestVote(args), this.config.rpc_timeout).await
                {
                    Ok(RaftRpc::RequestVoteReply(reply)) => reply,
                    _ => return,
                };
                let mut state = this.state.lock().await;
                if reply.term > state.current_term {
                    state.become_follower(reply.term);
                    this.persist_locked(&state);
                    return;
                }
                if state.role != Role::Candidate || state.current_term != term || !reply.vote_granted {
                    return;
                }
                let n = votes.fetch_add(1, Ordering::SeqCst) + 1;
                if n == this.majority() {
                    this.become_leader_locked(&mut state);
                    drop(state);
                    this.broadcast_append_entries().await;
                }
            });
        }
    }

    async fn replication_loop(self: Arc<Self>) {
        loop {
            if self.is_killed() {
                return;
            }
            tokio::time::sleep(self.config.heartbeat_interval).await;
            if self.is_killed() {
                return;
            }
            let is_leader = self.state.lock().await.role == Role::Leader;
            if is_leader {
                self.clone().broadcast_append_entries().await;
            }
        }
    }

    async fn broadcast_append_entries(self: Arc<Self>) {
        let mut handles = Vec::new();
        for peer in 0..self.peers.len() {
            if peer == self.me {
                continue;
            }
            let this = self.clone();
            handles.push(tokio::spawn(async move { this.replicate_to_peer(peer).await }));
        }
        for h in handles {
            let _ = h.await;
        }
    }

    async fn replicate_to_peer(self: Arc<Self>, peer: usize) {
        let action = {
            let state = self.state.lock().await;
            if state.role != Role::Leader {
                return;
            }
            let term = state.current_term;
            let next_idx = *state
                .next_index
                .get(&peer)
                .unwrap_or(&(state.log.last_index() + 1));
            let first_idx = state.log.first_index();
            if next_idx <= first_idx {
                ReplicateAction::InstallSnapshot(InstallSnapshotArgs {
                    term,
                    leader_id: self.me,
                    last_included_index: first_idx,
                    last_included_term: state.log.term_at(first_idx).unwrap_or(0),
                    data: state.snapshot.clone(),
                })
            } else {
                let prev_index = next_idx - 1;
                ReplicateAction::AppendEntries(AppendEntriesArgs {
                    term,
                    leader_id: self.me,
                    prev_log_index: prev_index,
                    prev_log_term: state.log.term_at(prev_index).unwrap_or(0),
                    entries: state.log.entries_from(next_idx),
                    leader_commit: state.commit_index,
                })
            }
        };

        let addr = self.peers[peer];
        match action {
            ReplicateAction::AppendEntries(args) => {
                let (term, prev_index, entries_len) = (args.term, args.prev_log_index, args.entries.len());
                match transport::call(addr, RaftRpc::AppendEntries(args), self.config.rpc_timeout).await {
                    Ok(RaftRpc::AppendEntriesReply(reply)) => {
                        self.on_append_entries_reply(peer, term, prev_index, entries_len, reply)
                            .await;
                    }
                    Ok(_) => {}
                    Err(e) => debug!("[{}] append_entries to {} failed: {}", self.me, peer, e),
                }
            }
            ReplicateAction::InstallSnapshot(args) => {
                let (term, last_included_index) = (args.term, args.last_included_index);
                match transport::call(addr, RaftRpc::InstallSnapshot(args), self.config.rpc_timeout).await {
                    Ok(RaftRpc::InstallSnapshotReply(reply)) => {
                        self.on_install_snapshot_reply(peer, term, last_included_index, reply)
                            .await;
                    }
                    Ok(_) => {}
                    Err(e) => debug!("[{}] install_snapshot to {} failed: {}", self.me, peer, e),
                }
            }
        }
    }

    async fn on_append_entries_reply(
        &self,
        peer: usize,
        sent_term: u64,
        prev_index: u64,
        entries_len: usize,
        reply: AppendEntriesReply,
    ) {
        let mut state = self.state.lock().await;
        if reply.term > state.current_term {
            state.become_follower(reply.term);
            self.persist_locked(&state);
            return;
        }
        if state.role != Role::Leader || state.current_term != sent_term {
            return;
        }
        if reply.success {
            let matched = prev_index + entries_len as u64;
            if matched > *state.match_index.get(&peer).unwrap_or(&0) {
                state.match_index.insert(peer, matched);
            }
            if matched + 1 > *state.next_index.get(&peer).unwrap_or(&1) {
                state.next_index.insert(peer, matched + 1);
            }
            self.recompute_commit_index(&mut state);
        } else {
            let suggested = reply.x_index.max(state.log.first_index() + 1);
            if suggested < *state.next_index.get(&peer).unwrap_or(&1) {
                state.next_index.insert(peer, suggested);
            }
        }
    }

    async fn on_install_snapshot_reply(
        &self,
        peer: usize,
        sent_term: u64,
        last_included_index: u64,
        reply: InstallSnapshotReply,
    ) {
        let mut state = self.state.lock().await;
        if reply.term > state.current_term {
            state.become_follower(reply.term);
            self.persist_locked(&state);
            return;
        }
        if state.role != Role::Leader || state.current_term != sent_term {
            return;
        }
        state.match_index.insert(peer, last_included_index);
        state.next_index.insert(peer, last_included_index + 1);
        self.recompute_commit_index(&mut state);
    }

    async fn apply_loop(self: Arc<Self>) {
        loop {
            if self.is_killed() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            if self.is_killed() {
                return;
            }
            let batch = {
                let mut state = self.state.lock().await;
                let mut batch = Vec::new();
                while state.last_applied < state.commit_index {
                    let next = state.last_applied + 1;
                    match state.log.entry(next) {
                        Some(e) => {
                            batch.push((next, e.command.clone()));
                            state.last_applied = next;
                        }
                        None => break,
                    }
                }
                batch
            };
            if batch.is_empty() {
                continue;
            }
            let tx = match self.apply_tx.lock().await.clone() {
                Some(tx) => tx,
                None => return,
            };
            for (index, command) in batch {
                if tx.send(ApplyMsg::Command { index, command }).await.is_err() {
                    return;
                }
            }
        }
    }

    pub async fn handle_request_vote(&self, args: RequestVoteArgs) -> RequestVoteReply {
        let mut state = self.state.lock().await;
        let mut dirty = false;
        if args.term > state.current_term {
            state.become_follower(args.term);
            dirty = true;
        }
        if args.term < state.current_term {
            return RequestVoteReply {
                term: state.current_term,
                vote_granted: false,
            };
        }
        let log_ok = args.last_log_term > state.log.last_term()
            || (args.last_log_term == state.log.last_term() && args.last_log_index >= state.log.last_index());
        let can_vote = state.voted_for.is_none() || state.voted_for == Some(args.candidate_id);
        let grant = can_vote && log_ok;
        if grant {
            state.voted_for = Some(args.candidate_id);
            state.last_heartbeat_at = Instant::now();
            dirty = true;
        }
        if dirty {
            self.persist_locked(&state);
        }
        RequestVoteReply {
            term: state.current_term,
            vote_granted: grant,
        }
    }

    pub async fn handle_append_entries(&self, args: AppendEntriesArgs) -> AppendEntriesReply {
        let mut state = self.state.lock().await;
        let mut dirty = false;
        if args.term > state.current_term {
            state.become_follower(args.term);
            dirty = true;
        }
        if args.term < state.current_term {
            return AppendEntriesReply {
                term: state.current_term,
                success: false,
                x_index: state.log.first_index() + 1,
            };
        }
        state.role = Role::Follower;
        state.last_heartbeat_at = Instant::now();

        let prev_ok = matches!(state.log.entry(args.prev_log_index), Some(e) if e.term == args.prev_log_term);
        if !prev_ok {
            let x_index = state.log.locate_conflict(args.prev_log_term, args.prev_log_index);
            if dirty {
                self.persist_locked(&state);
            }
            return AppendEntriesReply {
                term: state.current_term,
                success: false,
                x_index,
            };
        }

        let start = args.prev_log_index + 1;
        let divergence = state.log.first_divergence(start, &args.entries);
        let want_through = start + args.entries.len() as u64;
        if divergence < want_through {
            let skip = (divergence - start) as usize;
            state.log.replace_from(divergence, &args.entries[skip..]);
            dirty = true;
        }
        let last_new_index = if args.entries.is_empty() {
            args.prev_log_index
        } else {
            want_through - 1
        };
        if args.leader_commit > state.commit_index {
            state.commit_index = args.leader_commit.min(last_new_index);
        }
        if dirty {
            self.persist_locked(&state);
        }
        AppendEntriesReply {
            term: state.current_term,
            success: true,
            x_index: 0,
        }
    }

    pub async fn handle_install_snapshot(&self, args: InstallSnapshotArgs) -> InstallSnapshotReply {
        let (reply_term, to_apply) = {
            let mut state = self.state.lock().await;
            let mut dirty = false;
            if args.term > state.current_term {
                state.become_follower(args.term);
                dirty = true;
            }
            if args.term < state.current_term {
                return InstallSnapshotReply {
                    term: state.current_term,
                };
            }
            state.role = Role::Follower;
            state.last_heartbeat_at = Instant::now();

            if args.last_included_index <= state.log.first_index() {
                if dirty {
                    self.persist_locked(&state);
                }
                (state.current_term, None)
            } else {
                state.log = RaftLog::from_snapshot(args.last_included_index, args.last_included_term);
                state.snapshot = args.data.clone();
                state.commit_index = state.commit_index.max(args.last_included_index);
                state.last_applied = state.last_applied.max(args.last_included_index);
                self.persist_locked(&state);
                (
                    state.current_term,
                    Some(ApplyMsg::Snapshot {
                        data: args.data,
                        last_included_index: args.last_included_index,
                        last_included_term: args.last_included_term,
                    }),
                )
            }
        };
        if let Some(msg) = to_apply {
            if let Some(tx) = self.apply_tx.lock().await.clone() {
                let _ = tx.send(msg).await;
            }
        }
        InstallSnapshotReply { term: reply_term }
    }
}

impl transport::RpcHandler for RaftPeer {
    fn handle<'a>(&'a self, request: RaftRpc) -> Pin<Box<dyn Future<Output = RaftRpc> + Send + 'a>> {
        Box::pin(async move {
            match request {
                RaftRpc::RequestVote(args) => RaftRpc::RequestVoteReply(self.handle_request_vote(args).await),
                RaftRpc::AppendEntries(args) => {
                    RaftRpc::AppendEntriesReply(self.handle_append_entries(args).await)
                }
                RaftRpc::InstallSnapshot(args) => {
                    RaftRpc::InstallSnapshotReply(self.handle_install_snapshot(args).await)
                }
                other => other,
            }
        })
    }
}
