//! Replicated state machine glue: turns a `RaftPeer`'s committed-entry stream into request/
//! response pairs for whatever application sits on top (here, the KV store).
//!
//! Grounded on `kvraft1/rsm/rsm.go`'s `StateMachine` interface and `MakeRSM` constructor.
//! `Submit`'s wait-for-my-own-commit behavior and the op-id tagging scheme that lets the
//! apply loop tell "my proposal landed" from "a later leader's proposal landed in my slot"
//! apart are reconstructed from how `kvraft1/server.go` calls `rsm.Submit` and from the
//! general 6.824-style OpQueue pattern the lab is drawn from.

use crate::raft::{ApplyMsg, RaftPeer};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};

/// The application state sitting behind an `Rsm`. Operations and results are opaque bytes;
/// the state machine owns their encoding.
pub trait StateMachine: Send + Sync {
    fn do_op(&self, op: Vec<u8>) -> Vec<u8>;
    fn snapshot(&self) -> Vec<u8>;
    fn restore(&self, snapshot: Vec<u8>);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RsmError {
    /// Either this peer was never the leader for the proposed command, or it lost
    /// leadership before the command committed and a different command now occupies its
    /// log slot. The caller should retry against the (possibly new) leader.
    NotLeader,
}

/// What actually goes in the replicated log: the caller's payload, tagged with a submitter
/// and a locally-unique id so the apply loop can recognize its own proposal when it comes
/// back around, rather than another leader's unrelated command that happens to land at the
/// same index after an overwrite.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Op {
    submitter_id: usize,
    op_id: u64,
    payload: Vec<u8>,
}

struct QueueEntry {
    op_id: u64,
    tx: oneshot::Sender<Vec<u8>>,
}

/// Pending local submissions, ordered by the log index each was assigned. A `BTreeMap`
/// rather than the conceptual `VecDeque` keeps this ordering correct even if two `submit`
/// calls race between getting their index back from `RaftPeer::start` and taking this lock.
type OpQueue = BTreeMap<u64, QueueEntry>;

pub struct Rsm<S: StateMachine> {
    me: usize,
    raft: Arc<RaftPeer>,
    sm: Arc<S>,
    maxraftstate: Option<usize>,
    next_op_id: AtomicU64,
    queue: Mutex<OpQueue>,
}

impl<S: StateMachine + 'static> Rsm<S> {
    /// Build an `Rsm` wired to `raft`'s apply stream and start its apply loop. `me` tags
    /// every op this instance proposes, so a peer recovering its own leadership never
    /// confuses a stale op of its own with a fresh one. `maxraftstate` mirrors the lab's
    /// knob: once the persisted Raft state grows past it, the state machine is snapshotted
    /// and the log trimmed. `None` disables snapshotting.
    pub fn new(
        me: usize,
        raft: Arc<RaftPeer>,
        sm: Arc<S>,
        maxraftstate: Option<usize>,
        apply_rx: mpsc::Receiver<ApplyMsg>,
    ) -> Arc<Self> {
        let rsm = Arc::new(Self {
            me,
            raft,
            sm,
            maxraftstate,
            next_op_id: AtomicU64::new(0),
            queue: Mutex::new(BTreeMap::new()),
        });
        tokio::spawn(rsm.clone().apply_loop(apply_rx));
        rsm
    }

    pub fn raft(&self) -> &Arc<RaftPeer> {
        &self.raft
    }

    /// Propose `payload`, blocking until either this server applies the matching entry
    /// (success) or it becomes clear that will never happen (`NotLeader`).
    pub async fn submit(&self, payload: Vec<u8>) -> Result<Vec<u8>, RsmError> {
        let op_id = self.next_op_id.fetch_add(1, Ordering::SeqCst);
        let op = Op { submitter_id: self.me, op_id, payload };
        let encoded = bincode::serialize(&op).expect("op must serialize");

        let (index, _term) = match self.raft.clone().start(encoded).await {
            Some(v) => v,
            None => return Err(RsmError::NotLeader),
        };

        let (tx, rx) = oneshot::channel();
        {
            let mut queue = self.queue.lock().await;
            // Anything already queued at or above this index belonged to a log that our
            // own new leadership term just overwrote from here on; those slots will never
            // be applied as their original submitters expect, so dropping their senders
            // resolves them with NotLeader immediately instead of leaving them hanging.
            let stale = queue.split_off(&index);
            drop(stale);
            queue.insert(index, QueueEntry { op_id, tx });
        }

        rx.await.map(Ok).unwrap_or(Err(RsmError::NotLeader))
    }

    async fn apply_loop(self: Arc<Self>, mut apply_rx: mpsc::Receiver<ApplyMsg>) {
        while let Some(msg) = apply_rx.recv().await {
            match msg {
                ApplyMsg::Command { index, command } => {
                    // Head-drain: any of our own queued submissions below this index were
                    // superseded (their slot got applied with something else, or never will
                    // be). Dropping their senders resolves those callers with NotLeader.
                    {
                        let mut queue = self.queue.lock().await;
                        let stale: Vec<u64> = queue.range(..index).map(|(&k, _)| k).collect();
                        for k in stale {
                            queue.remove(&k);
                        }
                    }

                    let op: Op = bincode::deserialize(&command).expect("committed op must decode");
                    let reply = self.sm.do_op(op.payload);

                    let mut queue = self.queue.lock().await;
                    if matches!(queue.get(&index), Some(entry) if entry.op_id == op.op_id) {
                        let entry = queue.remove(&index).expect("checked above");
                        let _ = entry.tx.send(reply);
                    }
                    drop(queue);

                    self.maybe_snapshot(index).await;
                }
                ApplyMsg::Snapshot { data, .. } => {
                    self.sm.restore(data);
                    // Every pending submit below the snapshot point will never see its
                    // entry applied individually; clearing the map fails them all at once.
                    self.queue.lock().await.clear();
                }
            }
        }
    }

    async fn maybe_snapshot(&self, applied_index: u64) {
        if let Some(limit) = self.maxraftstate {
            if self.raft.persisted_size() >= limit {
                let snap = self.sm.snapshot();
                self.raft.snapshot(applied_index, snap).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::{MemoryPersister, RaftConfig, RaftPeer};
    use std::sync::Mutex as StdMutex;

    struct EchoMachine {
        log: StdMutex<Vec<Vec<u8>>>,
    }

    impl StateMachine for EchoMachine {
        fn do_op(&self, op: Vec<u8>) -> Vec<u8> {
            self.log.lock().unwrap().push(op.clone());
            op
        }
        fn snapshot(&self) -> Vec<u8> {
            bincode::serialize(&*self.log.lock().unwrap()).unwrap()
        }
        fn restore(&self, snapshot: Vec<u8>) {
            *self.log.lock().unwrap() = bincode::deserialize(&snapshot).unwrap();
        }
    }

    async fn single_node_rsm() -> Arc<Rsm<EchoMachine>> {
        let config = RaftConfig::new(0, vec!["127.0.0.1:1".parse().unwrap()]);
        let (tx, rx) = mpsc::channel(16);
        let raft = RaftPeer::new(config, Arc::new(MemoryPersister::new()), tx);
        raft.clone().run();
        // A one-node cluster is its own majority; give the election timer a moment to fire.
        tokio::time::sleep(std::time::Duration::from_millis(950)).await;
        let sm = Arc::new(EchoMachine {
            log: StdMutex::new(Vec::new()),
        });
        Rsm::new(0, raft, sm, None, rx)
    }

    #[tokio::test]
    async fn submit_resolves_once_applied() {
        let rsm = single_node_rsm().await;
        let result = rsm.submit(b"hello".to_vec()).await.unwrap();
        assert_eq!(result, b"hello");
    }

    #[tokio::test]
    async fn submit_rejects_when_not_leader() {
        let config = RaftConfig::new(0, vec!["127.0.0.1:1".parse().unwrap(), "127.0.0.1:2".parse().unwrap()]);
        let (tx, rx) = mpsc::channel(16);
        let raft = RaftPeer::new(config, Arc::new(MemoryPersister::new()), tx);
        // Never started; with a silent peer this node can't win an election in time.
        let sm = Arc::new(EchoMachine {
            log: StdMutex::new(Vec::new()),
        });
        let rsm = Rsm::new(0, raft, sm, None, rx);
        assert_eq!(rsm.submit(b"x".to_vec()).await, Err(RsmError::NotLeader));
    }
}
