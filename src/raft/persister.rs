//! Durable storage for Raft's persistent state and the application snapshot.
//!
//! The two blobs are always written together via `save`, matching the spec's atomicity
//! requirement ("state and snapshot saved together"). Encoding is chosen by the caller
//! (`RaftPeer` bincode-encodes `PersistentState`); `Persister` itself just stores bytes.

use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

pub trait Persister: Send + Sync {
    fn save(&self, raft_state: Vec<u8>, snapshot: Vec<u8>);
    fn read_state(&self) -> Vec<u8>;
    fn read_snapshot(&self) -> Vec<u8>;
    fn raft_state_size(&self) -> usize;
}

/// In-memory persister used by tests and by any peer that doesn't need to survive a real
/// process restart.
#[derive(Default)]
pub struct MemoryPersister {
    inner: Mutex<(Vec<u8>, Vec<u8>)>,
}

impl MemoryPersister {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Persister for MemoryPersister {
    fn save(&self, raft_state: Vec<u8>, snapshot: Vec<u8>) {
        let mut guard = self.inner.lock().unwrap();
        *guard = (raft_state, snapshot);
    }

    fn read_state(&self) -> Vec<u8> {
        self.inner.lock().unwrap().0.clone()
    }

    fn read_snapshot(&self) -> Vec<u8> {
        self.inner.lock().unwrap().1.clone()
    }

    fn raft_state_size(&self) -> usize {
        self.inner.lock().unwrap().0.len()
    }
}

/// File-backed persister used by the `kvserver` binary so a restarted process recovers its
/// term, vote, log and snapshot from disk.
pub struct FilePersister {
    state_path: PathBuf,
    snapshot_path: PathBuf,
}

impl FilePersister {
    pub fn new(data_dir: &std::path::Path, server_id: usize) -> anyhow::Result<Self> {
        fs::create_dir_all(data_dir)?;
        Ok(Self {
            state_path: data_dir.join(format!("raft_state_{}.bin", server_id)),
            snapshot_path: data_dir.join(format!("snapshot_{}.bin", server_id)),
        })
    }
}

impl Persister for FilePersister {
    fn save(&self, raft_state: Vec<u8>, snapshot: Vec<u8>) {
        if let Err(e) = fs::write(&self.state_path, &raft_state) {
            log::error!("failed to persist raft state to {:?}: {}", self.state_path, e);
            return;
        }
        if let Err(e) = fs::write(&self.snapshot_path, &snapshot) {
            log::error!("failed to persist snapshot to {:?}: {}", self.snapshot_path, e);
        }
    }

    fn read_state(&self) -> Vec<u8> {
        fs::read(&self.state_path).unwrap_or_default()
    }

    fn read_snapshot(&self) -> Vec<u8> {
        fs::read(&self.snapshot_path).unwrap_or_default()
    }

    fn raft_state_size(&self) -> usize {
        fs::metadata(&self.state_path).map(|m| m.len() as usize).unwrap_or(0)
    }
}
