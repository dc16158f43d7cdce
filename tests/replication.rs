//! Integration tests driving `RaftPeer` end to end over real TCP connections, observing
//! replication and persistence only through the public API: `start`, `get_state`, and each
//! peer's own apply stream.

use anyhow::{anyhow, Result};
use kvraft::raft::{transport, ApplyMsg, FilePersister, MemoryPersister, Persister, RaftConfig, RaftPeer};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

async fn spawn_cluster(
    addrs: &[SocketAddr],
    persisters: Vec<Arc<dyn Persister>>,
) -> Result<(Vec<Arc<RaftPeer>>, Vec<mpsc::Receiver<ApplyMsg>>)> {
    let mut peers = Vec::new();
    let mut applies = Vec::new();
    for (id, persister) in persisters.into_iter().enumerate() {
        let config = RaftConfig::new(id, addrs.to_vec());
        let (tx, rx) = mpsc::channel(64);
        let peer = RaftPeer::new(config, persister, tx);
        let listener = TcpListener::bind(addrs[id]).await?;
        let serving = peer.clone();
        tokio::spawn(async move {
            let _ = transport::serve(listener, serving).await;
        });
        peer.clone().run();
        peers.push(peer);
        applies.push(rx);
    }
    Ok((peers, applies))
}

async fn wait_for_leader(peers: &[Arc<RaftPeer>], timeout: Duration) -> Result<usize> {
    tokio::time::timeout(timeout, async {
        loop {
            for (i, peer) in peers.iter().enumerate() {
                if peer.get_state().await.1 {
                    return i;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .map_err(|_| anyhow!("no leader elected within {:?}", timeout))
}

async fn wait_for_apply(rx: &mut mpsc::Receiver<ApplyMsg>, timeout: Duration) -> Result<ApplyMsg> {
    tokio::time::timeout(timeout, rx.recv())
        .await
        .map_err(|_| anyhow!("no apply message within {:?}", timeout))?
        .ok_or_else(|| anyhow!("apply stream closed"))
}

fn addrs(base: u16, n: u16) -> Vec<SocketAddr> {
    (0..n)
        .map(|i| format!("127.0.0.1:{}", base + i).parse().unwrap())
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn replication_basic() -> Result<()> {
    let addrs = addrs(19101, 3);
    let persisters: Vec<Arc<dyn Persister>> = (0..3).map(|_| Arc::new(MemoryPersister::new()) as _).collect();
    let (peers, mut applies) = spawn_cluster(&addrs, persisters).await?;

    let leader = wait_for_leader(&peers, Duration::from_secs(3)).await?;
    let started = peers[leader].clone().start(b"hello-entry".to_vec()).await;
    assert!(started.is_some(), "leader refused to accept a proposal");

    for (i, rx) in applies.iter_mut().enumerate() {
        let msg = wait_for_apply(rx, Duration::from_secs(2)).await?;
        match msg {
            ApplyMsg::Command { command, .. } => {
                assert_eq!(command, b"hello-entry", "node {} applied the wrong command", i);
            }
            ApplyMsg::Snapshot { .. } => panic!("node {} got a snapshot instead of the command", i),
        }
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn replication_multi_node_orders_commands() -> Result<()> {
    let addrs = addrs(19201, 3);
    let persisters: Vec<Arc<dyn Persister>> = (0..3).map(|_| Arc::new(MemoryPersister::new()) as _).collect();
    let (peers, mut applies) = spawn_cluster(&addrs, persisters).await?;

    let leader = wait_for_leader(&peers, Duration::from_secs(3)).await?;
    for cmd in [b"a".to_vec(), b"b".to_vec(), b"c".to_vec()] {
        let (index, _term) = peers[leader]
            .clone()
            .start(cmd)
            .await
            .ok_or_else(|| anyhow!("leader stepped down mid-test"))?;
        assert!(index >= 1);
    }

    for rx in applies.iter_mut() {
        let mut seen = Vec::new();
        for _ in 0..3 {
            match wait_for_apply(rx, Duration::from_secs(2)).await? {
                ApplyMsg::Command { command, .. } => seen.push(command),
                ApplyMsg::Snapshot { .. } => panic!("unexpected snapshot"),
            }
        }
        assert_eq!(seen, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    }

    let (term, _) = peers[leader].get_state().await;
    for (i, peer) in peers.iter().enumerate() {
        if i != leader {
            let (other_term, is_leader) = peer.get_state().await;
            assert!(!is_leader, "node {} should not also be leader", i);
            assert!(other_term >= term, "node {} is behind the leader's term", i);
        }
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn persistence_restart_continues_the_log() -> Result<()> {
    let addr = addrs(19301, 1);
    let dir = tempfile::tempdir()?;

    let persister: Arc<dyn Persister> = Arc::new(FilePersister::new(dir.path(), 0)?);
    let (peers, mut applies) = spawn_cluster(&addr, vec![persister]).await?;
    wait_for_leader(&peers, Duration::from_secs(2)).await?;

    let (first_index, _) = peers[0]
        .clone()
        .start(b"before-restart".to_vec())
        .await
        .ok_or_else(|| anyhow!("single-node cluster did not accept a proposal"))?;
    match wait_for_apply(&mut applies[0], Duration::from_secs(2)).await? {
        ApplyMsg::Command { index, command } => {
            assert_eq!(index, first_index);
            assert_eq!(command, b"before-restart");
        }
        ApplyMsg::Snapshot { .. } => panic!("unexpected snapshot"),
    }
    peers[0].kill().await;
    drop(peers);

    // "Restart": a fresh RaftPeer reading the same on-disk state.
    let persister: Arc<dyn Persister> = Arc::new(FilePersister::new(dir.path(), 0)?);
    let (peers, mut applies) = spawn_cluster(&addr, vec![persister]).await?;
    wait_for_leader(&peers, Duration::from_secs(2)).await?;

    let (second_index, _) = peers[0]
        .clone()
        .start(b"after-restart".to_vec())
        .await
        .ok_or_else(|| anyhow!("restarted cluster did not accept a proposal"))?;
    assert_eq!(
        second_index,
        first_index + 1,
        "restarted peer lost its persisted log and restarted indexing from scratch"
    );
    match wait_for_apply(&mut applies[0], Duration::from_secs(2)).await? {
        ApplyMsg::Command { index, command } => {
            assert_eq!(index, second_index);
            assert_eq!(command, b"after-restart");
        }
        ApplyMsg::Snapshot { .. } => panic!("unexpected snapshot"),
    }
    Ok(())
}
