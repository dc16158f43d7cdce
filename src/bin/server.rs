use anyhow::{Context, Result};
use clap::Parser;
use kvraft::kv::{self, KvStateMachine};
use kvraft::raft::{FilePersister, RaftConfig, RaftPeer};
use kvraft::rsm::Rsm;
use log::info;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;

/// Start one replica of the Raft-backed key/value store.
#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// This replica's index into `--peers` / `--raft-peers` (also its persister identity).
    #[arg(long)]
    id: usize,

    /// Address this replica's KV client listener binds to.
    #[arg(long)]
    listen: SocketAddr,

    /// Address this replica's Raft RPC listener binds to.
    #[arg(long)]
    raft_listen: SocketAddr,

    /// Every replica's KV client address, comma-separated, in `--id` order.
    #[arg(long, value_delimiter = ',')]
    peers: Vec<SocketAddr>,

    /// Every replica's Raft RPC address, comma-separated, in `--id` order.
    #[arg(long, value_delimiter = ',')]
    raft_peers: Vec<SocketAddr>,

    /// Directory for this replica's persisted Raft state and snapshot.
    #[arg(long, default_value = "data")]
    data_dir: PathBuf,

    /// Snapshot once the persisted Raft log exceeds this many bytes. Unset disables
    /// snapshotting.
    #[arg(long)]
    max_raft_state: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    anyhow::ensure!(
        cli.id < cli.raft_peers.len(),
        "--id {} out of range for {} raft peers",
        cli.id,
        cli.raft_peers.len()
    );
    anyhow::ensure!(
        cli.peers.len() == cli.raft_peers.len(),
        "--peers and --raft-peers must name the same number of replicas"
    );

    let persister = Arc::new(
        FilePersister::new(&cli.data_dir, cli.id)
            .with_context(|| format!("opening data dir {:?}", cli.data_dir))?,
    );
    let (apply_tx, apply_rx) = tokio::sync::mpsc::channel(256);

    let raft_config = RaftConfig::new(cli.id, cli.raft_peers.clone());
    let raft = RaftPeer::new(raft_config, persister, apply_tx);
    raft.clone().run();

    let raft_listener = TcpListener::bind(cli.raft_listen)
        .await
        .with_context(|| format!("binding raft listener on {}", cli.raft_listen))?;
    info!("[{}] raft listening on {}", cli.id, cli.raft_listen);
    let raft_for_transport = raft.clone();
    tokio::spawn(async move {
        if let Err(e) = kvraft::raft::transport::serve(raft_listener, raft_for_transport).await {
            log::error!("raft listener exited: {}", e);
        }
    });

    let sm = Arc::new(KvStateMachine::new());
    let rsm = Rsm::new(cli.id, raft, sm, cli.max_raft_state, apply_rx);

    let client_listener = TcpListener::bind(cli.listen)
        .await
        .with_context(|| format!("binding client listener on {}", cli.listen))?;
    info!("[{}] clients listening on {}", cli.id, cli.listen);
    kv::server::serve(client_listener, rsm).await
}
