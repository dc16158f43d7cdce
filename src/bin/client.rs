use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use kvraft::kv::client::{Clerk, ClerkError};
use std::net::SocketAddr;

/// Talk to a Raft-backed key/value cluster.
#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Every replica's client address, comma-separated; the Clerk tries them in order and
    /// remembers the last one that answered.
    #[arg(long, value_delimiter = ',')]
    servers: Vec<SocketAddr>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch a key's value and version.
    Get {
        key: String,
    },
    /// Write a key, guarded by the version it's expected to currently hold (0 for a new key).
    Put {
        key: String,
        value: String,
        #[arg(long, default_value_t = 0)]
        version: u64,
    },
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    if cli.servers.is_empty() {
        bail!("--servers must name at least one replica");
    }
    let clerk = Clerk::new(cli.servers);

    match cli.command {
        Commands::Get { key } => match clerk.get(&key) {
            Ok((value, version)) => println!("{} (version {})", value, version),
            Err(ClerkError::NoKey) => bail!("no such key: {}", key),
            Err(ClerkError::VersionMismatch) | Err(ClerkError::Maybe) => {
                unreachable!("a Get cannot fail with a Put-specific error")
            }
        },
        Commands::Put { key, value, version } => match clerk.put(&key, &value, version) {
            Ok(()) => println!("ok"),
            Err(ClerkError::NoKey) => bail!("no such key: {}", key),
            Err(ClerkError::VersionMismatch) => bail!("version mismatch: {} has moved on", key),
            Err(ClerkError::Maybe) => {
                bail!("put may or may not have committed; check the key's version before retrying")
            }
        },
    }

    Ok(())
}
