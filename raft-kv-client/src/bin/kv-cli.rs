//! Raft KV CLI
//!
//! Command-line access to a raft-kv cluster.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use raft_kv_client::{ClientConfig, KvClient};
use raft_kv_core::PeerInfo;
use std::time::Duration;

const DEFAULT_PEERS: &str = "127.0.0.1:8001,127.0.0.1:8002,127.0.0.1:8003";

#[derive(Parser)]
#[command(name = "kv-cli")]
#[command(version)]
#[command(about = "Client for the raft-kv replicated key-value store", long_about = None)]
struct Cli {
    /// Front-door addresses of the cluster, comma separated
    #[arg(short, long, env = "RAFTKV_CLIENT_PEERS", default_value = DEFAULT_PEERS)]
    peers: String,

    /// Attempts before giving up (0 retries forever)
    #[arg(long, default_value_t = 10)]
    max_attempts: usize,

    /// Pause between attempts in milliseconds
    #[arg(long, default_value_t = 500)]
    backoff_ms: u64,

    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Read a key
    Get { key: String },
    /// Write a key
    Set { key: String, value: String },
    /// Remove a key
    Delete { key: String },
    /// Show the status of every node
    Status,
    /// Add a member; the contacted node tells the rest of the cluster
    AddPeer {
        #[arg(long)]
        id: u64,
        /// Raft RPC address of the new member
        #[arg(long)]
        raft_addr: String,
        /// Key-value address of the new member
        #[arg(long)]
        kv_addr: String,
    },
    /// Remove a member; the contacted node tells the rest of the cluster
    RemovePeer {
        #[arg(long)]
        id: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let peers: Vec<String> = cli
        .peers
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect();
    let config = ClientConfig {
        max_attempts: (cli.max_attempts > 0).then_some(cli.max_attempts),
        retry_backoff: Duration::from_millis(cli.backoff_ms),
        ..Default::default()
    };
    let client = KvClient::with_config(peers, config).context("creating client")?;

    match cli.command {
        Commands::Get { key } => {
            let value = client.get(&key).await.with_context(|| format!("get {}", key))?;
            println!("{}", serde_json::json!({ "key": key, "value": value }));
        }
        Commands::Set { key, value } => {
            client
                .set(&key, &value)
                .await
                .with_context(|| format!("set {}", key))?;
            println!("{}", serde_json::json!({ "key": key, "ok": true }));
        }
        Commands::Delete { key } => {
            client
                .delete(&key)
                .await
                .with_context(|| format!("delete {}", key))?;
            println!("{}", serde_json::json!({ "key": key, "ok": true }));
        }
        Commands::AddPeer { id, raft_addr, kv_addr } => {
            let changed = client
                .add_peer(PeerInfo::new(id, raft_addr, kv_addr))
                .await
                .with_context(|| format!("add peer {}", id))?;
            println!("{}", serde_json::json!({ "peer": id, "added": changed }));
        }
        Commands::RemovePeer { id } => {
            let changed = client
                .remove_peer(id)
                .await
                .with_context(|| format!("remove peer {}", id))?;
            println!("{}", serde_json::json!({ "peer": id, "removed": changed }));
        }
        Commands::Status => {
            for (addr, status) in client.cluster_status().await {
                let line = match status {
                    Ok(status) => serde_json::json!({
                        "addr": addr,
                        "id": status.id,
                        "role": status.role.to_string(),
                        "term": status.term,
                        "leader": status.leader_id,
                        "commit_index": status.commit_index,
                        "last_applied": status.last_applied,
                        "log_len": status.log_len,
                    }),
                    Err(e) => serde_json::json!({ "addr": addr, "error": e.to_string() }),
                };
                println!("{}", line);
            }
        }
    }

    Ok(())
}
