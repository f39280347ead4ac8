//! Raft KV Node - Main entry point

use anyhow::Context;
use clap::Parser;
use raft_kv_server::config::{parse_peers, NodeConfig};
use raft_kv_server::KvNode;
use std::path::PathBuf;

/// Replicated key-value store node
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Node id (overrides config)
    #[arg(short, long)]
    id: Option<u64>,

    /// Cluster members as id@raft_addr@kv_addr, comma separated (overrides config)
    #[arg(short, long)]
    peers: Option<String>,

    /// Data directory (overrides config)
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Log level (overrides config)
    #[arg(long)]
    log_level: Option<String>,

    /// Plain text logs instead of JSON
    #[arg(long)]
    plain_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Load configuration
    let mut config = if args.config.exists() {
        NodeConfig::from_file(&args.config)
            .with_context(|| format!("loading {}", args.config.display()))?
    } else {
        eprintln!("Config file not found, using defaults and environment variables");
        NodeConfig::default()
    };
    config.apply_env().context("reading RAFTKV_* environment")?;

    // Apply CLI overrides
    if let Some(id) = args.id {
        config.node.id = id;
    }
    if let Some(peers) = args.peers {
        config.cluster.peers = parse_peers(&peers).context("parsing --peers")?;
    }
    if let Some(data_dir) = args.data_dir {
        config.storage.data_dir = data_dir;
    }
    if let Some(log_level) = args.log_level {
        config.logging.level = log_level;
    }
    if args.plain_logs {
        config.logging.json = false;
    }
    config.validate().context("invalid configuration")?;

    // Initialize logging
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));
    let subscriber = tracing_subscriber::fmt().with_env_filter(env_filter);
    if config.logging.json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    let me = config.self_info()?.clone();
    println!();
    println!("Raft KV node {}", me.id);
    println!("  Raft RPC:   {}", me.raft_addr);
    println!("  KV server:  {}", me.kv_addr);
    println!("  Cluster:    {} nodes", config.cluster.peers.len());
    println!("  Data Dir:   {:?}", config.storage.data_dir);
    println!();

    let mut node = KvNode::start(&config)
        .await
        .context("starting node")?;

    println!("Node started, press Ctrl+C to stop");

    tokio::signal::ctrl_c().await.context("waiting for Ctrl+C")?;
    println!();
    println!("Shutting down...");
    node.shutdown().await;

    println!("Shutdown complete");
    Ok(())
}
