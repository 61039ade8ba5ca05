//! AtomWeave - Peer-Replicated Atom Store
//!
//! Runs one node of an eventually consistent atom-graph cluster.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use atomweave::config::AtomWeaveConfig;
use atomweave::network::TcpTransport;
use atomweave::store::local::{AtomStore, MemoryAtomStore};
use atomweave::store::persistence::Snapshot;
use atomweave::store::DistributedStore;

/// AtomWeave - Peer-Replicated Atom Store
#[derive(Parser)]
#[command(name = "atomweave")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "atomweave.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the node and run until interrupted
    Start,

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "atomweave.toml")]
        output: PathBuf,

        /// Node ID
        #[arg(long, default_value = "node-1")]
        node_id: String,
    },

    /// Validate configuration file
    Validate,

    /// Show node information
    Info,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start => {
            let config = AtomWeaveConfig::from_file(&cli.config)
                .with_context(|| format!("loading configuration from {}", cli.config.display()))?;
            let level = cli.log_level.unwrap_or_else(|| config.logging.level.clone());
            init_logging(&level, &config.logging.format);
            run_start(config).await
        }
        Commands::Init { output, node_id } => run_init(output, node_id),
        Commands::Validate => run_validate(cli.config),
        Commands::Info => run_info(cli.config),
    }
}

fn init_logging(level: &str, format: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    if format == "compact" {
        registry.with(tracing_subscriber::fmt::layer().compact()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Run a node until Ctrl-C
async fn run_start(config: AtomWeaveConfig) -> anyhow::Result<()> {
    tracing::info!("Loaded configuration for node: {}", config.node.id);

    let snapshot = config.persistence.snapshot_path.clone().map(Snapshot::new);
    let atoms = match &snapshot {
        Some(snapshot) => snapshot
            .load()
            .with_context(|| format!("loading snapshot {}", snapshot.path().display()))?,
        None => Vec::new(),
    };
    if !atoms.is_empty() {
        tracing::info!("Restored {} atoms from snapshot", atoms.len());
    }

    let local: Arc<dyn AtomStore> = Arc::new(MemoryAtomStore::with_atoms(atoms));
    let transport = Arc::new(TcpTransport::new(&config));
    let node_id = config.node.id.clone();
    let store = DistributedStore::new(config, transport, Arc::clone(&local))?;

    store.start().await.context("starting node")?;
    tracing::info!("Node {} ready, press Ctrl-C to stop", node_id);

    tokio::signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal");

    let shutdown = store.shutdown().await;

    if let Some(snapshot) = &snapshot {
        let atoms = local.get_all_atoms();
        let count = atoms.len();
        snapshot
            .save(&node_id, atoms)
            .with_context(|| format!("saving snapshot {}", snapshot.path().display()))?;
        tracing::info!("Saved {} atoms to {}", count, snapshot.path().display());
    }

    shutdown.context("shutting down node")
}

/// Write a starter configuration file
fn run_init(output: PathBuf, node_id: String) -> anyhow::Result<()> {
    let config_content = format!(r#"# AtomWeave Configuration
# Generated configuration file

[node]
id = "{node_id}"
bind_address = "0.0.0.0:7700"
# advertise_address = "my-public-ip:7700"

[cluster]
peers = []
# peers = [
#   {{ id = "node-2", address = "node-2.example.com:7700" }},
#   {{ id = "node-3", address = "node-3.example.com:7700" }},
# ]
peer_retry_ms = 5000

[replication]
factor = 3
validate_interval_ms = 30000

[sync]
interval_ms = 5000

[consistency]
interval_ms = 10000

[rpc]
request_timeout_ms = 2000
connect_timeout_ms = 1000
max_attempts = 3
initial_backoff_ms = 100
max_backoff_ms = 2000

[logging]
level = "info"
format = "pretty"

[persistence]
# snapshot_path = "/var/lib/atomweave/{node_id}.json"
"#);

    std::fs::write(&output, config_content)
        .with_context(|| format!("writing {}", output.display()))?;
    println!("Configuration written to {}", output.display());
    Ok(())
}

/// Validate configuration file
fn run_validate(config_path: PathBuf) -> anyhow::Result<()> {
    match AtomWeaveConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Node ID: {}", config.node.id);
            println!("  Bind Address: {}", config.node.bind_address);
            println!("  Peers: {}", config.cluster.peers.len());
            println!("  Replication Factor: {}", config.replication.factor);
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e.into())
        }
    }
}

/// Show node information
fn run_info(config_path: PathBuf) -> anyhow::Result<()> {
    let config = AtomWeaveConfig::from_file(&config_path)?;

    println!("AtomWeave Node Information");
    println!("==========================");
    println!();
    println!("Node ID:          {}", config.node.id);
    println!("Bind Address:     {}", config.node.bind_address);
    println!("Advertise:        {}", config.advertise_address());
    println!();
    println!("Cluster:");
    for peer in &config.cluster.peers {
        println!("  {:<16}{}", peer.id, peer.address);
    }
    println!("  Peer Retry:     {} ms", config.cluster.peer_retry_ms);
    println!();
    println!("Replication:");
    println!("  Factor:         {}", config.replication.factor);
    println!("  Validation:     {} ms", config.replication.validate_interval_ms);
    println!("  Sync Interval:  {} ms", config.sync.interval_ms);
    println!("  Audit Interval: {} ms", config.consistency.interval_ms);
    println!();
    println!("RPC:");
    println!("  Timeout:        {} ms", config.rpc.request_timeout_ms);
    println!("  Attempts:       {}", config.rpc.max_attempts);
    println!("  Backoff:        {}..{} ms", config.rpc.initial_backoff_ms, config.rpc.max_backoff_ms);
    println!();
    match &config.persistence.snapshot_path {
        Some(path) => println!("Snapshot:         {}", path.display()),
        None => println!("Snapshot:         (disabled)"),
    }

    Ok(())
}
