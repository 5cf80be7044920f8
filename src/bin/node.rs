//! Node binary

use clap::{Parser, Subcommand};
use minicoord::common::{parse_duration, BackendKind, Config};
use minicoord::Node;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "minicoord-node")]
#[command(about = "minicoord replica set member with durable resumable coordinators")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a node
    Serve {
        /// Node ID
        #[arg(long)]
        id: Option<String>,

        /// Bind address for HTTP
        #[arg(long)]
        bind: Option<SocketAddr>,

        /// Database directory
        #[arg(long)]
        db: Option<PathBuf>,

        /// Document store backend (memory, rocksdb, sled)
        #[arg(long, value_parser = parse_backend)]
        backend: Option<BackendKind>,

        /// Replica set name
        #[arg(long)]
        set_name: Option<String>,

        /// Replica set hosts (comma-separated)
        #[arg(long, value_delimiter = ',')]
        hosts: Vec<String>,

        /// Step up as primary on start
        #[arg(long)]
        primary: bool,

        /// Retention window of forgotten operations (e.g. "30s", "15m")
        #[arg(long, value_parser = parse_delay)]
        gc_delay: Option<Duration>,
    },
}

fn parse_delay(s: &str) -> Result<Duration, String> {
    parse_duration(s).map_err(|e| e.to_string())
}

fn parse_backend(s: &str) -> Result<BackendKind, String> {
    match s.to_ascii_lowercase().as_str() {
        "memory" => Ok(BackendKind::Memory),
        "rocksdb" => Ok(BackendKind::Rocksdb),
        "sled" => Ok(BackendKind::Sled),
        other => Err(format!("unknown backend '{}'", other)),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load config from file and env, then override with CLI arguments
    let mut config = Config::load()?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            id,
            bind,
            db,
            backend,
            set_name,
            hosts,
            primary,
            gc_delay,
        } => {
            if let Some(id) = id {
                config.node_id = id;
            }
            if let Some(bind) = bind {
                config.node.bind_addr = bind;
            }
            if let Some(db) = db {
                config.node.db_path = db;
            }
            if let Some(backend) = backend {
                config.node.backend = backend;
            }
            if let Some(set_name) = set_name {
                config.node.set_name = set_name;
            }
            if !hosts.is_empty() {
                config.node.hosts = hosts;
            }
            config.node.start_as_primary |= primary;
            if let Some(delay) = gc_delay {
                config.coordinator.garbage_collection_delay_ms = delay.as_millis() as u64;
            }
            config.validate()?;

            Node::new(config).serve().await?;
        }
    }

    Ok(())
}
