//! ShardSync node daemon
//!
//! This binary hosts the primary and replica shards routed to this node.

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use shardsync_common::Config;
use shardsync_node::{Node, http};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "shardsync-node")]
#[command(about = "ShardSync segment replication node")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/shardsync/node.toml")]
    config: PathBuf,

    /// Node name (must be listed in cluster.nodes)
    #[arg(long, env = "SHARDSYNC_NODE_NAME")]
    name: Option<String>,

    /// Data directory holding the shard stores
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Listen address for the transport
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Listen address for /metrics and /health
    #[arg(long)]
    metrics_listen: Option<SocketAddr>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log output format
    #[arg(long, value_enum, default_value = "text")]
    log_format: LogFormat,
}

fn load_config(args: &Args) -> Result<Config> {
    let mut config: Config = if args.config.exists() {
        let raw = std::fs::read_to_string(&args.config)
            .with_context(|| format!("failed to read {}", args.config.display()))?;
        toml::from_str(&raw)
            .with_context(|| format!("failed to parse {}", args.config.display()))?
    } else {
        Config::default()
    };

    // CLI takes precedence over the file
    if let Some(name) = &args.name {
        config.node.name.clone_from(name);
    }
    if let Some(data_dir) = &args.data_dir {
        config.node.data_dir.clone_from(data_dir);
    }
    if let Some(listen) = args.listen {
        config.network.transport_listen = listen;
    }
    if let Some(metrics_listen) = args.metrics_listen {
        config.network.metrics_listen = metrics_listen;
    }
    config.validate()?;
    Ok(config)
}

fn init_logging(level: &str, format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.to_string().into());
    tracing_subscriber::registry()
        .with(filter)
        .with((format == LogFormat::Text).then(tracing_subscriber::fmt::layer))
        .with((format == LogFormat::Json).then(|| tracing_subscriber::fmt::layer().json()))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level, args.log_format);

    let config = load_config(&args)?;
    info!("Starting ShardSync node {}", config.node.name);
    info!("Config file: {}", args.config.display());
    info!("Data directory: {}", config.node.data_dir.display());

    let listener = TcpListener::bind(config.network.transport_listen)
        .await
        .with_context(|| format!("failed to bind {}", config.network.transport_listen))?;
    let metrics_listener = TcpListener::bind(config.network.metrics_listen)
        .await
        .with_context(|| format!("failed to bind {}", config.network.metrics_listen))?;

    let node = Arc::new(Node::start(config, listener).await?);

    let http_shutdown = CancellationToken::new();
    let http_task = tokio::spawn(http::serve(
        Arc::clone(&node),
        metrics_listener,
        http_shutdown.clone(),
    ));

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    node.shutdown().await;
    http_shutdown.cancel();
    match http_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Metrics server error: {}", e),
        Err(e) => error!("Metrics server task failed: {}", e),
    }

    info!("Node shut down gracefully");
    Ok(())
}
