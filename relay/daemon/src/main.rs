//! Relay Daemon - Conversation Streams over WebSocket
//!
//! Runs the relay against its embedded broker and record store and serves
//! client connections over WebSocket. Each connection streams every
//! conversation its user belongs to and accepts outbound messages as JSON
//! text frames.
//!
//! # Usage
//!
//! ```bash
//! # Start with defaults
//! relay-daemon
//!
//! # Custom listen address and membership fixture
//! relay-daemon --listen 0.0.0.0:9000 --seed ./conversations.toml
//!
//! # With config file
//! relay-daemon --config /etc/relay/config.toml
//!
//! # Verbose logging
//! RUST_LOG=debug relay-daemon
//! ```
//!
//! # Signals
//!
//! - `SIGTERM` / `SIGINT`: Graceful shutdown

mod server;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use relay_core::config::load_config_from_path;
use relay_core::{
    Broker, ConfigOverrides, InMemoryBroker, InMemoryRecordStore, PublishMode, RecordStore, Relay,
    RelayConfig,
};

use server::DaemonServer;

/// Relay Daemon - Conversation message relay over WebSocket
#[derive(Parser, Debug)]
#[command(name = "relay-daemon")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short = 'c', long, env = "RELAY_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Address to listen on for WebSocket clients
    #[arg(long, value_name = "ADDR")]
    listen: Option<String>,

    /// Broker addresses (comma separated)
    #[arg(long, value_delimiter = ',', value_name = "HOST:PORT")]
    brokers: Option<Vec<String>>,

    /// Topic carrying message envelopes
    #[arg(long, value_name = "NAME")]
    topic: Option<String>,

    /// Partition count of the embedded broker topic
    #[arg(long, value_name = "N")]
    partitions: Option<usize>,

    /// Conversation membership fixture (TOML)
    #[arg(long, value_name = "FILE")]
    seed: Option<PathBuf>,

    /// Default publish mode (sync, async)
    #[arg(long, value_name = "MODE")]
    publish_mode: Option<PublishMode>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "RELAY_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

impl Args {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            brokers: self.brokers.clone(),
            topic: self.topic.clone(),
            listen: self.listen.clone(),
            partitions: self.partitions,
            seed: self.seed.clone(),
            publish_mode: self.publish_mode,
        }
    }
}

/// Initialize logging
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("relay_daemon={level},relay_core={level}"))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();
}

/// Resolve configuration: file, environment, then command line
fn resolve_config(args: &Args) -> Result<RelayConfig> {
    let path = args
        .config
        .clone()
        .or_else(relay_core::config::default_config_path);
    let mut config = load_config_from_path(path).context("Failed to load configuration")?;
    args.overrides()
        .apply(&mut config)
        .context("Invalid command line configuration")?;
    Ok(config)
}

/// Build the relay over the embedded broker and record store
async fn build_relay(config: RelayConfig) -> Result<Relay> {
    let mut broker = InMemoryBroker::new();
    if let Some(ref credentials) = config.broker.credentials {
        info!(username = %credentials.username, "Broker credentials configured");
        broker = broker.with_required_credentials(credentials.clone());
    }
    broker
        .create_topic(&config.broker.topic, config.server.partitions)
        .with_context(|| format!("Failed to create topic {}", config.broker.topic))?;
    warn!(
        brokers = ?config.broker.brokers,
        "Using embedded broker; external broker addresses are not contacted"
    );

    let records = match config.server.seed {
        Some(ref path) => {
            let store = InMemoryRecordStore::load_seed(path)
                .await
                .with_context(|| format!("Failed to load seed {}", path.display()))?;
            info!(path = %path.display(), "Loaded conversation membership");
            store
        }
        None => {
            warn!("No seed file given; no user belongs to any conversation");
            InMemoryRecordStore::new()
        }
    };

    let broker: Arc<dyn Broker> = Arc::new(broker);
    let records: Arc<dyn RecordStore> = Arc::new(records);
    Ok(Relay::new(config, broker, records))
}

/// Cancel `shutdown` on SIGINT or SIGTERM
fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for Ctrl+C");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            () = ctrl_c => info!("Received Ctrl+C, shutting down"),
            () = terminate => info!("Received SIGTERM, shutting down"),
        }

        shutdown.cancel();
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging first
    init_logging(&args.log_level);

    info!("Relay Daemon starting");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = resolve_config(&args)?;
    info!(
        source = %config.source(),
        topic = %config.broker.topic,
        partitions = config.server.partitions,
        publish_mode = %config.publish.default_mode,
        "Configuration resolved"
    );

    let relay = build_relay(config).await?;
    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    DaemonServer::new(relay).run(shutdown).await
}
