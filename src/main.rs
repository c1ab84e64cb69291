//! OrbitCast Presence - presence tracking server
//!
//! Listens on a Unix socket, one line-delimited ActionCable connection per
//! client.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::net::UnixListener;
use tracing::{error, info, warn};

use orbitcast_presence::{Config, Hub, PresenceRegistry, Server};

/// How long shutdown waits for final leave events to be delivered
const SHUTDOWN_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "orbitcast-presence")]
#[command(about = "Presence tracking server with ActionCable protocol")]
#[command(version)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Unix socket path (overrides ORBITCAST_SOCKET)
    #[arg(short, long)]
    socket: Option<PathBuf>,

    /// Default leave grace period in milliseconds (overrides ORBITCAST_PRESENCE_GRACE_MS)
    #[arg(long)]
    grace_period_ms: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(&args.log_level)
        .init();

    info!("OrbitCast Presence v{}", env!("CARGO_PKG_VERSION"));

    let mut config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load config: {}", e);
            std::process::exit(1);
        }
    };

    if let Some(socket) = args.socket {
        config.socket_path = socket;
    }
    if let Some(ms) = args.grace_period_ms {
        config.presence.grace_period = Duration::from_millis(ms);
    }

    info!(
        socket = %config.socket_path.display(),
        presence = config.presence.enabled,
        grace_period_ms = config.presence.grace_period.as_millis() as u64,
        stream_overrides = config.presence.stream_grace_periods.len(),
        queue_capacity = config.presence.queue_capacity,
        "Starting OrbitCast Presence"
    );

    // Create socket directory if needed
    let socket_path = config.socket_path.clone();
    if let Some(parent) = socket_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    // Remove stale socket if exists
    if socket_path.exists() {
        tokio::fs::remove_file(&socket_path).await?;
    }

    let listener = UnixListener::bind(&socket_path)?;
    info!(socket = %socket_path.display(), "Listening for connections");

    let hub = Arc::new(Hub::new());
    let registry = PresenceRegistry::new(config.presence.clone(), hub.clone());
    let server = Arc::new(Server::new(registry.clone(), hub));

    server
        .serve(listener, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for shutdown signal");
            }
        })
        .await?;

    // Members still connected leave now rather than after their grace period
    if !registry.shutdown(SHUTDOWN_FLUSH_TIMEOUT).await {
        warn!("Timed out delivering final presence events");
    }
    let dropped = registry.dropped_events();
    if dropped > 0 {
        warn!(dropped, "Presence events dropped during run");
    }

    // Cleanup socket
    if socket_path.exists() {
        let _ = tokio::fs::remove_file(&socket_path).await;
    }

    info!("OrbitCast Presence shutdown");
    Ok(())
}
