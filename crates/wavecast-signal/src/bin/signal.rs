//! Wavecast Signal Server
//!
//! WebSocket signaling server for host discovery and WebRTC negotiation.
//!
//! # Usage
//!
//! ```bash
//! wavecast-signal --port 8787
//!
//! # Settings from a config file, port overridden on the command line
//! wavecast-signal --config ./wavecast.toml --port 9000
//! ```

use std::net::IpAddr;
use std::path::PathBuf;

use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use wavecast_core::Config;
use wavecast_signal::SignalServer;

#[derive(Parser, Debug)]
#[command(name = "wavecast-signal")]
#[command(about = "Wavecast signaling server for host discovery")]
#[command(version)]
struct Args {
    /// Port to listen on
    #[arg(short, long, env = "WAVECAST_SIGNAL_PORT")]
    port: Option<u16>,

    /// Bind address
    #[arg(short, long, env = "WAVECAST_SIGNAL_HOST")]
    bind: Option<IpAddr>,

    /// Heartbeat interval in seconds
    #[arg(long)]
    heartbeat: Option<u64>,

    /// Config file (defaults to the platform config dir)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(Level::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load(),
    }
    .signal;
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(bind) = args.bind {
        config.bind = bind;
    }
    if let Some(secs) = args.heartbeat {
        config.heartbeat_interval_secs = secs;
    }

    info!("Starting Wavecast Signal Server");

    let server = SignalServer::from_config(&config).await?;
    info!("Listening on ws://{}", server.local_addr()?);

    server
        .serve_until(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    Ok(())
}
