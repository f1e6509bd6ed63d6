//! Wavecast CLI - Broadcast and listen to synchronized audio
//!
//! Usage:
//!   wavecast signal                       Run the signaling server
//!   wavecast discover                     List hosts as they come and go
//!   wavecast host --room <room>           Broadcast into a room
//!   wavecast listen <host-id>             Listen to a host
//!   wavecast udp-host <peer>...           Stream PCM over UDP
//!   wavecast udp-listen                   Play PCM received over UDP
//!
//! Audio goes through the default sound card unless `--input` / `--output`
//! pick one of the device-free stand-ins.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use tokio::signal;
use tokio::sync::watch;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use wavecast_core::{CaptureMode, CaptureSource, Config, DEFAULT_ROOM};
use wavecast_daemon::{
    AudioSessionService, CaptureDevice, ConnectClientOptions, DeviceCapture, DeviceSink,
    NativeAudio, PlayoutMeter, SessionBackends, SessionHandle, SilenceCapture, SinkFactory,
    StartHostOptions, UdpClientOptions, UdpHostOptions,
};
use wavecast_signal::SignalServer;

type CliResult = Result<(), Box<dyn std::error::Error>>;

/// How long each UDP worker gets to exit before it is left behind
const UDP_STOP_GRACE: Duration = Duration::from_secs(2);

/// Where the WebRTC host's audio comes from
#[derive(Clone, Copy, Debug, ValueEnum)]
enum HostInput {
    /// Default sound card
    Device,
    /// Opus silence, for hosts without audio hardware
    Silence,
}

/// Where a listener's audio goes
#[derive(Clone, Copy, Debug, ValueEnum)]
enum ListenOutput {
    /// Default sound card
    Device,
    /// Count received bytes only
    Meter,
}

/// Where the UDP host's PCM comes from
#[derive(Clone, Copy, Debug, ValueEnum)]
enum UdpInput {
    /// Default sound card
    Device,
    /// Raw s16le PCM on stdin
    Stdin,
}

/// Where received UDP PCM goes
#[derive(Clone, Copy, Debug, ValueEnum)]
enum UdpOutput {
    /// Default sound card
    Device,
    /// Raw s16le PCM on stdout
    Stdout,
}

#[derive(Parser)]
#[command(name = "wavecast")]
#[command(about = "Synchronized multi-room audio broadcast", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file (defaults to the platform config dir)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the signaling server
    Signal {
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Bind address
        #[arg(short, long)]
        bind: Option<IpAddr>,
    },

    /// Watch the host list
    Discover {
        /// Signaling server URL
        #[arg(short, long)]
        signal: Option<String>,
    },

    /// Broadcast audio into a room
    Host {
        /// Room to broadcast into
        #[arg(short, long, default_value = DEFAULT_ROOM)]
        room: String,

        /// Name shown to listeners
        #[arg(short, long, default_value = "Host")]
        name: String,

        /// Capture source: display (system audio, Windows only) or microphone
        #[arg(long, default_value = "microphone")]
        source: CaptureSource,

        /// Audio input backend
        #[arg(short, long, value_enum, default_value = "device")]
        input: HostInput,

        /// Address advertised next to the host entry
        #[arg(short, long)]
        address: Option<String>,

        /// Signaling server URL
        #[arg(short, long)]
        signal: Option<String>,
    },

    /// Listen to a host
    Listen {
        /// Host peer id, as shown by `discover`
        host_id: String,

        /// Room the host broadcasts into
        #[arg(short, long, default_value = DEFAULT_ROOM)]
        room: String,

        /// Name announced to the room
        #[arg(short, long, default_value = "Client")]
        name: String,

        /// Audio output backend
        #[arg(short, long, value_enum, default_value = "device")]
        output: ListenOutput,

        /// Signaling server URL
        #[arg(short, long)]
        signal: Option<String>,
    },

    /// Stream PCM to UDP peers
    UdpHost {
        /// Peer addresses (host or host:port)
        #[arg(required = true)]
        peers: Vec<String>,

        /// Destination port for peers given without one
        #[arg(short, long)]
        port: Option<u16>,

        /// Capture mode: auto, playback or microphone
        #[arg(short, long, default_value = "auto")]
        mode: CaptureMode,

        /// PCM input backend
        #[arg(short, long, value_enum, default_value = "device")]
        input: UdpInput,
    },

    /// Receive UDP PCM and play it
    UdpListen {
        /// Only accept packets from this host
        #[arg(long)]
        host: Option<String>,

        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Frames held for reordering
        #[arg(short, long)]
        jitter: Option<usize>,

        /// PCM output backend
        #[arg(short, long, value_enum, default_value = "device")]
        output: UdpOutput,
    },

    /// Print a sample config file
    Config,
}

#[tokio::main]
async fn main() -> CliResult {
    let cli = Cli::parse();

    // Logs go to stderr so udp-listen can pipe PCM on stdout
    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load(),
    };

    match cli.command {
        Commands::Signal { port, bind } => run_signal(config, port, bind).await?,
        Commands::Discover { signal } => run_discover(config, signal).await?,
        Commands::Host {
            room,
            name,
            source,
            input,
            address,
            signal,
        } => {
            let options = StartHostOptions {
                signaling_url: signal,
                room_id: room,
                name,
                source,
                address,
            };
            run_host(config, options, input).await?;
        }
        Commands::Listen {
            host_id,
            room,
            name,
            output,
            signal,
        } => {
            let options = ConnectClientOptions {
                signaling_url: signal,
                room_id: room,
                host_id,
                name,
            };
            run_listen(config, options, output).await?;
        }
        Commands::UdpHost {
            peers,
            port,
            mode,
            input,
        } => {
            let mut native = config.native;
            if let Some(port) = port {
                native.port = port;
            }
            run_udp_host(UdpHostOptions::from_config(&native, peers, mode), input).await?;
        }
        Commands::UdpListen {
            host,
            port,
            jitter,
            output,
        } => {
            let mut native = config.native;
            if let Some(port) = port {
                native.port = port;
            }
            if let Some(jitter) = jitter {
                native.jitter_frames = jitter;
            }
            run_udp_listen(UdpClientOptions::from_config(&native, host), output).await?;
        }
        Commands::Config => print!("{}", Config::sample()),
    }

    Ok(())
}

async fn run_signal(config: Config, port: Option<u16>, bind: Option<IpAddr>) -> CliResult {
    let mut signal_config = config.signal;
    if let Some(port) = port {
        signal_config.port = port;
    }
    if let Some(bind) = bind {
        signal_config.bind = bind;
    }

    let addr = SocketAddr::new(signal_config.bind, signal_config.port);
    info!("Starting signal server on ws://{}", addr);

    let server = SignalServer::from_config(&signal_config).await?;
    server
        .serve_until(async {
            let _ = signal::ctrl_c().await;
            info!("Shutting down...");
        })
        .await?;
    Ok(())
}

fn spawn_service(
    config: &Config,
    capture: Arc<dyn CaptureDevice>,
    sinks: SinkFactory,
) -> Result<SessionHandle, Box<dyn std::error::Error>> {
    let backends = SessionBackends::webrtc(&config.session, capture, sinks)?;
    Ok(AudioSessionService::spawn(config.session.clone(), backends))
}

async fn run_discover(config: Config, signal_url: Option<String>) -> CliResult {
    let session = spawn_service(
        &config,
        Arc::new(SilenceCapture),
        PlayoutMeter::new().factory(),
    )?;
    session.start_discovery(signal_url.as_deref()).await?;

    let mut hosts = session.hosts();
    info!("Watching for hosts (Ctrl+C to stop)");
    loop {
        tokio::select! {
            changed = hosts.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = hosts.borrow_and_update().clone();
                if snapshot.is_empty() {
                    info!("No hosts online");
                }
                for host in snapshot {
                    info!(
                        "  {}  {:<20} room={} address={}",
                        host.id,
                        host.name,
                        host.room_id,
                        host.address.as_deref().unwrap_or("-")
                    );
                }
            }
            _ = signal::ctrl_c() => break,
        }
    }

    session.stop_discovery().await?;
    Ok(())
}

async fn run_host(config: Config, options: StartHostOptions, input: HostInput) -> CliResult {
    let capture: Arc<dyn CaptureDevice> = match input {
        HostInput::Device => Arc::new(DeviceCapture),
        HostInput::Silence => Arc::new(SilenceCapture),
    };
    let session = spawn_service(&config, capture, PlayoutMeter::new().factory())?;
    let room = options.room_id.clone();
    session.start_host(options).await?;
    info!("Broadcasting into room {:?} (Ctrl+C to stop)", room);

    let mut status = session.host_status();
    loop {
        tokio::select! {
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = status.borrow_and_update().clone();
                match current.error {
                    Some(error) => warn!("{} ({})", current.message, error),
                    None => info!("{}", current.message),
                }
            }
            _ = signal::ctrl_c() => {
                info!("Shutting down...");
                break;
            }
        }
    }

    session.stop().await?;
    Ok(())
}

async fn run_listen(
    config: Config,
    options: ConnectClientOptions,
    output: ListenOutput,
) -> CliResult {
    let meter = PlayoutMeter::new();
    let sinks = match output {
        ListenOutput::Device => DeviceSink::factory(),
        ListenOutput::Meter => meter.factory(),
    };
    let metered = matches!(output, ListenOutput::Meter);
    let session = spawn_service(&config, Arc::new(SilenceCapture), sinks)?;
    session.connect_client(options).await?;

    let mut status = session.client_status();
    let mut report = tokio::time::interval(Duration::from_secs(5));
    loop {
        tokio::select! {
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                log_client_status(&mut status);
            }
            _ = report.tick(), if metered => {
                info!(
                    "Received {} bytes, {} audible",
                    meter.received_bytes(),
                    meter.audible_bytes()
                );
            }
            _ = signal::ctrl_c() => {
                info!("Shutting down...");
                break;
            }
        }
    }

    session.stop().await?;
    Ok(())
}

fn log_client_status(status: &mut watch::Receiver<wavecast_core::ClientSessionStatus>) {
    let current = status.borrow_and_update().clone();
    if let Some(error) = &current.error {
        warn!("{} ({})", current.message, error);
        return;
    }
    let latency = current
        .latency_ms
        .map(|ms| format!("{}ms", ms))
        .unwrap_or_else(|| "-".into());
    let jitter = current
        .jitter_ms
        .map(|ms| format!("{}ms", ms))
        .unwrap_or_else(|| "-".into());
    let bitrate = current
        .bitrate_kbps
        .map(|kbps| format!("{}kbps", kbps))
        .unwrap_or_else(|| "-".into());
    info!(
        "{} [rtt {} jitter {} bitrate {}]",
        current.message, latency, jitter, bitrate
    );
}

async fn run_udp_host(options: UdpHostOptions, input: UdpInput) -> CliResult {
    let audio = Arc::new(match input {
        UdpInput::Device => NativeAudio::devices(),
        UdpInput::Stdin => NativeAudio::stdio(),
    });
    audio.start_host(options)?;
    info!(
        "Streaming {:?} input in {} mode (Ctrl+C to stop)",
        input,
        audio.status().host_mode
    );

    signal::ctrl_c().await?;
    info!("Shutting down...");
    stop_native(audio).await;
    Ok(())
}

async fn run_udp_listen(options: UdpClientOptions, output: UdpOutput) -> CliResult {
    let audio = Arc::new(match output {
        UdpOutput::Device => NativeAudio::devices(),
        UdpOutput::Stdout => NativeAudio::stdio(),
    });
    audio.start_client(options)?;

    signal::ctrl_c().await?;
    info!("Shutting down...");
    if let Some(error) = audio.status().last_error {
        warn!("Last error: {}", error);
    }
    stop_native(audio).await;
    Ok(())
}

/// Stop both UDP workers; one stuck on a blocking read is left behind and
/// dies with the process when `main` returns
async fn stop_native(audio: Arc<NativeAudio>) {
    let joined = tokio::task::spawn_blocking(move || audio.shutdown(UDP_STOP_GRACE))
        .await
        .unwrap_or(false);
    if !joined {
        warn!("UDP worker did not stop in time");
    }
}
