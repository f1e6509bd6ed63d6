//! Native UDP fallback
//!
//! A host streams raw PCM to an explicit list of addresses; a client
//! jitter-buffers one inbound stream. There is no signaling and no clock
//! synchronization on this path. Both sides run on dedicated threads since
//! capture and playback backends block. By default those backends are the
//! system's sound card through cpal; stdin/stdout stand in for piping raw PCM.

pub mod backend;
pub mod jitter;
pub mod receiver;
pub mod sender;

use std::net::{IpAddr, ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{info, warn};

use wavecast_core::{CaptureMode, NativeAudioStatus, NativeConfig, NativeError, PacketFormat};

use crate::device::{DeviceCaptureBackend, DevicePlaybackBackend};
use backend::{CaptureBackend, PcmCapture, PlaybackBackend};
pub use backend::{StdinCapture, StdoutPlayback};
pub use jitter::JitterBuffer;

/// Receive timeout so a stop request is noticed
const RECV_TIMEOUT: Duration = Duration::from_secs(1);

/// How often a bounded shutdown checks whether a worker has exited
const JOIN_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
pub struct HostOptions {
    pub peers: Vec<String>,
    pub port: u16,
    pub sample_rate: u32,
    pub channels: u16,
    pub frame_size: u16,
    pub capture_mode: CaptureMode,
}

impl HostOptions {
    pub fn from_config(config: &NativeConfig, peers: Vec<String>, capture_mode: CaptureMode) -> Self {
        Self {
            peers,
            port: config.port,
            sample_rate: config.sample_rate,
            channels: config.channels,
            frame_size: config.frame_size,
            capture_mode,
        }
    }

    fn format(&self) -> PacketFormat {
        PacketFormat {
            sample_rate: self.sample_rate,
            channels: self.channels.clamp(1, 2),
            frame_size: self.frame_size,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Accept packets from this host only
    pub host_address: Option<String>,
    pub port: u16,
    pub jitter_frames: usize,
    pub sample_rate: u32,
    pub channels: u16,
    pub frame_size: u16,
}

impl ClientOptions {
    pub fn from_config(config: &NativeConfig, host_address: Option<String>) -> Self {
        Self {
            host_address,
            port: config.port,
            jitter_frames: config.jitter_frames,
            sample_rate: config.sample_rate,
            channels: config.channels,
            frame_size: config.frame_size,
        }
    }

    fn format(&self) -> PacketFormat {
        PacketFormat {
            sample_rate: self.sample_rate,
            channels: self.channels.clamp(1, 2),
            frame_size: self.frame_size,
        }
    }
}

struct Worker {
    stop: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

impl Worker {
    /// Signal stop and join. With a grace period the thread is detached if it
    /// has not exited by then; returns false in that case.
    fn shutdown(self, grace: Option<Duration>) -> bool {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(grace) = grace {
            let deadline = Instant::now() + grace;
            while !self.thread.is_finished() {
                if Instant::now() >= deadline {
                    warn!(
                        "UDP worker {:?} still busy after {:?}, detaching",
                        self.thread.thread().name(),
                        grace
                    );
                    return false;
                }
                thread::sleep(JOIN_POLL);
            }
        }
        if self.thread.join().is_err() {
            warn!("UDP worker thread panicked");
        }
        true
    }
}

/// Native UDP audio runtime
pub struct NativeAudio {
    capture: Arc<dyn CaptureBackend>,
    playback: Arc<dyn PlaybackBackend>,
    status: Arc<Mutex<NativeAudioStatus>>,
    host: Mutex<Option<Worker>>,
    client: Mutex<Option<Worker>>,
}

impl NativeAudio {
    pub fn new(capture: Arc<dyn CaptureBackend>, playback: Arc<dyn PlaybackBackend>) -> Self {
        let status = NativeAudioStatus {
            capture_permission: capture.has_permission(),
            ..NativeAudioStatus::default()
        };
        Self {
            capture,
            playback,
            status: Arc::new(Mutex::new(status)),
            host: Mutex::new(None),
            client: Mutex::new(None),
        }
    }

    /// Default input and output devices
    pub fn devices() -> Self {
        Self::new(
            Arc::new(DeviceCaptureBackend),
            Arc::new(DevicePlaybackBackend),
        )
    }

    /// Stdin capture and stdout playback
    pub fn stdio() -> Self {
        Self::new(Arc::new(StdinCapture), Arc::new(StdoutPlayback))
    }

    pub fn request_capture_permission(&self) -> bool {
        let granted = self.capture.request_permission();
        self.status.lock().capture_permission = granted;
        granted
    }

    pub fn status(&self) -> NativeAudioStatus {
        self.status.lock().clone()
    }

    fn record(&self, err: NativeError) -> NativeError {
        self.status.lock().last_error = Some(err.to_string());
        err
    }

    fn open_capture(
        &self,
        mode: CaptureMode,
        format: &PacketFormat,
    ) -> Result<(&'static str, Box<dyn PcmCapture>), NativeError> {
        match mode {
            CaptureMode::Playback => match self.capture.open_playback(format) {
                Some(capture) => Ok(("playback", capture?)),
                None => Err(NativeError::PlaybackUnavailable),
            },
            CaptureMode::Microphone => Ok(("microphone", self.capture.open_microphone(format)?)),
            CaptureMode::Auto => match self.capture.open_playback(format) {
                Some(Ok(capture)) => Ok(("playback", capture)),
                Some(Err(e)) => {
                    warn!("Playback capture failed, using microphone: {}", e);
                    Ok(("microphone", self.capture.open_microphone(format)?))
                }
                None => Ok(("microphone", self.capture.open_microphone(format)?)),
            },
        }
    }

    /// Start streaming to every resolvable peer; replaces a running sender
    pub fn start_host(&self, options: HostOptions) -> Result<(), NativeError> {
        self.stop_host();

        let targets = sender::resolve_peers(&options.peers, options.port);
        if targets.is_empty() {
            return Err(self.record(NativeError::NoPeers));
        }

        let format = options.format();
        let (mode, capture) = self
            .open_capture(options.capture_mode, &format)
            .map_err(|e| self.record(e))?;
        let socket = UdpSocket::bind(("0.0.0.0", 0)).map_err(|e| self.record(e.into()))?;

        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();
        let status = self.status.clone();
        let thread = thread::Builder::new()
            .name("wavecast-udp-host".into())
            .spawn(move || {
                if let Err(e) = sender::run(socket, targets, format, capture, thread_stop) {
                    warn!("UDP sender failed: {}", e);
                    let mut status = status.lock();
                    status.last_error = Some(e.to_string());
                    status.host_running = false;
                    status.host_mode = "idle".into();
                }
            })
            .map_err(|e| self.record(e.into()))?;

        {
            let mut status = self.status.lock();
            status.host_running = true;
            status.host_mode = mode.into();
            status.last_error = None;
        }
        *self.host.lock() = Some(Worker { stop, thread });
        info!("UDP host started in {} mode", mode);
        Ok(())
    }

    pub fn stop_host(&self) {
        self.halt_host(None);
    }

    fn halt_host(&self, grace: Option<Duration>) -> bool {
        let worker = self.host.lock().take();
        let joined = match worker {
            Some(worker) => {
                let joined = worker.shutdown(grace);
                info!("UDP host stopped");
                joined
            }
            None => true,
        };
        let mut status = self.status.lock();
        status.host_running = false;
        status.host_mode = "idle".into();
        joined
    }

    /// Start receiving on `options.port`; replaces a running receiver
    pub fn start_client(&self, options: ClientOptions) -> Result<(), NativeError> {
        self.stop_client();

        let host = options.host_address.as_deref().and_then(resolve_host);
        let format = options.format();

        let socket = UdpSocket::bind(("0.0.0.0", options.port)).map_err(|e| self.record(e.into()))?;
        socket
            .set_read_timeout(Some(RECV_TIMEOUT))
            .map_err(|e| self.record(e.into()))?;
        let playback = self.playback.open(&format).map_err(|e| self.record(e))?;

        let receiver = receiver::Receiver {
            socket,
            host,
            format,
            playback,
            backend: self.playback.clone(),
            jitter: JitterBuffer::new(options.jitter_frames),
            status: self.status.clone(),
        };

        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();
        let status = self.status.clone();
        let thread = thread::Builder::new()
            .name("wavecast-udp-client".into())
            .spawn(move || {
                if let Err(e) = receiver.run(thread_stop) {
                    warn!("UDP receiver failed: {}", e);
                    let mut status = status.lock();
                    status.last_error = Some(e.to_string());
                    status.client_running = false;
                }
            })
            .map_err(|e| self.record(e.into()))?;

        {
            let mut status = self.status.lock();
            status.client_running = true;
            status.last_error = None;
        }
        *self.client.lock() = Some(Worker { stop, thread });
        info!("UDP client listening on port {}", options.port);
        Ok(())
    }

    pub fn stop_client(&self) {
        self.halt_client(None);
    }

    fn halt_client(&self, grace: Option<Duration>) -> bool {
        let worker = self.client.lock().take();
        let joined = match worker {
            Some(worker) => {
                let joined = worker.shutdown(grace);
                info!("UDP client stopped");
                joined
            }
            None => true,
        };
        self.status.lock().client_running = false;
        joined
    }

    /// Stop both workers, giving each at most `grace` to exit
    ///
    /// A worker stuck in a blocking read is detached rather than joined.
    /// Returns true if every worker was joined.
    pub fn shutdown(&self, grace: Duration) -> bool {
        let host = self.halt_host(Some(grace));
        let client = self.halt_client(Some(grace));
        host && client
    }
}

impl Default for NativeAudio {
    fn default() -> Self {
        Self::devices()
    }
}

impl Drop for NativeAudio {
    fn drop(&mut self) {
        self.stop_host();
        self.stop_client();
    }
}

fn resolve_host(address: &str) -> Option<IpAddr> {
    let address = address.trim();
    if address.is_empty() {
        return None;
    }
    if let Ok(ip) = address.parse::<IpAddr>() {
        return Some(ip);
    }
    match (address, 0).to_socket_addrs().ok().and_then(|mut a| a.next()) {
        Some(addr) => Some(addr.ip()),
        None => {
            warn!("Cannot resolve host {:?}, accepting any sender", address);
            None
        }
    }
}
