//! Wavecast Daemon - Host broadcast and synchronized listening
//!
//! This crate provides:
//! - A host orchestrator that fans one captured audio track out to every client
//! - A client orchestrator that schedules playout against the host's clock
//! - A native UDP fallback that streams raw PCM without signaling
//! - Sound card capture and playout through cpal, Opus-coded for WebRTC
//!
//! # Architecture
//!
//! WebRTC callbacks and signaling frames arrive on their own tasks; everything
//! that touches session state is funneled into a single service task:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │          Callbacks (webrtc tasks, websocket reader)         │
//! │  ICE candidates, link state, remote tracks, sync frames     │
//! └─────────────────────────────┬───────────────────────────────┘
//!                               │ tokio mpsc
//!                               │ (tagged with link id / epoch)
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 AudioSessionService (task)                  │
//! │  - HostSession: peers, offers, clock beacons                │
//! │  - ClientSession: answer, offset window, start timer        │
//! │  - status published over tokio watch channels               │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Events from a closed link or an abandoned signaling socket carry a stale
//! tag and are dropped on arrival.

pub mod capture;
pub mod client;
pub mod device;
pub mod host;
pub mod native;
pub mod peer;
pub mod service;
pub mod signaling;
pub mod sink;

#[cfg(test)]
mod testing;

pub use capture::{capture_host_audio, CaptureDevice, MediaTrack, SilenceCapture, TrackKind};
pub use client::ClientSession;
pub use device::{DeviceCapture, DeviceCaptureBackend, DevicePlaybackBackend, DeviceSink};
pub use host::HostSession;
pub use native::{ClientOptions as UdpClientOptions, HostOptions as UdpHostOptions, NativeAudio};
pub use peer::{LinkState, PeerFactory, PeerLink, RtcPeerFactory, TransportStats};
pub use service::{
    AudioSessionService, ConnectClientOptions, SessionBackends, SessionHandle, StartHostOptions,
};
pub use signaling::SignalingClient;
pub use sink::{AudioSink, MeterSink, PlayoutMeter, SinkFactory};
