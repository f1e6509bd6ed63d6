//! Core types for Wavecast sessions

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Role a signaling peer announces in `hello`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerRole {
    Host,
    Client,
    /// Also the fallback for unknown role strings
    #[default]
    #[serde(other)]
    Observer,
}

impl PeerRole {
    pub fn as_str(self) -> &'static str {
        match self {
            PeerRole::Host => "host",
            PeerRole::Client => "client",
            PeerRole::Observer => "observer",
        }
    }
}

impl fmt::Display for PeerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One host as listed in a `hosts-state` envelope
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostEntry {
    pub id: String,
    pub room_id: String,
    pub name: String,
    pub address: Option<String>,
    pub transport: String,
    /// Last activity, epoch milliseconds
    pub updated_at: i64,
    pub age_ms: i64,
}

/// Client-visible projection of a host entry
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiscoveredHost {
    pub id: String,
    pub room_id: String,
    pub name: String,
    pub address: Option<String>,
    pub transport: String,
    pub updated_at: DateTime<Utc>,
}

impl From<HostEntry> for DiscoveredHost {
    fn from(entry: HostEntry) -> Self {
        Self {
            updated_at: DateTime::from_timestamp_millis(entry.updated_at).unwrap_or_else(Utc::now),
            id: entry.id,
            room_id: entry.room_id,
            name: entry.name,
            address: entry.address,
            transport: entry.transport,
        }
    }
}

/// Host orchestrator lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HostState {
    Idle,
    Starting,
    Streaming,
    Error,
}

/// Client orchestrator lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClientState {
    Idle,
    Connecting,
    Syncing,
    Connected,
    Error,
}

/// Status published by the host orchestrator
#[derive(Clone, Debug, PartialEq)]
pub struct HostSessionStatus {
    pub state: HostState,
    /// Peers whose transport is connected or connecting
    pub peer_count: usize,
    pub bitrate_kbps: Option<u32>,
    pub message: String,
    pub error: Option<String>,
}

impl HostSessionStatus {
    pub fn idle() -> Self {
        Self {
            state: HostState::Idle,
            peer_count: 0,
            bitrate_kbps: None,
            message: "Host idle.".into(),
            error: None,
        }
    }
}

impl Default for HostSessionStatus {
    fn default() -> Self {
        Self::idle()
    }
}

/// Status published by the client orchestrator
#[derive(Clone, Debug, PartialEq)]
pub struct ClientSessionStatus {
    pub state: ClientState,
    pub host_id: Option<String>,
    pub latency_ms: Option<u32>,
    pub jitter_ms: Option<u32>,
    pub bitrate_kbps: Option<u32>,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub message: String,
    pub error: Option<String>,
}

impl ClientSessionStatus {
    pub fn idle() -> Self {
        Self {
            state: ClientState::Idle,
            host_id: None,
            latency_ms: None,
            jitter_ms: None,
            bitrate_kbps: None,
            last_sync_at: None,
            message: "Client idle.".into(),
            error: None,
        }
    }
}

impl Default for ClientSessionStatus {
    fn default() -> Self {
        Self::idle()
    }
}

/// Where the host takes its audio from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureSource {
    /// Screen or tab share; must carry an audio track
    Display,
    Microphone,
}

impl FromStr for CaptureSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "display" => Ok(CaptureSource::Display),
            "microphone" | "mic" => Ok(CaptureSource::Microphone),
            other => Err(format!("unknown capture source: {}", other)),
        }
    }
}

/// SDP kind as carried on the wire
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Pranswer,
    Answer,
    Rollback,
}

/// Session description in browser JSON shape (`{type, sdp}`)
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate in browser JSON shape
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
    #[serde(rename = "usernameFragment", default)]
    pub username_fragment: Option<String>,
}

/// Capture preference for the native UDP host
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureMode {
    /// Playback capture, falling back to the microphone
    #[default]
    Auto,
    Playback,
    Microphone,
}

impl FromStr for CaptureMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "auto" => Ok(CaptureMode::Auto),
            "playback" => Ok(CaptureMode::Playback),
            "microphone" | "mic" => Ok(CaptureMode::Microphone),
            other => Err(format!("unknown capture mode: {}", other)),
        }
    }
}

/// Native UDP runtime status
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NativeAudioStatus {
    pub host_running: bool,
    pub client_running: bool,
    /// `idle`, `playback` or `microphone`
    pub host_mode: String,
    pub last_error: Option<String>,
    pub capture_permission: bool,
}

impl Default for NativeAudioStatus {
    fn default() -> Self {
        Self {
            host_running: false,
            client_running: false,
            host_mode: "idle".into(),
            last_error: None,
            capture_permission: false,
        }
    }
}
