//! Wavecast Core - Shared types, clock synchronization and packet codec
//!
//! This crate contains the foundational types used across all Wavecast components.
//! It has no dependencies on networking code.

pub mod clock;
pub mod config;
pub mod error;
pub mod packet;
pub mod types;

pub use clock::{ClockOffsetWindow, SyncMessage};
pub use config::{Config, NativeConfig, SessionConfig, SignalConfig};
pub use error::*;
pub use packet::{AudioPacket, PacketError, PacketFormat};
pub use types::*;

/// Room used when a peer does not name one
pub const DEFAULT_ROOM: &str = "default-room";

/// Default signaling server port
pub const DEFAULT_SIGNAL_PORT: u16 = 8787;

/// Default signaling URL used by the session orchestrators
pub const DEFAULT_SIGNAL_URL: &str = "ws://localhost:8787";

/// Transport label advertised for every discovered host
pub const WEBRTC_TRANSPORT: &str = "webrtc";

/// Label of the host-opened clock/sync data channel
pub const SYNC_CHANNEL_LABEL: &str = "stream-sync";

/// Default STUN server
pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

/// Wall-clock time in epoch milliseconds
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Trim an optional string, treating blank input as absent
pub fn normalize_optional(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Trim a string, falling back when blank
pub fn normalize_or(value: &str, fallback: &str) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        fallback.to_string()
    } else {
        trimmed.to_string()
    }
}
