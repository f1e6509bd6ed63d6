//! Error types for Wavecast
//!
//! The `Display` text of [`ProtocolError`] is what the signaling server sends back
//! in `error` envelopes, so it is phrased for the remote peer.

use thiserror::Error;

/// Signaling envelope errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Invalid JSON payload.")]
    InvalidJson,

    #[error("Missing \"type\" field.")]
    MissingType,

    #[error("Unsupported message type \"{0}\".")]
    UnsupportedType(String),

    #[error("Malformed \"{kind}\" message: {reason}")]
    InvalidPayload { kind: String, reason: String },

    #[error("Message \"{0}\" is missing \"to\".")]
    MissingTarget(String),

    #[error("Target \"{0}\" is not connected.")]
    TargetNotConnected(String),

    #[error("Only hosts can send host-meta-update.")]
    NotAHost,
}

/// Session orchestrator errors
///
/// Teardown never produces one of these; close failures are logged and dropped.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Socket never opened or closed before the handshake
    #[error("{0}")]
    SignalingUnavailable(String),

    /// Permission refused, or the capture has no audio track
    #[error("{0}")]
    CaptureDenied(String),

    /// SDP or ICE negotiation failed
    #[error("negotiation failed: {0}")]
    NegotiationFailure(String),

    /// Relay target not connected
    #[error("peer unreachable: {0}")]
    PeerUnreachable(String),

    /// The session service task has exited
    #[error("session service stopped")]
    ServiceStopped,
}

/// Native UDP fallback errors
#[derive(Error, Debug)]
pub enum NativeError {
    #[error("No valid peer addresses configured for host sender.")]
    NoPeers,

    #[error("Playback capture is unavailable. Use Auto mode to allow microphone fallback.")]
    PlaybackUnavailable,

    #[error("Unable to initialize audio recorder: {0}")]
    Recorder(String),

    #[error("Unable to open audio output: {0}")]
    Playback(String),

    #[error("{0} is already running")]
    AlreadyRunning(&'static str),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
