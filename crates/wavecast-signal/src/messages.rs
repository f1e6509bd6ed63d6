//! Signal protocol messages
//!
//! Every envelope is a JSON object keyed by `type`. Relay messages (`offer`,
//! `answer`, `ice-candidate`, `sync-start`) are opaque to the server apart from
//! their `to`/`from` fields.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use wavecast_core::{HostEntry, IceCandidate, PeerRole, ProtocolError, SessionDescription};

/// Every `type` the protocol knows about
pub const MESSAGE_TYPES: &[&str] = &[
    "hello",
    "hello-ack",
    "hosts-request",
    "hosts-state",
    "host-meta-update",
    "offer",
    "answer",
    "ice-candidate",
    "sync-start",
    "peer-joined",
    "peer-left",
    "ping",
    "pong",
    "error",
    "welcome",
];

/// Messages sent over the signaling WebSocket
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalMessage {
    /// Peer announces its role
    Hello(Hello),

    /// Server confirms a `hello`
    HelloAck(HelloAck),

    /// Ask for a `hosts-state` snapshot
    HostsRequest,

    /// Current set of hosts
    HostsState(HostsState),

    /// Host renames itself or moves room
    HostMetaUpdate(HostMetaUpdate),

    Offer(Relay),
    Answer(Relay),
    IceCandidate(Relay),
    SyncStart(Relay),

    /// A client wants this host
    PeerJoined(PeerJoined),

    /// A client went away
    PeerLeft(PeerLeft),

    Ping,
    Pong(Pong),
    Error(ErrorMessage),

    /// First message on every connection
    Welcome(Welcome),
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hello {
    #[serde(default)]
    pub role: Option<PeerRole>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_host_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloAck {
    pub client_id: String,
    pub role: PeerRole,
    pub room_id: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostsState {
    pub hosts: Vec<HostEntry>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostMetaUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub room_id: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
}

/// Relayed payload; everything besides `to`/`from` is forwarded untouched
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Relay {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(flatten)]
    pub body: Map<String, Value>,
}

impl Relay {
    pub fn to(peer_id: impl Into<String>) -> Self {
        Self {
            to: Some(peer_id.into()),
            ..Self::default()
        }
    }

    /// Relay carrying `sdp`
    pub fn with_sdp(peer_id: impl Into<String>, sdp: &SessionDescription) -> Self {
        let mut relay = Self::to(peer_id);
        if let Ok(value) = serde_json::to_value(sdp) {
            relay.body.insert("sdp".into(), value);
        }
        relay
    }

    /// Relay carrying `candidate`
    pub fn with_candidate(peer_id: impl Into<String>, candidate: &IceCandidate) -> Self {
        let mut relay = Self::to(peer_id);
        if let Ok(value) = serde_json::to_value(candidate) {
            relay.body.insert("candidate".into(), value);
        }
        relay
    }

    pub fn sdp(&self) -> Option<SessionDescription> {
        self.body
            .get("sdp")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn candidate(&self) -> Option<IceCandidate> {
        self.body
            .get("candidate")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Trimmed sender id, if any
    pub fn sender(&self) -> Option<String> {
        wavecast_core::normalize_optional(self.from.as_deref())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerJoined {
    pub peer_id: String,
    pub room_id: String,
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerLeft {
    pub peer_id: String,
    pub room_id: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pong {
    pub now: i64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub message: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Welcome {
    pub client_id: String,
    pub now: i64,
    pub remote_address: String,
}

impl SignalMessage {
    /// Create an error message
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error(ErrorMessage {
            message: message.into(),
        })
    }

    /// Wire name of this message
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Hello(_) => "hello",
            Self::HelloAck(_) => "hello-ack",
            Self::HostsRequest => "hosts-request",
            Self::HostsState(_) => "hosts-state",
            Self::HostMetaUpdate(_) => "host-meta-update",
            Self::Offer(_) => "offer",
            Self::Answer(_) => "answer",
            Self::IceCandidate(_) => "ice-candidate",
            Self::SyncStart(_) => "sync-start",
            Self::PeerJoined(_) => "peer-joined",
            Self::PeerLeft(_) => "peer-left",
            Self::Ping => "ping",
            Self::Pong(_) => "pong",
            Self::Error(_) => "error",
            Self::Welcome(_) => "welcome",
        }
    }

    /// Parse an envelope, classifying failures the way peers are told about them
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(text).map_err(|_| ProtocolError::InvalidJson)?;
        if value.is_null() {
            return Err(ProtocolError::InvalidJson);
        }

        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or(ProtocolError::MissingType)?
            .to_string();

        if !MESSAGE_TYPES.contains(&kind.as_str()) {
            return Err(ProtocolError::UnsupportedType(kind));
        }

        serde_json::from_value(value).map_err(|e| ProtocolError::InvalidPayload {
            kind,
            reason: e.to_string(),
        })
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
