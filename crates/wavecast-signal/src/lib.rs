//! Wavecast Signal Server
//!
//! Lightweight signaling server for host discovery and WebRTC negotiation.
//! Peers connect via WebSocket and exchange JSON envelopes keyed by `type`.
//!
//! # Protocol
//!
//! 1. Server greets each connection with `welcome` and a `hosts-state` snapshot
//! 2. Peers announce themselves with `hello` (host, client or observer)
//! 3. Clients joining a room are announced to hosts with `peer-joined`
//! 4. Server relays `offer`/`answer`/`ice-candidate`/`sync-start` by peer id
//! 5. Audio then flows peer to peer; the signal connection stays for presence

pub mod messages;
pub mod registry;
pub mod server;

pub use messages::{Relay, SignalMessage};
pub use registry::{Delivery, PeerRegistry};
pub use server::{generate_peer_id, SignalServer};

pub use wavecast_core::DEFAULT_SIGNAL_PORT as DEFAULT_PORT;
