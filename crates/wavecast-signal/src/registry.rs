//! Peer registry for the signal server
//!
//! The registry is plain data: every operation takes the current time and
//! returns the messages that must go out as a result. The server's hub task
//! owns the only instance and performs the actual sends.

use std::collections::HashMap;

use tracing::{debug, info};

use wavecast_core::{
    normalize_optional, HostEntry, PeerRole, ProtocolError, DEFAULT_ROOM, WEBRTC_TRANSPORT,
};

use crate::messages::{
    HelloAck, HostsState, PeerJoined, PeerLeft, Pong, Relay, SignalMessage, Welcome,
};

/// A connected peer
#[derive(Clone, Debug)]
pub struct Peer {
    pub id: String,
    pub role: PeerRole,
    pub room_id: Option<String>,
    pub name: String,
    pub target_host_id: Option<String>,
    pub address: Option<String>,
    pub remote_address: String,
    /// Epoch milliseconds of the last message or pong
    pub last_seen_at: i64,
    /// Cleared by each heartbeat, set again by a pong
    pub alive: bool,
    joined: u64,
}

/// One message addressed to one peer
#[derive(Clone, Debug, PartialEq)]
pub struct Delivery {
    pub to: String,
    pub message: SignalMessage,
}

impl Delivery {
    fn new(to: &str, message: SignalMessage) -> Self {
        Self {
            to: to.to_string(),
            message,
        }
    }
}

/// Outcome of one heartbeat sweep
#[derive(Debug, Default)]
pub struct Sweep {
    /// Peers that missed the previous ping and were removed
    pub expired: Vec<String>,
    /// Peers to ping now
    pub ping: Vec<String>,
    /// Departure notifications for the expired peers
    pub deliveries: Vec<Delivery>,
}

#[derive(Default)]
pub struct PeerRegistry {
    peers: HashMap<String, Peer>,
    next_join: u64,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn host_count(&self) -> usize {
        self.peers
            .values()
            .filter(|p| p.role == PeerRole::Host)
            .count()
    }

    pub fn get(&self, peer_id: &str) -> Option<&Peer> {
        self.peers.get(peer_id)
    }

    pub fn contains(&self, peer_id: &str) -> bool {
        self.peers.contains_key(peer_id)
    }

    pub fn clear(&mut self) {
        self.peers.clear();
    }

    /// Register a new connection as an observer and greet it
    pub fn connect(&mut self, peer_id: &str, remote_address: &str, now: i64) -> Vec<Delivery> {
        self.next_join += 1;
        self.peers.insert(
            peer_id.to_string(),
            Peer {
                id: peer_id.to_string(),
                role: PeerRole::Observer,
                room_id: None,
                name: format!("peer-{}", short_id(peer_id)),
                target_host_id: None,
                address: None,
                remote_address: remote_address.to_string(),
                last_seen_at: now,
                alive: true,
                joined: self.next_join,
            },
        );
        debug!("Peer {} connected from {}", peer_id, remote_address);

        vec![
            Delivery::new(
                peer_id,
                SignalMessage::Welcome(Welcome {
                    client_id: peer_id.to_string(),
                    now,
                    remote_address: remote_address.to_string(),
                }),
            ),
            Delivery::new(peer_id, self.hosts_state(now)),
        ]
    }

    /// A transport-level pong arrived
    pub fn pong(&mut self, peer_id: &str, now: i64) {
        if let Some(peer) = self.peers.get_mut(peer_id) {
            peer.alive = true;
            peer.last_seen_at = now;
        }
    }

    /// Handle one raw text frame from `peer_id`
    pub fn handle_text(&mut self, peer_id: &str, text: &str, now: i64) -> Vec<Delivery> {
        if !self.peers.contains_key(peer_id) {
            return Vec::new();
        }
        match SignalMessage::parse(text) {
            Ok(msg) => self.handle(peer_id, msg, now),
            Err(e) => {
                debug!("Rejected message from {}: {}", peer_id, e);
                vec![Delivery::new(peer_id, SignalMessage::error(e.to_string()))]
            }
        }
    }

    /// Handle one parsed message from `peer_id`
    pub fn handle(&mut self, peer_id: &str, msg: SignalMessage, now: i64) -> Vec<Delivery> {
        let Some(peer) = self.peers.get_mut(peer_id) else {
            return Vec::new();
        };
        peer.last_seen_at = now;

        let result = match msg {
            SignalMessage::Hello(hello) => {
                let role = hello.role.unwrap_or_default();
                let room_id = normalize_optional(hello.room_id.as_deref())
                    .unwrap_or_else(|| DEFAULT_ROOM.to_string());
                peer.role = role;
                peer.room_id = Some(room_id.clone());
                peer.name = normalize_optional(hello.name.as_deref())
                    .unwrap_or_else(|| format!("{}-{}", role, short_id(peer_id)));
                peer.target_host_id = normalize_optional(hello.target_host_id.as_deref());
                peer.address = normalize_optional(hello.address.as_deref());
                info!("Peer {} is {} in room {}", peer_id, role, room_id);

                let mut out = Vec::new();
                if role == PeerRole::Client {
                    out.extend(self.notify_client_join(peer_id));
                }
                out.extend(self.broadcast_hosts_state(now));
                out.push(Delivery::new(
                    peer_id,
                    SignalMessage::HelloAck(HelloAck {
                        client_id: peer_id.to_string(),
                        role,
                        room_id,
                    }),
                ));
                Ok(out)
            }

            SignalMessage::HostsRequest => {
                Ok(vec![Delivery::new(peer_id, self.hosts_state(now))])
            }

            SignalMessage::HostMetaUpdate(update) => {
                if peer.role != PeerRole::Host {
                    Err(ProtocolError::NotAHost)
                } else {
                    if let Some(name) = normalize_optional(update.name.as_deref()) {
                        peer.name = name;
                    }
                    if let Some(room_id) = normalize_optional(update.room_id.as_deref()) {
                        peer.room_id = Some(room_id);
                    }
                    if let Some(address) = normalize_optional(update.address.as_deref()) {
                        peer.address = Some(address);
                    }
                    Ok(self.broadcast_hosts_state(now))
                }
            }

            SignalMessage::Offer(relay) => self.forward(peer_id, relay, SignalMessage::Offer),
            SignalMessage::Answer(relay) => self.forward(peer_id, relay, SignalMessage::Answer),
            SignalMessage::IceCandidate(relay) => {
                self.forward(peer_id, relay, SignalMessage::IceCandidate)
            }
            SignalMessage::SyncStart(relay) => {
                self.forward(peer_id, relay, SignalMessage::SyncStart)
            }

            SignalMessage::Ping => Ok(vec![Delivery::new(
                peer_id,
                SignalMessage::Pong(Pong { now }),
            )]),

            // Server-to-peer messages are not accepted from peers
            other => Err(ProtocolError::UnsupportedType(other.kind().to_string())),
        };

        result.unwrap_or_else(|e| vec![Delivery::new(peer_id, SignalMessage::error(e.to_string()))])
    }

    /// Remove a peer and produce its departure notifications
    pub fn disconnect(&mut self, peer_id: &str, now: i64) -> Vec<Delivery> {
        let Some(departing) = self.peers.remove(peer_id) else {
            return Vec::new();
        };
        info!("Peer {} ({}) disconnected", peer_id, departing.role);

        let mut out = Vec::new();
        if departing.role == PeerRole::Host {
            out.extend(self.broadcast_hosts_state(now));
        }

        if departing.role == PeerRole::Client {
            if let Some(room_id) = departing.room_id.as_deref() {
                let left = SignalMessage::PeerLeft(PeerLeft {
                    peer_id: peer_id.to_string(),
                    room_id: room_id.to_string(),
                });
                match departing.target_host_id.as_deref() {
                    Some(target) => {
                        if self.is_host(target) {
                            out.push(Delivery::new(target, left));
                        }
                    }
                    None => {
                        for host in self.hosts_in_room(room_id) {
                            out.push(Delivery::new(&host, left.clone()));
                        }
                    }
                }
            }
        }
        out
    }

    /// Heartbeat: drop peers that stayed silent since the last sweep, ping the rest
    pub fn sweep(&mut self, now: i64) -> Sweep {
        let mut sweep = Sweep::default();
        let mut ids: Vec<(u64, String)> = self
            .peers
            .values()
            .map(|p| (p.joined, p.id.clone()))
            .collect();
        ids.sort();

        for (_, id) in ids {
            let Some(peer) = self.peers.get_mut(&id) else {
                continue;
            };
            if peer.alive {
                peer.alive = false;
                sweep.ping.push(id);
            } else {
                debug!("Peer {} missed heartbeat", id);
                sweep.deliveries.extend(self.disconnect(&id, now));
                sweep.expired.push(id);
            }
        }
        sweep
    }

    /// Every host peer, in connection order
    pub fn collect_hosts(&self, now: i64) -> Vec<HostEntry> {
        let mut hosts: Vec<&Peer> = self
            .peers
            .values()
            .filter(|p| p.role == PeerRole::Host)
            .collect();
        hosts.sort_by_key(|p| p.joined);

        hosts
            .into_iter()
            .map(|p| HostEntry {
                id: p.id.clone(),
                room_id: p.room_id.clone().unwrap_or_else(|| DEFAULT_ROOM.to_string()),
                name: p.name.clone(),
                address: p.address.clone(),
                transport: WEBRTC_TRANSPORT.to_string(),
                updated_at: p.last_seen_at,
                age_ms: (now - p.last_seen_at).max(0),
            })
            .collect()
    }

    fn hosts_state(&self, now: i64) -> SignalMessage {
        SignalMessage::HostsState(HostsState {
            hosts: self.collect_hosts(now),
        })
    }

    fn broadcast_hosts_state(&self, now: i64) -> Vec<Delivery> {
        let state = self.hosts_state(now);
        let mut ids: Vec<&Peer> = self.peers.values().collect();
        ids.sort_by_key(|p| p.joined);
        ids.into_iter()
            .map(|p| Delivery::new(&p.id, state.clone()))
            .collect()
    }

    fn is_host(&self, peer_id: &str) -> bool {
        self.peers
            .get(peer_id)
            .is_some_and(|p| p.role == PeerRole::Host)
    }

    fn hosts_in_room(&self, room_id: &str) -> Vec<String> {
        let mut hosts: Vec<&Peer> = self
            .peers
            .values()
            .filter(|p| p.role == PeerRole::Host && p.room_id.as_deref() == Some(room_id))
            .collect();
        hosts.sort_by_key(|p| p.joined);
        hosts.into_iter().map(|p| p.id.clone()).collect()
    }

    fn notify_client_join(&self, client_id: &str) -> Vec<Delivery> {
        let Some(client) = self.peers.get(client_id) else {
            return Vec::new();
        };
        let Some(room_id) = client.room_id.clone() else {
            return Vec::new();
        };
        let joined = SignalMessage::PeerJoined(PeerJoined {
            peer_id: client_id.to_string(),
            room_id: room_id.clone(),
            name: client.name.clone(),
        });

        if let Some(target) = client.target_host_id.as_deref() {
            if self.is_host(target) {
                return vec![Delivery::new(target, joined)];
            }
        }

        self.hosts_in_room(&room_id)
            .into_iter()
            .filter(|id| id != client_id)
            .map(|id| Delivery::new(&id, joined.clone()))
            .collect()
    }

    fn forward(
        &self,
        sender: &str,
        relay: Relay,
        wrap: fn(Relay) -> SignalMessage,
    ) -> Result<Vec<Delivery>, ProtocolError> {
        let kind = wrap(Relay::default()).kind();
        let to = normalize_optional(relay.to.as_deref())
            .ok_or_else(|| ProtocolError::MissingTarget(kind.to_string()))?;

        if !self.peers.contains_key(&to) {
            return Err(ProtocolError::TargetNotConnected(to));
        }

        let forwarded = wrap(Relay {
            from: Some(sender.to_string()),
            ..relay
        });
        Ok(vec![Delivery::new(&to, forwarded)])
    }
}

fn short_id(peer_id: &str) -> &str {
    peer_id.get(..8).unwrap_or(peer_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{Hello, HostMetaUpdate};

    fn hello(role: PeerRole, room: &str) -> SignalMessage {
        SignalMessage::Hello(Hello {
            role: Some(role),
            room_id: Some(room.into()),
            ..Hello::default()
        })
    }

    fn to<'a>(out: &'a [Delivery], peer: &str) -> Vec<&'a SignalMessage> {
        out.iter()
            .filter(|d| d.to == peer)
            .map(|d| &d.message)
            .collect()
    }

    fn host_ids(msg: &SignalMessage) -> Vec<String> {
        match msg {
            SignalMessage::HostsState(state) => state.hosts.iter().map(|h| h.id.clone()).collect(),
            other => panic!("expected hosts-state, got {:?}", other),
        }
    }

    #[test]
    fn test_connect_greets_peer() {
        let mut registry = PeerRegistry::new();
        let out = registry.connect("aaaaaaaa1111", "127.0.0.1", 1000);

        assert_eq!(out.len(), 2);
        assert_eq!(
            out[0].message,
            SignalMessage::Welcome(Welcome {
                client_id: "aaaaaaaa1111".into(),
                now: 1000,
                remote_address: "127.0.0.1".into(),
            })
        );
        assert!(host_ids(&out[1].message).is_empty());
        assert_eq!(registry.get("aaaaaaaa1111").unwrap().name, "peer-aaaaaaaa");
        assert_eq!(registry.get("aaaaaaaa1111").unwrap().role, PeerRole::Observer);
    }

    #[test]
    fn test_hello_broadcasts_host_set() {
        let mut registry = PeerRegistry::new();
        registry.connect("h1", "a", 0);
        registry.connect("h2", "a", 0);
        registry.connect("o1", "a", 0);

        registry.handle("h1", hello(PeerRole::Host, "r"), 10);
        let out = registry.handle("h2", hello(PeerRole::Host, "r"), 20);

        for peer in ["h1", "h2", "o1"] {
            let msgs = to(&out, peer);
            assert_eq!(host_ids(msgs[0]), vec!["h1", "h2"]);
        }
        // hello-ack comes after the rebroadcast
        let acks = to(&out, "h2");
        assert!(matches!(acks.last(), Some(SignalMessage::HelloAck(ack)) if ack.room_id == "r"));

        // Demoting a host removes it from the next snapshot
        let out = registry.handle("h1", hello(PeerRole::Observer, "r"), 30);
        assert_eq!(host_ids(to(&out, "o1")[0]), vec!["h2"]);
    }

    #[test]
    fn test_hello_defaults() {
        let mut registry = PeerRegistry::new();
        registry.connect("abcdef0123456789", "a", 0);
        let out = registry.handle(
            "abcdef0123456789",
            SignalMessage::Hello(Hello {
                role: Some(PeerRole::Host),
                room_id: Some("   ".into()),
                ..Hello::default()
            }),
            5,
        );

        let peer = registry.get("abcdef0123456789").unwrap();
        assert_eq!(peer.room_id.as_deref(), Some(DEFAULT_ROOM));
        assert_eq!(peer.name, "host-abcdef01");
        let SignalMessage::HostsState(state) = to(&out, "abcdef0123456789")[0] else {
            panic!("expected hosts-state");
        };
        assert_eq!(state.hosts[0].transport, "webrtc");
        assert_eq!(state.hosts[0].updated_at, 5);
    }

    #[test]
    fn test_host_departure_rebroadcasts() {
        let mut registry = PeerRegistry::new();
        registry.connect("h1", "a", 0);
        registry.connect("h2", "a", 0);
        registry.connect("c1", "a", 0);
        registry.handle("h1", hello(PeerRole::Host, "r"), 0);
        registry.handle("h2", hello(PeerRole::Host, "r"), 0);

        let out = registry.disconnect("h1", 50);
        assert_eq!(host_ids(to(&out, "h2")[0]), vec!["h2"]);
        assert_eq!(host_ids(to(&out, "c1")[0]), vec!["h2"]);
        assert!(to(&out, "h1").is_empty());
        assert_eq!(registry.host_count(), 1);

        // Second disconnect is a no-op
        assert!(registry.disconnect("h1", 60).is_empty());
    }

    #[test]
    fn test_targeted_client_join() {
        let mut registry = PeerRegistry::new();
        registry.connect("h1", "a", 0);
        registry.connect("h2", "a", 0);
        registry.connect("c1", "a", 0);
        registry.handle("h1", hello(PeerRole::Host, "r"), 0);
        registry.handle("h2", hello(PeerRole::Host, "r"), 0);

        let out = registry.handle(
            "c1",
            SignalMessage::Hello(Hello {
                role: Some(PeerRole::Client),
                room_id: Some("r".into()),
                name: Some("Kitchen".into()),
                target_host_id: Some("h2".into()),
                address: None,
            }),
            0,
        );

        let joined = |peer: &str| {
            to(&out, peer)
                .into_iter()
                .filter(|m| matches!(m, SignalMessage::PeerJoined(_)))
                .count()
        };
        assert_eq!(joined("h2"), 1);
        assert_eq!(joined("h1"), 0);

        // Departure goes back to the pinned host only
        let out = registry.disconnect("c1", 10);
        assert_eq!(
            out,
            vec![Delivery::new(
                "h2",
                SignalMessage::PeerLeft(PeerLeft {
                    peer_id: "c1".into(),
                    room_id: "r".into(),
                })
            )]
        );
    }

    #[test]
    fn test_untargeted_client_join_reaches_room() {
        let mut registry = PeerRegistry::new();
        registry.connect("h1", "a", 0);
        registry.connect("h2", "a", 0);
        registry.connect("c1", "a", 0);
        registry.handle("h1", hello(PeerRole::Host, "r"), 0);
        registry.handle("h2", hello(PeerRole::Host, "other"), 0);

        let out = registry.handle("c1", hello(PeerRole::Client, "r"), 0);
        assert!(to(&out, "h1")
            .iter()
            .any(|m| matches!(m, SignalMessage::PeerJoined(j) if j.peer_id == "c1")));
        assert!(!to(&out, "h2")
            .iter()
            .any(|m| matches!(m, SignalMessage::PeerJoined(_))));
    }

    #[test]
    fn test_relay_injects_sender() {
        let mut registry = PeerRegistry::new();
        registry.connect("a", "x", 0);
        registry.connect("b", "x", 0);

        let text = r#"{"type":"ice-candidate","to":"b","candidate":{"candidate":"c"},"from":"spoofed"}"#;
        let out = registry.handle_text("a", text, 0);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].to, "b");
        match &out[0].message {
            SignalMessage::IceCandidate(relay) => {
                assert_eq!(relay.from.as_deref(), Some("a"));
                assert_eq!(relay.body["candidate"]["candidate"], "c");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_relay_errors_go_to_sender() {
        let mut registry = PeerRegistry::new();
        registry.connect("a", "x", 0);
        registry.connect("b", "x", 0);

        let out = registry.handle_text("a", r#"{"type":"offer","to":"ghost"}"#, 0);
        assert_eq!(
            out,
            vec![Delivery::new(
                "a",
                SignalMessage::error("Target \"ghost\" is not connected.")
            )]
        );

        let out = registry.handle_text("a", r#"{"type":"answer","to":"  "}"#, 0);
        assert_eq!(
            out,
            vec![Delivery::new(
                "a",
                SignalMessage::error("Message \"answer\" is missing \"to\".")
            )]
        );
    }

    #[test]
    fn test_meta_update_requires_host() {
        let mut registry = PeerRegistry::new();
        registry.connect("o", "x", 0);
        let update = SignalMessage::HostMetaUpdate(HostMetaUpdate {
            name: Some("New".into()),
            ..HostMetaUpdate::default()
        });
        let out = registry.handle("o", update.clone(), 0);
        assert_eq!(
            out,
            vec![Delivery::new(
                "o",
                SignalMessage::error("Only hosts can send host-meta-update.")
            )]
        );

        registry.handle("o", hello(PeerRole::Host, "r"), 0);
        let out = registry.handle("o", update, 0);
        let SignalMessage::HostsState(state) = &out[0].message else {
            panic!("expected hosts-state");
        };
        assert_eq!(state.hosts[0].name, "New");
        assert_eq!(state.hosts[0].room_id, "r");
    }

    #[test]
    fn test_bad_frames_answered_with_error() {
        let mut registry = PeerRegistry::new();
        registry.connect("a", "x", 0);

        let out = registry.handle_text("a", "not json", 0);
        assert_eq!(out[0].message, SignalMessage::error("Invalid JSON payload."));

        let out = registry.handle_text("a", r#"{"type":"welcome","clientId":"z","now":0,"remoteAddress":"q"}"#, 0);
        assert_eq!(
            out[0].message,
            SignalMessage::error("Unsupported message type \"welcome\".")
        );
        assert!(registry.contains("a"));
    }

    #[test]
    fn test_ping_pong() {
        let mut registry = PeerRegistry::new();
        registry.connect("a", "x", 0);
        let out = registry.handle_text("a", r#"{"type":"ping"}"#, 77);
        assert_eq!(out[0].message, SignalMessage::Pong(Pong { now: 77 }));
    }

    #[test]
    fn test_heartbeat_sweep() {
        let mut registry = PeerRegistry::new();
        registry.connect("h", "x", 0);
        registry.connect("c", "x", 0);
        registry.handle("h", hello(PeerRole::Host, "r"), 0);
        registry.handle("c", hello(PeerRole::Client, "r"), 0);

        let sweep = registry.sweep(30_000);
        assert_eq!(sweep.ping, vec!["h", "c"]);
        assert!(sweep.expired.is_empty());

        // Only the host answers
        registry.pong("h", 30_010);
        let sweep = registry.sweep(60_000);
        assert_eq!(sweep.expired, vec!["c"]);
        assert_eq!(sweep.ping, vec!["h"]);
        assert!(sweep
            .deliveries
            .iter()
            .any(|d| d.to == "h" && matches!(d.message, SignalMessage::PeerLeft(_))));
        assert_eq!(registry.len(), 1);
    }
}
