//! Host orchestrator - fans one captured track out to every listener

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use wavecast_core::{
    normalize_optional, now_ms, HostSessionStatus, HostState, SessionDescription, SessionError,
    SyncMessage,
};
use wavecast_signal::messages::{PeerJoined, PeerLeft};
use wavecast_signal::{Relay, SignalMessage};

use crate::capture::MediaTrack;
use crate::peer::{LinkState, PeerEnvelope, PeerEvent, PeerEvents, PeerFactory, PeerLink};

/// One listener's connection
struct HostPeer {
    link: Box<dyn PeerLink>,
    channel_open: bool,
}

/// Per-broadcast state; created once capture and signaling are up
pub struct HostSession {
    room_id: String,
    tracks: Vec<MediaTrack>,
    peers: HashMap<String, HostPeer>,
    factory: Arc<dyn PeerFactory>,
    peer_events: PeerEvents,
    sync_lead_ms: i64,
    status: HostSessionStatus,
    /// The current error came from a relayed `error` envelope
    recoverable: bool,
}

impl HostSession {
    pub fn new(
        room_id: String,
        tracks: Vec<MediaTrack>,
        factory: Arc<dyn PeerFactory>,
        peer_events: PeerEvents,
        sync_lead_ms: i64,
    ) -> Self {
        let mut session = Self {
            room_id,
            tracks,
            peers: HashMap::new(),
            factory,
            peer_events,
            sync_lead_ms,
            status: HostSessionStatus::idle(),
            recoverable: false,
        };
        session.refresh_status();
        session
    }

    pub fn status(&self) -> &HostSessionStatus {
        &self.status
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn set_room_id(&mut self, room_id: String) {
        self.room_id = room_id;
        self.refresh_status();
    }

    /// Peer entries currently held, whatever their transport state
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Peers whose transport is connecting or connected
    pub fn active_peers(&self) -> usize {
        self.peers
            .values()
            .filter(|peer| peer.link.state().is_active())
            .count()
    }

    /// Put the session into the error state, keeping peers streaming
    pub fn fail(&mut self, message: &str, error: &str) {
        self.status.state = HostState::Error;
        self.status.message = message.to_string();
        self.status.error = Some(error.to_string());
        self.recoverable = false;
    }

    /// Error reported by the server about one message; a later connected
    /// peer clears it
    fn relay_failed(&mut self, message: &str) {
        self.fail(message, message);
        self.recoverable = true;
    }

    fn refresh_status(&mut self) {
        if self.status.state == HostState::Error {
            self.status.peer_count = self.active_peers();
            return;
        }
        let count = self.active_peers();
        self.status.state = HostState::Streaming;
        self.status.peer_count = count;
        self.status.error = None;
        self.status.message = match count {
            0 => format!(
                "Broadcasting in room \"{}\". Waiting for clients...",
                self.room_id
            ),
            1 => "Streaming to 1 client.".to_string(),
            n => format!("Streaming to {} clients.", n),
        };
    }

    /// Handle one signaling message; returns messages to send back
    pub async fn handle_signal(&mut self, msg: SignalMessage) -> Vec<SignalMessage> {
        let mut out = Vec::new();
        match msg {
            SignalMessage::PeerJoined(PeerJoined { peer_id, name, .. }) => {
                if let Some(offer) = self.add_peer(&peer_id, &name).await {
                    out.push(offer);
                }
            }
            SignalMessage::PeerLeft(PeerLeft { peer_id, .. }) => {
                info!("Client {} left", peer_id);
                self.remove_peer(&peer_id).await;
            }
            SignalMessage::Answer(relay) => {
                let (Some(from), Some(sdp)) = (relay.sender(), relay.sdp()) else {
                    debug!("Ignoring answer without sender or sdp");
                    return out;
                };
                let Some(peer) = self.peers.get(&from) else {
                    debug!("Answer from unknown peer {}", from);
                    return out;
                };
                let applied = peer.link.set_remote_description(sdp).await;
                if let Err(e) = applied {
                    warn!("Failed to apply answer from {}: {}", from, e);
                    self.remove_peer(&from).await;
                }
            }
            SignalMessage::IceCandidate(relay) => {
                let (Some(from), Some(candidate)) = (relay.sender(), relay.candidate()) else {
                    return out;
                };
                if let Some(peer) = self.peers.get(&from) {
                    if let Err(e) = peer.link.add_ice_candidate(candidate).await {
                        debug!("Rejected candidate from {}: {}", from, e);
                    }
                }
            }
            SignalMessage::Error(err) => {
                warn!("Signaling error: {}", err.message);
                self.relay_failed(&err.message);
            }
            other => debug!("Host ignoring {}", other.kind()),
        }
        self.refresh_status();
        out
    }

    /// Create the connection for a new listener and produce its offer
    async fn add_peer(&mut self, peer_id: &str, name: &str) -> Option<SignalMessage> {
        let peer_id = normalize_optional(Some(peer_id))?;
        if self.peers.contains_key(&peer_id) {
            debug!("Peer {} already connected, ignoring join", peer_id);
            return None;
        }

        info!("Client {} ({}) joined", name, peer_id);

        let link = match self.factory.create(&peer_id, self.peer_events.clone()).await {
            Ok(link) => link,
            Err(e) => {
                warn!("Failed to create connection for {}: {}", peer_id, e);
                return None;
            }
        };

        match self.negotiate(link.as_ref()).await {
            Ok(offer) => {
                self.peers.insert(
                    peer_id.clone(),
                    HostPeer {
                        link,
                        channel_open: false,
                    },
                );
                Some(SignalMessage::Offer(Relay::with_sdp(peer_id, &offer)))
            }
            Err(e) => {
                warn!("Failed to negotiate with {}: {}", peer_id, e);
                link.close().await;
                None
            }
        }
    }

    async fn negotiate(&self, link: &dyn PeerLink) -> Result<SessionDescription, SessionError> {
        for track in &self.tracks {
            link.add_track(track).await?;
        }
        link.open_sync_channel().await?;
        link.create_offer().await
    }

    async fn remove_peer(&mut self, peer_id: &str) {
        if let Some(peer) = self.peers.remove(peer_id) {
            peer.link.close().await;
            debug!("Closed connection to {}", peer_id);
        }
    }

    /// Handle one peer-connection event; returns messages to send back
    pub async fn handle_peer(&mut self, envelope: PeerEnvelope) -> Vec<SignalMessage> {
        let mut out = Vec::new();
        let PeerEnvelope {
            peer_id,
            link_id,
            event,
        } = envelope;

        match self.peers.get(&peer_id) {
            Some(peer) if peer.link.id() == link_id => {}
            _ => {
                debug!("Dropping event from stale link {} of {}", link_id, peer_id);
                return out;
            }
        }

        match event {
            PeerEvent::IceCandidate(candidate) => {
                out.push(SignalMessage::IceCandidate(Relay::with_candidate(
                    peer_id, &candidate,
                )));
            }
            PeerEvent::StateChanged(state) => {
                debug!("Peer {} is {:?}", peer_id, state);
                if state.is_terminal() {
                    self.remove_peer(&peer_id).await;
                } else if state == LinkState::Connected
                    && self.status.state == HostState::Error
                    && self.recoverable
                {
                    info!("Client {} connected, clearing error", peer_id);
                    self.status.state = HostState::Streaming;
                    self.recoverable = false;
                }
            }
            PeerEvent::ChannelOpen => {
                if let Some(peer) = self.peers.get_mut(&peer_id) {
                    peer.channel_open = true;
                    let now = now_ms();
                    let clock = SyncMessage::Clock {
                        host_now_ms: now as f64,
                    };
                    let start = SyncMessage::SyncStart {
                        host_start_at_ms: (now + self.sync_lead_ms) as f64,
                    };
                    for msg in [clock, start] {
                        if let Err(e) = peer.link.send_sync(&msg).await {
                            debug!("Sync send to {} failed: {}", peer_id, e);
                        }
                    }
                }
            }
            PeerEvent::ChannelClosed => {
                if let Some(peer) = self.peers.get_mut(&peer_id) {
                    peer.channel_open = false;
                }
            }
            PeerEvent::Track(_) | PeerEvent::Sync { .. } => {}
        }
        self.refresh_status();
        out
    }

    /// Push a clock beacon to every open sync channel
    pub async fn beacon(&self) {
        let beacon = SyncMessage::Clock {
            host_now_ms: now_ms() as f64,
        };
        for (peer_id, peer) in &self.peers {
            if !peer.channel_open {
                continue;
            }
            if let Err(e) = peer.link.send_sync(&beacon).await {
                debug!("Beacon to {} failed: {}", peer_id, e);
            }
        }
    }

    /// Close every connection and stop capture. Safe to call repeatedly.
    pub async fn stop(&mut self) {
        for (peer_id, peer) in self.peers.drain() {
            debug!("Closing connection to {}", peer_id);
            peer.link.close().await;
        }
        for track in &self.tracks {
            track.stop();
        }
        self.status = HostSessionStatus::idle();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::TrackKind;
    use crate::testing::MockPeerFactory;
    use tokio::sync::mpsc;

    fn session(factory: &MockPeerFactory) -> (HostSession, MediaTrack) {
        let (tx, _rx) = mpsc::unbounded_channel();
        let track = MediaTrack::detached("audio", TrackKind::Audio, "tab audio");
        let session = HostSession::new(
            "lounge".into(),
            vec![track.clone()],
            Arc::new(factory.clone()),
            tx,
            1200,
        );
        (session, track)
    }

    fn joined(peer_id: &str) -> SignalMessage {
        SignalMessage::PeerJoined(PeerJoined {
            peer_id: peer_id.into(),
            room_id: "lounge".into(),
            name: "Kitchen".into(),
        })
    }

    fn envelope(factory: &MockPeerFactory, peer_id: &str, event: PeerEvent) -> PeerEnvelope {
        let link = factory
            .links
            .lock()
            .iter()
            .rev()
            .find(|l| l.peer_id == peer_id)
            .cloned()
            .unwrap();
        PeerEnvelope {
            peer_id: peer_id.into(),
            link_id: link.id,
            event,
        }
    }

    #[tokio::test]
    async fn test_peer_joined_sends_offer() {
        let factory = MockPeerFactory::default();
        let (mut host, _) = session(&factory);
        assert_eq!(
            host.status().message,
            "Broadcasting in room \"lounge\". Waiting for clients..."
        );

        let out = host.handle_signal(joined("c1")).await;
        assert_eq!(out.len(), 1);
        let SignalMessage::Offer(relay) = &out[0] else {
            panic!("expected offer");
        };
        assert_eq!(relay.to.as_deref(), Some("c1"));
        assert_eq!(relay.sdp(), Some(SessionDescription::offer("v=0 mock-offer")));

        assert_eq!(
            factory.log.entries(),
            vec!["create:c1", "track:c1:audio", "channel:c1", "offer:c1"]
        );
    }

    #[tokio::test]
    async fn test_duplicate_join_ignored() {
        let factory = MockPeerFactory::default();
        let (mut host, _) = session(&factory);

        host.handle_signal(joined("c1")).await;
        let out = host.handle_signal(joined("c1")).await;
        assert!(out.is_empty());
        assert_eq!(host.len(), 1);
        assert_eq!(factory.log.count("create:"), 1);
    }

    #[tokio::test]
    async fn test_answer_and_candidate_routed_by_sender() {
        let factory = MockPeerFactory::default();
        let (mut host, _) = session(&factory);
        host.handle_signal(joined("c1")).await;

        let mut answer = Relay::with_sdp("host", &SessionDescription::answer("v=0 a"));
        answer.from = Some("c1".into());
        host.handle_signal(SignalMessage::Answer(answer)).await;

        let mut candidate = Relay::with_candidate(
            "host",
            &wavecast_core::IceCandidate {
                candidate: "candidate:1".into(),
                ..Default::default()
            },
        );
        candidate.from = Some("c1".into());
        host.handle_signal(SignalMessage::IceCandidate(candidate)).await;

        // Unknown sender is ignored
        let mut stray = Relay::with_sdp("host", &SessionDescription::answer("v=0 b"));
        stray.from = Some("nobody".into());
        host.handle_signal(SignalMessage::Answer(stray)).await;

        let entries = factory.log.entries();
        assert!(entries.contains(&"remote:c1:v=0 a".to_string()));
        assert!(entries.contains(&"candidate:c1:candidate:1".to_string()));
        assert_eq!(factory.log.count("remote:"), 1);
    }

    #[tokio::test]
    async fn test_channel_open_sends_clock_then_start() {
        let factory = MockPeerFactory::default();
        let (mut host, _) = session(&factory);
        host.handle_signal(joined("c1")).await;

        let before = now_ms();
        host.handle_peer(envelope(&factory, "c1", PeerEvent::ChannelOpen))
            .await;

        let syncs: Vec<SyncMessage> = factory
            .log
            .entries()
            .iter()
            .filter_map(|e| e.strip_prefix("sync:c1:"))
            .filter_map(SyncMessage::parse)
            .collect();
        assert_eq!(syncs.len(), 2);
        let SyncMessage::Clock { host_now_ms } = syncs[0] else {
            panic!("expected clock first");
        };
        let SyncMessage::SyncStart { host_start_at_ms } = syncs[1] else {
            panic!("expected sync-start second");
        };
        assert!(host_now_ms >= before as f64);
        assert_eq!(host_start_at_ms - host_now_ms, 1200.0);

        host.beacon().await;
        assert_eq!(factory.log.count("sync:c1:"), 3);
    }

    #[tokio::test]
    async fn test_failed_link_removed_and_count_updated() {
        let factory = MockPeerFactory::default();
        let (mut host, _) = session(&factory);
        host.handle_signal(joined("c1")).await;
        host.handle_signal(joined("c2")).await;

        for link in factory.links.lock().iter() {
            *link.state.lock() = LinkState::Connected;
        }
        host.handle_peer(envelope(
            &factory,
            "c2",
            PeerEvent::StateChanged(LinkState::Connected),
        ))
        .await;
        assert_eq!(host.status().peer_count, 2);
        assert_eq!(host.status().message, "Streaming to 2 clients.");

        host.handle_peer(envelope(
            &factory,
            "c1",
            PeerEvent::StateChanged(LinkState::Failed),
        ))
        .await;
        assert_eq!(host.len(), 1);
        assert_eq!(host.status().peer_count, 1);
        assert_eq!(host.status().message, "Streaming to 1 client.");
        assert!(factory.log.entries().contains(&"close:c1".to_string()));
    }

    #[tokio::test]
    async fn test_stale_link_events_dropped() {
        let factory = MockPeerFactory::default();
        let (mut host, _) = session(&factory);
        host.handle_signal(joined("c1")).await;

        let out = host
            .handle_peer(PeerEnvelope {
                peer_id: "c1".into(),
                link_id: u64::MAX,
                event: PeerEvent::StateChanged(LinkState::Failed),
            })
            .await;
        assert!(out.is_empty());
        assert_eq!(host.len(), 1);
    }

    #[tokio::test]
    async fn test_peer_left_tears_down() {
        let factory = MockPeerFactory::default();
        let (mut host, _) = session(&factory);
        host.handle_signal(joined("c1")).await;

        host.handle_signal(SignalMessage::PeerLeft(PeerLeft {
            peer_id: "c1".into(),
            room_id: "lounge".into(),
        }))
        .await;
        assert!(host.is_empty());
        assert_eq!(factory.log.count("close:c1"), 1);
    }

    #[tokio::test]
    async fn test_stop_closes_all_and_is_idempotent() {
        let factory = MockPeerFactory::default();
        let (mut host, track) = session(&factory);
        for id in ["c1", "c2", "c3"] {
            host.handle_signal(joined(id)).await;
        }
        assert_eq!(host.len(), 3);

        host.stop().await;
        assert!(host.is_empty());
        assert_eq!(factory.log.count("close:"), 3);
        assert!(track.is_stopped());
        assert_eq!(host.status(), &HostSessionStatus::idle());

        host.stop().await;
        assert_eq!(factory.log.count("close:"), 3);
        assert_eq!(host.status(), &HostSessionStatus::idle());
    }

    #[tokio::test]
    async fn test_signaling_error_sets_error_status() {
        let factory = MockPeerFactory::default();
        let (mut host, _) = session(&factory);
        host.handle_signal(SignalMessage::error("Target \"x\" is not connected."))
            .await;
        assert_eq!(host.status().state, HostState::Error);
        assert_eq!(
            host.status().error.as_deref(),
            Some("Target \"x\" is not connected.")
        );
    }

    #[tokio::test]
    async fn test_connected_peer_clears_relay_error() {
        let factory = MockPeerFactory::default();
        let (mut host, _) = session(&factory);
        host.handle_signal(SignalMessage::error("Target \"gone\" is not connected."))
            .await;
        assert_eq!(host.status().state, HostState::Error);

        host.handle_signal(joined("c1")).await;
        assert_eq!(host.status().state, HostState::Error);

        *factory.last_link().unwrap().state.lock() = LinkState::Connected;
        host.handle_peer(envelope(
            &factory,
            "c1",
            PeerEvent::StateChanged(LinkState::Connected),
        ))
        .await;
        let status = host.status();
        assert_eq!(status.state, HostState::Streaming);
        assert_eq!(status.error, None);
        assert_eq!(status.peer_count, 1);
        assert_eq!(status.message, "Streaming to 1 client.");
    }

    #[tokio::test]
    async fn test_signaling_loss_survives_connected_peer() {
        let factory = MockPeerFactory::default();
        let (mut host, _) = session(&factory);
        host.handle_signal(joined("c1")).await;
        host.fail("Signaling connection lost.", "socket closed");

        *factory.last_link().unwrap().state.lock() = LinkState::Connected;
        host.handle_peer(envelope(
            &factory,
            "c1",
            PeerEvent::StateChanged(LinkState::Connected),
        ))
        .await;
        assert_eq!(host.status().state, HostState::Error);
        assert_eq!(host.status().error.as_deref(), Some("socket closed"));
        assert_eq!(host.status().peer_count, 1);
    }

    #[tokio::test]
    async fn test_application_ping_ignored() {
        let factory = MockPeerFactory::default();
        let (mut host, _) = session(&factory);
        let out = host.handle_signal(SignalMessage::Ping).await;
        assert!(out.is_empty());
        assert_eq!(host.status().state, HostState::Streaming);
    }
}
