//! Client orchestrator - one host, one connection, scheduled playout
//!
//! The remote track starts muted. Clock beacons feed a [`ClockOffsetWindow`];
//! a `sync-start` maps the host's start instant into local time and arms a
//! timer. When the timer fires the sink is unmuted and status moves to
//! `connected`.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use wavecast_core::clock::start_delay;
use wavecast_core::{
    now_ms, ClientSessionStatus, ClientState, ClockOffsetWindow, SyncMessage,
};
use wavecast_signal::messages::PeerLeft;
use wavecast_signal::{Relay, SignalMessage};

use crate::peer::{LinkState, PeerEnvelope, PeerEvent, PeerEvents, PeerFactory, PeerLink};
use crate::sink::{AudioSink, SinkFactory};

/// Posted when a scheduled start is due
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartTimer {
    pub generation: u64,
}

/// Kbps from successive cumulative byte counts
#[derive(Debug, Default)]
pub struct BitrateMeter {
    last: Option<(u64, i64)>,
}

impl BitrateMeter {
    /// The first sample only sets the baseline
    pub fn sample(&mut self, total_bytes: u64, now_ms: i64) -> Option<u32> {
        let previous = self.last.replace((total_bytes, now_ms));
        let (last_bytes, last_ms) = previous?;
        let elapsed = now_ms - last_ms;
        if elapsed <= 0 {
            return None;
        }
        let delta = total_bytes.saturating_sub(last_bytes);
        Some((delta as f64 * 8.0 / elapsed as f64).round() as u32)
    }

    pub fn reset(&mut self) {
        self.last = None;
    }
}

pub struct ClientSession {
    host_id: String,
    link: Option<Box<dyn PeerLink>>,
    sink: Option<Box<dyn AudioSink>>,
    sink_factory: SinkFactory,
    factory: Arc<dyn PeerFactory>,
    peer_events: PeerEvents,
    timers: mpsc::UnboundedSender<StartTimer>,
    offsets: ClockOffsetWindow,
    pending_start: Option<JoinHandle<()>>,
    start_generation: u64,
    bitrate: BitrateMeter,
    status: ClientSessionStatus,
}

impl ClientSession {
    pub fn new(
        host_id: String,
        factory: Arc<dyn PeerFactory>,
        sink_factory: SinkFactory,
        peer_events: PeerEvents,
        timers: mpsc::UnboundedSender<StartTimer>,
    ) -> Self {
        let status = ClientSessionStatus {
            state: ClientState::Connecting,
            host_id: Some(host_id.clone()),
            message: "Connecting to host...".into(),
            ..ClientSessionStatus::idle()
        };
        Self {
            host_id,
            link: None,
            sink: None,
            sink_factory,
            factory,
            peer_events,
            timers,
            offsets: ClockOffsetWindow::default(),
            pending_start: None,
            start_generation: 0,
            bitrate: BitrateMeter::default(),
            status,
        }
    }

    pub fn status(&self) -> &ClientSessionStatus {
        &self.status
    }

    pub fn host_id(&self) -> &str {
        &self.host_id
    }

    pub fn offset_estimate(&self) -> f64 {
        self.offsets.estimate()
    }

    pub fn has_pending_start(&self) -> bool {
        self.pending_start.is_some()
    }

    pub fn fail(&mut self, message: &str, error: &str) {
        self.status.state = ClientState::Error;
        self.status.message = message.to_string();
        self.status.error = Some(error.to_string());
    }

    fn cancel_pending_start(&mut self) {
        if let Some(pending) = self.pending_start.take() {
            pending.abort();
        }
    }

    async fn close_link(&mut self) {
        if let Some(link) = self.link.take() {
            link.close().await;
        }
    }

    /// Handle one signaling message; returns messages to send back
    pub async fn handle_signal(&mut self, msg: SignalMessage) -> Vec<SignalMessage> {
        match msg {
            SignalMessage::Offer(relay) => return self.handle_offer(relay).await,
            SignalMessage::IceCandidate(relay) => {
                if relay.sender().as_deref() != Some(self.host_id.as_str()) {
                    return Vec::new();
                }
                if let (Some(link), Some(candidate)) = (&self.link, relay.candidate()) {
                    if let Err(e) = link.add_ice_candidate(candidate).await {
                        debug!("Rejected candidate from host: {}", e);
                    }
                }
            }
            SignalMessage::PeerLeft(PeerLeft { peer_id, .. }) if peer_id == self.host_id => {
                info!("Host {} left", peer_id);
                self.cancel_pending_start();
                self.close_link().await;
                self.fail("Host disconnected.", "The selected host left the session.");
            }
            SignalMessage::Error(err) => {
                warn!("Signaling error: {}", err.message);
                self.fail(&err.message, &err.message);
            }
            other => debug!("Client ignoring {}", other.kind()),
        }
        Vec::new()
    }

    async fn handle_offer(&mut self, relay: Relay) -> Vec<SignalMessage> {
        let from = relay.sender();
        if from.as_deref() != Some(self.host_id.as_str()) {
            debug!("Ignoring offer from {:?}, pinned to {}", from, self.host_id);
            return Vec::new();
        }
        let Some(offer) = relay.sdp() else {
            debug!("Ignoring offer without sdp");
            return Vec::new();
        };

        if self.link.is_none() {
            match self
                .factory
                .create(&self.host_id, self.peer_events.clone())
                .await
            {
                Ok(link) => self.link = Some(link),
                Err(e) => {
                    self.fail("Negotiation failed.", &e.to_string());
                    return Vec::new();
                }
            }
        }
        let Some(link) = self.link.as_ref() else {
            return Vec::new();
        };

        let negotiated = match link.set_remote_description(offer).await {
            Ok(()) => link.create_answer().await,
            Err(e) => Err(e),
        };

        match negotiated {
            Ok(answer) => {
                self.status.state = ClientState::Syncing;
                self.status.message = "Negotiated. Waiting for synchronized playout...".into();
                self.status.error = None;
                vec![SignalMessage::Answer(Relay::with_sdp(
                    self.host_id.clone(),
                    &answer,
                ))]
            }
            Err(e) => {
                warn!("Negotiation with {} failed: {}", self.host_id, e);
                self.close_link().await;
                self.fail("Negotiation failed.", &e.to_string());
                Vec::new()
            }
        }
    }

    /// Handle one peer-connection event; returns messages to send back
    pub async fn handle_peer(&mut self, envelope: PeerEnvelope) -> Vec<SignalMessage> {
        let current = self.link.as_ref().map(|link| link.id());
        if current != Some(envelope.link_id) {
            debug!("Dropping event from stale link {}", envelope.link_id);
            return Vec::new();
        }

        match envelope.event {
            PeerEvent::IceCandidate(candidate) => {
                return vec![SignalMessage::IceCandidate(Relay::with_candidate(
                    self.host_id.clone(),
                    &candidate,
                ))];
            }
            PeerEvent::StateChanged(LinkState::Connected) => {
                if self.status.state != ClientState::Connected {
                    self.status.state = ClientState::Syncing;
                    self.status.message =
                        "Audio transport connected. Waiting for sync marker...".into();
                }
            }
            PeerEvent::StateChanged(state) if state.is_terminal() => {
                info!("Transport to host is {:?}", state);
                self.cancel_pending_start();
                self.close_link().await;
                self.fail("Connection dropped.", "WebRTC transport disconnected.");
            }
            PeerEvent::StateChanged(_) => {}
            PeerEvent::Track(track) => {
                if let Some(mut old) = self.sink.take() {
                    old.release();
                }
                let mut sink = (self.sink_factory)();
                sink.attach(track);
                sink.set_muted(true);
                sink.play();
                self.sink = Some(sink);
            }
            PeerEvent::ChannelOpen => debug!("Sync channel open"),
            PeerEvent::ChannelClosed => debug!("Sync channel closed"),
            PeerEvent::Sync {
                message,
                received_at_ms,
            } => self.handle_sync(message, received_at_ms),
        }
        Vec::new()
    }

    fn handle_sync(&mut self, message: SyncMessage, received_at_ms: i64) {
        match message {
            SyncMessage::Clock { host_now_ms } => {
                self.offsets.observe(host_now_ms, received_at_ms);
            }
            SyncMessage::SyncStart { host_start_at_ms } => {
                self.schedule_start(host_start_at_ms);
            }
        }
    }

    fn schedule_start(&mut self, host_start_at_ms: f64) {
        let Some(sink) = self.sink.as_mut().filter(|sink| sink.is_attached()) else {
            debug!("sync-start before any audio track, ignoring");
            return;
        };
        sink.set_muted(true);

        let delay = start_delay(host_start_at_ms, self.offsets.estimate(), now_ms());
        self.cancel_pending_start();
        self.start_generation += 1;
        let timer = StartTimer {
            generation: self.start_generation,
        };
        let timers = self.timers.clone();
        debug!("Synchronized start in {:?}", delay);
        self.pending_start = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = timers.send(timer);
        }));
    }

    /// Scheduled start is due
    pub fn on_start_timer(&mut self, timer: StartTimer) {
        if timer.generation != self.start_generation || self.pending_start.is_none() {
            return;
        }
        self.pending_start = None;
        let Some(sink) = self.sink.as_mut() else {
            return;
        };
        sink.set_muted(false);
        sink.play();

        info!("Synchronized playout started");
        self.status.state = ClientState::Connected;
        self.status.message = "Synchronized playout active.".into();
        self.status.error = None;
        self.status.last_sync_at = Some(Utc::now());
    }

    /// Refresh latency, jitter and bitrate while the transport is connected
    pub async fn poll_stats(&mut self) {
        let Some(link) = self.link.as_ref() else {
            return;
        };
        if link.state() != LinkState::Connected {
            return;
        }
        let stats = link.stats().await;
        self.status.latency_ms = stats.round_trip_ms;
        self.status.jitter_ms = stats.jitter_ms;
        self.status.bitrate_kbps = self.bitrate.sample(stats.bytes_received, now_ms());
    }

    /// Close the connection and release playout. Safe to call repeatedly.
    pub async fn stop(&mut self) {
        self.cancel_pending_start();
        self.close_link().await;
        if let Some(mut sink) = self.sink.take() {
            sink.release();
        }
        self.offsets.clear();
        self.bitrate.reset();
        self.status = ClientSessionStatus::idle();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::{RemoteTrack, TransportStats};
    use crate::testing::{MockPeerFactory, MockSink};
    use std::time::{Duration, Instant};
    use tokio::time::timeout;
    use wavecast_core::SessionDescription;

    struct Harness {
        client: ClientSession,
        factory: MockPeerFactory,
        sink: MockSink,
        timers: mpsc::UnboundedReceiver<StartTimer>,
    }

    fn harness() -> Harness {
        let factory = MockPeerFactory::default();
        let sink = MockSink::default();
        let (peer_tx, _peer_rx) = mpsc::unbounded_channel();
        let (timer_tx, timers) = mpsc::unbounded_channel();
        let client = ClientSession::new(
            "host-1".into(),
            Arc::new(factory.clone()),
            sink.factory(),
            peer_tx,
            timer_tx,
        );
        Harness {
            client,
            factory,
            sink,
            timers,
        }
    }

    fn offer_from(peer: &str) -> SignalMessage {
        let mut relay = Relay::with_sdp("me", &SessionDescription::offer("v=0 o"));
        relay.from = Some(peer.into());
        SignalMessage::Offer(relay)
    }

    fn event(h: &Harness, event: PeerEvent) -> PeerEnvelope {
        let link = h.factory.last_link().unwrap();
        PeerEnvelope {
            peer_id: link.peer_id,
            link_id: link.id,
            event,
        }
    }

    fn track() -> PeerEvent {
        let (_tx, rx) = mpsc::channel(1);
        PeerEvent::Track(RemoteTrack {
            id: "audio".into(),
            packets: rx,
        })
    }

    fn sync(message: SyncMessage) -> PeerEvent {
        PeerEvent::Sync {
            message,
            received_at_ms: now_ms(),
        }
    }

    #[test]
    fn test_bitrate_meter() {
        let mut meter = BitrateMeter::default();
        assert_eq!(meter.sample(1_000, 0), None);
        assert_eq!(meter.sample(16_000, 1_500), Some(80));
        // Counter reset clamps to zero
        assert_eq!(meter.sample(10, 3_000), Some(0));
        assert_eq!(meter.sample(20, 3_000), None);
    }

    #[tokio::test]
    async fn test_offer_from_pinned_host_is_answered() {
        let mut h = harness();
        assert_eq!(h.client.status().state, ClientState::Connecting);
        assert_eq!(h.client.status().message, "Connecting to host...");

        let out = h.client.handle_signal(offer_from("host-1")).await;
        assert_eq!(out.len(), 1);
        let SignalMessage::Answer(relay) = &out[0] else {
            panic!("expected answer");
        };
        assert_eq!(relay.to.as_deref(), Some("host-1"));
        assert_eq!(relay.sdp(), Some(SessionDescription::answer("v=0 mock-answer")));
        assert_eq!(h.client.status().state, ClientState::Syncing);
        assert_eq!(
            h.client.status().message,
            "Negotiated. Waiting for synchronized playout..."
        );
    }

    #[tokio::test]
    async fn test_offer_from_other_peer_ignored() {
        let mut h = harness();
        let out = h.client.handle_signal(offer_from("someone-else")).await;
        assert!(out.is_empty());
        assert_eq!(h.factory.log.count("create:"), 0);
    }

    #[tokio::test]
    async fn test_renegotiation_reuses_link() {
        let mut h = harness();
        h.client.handle_signal(offer_from("host-1")).await;
        h.client.handle_signal(offer_from("host-1")).await;
        assert_eq!(h.factory.log.count("create:"), 1);
        assert_eq!(h.factory.log.count("answer:"), 2);
    }

    #[tokio::test]
    async fn test_negotiation_failure_sets_error() {
        let mut h = harness();
        h.factory
            .fail_answers
            .store(true, std::sync::atomic::Ordering::SeqCst);
        let out = h.client.handle_signal(offer_from("host-1")).await;
        assert!(out.is_empty());
        assert_eq!(h.client.status().state, ClientState::Error);
        assert_eq!(h.factory.log.count("close:"), 1);
    }

    #[tokio::test]
    async fn test_track_attaches_muted_and_playing() {
        let mut h = harness();
        h.client.handle_signal(offer_from("host-1")).await;
        h.client.handle_peer(event(&h, track())).await;

        let state = h.sink.snapshot();
        assert!(state.attached);
        assert!(state.muted);
        assert!(state.playing);
    }

    #[tokio::test]
    async fn test_sync_start_without_track_ignored() {
        let mut h = harness();
        h.client.handle_signal(offer_from("host-1")).await;
        h.client
            .handle_peer(event(
                &h,
                sync(SyncMessage::SyncStart {
                    host_start_at_ms: now_ms() as f64,
                }),
            ))
            .await;
        assert!(!h.client.has_pending_start());
    }

    #[tokio::test]
    async fn test_scheduled_start_unmutes_after_delay() {
        let mut h = harness();
        h.client.handle_signal(offer_from("host-1")).await;
        h.client.handle_peer(event(&h, track())).await;

        // Host clock runs 5s ahead of ours
        let skew = 5_000.0;
        h.client
            .handle_peer(event(
                &h,
                sync(SyncMessage::Clock {
                    host_now_ms: now_ms() as f64 + skew,
                }),
            ))
            .await;
        let offset = h.client.offset_estimate();
        assert!((offset - skew).abs() < 50.0);

        let scheduled_at = Instant::now();
        let host_start = now_ms() as f64 + offset + 200.0;
        h.client
            .handle_peer(event(
                &h,
                sync(SyncMessage::SyncStart {
                    host_start_at_ms: host_start,
                }),
            ))
            .await;
        assert!(h.client.has_pending_start());
        assert!(h.sink.snapshot().muted);

        let timer = timeout(Duration::from_secs(5), h.timers.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(scheduled_at.elapsed() >= Duration::from_millis(190));

        h.client.on_start_timer(timer);
        let state = h.sink.snapshot();
        assert!(!state.muted);
        assert!(state.playing);
        assert_eq!(h.client.status().state, ClientState::Connected);
        assert_eq!(h.client.status().message, "Synchronized playout active.");
        assert!(h.client.status().last_sync_at.is_some());
    }

    #[tokio::test]
    async fn test_new_sync_start_replaces_pending() {
        let mut h = harness();
        h.client.handle_signal(offer_from("host-1")).await;
        h.client.handle_peer(event(&h, track())).await;

        let far = now_ms() as f64 + 60_000.0;
        h.client
            .handle_peer(event(&h, sync(SyncMessage::SyncStart { host_start_at_ms: far })))
            .await;
        h.client
            .handle_peer(event(
                &h,
                sync(SyncMessage::SyncStart {
                    host_start_at_ms: now_ms() as f64 - 10.0,
                }),
            ))
            .await;

        let timer = timeout(Duration::from_secs(2), h.timers.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(timer.generation, 2);

        // A timer from the replaced schedule does nothing
        h.client.on_start_timer(StartTimer { generation: 1 });
        assert!(h.sink.snapshot().muted);

        h.client.on_start_timer(timer);
        assert!(!h.sink.snapshot().muted);
    }

    #[tokio::test]
    async fn test_host_left_sets_error() {
        let mut h = harness();
        h.client.handle_signal(offer_from("host-1")).await;
        h.client
            .handle_signal(SignalMessage::PeerLeft(PeerLeft {
                peer_id: "host-1".into(),
                room_id: "lounge".into(),
            }))
            .await;
        assert_eq!(h.client.status().state, ClientState::Error);
        assert_eq!(h.client.status().message, "Host disconnected.");
        assert_eq!(
            h.client.status().error.as_deref(),
            Some("The selected host left the session.")
        );
    }

    #[tokio::test]
    async fn test_transport_states() {
        let mut h = harness();
        h.client.handle_signal(offer_from("host-1")).await;
        h.client
            .handle_peer(event(&h, PeerEvent::StateChanged(LinkState::Connected)))
            .await;
        assert_eq!(
            h.client.status().message,
            "Audio transport connected. Waiting for sync marker..."
        );

        h.client
            .handle_peer(event(&h, PeerEvent::StateChanged(LinkState::Failed)))
            .await;
        assert_eq!(h.client.status().state, ClientState::Error);
        assert_eq!(h.client.status().message, "Connection dropped.");
    }

    #[tokio::test]
    async fn test_stats_only_while_connected() {
        let mut h = harness();
        h.client.handle_signal(offer_from("host-1")).await;
        *h.factory.stats.lock() = TransportStats {
            bytes_received: 10_000,
            jitter_ms: Some(4),
            round_trip_ms: Some(31),
        };

        h.client.poll_stats().await;
        assert_eq!(h.client.status().latency_ms, None);

        let link = h.factory.last_link().unwrap();
        *link.state.lock() = LinkState::Connected;
        h.client.poll_stats().await;
        assert_eq!(h.client.status().latency_ms, Some(31));
        assert_eq!(h.client.status().jitter_ms, Some(4));
        assert_eq!(h.client.status().bitrate_kbps, None);
    }

    #[tokio::test]
    async fn test_stop_releases_everything() {
        let mut h = harness();
        h.client.handle_signal(offer_from("host-1")).await;
        h.client.handle_peer(event(&h, track())).await;
        h.client
            .handle_peer(event(
                &h,
                sync(SyncMessage::SyncStart {
                    host_start_at_ms: now_ms() as f64 + 60_000.0,
                }),
            ))
            .await;

        h.client.stop().await;
        assert!(!h.client.has_pending_start());
        assert!(h.sink.snapshot().released);
        assert_eq!(h.factory.log.count("close:"), 1);
        assert_eq!(h.client.status(), &ClientSessionStatus::idle());

        h.client.stop().await;
        assert_eq!(h.factory.log.count("close:"), 1);
    }
}
