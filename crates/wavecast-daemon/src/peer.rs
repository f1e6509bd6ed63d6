//! Peer connection wrapper
//!
//! Orchestrators talk to [`PeerLink`] only. Callbacks fired by the WebRTC stack
//! never touch orchestrator state; they are turned into [`PeerEnvelope`]s and
//! posted to the orchestrator's event loop.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::stats::StatsReportType;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use wavecast_core::{
    now_ms, IceCandidate, SdpKind, SessionDescription, SessionError, SyncMessage,
    SYNC_CHANNEL_LABEL,
};

use crate::capture::MediaTrack;

/// Opus RTP clock
const OPUS_CLOCK_RATE: f64 = 48_000.0;

/// Remote audio packets buffered ahead of the sink
const TRACK_BUFFER: usize = 256;

const NO_JITTER: u32 = u32::MAX;

static NEXT_LINK_ID: AtomicU64 = AtomicU64::new(1);

/// Transport state as seen by the orchestrators
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl LinkState {
    /// Counted towards the host's active peers
    pub fn is_active(self) -> bool {
        matches!(self, LinkState::Connecting | LinkState::Connected)
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            LinkState::Disconnected | LinkState::Failed | LinkState::Closed
        )
    }
}

impl From<RTCPeerConnectionState> for LinkState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::Connecting => LinkState::Connecting,
            RTCPeerConnectionState::Connected => LinkState::Connected,
            RTCPeerConnectionState::Disconnected => LinkState::Disconnected,
            RTCPeerConnectionState::Failed => LinkState::Failed,
            RTCPeerConnectionState::Closed => LinkState::Closed,
            _ => LinkState::New,
        }
    }
}

/// Inbound audio handed to an [`crate::sink::AudioSink`]
#[derive(Debug)]
pub struct RemoteTrack {
    pub id: String,
    pub packets: mpsc::Receiver<Bytes>,
}

#[derive(Debug)]
pub enum PeerEvent {
    IceCandidate(IceCandidate),
    StateChanged(LinkState),
    Track(RemoteTrack),
    ChannelOpen,
    ChannelClosed,
    Sync {
        message: SyncMessage,
        received_at_ms: i64,
    },
}

/// A [`PeerEvent`] tagged with the link that produced it
#[derive(Debug)]
pub struct PeerEnvelope {
    pub peer_id: String,
    pub link_id: u64,
    pub event: PeerEvent,
}

pub type PeerEvents = mpsc::UnboundedSender<PeerEnvelope>;

/// Snapshot of inbound transport statistics
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TransportStats {
    /// Cumulative inbound audio payload bytes
    pub bytes_received: u64,
    pub jitter_ms: Option<u32>,
    /// Round trip of the selected candidate pair
    pub round_trip_ms: Option<u32>,
}

/// One peer connection plus its `stream-sync` channel
#[async_trait]
pub trait PeerLink: Send + Sync {
    /// Unique across every link created in this process
    fn id(&self) -> u64;

    async fn add_track(&self, track: &MediaTrack) -> Result<(), SessionError>;

    /// Host side: create the reliable ordered sync channel
    async fn open_sync_channel(&self) -> Result<(), SessionError>;

    /// Create an offer and apply it locally
    async fn create_offer(&self) -> Result<SessionDescription, SessionError>;

    /// Create an answer and apply it locally
    async fn create_answer(&self) -> Result<SessionDescription, SessionError>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), SessionError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), SessionError>;

    /// Send on the sync channel; fails if it is not open
    async fn send_sync(&self, message: &SyncMessage) -> Result<(), SessionError>;

    fn state(&self) -> LinkState;

    async fn stats(&self) -> TransportStats;

    /// Best effort; never fails
    async fn close(&self);
}

#[async_trait]
pub trait PeerFactory: Send + Sync {
    async fn create(
        &self,
        peer_id: &str,
        events: PeerEvents,
    ) -> Result<Box<dyn PeerLink>, SessionError>;
}

pub fn next_link_id() -> u64 {
    NEXT_LINK_ID.fetch_add(1, Ordering::Relaxed)
}

/// RFC 3550 interarrival jitter, in seconds
#[derive(Debug, Default)]
pub struct InterarrivalJitter {
    last: Option<(Instant, u32)>,
    jitter: f64,
}

impl InterarrivalJitter {
    pub fn update(&mut self, arrival: Instant, rtp_timestamp: u32, clock_rate: f64) -> f64 {
        if let Some((prev_arrival, prev_ts)) = self.last {
            let arrival_delta = arrival.saturating_duration_since(prev_arrival).as_secs_f64();
            let ts_delta = rtp_timestamp.wrapping_sub(prev_ts) as i32 as f64 / clock_rate;
            let d = (arrival_delta - ts_delta).abs();
            self.jitter += (d - self.jitter) / 16.0;
        }
        self.last = Some((arrival, rtp_timestamp));
        self.jitter
    }

    pub fn millis(&self) -> u32 {
        (self.jitter * 1000.0).round() as u32
    }
}

fn negotiation(e: webrtc::Error) -> SessionError {
    SessionError::NegotiationFailure(e.to_string())
}

/// WebRTC peer factory
pub struct RtcPeerFactory {
    api: API,
    ice_servers: Vec<String>,
}

impl RtcPeerFactory {
    pub fn new(ice_servers: Vec<String>) -> Result<Self, SessionError> {
        let mut media = MediaEngine::default();
        media.register_default_codecs().map_err(negotiation)?;

        let registry = register_default_interceptors(Registry::new(), &mut media)
            .map_err(negotiation)?;

        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self { api, ice_servers })
    }

    fn rtc_config(&self) -> RTCConfiguration {
        let ice_servers = if self.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }]
        };
        RTCConfiguration {
            ice_servers,
            ..Default::default()
        }
    }
}

#[async_trait]
impl PeerFactory for RtcPeerFactory {
    async fn create(
        &self,
        peer_id: &str,
        events: PeerEvents,
    ) -> Result<Box<dyn PeerLink>, SessionError> {
        let pc = Arc::new(
            self.api
                .new_peer_connection(self.rtc_config())
                .await
                .map_err(negotiation)?,
        );
        let link = RtcPeerLink {
            id: next_link_id(),
            peer_id: peer_id.to_string(),
            pc,
            events,
            sync_channel: Arc::new(Mutex::new(None)),
            jitter_ms: Arc::new(AtomicU32::new(NO_JITTER)),
        };
        link.install_handlers();
        debug!("Created peer connection {} for {}", link.id, peer_id);
        Ok(Box::new(link))
    }
}

pub struct RtcPeerLink {
    id: u64,
    peer_id: String,
    pc: Arc<RTCPeerConnection>,
    events: PeerEvents,
    sync_channel: Arc<Mutex<Option<Arc<RTCDataChannel>>>>,
    jitter_ms: Arc<AtomicU32>,
}

/// Posts events for one link
#[derive(Clone)]
struct Poster {
    peer_id: String,
    link_id: u64,
    events: PeerEvents,
}

impl Poster {
    fn post(&self, event: PeerEvent) {
        let _ = self.events.send(PeerEnvelope {
            peer_id: self.peer_id.clone(),
            link_id: self.link_id,
            event,
        });
    }
}

impl RtcPeerLink {
    fn poster(&self) -> Poster {
        Poster {
            peer_id: self.peer_id.clone(),
            link_id: self.id,
            events: self.events.clone(),
        }
    }

    fn install_handlers(&self) {
        let poster = self.poster();
        self.pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                if let Some(init) = candidate.and_then(|c| c.to_json().ok()) {
                    poster.post(PeerEvent::IceCandidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                        username_fragment: init.username_fragment,
                    }));
                }
                Box::pin(async {})
            }));

        let poster = self.poster();
        self.pc.on_peer_connection_state_change(Box::new(
            move |state: RTCPeerConnectionState| {
                debug!("Peer {} connection state: {}", poster.peer_id, state);
                poster.post(PeerEvent::StateChanged(state.into()));
                Box::pin(async {})
            },
        ));

        let poster = self.poster();
        let jitter_ms = self.jitter_ms.clone();
        self.pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let poster = poster.clone();
                let jitter_ms = jitter_ms.clone();
                Box::pin(async move {
                    if track.kind() != RTPCodecType::Audio {
                        return;
                    }
                    let (tx, rx) = mpsc::channel(TRACK_BUFFER);
                    poster.post(PeerEvent::Track(RemoteTrack {
                        id: track.id(),
                        packets: rx,
                    }));
                    tokio::spawn(read_remote_track(track, tx, jitter_ms));
                })
            },
        ));

        let poster = self.poster();
        let slot = self.sync_channel.clone();
        self.pc
            .on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
                if channel.label() == SYNC_CHANNEL_LABEL {
                    bind_sync_channel(&channel, poster.clone());
                    *slot.lock() = Some(channel);
                } else {
                    debug!("Ignoring data channel {}", channel.label());
                }
                Box::pin(async {})
            }));
    }
}

/// Pump RTP payloads to the sink and keep the jitter estimate current
async fn read_remote_track(
    track: Arc<TrackRemote>,
    packets: mpsc::Sender<Bytes>,
    jitter_ms: Arc<AtomicU32>,
) {
    let mut jitter = InterarrivalJitter::default();
    while let Ok((packet, _)) = track.read_rtp().await {
        jitter.update(Instant::now(), packet.header.timestamp, OPUS_CLOCK_RATE);
        jitter_ms.store(jitter.millis(), Ordering::Relaxed);
        // A full buffer means the sink is not draining; drop rather than stall RTP
        let _ = packets.try_send(packet.payload);
    }
    debug!("Remote track {} ended", track.id());
}

fn bind_sync_channel(channel: &Arc<RTCDataChannel>, poster: Poster) {
    let on_open = poster.clone();
    channel.on_open(Box::new(move || {
        on_open.post(PeerEvent::ChannelOpen);
        Box::pin(async {})
    }));

    let on_close = poster.clone();
    channel.on_close(Box::new(move || {
        on_close.post(PeerEvent::ChannelClosed);
        Box::pin(async {})
    }));

    channel.on_message(Box::new(move |msg: DataChannelMessage| {
        if msg.is_string {
            let text = String::from_utf8_lossy(&msg.data);
            if let Some(message) = SyncMessage::parse(&text) {
                poster.post(PeerEvent::Sync {
                    message,
                    received_at_ms: now_ms(),
                });
            }
        }
        Box::pin(async {})
    }));
}

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription, SessionError> {
    let result = match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp),
        SdpKind::Pranswer => RTCSessionDescription::pranswer(desc.sdp),
        SdpKind::Rollback => {
            return Err(SessionError::NegotiationFailure(
                "rollback descriptions are not supported".into(),
            ))
        }
    };
    result.map_err(negotiation)
}

fn from_rtc(desc: RTCSessionDescription) -> SessionDescription {
    let kind = match desc.sdp_type {
        RTCSdpType::Answer => SdpKind::Answer,
        RTCSdpType::Pranswer => SdpKind::Pranswer,
        RTCSdpType::Rollback => SdpKind::Rollback,
        _ => SdpKind::Offer,
    };
    SessionDescription {
        kind,
        sdp: desc.sdp,
    }
}

#[async_trait]
impl PeerLink for RtcPeerLink {
    fn id(&self) -> u64 {
        self.id
    }

    async fn add_track(&self, track: &MediaTrack) -> Result<(), SessionError> {
        let Some(local) = track.local() else {
            debug!("Track {} has no local source, skipping", track.label);
            return Ok(());
        };
        let sender = self
            .pc
            .add_track(Arc::clone(local) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(negotiation)?;

        // RTCP must be drained for interceptors to work
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while sender.read(&mut buf).await.is_ok() {}
        });
        Ok(())
    }

    async fn open_sync_channel(&self) -> Result<(), SessionError> {
        let channel = self
            .pc
            .create_data_channel(SYNC_CHANNEL_LABEL, None)
            .await
            .map_err(negotiation)?;
        bind_sync_channel(&channel, self.poster());
        *self.sync_channel.lock() = Some(channel);
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, SessionError> {
        let offer = self.pc.create_offer(None).await.map_err(negotiation)?;
        self.pc
            .set_local_description(offer)
            .await
            .map_err(negotiation)?;
        let local = self.pc.local_description().await.ok_or_else(|| {
            SessionError::NegotiationFailure("no local description after offer".into())
        })?;
        Ok(from_rtc(local))
    }

    async fn create_answer(&self) -> Result<SessionDescription, SessionError> {
        let answer = self.pc.create_answer(None).await.map_err(negotiation)?;
        self.pc
            .set_local_description(answer)
            .await
            .map_err(negotiation)?;
        let local = self.pc.local_description().await.ok_or_else(|| {
            SessionError::NegotiationFailure("no local description after answer".into())
        })?;
        Ok(from_rtc(local))
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), SessionError> {
        self.pc
            .set_remote_description(to_rtc(desc)?)
            .await
            .map_err(negotiation)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), SessionError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await
            .map_err(negotiation)
    }

    async fn send_sync(&self, message: &SyncMessage) -> Result<(), SessionError> {
        let channel = self.sync_channel.lock().clone();
        let Some(channel) = channel else {
            return Err(SessionError::PeerUnreachable(format!(
                "sync channel to {} is not open",
                self.peer_id
            )));
        };
        channel
            .send_text(message.to_json())
            .await
            .map(|_| ())
            .map_err(|e| SessionError::PeerUnreachable(e.to_string()))
    }

    fn state(&self) -> LinkState {
        self.pc.connection_state().into()
    }

    async fn stats(&self) -> TransportStats {
        let mut stats = TransportStats::default();
        let report = self.pc.get_stats().await;
        for (_, entry) in report.reports {
            match entry {
                StatsReportType::InboundRTP(inbound) if inbound.kind == "audio" => {
                    stats.bytes_received = inbound.bytes_received;
                }
                StatsReportType::CandidatePair(pair) if pair.nominated => {
                    if pair.current_round_trip_time > 0.0 {
                        stats.round_trip_ms =
                            Some((pair.current_round_trip_time * 1000.0).round() as u32);
                    }
                }
                _ => {}
            }
        }
        let jitter = self.jitter_ms.load(Ordering::Relaxed);
        stats.jitter_ms = (jitter != NO_JITTER).then_some(jitter);
        stats
    }

    async fn close(&self) {
        if let Some(channel) = self.sync_channel.lock().take() {
            tokio::spawn(async move {
                let _ = channel.close().await;
            });
        }
        if let Err(e) = self.pc.close().await {
            warn!("Error closing peer connection to {}: {}", self.peer_id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_link_state_mapping() {
        assert_eq!(
            LinkState::from(RTCPeerConnectionState::Connected),
            LinkState::Connected
        );
        assert!(LinkState::Connecting.is_active());
        assert!(!LinkState::Failed.is_active());
        assert!(LinkState::Disconnected.is_terminal());
        assert!(!LinkState::New.is_terminal());
    }

    #[test]
    fn test_jitter_steady_stream() {
        let mut jitter = InterarrivalJitter::default();
        let start = Instant::now();
        for i in 0..50u32 {
            let arrival = start + Duration::from_millis(20 * i as u64);
            jitter.update(arrival, i * 960, OPUS_CLOCK_RATE);
        }
        assert_eq!(jitter.millis(), 0);
    }

    #[test]
    fn test_jitter_tracks_variance() {
        let mut jitter = InterarrivalJitter::default();
        let start = Instant::now();
        for i in 0..200u32 {
            // Alternate 10ms early / 10ms late around the 20ms cadence
            let skew = if i % 2 == 0 { 0 } else { 10 };
            let arrival = start + Duration::from_millis(20 * i as u64 + skew);
            jitter.update(arrival, i * 960, OPUS_CLOCK_RATE);
        }
        assert_eq!(jitter.millis(), 10);
    }

    #[test]
    fn test_link_ids_unique() {
        let a = next_link_id();
        let b = next_link_id();
        assert_ne!(a, b);
    }

    #[test]
    fn test_description_conversion() {
        let desc = from_rtc(RTCSessionDescription::default());
        assert_eq!(desc.kind, SdpKind::Offer);
        assert!(to_rtc(SessionDescription {
            kind: SdpKind::Rollback,
            sdp: String::new(),
        })
        .is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_rtc_loopback_carries_audio_and_sync() {
        use crate::capture::{CaptureDevice, SilenceCapture};
        use tokio::time::{sleep, timeout};

        let factory = RtcPeerFactory::new(Vec::new()).unwrap();
        let (host_tx, mut host_rx) = mpsc::unbounded_channel();
        let (client_tx, mut client_rx) = mpsc::unbounded_channel();
        let host: Arc<dyn PeerLink> = Arc::from(factory.create("client", host_tx).await.unwrap());
        let client: Arc<dyn PeerLink> = Arc::from(factory.create("host", client_tx).await.unwrap());

        let tracks = SilenceCapture.user_media().await.unwrap();
        host.add_track(&tracks[0]).await.unwrap();
        host.open_sync_channel().await.unwrap();
        let offer = host.create_offer().await.unwrap();
        client.set_remote_description(offer).await.unwrap();
        let answer = client.create_answer().await.unwrap();
        assert_eq!(answer.kind, SdpKind::Answer);
        host.set_remote_description(answer).await.unwrap();

        let mut host_connected = false;
        let mut client_connected = false;
        let mut opened = false;
        let mut syncs = Vec::new();
        let mut remote: Option<RemoteTrack> = None;

        // Trickle candidates both ways until every milestone is reached
        timeout(Duration::from_secs(20), async {
            while !(host_connected && client_connected && opened && syncs.len() == 2)
                || remote.is_none()
            {
                tokio::select! {
                    Some(env) = host_rx.recv() => match env.event {
                        PeerEvent::IceCandidate(candidate) => {
                            let _ = client.add_ice_candidate(candidate).await;
                        }
                        PeerEvent::StateChanged(LinkState::Connected) => host_connected = true,
                        PeerEvent::ChannelOpen => {
                            opened = true;
                            let now = now_ms() as f64;
                            host.send_sync(&SyncMessage::Clock { host_now_ms: now })
                                .await
                                .unwrap();
                            host.send_sync(&SyncMessage::SyncStart {
                                host_start_at_ms: now + 1200.0,
                            })
                            .await
                            .unwrap();
                        }
                        _ => {}
                    },
                    Some(env) = client_rx.recv() => match env.event {
                        PeerEvent::IceCandidate(candidate) => {
                            let _ = host.add_ice_candidate(candidate).await;
                        }
                        PeerEvent::StateChanged(LinkState::Connected) => client_connected = true,
                        PeerEvent::Track(track) => remote = Some(track),
                        PeerEvent::Sync { message, .. } => syncs.push(message),
                        _ => {}
                    },
                }
            }
        })
        .await
        .expect("loopback link did not come up");

        assert_eq!(host.state(), LinkState::Connected);
        assert_eq!(client.state(), LinkState::Connected);
        assert!(matches!(syncs[0], SyncMessage::Clock { .. }));
        assert!(matches!(syncs[1], SyncMessage::SyncStart { .. }));

        let mut remote = remote.unwrap();
        let drain = tokio::spawn(async move {
            let mut payload = 0usize;
            while let Some(packet) = remote.packets.recv().await {
                payload += packet.len();
            }
            payload
        });

        let mut stats = client.stats().await;
        for _ in 0..50 {
            if stats.bytes_received > 0 {
                break;
            }
            sleep(Duration::from_millis(100)).await;
            stats = client.stats().await;
        }
        assert!(stats.bytes_received > 0, "no inbound audio: {:?}", stats);

        tracks[0].stop();
        host.close().await;
        client.close().await;
        drain.abort();
    }
}
