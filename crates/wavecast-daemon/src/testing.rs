//! In-memory stand-ins for the platform seams

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use wavecast_core::{IceCandidate, SessionDescription, SessionError, SyncMessage};

use crate::capture::{CaptureDevice, MediaTrack};
use crate::peer::{
    next_link_id, LinkState, PeerEvents, PeerFactory, PeerLink, RemoteTrack, TransportStats,
};
use crate::sink::{AudioSink, SinkFactory};

/// Shared record of everything the mock links were asked to do
#[derive(Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    pub fn push(&self, entry: String) {
        self.0.lock().push(entry);
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.0.lock().iter().filter(|e| e.starts_with(prefix)).count()
    }
}

#[derive(Clone, Default)]
pub struct MockPeerFactory {
    pub log: CallLog,
    pub stats: Arc<Mutex<TransportStats>>,
    pub fail_answers: Arc<AtomicBool>,
    /// Every link handed out, newest last
    pub links: Arc<Mutex<Vec<MockLinkHandle>>>,
}

/// Test-side view of a mock link
#[derive(Clone)]
pub struct MockLinkHandle {
    pub id: u64,
    pub peer_id: String,
    pub state: Arc<Mutex<LinkState>>,
}

impl MockPeerFactory {
    pub fn last_link(&self) -> Option<MockLinkHandle> {
        self.links.lock().last().cloned()
    }
}

#[async_trait]
impl PeerFactory for MockPeerFactory {
    async fn create(
        &self,
        peer_id: &str,
        _events: PeerEvents,
    ) -> Result<Box<dyn PeerLink>, SessionError> {
        let link = MockLink {
            id: next_link_id(),
            peer_id: peer_id.to_string(),
            state: Arc::new(Mutex::new(LinkState::New)),
            log: self.log.clone(),
            stats: self.stats.clone(),
            fail_answers: self.fail_answers.load(Ordering::SeqCst),
        };
        self.links.lock().push(MockLinkHandle {
            id: link.id,
            peer_id: link.peer_id.clone(),
            state: link.state.clone(),
        });
        self.log.push(format!("create:{}", peer_id));
        Ok(Box::new(link))
    }
}

pub struct MockLink {
    id: u64,
    peer_id: String,
    state: Arc<Mutex<LinkState>>,
    log: CallLog,
    stats: Arc<Mutex<TransportStats>>,
    fail_answers: bool,
}

#[async_trait]
impl PeerLink for MockLink {
    fn id(&self) -> u64 {
        self.id
    }

    async fn add_track(&self, track: &MediaTrack) -> Result<(), SessionError> {
        self.log.push(format!("track:{}:{}", self.peer_id, track.id));
        Ok(())
    }

    async fn open_sync_channel(&self) -> Result<(), SessionError> {
        self.log.push(format!("channel:{}", self.peer_id));
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, SessionError> {
        self.log.push(format!("offer:{}", self.peer_id));
        Ok(SessionDescription::offer("v=0 mock-offer"))
    }

    async fn create_answer(&self) -> Result<SessionDescription, SessionError> {
        if self.fail_answers {
            return Err(SessionError::NegotiationFailure("mock answer failure".into()));
        }
        self.log.push(format!("answer:{}", self.peer_id));
        Ok(SessionDescription::answer("v=0 mock-answer"))
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), SessionError> {
        self.log.push(format!("remote:{}:{}", self.peer_id, desc.sdp));
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), SessionError> {
        self.log
            .push(format!("candidate:{}:{}", self.peer_id, candidate.candidate));
        Ok(())
    }

    async fn send_sync(&self, message: &SyncMessage) -> Result<(), SessionError> {
        self.log.push(format!("sync:{}:{}", self.peer_id, message.to_json()));
        Ok(())
    }

    fn state(&self) -> LinkState {
        *self.state.lock()
    }

    async fn stats(&self) -> TransportStats {
        *self.stats.lock()
    }

    async fn close(&self) {
        *self.state.lock() = LinkState::Closed;
        self.log.push(format!("close:{}", self.peer_id));
    }
}

/// Capture device returning a fixed set of tracks, or a refusal
pub struct MockCapture {
    display: Vec<MediaTrack>,
    user: Vec<MediaTrack>,
    denied: Option<String>,
}

impl MockCapture {
    pub fn display(tracks: Vec<MediaTrack>) -> Self {
        Self {
            display: tracks,
            user: Vec::new(),
            denied: None,
        }
    }

    pub fn microphone(tracks: Vec<MediaTrack>) -> Self {
        Self {
            display: Vec::new(),
            user: tracks,
            denied: None,
        }
    }

    pub fn denied(message: &str) -> Self {
        Self {
            display: Vec::new(),
            user: Vec::new(),
            denied: Some(message.to_string()),
        }
    }

    fn result(&self, tracks: &[MediaTrack]) -> Result<Vec<MediaTrack>, SessionError> {
        match &self.denied {
            Some(message) => Err(SessionError::CaptureDenied(message.clone())),
            None => Ok(tracks.to_vec()),
        }
    }
}

#[async_trait]
impl CaptureDevice for MockCapture {
    async fn display_media(&self) -> Result<Vec<MediaTrack>, SessionError> {
        self.result(&self.display)
    }

    async fn user_media(&self) -> Result<Vec<MediaTrack>, SessionError> {
        self.result(&self.user)
    }
}

/// Observable sink state
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SinkState {
    pub attached: bool,
    pub muted: bool,
    pub playing: bool,
    pub released: bool,
}

#[derive(Clone, Default)]
pub struct MockSink {
    pub state: Arc<Mutex<SinkState>>,
}

impl MockSink {
    pub fn factory(&self) -> SinkFactory {
        let state = self.state.clone();
        Arc::new(move || Box::new(MockSink { state: state.clone() }) as Box<dyn AudioSink>)
    }

    pub fn snapshot(&self) -> SinkState {
        self.state.lock().clone()
    }
}

impl AudioSink for MockSink {
    fn attach(&mut self, _track: RemoteTrack) {
        let mut state = self.state.lock();
        state.attached = true;
        state.released = false;
    }

    fn is_attached(&self) -> bool {
        self.state.lock().attached
    }

    fn set_muted(&mut self, muted: bool) {
        self.state.lock().muted = muted;
    }

    fn is_muted(&self) -> bool {
        self.state.lock().muted
    }

    fn play(&mut self) {
        self.state.lock().playing = true;
    }

    fn release(&mut self) {
        let mut state = self.state.lock();
        state.attached = false;
        state.playing = false;
        state.released = true;
    }
}
