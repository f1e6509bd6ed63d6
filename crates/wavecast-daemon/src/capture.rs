//! Local media capture seam
//!
//! Sources plug in behind [`CaptureDevice`]: the sound card through
//! [`crate::device::DeviceCapture`], or [`SilenceCapture`] on headless hosts.
//! The host only ever sends audio; video from a display capture is stopped
//! and dropped.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, info};
use webrtc::api::media_engine::MIME_TYPE_OPUS;
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use wavecast_core::{CaptureSource, SessionError};

pub const NO_AUDIO_MESSAGE: &str =
    "Screen capture started without audio. Share a tab/window with \"Share audio\" enabled.";

pub const NO_MICROPHONE_MESSAGE: &str = "Microphone capture returned no audio track.";

/// Opus comfort-noise frame (TOC 0xF8, 20 ms)
const OPUS_SILENCE: [u8; 3] = [0xF8, 0xFF, 0xFE];

pub(crate) const OPUS_FRAME: Duration = Duration::from_millis(20);

/// Sample writer for an Opus track at 48 kHz
pub(crate) fn opus_track() -> Arc<TrackLocalStaticSample> {
    Arc::new(TrackLocalStaticSample::new(
        RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            clock_rate: 48_000,
            channels: 2,
            ..Default::default()
        },
        "audio".to_owned(),
        "wavecast".to_owned(),
    ))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

/// A captured track that can be attached to peer connections
#[derive(Clone)]
pub struct MediaTrack {
    pub id: String,
    pub kind: TrackKind,
    pub label: String,
    local: Option<Arc<TrackLocalStaticSample>>,
    stopped: Arc<AtomicBool>,
}

impl fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("label", &self.label)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

impl MediaTrack {
    /// Audio track backed by a WebRTC sample writer
    pub fn audio(
        id: impl Into<String>,
        label: impl Into<String>,
        local: Arc<TrackLocalStaticSample>,
    ) -> Self {
        Self {
            id: id.into(),
            kind: TrackKind::Audio,
            label: label.into(),
            local: Some(local),
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Track with no sample writer; nothing is sent for it
    pub fn detached(id: impl Into<String>, kind: TrackKind, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            label: label.into(),
            local: None,
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn local(&self) -> Option<&Arc<TrackLocalStaticSample>> {
        self.local.as_ref()
    }

    pub fn is_audio(&self) -> bool {
        self.kind == TrackKind::Audio
    }

    /// Stop producing media. Clones share the flag.
    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            debug!("Stopped {:?} track {}", self.kind, self.label);
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Flag raised by [`MediaTrack::stop`], for producers feeding this track
    pub(crate) fn stop_flag(&self) -> Arc<AtomicBool> {
        self.stopped.clone()
    }
}

#[async_trait]
pub trait CaptureDevice: Send + Sync {
    /// Screen/tab capture; may or may not carry audio
    async fn display_media(&self) -> Result<Vec<MediaTrack>, SessionError>;

    async fn user_media(&self) -> Result<Vec<MediaTrack>, SessionError>;
}

/// Acquire the host's audio, keeping audio tracks only
///
/// If the capture has no audio, every acquired track is stopped before the
/// error is returned.
pub async fn capture_host_audio(
    device: &dyn CaptureDevice,
    source: CaptureSource,
) -> Result<Vec<MediaTrack>, SessionError> {
    let (tracks, missing_audio) = match source {
        CaptureSource::Display => (device.display_media().await?, NO_AUDIO_MESSAGE),
        CaptureSource::Microphone => (device.user_media().await?, NO_MICROPHONE_MESSAGE),
    };

    let (audio, other): (Vec<_>, Vec<_>) = tracks.into_iter().partition(MediaTrack::is_audio);
    for track in &other {
        track.stop();
    }

    if audio.is_empty() {
        return Err(SessionError::CaptureDenied(missing_audio.to_string()));
    }

    info!("Captured {} audio track(s) from {:?}", audio.len(), source);
    Ok(audio)
}

/// Capture device producing Opus silence, for hosts without a sound card
#[derive(Debug, Default)]
pub struct SilenceCapture;

impl SilenceCapture {
    fn start_track(&self) -> MediaTrack {
        let local = opus_track();
        let track = MediaTrack::audio("audio", "silence", local.clone());

        let stopped = track.stop_flag();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(OPUS_FRAME);
            while !stopped.load(Ordering::SeqCst) {
                ticker.tick().await;
                let sample = Sample {
                    data: Bytes::from_static(&OPUS_SILENCE),
                    duration: OPUS_FRAME,
                    ..Default::default()
                };
                if let Err(e) = local.write_sample(&sample).await {
                    debug!("Silence writer stopped: {}", e);
                    break;
                }
            }
        });

        track
    }
}

#[async_trait]
impl CaptureDevice for SilenceCapture {
    async fn display_media(&self) -> Result<Vec<MediaTrack>, SessionError> {
        Ok(vec![self.start_track()])
    }

    async fn user_media(&self) -> Result<Vec<MediaTrack>, SessionError> {
        Ok(vec![self.start_track()])
    }
}
