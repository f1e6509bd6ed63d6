//! Sound card capture and playout for WebRTC sessions
//!
//! Capture encodes 20 ms Opus frames straight into the host's sample track.
//! Playout decodes the client's remote track into the default output, which
//! stays silent until the sink is playing and unmuted.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use opus::{Application, Channels, Decoder, Encoder};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use webrtc::media::Sample;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use wavecast_core::SessionError;

use super::{loopback_supported, Endpoint, PlayoutQueue, StreamThread};
use crate::capture::{opus_track, CaptureDevice, MediaTrack, OPUS_FRAME};
use crate::peer::RemoteTrack;
use crate::sink::{AudioSink, SinkFactory};

/// Opus runs at 48 kHz on both ends
pub const OPUS_SAMPLE_RATE: u32 = 48_000;

/// Samples per channel in one 20 ms frame
const OPUS_FRAME_SAMPLES: usize = 960;

/// Largest Opus frame is 120 ms
const MAX_DECODED_SAMPLES: usize = OPUS_FRAME_SAMPLES * 6;

const MAX_PACKET_BYTES: usize = 4000;

const CAPTURE_CHUNKS: usize = 128;

/// Accumulates interleaved PCM and emits one Opus packet per full frame
pub struct FrameEncoder {
    encoder: Encoder,
    channels: usize,
    pending: Vec<f32>,
    packet: Vec<u8>,
}

impl FrameEncoder {
    pub fn new(channels: u16) -> Result<Self, String> {
        let layout = match channels {
            1 => Channels::Mono,
            2 => Channels::Stereo,
            n => return Err(format!("Unsupported channel count: {}", n)),
        };
        let encoder = Encoder::new(OPUS_SAMPLE_RATE, layout, Application::Audio)
            .map_err(|e| e.to_string())?;
        Ok(Self {
            encoder,
            channels: channels as usize,
            pending: Vec::new(),
            packet: vec![0; MAX_PACKET_BYTES],
        })
    }

    pub fn push(&mut self, samples: &[f32]) -> Result<Vec<Bytes>, String> {
        self.pending.extend_from_slice(samples);
        let frame = OPUS_FRAME_SAMPLES * self.channels;
        let mut packets = Vec::new();
        while self.pending.len() >= frame {
            let len = self
                .encoder
                .encode_float(&self.pending[..frame], &mut self.packet)
                .map_err(|e| e.to_string())?;
            packets.push(Bytes::copy_from_slice(&self.packet[..len]));
            self.pending.drain(..frame);
        }
        Ok(packets)
    }
}

/// Decodes Opus packets to interleaved stereo
pub struct FrameDecoder {
    decoder: Decoder,
    output: Vec<f32>,
}

impl FrameDecoder {
    pub fn new() -> Result<Self, String> {
        let decoder =
            Decoder::new(OPUS_SAMPLE_RATE, Channels::Stereo).map_err(|e| e.to_string())?;
        Ok(Self {
            decoder,
            output: vec![0.0; MAX_DECODED_SAMPLES * 2],
        })
    }

    pub fn decode(&mut self, packet: &[u8]) -> Result<Vec<f32>, String> {
        let samples = self
            .decoder
            .decode_float(packet, &mut self.output, false)
            .map_err(|e| e.to_string())?;
        Ok(self.output[..samples * 2].to_vec())
    }
}

/// Captures the default input (or WASAPI loopback for display capture)
#[derive(Debug, Default)]
pub struct DeviceCapture;

impl DeviceCapture {
    /// Blocks while the device opens; call from a blocking thread
    fn start_track(endpoint: Endpoint, label: &str) -> Result<MediaTrack, SessionError> {
        let local = opus_track();
        let track = MediaTrack::audio("audio", label, local.clone());
        let (tx, rx) = mpsc::channel::<Vec<f32>>(CAPTURE_CHUNKS);

        // Stereo first; mono-only devices get a mono encoder
        let mut last_error = String::new();
        for channels in [2u16, 1] {
            let chunks = tx.clone();
            let opened = StreamThread::input(
                endpoint,
                channels,
                OPUS_SAMPLE_RATE,
                track.stop_flag(),
                move |samples| {
                    if chunks.try_send(samples.to_vec()).is_err() {
                        debug!("Encoder behind, dropping capture chunk");
                    }
                },
            );
            match opened {
                Ok(stream) => {
                    let encoder =
                        FrameEncoder::new(channels).map_err(SessionError::CaptureDenied)?;
                    info!("Capturing {} ({} channel(s))", label, channels);
                    tokio::spawn(encode(rx, encoder, local, stream));
                    return Ok(track);
                }
                Err(e) => {
                    debug!("{}-channel capture failed: {}", channels, e);
                    last_error = e;
                }
            }
        }
        Err(SessionError::CaptureDenied(format!(
            "Unable to open {}: {}",
            label, last_error
        )))
    }
}

/// Runs until the capture stream goes away, which the track's stop triggers
async fn encode(
    mut chunks: mpsc::Receiver<Vec<f32>>,
    mut encoder: FrameEncoder,
    local: Arc<TrackLocalStaticSample>,
    stream: StreamThread,
) {
    'capture: while let Some(chunk) = chunks.recv().await {
        let packets = match encoder.push(&chunk) {
            Ok(packets) => packets,
            Err(e) => {
                warn!("Opus encode failed: {}", e);
                break;
            }
        };
        for data in packets {
            let sample = Sample {
                data,
                duration: OPUS_FRAME,
                ..Default::default()
            };
            if let Err(e) = local.write_sample(&sample).await {
                debug!("Capture writer stopped: {}", e);
                break 'capture;
            }
        }
    }
    let _ = tokio::task::spawn_blocking(move || drop(stream)).await;
    debug!("Capture encoder finished");
}

async fn open_track(
    endpoint: Endpoint,
    label: &'static str,
) -> Result<Vec<MediaTrack>, SessionError> {
    let track = tokio::task::spawn_blocking(move || DeviceCapture::start_track(endpoint, label))
        .await
        .map_err(|e| SessionError::CaptureDenied(e.to_string()))??;
    Ok(vec![track])
}

#[async_trait]
impl CaptureDevice for DeviceCapture {
    async fn display_media(&self) -> Result<Vec<MediaTrack>, SessionError> {
        if !loopback_supported() {
            return Err(SessionError::CaptureDenied(
                "System audio capture is only available on Windows. Use the microphone source."
                    .into(),
            ));
        }
        open_track(Endpoint::Loopback, "system audio").await
    }

    async fn user_media(&self) -> Result<Vec<MediaTrack>, SessionError> {
        open_track(Endpoint::Microphone, "microphone").await
    }
}

/// Plays the remote track through the default output device
#[derive(Debug, Default)]
pub struct DeviceSink {
    muted: Arc<AtomicBool>,
    playing: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
}

impl DeviceSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn factory() -> SinkFactory {
        Arc::new(|| Box::new(DeviceSink::new()) as Box<dyn AudioSink>)
    }
}

impl AudioSink for DeviceSink {
    fn attach(&mut self, mut track: RemoteTrack) {
        self.release();

        let muted = self.muted.clone();
        let playing = self.playing.clone();
        self.reader = Some(tokio::spawn(async move {
            let (queue, mut playout) = PlayoutQueue::channel();
            let opened = tokio::task::spawn_blocking(move || {
                StreamThread::output(
                    2,
                    OPUS_SAMPLE_RATE,
                    Arc::new(AtomicBool::new(false)),
                    move |out| {
                        let audible =
                            playing.load(Ordering::Relaxed) && !muted.load(Ordering::Relaxed);
                        playout.fill(out, audible);
                    },
                )
            })
            .await;
            let _stream = match opened {
                Ok(Ok(stream)) => Some(stream),
                Ok(Err(e)) => {
                    warn!("Cannot open audio output, remote audio is dropped: {}", e);
                    None
                }
                Err(e) => {
                    warn!("Audio output task failed: {}", e);
                    None
                }
            };
            let mut decoder = match FrameDecoder::new() {
                Ok(decoder) => decoder,
                Err(e) => {
                    warn!("Opus decoder unavailable: {}", e);
                    return;
                }
            };

            while let Some(packet) = track.packets.recv().await {
                match decoder.decode(&packet) {
                    Ok(pcm) => {
                        if queue.try_send(pcm).is_err() {
                            debug!("Playout queue full, dropping frame");
                        }
                    }
                    Err(e) => debug!("Dropping undecodable packet: {}", e),
                }
            }
            debug!("Remote track {} drained", track.id);
        }));
    }

    fn is_attached(&self) -> bool {
        self.reader.is_some()
    }

    fn set_muted(&mut self, muted: bool) {
        self.muted.store(muted, Ordering::Relaxed);
    }

    fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Relaxed)
    }

    fn play(&mut self) {
        self.playing.store(true, Ordering::Relaxed);
    }

    fn release(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        self.playing.store(false, Ordering::Relaxed);
    }
}

impl Drop for DeviceSink {
    fn drop(&mut self) {
        self.release();
    }
}
