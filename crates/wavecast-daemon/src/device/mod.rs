//! Sound card access through cpal
//!
//! cpal streams are not `Send` on every platform, so each stream is built on a
//! dedicated thread and kept alive there until its stop flag is raised.
//! Callbacks exchange interleaved `f32` samples with the rest of the crate
//! over bounded crossbeam channels.

pub mod media;
pub mod pcm;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::StreamConfig;
use crossbeam_channel::{bounded, Receiver, Sender};
use tracing::{debug, warn};

pub use media::{DeviceCapture, DeviceSink};
pub use pcm::{DeviceCaptureBackend, DevicePlaybackBackend};

/// How often a stream thread checks its stop flag
const STOP_POLL: Duration = Duration::from_millis(10);

/// Chunks queued between an output callback and its producer
const PLAYOUT_CHUNKS: usize = 64;

/// Which side of the default device a stream attaches to
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Endpoint {
    Microphone,
    /// What the default output is playing; WASAPI only
    Loopback,
    Speaker,
}

/// Only WASAPI can open an input stream on an output device
pub fn loopback_supported() -> bool {
    cfg!(target_os = "windows")
}

pub fn has_input_device() -> bool {
    cpal::default_host().default_input_device().is_some()
}

fn default_device(endpoint: Endpoint) -> Result<cpal::Device, String> {
    let host = cpal::default_host();
    match endpoint {
        Endpoint::Microphone => host
            .default_input_device()
            .ok_or_else(|| "No default input device".to_string()),
        Endpoint::Loopback | Endpoint::Speaker => host
            .default_output_device()
            .ok_or_else(|| "No default output device".to_string()),
    }
}

fn stream_config(channels: u16, sample_rate: u32) -> StreamConfig {
    StreamConfig {
        channels,
        sample_rate: cpal::SampleRate(sample_rate),
        buffer_size: cpal::BufferSize::Default,
    }
}

/// A running cpal stream and the thread that owns it
pub struct StreamThread {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl StreamThread {
    /// Capture stream handing each callback's samples to `on_data`
    pub fn input<F>(
        endpoint: Endpoint,
        channels: u16,
        sample_rate: u32,
        stop: Arc<AtomicBool>,
        mut on_data: F,
    ) -> Result<Self, String>
    where
        F: FnMut(&[f32]) + Send + 'static,
    {
        Self::spawn("wavecast-capture", stop, move || {
            let device = default_device(endpoint)?;
            let config = stream_config(channels, sample_rate);
            device
                .build_input_stream(
                    &config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| on_data(data),
                    |err| warn!("Audio input stream error: {}", err),
                    None,
                )
                .map_err(|e| e.to_string())
        })
    }

    /// Playback stream on the default output; `fill` must write every sample
    pub fn output<F>(
        channels: u16,
        sample_rate: u32,
        stop: Arc<AtomicBool>,
        mut fill: F,
    ) -> Result<Self, String>
    where
        F: FnMut(&mut [f32]) + Send + 'static,
    {
        Self::spawn("wavecast-playback", stop, move || {
            let device = default_device(Endpoint::Speaker)?;
            let config = stream_config(channels, sample_rate);
            device
                .build_output_stream(
                    &config,
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| fill(data),
                    |err| warn!("Audio output stream error: {}", err),
                    None,
                )
                .map_err(|e| e.to_string())
        })
    }

    fn spawn<B>(name: &str, stop: Arc<AtomicBool>, build: B) -> Result<Self, String>
    where
        B: FnOnce() -> Result<cpal::Stream, String> + Send + 'static,
    {
        let (ready_tx, ready_rx) = bounded::<Result<(), String>>(1);
        let running = stop.clone();
        let thread = thread::Builder::new()
            .name(name.into())
            .spawn(move || {
                let stream = match build().and_then(|stream| {
                    stream.play().map_err(|e| e.to_string())?;
                    Ok(stream)
                }) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));

                while !running.load(Ordering::Relaxed) {
                    thread::sleep(STOP_POLL);
                }
                drop(stream);
                debug!("Audio stream closed");
            })
            .map_err(|e| e.to_string())?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                stop,
                thread: Some(thread),
            }),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err("Audio stream thread exited".into())
            }
        }
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Audio stream thread panicked");
            }
        }
    }
}

impl Drop for StreamThread {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Append samples as signed 16-bit little-endian PCM
pub fn f32_to_pcm16(samples: &[f32], out: &mut Vec<u8>) {
    out.reserve(samples.len() * 2);
    for sample in samples {
        let value = (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
        out.extend_from_slice(&value.to_le_bytes());
    }
}

/// Signed 16-bit little-endian PCM to `f32`; a trailing odd byte is ignored
pub fn pcm16_to_f32(pcm: &[u8]) -> Vec<f32> {
    pcm.chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / 32768.0)
        .collect()
}

/// Producer half of a playout queue
pub type PlayoutSender = Sender<Vec<f32>>;

/// Feeds an output callback from chunks queued on another thread
///
/// Underruns play silence. While inaudible the queue keeps draining so the
/// stream stays in step with its producer.
pub struct PlayoutQueue {
    chunks: Receiver<Vec<f32>>,
    pending: VecDeque<f32>,
}

impl PlayoutQueue {
    pub fn channel() -> (PlayoutSender, Self) {
        let (tx, rx) = bounded(PLAYOUT_CHUNKS);
        (
            tx,
            Self {
                chunks: rx,
                pending: VecDeque::new(),
            },
        )
    }

    /// Write one callback's worth of samples; returns how many were queued audio
    pub fn fill(&mut self, out: &mut [f32], audible: bool) -> usize {
        while self.pending.len() < out.len() {
            match self.chunks.try_recv() {
                Ok(chunk) => self.pending.extend(chunk),
                Err(_) => break,
            }
        }

        let mut played = 0;
        for slot in out.iter_mut() {
            *slot = match self.pending.pop_front() {
                Some(sample) => {
                    played += 1;
                    if audible {
                        sample
                    } else {
                        0.0
                    }
                }
                None => 0.0,
            };
        }
        played
    }
}
