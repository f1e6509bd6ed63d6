//! Sound card backends for the UDP path

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, TrySendError};
use tracing::{debug, info};

use wavecast_core::{NativeError, PacketFormat};

use super::{
    f32_to_pcm16, has_input_device, loopback_supported, pcm16_to_f32, Endpoint, PlayoutQueue,
    PlayoutSender, StreamThread,
};
use crate::native::backend::{CaptureBackend, PcmCapture, PcmPlayback, PlaybackBackend};

/// Longest a frame read waits for the device; the rest is padded with silence
const READ_TIMEOUT: Duration = Duration::from_millis(200);

/// Callback chunks buffered ahead of the sender
const CAPTURE_CHUNKS: usize = 128;

/// Captures the default input device, or the default output on WASAPI
#[derive(Debug, Default)]
pub struct DeviceCaptureBackend;

struct DevicePcm {
    chunks: Receiver<Vec<u8>>,
    pending: VecDeque<u8>,
    _stream: StreamThread,
}

impl DevicePcm {
    fn open(endpoint: Endpoint, format: &PacketFormat) -> Result<Self, String> {
        let (tx, rx) = bounded::<Vec<u8>>(CAPTURE_CHUNKS);
        let stream = StreamThread::input(
            endpoint,
            format.channels,
            format.sample_rate,
            Arc::new(AtomicBool::new(false)),
            move |samples| {
                let mut pcm = Vec::with_capacity(samples.len() * 2);
                f32_to_pcm16(samples, &mut pcm);
                if let Err(TrySendError::Full(_)) = tx.try_send(pcm) {
                    debug!("Capture queue full, dropping chunk");
                }
            },
        )?;
        info!(
            "Opened {:?} capture at {}Hz x{}",
            endpoint, format.sample_rate, format.channels
        );
        Ok(Self {
            chunks: rx,
            pending: VecDeque::new(),
            _stream: stream,
        })
    }
}

impl PcmCapture for DevicePcm {
    fn read_frame(&mut self, frame: &mut [u8]) -> io::Result<usize> {
        let deadline = Instant::now() + READ_TIMEOUT;
        while self.pending.len() < frame.len() {
            let wait = deadline.saturating_duration_since(Instant::now());
            match self.chunks.recv_timeout(wait) {
                Ok(chunk) => self.pending.extend(chunk),
                Err(RecvTimeoutError::Timeout) => break,
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(io::Error::new(
                        io::ErrorKind::BrokenPipe,
                        "capture stream closed",
                    ))
                }
            }
        }

        let read = self.pending.len().min(frame.len());
        for (slot, byte) in frame.iter_mut().zip(self.pending.drain(..read)) {
            *slot = byte;
        }
        Ok(read)
    }
}

impl CaptureBackend for DeviceCaptureBackend {
    fn has_permission(&self) -> bool {
        has_input_device()
    }

    /// cpal has no permission prompt of its own; opening a stream triggers
    /// the platform's
    fn request_permission(&self) -> bool {
        has_input_device()
    }

    fn open_playback(
        &self,
        format: &PacketFormat,
    ) -> Option<Result<Box<dyn PcmCapture>, NativeError>> {
        if !loopback_supported() {
            return None;
        }
        Some(
            DevicePcm::open(Endpoint::Loopback, format)
                .map(|pcm| Box::new(pcm) as Box<dyn PcmCapture>)
                .map_err(NativeError::Recorder),
        )
    }

    fn open_microphone(&self, format: &PacketFormat) -> Result<Box<dyn PcmCapture>, NativeError> {
        let pcm = DevicePcm::open(Endpoint::Microphone, format).map_err(NativeError::Recorder)?;
        Ok(Box::new(pcm))
    }
}

/// Plays through the default output device
#[derive(Debug, Default)]
pub struct DevicePlaybackBackend;

struct DevicePlayback {
    queue: PlayoutSender,
    _stream: StreamThread,
}

impl PcmPlayback for DevicePlayback {
    fn write_frame(&mut self, pcm: &[u8]) -> io::Result<()> {
        match self.queue.try_send(pcm16_to_f32(pcm)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                debug!("Playout queue full, dropping frame");
                Ok(())
            }
            Err(TrySendError::Disconnected(_)) => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "playback stream closed",
            )),
        }
    }
}

impl PlaybackBackend for DevicePlaybackBackend {
    fn open(&self, format: &PacketFormat) -> Result<Box<dyn PcmPlayback>, NativeError> {
        let (queue, mut playout) = PlayoutQueue::channel();
        let stream = StreamThread::output(
            format.channels,
            format.sample_rate,
            Arc::new(AtomicBool::new(false)),
            move |out| {
                playout.fill(out, true);
            },
        )
        .map_err(NativeError::Playback)?;
        info!(
            "Opened playback at {}Hz x{}",
            format.sample_rate, format.channels
        );
        Ok(Box::new(DevicePlayback {
            queue,
            _stream: stream,
        }))
    }
}
