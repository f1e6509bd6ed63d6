//! Audio playout seam
//!
//! The client attaches the host's remote track to an [`AudioSink`] muted and
//! playing; the scheduled start unmutes it.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::debug;

use crate::peer::RemoteTrack;

pub trait AudioSink: Send {
    fn attach(&mut self, track: RemoteTrack);

    fn is_attached(&self) -> bool;

    fn set_muted(&mut self, muted: bool);

    fn is_muted(&self) -> bool;

    fn play(&mut self);

    /// Detach and stop; the sink is unusable afterwards
    fn release(&mut self);
}

pub type SinkFactory = Arc<dyn Fn() -> Box<dyn AudioSink> + Send + Sync>;

/// Counters shared by every [`MeterSink`] made from one meter
#[derive(Clone, Debug, Default)]
pub struct PlayoutMeter {
    received: Arc<AtomicU64>,
    audible: Arc<AtomicU64>,
}

impl PlayoutMeter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Payload bytes pulled off the remote track
    pub fn received_bytes(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    /// Payload bytes that arrived while unmuted and playing
    pub fn audible_bytes(&self) -> u64 {
        self.audible.load(Ordering::Relaxed)
    }

    pub fn sink(&self) -> MeterSink {
        MeterSink {
            meter: self.clone(),
            muted: Arc::new(AtomicBool::new(false)),
            playing: Arc::new(AtomicBool::new(false)),
            reader: None,
        }
    }

    pub fn factory(&self) -> SinkFactory {
        let meter = self.clone();
        Arc::new(move || Box::new(meter.sink()) as Box<dyn AudioSink>)
    }
}

/// Sink that consumes packets and counts them instead of rendering
#[derive(Debug)]
pub struct MeterSink {
    meter: PlayoutMeter,
    muted: Arc<AtomicBool>,
    playing: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
}

impl AudioSink for MeterSink {
    fn attach(&mut self, mut track: RemoteTrack) {
        self.release();

        let meter = self.meter.clone();
        let muted = self.muted.clone();
        let playing = self.playing.clone();
        self.reader = Some(tokio::spawn(async move {
            while let Some(packet) = track.packets.recv().await {
                let len = packet.len() as u64;
                meter.received.fetch_add(len, Ordering::Relaxed);
                if playing.load(Ordering::Relaxed) && !muted.load(Ordering::Relaxed) {
                    meter.audible.fetch_add(len, Ordering::Relaxed);
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

impl Drop for MeterSink {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_meter_counts_only_audible_bytes() {
        let meter = PlayoutMeter::new();
        let mut sink = meter.sink();
        let (tx, rx) = mpsc::channel(8);
        sink.attach(RemoteTrack {
            id: "audio".into(),
            packets: rx,
        });
        sink.set_muted(true);
        sink.play();
        assert!(sink.is_attached());

        tx.send(Bytes::from_static(&[0; 10])).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(meter.received_bytes(), 10);
        assert_eq!(meter.audible_bytes(), 0);

        sink.set_muted(false);
        tx.send(Bytes::from_static(&[0; 4])).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(meter.received_bytes(), 14);
        assert_eq!(meter.audible_bytes(), 4);

        sink.release();
        assert!(!sink.is_attached());
    }
}
