//! UDP client receiver thread

use std::io;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use wavecast_core::{AudioPacket, NativeAudioStatus, NativeError, PacketFormat};

use super::backend::{PcmPlayback, PlaybackBackend};
use super::jitter::JitterBuffer;

const MAX_DATAGRAM: usize = 65_536;

/// Packets from anyone but the configured host are dropped
pub fn accepts(from: &SocketAddr, host: Option<IpAddr>) -> bool {
    match host {
        Some(host) => from.ip() == host,
        None => true,
    }
}

pub struct Receiver {
    pub socket: UdpSocket,
    pub host: Option<IpAddr>,
    pub format: PacketFormat,
    pub playback: Box<dyn PcmPlayback>,
    pub backend: Arc<dyn PlaybackBackend>,
    pub jitter: JitterBuffer,
    pub status: Arc<Mutex<NativeAudioStatus>>,
}

impl Receiver {
    /// Receive and play until `stop` is set; the socket's read timeout bounds
    /// how long a stop request can go unnoticed
    pub fn run(mut self, stop: Arc<AtomicBool>) -> Result<(), NativeError> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let mut playback = Some(self.playback);

        info!(
            "UDP receiver listening on {:?} (jitter depth {})",
            self.socket.local_addr().ok(),
            self.jitter.depth()
        );

        while !stop.load(Ordering::SeqCst) {
            let (len, from) = match self.socket.recv_from(&mut buf) {
                Ok(received) => received,
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                    ) =>
                {
                    continue
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };

            if !accepts(&from, self.host) {
                debug!("Dropping datagram from {}", from);
                continue;
            }

            let packet = match AudioPacket::decode(&buf[..len]) {
                Ok(packet) => packet,
                Err(e) => {
                    debug!("Dropping datagram from {}: {}", from, e);
                    continue;
                }
            };

            if packet.format != self.format {
                info!(
                    "Stream format changed to {}Hz x{} / {} samples",
                    packet.format.sample_rate, packet.format.channels, packet.format.frame_size
                );
                self.format = packet.format;
                self.jitter.clear();
                playback = match self.backend.open(&self.format) {
                    Ok(sink) => Some(sink),
                    Err(e) => {
                        warn!("{}", e);
                        self.status.lock().last_error = Some(e.to_string());
                        None
                    }
                };
            }

            for frame in self.jitter.push(packet.sequence, packet.payload) {
                if let Some(sink) = playback.as_mut() {
                    if let Err(e) = sink.write_frame(&frame) {
                        warn!("Playback write failed: {}", e);
                        self.status.lock().last_error = Some(e.to_string());
                        playback = None;
                    }
                }
            }
        }

        debug!("UDP receiver stopped");
        Ok(())
    }
}
