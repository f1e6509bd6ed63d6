//! UDP host sender thread

use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, info, warn};

use wavecast_core::{AudioPacket, NativeError, PacketFormat};

use super::backend::PcmCapture;

/// Smallest frame ever sent
const MIN_FRAME_BYTES: usize = 320;

/// Resolve peer entries, skipping anything that does not resolve
///
/// Entries may be bare hosts (`10.0.0.4`, `kitchen.local`) or carry their own
/// port (`10.0.0.4:6000`).
pub fn resolve_peers(peers: &[String], port: u16) -> Vec<SocketAddr> {
    let mut targets = Vec::new();
    for entry in peers {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let resolved = entry
            .parse::<SocketAddr>()
            .ok()
            .or_else(|| (entry, port).to_socket_addrs().ok()?.next());
        match resolved {
            Some(addr) if !targets.contains(&addr) => targets.push(addr),
            Some(_) => {}
            None => warn!("Skipping unresolvable peer {:?}", entry),
        }
    }
    targets
}

pub fn frame_bytes(format: &PacketFormat) -> usize {
    format.frame_bytes().max(MIN_FRAME_BYTES)
}

fn frame_duration(format: &PacketFormat) -> Duration {
    if format.sample_rate == 0 {
        return Duration::from_millis(20);
    }
    Duration::from_secs_f64(format.frame_size as f64 / format.sample_rate as f64)
}

/// Capture, packetize and fan out frames until `stop` is set
pub fn run(
    socket: UdpSocket,
    targets: Vec<SocketAddr>,
    format: PacketFormat,
    mut capture: Box<dyn PcmCapture>,
    stop: Arc<AtomicBool>,
) -> Result<(), NativeError> {
    let mut frame = vec![0u8; frame_bytes(&format)];
    let period = frame_duration(&format);
    let started = Instant::now();
    let mut next_deadline = started;
    let mut sequence: u32 = 0;

    info!(
        "UDP sender streaming {}Hz x{} to {} peer(s)",
        format.sample_rate,
        format.channels,
        targets.len()
    );

    while !stop.load(Ordering::SeqCst) {
        let read = capture.read_frame(&mut frame)?;
        // Short reads and an exhausted source are padded with silence
        frame[read..].fill(0);

        let packet = AudioPacket {
            sequence,
            timestamp_us: started.elapsed().as_micros() as u64,
            format,
            payload: Bytes::copy_from_slice(&frame),
        };
        let datagram = packet.encode();
        for target in &targets {
            if let Err(e) = socket.send_to(&datagram, target) {
                debug!("Send to {} failed: {}", target, e);
            }
        }
        sequence = sequence.wrapping_add(1);

        next_deadline += period;
        let now = Instant::now();
        if next_deadline > now {
            thread::sleep(next_deadline - now);
        } else {
            // Fell behind; do not try to catch up with a burst
            next_deadline = now;
        }
    }

    debug!("UDP sender stopped after {} frames", sequence);
    Ok(())
}
