//! PCM capture and playback seams for the UDP path
//!
//! Frames are interleaved signed 16-bit little-endian PCM.

use std::io::{self, Read, Write};

use wavecast_core::{NativeError, PacketFormat};

/// Blocking source of PCM frames
pub trait PcmCapture: Send {
    /// Fill `frame`; returns bytes written, 0 once the source is exhausted
    fn read_frame(&mut self, frame: &mut [u8]) -> io::Result<usize>;
}

pub trait CaptureBackend: Send + Sync {
    fn has_permission(&self) -> bool;

    /// Ask the platform for capture permission; true if granted
    fn request_permission(&self) -> bool;

    /// `None` when this platform cannot capture playback audio
    fn open_playback(
        &self,
        format: &PacketFormat,
    ) -> Option<Result<Box<dyn PcmCapture>, NativeError>>;

    fn open_microphone(&self, format: &PacketFormat) -> Result<Box<dyn PcmCapture>, NativeError>;
}

/// Blocking PCM sink
pub trait PcmPlayback: Send {
    fn write_frame(&mut self, pcm: &[u8]) -> io::Result<()>;
}

pub trait PlaybackBackend: Send + Sync {
    fn open(&self, format: &PacketFormat) -> Result<Box<dyn PcmPlayback>, NativeError>;
}

/// Reads raw PCM from stdin as the "microphone"
#[derive(Debug, Default)]
pub struct StdinCapture;

struct StdinPcm {
    stdin: io::Stdin,
}

impl PcmCapture for StdinPcm {
    fn read_frame(&mut self, frame: &mut [u8]) -> io::Result<usize> {
        let mut filled = 0;
        let mut stdin = self.stdin.lock();
        while filled < frame.len() {
            match stdin.read(&mut frame[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(filled)
    }
}

impl CaptureBackend for StdinCapture {
    fn has_permission(&self) -> bool {
        true
    }

    fn request_permission(&self) -> bool {
        true
    }

    fn open_playback(
        &self,
        _format: &PacketFormat,
    ) -> Option<Result<Box<dyn PcmCapture>, NativeError>> {
        None
    }

    fn open_microphone(&self, _format: &PacketFormat) -> Result<Box<dyn PcmCapture>, NativeError> {
        Ok(Box::new(StdinPcm { stdin: io::stdin() }))
    }
}

/// Writes raw PCM to stdout
#[derive(Debug, Default)]
pub struct StdoutPlayback;

struct StdoutPcm {
    stdout: io::Stdout,
}

impl PcmPlayback for StdoutPcm {
    fn write_frame(&mut self, pcm: &[u8]) -> io::Result<()> {
        let mut out = self.stdout.lock();
        out.write_all(pcm)?;
        out.flush()
    }
}

impl PlaybackBackend for StdoutPlayback {
    fn open(&self, _format: &PacketFormat) -> Result<Box<dyn PcmPlayback>, NativeError> {
        Ok(Box::new(StdoutPcm {
            stdout: io::stdout(),
        }))
    }
}
