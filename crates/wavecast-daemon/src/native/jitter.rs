//! Sequence-ordered jitter buffer

use std::collections::BTreeMap;

use bytes::Bytes;
use tracing::debug;

/// Holds up to `depth` frames; anything beyond that is released lowest
/// sequence first. Late frames that sort below already-released ones are
/// still emitted, there is no retransmission or concealment. A sequence that
/// falls more than `depth` behind the newest one seen means the sender
/// restarted, and everything held from the old stream is dropped.
#[derive(Debug)]
pub struct JitterBuffer {
    frames: BTreeMap<u32, Bytes>,
    depth: usize,
    newest: Option<u32>,
}

impl JitterBuffer {
    pub fn new(depth: usize) -> Self {
        Self {
            frames: BTreeMap::new(),
            depth: depth.max(1),
            newest: None,
        }
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Insert a frame and return whatever is now ready for playout
    pub fn push(&mut self, sequence: u32, frame: Bytes) -> Vec<Bytes> {
        match self.newest {
            Some(newest) if newest > sequence && newest - sequence > self.depth as u32 => {
                debug!(
                    "Sequence fell back from {} to {}, dropping {} stale frame(s)",
                    newest,
                    sequence,
                    self.frames.len()
                );
                self.frames.clear();
                self.newest = Some(sequence);
            }
            Some(newest) if newest >= sequence => {}
            _ => self.newest = Some(sequence),
        }

        self.frames.insert(sequence, frame);
        let mut ready = Vec::new();
        while self.frames.len() > self.depth {
            if let Some((_, frame)) = self.frames.pop_first() {
                ready.push(frame);
            }
        }
        ready
    }

    pub fn clear(&mut self) {
        self.frames.clear();
        self.newest = None;
    }
}
