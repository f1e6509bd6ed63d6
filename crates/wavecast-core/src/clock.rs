//! Clock synchronization between a host and its listeners
//!
//! The host sends `clock` beacons and one `sync-start` per data channel. The
//! client keeps a small window of `hostNowMs - localNowMs` samples and maps the
//! host's start instant into local time with the window mean.

use std::collections::VecDeque;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Number of offset samples kept by a client
pub const OFFSET_WINDOW: usize = 12;

/// Messages carried on the `stream-sync` data channel
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SyncMessage {
    Clock {
        #[serde(rename = "hostNowMs")]
        host_now_ms: f64,
    },
    SyncStart {
        #[serde(rename = "hostStartAtMs")]
        host_start_at_ms: f64,
    },
}

impl SyncMessage {
    /// Parse a data channel text frame. Anything malformed yields `None`.
    pub fn parse(text: &str) -> Option<Self> {
        let msg: SyncMessage = serde_json::from_str(text).ok()?;
        let value = match &msg {
            SyncMessage::Clock { host_now_ms } => *host_now_ms,
            SyncMessage::SyncStart { host_start_at_ms } => *host_start_at_ms,
        };
        value.is_finite().then_some(msg)
    }

    pub fn to_json(&self) -> String {
        // Only finite floats are ever constructed, so this cannot fail
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Bounded ring of clock offset samples
#[derive(Debug, Clone)]
pub struct ClockOffsetWindow {
    samples: VecDeque<f64>,
    capacity: usize,
}

impl Default for ClockOffsetWindow {
    fn default() -> Self {
        Self::new(OFFSET_WINDOW)
    }
}

impl ClockOffsetWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Record one offset sample, evicting the oldest when full
    pub fn push(&mut self, offset_ms: f64) {
        if !offset_ms.is_finite() {
            return;
        }
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(offset_ms);
    }

    /// Record a beacon received at `local_now_ms`
    pub fn observe(&mut self, host_now_ms: f64, local_now_ms: i64) {
        self.push(host_now_ms - local_now_ms as f64);
    }

    /// Unweighted mean of the window; 0 when empty
    pub fn estimate(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().sum::<f64>() / self.samples.len() as f64
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}

/// Delay until the local instant matching `host_start_at_ms`
pub fn start_delay(host_start_at_ms: f64, offset_ms: f64, now_ms: i64) -> Duration {
    let target = host_start_at_ms - offset_ms;
    let wait = target - now_ms as f64;
    if wait.is_finite() && wait > 0.0 {
        Duration::from_millis(wait.ceil() as u64)
    } else {
        Duration::ZERO
    }
}
