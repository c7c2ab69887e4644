//! Captured frames and the replay ring buffer.
//!
//! - `Frame`: one JPEG image cut from the capture stream, stamped at extraction.
//! - `FrameRingBuffer`: bounded, time-ordered store of recent frames for replays.
//!
//! Frames are immutable once extracted. The payload is shared behind an `Arc`,
//! so handing a frame to a caller copies the entry, never the bytes, and no
//! caller can observe a later mutation of the buffer.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Default buffer capacity: 5 minutes at 15 fps.
pub const DEFAULT_BUFFER_FRAMES: usize = 4500;

/// Default maximum frame age kept for replays.
pub const DEFAULT_MAX_AGE_SECS: u64 = 300;

/// Wall-clock milliseconds since the unix epoch.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ----------------------------------------------------------------------------
// Frame
// ----------------------------------------------------------------------------

/// A complete JPEG image (`FF D8 .. FF D9`) with its capture timestamp.
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    timestamp_ms: u64,
    payload: Arc<[u8]>,
}

impl Frame {
    pub fn new(timestamp_ms: u64, payload: impl Into<Arc<[u8]>>) -> Self {
        Self {
            timestamp_ms,
            payload: payload.into(),
        }
    }

    /// Stamp a payload with the current wall-clock time.
    pub fn now(payload: impl Into<Arc<[u8]>>) -> Self {
        Self::new(unix_millis(), payload)
    }

    pub fn timestamp_ms(&self) -> u64 {
        self.timestamp_ms
    }

    /// Capture time truncated to whole seconds.
    pub fn timestamp_secs(&self) -> u64 {
        self.timestamp_ms / 1000
    }

    pub fn bytes(&self) -> &[u8] {
        &self.payload
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    fn restamped(&self, timestamp_ms: u64) -> Self {
        Self {
            timestamp_ms,
            payload: Arc::clone(&self.payload),
        }
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("timestamp_ms", &self.timestamp_ms)
            .field("len", &self.payload.len())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// FrameRingBuffer
// ----------------------------------------------------------------------------

/// Bounded ring buffer of recent frames.
///
/// - Keeps at most `capacity` frames; pushing beyond that evicts the oldest first.
/// - Frames older than `max_age` relative to the newest push are evicted.
/// - Timestamps never decrease: a frame stamped earlier than the newest entry
///   (wall clock stepped back) is clamped to the newest timestamp.
pub struct FrameRingBuffer {
    buffer: VecDeque<Frame>,
    capacity: usize,
    max_age_ms: u64,
}

impl FrameRingBuffer {
    pub fn new(capacity: usize, max_age: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            buffer: VecDeque::with_capacity(capacity.min(DEFAULT_BUFFER_FRAMES)),
            capacity,
            max_age_ms: max_age.as_millis() as u64,
        }
    }

    /// Push a frame. Evicts old frames as needed.
    pub fn push(&mut self, frame: Frame) {
        let frame = match self.buffer.back() {
            Some(newest) if frame.timestamp_ms < newest.timestamp_ms => {
                log::debug!(
                    "frame timestamp {} precedes buffer head {}, clamping",
                    frame.timestamp_ms,
                    newest.timestamp_ms
                );
                frame.restamped(newest.timestamp_ms)
            }
            _ => frame,
        };

        // Evict frames older than max_age
        while let Some(oldest) = self.buffer.front() {
            if frame.timestamp_ms.saturating_sub(oldest.timestamp_ms) > self.max_age_ms {
                self.buffer.pop_front();
            } else {
                break;
            }
        }

        // Evict if at capacity
        while self.buffer.len() >= self.capacity {
            self.buffer.pop_front();
        }

        self.buffer.push_back(frame);
    }

    /// Copy out every frame with `timestamp_ms >= cutoff_ms`, oldest first.
    pub fn snapshot_since(&self, cutoff_ms: u64) -> Vec<Frame> {
        self.buffer
            .iter()
            .filter(|frame| frame.timestamp_ms >= cutoff_ms)
            .cloned()
            .collect()
    }

    /// Most recent frame (non-consuming).
    pub fn latest(&self) -> Option<&Frame> {
        self.buffer.back()
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// Payload bytes held by the buffer.
    pub fn memory_bytes(&self) -> usize {
        self.buffer.iter().map(Frame::len).sum()
    }
}

impl Default for FrameRingBuffer {
    fn default() -> Self {
        Self::new(
            DEFAULT_BUFFER_FRAMES,
            Duration::from_secs(DEFAULT_MAX_AGE_SECS),
        )
    }
}
