use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::time::Instant;

/// A complete `[SOI ..= EOI]` byte range cut from the upstream stream.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub payload: Bytes,
}

impl RawFrame {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
        }
    }
}

/// A re-encoded frame ready for a single downstream send.
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    pub payload: Bytes,
    /// 1-based, strictly increasing within a session.
    pub sequence_number: u64,
    pub timestamp: DateTime<Utc>,
    /// `sequence_number / seconds since the first frame`; 0 until time has elapsed.
    pub fps_estimate: f64,
}

/// Per-session frame counter and rate estimator.
///
/// The clock starts on the first stamped frame. Only successfully
/// transcoded frames are stamped.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameClock {
    frame_count: u64,
    started_at: Option<Instant>,
}

impl FrameClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Frames stamped so far.
    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// Assign the next sequence number and compute the rate estimate.
    pub fn stamp(&mut self, payload: Bytes) -> EncodedFrame {
        let started_at = *self.started_at.get_or_insert_with(Instant::now);
        self.frame_count += 1;

        let elapsed = started_at.elapsed().as_secs_f64();
        let fps_estimate = if elapsed > 0.0 {
            self.frame_count as f64 / elapsed
        } else {
            0.0
        };

        EncodedFrame {
            payload,
            sequence_number: self.frame_count,
            timestamp: Utc::now(),
            fps_estimate,
        }
    }
}
