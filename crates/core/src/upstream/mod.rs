//! Camera-side connection handling.
//!
//! [`Upstream`] opens connections; each open yields a [`FrameSource`] that
//! owns one transport plus its byte buffer and hands out complete frames.
//! The supervisor holds at most one source at a time and drops it before
//! opening the next.

pub mod http;

use async_trait::async_trait;

use crate::error::Result;
use crate::media::RawFrame;
use crate::session::StreamTarget;
pub use http::{HttpFrameSource, HttpUpstream};

/// Opens camera connections.
#[async_trait]
pub trait Upstream: Send + Sync {
    /// Connect to `target` and start streaming.
    ///
    /// Fails with `ConnectTimeout`, `ConnectRefused`, `Tls`,
    /// `UpstreamStatus` or `Request`.
    async fn open(&self, target: &StreamTarget) -> Result<Box<dyn FrameSource>>;
}

/// A live camera connection.
#[async_trait]
pub trait FrameSource: Send {
    /// Next complete frame, or `None` when the camera ends the stream.
    ///
    /// Fails with `ReadTimeout` when no frame completes in time,
    /// `StreamClosed` when the transport breaks, and `MalformedStream` when
    /// the buffer bound is exceeded.
    async fn next_frame(&mut self) -> Result<Option<RawFrame>>;

    /// Release the transport. Idempotent; safe after a failure.
    fn close(&mut self);
}
