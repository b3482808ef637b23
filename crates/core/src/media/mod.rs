//! Frame extraction and JPEG re-encoding.
//!
//! An MJPEG body is a run of independent JPEG images, usually wrapped in
//! `multipart/x-mixed-replace` part headers. The relay ignores the multipart
//! framing entirely and keys on the JPEG markers instead:
//!
//! | Marker | Bytes | Meaning |
//! |--------|-------|---------|
//! | SOI | `FF D8` | start of image |
//! | EOI | `FF D9` | end of image |
//!
//! [`scanner::FrameScanner`] cuts `[SOI ..= EOI]` regions out of the byte
//! stream as [`RawFrame`]s. A [`Transcoder`] turns each payload into a
//! smaller JPEG, and [`FrameClock`] stamps the result with its sequence
//! number and frame-rate estimate.

pub mod frame;
pub mod jpeg;
pub mod scanner;

use bytes::Bytes;

use crate::error::Result;
pub use frame::{EncodedFrame, FrameClock, RawFrame};
pub use jpeg::JpegTranscoder;
pub use scanner::FrameScanner;

/// Re-encodes one frame payload.
///
/// Implementations are CPU-bound and stateless; the supervisor runs them on
/// the blocking pool. A payload that does not decode must return
/// [`RelayError::Decode`](crate::RelayError::Decode) so the frame can be
/// skipped without ending the session.
pub trait Transcoder: Send + Sync {
    /// Decode `payload` and return the re-encoded bytes.
    fn reencode(&self, payload: &[u8]) -> Result<Bytes>;

    /// Re-encode a frame and stamp it with the next sequence number.
    ///
    /// The clock only advances when re-encoding succeeds, so skipped
    /// frames leave no gaps in the sequence.
    fn transcode(&self, raw: &RawFrame, clock: &mut FrameClock) -> Result<EncodedFrame> {
        let payload = self.reencode(&raw.payload)?;
        Ok(clock.stamp(payload))
    }
}
