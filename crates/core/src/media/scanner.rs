use super::frame::RawFrame;

/// JPEG start-of-image marker.
pub const SOI: [u8; 2] = [0xFF, 0xD8];
/// JPEG end-of-image marker.
pub const EOI: [u8; 2] = [0xFF, 0xD9];

/// Incremental JPEG frame extractor for an MJPEG byte stream.
///
/// Each [`push`](Self::push) appends a chunk and returns every complete
/// `[SOI ..= EOI]` region now in the buffer, in stream order. Bytes ahead
/// of a start marker (multipart headers, a stray EOI, truncated lead-in) are
/// dropped once that start marker is found. Whatever follows the last
/// complete frame stays buffered for the next call.
///
/// Output does not depend on how the stream is split into chunks. The
/// scanner never bounds its own buffer; the owner checks
/// [`buffered`](Self::buffered) and gives up on streams that never close a
/// frame.
#[derive(Debug, Default)]
pub struct FrameScanner {
    buffer: Vec<u8>,
    /// Offset from which the pending EOI search resumes.
    resume_at: usize,
}

impl FrameScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes currently held (partial frame plus any lead-in).
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// The unconsumed remainder.
    pub fn remainder(&self) -> &[u8] {
        &self.buffer
    }

    /// Discard all buffered bytes.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.resume_at = 0;
    }

    /// Append a chunk and extract every frame it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<RawFrame> {
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        let mut consumed = 0usize;

        loop {
            let window = &self.buffer[consumed..];
            let Some(start) = find_marker(window, &SOI, 0) else {
                break;
            };
            let start = consumed + start;

            // The pending search offset is relative to a buffer whose frame
            // start is at index 0 after compaction.
            let search_from = if consumed == 0 && start == 0 {
                self.resume_at.max(2)
            } else {
                2
            };

            match find_marker(&self.buffer[start..], &EOI, search_from) {
                Some(end_rel) => {
                    let end = start + end_rel + EOI.len();
                    frames.push(RawFrame::new(self.buffer[start..end].to_vec()));
                    consumed = end;
                    self.resume_at = 0;
                }
                None => {
                    // Drop the lead-in so the partial frame sits at index 0.
                    consumed = start;
                    let partial_len = self.buffer.len() - start;
                    // Back up one byte: an FF at the tail may pair with the next chunk.
                    self.resume_at = partial_len.saturating_sub(1).max(2);
                    break;
                }
            }
        }

        if consumed > 0 {
            self.buffer.drain(..consumed);
        }

        if !frames.is_empty() {
            tracing::trace!(
                frames = frames.len(),
                remainder = self.buffer.len(),
                "extracted JPEG frames"
            );
        }

        frames
    }
}

/// Position of `marker` in `buf` at or after `from`.
fn find_marker(buf: &[u8], marker: &[u8; 2], from: usize) -> Option<usize> {
    if from >= buf.len() {
        return None;
    }
    buf[from..]
        .windows(2)
        .position(|w| w == marker)
        .map(|pos| pos + from)
}
