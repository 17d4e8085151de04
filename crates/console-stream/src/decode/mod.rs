//! Wire decoding: pure per-chunk decoders plus the per-connection frame buffer
//! that reassembles records split across transport chunks.

mod lines;
mod sse;

use std::sync::Arc;

pub use lines::JsonLinesDecoder;
pub use sse::SseDecoder;

use crate::errors::DecodeError;
use crate::event::StreamEvent;

/// Outcome for one record of a chunk.
pub type DecodeResult = Result<StreamEvent, DecodeError>;

/// Where one record ends and the next begins.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordBoundary {
    /// One record per line.
    Newline,
    /// Records separated by an empty line (server-sent events).
    BlankLine,
}

/// Pure chunk decoder.
///
/// Implementations must be stateless: the same chunk always decodes to the same
/// results, and one bad record never aborts the rest of the chunk.
pub trait FrameDecoder: Send + Sync {
    /// Decodes every complete record in `chunk`, in order.
    fn decode(&self, chunk: &[u8]) -> Vec<DecodeResult>;

    /// Record boundary used by this wire format.
    fn boundary(&self) -> RecordBoundary;
}

/// Wire formats spoken by the console backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireFormat {
    /// Newline-delimited JSON log records.
    JsonLines,
    /// Server-sent events carrying text deltas, terminated by `[DONE]`.
    ServerSentEvents,
}

impl WireFormat {
    /// Returns the decoder for this format.
    pub fn decoder(&self) -> Arc<dyn FrameDecoder> {
        match self {
            Self::JsonLines => Arc::new(JsonLinesDecoder),
            Self::ServerSentEvents => Arc::new(SseDecoder::default()),
        }
    }
}

/// Default limit on bytes held back for one unterminated record.
pub const DEFAULT_MAX_RECORD_BYTES: usize = 1 << 20;

// Bytes kept while skipping so a boundary split across chunks is still seen.
const BOUNDARY_OVERLAP: usize = 3;

/// What one [`FrameBuffer::push`] produced.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Frames {
    /// Every complete record received so far, boundaries included.
    pub records: Option<Vec<u8>>,
    /// Set when the pending record outgrew the limit. The record is dropped
    /// up to its next boundary; this is reported once per record.
    pub oversized: Option<DecodeError>,
}

/// Reassembles records split across transport chunks for one physical
/// connection.
///
/// A new connection must start with a new buffer so a partial record from a
/// dead connection never prefixes data from the next one. At most
/// `max_record_bytes` are held back for an unterminated record.
#[derive(Debug)]
pub struct FrameBuffer {
    boundary: RecordBoundary,
    buf: Vec<u8>,
    max_record_bytes: usize,
    skipping: bool,
}

impl FrameBuffer {
    pub fn new(boundary: RecordBoundary) -> Self {
        Self::with_max_record_bytes(boundary, DEFAULT_MAX_RECORD_BYTES)
    }

    pub fn with_max_record_bytes(boundary: RecordBoundary, max_record_bytes: usize) -> Self {
        Self {
            boundary,
            buf: Vec::new(),
            max_record_bytes: max_record_bytes.max(1),
            skipping: false,
        }
    }

    /// Appends `chunk` and returns the complete records received so far,
    /// plus an error when the pending record grew past the limit.
    pub fn push(&mut self, chunk: &[u8]) -> Frames {
        self.buf.extend_from_slice(chunk);
        let mut frames = Frames::default();

        if let Some(end) = self.last_boundary_end() {
            let rest = self.buf.split_off(end);
            let mut complete = std::mem::replace(&mut self.buf, rest);
            if self.skipping {
                self.skipping = false;
                let skipped = self.first_boundary_end(&complete).unwrap_or(complete.len());
                complete.drain(..skipped);
            }
            if !complete.is_empty() {
                frames.records = Some(complete);
            }
        }

        if self.buf.len() > self.max_record_bytes {
            if !self.skipping {
                frames.oversized = Some(DecodeError::oversized(&self.buf, self.max_record_bytes));
                self.skipping = true;
            }
            let keep = self.buf.len().min(BOUNDARY_OVERLAP);
            self.buf.drain(..self.buf.len() - keep);
        }
        frames
    }

    /// Takes whatever is left once the connection has ended.
    pub fn finish(&mut self) -> Option<Vec<u8>> {
        if self.skipping {
            self.skipping = false;
            self.buf.clear();
            return None;
        }
        if self.buf.iter().all(u8::is_ascii_whitespace) {
            self.buf.clear();
            return None;
        }
        Some(std::mem::take(&mut self.buf))
    }

    /// Bytes held back waiting for a boundary.
    pub fn pending_len(&self) -> usize {
        self.buf.len()
    }

    fn last_boundary_end(&self) -> Option<usize> {
        match self.boundary {
            RecordBoundary::Newline => last_newline_end(&self.buf),
            RecordBoundary::BlankLine => last_blank_line_end(&self.buf),
        }
    }

    fn first_boundary_end(&self, buf: &[u8]) -> Option<usize> {
        match self.boundary {
            RecordBoundary::Newline => buf.iter().position(|b| *b == b'\n').map(|idx| idx + 1),
            RecordBoundary::BlankLine => {
                let lf = buf.windows(2).position(|w| w == b"\n\n").map(|idx| idx + 2);
                let crlf = buf
                    .windows(4)
                    .position(|w| w == b"\r\n\r\n")
                    .map(|idx| idx + 4);
                match (lf, crlf) {
                    (Some(a), Some(b)) => Some(a.min(b)),
                    (a, b) => a.or(b),
                }
            }
        }
    }
}

fn last_newline_end(buf: &[u8]) -> Option<usize> {
    buf.iter().rposition(|b| *b == b'\n').map(|idx| idx + 1)
}

fn last_blank_line_end(buf: &[u8]) -> Option<usize> {
    let lf = buf
        .windows(2)
        .rposition(|w| w == b"\n\n")
        .map(|idx| idx + 2);
    let crlf = buf
        .windows(4)
        .rposition(|w| w == b"\r\n\r\n")
        .map(|idx| idx + 4);
    lf.max(crlf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn newline_buffer_holds_partial_record() {
        let mut buffer = FrameBuffer::new(RecordBoundary::Newline);
        assert_eq!(
            buffer.push(b"{\"message\":\"a\"}\n{\"mess").records,
            Some(b"{\"message\":\"a\"}\n".to_vec())
        );
        assert_eq!(buffer.pending_len(), 6);
        assert_eq!(buffer.push(b"age\":\"b\"}"), Frames::default());
        assert_eq!(
            buffer.push(b"\n").records,
            Some(b"{\"message\":\"b\"}\n".to_vec())
        );
        assert_eq!(buffer.pending_len(), 0);
    }

    #[test]
    fn blank_line_buffer_splits_on_last_event_boundary() {
        let mut buffer = FrameBuffer::new(RecordBoundary::BlankLine);
        let out = buffer.push(b"data: a\n\ndata: b\n\ndata: c");
        assert_eq!(out.records, Some(b"data: a\n\ndata: b\n\n".to_vec()));
        assert_eq!(
            buffer.push(b"\r\n\r\n").records,
            Some(b"data: c\r\n\r\n".to_vec())
        );
    }

    #[test]
    fn finish_returns_unterminated_tail_only_when_meaningful() {
        let mut buffer = FrameBuffer::new(RecordBoundary::Newline);
        assert_eq!(buffer.push(b"  \r"), Frames::default());
        assert_eq!(buffer.finish(), None);
        assert_eq!(buffer.push(b"{\"message\":\"tail\"}"), Frames::default());
        assert_eq!(buffer.finish(), Some(b"{\"message\":\"tail\"}".to_vec()));
        assert_eq!(buffer.finish(), None);
    }

    #[test]
    fn oversized_record_is_reported_once_and_skipped_to_its_boundary() {
        let mut buffer = FrameBuffer::with_max_record_bytes(RecordBoundary::Newline, 16);
        let frames = buffer.push(b"{\"message\":\"ok\"}\n{\"message\":\"aaaaaaaa");
        assert_eq!(frames.records, Some(b"{\"message\":\"ok\"}\n".to_vec()));
        let err = frames.oversized.expect("oversized record");
        assert_eq!(err.kind, crate::errors::DecodeErrorKind::OversizedRecord);
        assert!(err.record.starts_with("{\"message\""));
        assert!(buffer.pending_len() <= 16);

        for _ in 0..100 {
            let frames = buffer.push(&[b'a'; 64]);
            assert_eq!(frames, Frames::default());
            assert!(buffer.pending_len() <= 16);
        }

        let frames = buffer.push(b"aa\"}\n{\"message\":\"next\"}\n");
        assert_eq!(frames.oversized, None);
        assert_eq!(frames.records, Some(b"{\"message\":\"next\"}\n".to_vec()));
        assert_eq!(buffer.finish(), None);
    }

    #[test]
    fn oversized_event_skips_to_blank_line_split_across_chunks() {
        let mut buffer = FrameBuffer::with_max_record_bytes(RecordBoundary::BlankLine, 8);
        assert!(buffer.push(b"data: 0123456789").oversized.is_some());
        assert_eq!(buffer.push(b"\n").records, None);
        assert_eq!(
            buffer.push(b"\ndata: b\n\n").records,
            Some(b"data: b\n\n".to_vec())
        );
    }

    #[test]
    fn connection_end_while_skipping_yields_nothing() {
        let mut buffer = FrameBuffer::with_max_record_bytes(RecordBoundary::Newline, 4);
        assert!(buffer.push(b"0123456789").oversized.is_some());
        assert_eq!(buffer.finish(), None);
    }

    #[test]
    fn wire_format_selects_matching_boundary() {
        assert_eq!(WireFormat::JsonLines.decoder().boundary(), RecordBoundary::Newline);
        assert_eq!(
            WireFormat::ServerSentEvents.decoder().boundary(),
            RecordBoundary::BlankLine
        );
    }
}
