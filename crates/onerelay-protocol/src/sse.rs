//! Line framing for `text/event-stream` relays.
//!
//! Upstream frames are forwarded line by line rather than re-assembled into
//! events: a line is relayed when it starts with `data: ` or `[DONE]`, and the
//! payload after that six-byte marker is what gets decoded.

use bytes::Bytes;

pub const DATA_PREFIX: &str = "data: ";
pub const DONE_MARKER: &str = "[DONE]";
pub const DONE_FRAME: &str = "data: [DONE]";

const MARKER_LEN: usize = 6;

/// Splits a byte stream into `\n`-terminated lines.
#[derive(Debug, Default)]
pub struct LineScanner {
    buffer: Vec<u8>,
    /// Bytes of `buffer` already searched for `\n`.
    scanned: usize,
}

impl LineScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every line completed by `chunk`, without the trailing `\n`.
    pub fn push_bytes(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut lines = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.buffer[self.scanned..]
            .iter()
            .position(|byte| *byte == b'\n')
        {
            let end = self.scanned + offset;
            lines.push(String::from_utf8_lossy(&self.buffer[start..end]).into_owned());
            start = end + 1;
            self.scanned = start;
        }
        if start > 0 {
            self.buffer.drain(..start);
        }
        self.scanned = self.buffer.len();
        lines
    }

    /// Flushes an unterminated trailing line at end of input.
    pub fn finish(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        self.scanned = 0;
        let rest = std::mem::take(&mut self.buffer);
        Some(String::from_utf8_lossy(&rest).into_owned())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frame<'a> {
    /// Payload to decode (everything after the marker).
    Data(&'a str),
    /// End of stream marker; forwarded but never decoded.
    Done,
}

/// Classifies one upstream line. `None` means the line is dropped.
pub fn classify_line(line: &str) -> Option<Frame<'_>> {
    if line.len() < MARKER_LEN {
        return None;
    }
    let bytes = line.as_bytes();
    let marker = &bytes[..MARKER_LEN];
    if marker != DATA_PREFIX.as_bytes() && marker != DONE_MARKER.as_bytes() {
        return None;
    }
    // Both markers are ASCII, so the split point is a char boundary.
    let payload = line.get(MARKER_LEN..).unwrap_or_default();
    if payload.starts_with(DONE_MARKER) {
        return Some(Frame::Done);
    }
    Some(Frame::Data(payload))
}

/// Normalizes a relayed line before it is written downstream.
pub fn normalize_line(line: &str) -> &str {
    let line = if line.starts_with(DONE_FRAME) {
        &line[..DONE_FRAME.len()]
    } else {
        line
    };
    line.strip_suffix('\r').unwrap_or(line)
}

/// Encodes a relayed line as a downstream frame.
pub fn encode_line(line: &str) -> Bytes {
    Bytes::from(format!("{}\n\n", normalize_line(line)))
}

/// Wraps a JSON payload into a `data: ` line.
pub fn data_line(payload: &str) -> String {
    format!("{DATA_PREFIX}{payload}")
}
