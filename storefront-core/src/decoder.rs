//! Line framing for the assistant's event stream.
//!
//! The backend writes newline-delimited `data: ` lines and ends with
//! `data: [DONE]`. Network chunks do not line up with those lines, so the
//! decoder keeps the undelimited tail as raw bytes (a multi-byte character
//! may be split too) and only emits lines once their delimiter has arrived.

use bytes::BytesMut;

pub const DATA_PREFIX: &str = "data:";
pub const DONE_SENTINEL: &str = "[DONE]";

/// A complete line of the stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Line {
    /// The `[DONE]` terminator
    Done,
    /// A `data:` line, prefix included
    Data(String),
}

/// Returns the payload of a `data:` line, or None for any other line.
pub fn strip_data_prefix(line: &str) -> Option<&str> {
    line.strip_prefix(DATA_PREFIX).map(str::trim)
}

#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: BytesMut,
    // bytes of `buffer` already known to hold no newline
    scanned: usize,
    finished: bool,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// True once the terminator has been seen or `finish` was called.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Feed the next chunk, returning every line it completes.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Line> {
        if self.finished {
            return Vec::new();
        }
        self.buffer.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(offset) = self.buffer[self.scanned..].iter().position(|b| *b == b'\n') {
            let end = self.scanned + offset;
            let raw = self.buffer.split_to(end + 1);
            self.scanned = 0;

            let Some(line) = Self::classify(&raw[..end]) else {
                continue;
            };
            if line == Line::Done {
                self.finish_with_done();
                lines.push(line);
                return lines;
            }
            lines.push(line);
        }
        self.scanned = self.buffer.len();
        lines
    }

    /// Mark the end of input. Returns the undelimited tail, if any, which is
    /// dropped rather than emitted since it cannot be known to be complete.
    pub fn finish(&mut self) -> Option<String> {
        self.finished = true;
        let tail = String::from_utf8_lossy(&self.buffer).trim().to_string();
        self.buffer.clear();
        self.scanned = 0;
        (!tail.is_empty()).then_some(tail)
    }

    fn finish_with_done(&mut self) {
        self.finished = true;
        self.buffer.clear();
        self.scanned = 0;
    }

    fn classify(raw: &[u8]) -> Option<Line> {
        let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
        let text = String::from_utf8_lossy(raw);
        let payload = strip_data_prefix(&text)?;
        if payload == DONE_SENTINEL {
            Some(Line::Done)
        } else if payload.is_empty() {
            None
        } else {
            Some(Line::Data(text.into_owned()))
        }
    }
}
