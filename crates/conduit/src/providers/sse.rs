//! Server-sent-event framing for OpenAI-compatible streaming responses.
//!
//! Only `data:` fields matter; comments, `event:`, `id:` and `retry:` lines
//! are ignored. An event ends at a blank line, and the payload `[DONE]` ends
//! the stream.

use crate::errors::{ConduitError, ConduitResult};

pub const DONE_SENTINEL: &str = "[DONE]";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseFrame {
    /// The payload of one complete event
    Data(String),
    /// The terminal sentinel
    Done,
}

/// Frame a payload as a single server-sent event.
pub fn encode_frame(payload: &str) -> String {
    format!("data: {payload}\n\n")
}

/// The terminal event
pub fn done_frame() -> String {
    encode_frame(DONE_SENTINEL)
}

/// Incremental parser; bytes of a line are buffered until its newline arrives.
#[derive(Debug, Default)]
pub struct SseParser {
    line_buffer: Vec<u8>,
    data_lines: Vec<String>,
}

impl SseParser {
    pub fn push(&mut self, chunk: &[u8]) -> ConduitResult<Vec<SseFrame>> {
        let mut frames = Vec::new();
        for byte in chunk {
            if *byte == b'\n' {
                let line = std::mem::take(&mut self.line_buffer);
                self.process_line(&line, &mut frames)?;
            } else {
                self.line_buffer.push(*byte);
            }
        }
        Ok(frames)
    }

    /// Flush whatever is pending once the body has ended.
    pub fn finish(mut self) -> ConduitResult<Vec<SseFrame>> {
        let mut frames = Vec::new();
        if !self.line_buffer.is_empty() {
            let line = std::mem::take(&mut self.line_buffer);
            self.process_line(&line, &mut frames)?;
        }
        self.flush_event(&mut frames);
        Ok(frames)
    }

    fn process_line(&mut self, line: &[u8], frames: &mut Vec<SseFrame>) -> ConduitResult<()> {
        let line = line.strip_suffix(b"\r").unwrap_or(line);

        if line.is_empty() {
            self.flush_event(frames);
            return Ok(());
        }

        if let Some(data) = line.strip_prefix(b"data:") {
            let data = data.strip_prefix(b" ").unwrap_or(data);
            let data = std::str::from_utf8(data).map_err(|e| {
                ConduitError::StreamParseFailed(format!("invalid UTF-8 in SSE data line: {e}"))
            })?;
            self.data_lines.push(data.to_string());
        }

        Ok(())
    }

    fn flush_event(&mut self, frames: &mut Vec<SseFrame>) {
        if self.data_lines.is_empty() {
            return;
        }
        let payload = self.data_lines.join("\n");
        self.data_lines.clear();
        if payload.trim() == DONE_SENTINEL {
            frames.push(SseFrame::Done);
        } else {
            frames.push(SseFrame::Data(payload));
        }
    }
}
